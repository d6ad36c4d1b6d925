//! Read-only portfolio queries.
//!
//! Each tool returns a serializable value; the CLI prints it as JSON. Every
//! user-supplied value is bound as a parameter. Property names match
//! case-insensitively on any part of the name ("gare" finds "Gare 28").
//!
//! `execute_sql` accepts a single `SELECT`/`WITH` statement. The keyword
//! guard rejects anything that could write, and the CLI additionally runs it
//! on a read-only connection.

use anyhow::Result;
use chrono::{Months, NaiveDate};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, FromRow, Row, SqlitePool, TypeInfo, ValueRef};
use thiserror::Error;

use crate::config::Config;
use crate::db;

pub const DEFAULT_MAX_ROWS: usize = 1000;
const SERVITUDE_LIMIT: i64 = 500;

lazy_static! {
    static ref FORBIDDEN: Regex = Regex::new(
        r"(?i)\b(DROP|DELETE|UPDATE|INSERT|ALTER|CREATE|TRUNCATE|GRANT|REVOKE|REPLACE|ATTACH|DETACH|PRAGMA|VACUUM|REINDEX)\b"
    )
    .unwrap();
    static ref LEADING_KEYWORD: Regex = Regex::new(r"(?i)^(SELECT|WITH)\b").unwrap();
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Property '{name}' not found. Available: {}", available.join(", "))]
    UnknownProperty { name: String, available: Vec<String> },
}

#[derive(Debug, Error, PartialEq)]
pub enum SqlGuardError {
    #[error("empty query")]
    Empty,
    #[error("only SELECT or WITH queries are allowed")]
    NotSelect,
    #[error("only a single statement is allowed")]
    MultipleStatements,
    #[error("forbidden keyword: {0}")]
    Forbidden(String),
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Serialize, FromRow)]
pub struct PropertySummary {
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub construction_year: Option<i64>,
    pub units: i64,
    pub documents: i64,
}

pub async fn list_properties(pool: &SqlitePool) -> Result<Vec<PropertySummary>> {
    Ok(sqlx::query_as(
        r#"
        SELECT p.name, p.address, p.city, p.construction_year,
               (SELECT COUNT(*) FROM units u WHERE u.property_id = p.id) AS units,
               (SELECT COUNT(*) FROM documents d WHERE d.property_id = p.id) AS documents
        FROM properties p
        ORDER BY p.name
        "#,
    )
    .fetch_all(pool)
    .await?)
}

#[derive(Debug, Serialize, FromRow)]
pub struct PropertyInfo {
    #[serde(skip)]
    pub id: String,
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub purchase_price: Option<f64>,
    pub mortgage_amount: Option<f64>,
    pub construction_year: Option<i64>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct UnitOccupancy {
    pub unit_number: String,
    pub unit_type: String,
    pub surface_area: Option<f64>,
    pub rooms: Option<f64>,
    pub floor: Option<String>,
    pub lease_count: i64,
    pub active_leases: i64,
}

#[derive(Debug, Serialize)]
pub struct UnitsOverview {
    pub total: usize,
    pub occupied: usize,
    pub vacant: usize,
    /// Percentage, two decimals.
    pub occupation_rate: f64,
    pub details: Vec<UnitOccupancy>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct LeaseLine {
    pub property: String,
    pub unit_number: String,
    pub tenant: Option<String>,
    pub rent_net: f64,
    pub charges: f64,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub status: String,
}

#[derive(Debug, Serialize, FromRow)]
pub struct MaintenanceContract {
    pub property: Option<String>,
    pub contractor: Option<String>,
    pub contract_type: Option<String>,
    pub description: Option<String>,
    pub annual_cost: Option<f64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct MaintenanceOverview {
    pub contracts: usize,
    pub total_annual_cost: f64,
    pub details: Vec<MaintenanceContract>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct ServitudeLine {
    pub property: Option<String>,
    pub servitude_type: String,
    pub description: Option<String>,
    pub beneficiary: Option<String>,
    pub registry_number: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub status: String,
}

#[derive(Debug, Serialize, FromRow)]
pub struct InsuranceLine {
    pub insurer: Option<String>,
    pub policy_number: Option<String>,
    pub coverage_type: Option<String>,
    pub annual_premium: Option<f64>,
    pub end_date: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PropertyDashboard {
    pub property: PropertyInfo,
    pub units: UnitsOverview,
    pub leases: Vec<LeaseLine>,
    pub maintenance: MaintenanceOverview,
    pub servitudes: Vec<ServitudeLine>,
    pub insurance: Vec<InsuranceLine>,
    pub open_disputes: i64,
    pub open_incidents: i64,
}

/// Finds a property by case-insensitive partial name. An exact match wins
/// over partial ones.
pub async fn find_property(pool: &SqlitePool, name: &str) -> Result<PropertyInfo> {
    let found: Option<PropertyInfo> = sqlx::query_as(
        r#"
        SELECT id, name, address, city, purchase_price, mortgage_amount, construction_year
        FROM properties
        WHERE instr(lower(name), lower(?1)) > 0
        ORDER BY lower(name) = lower(?1) DESC, name
        LIMIT 1
        "#,
    )
    .bind(name.trim())
    .fetch_optional(pool)
    .await?;

    match found {
        Some(p) => Ok(p),
        None => {
            let available: Vec<String> =
                sqlx::query_scalar("SELECT name FROM properties ORDER BY name")
                    .fetch_all(pool)
                    .await?;
            Err(QueryError::UnknownProperty {
                name: name.to_string(),
                available,
            }
            .into())
        }
    }
}

/// Lease rows active on `today`: started (or undated) and not yet ended.
const ACTIVE_LEASE: &str =
    "(l.start_date IS NULL OR l.start_date <= ?) AND (l.end_date IS NULL OR l.end_date >= ?)";

pub async fn property_dashboard(
    pool: &SqlitePool,
    name: &str,
    today: NaiveDate,
) -> Result<PropertyDashboard> {
    let property = find_property(pool, name).await?;
    let today_s = today.to_string();

    let details: Vec<UnitOccupancy> = sqlx::query_as(&format!(
        r#"
        SELECT u.unit_number, u.unit_type, u.surface_area, u.rooms, u.floor,
               COUNT(l.id) AS lease_count,
               COALESCE(SUM(CASE WHEN l.id IS NOT NULL AND {} THEN 1 ELSE 0 END), 0) AS active_leases
        FROM units u
        LEFT JOIN leases l ON l.unit_id = u.id
        WHERE u.property_id = ?
        GROUP BY u.id
        ORDER BY u.unit_number
        "#,
        ACTIVE_LEASE
    ))
    .bind(&today_s)
    .bind(&today_s)
    .bind(&property.id)
    .fetch_all(pool)
    .await?;

    let total = details.len();
    let occupied = details.iter().filter(|u| u.active_leases > 0).count();
    let occupation_rate = if total > 0 {
        round2(occupied as f64 / total as f64 * 100.0)
    } else {
        0.0
    };

    let leases: Vec<LeaseLine> = sqlx::query_as(&format!(
        r#"
        SELECT p.name AS property, u.unit_number, t.name AS tenant, l.rent_net, l.charges,
               l.start_date, l.end_date, l.status
        FROM leases l
        JOIN units u ON u.id = l.unit_id
        JOIN properties p ON p.id = u.property_id
        LEFT JOIN tenants t ON t.id = l.tenant_id
        WHERE u.property_id = ? AND {}
        ORDER BY u.unit_number
        "#,
        ACTIVE_LEASE
    ))
    .bind(&property.id)
    .bind(&today_s)
    .bind(&today_s)
    .fetch_all(pool)
    .await?;

    let contracts: Vec<MaintenanceContract> = sqlx::query_as(
        r#"
        SELECT p.name AS property, m.contractor, m.contract_type, m.description, m.annual_cost,
               m.start_date, m.end_date, m.status
        FROM maintenance m
        JOIN properties p ON p.id = m.property_id
        WHERE m.property_id = ?
        ORDER BY m.contractor
        "#,
    )
    .bind(&property.id)
    .fetch_all(pool)
    .await?;

    let servitudes = servitudes_for(pool, Some(&property.id), None, true).await?;

    let insurance: Vec<InsuranceLine> = sqlx::query_as(
        r#"
        SELECT insurer, policy_number, coverage_type, annual_premium, end_date
        FROM insurance_policies
        WHERE property_id = ?
        ORDER BY insurer, policy_number
        "#,
    )
    .bind(&property.id)
    .fetch_all(pool)
    .await?;

    let open_disputes: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM disputes WHERE property_id = ? AND status NOT IN ('resolved', 'closed')",
    )
    .bind(&property.id)
    .fetch_one(pool)
    .await?;
    let open_incidents: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM incidents WHERE property_id = ? AND status NOT IN ('resolved', 'closed')",
    )
    .bind(&property.id)
    .fetch_one(pool)
    .await?;

    Ok(PropertyDashboard {
        property,
        units: UnitsOverview {
            total,
            occupied,
            vacant: total - occupied,
            occupation_rate,
            details,
        },
        leases,
        maintenance: maintenance_overview(contracts),
        servitudes,
        insurance,
        open_disputes,
        open_incidents,
    })
}

#[derive(Debug, Serialize)]
pub struct ExpiringLeases {
    pub months_ahead: u32,
    pub until: NaiveDate,
    pub leases: Vec<LeaseLine>,
}

/// Leases ending between `today` and `today + months` (at least one month).
pub async fn expiring_leases(pool: &SqlitePool, months: u32, today: NaiveDate) -> Result<ExpiringLeases> {
    let months = months.max(1);
    let until = today
        .checked_add_months(Months::new(months))
        .unwrap_or(NaiveDate::MAX);

    let leases: Vec<LeaseLine> = sqlx::query_as(
        r#"
        SELECT p.name AS property, u.unit_number, t.name AS tenant, l.rent_net, l.charges,
               l.start_date, l.end_date, l.status
        FROM leases l
        JOIN units u ON u.id = l.unit_id
        JOIN properties p ON p.id = u.property_id
        LEFT JOIN tenants t ON t.id = l.tenant_id
        WHERE l.end_date IS NOT NULL AND l.end_date >= ? AND l.end_date <= ?
        ORDER BY l.end_date, p.name, u.unit_number
        "#,
    )
    .bind(today.to_string())
    .bind(until.to_string())
    .fetch_all(pool)
    .await?;

    Ok(ExpiringLeases {
        months_ahead: months,
        until,
        leases,
    })
}

#[derive(Debug, Serialize, FromRow)]
pub struct PropertyRevenue {
    pub property: String,
    pub total_units: i64,
    pub occupied_units: i64,
    pub monthly_rent: f64,
    pub monthly_charges: f64,
    pub annual_rent: f64,
}

#[derive(Debug, Serialize)]
pub struct FinancialSummary {
    pub properties_count: usize,
    pub total_units: i64,
    pub occupied_units: i64,
    pub monthly_rent: f64,
    pub monthly_charges: f64,
    pub annual_rent: f64,
    pub by_property: Vec<PropertyRevenue>,
}

/// Rent roll totals from leases active on `today`.
pub async fn financial_summary(pool: &SqlitePool, today: NaiveDate) -> Result<FinancialSummary> {
    let today_s = today.to_string();
    let mut by_property: Vec<PropertyRevenue> = sqlx::query_as(&format!(
        r#"
        SELECT p.name AS property,
               (SELECT COUNT(*) FROM units u WHERE u.property_id = p.id) AS total_units,
               (SELECT COUNT(DISTINCT u.id) FROM units u JOIN leases l ON l.unit_id = u.id
                WHERE u.property_id = p.id AND {active}) AS occupied_units,
               COALESCE((SELECT SUM(l.rent_net) FROM units u JOIN leases l ON l.unit_id = u.id
                WHERE u.property_id = p.id AND {active}), 0.0) AS monthly_rent,
               COALESCE((SELECT SUM(l.charges) FROM units u JOIN leases l ON l.unit_id = u.id
                WHERE u.property_id = p.id AND {active}), 0.0) AS monthly_charges,
               0.0 AS annual_rent
        FROM properties p
        ORDER BY p.name
        "#,
        active = ACTIVE_LEASE
    ))
    .bind(&today_s)
    .bind(&today_s)
    .bind(&today_s)
    .bind(&today_s)
    .bind(&today_s)
    .bind(&today_s)
    .fetch_all(pool)
    .await?;

    for p in &mut by_property {
        p.monthly_rent = round2(p.monthly_rent);
        p.monthly_charges = round2(p.monthly_charges);
        p.annual_rent = round2(p.monthly_rent * 12.0);
    }

    let monthly_rent = round2(by_property.iter().map(|p| p.monthly_rent).sum());
    Ok(FinancialSummary {
        properties_count: by_property.len(),
        total_units: by_property.iter().map(|p| p.total_units).sum(),
        occupied_units: by_property.iter().map(|p| p.occupied_units).sum(),
        monthly_rent,
        monthly_charges: round2(by_property.iter().map(|p| p.monthly_charges).sum()),
        annual_rent: round2(monthly_rent * 12.0),
        by_property,
    })
}

fn maintenance_overview(details: Vec<MaintenanceContract>) -> MaintenanceOverview {
    MaintenanceOverview {
        contracts: details.len(),
        total_annual_cost: round2(details.iter().filter_map(|c| c.annual_cost).sum()),
        details,
    }
}

pub async fn maintenance_summary(pool: &SqlitePool) -> Result<MaintenanceOverview> {
    let contracts: Vec<MaintenanceContract> = sqlx::query_as(
        r#"
        SELECT p.name AS property, m.contractor, m.contract_type, m.description, m.annual_cost,
               m.start_date, m.end_date, m.status
        FROM maintenance m
        LEFT JOIN properties p ON p.id = m.property_id
        ORDER BY p.name, m.contractor
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(maintenance_overview(contracts))
}

async fn servitudes_for(
    pool: &SqlitePool,
    property_id: Option<&str>,
    servitude_type: Option<&str>,
    active_only: bool,
) -> Result<Vec<ServitudeLine>> {
    Ok(sqlx::query_as(
        r#"
        SELECT p.name AS property, s.servitude_type, s.description, s.beneficiary,
               s.registry_number, s.start_date, s.end_date, s.status
        FROM servitudes s
        LEFT JOIN properties p ON p.id = s.property_id
        WHERE (?1 IS NULL OR s.property_id = ?1)
          AND (?2 IS NULL OR instr(lower(s.servitude_type), lower(?2)) > 0)
          AND (?3 = 0 OR s.status = 'active')
        ORDER BY p.name, s.servitude_type, s.registry_number
        LIMIT ?4
        "#,
    )
    .bind(property_id)
    .bind(servitude_type)
    .bind(active_only)
    .bind(SERVITUDE_LIMIT)
    .fetch_all(pool)
    .await?)
}

/// Servitudes filtered by property (partial name) and type (substring),
/// capped at 500 rows.
pub async fn search_servitudes(
    pool: &SqlitePool,
    property: Option<&str>,
    servitude_type: Option<&str>,
    active_only: bool,
) -> Result<Vec<ServitudeLine>> {
    let property_id = match property {
        Some(name) => Some(find_property(pool, name).await?.id),
        None => None,
    };
    servitudes_for(pool, property_id.as_deref(), servitude_type, active_only).await
}

#[derive(Debug, Serialize)]
pub struct PropertyComparison {
    pub first: PropertyDashboard,
    pub second: PropertyDashboard,
}

pub async fn compare_properties(
    pool: &SqlitePool,
    first: &str,
    second: &str,
    today: NaiveDate,
) -> Result<PropertyComparison> {
    Ok(PropertyComparison {
        first: property_dashboard(pool, first, today).await?,
        second: property_dashboard(pool, second, today).await?,
    })
}

/// Validates an ad-hoc query and returns it without trailing semicolons.
pub fn check_read_only(query: &str) -> Result<&str, SqlGuardError> {
    let q = query.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    if q.is_empty() {
        return Err(SqlGuardError::Empty);
    }
    if !LEADING_KEYWORD.is_match(q) {
        return Err(SqlGuardError::NotSelect);
    }
    if q.contains(';') {
        return Err(SqlGuardError::MultipleStatements);
    }
    if let Some(m) = FORBIDDEN.find(q) {
        return Err(SqlGuardError::Forbidden(m.as_str().to_uppercase()));
    }
    Ok(q)
}

#[derive(Debug, Serialize)]
pub struct SqlResult {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    pub row_count: usize,
    pub truncated: bool,
}

fn cell_to_json(row: &SqliteRow, idx: usize) -> Result<serde_json::Value> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(serde_json::Value::Null);
    }
    let value = match raw.type_info().name() {
        "INTEGER" => serde_json::json!(row.try_get::<i64, _>(idx)?),
        "REAL" => serde_json::json!(row.try_get::<f64, _>(idx)?),
        "BLOB" => serde_json::json!(format!("<{} bytes>", row.try_get::<Vec<u8>, _>(idx)?.len())),
        _ => serde_json::json!(row.try_get::<String, _>(idx)?),
    };
    Ok(value)
}

/// Runs a guarded read-only query, returning at most `max_rows` rows.
pub async fn execute_sql(pool: &SqlitePool, query: &str, max_rows: usize) -> Result<SqlResult> {
    let q = check_read_only(query)?;
    let limit = max_rows.saturating_add(1).min(i64::MAX as usize);
    // newline so a trailing `--` comment cannot swallow the closing paren
    let wrapped = format!("SELECT * FROM ({}\n) LIMIT {}", q, limit);
    let rows = sqlx::query(&wrapped).fetch_all(pool).await?;

    let truncated = rows.len() > max_rows;
    let columns: Vec<String> = rows
        .first()
        .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let mut out = Vec::with_capacity(rows.len().min(max_rows));
    for row in rows.iter().take(max_rows) {
        let mut obj = serde_json::Map::new();
        for (idx, col) in row.columns().iter().enumerate() {
            obj.insert(col.name().to_string(), cell_to_json(row, idx)?);
        }
        out.push(obj);
    }

    Ok(SqlResult {
        columns,
        row_count: out.len(),
        rows: out,
        truncated,
    })
}

/// One CLI-facing tool invocation.
#[derive(Debug, Clone)]
pub enum Tool {
    ListProperties,
    Dashboard { name: String },
    Compare { first: String, second: String },
    ExpiringLeases { months: u32 },
    Finance,
    Maintenance,
    Servitudes {
        property: Option<String>,
        servitude_type: Option<String>,
        include_inactive: bool,
    },
    Sql { query: String, max_rows: usize },
}

/// Runs a tool on a read-only connection and prints its JSON result.
pub async fn run_tool(config: &Config, tool: Tool) -> Result<()> {
    let pool = db::connect_read_only(config).await?;
    let today = chrono::Local::now().date_naive();

    let value = match tool {
        Tool::ListProperties => serde_json::to_value(list_properties(&pool).await?)?,
        Tool::Dashboard { name } => {
            serde_json::to_value(property_dashboard(&pool, &name, today).await?)?
        }
        Tool::Compare { first, second } => {
            serde_json::to_value(compare_properties(&pool, &first, &second, today).await?)?
        }
        Tool::ExpiringLeases { months } => {
            serde_json::to_value(expiring_leases(&pool, months, today).await?)?
        }
        Tool::Finance => serde_json::to_value(financial_summary(&pool, today).await?)?,
        Tool::Maintenance => serde_json::to_value(maintenance_summary(&pool).await?)?,
        Tool::Servitudes {
            property,
            servitude_type,
            include_inactive,
        } => serde_json::to_value(
            search_servitudes(
                &pool,
                property.as_deref(),
                servitude_type.as_deref(),
                !include_inactive,
            )
            .await?,
        )?,
        Tool::Sql { query, max_rows } => {
            serde_json::to_value(execute_sql(&pool, &query, max_rows).await?)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&value)?);
    pool.close().await;
    Ok(())
}
