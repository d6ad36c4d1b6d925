//! Rent-roll (état locatif / Mieterspiegel) import from `.xlsx` exports.
//!
//! Property-management exports put a few lines of letterhead above the
//! table, so the header is searched for in the first 20 rows: the first row
//! naming both a tenant column and a unit column wins. Columns are mapped by
//! French or German keywords.

use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDate};
use lazy_static::lazy_static;
use regex::Regex;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

use crate::classify;
use crate::config::Config;
use crate::db;
use crate::extract;
use crate::migrate;
use crate::models::{Lease, LeaseStatus, Tenant, Unit};
use crate::validate;

const HEADER_SEARCH_ROWS: usize = 20;

/// Cell values that are report furniture rather than tenant names.
const METADATA_KEYWORDS: &[&str] = &[
    "ansprechpartner",
    "stichtag",
    "eigentümer",
    "gesamttotal",
    "total",
    "sous-total",
    "objekt",
    "mieter",
    "liegenschaft",
    "hauptmieter",
    "leerstand",
    "vacant",
    "locataire",
    "objet",
];

lazy_static! {
    static ref DATE_LIKE: Regex =
        Regex::new(r"\d{4}-\d{2}-\d{2}|\b\d{1,2}[./]\d{1,2}[./]\d{4}\b").unwrap();
}

#[derive(Debug, Error, PartialEq)]
pub enum RentRollError {
    #[error("no header row (tenant and unit columns) in the first {0} rows")]
    NoHeader(usize),
    #[error("header row {row} has no {column} column")]
    MissingColumn { row: usize, column: &'static str },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnMap {
    pub unit: usize,
    pub tenant: usize,
    pub rooms: Option<usize>,
    pub area: Option<usize>,
    pub rent: Option<usize>,
    pub charges: Option<usize>,
    pub start: Option<usize>,
    pub end: Option<usize>,
    pub floor: Option<usize>,
    pub email: Option<usize>,
    pub phone: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RentRollRow {
    /// Spreadsheet row number (1-based).
    pub line: usize,
    pub unit_number: String,
    pub tenant_name: String,
    pub rooms: Option<f64>,
    pub surface_area: Option<f64>,
    pub rent_net: f64,
    pub charges: f64,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub floor: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRow {
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct RentRoll {
    /// Spreadsheet row number of the header (1-based).
    pub header_line: usize,
    pub columns: ColumnMap,
    pub rows: Vec<RentRollRow>,
    pub rejected: Vec<RejectedRow>,
}

fn is_header(row: &[String]) -> bool {
    let joined = row.join(" ").to_lowercase();
    (joined.contains("mieter") || joined.contains("locataire"))
        && (joined.contains("objekt") || joined.contains("objet"))
}

/// Maps header cells to fields. The first column matching a field keeps it;
/// the tenant keywords are tried last because "nom" also appears in
/// "nombre de pièces".
pub fn map_columns(header: &[String], line: usize) -> Result<ColumnMap, RentRollError> {
    let mut unit = None;
    let mut tenant = None;
    let mut map = ColumnMap::default();

    fn set(slot: &mut Option<usize>, idx: usize) {
        if slot.is_none() {
            *slot = Some(idx);
        }
    }

    for (idx, raw) in header.iter().enumerate() {
        let col = raw.trim().to_lowercase();
        let has = |keys: &[&str]| keys.iter().any(|k| col.contains(k));
        if col.is_empty() {
            continue;
        }
        if has(&["objekt", "objet"]) {
            set(&mut unit, idx);
        } else if has(&["zimmer", "pièces", "pieces"]) {
            set(&mut map.rooms, idx);
        } else if has(&["fläche", "flache", "surface"]) {
            set(&mut map.area, idx);
        } else if has(&["nettomiete", "loyer net", "miete netto"]) {
            set(&mut map.rent, idx);
        } else if has(&["akonto", "charges", "nebenkosten"]) {
            set(&mut map.charges, idx);
        } else if has(&["mietbeginn", "début", "debut", "beginn"]) {
            set(&mut map.start, idx);
        } else if has(&["mietende", "fin", "ende"]) {
            set(&mut map.end, idx);
        } else if has(&["stockwerk", "étage", "etage", "geschoss"]) {
            set(&mut map.floor, idx);
        } else if has(&["e-mail", "email", "courriel"]) {
            set(&mut map.email, idx);
        } else if has(&["telefon", "téléphone", "telephone", "tél", "tel."]) {
            set(&mut map.phone, idx);
        } else if has(&["mieter", "locataire", "nom"]) {
            set(&mut tenant, idx);
        }
    }

    map.unit = unit.ok_or(RentRollError::MissingColumn {
        row: line,
        column: "unit",
    })?;
    map.tenant = tenant.ok_or(RentRollError::MissingColumn {
        row: line,
        column: "tenant",
    })?;
    Ok(map)
}

pub(crate) fn cell(row: &[String], idx: Option<usize>) -> Option<&str> {
    let v = row.get(idx?)?.trim();
    if v.is_empty() || v.eq_ignore_ascii_case("nan") {
        None
    } else {
        Some(v)
    }
}

/// Swiss money notation: `1'500.00`, `CHF 1’500.-`, `1500,50`.
pub fn parse_money(s: &str) -> Option<f64> {
    let cleaned: String = s
        .replace("CHF", "")
        .replace("Fr.", "")
        .chars()
        .filter(|c| !matches!(c, '\'' | '’' | ' ' | '\u{a0}'))
        .collect();
    let cleaned = cleaned.trim_end_matches(".-").trim_end_matches('-');
    let normalized = if cleaned.contains(',') && !cleaned.contains('.') {
        cleaned.replace(',', ".")
    } else {
        cleaned.replace(',', "")
    };
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Dates as text (`01.04.2023`, `2023-04-01`, `01/04/2023`, `2023.04.01`,
/// optionally followed by a time) or as an Excel serial day number.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    let date_part = s.split(|c| c == ' ' || c == 'T').next().unwrap_or(s);
    for fmt in ["%d.%m.%Y", "%Y-%m-%d", "%d/%m/%Y", "%Y.%m.%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(date_part, fmt) {
            return Some(d);
        }
    }
    excel_serial(s)
}

fn excel_serial(s: &str) -> Option<NaiveDate> {
    let serial: f64 = s.parse().ok()?;
    // 1 = 1900-01-01 .. 2958465 = 9999-12-31; anything smaller than 1950 is
    // more likely a plain number than a lease date
    if !(18264.0..=2958465.0).contains(&serial) {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    epoch.checked_add_signed(Duration::days(serial.trunc() as i64))
}

pub fn is_date_like(s: &str) -> bool {
    DATE_LIKE.is_match(s)
}

fn parse_number(s: &str) -> Option<f64> {
    s.replace(',', ".").parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Integral spreadsheet numbers come back as `2.0` for some exporters.
fn clean_label(s: &str) -> String {
    s.strip_suffix(".0").unwrap_or(s).to_string()
}

/// Reason a tenant cell cannot be a tenant, if any.
fn tenant_rejection(name: Option<&str>) -> Option<&'static str> {
    match name {
        None => Some("empty tenant"),
        Some(n) if is_date_like(n) => Some("date-like tenant name"),
        Some(n) if METADATA_KEYWORDS.contains(&n.to_lowercase().as_str()) => {
            Some("metadata row")
        }
        _ => None,
    }
}

pub fn parse_rent_roll(rows: &[Vec<String>]) -> Result<RentRoll, RentRollError> {
    let header_idx = rows
        .iter()
        .take(HEADER_SEARCH_ROWS)
        .position(|r| is_header(r))
        .ok_or(RentRollError::NoHeader(HEADER_SEARCH_ROWS))?;
    let header_line = header_idx + 1;
    let columns = map_columns(&rows[header_idx], header_line)?;

    let mut parsed = Vec::new();
    let mut rejected = Vec::new();

    for (offset, row) in rows[header_idx + 1..].iter().enumerate() {
        let line = header_line + offset + 1;
        if (0..row.len()).all(|i| cell(row, Some(i)).is_none()) {
            continue;
        }

        let unit = cell(row, Some(columns.unit));
        let tenant = cell(row, Some(columns.tenant));

        let Some(unit) = unit else {
            rejected.push(RejectedRow {
                line,
                reason: "empty unit".to_string(),
            });
            continue;
        };
        if let Some(reason) = tenant_rejection(tenant) {
            rejected.push(RejectedRow {
                line,
                reason: reason.to_string(),
            });
            continue;
        }
        let tenant = tenant.unwrap_or_default();

        parsed.push(RentRollRow {
            line,
            unit_number: clean_label(unit),
            tenant_name: tenant.split_whitespace().collect::<Vec<_>>().join(" "),
            rooms: cell(row, columns.rooms).and_then(parse_number),
            surface_area: cell(row, columns.area).and_then(parse_number),
            rent_net: cell(row, columns.rent).and_then(parse_money).unwrap_or(0.0),
            charges: cell(row, columns.charges).and_then(parse_money).unwrap_or(0.0),
            start_date: cell(row, columns.start).and_then(parse_date),
            end_date: cell(row, columns.end).and_then(parse_date),
            floor: cell(row, columns.floor).map(clean_label),
            email: cell(row, columns.email).map(str::to_string),
            phone: cell(row, columns.phone).map(str::to_string),
        });
    }

    Ok(RentRoll {
        header_line,
        columns,
        rows: parsed,
        rejected,
    })
}

/// Model values for one row, used for validation before anything is
/// written.
fn to_models(row: &RentRollRow, today: NaiveDate) -> (Tenant, Unit, Lease) {
    let tenant = Tenant {
        id: String::new(),
        name: row.tenant_name.clone(),
        email: row.email.clone(),
        phone: row.phone.clone(),
    };
    let unit = Unit {
        id: String::new(),
        property_id: String::new(),
        unit_number: row.unit_number.clone(),
        unit_type: classify::classify_unit(
            &row.unit_number,
            Some(&row.tenant_name),
            row.surface_area,
            row.rooms,
        ),
        surface_area: row.surface_area,
        rooms: row.rooms,
        floor: row.floor.clone(),
    };
    let lease = Lease {
        id: String::new(),
        unit_id: String::new(),
        tenant_id: String::new(),
        rent_net: row.rent_net,
        charges: row.charges,
        start_date: row.start_date,
        end_date: row.end_date,
        status: LeaseStatus::from_dates(row.start_date, row.end_date, today),
    };
    (tenant, unit, lease)
}

#[derive(Debug, Default, PartialEq)]
pub struct UpsertCounts {
    pub created: u64,
    pub updated: u64,
}

#[derive(Debug, Default)]
pub struct ImportReport {
    pub units: UpsertCounts,
    pub tenants: UpsertCounts,
    pub leases: UpsertCounts,
    pub invalid: Vec<RejectedRow>,
    /// Rows without rent: unit and tenant are kept, the lease is not.
    pub without_lease: Vec<RejectedRow>,
}

pub async fn run_import(config: &Config, file: &Path, property: &str, dry_run: bool) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let rows = extract::read_xlsx_rows(&bytes)
        .with_context(|| format!("Failed to read spreadsheet {}", file.display()))?;
    let roll = parse_rent_roll(&rows)?;

    let pool = db::connect(config).await?;
    migrate::seed_properties(&pool, &config.properties).await?;
    let Some(property_id) = migrate::property_id_by_name(&pool, property).await? else {
        let names: Vec<&str> = config.properties.iter().map(|p| p.name.as_str()).collect();
        pool.close().await;
        bail!(
            "Unknown property '{}'. Configured properties: {}",
            property,
            names.join(", ")
        );
    };

    let today = chrono::Local::now().date_naive();
    let report = if dry_run {
        let invalid = validate_rows(&roll, today);
        let without_lease = roll
            .rows
            .iter()
            .filter(|r| !invalid.iter().any(|i| i.line == r.line))
            .filter_map(lease_skip)
            .collect();
        ImportReport {
            invalid,
            without_lease,
            ..ImportReport::default()
        }
    } else {
        import_rent_roll(&pool, &property_id, &roll, today).await?
    };

    println!(
        "import {} -> {}{}",
        file.display(),
        property,
        if dry_run { " (dry-run)" } else { "" }
    );
    println!("  header row: {}", roll.header_line);
    println!("  rows parsed: {}", roll.rows.len());
    println!("  rows rejected: {}", roll.rejected.len() + report.invalid.len());
    for r in roll.rejected.iter().chain(report.invalid.iter()) {
        println!("    row {}: {}", r.line, r.reason);
    }
    println!("  leases skipped: {}", report.without_lease.len());
    for r in &report.without_lease {
        println!("    row {}: {}", r.line, r.reason);
    }
    if !dry_run {
        let line = |label: &str, c: &UpsertCounts| {
            println!("  {}: {} new, {} updated", label, c.created, c.updated)
        };
        line("units", &report.units);
        line("tenants", &report.tenants);
        line("leases", &report.leases);
    }

    pool.close().await;
    Ok(())
}

fn validation_failure(row: &RentRollRow, today: NaiveDate) -> Option<RejectedRow> {
    let (tenant, unit, lease) = to_models(row, today);
    let mut errors = Vec::new();
    for result in [
        validate::validate_tenant(&tenant),
        validate::validate_unit(&unit),
        validate::validate_lease(&lease),
    ] {
        if let Err(e) = result {
            errors.extend(e);
        }
    }
    (!errors.is_empty()).then(|| RejectedRow {
        line: row.line,
        reason: errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; "),
    })
}

fn lease_skip(row: &RentRollRow) -> Option<RejectedRow> {
    (row.rent_net <= 0.0).then(|| RejectedRow {
        line: row.line,
        reason: "no rent, lease skipped".to_string(),
    })
}

fn validate_rows(roll: &RentRoll, today: NaiveDate) -> Vec<RejectedRow> {
    roll.rows
        .iter()
        .filter_map(|r| validation_failure(r, today))
        .collect()
}

/// Upserts every valid row in one transaction. Re-importing the same file
/// creates nothing new.
pub async fn import_rent_roll(
    pool: &SqlitePool,
    property_id: &str,
    roll: &RentRoll,
    today: NaiveDate,
) -> Result<ImportReport> {
    let mut report = ImportReport::default();
    let mut tx = pool.begin().await?;

    for row in &roll.rows {
        if let Some(rejected) = validation_failure(row, today) {
            report.invalid.push(rejected);
            continue;
        }
        let (tenant, unit, lease) = to_models(row, today);
        let tenant_id = upsert_tenant(&mut tx, &tenant, &mut report.tenants).await?;
        let unit_id = upsert_unit(&mut tx, property_id, &unit, &mut report.units).await?;

        if let Some(skipped) = lease_skip(row) {
            tracing::warn!(line = row.line, unit = %row.unit_number, "no rent, lease skipped");
            report.without_lease.push(skipped);
            continue;
        }
        upsert_lease(&mut tx, &unit_id, &tenant_id, &lease, &mut report.leases).await?;
    }

    tx.commit().await?;
    Ok(report)
}

async fn upsert_tenant(
    tx: &mut Transaction<'_, Sqlite>,
    tenant: &Tenant,
    counts: &mut UpsertCounts,
) -> Result<String> {
    let now = chrono::Utc::now().timestamp();
    let existing: Option<String> = sqlx::query_scalar("SELECT id FROM tenants WHERE name = ?")
        .bind(&tenant.name)
        .fetch_optional(&mut **tx)
        .await?;

    if let Some(id) = existing {
        sqlx::query(
            "UPDATE tenants SET email = COALESCE(?, email), phone = COALESCE(?, phone), updated_at = ? WHERE id = ?",
        )
        .bind(&tenant.email)
        .bind(&tenant.phone)
        .bind(now)
        .bind(&id)
        .execute(&mut **tx)
        .await?;
        counts.updated += 1;
        return Ok(id);
    }

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO tenants (id, name, email, phone, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&tenant.name)
    .bind(&tenant.email)
    .bind(&tenant.phone)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    counts.created += 1;
    Ok(id)
}

/// Existing units keep their type; `estate classify-units` recomputes it.
async fn upsert_unit(
    tx: &mut Transaction<'_, Sqlite>,
    property_id: &str,
    unit: &Unit,
    counts: &mut UpsertCounts,
) -> Result<String> {
    let now = chrono::Utc::now().timestamp();
    let existing: Option<String> =
        sqlx::query_scalar("SELECT id FROM units WHERE property_id = ? AND unit_number = ?")
            .bind(property_id)
            .bind(&unit.unit_number)
            .fetch_optional(&mut **tx)
            .await?;

    if let Some(id) = existing {
        sqlx::query(
            r#"
            UPDATE units SET
                surface_area = COALESCE(?, surface_area),
                rooms = COALESCE(?, rooms),
                floor = COALESCE(?, floor),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(unit.surface_area)
        .bind(unit.rooms)
        .bind(&unit.floor)
        .bind(now)
        .bind(&id)
        .execute(&mut **tx)
        .await?;
        counts.updated += 1;
        return Ok(id);
    }

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO units (id, property_id, unit_number, unit_type, surface_area, rooms, floor, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(property_id)
    .bind(&unit.unit_number)
    .bind(unit.unit_type.as_str())
    .bind(unit.surface_area)
    .bind(unit.rooms)
    .bind(&unit.floor)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    counts.created += 1;
    Ok(id)
}

async fn upsert_lease(
    tx: &mut Transaction<'_, Sqlite>,
    unit_id: &str,
    tenant_id: &str,
    lease: &Lease,
    counts: &mut UpsertCounts,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let start = lease.start_date.map(|d| d.to_string());
    let end = lease.end_date.map(|d| d.to_string());

    let existing: Option<String> = sqlx::query_scalar(
        "SELECT id FROM leases WHERE unit_id = ? AND tenant_id = ? AND start_date IS ?",
    )
    .bind(unit_id)
    .bind(tenant_id)
    .bind(&start)
    .fetch_optional(&mut **tx)
    .await?;

    if let Some(id) = existing {
        sqlx::query(
            "UPDATE leases SET rent_net = ?, charges = ?, end_date = ?, status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(lease.rent_net)
        .bind(lease.charges)
        .bind(&end)
        .bind(lease.status.as_str())
        .bind(now)
        .bind(&id)
        .execute(&mut **tx)
        .await?;
        counts.updated += 1;
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO leases (id, unit_id, tenant_id, rent_net, charges, start_date, end_date, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(unit_id)
    .bind(tenant_id)
    .bind(lease.rent_net)
    .bind(lease.charges)
    .bind(&start)
    .bind(&end)
    .bind(lease.status.as_str())
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    counts.created += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::tests::{memory_pool, property};

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn sheet() -> Vec<Vec<String>> {
        vec![
            row(&["Régie du Rhône SA"]),
            row(&["Etat locatif au 31.12.2024"]),
            row(&[]),
            row(&[
                "Objet", "Locataire", "Nombre de pièces", "Surface m2", "Loyer net", "Charges",
                "Début", "Fin", "Etage", "E-mail", "Téléphone",
            ]),
            row(&[
                "3.2", "Marie  Dupont", "3.5", "82", "1'500.00", "CHF 180", "01.04.2023", "", "3",
                "marie.dupont@bluewin.ch", "079 123 45 67",
            ]),
            row(&["Parking 12", "Marie Dupont", "", "", "120", "", "45017", "", "", "", ""]),
            row(&["nan", "Jean Rey", "2", "", "900", "", "", "", "", "", ""]),
            row(&["4.1", "2023-01-01", "", "", "", "", "", "", "", "", ""]),
            row(&["", "", "", "", "", "", "", "", "", "", ""]),
            row(&["Total", "Total", "", "", "1620", "", "", "", "", "", ""]),
            row(&["5.1", "Boulangerie Martin SA", "", "150", "2400", "200", "2020-01-01", "2021-12-31", "0", "not-an-email", ""]),
        ]
    }

    #[test]
    fn money_and_dates() {
        assert_eq!(parse_money("1'500.00"), Some(1500.0));
        assert_eq!(parse_money("CHF 1’250.-"), Some(1250.0));
        assert_eq!(parse_money("980,50"), Some(980.5));
        assert_eq!(parse_money("n/a"), None);

        let april = NaiveDate::from_ymd_opt(2023, 4, 1);
        assert_eq!(parse_date("01.04.2023"), april);
        assert_eq!(parse_date("2023-04-01 00:00:00"), april);
        assert_eq!(parse_date("01/04/2023"), april);
        assert_eq!(parse_date("2023.04.01"), april);
        assert_eq!(parse_date("45017"), april);
        assert_eq!(parse_date("3.5"), None);
    }

    #[test]
    fn finds_header_and_maps_columns() {
        let roll = parse_rent_roll(&sheet()).unwrap();
        assert_eq!(roll.header_line, 4);
        assert_eq!(roll.columns.unit, 0);
        assert_eq!(roll.columns.tenant, 1);
        assert_eq!(roll.columns.rooms, Some(2));
        assert_eq!(roll.columns.rent, Some(4));
        assert_eq!(roll.columns.end, Some(7));
        assert_eq!(roll.columns.phone, Some(10));
    }

    #[test]
    fn rows_are_cleaned_and_rejected_with_reasons() {
        let roll = parse_rent_roll(&sheet()).unwrap();
        assert_eq!(roll.rows.len(), 3);

        let first = &roll.rows[0];
        assert_eq!(first.line, 5);
        assert_eq!(first.tenant_name, "Marie Dupont");
        assert_eq!(first.rooms, Some(3.5));
        assert_eq!(first.rent_net, 1500.0);
        assert_eq!(first.charges, 180.0);
        assert_eq!(first.start_date, NaiveDate::from_ymd_opt(2023, 4, 1));
        assert_eq!(first.end_date, None);

        let reasons: Vec<(usize, &str)> = roll
            .rejected
            .iter()
            .map(|r| (r.line, r.reason.as_str()))
            .collect();
        assert_eq!(
            reasons,
            vec![
                (7, "empty unit"),
                (8, "date-like tenant name"),
                (10, "metadata row")
            ]
        );
    }

    #[test]
    fn missing_header_is_an_error() {
        let rows = vec![row(&["Liste des contrats"]), row(&["a", "b"])];
        assert_eq!(
            parse_rent_roll(&rows).unwrap_err(),
            RentRollError::NoHeader(20)
        );
        let rows = vec![row(&["Objekt", "Nettomiete", "Mieter ab"])];
        assert!(parse_rent_roll(&rows).is_ok());
        let rows = vec![row(&["Objekt Mieter", "Nettomiete"])];
        assert!(matches!(
            parse_rent_roll(&rows),
            Err(RentRollError::MissingColumn { column: "tenant", .. })
        ));
    }

    #[tokio::test]
    async fn import_is_idempotent() {
        let pool = memory_pool().await;
        migrate::seed_properties(&pool, &[property("Gare 28")]).await.unwrap();
        let property_id = migrate::property_id_by_name(&pool, "Gare 28")
            .await
            .unwrap()
            .unwrap();
        let roll = parse_rent_roll(&sheet()).unwrap();
        let today = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();

        let first = import_rent_roll(&pool, &property_id, &roll, today).await.unwrap();
        assert_eq!(first.units.created, 2);
        assert_eq!(first.tenants.created, 1);
        assert_eq!(first.tenants.updated, 1);
        assert_eq!(first.leases.created, 2);
        assert_eq!(first.invalid.len(), 1);
        assert!(first.invalid[0].reason.contains("email"));

        let second = import_rent_roll(&pool, &property_id, &roll, today).await.unwrap();
        assert_eq!(second.units.created, 0);
        assert_eq!(second.leases.created, 0);
        assert_eq!(second.leases.updated, 2);

        let leases: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM leases")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(leases, 2);

        let (unit_type, status): (String, String) = sqlx::query_as(
            "SELECT u.unit_type, l.status FROM units u JOIN leases l ON l.unit_id = u.id WHERE u.unit_number = 'Parking 12'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(unit_type, "parking");
        assert_eq!(status, "active");
    }

    #[tokio::test]
    async fn rows_without_rent_keep_unit_and_tenant_but_no_lease() {
        let pool = memory_pool().await;
        migrate::seed_properties(&pool, &[property("Gare 28")]).await.unwrap();
        let property_id = migrate::property_id_by_name(&pool, "Gare 28")
            .await
            .unwrap()
            .unwrap();
        let rows = vec![
            row(&["Objet", "Locataire", "Loyer net"]),
            row(&["3.2", "Marie Dupont", "0"]),
            row(&["3.3", "Jean Rey", ""]),
            row(&["3.4", "Anne Favre", "1200"]),
        ];
        let roll = parse_rent_roll(&rows).unwrap();
        let today = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();

        let report = import_rent_roll(&pool, &property_id, &roll, today).await.unwrap();
        assert_eq!(report.units.created, 3);
        assert_eq!(report.tenants.created, 3);
        assert_eq!(report.leases.created, 1);
        let skipped: Vec<usize> = report.without_lease.iter().map(|r| r.line).collect();
        assert_eq!(skipped, vec![2, 3]);

        let occupied: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT unit_id) FROM leases WHERE status = 'active'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(occupied, 1);
    }
}
