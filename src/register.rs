//! Import of the registers kept next to the rent roll: maintenance
//! contracts, insurance policies, land-registry servitudes, disputes
//! (litiges) and incidents (sinistres).
//!
//! Each register is an `.xlsx` sheet whose header sits somewhere in the
//! first 20 rows. Header cells are mapped to fields by French or German
//! keywords, with one keyword table per register kind. Rows belong to the
//! property given with `--property`, or else to the property named in their
//! own property column.
//!
//! Record ids are UUID v5 over the row's identifying fields (property,
//! label, reference, start date, unit, tenant), so importing the same sheet
//! twice updates the existing records.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;
use crate::rentroll::{self, RejectedRow, UpsertCounts};
use crate::validate;
use crate::{db, extract, migrate};

const HEADER_SEARCH_ROWS: usize = 20;

/// Label cells that close a section rather than describe a record.
const SUMMARY_LABELS: &[&str] = &["total", "sous-total", "totaux", "gesamttotal", "summe"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    Maintenance,
    Insurance,
    Servitudes,
    Disputes,
    Incidents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Field {
    Property,
    Unit,
    Tenant,
    Reference,
    Status,
    End,
    Start,
    Amount,
    Description,
    Party,
    Kind,
    Label,
}

/// Keyword lookup order. "Date de fin" must reach `End` before `Start`
/// sees "date", and "Date du sinistre" must reach `Start` before `Label`
/// sees "sinistre".
const FIELD_ORDER: [Field; 12] = [
    Field::Property,
    Field::Unit,
    Field::Tenant,
    Field::Reference,
    Field::Status,
    Field::End,
    Field::Start,
    Field::Amount,
    Field::Description,
    Field::Party,
    Field::Kind,
    Field::Label,
];

impl RegisterKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "maintenance" | "entretien" => Ok(Self::Maintenance),
            "insurance" | "assurance" | "assurances" => Ok(Self::Insurance),
            "servitudes" | "servitude" => Ok(Self::Servitudes),
            "disputes" | "dispute" | "litiges" => Ok(Self::Disputes),
            "incidents" | "incident" | "sinistres" => Ok(Self::Incidents),
            other => bail!(
                "unknown register '{}': expected maintenance, insurance, servitudes, disputes or incidents",
                other
            ),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Maintenance => "maintenance",
            Self::Insurance => "insurance",
            Self::Servitudes => "servitudes",
            Self::Disputes => "disputes",
            Self::Incidents => "incidents",
        }
    }

    /// The field every record must carry.
    fn label_name(&self) -> &'static str {
        match self {
            Self::Maintenance => "contractor",
            Self::Insurance => "insurer",
            Self::Servitudes => "servitude type",
            Self::Disputes => "subject",
            Self::Incidents => "incident type",
        }
    }

    fn amount_name(&self) -> &'static str {
        match self {
            Self::Maintenance => "annual_cost",
            Self::Insurance => "annual_premium",
            Self::Servitudes | Self::Disputes => "amount",
            Self::Incidents => "cost",
        }
    }

    fn statuses(&self) -> Option<&'static [&'static str]> {
        match self {
            Self::Maintenance => Some(validate::MAINTENANCE_STATUSES),
            Self::Insurance => None,
            Self::Servitudes => Some(validate::SERVITUDE_STATUSES),
            Self::Disputes => Some(validate::DISPUTE_STATUSES),
            Self::Incidents => Some(validate::INCIDENT_STATUSES),
        }
    }

    fn keywords(&self, field: Field) -> &'static [&'static str] {
        use Field::*;
        use RegisterKind::*;
        match (self, field) {
            (_, Property) => &[
                "immeuble",
                "propriété",
                "propriete",
                "adresse",
                "liegenschaft",
                "bâtiment",
                "batiment",
            ],
            (Maintenance | Servitudes | Disputes | Incidents, Unit) => {
                &["unité", "unite", "appartement", "wohnung", "lot"]
            }
            (Disputes, Tenant) => &["locataire", "mieter", "partie adverse"],
            (Insurance, Reference) => &[
                "n° police",
                "n° de police",
                "no police",
                "numéro de police",
                "numero de police",
                "policennummer",
            ],
            (Servitudes, Reference) => &["n° rf", "no rf", "numéro", "numero", "n°", "registre"],
            (Maintenance | Servitudes | Disputes | Incidents, Status) => {
                &["statut", "état", "etat", "status"]
            }
            (Maintenance | Insurance, End) => &["fin", "échéance", "echeance", "ende", "ablauf"],
            (Servitudes, End) => &["radiation", "fin", "échéance", "echeance"],
            (Disputes, End) => &["clôture", "cloture", "fin"],
            (Maintenance | Insurance, Start) => &["début", "debut", "beginn"],
            (Servitudes, Start) => &["inscription", "début", "debut", "date"],
            (Disputes, Start) => &["ouverture", "date"],
            (Incidents, Start) => &["date", "survenu"],
            (Maintenance, Amount) => &["coût", "cout", "montant", "kosten", "prix"],
            (Insurance, Amount) => &["prime", "prämie", "praemie"],
            (Disputes, Amount) => &["montant", "prétention", "pretention", "betrag", "coût", "cout"],
            (Incidents, Amount) => &["coût", "cout", "montant", "kosten"],
            (Maintenance | Servitudes | Incidents, Description) => &[
                "description",
                "prestation",
                "commentaire",
                "remarque",
                "contenu",
                "libellé",
            ],
            (Servitudes, Party) => &["bénéficiaire", "beneficiaire", "berechtigt", "fonds dominant"],
            (Maintenance, Kind) => &["type", "catégorie", "categorie"],
            (Insurance, Kind) => &["couverture", "branche", "type", "deckung"],
            (Maintenance, Label) => &[
                "entreprise",
                "fournisseur",
                "prestataire",
                "firma",
                "société",
                "societe",
            ],
            (Insurance, Label) => &["assureur", "compagnie", "versicherer", "assurance"],
            (Servitudes, Label) => &["servitude", "dienstbarkeit", "genre", "type"],
            (Disputes, Label) => &["motif", "objet", "sujet", "litige", "streit"],
            (Incidents, Label) => &["cause", "nature", "type", "schadenart", "sinistre"],
            _ => &[],
        }
    }

    /// Maps a free-text status cell to this register's status vocabulary.
    /// Unrecognised text is kept (lowercased, spaces as `_`) and left to
    /// validation.
    fn normalize_status(
        &self,
        raw: Option<&str>,
        end: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Option<String> {
        let table: &[(&[&str], &str)] = match self {
            Self::Insurance => return None,
            Self::Maintenance => &[
                (&["à résilier", "a résilier", "a resilier"], "to_terminate"),
                (&["résilié", "resilié", "resilie", "gekündigt"], "terminated"),
                (&["conserv", "actif", "en cours"], "active"),
            ],
            Self::Servitudes => &[
                (&["radi", "gelöscht", "annul"], "cancelled"),
                (&["échu", "echu", "expir", "caduc"], "expired"),
                (&["en vigueur", "inscrit", "actif", "active"], "active"),
            ],
            Self::Disputes => &[
                (&["terminé", "termine", "clos", "clôtur", "fermé", "ferme"], "closed"),
                (&["en cours"], "in_progress"),
                (&["résolu", "resolu", "réglé", "regle", "accord"], "resolved"),
                (&["attente", "suspendu"], "pending"),
                (&["ouvert", "nouveau"], "open"),
            ],
            Self::Incidents => &[
                (&["terminé", "termine", "clos", "clôtur"], "closed"),
                (&["assurance"], "insurance_claim"),
                (&["en cours", "enquête", "investig"], "investigating"),
                (&["résolu", "resolu", "réglé", "regle"], "resolved"),
                (&["ouvert", "annoncé", "annonce", "déclaré", "declare"], "reported"),
            ],
        };

        let Some(raw) = raw else {
            return Some(
                match self {
                    Self::Servitudes if end.is_some_and(|e| e < today) => "expired",
                    Self::Maintenance | Self::Servitudes => "active",
                    Self::Disputes => "open",
                    _ => "reported",
                }
                .to_string(),
            );
        };

        let lower = raw.trim().to_lowercase();
        for (needles, status) in table {
            if needles.iter().any(|n| lower.contains(n)) {
                return Some(status.to_string());
            }
        }
        Some(lower.split_whitespace().collect::<Vec<_>>().join("_"))
    }

    fn table(&self) -> &'static str {
        match self {
            Self::Maintenance => "maintenance",
            Self::Insurance => "insurance_policies",
            Self::Servitudes => "servitudes",
            Self::Disputes => "disputes",
            Self::Incidents => "incidents",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RegisterError {
    #[error("no {kind} header row (a {label} column plus one other known column) in the first {rows} rows")]
    NoHeader {
        kind: &'static str,
        label: &'static str,
        rows: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterRow {
    /// Spreadsheet row number (1-based).
    pub line: usize,
    pub property: Option<String>,
    pub label: String,
    pub kind: Option<String>,
    pub description: Option<String>,
    pub party: Option<String>,
    pub reference: Option<String>,
    pub amount: Option<f64>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub status: Option<String>,
    pub unit: Option<String>,
    pub tenant: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Register {
    pub kind: RegisterKind,
    pub header_line: usize,
    pub has_property_column: bool,
    pub rows: Vec<RegisterRow>,
    pub rejected: Vec<RejectedRow>,
}

fn map_header(kind: RegisterKind, header: &[String]) -> HashMap<Field, usize> {
    let mut map = HashMap::new();
    for (idx, raw) in header.iter().enumerate() {
        let col = raw.trim().to_lowercase();
        if col.is_empty() {
            continue;
        }
        let field = FIELD_ORDER
            .iter()
            .copied()
            .find(|f| kind.keywords(*f).iter().any(|k| col.contains(k)));
        if let Some(field) = field {
            map.entry(field).or_insert(idx);
        }
    }
    map
}

fn text(row: &[String], idx: Option<usize>) -> Option<String> {
    rentroll::cell(row, idx)
        .filter(|v| *v != "-")
        .map(|v| v.split_whitespace().collect::<Vec<_>>().join(" "))
}

pub fn parse_register(
    kind: RegisterKind,
    rows: &[Vec<String>],
    today: NaiveDate,
) -> Result<Register, RegisterError> {
    let (header_idx, columns) = rows
        .iter()
        .take(HEADER_SEARCH_ROWS)
        .enumerate()
        .map(|(i, r)| (i, map_header(kind, r)))
        .find(|(_, m)| m.contains_key(&Field::Label) && m.len() >= 2)
        .ok_or(RegisterError::NoHeader {
            kind: kind.as_str(),
            label: kind.label_name(),
            rows: HEADER_SEARCH_ROWS,
        })?;
    let header_line = header_idx + 1;
    let col = |f: Field| columns.get(&f).copied();

    let mut parsed = Vec::new();
    let mut rejected = Vec::new();

    for (offset, row) in rows[header_idx + 1..].iter().enumerate() {
        let line = header_line + offset + 1;
        if (0..row.len()).all(|i| rentroll::cell(row, Some(i)).is_none()) {
            continue;
        }

        let Some(label) = text(row, col(Field::Label)) else {
            rejected.push(RejectedRow {
                line,
                reason: format!("empty {}", kind.label_name()),
            });
            continue;
        };
        if SUMMARY_LABELS.contains(&label.to_lowercase().as_str()) {
            rejected.push(RejectedRow {
                line,
                reason: "summary row".to_string(),
            });
            continue;
        }

        let end = rentroll::cell(row, col(Field::End)).and_then(rentroll::parse_date);
        let status_cell = text(row, col(Field::Status));
        parsed.push(RegisterRow {
            line,
            property: text(row, col(Field::Property)),
            label,
            kind: text(row, col(Field::Kind)),
            description: text(row, col(Field::Description)),
            party: text(row, col(Field::Party)),
            reference: text(row, col(Field::Reference)),
            amount: rentroll::cell(row, col(Field::Amount)).and_then(rentroll::parse_money),
            start: rentroll::cell(row, col(Field::Start)).and_then(rentroll::parse_date),
            end,
            status: kind.normalize_status(status_cell.as_deref(), end, today),
            unit: text(row, col(Field::Unit)),
            tenant: text(row, col(Field::Tenant)),
        });
    }

    Ok(Register {
        kind,
        header_line,
        has_property_column: columns.contains_key(&Field::Property),
        rows: parsed,
        rejected,
    })
}

fn validation_failure(kind: RegisterKind, row: &RegisterRow) -> Option<RejectedRow> {
    let status = match kind.statuses() {
        Some(allowed) => validate::validate_status(row.status.as_deref(), allowed),
        None => Ok(()),
    };
    let errors: Vec<String> = [
        validate::validate_non_negative(row.amount, kind.amount_name()),
        validate::validate_date_range(row.start, row.end),
        status,
    ]
    .into_iter()
    .filter_map(|r| r.err().map(|e| e.to_string()))
    .collect();

    (!errors.is_empty()).then(|| RejectedRow {
        line: row.line,
        reason: errors.join("; "),
    })
}

fn normalize_name(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Property id for a free-text property cell. `properties` is `(id, name)`.
/// An exact name wins; otherwise the longest property name contained in the
/// cell ("Avenue de la Gare 28, Martigny"), then a name containing the cell.
pub fn match_property<'a>(value: &str, properties: &'a [(String, String)]) -> Option<&'a str> {
    let value = normalize_name(value);
    if value.is_empty() {
        return None;
    }
    let names: Vec<(&str, String)> = properties
        .iter()
        .map(|(id, name)| (id.as_str(), normalize_name(name)))
        .collect();

    if let Some((id, _)) = names.iter().find(|(_, n)| *n == value) {
        return Some(*id);
    }
    if let Some((id, _)) = names
        .iter()
        .filter(|(_, n)| !n.is_empty() && value.contains(n.as_str()))
        .max_by_key(|(_, n)| n.len())
    {
        return Some(*id);
    }
    names
        .iter()
        .find(|(_, n)| n.contains(value.as_str()))
        .map(|(id, _)| *id)
}

fn record_id(kind: RegisterKind, property_id: &str, row: &RegisterRow) -> String {
    let label = row.label.to_lowercase();
    let start = row.start.map(|d| d.to_string()).unwrap_or_default();
    let tenant = row.tenant.as_deref().unwrap_or_default().to_lowercase();
    let key = [
        kind.as_str(),
        property_id,
        label.as_str(),
        row.reference.as_deref().unwrap_or_default(),
        start.as_str(),
        row.unit.as_deref().unwrap_or_default(),
        tenant.as_str(),
    ]
    .join("\u{1f}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}

#[derive(Debug, Default)]
pub struct RegisterReport {
    /// Rows that passed property resolution and validation.
    pub valid: u64,
    pub records: UpsertCounts,
    pub invalid: Vec<RejectedRow>,
    /// Unit cells with no matching unit in the property.
    pub unmatched_units: u64,
}

/// Writes every valid row in one transaction (nothing with `dry_run`).
/// `property_id` assigns all rows to one property; without it each row's
/// property cell is matched against the stored properties.
pub async fn import_register(
    pool: &SqlitePool,
    register: &Register,
    property_id: Option<&str>,
    dry_run: bool,
) -> Result<RegisterReport> {
    let kind = register.kind;
    let properties: Vec<(String, String)> =
        sqlx::query_as("SELECT id, name FROM properties ORDER BY name")
            .fetch_all(pool)
            .await?;

    let mut report = RegisterReport::default();
    let mut tx = pool.begin().await?;

    for row in &register.rows {
        let resolved = match (property_id, row.property.as_deref()) {
            (Some(id), _) => Ok(id.to_string()),
            (None, Some(cell)) => match_property(cell, &properties)
                .map(str::to_string)
                .ok_or_else(|| format!("unknown property '{}'", cell)),
            (None, None) => Err("no property".to_string()),
        };
        let property = match resolved {
            Ok(p) => p,
            Err(reason) => {
                report.invalid.push(RejectedRow {
                    line: row.line,
                    reason,
                });
                continue;
            }
        };
        if let Some(rejected) = validation_failure(kind, row) {
            report.invalid.push(rejected);
            continue;
        }
        report.valid += 1;
        if dry_run {
            continue;
        }

        let unit_id = match &row.unit {
            Some(unit) => {
                let id = find_unit(&mut tx, &property, unit).await?;
                if id.is_none() {
                    tracing::warn!(line = row.line, unit = %unit, "unit not found");
                    report.unmatched_units += 1;
                }
                id
            }
            None => None,
        };
        let tenant_id = match &row.tenant {
            Some(name) => {
                sqlx::query_scalar::<_, String>("SELECT id FROM tenants WHERE lower(name) = lower(?)")
                    .bind(name)
                    .fetch_optional(&mut *tx)
                    .await?
            }
            None => None,
        };

        let id = record_id(kind, &property, row);
        let exists: bool = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) > 0 FROM {} WHERE id = ?",
            kind.table()
        ))
        .bind(&id)
        .fetch_one(&mut *tx)
        .await?;

        write_record(
            &mut tx,
            kind,
            &id,
            &property,
            unit_id.as_deref(),
            tenant_id.as_deref(),
            row,
        )
        .await?;
        if exists {
            report.records.updated += 1;
        } else {
            report.records.created += 1;
        }
    }

    tx.commit().await?;
    Ok(report)
}

async fn find_unit(
    tx: &mut Transaction<'_, Sqlite>,
    property_id: &str,
    unit_number: &str,
) -> Result<Option<String>> {
    Ok(sqlx::query_scalar(
        "SELECT id FROM units WHERE property_id = ? AND lower(unit_number) = lower(?)",
    )
    .bind(property_id)
    .bind(unit_number)
    .fetch_optional(&mut **tx)
    .await?)
}

async fn write_record(
    tx: &mut Transaction<'_, Sqlite>,
    kind: RegisterKind,
    id: &str,
    property_id: &str,
    unit_id: Option<&str>,
    tenant_id: Option<&str>,
    row: &RegisterRow,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let start = row.start.map(|d| d.to_string());
    let end = row.end.map(|d| d.to_string());

    match kind {
        RegisterKind::Maintenance => {
            sqlx::query(
                r#"
                INSERT INTO maintenance (id, property_id, unit_id, contractor, contract_type, description,
                                         annual_cost, start_date, end_date, status, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    unit_id = excluded.unit_id, contract_type = excluded.contract_type,
                    description = excluded.description, annual_cost = excluded.annual_cost,
                    end_date = excluded.end_date, status = excluded.status
                "#,
            )
            .bind(id)
            .bind(property_id)
            .bind(unit_id)
            .bind(&row.label)
            .bind(&row.kind)
            .bind(&row.description)
            .bind(row.amount)
            .bind(&start)
            .bind(&end)
            .bind(&row.status)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
        RegisterKind::Insurance => {
            sqlx::query(
                r#"
                INSERT INTO insurance_policies (id, property_id, insurer, policy_number, coverage_type,
                                                annual_premium, start_date, end_date, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    coverage_type = excluded.coverage_type, annual_premium = excluded.annual_premium,
                    end_date = excluded.end_date
                "#,
            )
            .bind(id)
            .bind(property_id)
            .bind(&row.label)
            .bind(&row.reference)
            .bind(&row.kind)
            .bind(row.amount)
            .bind(&start)
            .bind(&end)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
        RegisterKind::Servitudes => {
            sqlx::query(
                r#"
                INSERT INTO servitudes (id, property_id, servitude_type, description, beneficiary,
                                        registry_number, start_date, end_date, status, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    description = excluded.description, beneficiary = excluded.beneficiary,
                    end_date = excluded.end_date, status = excluded.status
                "#,
            )
            .bind(id)
            .bind(property_id)
            .bind(&row.label)
            .bind(&row.description)
            .bind(&row.party)
            .bind(&row.reference)
            .bind(&start)
            .bind(&end)
            .bind(&row.status)
            .bind(now)
            .execute(&mut **tx)
            .await?;
            if let Some(unit_id) = unit_id {
                sqlx::query(
                    "INSERT OR IGNORE INTO servitudes_units (servitude_id, unit_id) VALUES (?, ?)",
                )
                .bind(id)
                .bind(unit_id)
                .execute(&mut **tx)
                .await?;
            }
        }
        RegisterKind::Disputes => {
            sqlx::query(
                r#"
                INSERT INTO disputes (id, property_id, unit_id, tenant_id, subject, amount, status,
                                      opened_at, closed_at, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    unit_id = excluded.unit_id, tenant_id = excluded.tenant_id,
                    amount = excluded.amount, status = excluded.status, closed_at = excluded.closed_at
                "#,
            )
            .bind(id)
            .bind(property_id)
            .bind(unit_id)
            .bind(tenant_id)
            .bind(&row.label)
            .bind(row.amount)
            .bind(&row.status)
            .bind(&start)
            .bind(&end)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
        RegisterKind::Incidents => {
            sqlx::query(
                r#"
                INSERT INTO incidents (id, property_id, unit_id, incident_type, description,
                                       occurred_at, cost, status, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    unit_id = excluded.unit_id, description = excluded.description,
                    cost = excluded.cost, status = excluded.status
                "#,
            )
            .bind(id)
            .bind(property_id)
            .bind(unit_id)
            .bind(&row.label)
            .bind(&row.description)
            .bind(&start)
            .bind(row.amount)
            .bind(&row.status)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

pub async fn run_import_register(
    config: &Config,
    file: &Path,
    kind: RegisterKind,
    property: Option<&str>,
    dry_run: bool,
) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let rows = extract::read_xlsx_rows(&bytes)
        .with_context(|| format!("Failed to read spreadsheet {}", file.display()))?;
    let today = chrono::Local::now().date_naive();
    let register = parse_register(kind, &rows, today)?;

    let pool = db::connect(config).await?;
    migrate::seed_properties(&pool, &config.properties).await?;

    let property_id = match property {
        Some(name) => match migrate::property_id_by_name(&pool, name).await? {
            Some(id) => Some(id),
            None => {
                let names: Vec<&str> = config.properties.iter().map(|p| p.name.as_str()).collect();
                pool.close().await;
                bail!(
                    "Unknown property '{}'. Configured properties: {}",
                    name,
                    names.join(", ")
                );
            }
        },
        None if !register.has_property_column => {
            pool.close().await;
            bail!(
                "{} has no property column; pass --property <name>",
                file.display()
            );
        }
        None => None,
    };

    let report = import_register(&pool, &register, property_id.as_deref(), dry_run).await?;

    println!(
        "import-register {} ({}){}",
        file.display(),
        kind.as_str(),
        if dry_run { " (dry-run)" } else { "" }
    );
    println!("  header row: {}", register.header_line);
    println!("  rows parsed: {}", register.rows.len());
    println!("  rows valid: {}", report.valid);
    println!(
        "  rows rejected: {}",
        register.rejected.len() + report.invalid.len()
    );
    for r in register.rejected.iter().chain(report.invalid.iter()) {
        println!("    row {}: {}", r.line, r.reason);
    }
    if !dry_run {
        println!(
            "  records: {} new, {} updated",
            report.records.created, report.records.updated
        );
        if report.unmatched_units > 0 {
            println!("  unmatched units: {}", report.unmatched_units);
        }
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::tests::{memory_pool, property};
    use crate::query;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    fn maintenance_sheet() -> Vec<Vec<String>> {
        vec![
            row(&["Contrats d'entretien Gare 28"]),
            row(&["Màj au 05.09.2024"]),
            row(&[]),
            row(&[
                "Nom d'entreprise", "Description", "Fréquence", "Coût annuel", "Début",
                "Délai de résiliation", "Fin de contrat", "Etat",
            ]),
            row(&["Schindler SA", "Ascenseur", "mensuel", "4'200.00", "01.01.2020", "3 mois", "", "Conservé"]),
            row(&["Jardin Services", "Entretien extérieurs", "", "CHF 1'150,50", "", "", "31.12.2024", "Résilié"]),
            row(&["Nettoyage Pro Sàrl", "Conciergerie", "", "-300", "", "", "", ""]),
            row(&["", "Note sans entreprise", "", "", "", "", "", ""]),
            row(&["Total", "", "", "5350.50", "", "", "", ""]),
        ]
    }

    #[test]
    fn register_kinds_parse() {
        assert_eq!(RegisterKind::parse("Litiges").unwrap(), RegisterKind::Disputes);
        assert_eq!(RegisterKind::parse("sinistres").unwrap(), RegisterKind::Incidents);
        assert!(RegisterKind::parse("parking").is_err());
    }

    #[test]
    fn maintenance_header_and_rows() {
        let reg = parse_register(RegisterKind::Maintenance, &maintenance_sheet(), today()).unwrap();
        assert_eq!(reg.header_line, 4);
        assert!(!reg.has_property_column);
        assert_eq!(reg.rows.len(), 3);

        let lift = &reg.rows[0];
        assert_eq!(lift.label, "Schindler SA");
        assert_eq!(lift.description.as_deref(), Some("Ascenseur"));
        assert_eq!(lift.amount, Some(4200.0));
        assert_eq!(lift.start, NaiveDate::from_ymd_opt(2020, 1, 1));
        assert_eq!(lift.status.as_deref(), Some("active"));

        let garden = &reg.rows[1];
        assert_eq!(garden.amount, Some(1150.5));
        assert_eq!(garden.end, NaiveDate::from_ymd_opt(2024, 12, 31));
        assert_eq!(garden.status.as_deref(), Some("terminated"));

        let reasons: Vec<(usize, &str)> = reg
            .rejected
            .iter()
            .map(|r| (r.line, r.reason.as_str()))
            .collect();
        assert_eq!(reasons, vec![(8, "empty contractor"), (9, "summary row")]);
    }

    #[test]
    fn incident_columns_do_not_collide() {
        let rows = vec![row(&[
            "N réf", "Immeuble", "Locataire", "Nom de l'assurance", "date du sinistre",
            "cause du sinistre", "Statut", "coût a charge Investis", "Commentaires Investis",
        ])];
        let columns = map_header(RegisterKind::Incidents, &rows[0]);
        assert_eq!(columns.get(&Field::Property), Some(&1));
        assert_eq!(columns.get(&Field::Start), Some(&4));
        assert_eq!(columns.get(&Field::Label), Some(&5));
        assert_eq!(columns.get(&Field::Status), Some(&6));
        assert_eq!(columns.get(&Field::Amount), Some(&7));
        assert_eq!(columns.get(&Field::Description), Some(&8));
    }

    #[test]
    fn servitude_dates_and_statuses() {
        let rows = vec![
            row(&["N° RF", "Type de servitude", "Bénéficiaire", "Date d'inscription", "Date de radiation", "Statut"]),
            row(&["2023-00412", "Passage à pied et pour tous véhicules", "Parcelle 1203", "12.03.1985", "", ""]),
            row(&["1998-00077", "Canalisation", "Commune de Sion", "01.06.1998", "", "Radiée"]),
            row(&["2001-00031", "Vue droite", "", "01.01.2001", "31.12.2020", ""]),
        ];
        let reg = parse_register(RegisterKind::Servitudes, &rows, today()).unwrap();
        let statuses: Vec<&str> = reg.rows.iter().filter_map(|r| r.status.as_deref()).collect();
        assert_eq!(statuses, vec!["active", "cancelled", "expired"]);
        assert_eq!(reg.rows[0].reference.as_deref(), Some("2023-00412"));
        assert_eq!(reg.rows[0].party.as_deref(), Some("Parcelle 1203"));
        assert_eq!(reg.rows[2].end, NaiveDate::from_ymd_opt(2020, 12, 31));
    }

    #[test]
    fn missing_label_column_is_an_error() {
        let rows = vec![row(&["Description", "Coût annuel"])];
        assert_eq!(
            parse_register(RegisterKind::Maintenance, &rows, today()).unwrap_err(),
            RegisterError::NoHeader {
                kind: "maintenance",
                label: "contractor",
                rows: 20
            }
        );
    }

    #[test]
    fn property_cells_match_by_name() {
        let props = vec![
            ("p1".to_string(), "Gare 28".to_string()),
            ("p2".to_string(), "Gare 8-10".to_string()),
            ("p3".to_string(), "Place Centrale 3".to_string()),
        ];
        assert_eq!(match_property("gare 28", &props), Some("p1"));
        assert_eq!(match_property("Avenue de la Gare 8-10, Martigny", &props), Some("p2"));
        assert_eq!(match_property("Centrale", &props), Some("p3"));
        assert_eq!(match_property("Pratifori 5-7", &props), None);
        assert_eq!(match_property("  ", &props), None);
    }

    #[tokio::test]
    async fn maintenance_import_feeds_the_summary() {
        let pool = memory_pool().await;
        migrate::seed_properties(&pool, &[property("Gare 28")]).await.unwrap();
        let property_id = migrate::property_id_by_name(&pool, "Gare 28")
            .await
            .unwrap()
            .unwrap();
        let reg = parse_register(RegisterKind::Maintenance, &maintenance_sheet(), today()).unwrap();

        let dry = import_register(&pool, &reg, Some(&property_id), true).await.unwrap();
        assert_eq!(dry.valid, 2);
        assert_eq!(dry.records.created, 0);

        let first = import_register(&pool, &reg, Some(&property_id), false).await.unwrap();
        assert_eq!(first.records.created, 2);
        assert_eq!(first.invalid.len(), 1);
        assert!(first.invalid[0].reason.contains("annual_cost"));

        let second = import_register(&pool, &reg, Some(&property_id), false).await.unwrap();
        assert_eq!(second.records.created, 0);
        assert_eq!(second.records.updated, 2);

        let summary = query::maintenance_summary(&pool).await.unwrap();
        assert_eq!(summary.contracts, 2);
        assert_eq!(summary.total_annual_cost, 5350.5);
        assert_eq!(summary.details[0].property.as_deref(), Some("Gare 28"));
    }

    #[tokio::test]
    async fn incidents_and_disputes_resolve_property_per_row() {
        let pool = memory_pool().await;
        migrate::seed_properties(&pool, &[property("Gare 28"), property("Banque 4")])
            .await
            .unwrap();

        let incidents = vec![
            row(&["Immeuble", "date du sinistre", "cause du sinistre", "Statut", "coût"]),
            row(&["Gare 28 - Sion", "14.02.2024", "Dégât des eaux", "En cours", "1996.7"]),
            row(&["Banque 4", "03.11.2023", "Bris de glace", "Terminé", "450"]),
            row(&["Pratifori 5-7", "01.01.2024", "Incendie", "", ""]),
            row(&["Gare 28", "20.05.2024", "Infiltration", "à voir", ""]),
        ];
        let reg = parse_register(RegisterKind::Incidents, &incidents, today()).unwrap();
        assert!(reg.has_property_column);
        let report = import_register(&pool, &reg, None, false).await.unwrap();
        assert_eq!(report.records.created, 2);
        let reasons: Vec<&str> = report.invalid.iter().map(|r| r.reason.as_str()).collect();
        assert_eq!(reasons.len(), 2);
        assert_eq!(reasons[0], "unknown property 'Pratifori 5-7'");
        assert!(reasons[1].contains("invalid status 'à_voir'"));

        let disputes = vec![
            row(&["Adresse", "Locataire", "Motif", "Montant", "Statut"]),
            row(&["Gare 28", "Marie Dupont", "Loyers impayés", "4'800", "ouvert"]),
        ];
        let reg = parse_register(RegisterKind::Disputes, &disputes, today()).unwrap();
        let report = import_register(&pool, &reg, None, false).await.unwrap();
        assert_eq!(report.records.created, 1);

        let dashboard = query::property_dashboard(&pool, "Gare 28", today()).await.unwrap();
        assert_eq!(dashboard.open_incidents, 1);
        assert_eq!(dashboard.open_disputes, 1);
        let banque = query::property_dashboard(&pool, "Banque 4", today()).await.unwrap();
        assert_eq!(banque.open_incidents, 0);
    }

    #[tokio::test]
    async fn servitudes_and_insurance_reach_the_query_tools() {
        let pool = memory_pool().await;
        migrate::seed_properties(&pool, &[property("Gare 28")]).await.unwrap();
        let property_id = migrate::property_id_by_name(&pool, "Gare 28")
            .await
            .unwrap()
            .unwrap();

        let servitudes = vec![
            row(&["N° RF", "Type de servitude", "Bénéficiaire", "Statut"]),
            row(&["2023-00412", "Passage à pied", "Parcelle 1203", ""]),
            row(&["1998-00077", "Passage de canalisation", "Commune", "Radiée"]),
        ];
        let reg = parse_register(RegisterKind::Servitudes, &servitudes, today()).unwrap();
        import_register(&pool, &reg, Some(&property_id), false).await.unwrap();

        let active = query::search_servitudes(&pool, Some("gare"), Some("passage"), true)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].beneficiary.as_deref(), Some("Parcelle 1203"));
        let all = query::search_servitudes(&pool, None, Some("passage"), false)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let policies = vec![
            row(&["Assureur", "N° de police", "Couverture", "Prime annuelle", "Début", "Fin"]),
            row(&["Baloise", "P-778812", "Bâtiment", "CHF 2'400.-", "01.01.2025", "31.12.2027"]),
        ];
        let reg = parse_register(RegisterKind::Insurance, &policies, today()).unwrap();
        let report = import_register(&pool, &reg, Some(&property_id), false).await.unwrap();
        assert_eq!(report.records.created, 1);

        let dashboard = query::property_dashboard(&pool, "Gare 28", today()).await.unwrap();
        assert_eq!(dashboard.insurance.len(), 1);
        assert_eq!(dashboard.insurance[0].policy_number.as_deref(), Some("P-778812"));
        assert_eq!(dashboard.insurance[0].annual_premium, Some(2400.0));
        assert_eq!(dashboard.servitudes.len(), 1);
    }
}
