//! Linking document chunks to properties, units and tenants.
//!
//! Each configured property carries three tiers of regex rules. A text scores
//! the tier weight (10 / 5 / 2 by default) for every rule that matches, summed
//! per property; the best property wins and ties go to the property listed
//! first in the config. A chunk is linked when the winning score reaches
//! `linking.min_score`.
//!
//! Detection sources are tried in order and the first confident one wins:
//! the document's file path, the chunk text, then the string values of the
//! chunk and document metadata.

use anyhow::{bail, Result};
use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::classify;
use crate::config::{Config, PropertyConfig, RuleWeights};
use crate::db;
use crate::migrate;

/// Chunk texts shorter than this never match; they are mostly headers and
/// page numbers.
const MIN_TEXT_CHARS: usize = 20;

/// Chunk metadata keys written by a previous link pass. They are not evidence
/// and are dropped before scoring or when a chunk is unlinked.
const LINKAGE_KEYS: &[&str] = &[
    "property_id",
    "property_name",
    "detection_score",
    "detection_method",
    "unit_number",
    "unit_type",
];

lazy_static! {
    static ref UNIT_NUMBER_PATTERNS: Vec<Regex> = [
        r"(?i)\bappartement\s*n?°?\s*(\d+(?:\.\d+)?)",
        r"(?i)\bapp(?:t)?\.?\s*n?°?\s*(\d+(?:\.\d+)?)",
        r"(?i)\bwohnung\s*(?:nr\.?)?\s*(\d+(?:\.\d+)?)",
        r"(?i)\bunit\s*(?:no\.?|nr\.?|n°|#)?\s*(\d+(?:\.\d+)?)",
        r"(?i)\bparking\s*(?:n°|nr\.?)?\s*(\d+)",
        r"(?i)\bplace(?:\s+de\s+parc)?\s*(?:n°|nr\.?)?\s*(\d+)",
        r"(?i)\bbureau\s*(?:n°|nr\.?)?\s*(\d+(?:\.\d+)?)",
        r"(?i)\blocal\s*(?:n°|nr\.?)?\s*(\d+(?:\.\d+)?)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect();

    static ref WORD: Regex = Regex::new(r"[\p{L}\p{N}]+").unwrap();
}

struct CompiledProperty {
    name: String,
    strong: Vec<Regex>,
    medium: Vec<Regex>,
    weak: Vec<Regex>,
}

pub struct PropertyMatcher {
    properties: Vec<CompiledProperty>,
    weights: RuleWeights,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyMatch {
    pub property: String,
    pub score: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    FileName,
    TextAnalysis,
    Metadata,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::FileName => "filename",
            DetectionMethod::TextAnalysis => "text_analysis",
            DetectionMethod::Metadata => "metadata",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkOutcome {
    Linked {
        property: String,
        score: u32,
        method: DetectionMethod,
    },
    /// Some rules matched but no source reached the threshold.
    LowConfidence(PropertyMatch),
    NotFound,
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|e| anyhow::anyhow!("invalid detection pattern '{}': {}", p, e))
        })
        .collect()
}

impl PropertyMatcher {
    pub fn new(properties: &[PropertyConfig], weights: &RuleWeights) -> Result<Self> {
        let mut compiled = Vec::new();
        for prop in properties.iter().filter(|p| !p.rules.is_empty()) {
            compiled.push(CompiledProperty {
                name: prop.name.trim().to_string(),
                strong: compile(&prop.rules.strong)?,
                medium: compile(&prop.rules.medium)?,
                weak: compile(&prop.rules.weak)?,
            });
        }
        Ok(Self {
            properties: compiled,
            weights: weights.clone(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.properties, &config.linking.weights)
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Scores every property against `text`; only non-zero scores, in
    /// config order.
    pub fn scores(&self, text: &str) -> Vec<PropertyMatch> {
        self.properties
            .iter()
            .filter_map(|p| {
                let count = |rules: &[Regex]| rules.iter().filter(|r| r.is_match(text)).count() as u32;
                let score = count(&p.strong) * self.weights.strong
                    + count(&p.medium) * self.weights.medium
                    + count(&p.weak) * self.weights.weak;
                (score > 0).then(|| PropertyMatch {
                    property: p.name.clone(),
                    score,
                })
            })
            .collect()
    }

    /// Best-scoring property for a label such as a file path or metadata
    /// value. Ties go to the property configured first.
    pub fn best(&self, text: &str) -> Option<PropertyMatch> {
        let mut best: Option<PropertyMatch> = None;
        for m in self.scores(text) {
            if best.as_ref().map_or(true, |b| m.score > b.score) {
                best = Some(m);
            }
        }
        best
    }

    /// Best-scoring property for chunk text. Texts under 20 characters
    /// never match.
    pub fn score(&self, text: &str) -> Option<PropertyMatch> {
        if text.trim().chars().count() < MIN_TEXT_CHARS {
            return None;
        }
        self.best(text)
    }
}

/// Multi-strategy detection for one chunk.
pub fn link_chunk(
    matcher: &PropertyMatcher,
    file_path: &str,
    text: &str,
    metadata_values: &[String],
    min_score: u32,
) -> LinkOutcome {
    let mut best_seen: Option<PropertyMatch> = None;
    let mut consider = |m: Option<PropertyMatch>, method: DetectionMethod| -> Option<LinkOutcome> {
        let m = m?;
        if m.score >= min_score {
            return Some(LinkOutcome::Linked {
                property: m.property,
                score: m.score,
                method,
            });
        }
        if best_seen.as_ref().map_or(true, |b| m.score > b.score) {
            best_seen = Some(m);
        }
        None
    };

    if let Some(out) = consider(matcher.best(file_path), DetectionMethod::FileName) {
        return out;
    }
    if let Some(out) = consider(matcher.score(text), DetectionMethod::TextAnalysis) {
        return out;
    }
    for value in metadata_values {
        if let Some(out) = consider(matcher.best(value), DetectionMethod::Metadata) {
            return out;
        }
    }

    match best_seen {
        Some(m) => LinkOutcome::LowConfidence(m),
        None => LinkOutcome::NotFound,
    }
}

/// First unit number mentioned in `text` ("appartement n° 3.2", "Wohnung
/// Nr. 4", "place de parc 12", ...).
pub fn detect_unit_number(text: &str) -> Option<String> {
    UNIT_NUMBER_PATTERNS
        .iter()
        .find_map(|re| re.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn words(text: &str) -> HashSet<String> {
    WORD.find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Id of the tenant whose name shares the most significant words (longer
/// than three characters) with `text`. `tenants` is `(id, name)`; ties go to
/// the first tenant listed.
pub fn detect_tenant(text: &str, tenants: &[(String, String)]) -> Option<String> {
    let text_words = words(text);
    let mut best: Option<(&str, usize)> = None;
    for (id, name) in tenants {
        let matched = words(name)
            .iter()
            .filter(|w| w.chars().count() > 3 && text_words.contains(*w))
            .count();
        if matched > 0 && best.map_or(true, |(_, b)| matched > b) {
            best = Some((id.as_str(), matched));
        }
    }
    best.map(|(id, _)| id.to_string())
}

/// String leaves of a JSON value, depth first.
fn string_values(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => out.push(s.clone()),
        serde_json::Value::Array(items) => items.iter().for_each(|v| string_values(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| string_values(v, out)),
        _ => {}
    }
}

#[derive(Debug, Default)]
pub struct LinkReport {
    pub examined: u64,
    pub linked: u64,
    pub low_confidence: u64,
    pub not_found: u64,
    pub by_property: BTreeMap<String, u64>,
    pub by_method: BTreeMap<&'static str, u64>,
}

struct ChunkRow {
    id: String,
    document_id: String,
    text: String,
    file_path: String,
    chunk_meta: serde_json::Value,
    doc_meta: serde_json::Value,
}

pub async fn run_link(config: &Config, relink: bool, dry_run: bool) -> Result<()> {
    let matcher = PropertyMatcher::from_config(config)?;
    if matcher.is_empty() {
        bail!("No [[properties]] with detection rules configured; nothing to link against");
    }

    let pool = db::connect(config).await?;
    migrate::seed_properties(&pool, &config.properties).await?;

    let report = link_chunks(
        &pool,
        &matcher,
        config.linking.min_score,
        config.linking.batch_size,
        relink,
        dry_run,
    )
    .await?;

    println!("link{}", if dry_run { " (dry-run)" } else { "" });
    println!("  chunks examined: {}", report.examined);
    println!("  linked: {}", report.linked);
    println!("  low confidence: {}", report.low_confidence);
    println!("  not found: {}", report.not_found);
    if !report.by_property.is_empty() {
        println!("  by property:");
        for (name, n) in &report.by_property {
            println!("    {}: {}", name, n);
        }
    }
    if !report.by_method.is_empty() {
        println!("  by method:");
        for (method, n) in &report.by_method {
            println!("    {}: {}", method, n);
        }
    }

    pool.close().await;
    Ok(())
}

/// Links unlinked chunks (all chunks with `relink`) and propagates the
/// dominant property and tenant of each document's chunks to the document.
pub async fn link_chunks(
    pool: &SqlitePool,
    matcher: &PropertyMatcher,
    min_score: u32,
    batch_size: usize,
    relink: bool,
    dry_run: bool,
) -> Result<LinkReport> {
    let property_ids: HashMap<String, String> =
        sqlx::query_as::<_, (String, String)>("SELECT name, id FROM properties")
            .fetch_all(pool)
            .await?
            .into_iter()
            .collect();
    let tenants: Vec<(String, String)> =
        sqlx::query_as("SELECT id, name FROM tenants ORDER BY name")
            .fetch_all(pool)
            .await?;

    let rows = sqlx::query(
        r#"
        SELECT c.id, c.document_id, c.text, c.metadata_json, d.file_path, d.metadata_json AS doc_meta
        FROM document_chunks c
        JOIN documents d ON d.id = c.document_id
        WHERE ? OR c.property_id IS NULL
        ORDER BY d.file_path, c.chunk_index
        "#,
    )
    .bind(relink)
    .fetch_all(pool)
    .await?;

    let chunks: Vec<ChunkRow> = rows
        .iter()
        .map(|row| {
            let parse = |s: String| serde_json::from_str(&s).unwrap_or(serde_json::json!({}));
            let mut chunk_meta = parse(row.get("metadata_json"));
            if let serde_json::Value::Object(map) = &mut chunk_meta {
                for key in LINKAGE_KEYS {
                    map.remove(*key);
                }
            }
            ChunkRow {
                id: row.get("id"),
                document_id: row.get("document_id"),
                text: row.get("text"),
                file_path: row.get("file_path"),
                chunk_meta,
                doc_meta: parse(row.get("doc_meta")),
            }
        })
        .collect();

    let mut report = LinkReport::default();
    let mut touched_docs: HashSet<String> = HashSet::new();
    let now = chrono::Utc::now().timestamp();

    for batch in chunks.chunks(batch_size.max(1)) {
        let mut tx = pool.begin().await?;

        for chunk in batch {
            report.examined += 1;

            let mut meta_values = Vec::new();
            string_values(&chunk.chunk_meta, &mut meta_values);
            string_values(&chunk.doc_meta, &mut meta_values);

            let outcome = link_chunk(
                matcher,
                &chunk.file_path,
                &chunk.text,
                &meta_values,
                min_score,
            );

            let (property, score, method) = match outcome {
                LinkOutcome::Linked {
                    property,
                    score,
                    method,
                } => (property, score, method),
                unlinked => {
                    match unlinked {
                        LinkOutcome::LowConfidence(_) => report.low_confidence += 1,
                        _ => report.not_found += 1,
                    }
                    if relink && !dry_run {
                        sqlx::query(
                            "UPDATE document_chunks SET property_id = NULL, unit_number = NULL, tenant_id = NULL, detection_score = NULL, detection_method = NULL, metadata_json = ?, linked_at = NULL WHERE id = ?",
                        )
                        .bind(chunk.chunk_meta.to_string())
                        .bind(&chunk.id)
                        .execute(&mut *tx)
                        .await?;
                        touched_docs.insert(chunk.document_id.clone());
                    }
                    continue;
                }
            };

            let Some(property_id) = property_ids.get(&property) else {
                tracing::warn!(property = %property, "property missing from database");
                report.not_found += 1;
                continue;
            };

            report.linked += 1;
            *report.by_property.entry(property.clone()).or_default() += 1;
            *report.by_method.entry(method.as_str()).or_default() += 1;

            if dry_run {
                continue;
            }

            let unit_number = detect_unit_number(&chunk.text);
            let tenant_id = detect_tenant(&chunk.text, &tenants);
            let unit_type = classify::detect_unit_type(&chunk.text);

            let mut meta = match &chunk.chunk_meta {
                serde_json::Value::Object(_) => chunk.chunk_meta.clone(),
                _ => serde_json::json!({}),
            };
            meta["property_id"] = serde_json::json!(property_id);
            meta["property_name"] = serde_json::json!(property);
            meta["detection_score"] = serde_json::json!(score);
            meta["detection_method"] = serde_json::json!(method.as_str());
            if let Some(u) = &unit_number {
                meta["unit_number"] = serde_json::json!(u);
            }
            if let Some(t) = unit_type {
                meta["unit_type"] = serde_json::json!(t.as_str());
            }

            sqlx::query(
                r#"
                UPDATE document_chunks SET
                    property_id = ?, unit_number = ?, tenant_id = ?,
                    detection_score = ?, detection_method = ?, metadata_json = ?, linked_at = ?
                WHERE id = ?
                "#,
            )
            .bind(property_id)
            .bind(&unit_number)
            .bind(&tenant_id)
            .bind(score as i64)
            .bind(method.as_str())
            .bind(meta.to_string())
            .bind(now)
            .bind(&chunk.id)
            .execute(&mut *tx)
            .await?;
            touched_docs.insert(chunk.document_id.clone());
        }

        tx.commit().await?;
    }

    if !dry_run && !touched_docs.is_empty() {
        propagate_to_documents(pool, &touched_docs).await?;
    }

    Ok(report)
}

/// Sets each touched document's property and tenant to the ones most of its
/// linked chunks point at, or clears them when no linked chunk remains.
async fn propagate_to_documents(pool: &SqlitePool, doc_ids: &HashSet<String>) -> Result<()> {
    let mut tx = pool.begin().await?;

    for doc_id in doc_ids {
        sqlx::query(
            r#"
            UPDATE documents SET
                property_id = (
                    SELECT c.property_id FROM document_chunks c
                    WHERE c.document_id = documents.id AND c.property_id IS NOT NULL
                    GROUP BY c.property_id
                    ORDER BY COUNT(*) DESC, MAX(c.detection_score) DESC, c.property_id
                    LIMIT 1
                ),
                tenant_id = (
                    SELECT c.tenant_id FROM document_chunks c
                    WHERE c.document_id = documents.id AND c.tenant_id IS NOT NULL
                    GROUP BY c.tenant_id
                    ORDER BY COUNT(*) DESC, c.tenant_id
                    LIMIT 1
                )
            WHERE id = ?
            "#,
        )
        .bind(doc_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

#[derive(Debug, Default)]
pub struct UnitLinkReport {
    pub with_reference: u64,
    pub matched: u64,
    pub unmatched: Vec<String>,
}

pub async fn run_link_units(config: &Config, dry_run: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let report = link_units_by_reference(&pool, dry_run).await?;

    println!("link-units{}", if dry_run { " (dry-run)" } else { "" });
    println!("  documents with reference: {}", report.with_reference);
    println!("  matched: {}", report.matched);
    println!("  unmatched: {}", report.unmatched.len());
    for reference in &report.unmatched {
        println!("    {}", reference);
    }

    pool.close().await;
    Ok(())
}

/// Matches documents whose file name carries a `NNNNN.NN.NNNNNN` unit
/// reference to the unit with that reference in its number, then fills the
/// document's unit, property and (for leases) current tenant.
pub async fn link_units_by_reference(pool: &SqlitePool, dry_run: bool) -> Result<UnitLinkReport> {
    let docs: Vec<(String, String, String, Option<String>)> = sqlx::query_as(
        "SELECT id, file_name, category, property_id FROM documents ORDER BY file_path",
    )
    .fetch_all(pool)
    .await?;

    let mut report = UnitLinkReport::default();

    for (doc_id, file_name, category, property_id) in docs {
        let Some(reference) = classify::extract_unit_reference(&file_name) else {
            continue;
        };
        report.with_reference += 1;

        let unit: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT id, property_id FROM units
            WHERE (unit_number = ?1 OR instr(unit_number, ?1) > 0)
              AND (?2 IS NULL OR property_id = ?2)
            ORDER BY unit_number = ?1 DESC, unit_number
            LIMIT 1
            "#,
        )
        .bind(&reference)
        .bind(&property_id)
        .fetch_optional(pool)
        .await?;

        let Some((unit_id, unit_property)) = unit else {
            report.unmatched.push(reference);
            continue;
        };
        report.matched += 1;
        if dry_run {
            continue;
        }

        let tenant_id: Option<String> = if category == "lease" {
            sqlx::query_scalar(
                "SELECT tenant_id FROM leases WHERE unit_id = ? ORDER BY start_date DESC LIMIT 1",
            )
            .bind(&unit_id)
            .fetch_optional(pool)
            .await?
        } else {
            None
        };

        sqlx::query(
            r#"
            UPDATE documents SET
                unit_id = ?,
                property_id = COALESCE(property_id, ?),
                tenant_id = COALESCE(?, tenant_id)
            WHERE id = ?
            "#,
        )
        .bind(&unit_id)
        .bind(&unit_property)
        .bind(&tenant_id)
        .bind(&doc_id)
        .execute(pool)
        .await?;
    }

    Ok(report)
}
