//! Document retrieval by ID.
//!
//! Returns a document with its property/unit/tenant linkage resolved to names
//! and every chunk with its own detection result. Used by `estate get`.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

#[derive(Debug, Clone, Serialize)]
pub struct DocumentResponse {
    pub id: String,
    pub file_path: String,
    pub file_name: String,
    pub content_type: String,
    pub category: String,
    pub language: Option<String>,
    pub extraction: String,
    pub size_bytes: i64,
    pub property: Option<String>,
    pub unit: Option<String>,
    pub tenant: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub body: String,
    pub metadata: serde_json::Value,
    pub chunks: Vec<ChunkResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkResponse {
    pub index: i64,
    pub property: Option<String>,
    pub unit_number: Option<String>,
    pub detection_score: Option<i64>,
    pub detection_method: Option<String>,
    pub embedded: bool,
    pub text: String,
}

pub async fn get_document(config: &Config, id: &str) -> Result<DocumentResponse> {
    let pool = db::connect_read_only(config).await?;
    let doc = get_with_pool(&pool, id).await;
    pool.close().await;
    doc
}

pub async fn get_with_pool(pool: &SqlitePool, id: &str) -> Result<DocumentResponse> {
    let doc_row = sqlx::query(
        r#"
        SELECT d.id, d.file_path, d.file_name, d.content_type, d.category, d.language,
               d.extraction, d.size_bytes, d.body, d.metadata_json, d.created_at, d.updated_at,
               p.name AS property, u.unit_number AS unit, t.name AS tenant
        FROM documents d
        LEFT JOIN properties p ON p.id = d.property_id
        LEFT JOIN units u ON u.id = d.unit_id
        LEFT JOIN tenants t ON t.id = d.tenant_id
        WHERE d.id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    let Some(doc_row) = doc_row else {
        bail!("document not found: {}", id);
    };

    let metadata_json: String = doc_row.get("metadata_json");
    let metadata: serde_json::Value =
        serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({}));

    let chunk_rows = sqlx::query(
        r#"
        SELECT c.chunk_index, c.text, c.unit_number, c.detection_score, c.detection_method,
               p.name AS property, (v.chunk_id IS NOT NULL) AS embedded
        FROM document_chunks c
        LEFT JOIN properties p ON p.id = c.property_id
        LEFT JOIN chunk_vectors v ON v.chunk_id = c.id
        WHERE c.document_id = ?
        ORDER BY c.chunk_index ASC
        "#,
    )
    .bind(id)
    .fetch_all(pool)
    .await?;

    let chunks = chunk_rows
        .iter()
        .map(|row| ChunkResponse {
            index: row.get("chunk_index"),
            property: row.get("property"),
            unit_number: row.get("unit_number"),
            detection_score: row.get("detection_score"),
            detection_method: row.get("detection_method"),
            embedded: row.get("embedded"),
            text: row.get("text"),
        })
        .collect();

    Ok(DocumentResponse {
        id: doc_row.get("id"),
        file_path: doc_row.get("file_path"),
        file_name: doc_row.get("file_name"),
        content_type: doc_row.get("content_type"),
        category: doc_row.get("category"),
        language: doc_row.get("language"),
        extraction: doc_row.get("extraction"),
        size_bytes: doc_row.get("size_bytes"),
        property: doc_row.get("property"),
        unit: doc_row.get("unit"),
        tenant: doc_row.get("tenant"),
        created_at: format_ts_iso(doc_row.get("created_at")),
        updated_at: format_ts_iso(doc_row.get("updated_at")),
        body: doc_row.get("body"),
        metadata,
        chunks,
    })
}

pub async fn run_get(config: &Config, id: &str, json: bool) -> Result<()> {
    let doc = get_document(config, id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("--- Document ---");
    println!("id:           {}", doc.id);
    println!("file:         {}", doc.file_path);
    println!("category:     {}", doc.category);
    println!("content_type: {}", doc.content_type);
    println!("extraction:   {}", doc.extraction);
    if let Some(ref lang) = doc.language {
        println!("language:     {}", lang);
    }
    println!("property:     {}", doc.property.as_deref().unwrap_or("(unlinked)"));
    if let Some(ref unit) = doc.unit {
        println!("unit:         {}", unit);
    }
    if let Some(ref tenant) = doc.tenant {
        println!("tenant:       {}", tenant);
    }
    println!("updated_at:   {}", doc.updated_at);
    println!();

    println!("--- Chunks ({}) ---", doc.chunks.len());
    for chunk in &doc.chunks {
        let linkage = match (&chunk.property, chunk.detection_score) {
            (Some(p), Some(score)) => format!(
                "{} score={} via {}",
                p,
                score,
                chunk.detection_method.as_deref().unwrap_or("?")
            ),
            _ => "unlinked".to_string(),
        };
        println!("[chunk {}] {}", chunk.index, linkage);
        println!("{}", chunk.text);
        println!();
    }

    Ok(())
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::tests::{memory_pool, property};
    use crate::migrate;

    #[tokio::test]
    async fn resolves_linkage_names() {
        let pool = memory_pool().await;
        migrate::seed_properties(&pool, &[property("Gare 28")]).await.unwrap();
        let pid = migrate::property_id_by_name(&pool, "Gare 28")
            .await
            .unwrap()
            .unwrap();
        sqlx::query(
            r#"INSERT INTO documents (id, file_path, file_name, file_hash, content_type, category, body, property_id, created_at, updated_at)
               VALUES ('d1', '/docs/bail.pdf', 'bail.pdf', 'h', 'application/pdf', 'lease', 'Bail à loyer', ?, 0, 86400)"#,
        )
        .bind(&pid)
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            r#"INSERT INTO document_chunks (id, document_id, chunk_index, text, hash, property_id, detection_score, detection_method)
               VALUES ('c1', 'd1', 0, 'Bail à loyer', 'x', ?, 10, 'filename')"#,
        )
        .bind(&pid)
        .execute(&pool)
        .await
        .unwrap();

        let doc = get_with_pool(&pool, "d1").await.unwrap();
        assert_eq!(doc.property.as_deref(), Some("Gare 28"));
        assert_eq!(doc.category, "lease");
        assert_eq!(doc.updated_at, "1970-01-02T00:00:00Z");
        assert_eq!(doc.chunks.len(), 1);
        assert_eq!(doc.chunks[0].detection_score, Some(10));
        assert!(!doc.chunks[0].embedded);
    }

    #[tokio::test]
    async fn missing_document_errors() {
        let pool = memory_pool().await;
        let err = get_with_pool(&pool, "nope").await.unwrap_err();
        assert!(err.to_string().contains("document not found"));
    }
}
