//! Database statistics and health overview.
//!
//! Row counts for every table, embedding coverage, the share of chunks linked
//! to a property and a per-property breakdown. Used by `estate stats` after an
//! ingest or link pass.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

const COUNTED_TABLES: &[&str] = &[
    "properties",
    "units",
    "tenants",
    "leases",
    "documents",
    "document_chunks",
    "chunk_vectors",
    "servitudes",
    "maintenance",
    "insurance_policies",
    "disputes",
    "incidents",
];

#[derive(Debug, Serialize)]
pub struct PropertyStats {
    pub property: String,
    pub documents: i64,
    pub chunks: i64,
    pub embedded: i64,
}

#[derive(Debug, Serialize)]
pub struct Stats {
    pub tables: Vec<(String, i64)>,
    pub chunks: i64,
    pub embedded: i64,
    pub linked: i64,
    /// Percentages, rounded down.
    pub embedding_coverage: i64,
    pub linkage_rate: i64,
    pub by_property: Vec<PropertyStats>,
    pub unlinked_chunks: i64,
}

fn percent(part: i64, total: i64) -> i64 {
    if total > 0 {
        part * 100 / total
    } else {
        0
    }
}

pub async fn collect_stats(pool: &SqlitePool) -> Result<Stats> {
    let mut tables = Vec::with_capacity(COUNTED_TABLES.len());
    for table in COUNTED_TABLES {
        // Table names come from the fixed list above.
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(pool)
            .await?;
        tables.push((table.to_string(), count));
    }

    let count_of = |name: &str| {
        tables
            .iter()
            .find(|(t, _)| t == name)
            .map(|(_, c)| *c)
            .unwrap_or(0)
    };
    let chunks = count_of("document_chunks");
    let embedded = count_of("chunk_vectors");

    let linked: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks WHERE property_id IS NOT NULL")
            .fetch_one(pool)
            .await?;

    let rows = sqlx::query(
        r#"
        SELECT
            p.name AS property,
            COUNT(DISTINCT c.document_id) AS documents,
            COUNT(DISTINCT c.id) AS chunks,
            COUNT(DISTINCT v.chunk_id) AS embedded
        FROM properties p
        LEFT JOIN document_chunks c ON c.property_id = p.id
        LEFT JOIN chunk_vectors v ON v.chunk_id = c.id
        GROUP BY p.id
        ORDER BY chunks DESC, p.name
        "#,
    )
    .fetch_all(pool)
    .await?;

    let by_property = rows
        .iter()
        .map(|row| PropertyStats {
            property: row.get("property"),
            documents: row.get("documents"),
            chunks: row.get("chunks"),
            embedded: row.get("embedded"),
        })
        .collect();

    Ok(Stats {
        chunks,
        embedded,
        linked,
        embedding_coverage: percent(embedded, chunks),
        linkage_rate: percent(linked, chunks),
        unlinked_chunks: chunks - linked,
        by_property,
        tables,
    })
}

pub async fn run_stats(config: &Config, json: bool) -> Result<()> {
    let pool = db::connect_read_only(config).await?;
    let stats = collect_stats(&pool).await?;
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Estate Harness: Database Stats");
    println!("==============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    for (table, count) in &stats.tables {
        println!("  {:<20} {:>8}", table, count);
    }
    println!();
    println!(
        "  Embedded:    {} / {} ({}%)",
        stats.embedded, stats.chunks, stats.embedding_coverage
    );
    println!(
        "  Linked:      {} / {} ({}%)",
        stats.linked, stats.chunks, stats.linkage_rate
    );

    if !stats.by_property.is_empty() {
        println!();
        println!("  By property:");
        println!(
            "  {:<28} {:>6} {:>8} {:>10}",
            "PROPERTY", "DOCS", "CHUNKS", "EMBEDDED"
        );
        println!("  {}", "-".repeat(56));
        for p in &stats.by_property {
            println!(
                "  {:<28} {:>6} {:>8} {:>10}",
                p.property, p.documents, p.chunks, p.embedded
            );
        }
        println!(
            "  {:<28} {:>6} {:>8}",
            "(unlinked)", "", stats.unlinked_chunks
        );
    }
    println!();

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::tests::{memory_pool, property};
    use crate::migrate;

    #[test]
    fn byte_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[tokio::test]
    async fn coverage_and_linkage() {
        let pool = memory_pool().await;
        migrate::seed_properties(&pool, &[property("Gare 28"), property("Banque 4")])
            .await
            .unwrap();
        let pid = migrate::property_id_by_name(&pool, "Gare 28")
            .await
            .unwrap()
            .unwrap();
        sqlx::query(
            r#"INSERT INTO documents (id, file_path, file_name, file_hash, content_type, body, created_at, updated_at)
               VALUES ('d1', '/a.txt', 'a.txt', 'h', 'text/plain', 'x', 0, 0)"#,
        )
        .execute(&pool)
        .await
        .unwrap();
        for (i, linked) in [true, true, true, false].iter().enumerate() {
            sqlx::query(
                "INSERT INTO document_chunks (id, document_id, chunk_index, text, hash, property_id) VALUES (?, 'd1', ?, 't', 'h', ?)",
            )
            .bind(format!("c{}", i))
            .bind(i as i64)
            .bind(if *linked { Some(pid.clone()) } else { None })
            .execute(&pool)
            .await
            .unwrap();
        }
        sqlx::query("INSERT INTO chunk_vectors (chunk_id, document_id, embedding) VALUES ('c0', 'd1', x'00000000')")
            .execute(&pool)
            .await
            .unwrap();

        let stats = collect_stats(&pool).await.unwrap();
        assert_eq!(stats.chunks, 4);
        assert_eq!(stats.embedding_coverage, 25);
        assert_eq!(stats.linkage_rate, 75);
        assert_eq!(stats.unlinked_chunks, 1);
        assert_eq!(stats.by_property[0].property, "Gare 28");
        assert_eq!(stats.by_property[0].chunks, 3);
        assert_eq!(stats.by_property[0].embedded, 1);
        assert_eq!(stats.by_property[1].chunks, 0);
    }
}
