//! Document ingestion pass.
//!
//! scan → delta filter (content hash) → extract (OCR fallback) → categorize →
//! upsert document → replace chunks and FTS rows → inline embedding → ledger.
//!
//! A file that fails at any step is logged, counted and skipped. The ledger
//! is flushed every `progress.save_every` files and when the pass is
//! interrupted, so a rerun skips everything already done.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use crate::chunk::chunk_text;
use crate::classify;
use crate::config::Config;
use crate::db;
use crate::embed_cmd;
use crate::embedding;
use crate::extract::{self, MIME_PDF};
use crate::models::{Chunk, Document, SourceFile};
use crate::ocr::OcrClient;
use crate::progress::{InterruptFlag, ProgressEvent, ProgressLedger, ProgressReporter};
use crate::scan;

#[derive(Default)]
struct IngestStats {
    unchanged: u64,
    too_short: u64,
    ingested: u64,
    failed: u64,
    chunks: u64,
    embedded: u64,
    embed_pending: u64,
    ocr_used: u64,
    interrupted: bool,
}

enum FileOutcome {
    Ingested {
        chunks: u64,
        embedded: u64,
        pending: u64,
        ocr: bool,
        cost: f64,
    },
    TooShort,
}

pub async fn run_ingest(
    config: &Config,
    full: bool,
    dry_run: bool,
    limit: Option<usize>,
    progress: &dyn ProgressReporter,
) -> Result<()> {
    let scan_config = config
        .scan
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("No [scan] section in config; nothing to ingest"))?;

    progress.report(ProgressEvent::Scanning {
        pass: "ingest".to_string(),
    });
    let mut files = scan::scan_files(scan_config)?;
    let found = files.len();
    if let Some(lim) = limit {
        files.truncate(lim);
    }

    let pool = db::connect(config).await?;
    let mut ledger = ProgressLedger::load(&config.ledger_path())?;

    let ocr = if config.ocr.is_enabled() && !dry_run {
        match OcrClient::from_config(&config.ocr) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!(error = %e, "OCR disabled for this run");
                None
            }
        }
    } else {
        None
    };

    let interrupt = InterruptFlag::install();
    let mut stats = IngestStats::default();
    let mut to_process = 0u64;
    let total = files.len() as u64;

    for (i, file) in files.iter().enumerate() {
        if interrupt.is_set() {
            stats.interrupted = true;
            break;
        }
        progress.report(ProgressEvent::Processing {
            pass: "ingest".to_string(),
            n: i as u64 + 1,
            total,
        });

        let file_hash = match scan::file_hash(&file.path) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(path = %file.relative_path, error = %e, "cannot hash file");
                stats.failed += 1;
                continue;
            }
        };

        if !full && is_known(&pool, &ledger, &file_hash).await? {
            stats.unchanged += 1;
            continue;
        }

        if dry_run {
            to_process += 1;
            continue;
        }

        match ingest_file(config, &pool, ocr.as_ref(), file, &file_hash).await {
            Ok(FileOutcome::Ingested {
                chunks,
                embedded,
                pending,
                ocr,
                cost,
            }) => {
                stats.ingested += 1;
                stats.chunks += chunks;
                stats.embedded += embedded;
                stats.embed_pending += pending;
                if ocr {
                    stats.ocr_used += 1;
                }
                ledger.mark_processed(&file_hash, chunks, cost);
                ledger.save_if_due(config.progress.save_every)?;
            }
            Ok(FileOutcome::TooShort) => {
                tracing::info!(path = %file.relative_path, "text too short, skipped");
                stats.too_short += 1;
            }
            Err(e) => {
                tracing::warn!(path = %file.relative_path, error = %format!("{:#}", e), "ingest failed");
                stats.failed += 1;
            }
        }
    }

    if dry_run {
        println!("ingest (dry-run)");
        println!("  files found: {}", found);
        println!("  unchanged: {}", stats.unchanged);
        println!("  to ingest: {}", to_process);
        pool.close().await;
        return Ok(());
    }

    ledger.save()?;

    println!("ingest");
    println!("  files found: {}", found);
    println!("  unchanged: {}", stats.unchanged);
    println!("  too short: {}", stats.too_short);
    println!("  ingested documents: {}", stats.ingested);
    println!("  failed: {}", stats.failed);
    println!("  chunks written: {}", stats.chunks);
    if config.ocr.is_enabled() {
        println!("  ocr used: {}", stats.ocr_used);
    }
    if config.embedding.is_enabled() {
        println!("  embeddings written: {}", stats.embedded);
        println!("  embeddings pending: {}", stats.embed_pending);
        println!("  estimated cost (all runs): ${:.4}", ledger.total_cost);
    }
    if stats.interrupted {
        println!("  interrupted: progress saved, rerun to continue");
    }
    println!("ok");

    pool.close().await;
    Ok(())
}

/// A file is known when its content hash is in the ledger or already stored,
/// whatever its path.
async fn is_known(pool: &SqlitePool, ledger: &ProgressLedger, file_hash: &str) -> Result<bool> {
    if ledger.is_processed(file_hash) {
        return Ok(true);
    }
    let stored: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE file_hash = ?")
            .bind(file_hash)
            .fetch_one(pool)
            .await?;
    Ok(stored)
}

async fn ingest_file(
    config: &Config,
    pool: &SqlitePool,
    ocr: Option<&OcrClient>,
    file: &SourceFile,
    file_hash: &str,
) -> Result<FileOutcome> {
    let bytes = Arc::new(
        std::fs::read(&file.path)
            .with_context(|| format!("Failed to read {}", file.path.display()))?,
    );

    let (mut text, mut extraction) = match extract_blocking(bytes.clone(), &file.content_type).await
    {
        Ok(t) => (t, "text"),
        Err(e) if ocr.is_some() && file.content_type == MIME_PDF => {
            tracing::debug!(path = %file.relative_path, error = %e, "text layer unreadable");
            (String::new(), "text")
        }
        Err(e) => return Err(e),
    };

    if let Some(client) = ocr {
        if file.content_type == MIME_PDF && text.trim().chars().count() < config.ocr.min_text_chars
        {
            tracing::info!(path = %file.relative_path, "running OCR");
            text = client.read_pdf(&bytes).await?;
            extraction = "ocr";
        }
    }

    let min_chars = config.scan.as_ref().map(|s| s.min_text_chars).unwrap_or(0);
    if text.trim().chars().count() < min_chars {
        return Ok(FileOutcome::TooShort);
    }

    let document = Document {
        id: String::new(),
        file_path: file.relative_path.clone(),
        file_name: file.file_name.clone(),
        file_hash: file_hash.to_string(),
        size_bytes: file.size_bytes as i64,
        content_type: file.content_type.clone(),
        category: classify::categorize_file(&file.file_name),
        language: classify::detect_language(&text)
            .code()
            .map(|c| c.to_string()),
        extraction: extraction.to_string(),
        body: text,
    };

    let doc_id = upsert_document(pool, &document, &file_metadata(file)).await?;
    let chunks = chunk_text(
        &doc_id,
        &document.body,
        config.chunking.max_tokens,
        config.chunking.overlap_tokens,
    );
    replace_chunks(pool, &doc_id, &chunks).await?;

    let (embedded, pending) = embed_cmd::embed_chunks_inline(config, pool, &chunks).await;
    let cost = if embedded > 0 {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        embedding::estimate_cost(&texts, config.embedding.price_per_1k_tokens)
    } else {
        0.0
    };

    Ok(FileOutcome::Ingested {
        chunks: chunks.len() as u64,
        embedded,
        pending,
        ocr: extraction == "ocr",
        cost,
    })
}

/// Runs the extractor on the blocking pool. A panicking PDF parser becomes a
/// per-file error instead of taking the pass down.
async fn extract_blocking(bytes: Arc<Vec<u8>>, content_type: &str) -> Result<String> {
    let ct = content_type.to_string();
    let joined = tokio::task::spawn_blocking(move || extract::extract_text(&bytes, &ct)).await;
    match joined {
        Ok(result) => Ok(result?),
        Err(e) => anyhow::bail!("extractor crashed: {}", e),
    }
}

/// Metadata kept alongside each document. String values are also used by
/// the linker as a last-resort detection source.
fn file_metadata(file: &SourceFile) -> serde_json::Value {
    let folder = file
        .relative_path
        .rsplit_once('/')
        .map(|(dir, _)| dir.to_string());
    let mut meta = serde_json::json!({
        "relative_path": file.relative_path,
        "folder": folder,
    });
    if let Some(reference) = classify::extract_unit_reference(&file.file_name) {
        meta["unit_reference"] = serde_json::Value::String(reference);
    }
    meta
}

async fn upsert_document(
    pool: &SqlitePool,
    doc: &Document,
    metadata: &serde_json::Value,
) -> Result<String> {
    let now = chrono::Utc::now().timestamp();

    let existing_id: Option<String> =
        sqlx::query_scalar("SELECT id FROM documents WHERE file_path = ?")
            .bind(&doc.file_path)
            .fetch_optional(pool)
            .await?;

    let doc_id = existing_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    sqlx::query(
        r#"
        INSERT INTO documents (id, file_path, file_name, file_hash, size_bytes, content_type, category, language, extraction, body, metadata_json, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(file_path) DO UPDATE SET
            file_name = excluded.file_name,
            file_hash = excluded.file_hash,
            size_bytes = excluded.size_bytes,
            content_type = excluded.content_type,
            category = excluded.category,
            language = excluded.language,
            extraction = excluded.extraction,
            body = excluded.body,
            metadata_json = excluded.metadata_json,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&doc_id)
    .bind(&doc.file_path)
    .bind(&doc.file_name)
    .bind(&doc.file_hash)
    .bind(doc.size_bytes)
    .bind(&doc.content_type)
    .bind(doc.category.as_str())
    .bind(&doc.language)
    .bind(&doc.extraction)
    .bind(&doc.body)
    .bind(metadata.to_string())
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(doc_id)
}

async fn replace_chunks(pool: &SqlitePool, document_id: &str, chunks: &[Chunk]) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "DELETE FROM chunk_vectors WHERE chunk_id IN (SELECT id FROM document_chunks WHERE document_id = ?)",
    )
    .bind(document_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "DELETE FROM embeddings WHERE chunk_id IN (SELECT id FROM document_chunks WHERE document_id = ?)",
    )
    .bind(document_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM document_chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for chunk in chunks {
        sqlx::query(
            "INSERT INTO document_chunks (id, document_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::tests::memory_pool;

    fn document(path: &str, body: &str) -> Document {
        Document {
            id: String::new(),
            file_path: path.to_string(),
            file_name: path.rsplit('/').next().unwrap_or(path).to_string(),
            file_hash: crate::chunk::hash_text(body),
            size_bytes: body.len() as i64,
            content_type: extract::MIME_TEXT.to_string(),
            category: classify::categorize_file(path),
            language: None,
            extraction: "text".to_string(),
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn upsert_keeps_document_id_per_path() {
        let pool = memory_pool().await;
        let meta = serde_json::json!({});
        let first = upsert_document(&pool, &document("Gare 28/bail.txt", "v1"), &meta)
            .await
            .unwrap();
        let second = upsert_document(&pool, &document("Gare 28/bail.txt", "v2"), &meta)
            .await
            .unwrap();
        assert_eq!(first, second);

        let (hash, category): (String, String) =
            sqlx::query_as("SELECT file_hash, category FROM documents WHERE id = ?")
                .bind(&first)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(hash, crate::chunk::hash_text("v2"));
        assert_eq!(category, "lease");
    }

    #[tokio::test]
    async fn replace_chunks_rewrites_fts() {
        let pool = memory_pool().await;
        let meta = serde_json::json!({});
        let id = upsert_document(&pool, &document("a/bail.txt", "x"), &meta)
            .await
            .unwrap();

        let old = chunk_text(&id, "ascenseur en panne", 250, 0);
        replace_chunks(&pool, &id, &old).await.unwrap();
        let new = chunk_text(&id, "chauffage révisé\n\nfacture jointe", 3, 0);
        replace_chunks(&pool, &id, &new).await.unwrap();

        let chunks: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks WHERE document_id = ?")
                .bind(&id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(chunks, new.len() as i64);

        let stale: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts WHERE chunks_fts MATCH 'ascenseur'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(stale, 0);
    }

    #[test]
    fn metadata_carries_folder_and_reference() {
        let file = SourceFile {
            path: "/data/Gare 28/Baux/Bail 60530.01.000214.pdf".into(),
            relative_path: "Gare 28/Baux/Bail 60530.01.000214.pdf".to_string(),
            file_name: "Bail 60530.01.000214.pdf".to_string(),
            size_bytes: 10,
            content_type: MIME_PDF.to_string(),
        };
        let meta = file_metadata(&file);
        assert_eq!(meta["folder"], "Gare 28/Baux");
        assert_eq!(meta["unit_reference"], "60530.01.000214");
    }
}
