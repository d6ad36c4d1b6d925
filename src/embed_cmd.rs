use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use std::time::Duration;

use crate::chunk::hash_text;
use crate::config::Config;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::models::Chunk;
use crate::progress::InterruptFlag;

struct PendingChunk {
    chunk_id: String,
    document_id: String,
    text: String,
    text_hash: String,
}

#[derive(Default)]
struct BatchOutcome {
    embedded: u64,
    failed: u64,
    cost: f64,
    interrupted: bool,
}

/// Find and embed chunks that are missing or have stale embeddings.
pub async fn run_embed_pending(
    config: &Config,
    limit: Option<usize>,
    batch_size_override: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let pool = db::connect(config).await?;
    let pending = find_pending_chunks(&pool, provider.model_name(), limit).await?;

    if dry_run {
        let texts: Vec<String> = pending.iter().map(|p| p.text.clone()).collect();
        println!("embed pending (dry-run)");
        println!("  chunks needing embeddings: {}", pending.len());
        println!(
            "  estimated cost: ${:.4}",
            embedding::estimate_cost(&texts, config.embedding.price_per_1k_tokens)
        );
        pool.close().await;
        return Ok(());
    }

    if pending.is_empty() {
        println!("embed pending");
        println!("  all chunks up to date");
        pool.close().await;
        return Ok(());
    }

    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);
    let interrupt = InterruptFlag::install();
    let outcome = embed_batches(config, &pool, provider.as_ref(), &pending, batch_size, &interrupt).await?;

    println!("embed pending");
    println!("  total pending: {}", pending.len());
    println!("  embedded: {}", outcome.embedded);
    println!("  failed: {}", outcome.failed);
    println!("  estimated cost: ${:.4}", outcome.cost);
    if outcome.interrupted {
        println!("  interrupted: rerun to continue");
    }

    pool.close().await;
    Ok(())
}

/// Delete all embeddings and regenerate for all chunks.
pub async fn run_embed_rebuild(config: &Config, batch_size_override: Option<usize>) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let pool = db::connect(config).await?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM chunk_vectors")
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM embeddings").execute(&mut *tx).await?;
    tx.commit().await?;
    tracing::info!("cleared existing embeddings");

    let all_chunks = find_pending_chunks(&pool, provider.model_name(), None).await?;
    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);
    let interrupt = InterruptFlag::install();
    let outcome =
        embed_batches(config, &pool, provider.as_ref(), &all_chunks, batch_size, &interrupt).await?;

    println!("embed rebuild");
    println!("  total chunks: {}", all_chunks.len());
    println!("  embedded: {}", outcome.embedded);
    println!("  failed: {}", outcome.failed);
    println!("  estimated cost: ${:.4}", outcome.cost);
    if outcome.interrupted {
        println!("  interrupted: run `estate embed pending` to continue");
    }

    pool.close().await;
    Ok(())
}

/// Embeds `items` batch by batch, sleeping `request_delay_ms` between API
/// calls. A failed batch is counted and skipped.
async fn embed_batches(
    config: &Config,
    pool: &SqlitePool,
    provider: &dyn EmbeddingProvider,
    items: &[PendingChunk],
    batch_size: usize,
    interrupt: &InterruptFlag,
) -> Result<BatchOutcome> {
    let mut outcome = BatchOutcome::default();
    let delay = Duration::from_millis(config.embedding.request_delay_ms);

    for (i, batch) in items.chunks(batch_size.max(1)).enumerate() {
        if interrupt.is_set() {
            outcome.interrupted = true;
            break;
        }
        if i > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
        match embedding::embed_texts(provider, &config.embedding, &texts).await {
            Ok(vectors) => {
                for (item, vec) in batch.iter().zip(vectors.iter()) {
                    upsert_embedding(
                        pool,
                        &item.chunk_id,
                        &item.document_id,
                        provider.model_name(),
                        provider.dims(),
                        &item.text_hash,
                        &embedding::vec_to_blob(vec),
                    )
                    .await?;
                    outcome.embedded += 1;
                }
                outcome.cost +=
                    embedding::estimate_cost(&texts, config.embedding.price_per_1k_tokens);
            }
            Err(e) => {
                tracing::warn!(error = %e, size = batch.len(), "embedding batch failed");
                outcome.failed += batch.len() as u64;
            }
        }
    }

    Ok(outcome)
}

/// Embed freshly written chunks during ingest. Non-fatal on failure.
/// Returns `(embedded, pending)`.
pub async fn embed_chunks_inline(config: &Config, pool: &SqlitePool, chunks: &[Chunk]) -> (u64, u64) {
    if !config.embedding.is_enabled() || chunks.is_empty() {
        return (0, 0);
    }

    let provider = match embedding::create_provider(&config.embedding) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "could not create embedding provider");
            return (0, chunks.len() as u64);
        }
    };

    let mut embedded = 0u64;
    let mut pending = 0u64;

    for batch in chunks.chunks(config.embedding.batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();

        match embedding::embed_texts(provider.as_ref(), &config.embedding, &texts).await {
            Ok(vectors) => {
                for (chunk, vec) in batch.iter().zip(vectors.iter()) {
                    if let Err(e) = upsert_embedding(
                        pool,
                        &chunk.id,
                        &chunk.document_id,
                        provider.model_name(),
                        provider.dims(),
                        &chunk.hash,
                        &embedding::vec_to_blob(vec),
                    )
                    .await
                    {
                        tracing::warn!(chunk = %chunk.id, error = %e, "failed to store embedding");
                        pending += 1;
                    } else {
                        embedded += 1;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "inline embedding failed, chunks left pending");
                pending += batch.len() as u64;
            }
        }
    }

    (embedded, pending)
}

async fn find_pending_chunks(
    pool: &SqlitePool,
    model: &str,
    limit: Option<usize>,
) -> Result<Vec<PendingChunk>> {
    let limit_val = limit.map(|l| l as i64).unwrap_or(-1);

    // Chunks that either have no embedding, a stale hash, or another model's vector
    let rows = sqlx::query(
        r#"
        SELECT c.id AS chunk_id, c.document_id, c.text
        FROM document_chunks c
        LEFT JOIN embeddings e ON e.chunk_id = c.id AND e.model = ?
        WHERE e.chunk_id IS NULL OR e.hash != c.hash
        ORDER BY c.document_id, c.chunk_index
        LIMIT ?
        "#,
    )
    .bind(model)
    .bind(limit_val)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let text: String = row.get("text");
            let text_hash = hash_text(&text);
            PendingChunk {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                text,
                text_hash,
            }
        })
        .collect())
}

async fn upsert_embedding(
    pool: &SqlitePool,
    chunk_id: &str,
    document_id: &str,
    model: &str,
    dims: usize,
    text_hash: &str,
    blob: &[u8],
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO embeddings (chunk_id, model, dims, created_at, hash)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            model = excluded.model,
            dims = excluded.dims,
            created_at = excluded.created_at,
            hash = excluded.hash
        "#,
    )
    .bind(chunk_id)
    .bind(model)
    .bind(dims as i64)
    .bind(now)
    .bind(text_hash)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO chunk_vectors (chunk_id, document_id, embedding)
        VALUES (?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            document_id = excluded.document_id,
            embedding = excluded.embedding
        "#,
    )
    .bind(chunk_id)
    .bind(document_id)
    .bind(blob)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
