//! Keyword, semantic and hybrid search over document chunks.
//!
//! Keyword candidates come from FTS5 (`bm25` rank, negated so higher is
//! better), semantic candidates from cosine similarity against every stored
//! vector. Each channel is min-max normalised to `[0, 1]` and merged as
//! `(1 - alpha) * keyword + alpha * vector`. Chunks are grouped per document
//! by their best score.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::migrate;
use crate::models::DocumentCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Keyword,
    Semantic,
    Hybrid,
}

impl SearchMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "keyword" => Ok(SearchMode::Keyword),
            "semantic" => Ok(SearchMode::Semantic),
            "hybrid" => Ok(SearchMode::Hybrid),
            _ => bail!(
                "Unknown search mode: {}. Use keyword, semantic, or hybrid.",
                s
            ),
        }
    }

    fn alpha(&self, hybrid_alpha: f64) -> f64 {
        match self {
            SearchMode::Keyword => 0.0,
            SearchMode::Semantic => 1.0,
            SearchMode::Hybrid => hybrid_alpha,
        }
    }

    fn uses_keyword(&self) -> bool {
        matches!(self, SearchMode::Keyword | SearchMode::Hybrid)
    }

    fn uses_vectors(&self) -> bool {
        matches!(self, SearchMode::Semantic | SearchMode::Hybrid)
    }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub mode: SearchMode,
    pub limit: Option<i64>,
    pub property: Option<String>,
    pub category: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            mode: SearchMode::Keyword,
            limit: None,
            property: None,
            category: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub document_id: String,
    pub file_path: String,
    pub file_name: String,
    pub category: String,
    pub property: Option<String>,
    pub score: f64,
    pub snippet: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
struct ChunkCandidate {
    chunk_id: String,
    document_id: String,
    raw_score: f64,
    snippet: String,
}

struct ScoredChunk {
    document_id: String,
    score: f64,
    snippet: String,
}

/// Resolved filters, bound as parameters in both candidate queries.
struct Filters {
    property_id: Option<String>,
    category: Option<String>,
}

pub async fn search_documents(
    config: &Config,
    query: &str,
    opts: &SearchOptions,
) -> Result<Vec<SearchHit>> {
    if opts.mode.uses_vectors() && !config.embedding.is_enabled() {
        bail!(
            "Semantic and hybrid search require embeddings. Set [embedding] provider in config."
        );
    }
    let pool = db::connect_read_only(config).await?;
    let hits = search_with_pool(&pool, config, query, opts).await;
    pool.close().await;
    hits
}

pub async fn search_with_pool(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    opts: &SearchOptions,
) -> Result<Vec<SearchHit>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let property_id = match &opts.property {
        Some(name) => match migrate::property_id_by_name(pool, name).await? {
            Some(id) => Some(id),
            None => bail!("Unknown property: {}", name),
        },
        None => None,
    };
    let category = match &opts.category {
        Some(c) => match DocumentCategory::parse(c) {
            Some(cat) => Some(cat.as_str().to_string()),
            None => bail!("Unknown category: {}", c),
        },
        None => None,
    };
    let filters = Filters {
        property_id,
        category,
    };

    let keyword = if opts.mode.uses_keyword() {
        match fts_query(query) {
            Some(q) => {
                fetch_keyword_candidates(pool, &q, &filters, config.retrieval.candidate_k_keyword)
                    .await?
            }
            None => Vec::new(),
        }
    } else {
        Vec::new()
    };

    let vector = if opts.mode.uses_vectors() {
        fetch_vector_candidates(pool, config, query, &filters).await?
    } else {
        Vec::new()
    };

    if keyword.is_empty() && vector.is_empty() {
        return Ok(Vec::new());
    }

    let scored = merge_scores(
        &keyword,
        &vector,
        opts.mode.alpha(config.retrieval.hybrid_alpha),
    );

    // Group by document, keeping the best chunk
    let mut by_doc: HashMap<String, ScoredChunk> = HashMap::new();
    for sc in scored {
        match by_doc.get(&sc.document_id) {
            Some(existing) if existing.score >= sc.score => {}
            _ => {
                by_doc.insert(sc.document_id.clone(), sc);
            }
        }
    }

    let mut hits = Vec::with_capacity(by_doc.len());
    for (doc_id, best) in by_doc {
        let row = sqlx::query(
            r#"
            SELECT d.id, d.file_path, d.file_name, d.category, d.updated_at, p.name AS property
            FROM documents d
            LEFT JOIN properties p ON p.id = d.property_id
            WHERE d.id = ?
            "#,
        )
        .bind(&doc_id)
        .fetch_optional(pool)
        .await?;

        if let Some(row) = row {
            hits.push(SearchHit {
                document_id: row.get("id"),
                file_path: row.get("file_path"),
                file_name: row.get("file_name"),
                category: row.get("category"),
                property: row.get("property"),
                score: best.score,
                snippet: best.snippet,
                updated_at: row.get("updated_at"),
            });
        }
    }

    // score desc, updated_at desc, id asc
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.updated_at.cmp(&a.updated_at))
            .then(a.document_id.cmp(&b.document_id))
    });
    let limit = opts.limit.unwrap_or(config.retrieval.final_limit).max(0) as usize;
    hits.truncate(limit);

    Ok(hits)
}

pub async fn run_search(config: &Config, query: &str, opts: &SearchOptions, json: bool) -> Result<()> {
    let hits = search_documents(config, query, opts).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} ({}{})",
            i + 1,
            hit.score,
            hit.file_name,
            hit.category,
            hit.property
                .as_deref()
                .map(|p| format!(", {}", p))
                .unwrap_or_default()
        );
        println!("    path: {}", hit.file_path);
        println!("    excerpt: \"{}\"", hit.snippet.replace('\n', " ").trim());
        println!("    id: {}", hit.document_id);
        println!();
    }

    Ok(())
}

/// Turns free text into an FTS5 expression: every word quoted, implicitly
/// ANDed. Punctuation such as apostrophes would otherwise be a syntax error.
fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" "))
}

async fn fetch_keyword_candidates(
    pool: &SqlitePool,
    fts: &str,
    filters: &Filters,
    candidate_k: i64,
) -> Result<Vec<ChunkCandidate>> {
    let rows = sqlx::query(
        r#"
        SELECT chunks_fts.chunk_id, chunks_fts.document_id, chunks_fts.rank AS rank,
               snippet(chunks_fts, 2, '>>>', '<<<', '...', 48) AS snippet
        FROM chunks_fts
        JOIN document_chunks c ON c.id = chunks_fts.chunk_id
        JOIN documents d ON d.id = c.document_id
        WHERE chunks_fts MATCH ?1
          AND (?2 IS NULL OR COALESCE(c.property_id, d.property_id) = ?2)
          AND (?3 IS NULL OR d.category = ?3)
        ORDER BY chunks_fts.rank
        LIMIT ?4
        "#,
    )
    .bind(fts)
    .bind(&filters.property_id)
    .bind(&filters.category)
    .bind(candidate_k)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            ChunkCandidate {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                raw_score: -rank,
                snippet: row.get("snippet"),
            }
        })
        .collect())
}

async fn fetch_vector_candidates(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    filters: &Filters,
) -> Result<Vec<ChunkCandidate>> {
    let provider = embedding::create_provider(&config.embedding)?;
    let query_vec = embedding::embed_query(provider.as_ref(), &config.embedding, query).await?;

    let rows = sqlx::query(
        r#"
        SELECT cv.chunk_id, cv.document_id, cv.embedding,
               COALESCE(substr(c.text, 1, 240), '') AS snippet
        FROM chunk_vectors cv
        JOIN document_chunks c ON c.id = cv.chunk_id
        JOIN documents d ON d.id = c.document_id
        WHERE (?1 IS NULL OR COALESCE(c.property_id, d.property_id) = ?1)
          AND (?2 IS NULL OR d.category = ?2)
        "#,
    )
    .bind(&filters.property_id)
    .bind(&filters.category)
    .fetch_all(pool)
    .await?;

    let min_similarity = config.retrieval.min_similarity;
    let mut candidates: Vec<ChunkCandidate> = rows
        .iter()
        .filter_map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let similarity =
                embedding::cosine_similarity(&query_vec, &embedding::blob_to_vec(&blob)) as f64;
            (similarity >= min_similarity).then(|| ChunkCandidate {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                raw_score: similarity,
                snippet: row.get("snippet"),
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(config.retrieval.candidate_k_vector.max(0) as usize);

    Ok(candidates)
}

/// Min-max normalize scores to [0, 1]. A single candidate, or all-equal
/// scores, normalise to 1.0.
fn normalize_scores(candidates: &[ChunkCandidate]) -> Vec<(&ChunkCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

/// Weighted merge of both channels; a chunk missing from one channel scores
/// 0 there. Sorted by score desc, then chunk id.
fn merge_scores(
    keyword: &[ChunkCandidate],
    vector: &[ChunkCandidate],
    alpha: f64,
) -> Vec<ScoredChunk> {
    let kw_map: HashMap<&str, f64> = normalize_scores(keyword)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();
    let vec_map: HashMap<&str, f64> = normalize_scores(vector)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();

    // keyword snippets carry highlighting, so they win
    let mut all: HashMap<&str, &ChunkCandidate> = HashMap::new();
    for c in keyword.iter().chain(vector.iter()) {
        all.entry(c.chunk_id.as_str()).or_insert(c);
    }

    let mut scored: Vec<(&str, ScoredChunk)> = all
        .into_iter()
        .map(|(id, cand)| {
            let k = kw_map.get(id).copied().unwrap_or(0.0);
            let v = vec_map.get(id).copied().unwrap_or(0.0);
            (
                id,
                ScoredChunk {
                    document_id: cand.document_id.clone(),
                    score: (1.0 - alpha) * k + alpha * v,
                    snippet: cand.snippet.clone(),
                },
            )
        })
        .collect();

    scored.sort_by(|(a_id, a), (b_id, b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a_id.cmp(b_id))
    });
    scored.into_iter().map(|(_, s)| s).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::tests::{memory_pool, property};
    use std::path::Path;

    fn make_candidate(chunk_id: &str, doc_id: &str, score: f64) -> ChunkCandidate {
        ChunkCandidate {
            chunk_id: chunk_id.to_string(),
            document_id: doc_id.to_string(),
            raw_score: score,
            snippet: String::new(),
        }
    }

    fn order(scored: &[ScoredChunk]) -> Vec<&str> {
        scored.iter().map(|s| s.document_id.as_str()).collect()
    }

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_normalize_single() {
        let candidates = vec![make_candidate("c1", "d1", 5.0)];
        let result = normalize_scores(&candidates);
        assert_eq!(result.len(), 1);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_range() {
        let candidates = vec![
            make_candidate("c1", "d1", 10.0),
            make_candidate("c2", "d2", 5.0),
            make_candidate("c3", "d3", 0.0),
        ];
        let result = normalize_scores(&candidates);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
        assert!((result[1].1 - 0.5).abs() < 1e-9);
        assert!(result[2].1.abs() < 1e-9);
    }

    #[test]
    fn test_scores_always_in_unit() {
        let candidates = vec![
            make_candidate("c1", "d1", -5.0),
            make_candidate("c2", "d2", 100.0),
            make_candidate("c3", "d3", 42.0),
        ];
        for (_, score) in normalize_scores(&candidates) {
            assert!((0.0..=1.0).contains(&score), "Score out of range: {}", score);
        }
    }

    #[test]
    fn alpha_zero_keeps_keyword_order() {
        let kw = vec![
            make_candidate("c1", "d1", 10.0),
            make_candidate("c2", "d2", 5.0),
            make_candidate("c3", "d3", 1.0),
        ];
        let vec_cands = vec![
            make_candidate("c1", "d1", 0.1),
            make_candidate("c2", "d2", 0.9),
        ];
        let merged = merge_scores(&kw, &vec_cands, 0.0);
        assert_eq!(order(&merged), vec!["d1", "d2", "d3"]);
    }

    #[test]
    fn alpha_one_keeps_vector_order() {
        let kw = vec![
            make_candidate("c1", "d1", 10.0),
            make_candidate("c2", "d2", 5.0),
        ];
        let vec_cands = vec![
            make_candidate("c1", "d1", 0.1),
            make_candidate("c2", "d2", 0.9),
            make_candidate("c3", "d3", 0.5),
        ];
        let merged = merge_scores(&kw, &vec_cands, 1.0);
        assert_eq!(&order(&merged)[..3], &["d2", "d3", "d1"]);
    }

    #[test]
    fn hybrid_blends_both_channels() {
        let kw = vec![
            make_candidate("c1", "d1", 3.0),
            make_candidate("c2", "d2", 1.0),
        ];
        let vec_cands = vec![
            make_candidate("c2", "d2", 0.9),
            make_candidate("c1", "d1", 0.2),
        ];
        let merged = merge_scores(&kw, &vec_cands, 0.6);
        // d1: 0.4 * 1 + 0.6 * 0 = 0.4, d2: 0.4 * 0 + 0.6 * 1 = 0.6
        assert_eq!(order(&merged), vec!["d2", "d1"]);
        assert!((merged[0].score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn fts_query_quotes_terms() {
        assert_eq!(
            fts_query("dégât d'eau").as_deref(),
            Some("\"dégât\" \"d\" \"eau\"")
        );
        assert_eq!(fts_query("  ?! "), None);
    }

    async fn seed(pool: &SqlitePool) {
        crate::migrate::seed_properties(pool, &[property("Gare 28"), property("Banque 4")])
            .await
            .unwrap();
        let gare = crate::migrate::property_id_by_name(pool, "Gare 28").await.unwrap();
        let docs = [
            ("d1", "Gare 28/bail.pdf", "lease", gare.clone(), "Bail à loyer pour l'appartement, loyer mensuel 1500 CHF"),
            ("d2", "Gare 28/police.pdf", "insurance", gare, "Police d'assurance incendie, dégât d'eau couvert"),
            ("d3", "Banque 4/bail.pdf", "lease", None, "Bail commercial, loyer annuel indexé"),
        ];
        for (id, path, category, prop, text) in docs {
            sqlx::query(
                "INSERT INTO documents (id, file_path, file_name, file_hash, content_type, category, body, property_id, created_at, updated_at) VALUES (?, ?, ?, ?, 'application/pdf', ?, ?, ?, 0, 0)",
            )
            .bind(id)
            .bind(path)
            .bind(Path::new(path).file_name().unwrap().to_string_lossy().to_string())
            .bind(id)
            .bind(category)
            .bind(text)
            .bind(&prop)
            .execute(pool)
            .await
            .unwrap();
            let chunk = format!("{}-0", id);
            sqlx::query("INSERT INTO document_chunks (id, document_id, chunk_index, text, hash) VALUES (?, ?, 0, ?, '')")
                .bind(&chunk)
                .bind(id)
                .bind(text)
                .execute(pool)
                .await
                .unwrap();
            sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
                .bind(&chunk)
                .bind(id)
                .bind(text)
                .execute(pool)
                .await
                .unwrap();
        }
    }

    fn config() -> Config {
        Config::minimal(Path::new("unused.sqlite"))
    }

    #[tokio::test]
    async fn keyword_search_with_filters() {
        let pool = memory_pool().await;
        seed(&pool).await;
        let config = config();

        let all = search_with_pool(&pool, &config, "loyer", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].snippet.contains(">>>"));

        let opts = SearchOptions {
            property: Some("gare 28".to_string()),
            ..SearchOptions::default()
        };
        let gare = search_with_pool(&pool, &config, "loyer", &opts).await.unwrap();
        assert_eq!(gare.len(), 1);
        assert_eq!(gare[0].document_id, "d1");
        assert_eq!(gare[0].property.as_deref(), Some("Gare 28"));

        let opts = SearchOptions {
            category: Some("insurance".to_string()),
            ..SearchOptions::default()
        };
        let ins = search_with_pool(&pool, &config, "dégât d'eau", &opts).await.unwrap();
        assert_eq!(ins.len(), 1);
        assert_eq!(ins[0].category, "insurance");
    }

    #[tokio::test]
    async fn unknown_filters_are_errors() {
        let pool = memory_pool().await;
        seed(&pool).await;
        let opts = SearchOptions {
            property: Some("Nowhere 1".to_string()),
            ..SearchOptions::default()
        };
        let err = search_with_pool(&pool, &config(), "bail", &opts).await.unwrap_err();
        assert!(err.to_string().contains("Unknown property"));
    }

    #[tokio::test]
    async fn empty_query_returns_nothing() {
        let pool = memory_pool().await;
        let hits = search_with_pool(&pool, &config(), "   ", &SearchOptions::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
