use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub scan: Option<ScanConfig>,
    #[serde(default)]
    pub linking: LinkingConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub properties: Vec<PropertyConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_max_tokens() -> usize {
    250
}
fn default_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_keyword: i64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_vector: i64,
    #[serde(default = "default_final_limit")]
    pub final_limit: i64,
    /// Semantic candidates below this cosine similarity are dropped.
    #[serde(default)]
    pub min_similarity: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            candidate_k_keyword: default_candidate_k(),
            candidate_k_vector: default_candidate_k(),
            final_limit: default_final_limit(),
            min_similarity: 0.0,
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_candidate_k() -> i64 {
    80
}
fn default_final_limit() -> i64 {
    12
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// First retry delay; doubles on each further attempt.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Pause between two API calls, keeps bulk runs under the provider's rate limit.
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    /// Inputs longer than this are truncated before being sent.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    /// Base URL of an OpenAI-compatible API. `OPENAI_BASE_URL` takes precedence.
    #[serde(default)]
    pub api_base: Option<String>,
    /// USD per 1k tokens, used for the cost estimate printed in reports.
    #[serde(default = "default_price_per_1k")]
    pub price_per_1k_tokens: f64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            retry_base_ms: default_retry_base_ms(),
            request_delay_ms: default_request_delay_ms(),
            max_input_chars: default_max_input_chars(),
            api_base: None,
            price_per_1k_tokens: default_price_per_1k(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_request_delay_ms() -> u64 {
    50
}
fn default_max_input_chars() -> usize {
    8000
}
fn default_price_per_1k() -> f64 {
    0.00002
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// PDFs whose embedded text is shorter than this are sent to OCR.
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    #[serde(default = "default_ocr_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            endpoint: None,
            min_text_chars: default_min_text_chars(),
            poll_interval_ms: default_poll_interval_ms(),
            max_polls: default_max_polls(),
            timeout_secs: default_ocr_timeout_secs(),
        }
    }
}

impl OcrConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_min_text_chars() -> usize {
    100
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_max_polls() -> u32 {
    60
}
fn default_ocr_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// A file is kept only if its path contains one of these (case-insensitive).
    /// An empty list keeps every file.
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,
    #[serde(default = "default_min_size_bytes")]
    pub min_size_bytes: u64,
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
    /// Extracted texts shorter than this are not worth indexing.
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

fn default_extensions() -> Vec<String> {
    ["pdf", "docx", "xlsx"].iter().map(|s| s.to_string()).collect()
}

fn default_keywords() -> Vec<String> {
    [
        "bail",
        "baux",
        "lease",
        "contrat",
        "assurance",
        "police",
        "insurance",
        "maintenance",
        "entretien",
        "sinistre",
        "litige",
        "incident",
        "facture",
        "invoice",
        "compte",
        "resultat",
        "financier",
        "servitude",
        "registre",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_min_size_bytes() -> u64 {
    5_000
}
fn default_max_size_bytes() -> u64 {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct LinkingConfig {
    /// Minimum detection score required to link a chunk to a property.
    #[serde(default = "default_min_score")]
    pub min_score: u32,
    #[serde(default = "default_link_batch")]
    pub batch_size: usize,
    #[serde(default)]
    pub weights: RuleWeights,
}

impl Default for LinkingConfig {
    fn default() -> Self {
        Self {
            min_score: default_min_score(),
            batch_size: default_link_batch(),
            weights: RuleWeights::default(),
        }
    }
}

fn default_min_score() -> u32 {
    10
}
fn default_link_batch() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuleWeights {
    #[serde(default = "default_strong")]
    pub strong: u32,
    #[serde(default = "default_medium")]
    pub medium: u32,
    #[serde(default = "default_weak")]
    pub weak: u32,
}

impl Default for RuleWeights {
    fn default() -> Self {
        Self {
            strong: default_strong(),
            medium: default_medium(),
            weak: default_weak(),
        }
    }
}

fn default_strong() -> u32 {
    10
}
fn default_medium() -> u32 {
    5
}
fn default_weak() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProgressConfig {
    /// JSON ledger of processed files. Defaults to `<db dir>/ingest_progress.json`.
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
    #[serde(default = "default_save_every")]
    pub save_every: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            ledger_path: None,
            save_every: default_save_every(),
        }
    }
}

fn default_save_every() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct PropertyConfig {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub purchase_price: Option<f64>,
    #[serde(default)]
    pub mortgage_amount: Option<f64>,
    #[serde(default)]
    pub construction_year: Option<i64>,
    #[serde(default)]
    pub rules: DetectionRules,
}

/// Regex patterns scored against lowercased text, grouped by confidence tier.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DetectionRules {
    #[serde(default)]
    pub strong: Vec<String>,
    #[serde(default)]
    pub medium: Vec<String>,
    #[serde(default)]
    pub weak: Vec<String>,
}

impl DetectionRules {
    pub fn is_empty(&self) -> bool {
        self.strong.is_empty() && self.medium.is_empty() && self.weak.is_empty()
    }
}

impl Config {
    /// A config with every optional section at its defaults. Used by tests
    /// and by commands that only need a database path.
    pub fn minimal(db_path: &Path) -> Self {
        Self {
            db: DbConfig {
                path: db_path.to_path_buf(),
            },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            ocr: OcrConfig::default(),
            scan: None,
            linking: LinkingConfig::default(),
            progress: ProgressConfig::default(),
            properties: Vec::new(),
        }
    }

    pub fn ledger_path(&self) -> PathBuf {
        match &self.progress.ledger_path {
            Some(p) => p.clone(),
            None => self
                .db
                .path
                .parent()
                .map(|p| p.join("ingest_progress.json"))
                .unwrap_or_else(|| PathBuf::from("ingest_progress.json")),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }

    // Retrieval
    if config.retrieval.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        anyhow::bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.min_similarity) {
        anyhow::bail!("retrieval.min_similarity must be in [-1.0, 1.0]");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
    }

    // OCR
    match config.ocr.provider.as_str() {
        "disabled" => {}
        "azure" => {
            if config.ocr.endpoint.is_none() {
                anyhow::bail!("ocr.endpoint must be set when provider is 'azure'");
            }
        }
        other => anyhow::bail!(
            "Unknown OCR provider: '{}'. Must be disabled or azure.",
            other
        ),
    }

    // Linking
    if config.linking.min_score == 0 {
        anyhow::bail!("linking.min_score must be > 0");
    }
    if config.linking.batch_size == 0 {
        anyhow::bail!("linking.batch_size must be > 0");
    }
    if config.progress.save_every == 0 {
        anyhow::bail!("progress.save_every must be > 0");
    }

    // Properties
    let mut seen = HashSet::new();
    for prop in &config.properties {
        let name = prop.name.trim();
        if name.is_empty() {
            anyhow::bail!("properties: name must not be empty");
        }
        if !seen.insert(name.to_lowercase()) {
            anyhow::bail!("properties: duplicate property name '{}'", name);
        }
        for pattern in prop
            .rules
            .strong
            .iter()
            .chain(&prop.rules.medium)
            .chain(&prop.rules.weak)
        {
            regex::Regex::new(pattern).with_context(|| {
                format!("properties.{}: invalid detection pattern '{}'", name, pattern)
            })?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_file_gets_defaults() {
        let cfg = parse("[db]\npath = \"./data/estate.sqlite\"\n").unwrap();
        assert_eq!(cfg.chunking.max_tokens, 250);
        assert_eq!(cfg.linking.min_score, 10);
        assert_eq!(cfg.linking.weights.strong, 10);
        assert!(!cfg.embedding.is_enabled());
        assert!(!cfg.ocr.is_enabled());
        assert!(cfg.scan.is_none());
        assert_eq!(
            cfg.ledger_path(),
            PathBuf::from("./data/ingest_progress.json")
        );
    }

    #[test]
    fn rejects_overlap_larger_than_chunk() {
        let err = parse(
            "[db]\npath = \"x.sqlite\"\n[chunking]\nmax_tokens = 10\noverlap_tokens = 10\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("overlap_tokens"));
    }

    #[test]
    fn openai_requires_model_and_dims() {
        let err = parse("[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"openai\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn azure_ocr_requires_endpoint() {
        let err = parse("[db]\npath = \"x.sqlite\"\n[ocr]\nprovider = \"azure\"\n").unwrap_err();
        assert!(err.to_string().contains("ocr.endpoint"));
    }

    #[test]
    fn rejects_duplicate_property_names() {
        let src = r#"
[db]
path = "x.sqlite"

[[properties]]
name = "Banque 4"

[[properties]]
name = "banque 4"
"#;
        let err = parse(src).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_invalid_detection_pattern() {
        let src = r#"
[db]
path = "x.sqlite"

[[properties]]
name = "Banque 4"
rules = { strong = ["banque\\s*(4"] }
"#;
        let err = parse(src).unwrap_err();
        assert!(format!("{:#}", err).contains("invalid detection pattern"));
    }

    #[test]
    fn parses_property_rules() {
        let src = r#"
[db]
path = "x.sqlite"

[[properties]]
name = "Gare 28"
city = "Martigny"

[properties.rules]
strong = ['gare\s*28']
medium = ['1920\s+martigny']
weak = ['gare.*martigny']
"#;
        let cfg = parse(src).unwrap();
        assert_eq!(cfg.properties.len(), 1);
        assert_eq!(cfg.properties[0].rules.strong, vec![r"gare\s*28".to_string()]);
        assert_eq!(cfg.properties[0].city.as_deref(), Some("Martigny"));
    }

    #[test]
    fn example_config_is_valid() {
        let cfg = parse(include_str!("../config/estate.example.toml")).unwrap();
        assert_eq!(cfg.properties.len(), 2);
        assert_eq!(cfg.linking.weights.medium, 5);
        assert!(cfg.scan.is_some());
    }
}
