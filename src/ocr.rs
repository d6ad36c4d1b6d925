//! OCR for scanned PDFs through Azure Document Intelligence.
//!
//! The `prebuilt-read` model is asynchronous: the document is POSTed to
//! `…/prebuilt-read:analyze`, the service answers `202 Accepted` with an
//! `Operation-Location` header, and that URL is polled until the status is
//! `succeeded` or `failed`.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::config::OcrConfig;

const API_VERSION: &str = "2023-07-31";
const KEY_ENV: &str = "AZURE_DOC_INTELLIGENCE_KEY";

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("{0} environment variable not set")]
    MissingKey(&'static str),
    #[error("OCR endpoint not configured")]
    MissingEndpoint,
    #[error("OCR request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("OCR service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("OCR response has no Operation-Location header")]
    MissingOperation,
    #[error("OCR analysis failed: {0}")]
    Failed(String),
    #[error("OCR analysis still running after {0} polls")]
    Timeout(u32),
    #[error("invalid OCR response: {0}")]
    Parse(String),
}

pub struct OcrClient {
    endpoint: String,
    key: String,
    http: reqwest::Client,
    poll_interval: Duration,
    max_polls: u32,
}

impl OcrClient {
    pub fn from_config(config: &OcrConfig) -> Result<Self, OcrError> {
        let endpoint = config.endpoint.as_deref().ok_or(OcrError::MissingEndpoint)?;
        let key = std::env::var(KEY_ENV).map_err(|_| OcrError::MissingKey(KEY_ENV))?;
        Self::new(endpoint, key, config)
    }

    pub fn new(endpoint: &str, key: String, config: &OcrConfig) -> Result<Self, OcrError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            key,
            http,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_polls: config.max_polls,
        })
    }

    /// Runs the read model over a PDF and returns its text, one line per
    /// recognized line.
    pub async fn read_pdf(&self, bytes: &[u8]) -> Result<String, OcrError> {
        let url = format!(
            "{}/formrecognizer/documentModels/prebuilt-read:analyze?api-version={}",
            self.endpoint, API_VERSION
        );
        let resp = self
            .http
            .post(&url)
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .header("Content-Type", "application/pdf")
            .body(bytes.to_vec())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(OcrError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let operation = resp
            .headers()
            .get("Operation-Location")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or(OcrError::MissingOperation)?;

        for poll in 0..self.max_polls {
            if poll > 0 {
                tokio::time::sleep(self.poll_interval).await;
            }
            let resp = self
                .http
                .get(&operation)
                .header("Ocp-Apim-Subscription-Key", &self.key)
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(OcrError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            let json: serde_json::Value = resp.json().await?;
            match json.get("status").and_then(|s| s.as_str()) {
                Some("succeeded") => return parse_analyze_result(&json),
                Some("failed") => {
                    let message = json
                        .pointer("/error/message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("unknown error")
                        .to_string();
                    return Err(OcrError::Failed(message));
                }
                other => {
                    tracing::debug!(poll, status = ?other, "OCR analysis pending");
                }
            }
        }

        Err(OcrError::Timeout(self.max_polls))
    }
}

#[derive(Deserialize)]
struct AnalyzeResponse {
    #[serde(rename = "analyzeResult")]
    analyze_result: Option<AnalyzeResult>,
}

#[derive(Deserialize)]
struct AnalyzeResult {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    pages: Vec<Page>,
}

#[derive(Deserialize)]
struct Page {
    #[serde(default)]
    lines: Vec<Line>,
}

#[derive(Deserialize)]
struct Line {
    content: String,
}

/// Text of a finished analysis: page lines joined with `\n`, pages separated
/// by a blank line. Falls back to the flat `content` field when the response
/// carries no page structure.
pub fn parse_analyze_result(json: &serde_json::Value) -> Result<String, OcrError> {
    let resp: AnalyzeResponse =
        serde_json::from_value(json.clone()).map_err(|e| OcrError::Parse(e.to_string()))?;
    let result = resp
        .analyze_result
        .ok_or_else(|| OcrError::Parse("missing analyzeResult".to_string()))?;

    if result.pages.iter().any(|p| !p.lines.is_empty()) {
        let pages: Vec<String> = result
            .pages
            .iter()
            .map(|p| {
                p.lines
                    .iter()
                    .map(|l| l.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .filter(|p| !p.is_empty())
            .collect();
        return Ok(pages.join("\n\n"));
    }

    Ok(result.content.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn joins_lines_and_pages() {
        let json = json!({
            "status": "succeeded",
            "analyzeResult": {
                "content": "ignored",
                "pages": [
                    {"lines": [{"content": "BAIL À LOYER"}, {"content": "Avenue de la Gare 28"}]},
                    {"lines": []},
                    {"lines": [{"content": "1920 Martigny"}]}
                ]
            }
        });
        assert_eq!(
            parse_analyze_result(&json).unwrap(),
            "BAIL À LOYER\nAvenue de la Gare 28\n\n1920 Martigny"
        );
    }

    #[test]
    fn falls_back_to_content() {
        let json = json!({"analyzeResult": {"content": "Police n° 123"}});
        assert_eq!(parse_analyze_result(&json).unwrap(), "Police n° 123");
    }

    #[test]
    fn missing_result_is_an_error() {
        let json = json!({"status": "succeeded"});
        assert!(matches!(
            parse_analyze_result(&json),
            Err(OcrError::Parse(_))
        ));
    }

    #[test]
    fn client_requires_endpoint() {
        let config = OcrConfig::default();
        assert!(matches!(
            OcrClient::from_config(&config),
            Err(OcrError::MissingEndpoint)
        ));
    }

    mod service {
        use axum::extract::State;
        use axum::http::{HeaderMap, StatusCode};
        use axum::response::{IntoResponse, Response};
        use axum::routing::get;
        use axum::{Json, Router};
        use serde_json::json;
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        /// What the operation reports after its first `running` answer.
        #[derive(Clone, Copy)]
        pub enum Outcome {
            Succeeded,
            Failed,
            NeverDone,
        }

        #[derive(Clone)]
        struct Mock {
            base: String,
            outcome: Outcome,
            polls: Arc<AtomicU32>,
        }

        async fn analyze(State(mock): State<Mock>, headers: HeaderMap) -> Response {
            if headers
                .get("Ocp-Apim-Subscription-Key")
                .and_then(|v| v.to_str().ok())
                != Some("test-key")
            {
                return StatusCode::UNAUTHORIZED.into_response();
            }
            (
                StatusCode::ACCEPTED,
                [("Operation-Location", format!("{}/operations/1", mock.base))],
            )
                .into_response()
        }

        async fn operation(State(mock): State<Mock>) -> Json<serde_json::Value> {
            if mock.polls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Json(json!({"status": "running"}));
            }
            Json(match mock.outcome {
                Outcome::Succeeded => json!({
                    "status": "succeeded",
                    "analyzeResult": {"pages": [{"lines": [
                        {"content": "BAIL À LOYER"},
                        {"content": "Avenue de la Gare 28, 1920 Martigny"}
                    ]}]}
                }),
                Outcome::Failed => json!({
                    "status": "failed",
                    "error": {"code": "InvalidContent", "message": "corrupt file"}
                }),
                Outcome::NeverDone => json!({"status": "running"}),
            })
        }

        /// Serves the analyze and operation endpoints; returns the base URL
        /// and the number of operation polls seen so far.
        pub async fn start(outcome: Outcome) -> (String, Arc<AtomicU32>) {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let polls = Arc::new(AtomicU32::new(0));
            let app = Router::new()
                .route("/operations/1", get(operation))
                .fallback(analyze)
                .with_state(Mock {
                    base: base.clone(),
                    outcome,
                    polls: polls.clone(),
                });
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            (base, polls)
        }
    }

    fn fast_config(max_polls: u32) -> OcrConfig {
        OcrConfig {
            poll_interval_ms: 5,
            max_polls,
            timeout_secs: 5,
            ..OcrConfig::default()
        }
    }

    #[tokio::test]
    async fn read_pdf_polls_until_succeeded() {
        let (base, polls) = service::start(service::Outcome::Succeeded).await;
        let client = OcrClient::new(&base, "test-key".to_string(), &fast_config(5)).unwrap();
        let text = client.read_pdf(b"%PDF-1.4").await.unwrap();
        assert_eq!(text, "BAIL À LOYER\nAvenue de la Gare 28, 1920 Martigny");
        assert_eq!(polls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn read_pdf_reports_failed_analysis() {
        let (base, _) = service::start(service::Outcome::Failed).await;
        let client = OcrClient::new(&base, "test-key".to_string(), &fast_config(5)).unwrap();
        match client.read_pdf(b"%PDF-1.4").await {
            Err(OcrError::Failed(message)) => assert_eq!(message, "corrupt file"),
            other => panic!("expected failed analysis, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn read_pdf_gives_up_after_max_polls() {
        let (base, polls) = service::start(service::Outcome::NeverDone).await;
        let client = OcrClient::new(&base, "test-key".to_string(), &fast_config(3)).unwrap();
        assert!(matches!(
            client.read_pdf(b"%PDF-1.4").await,
            Err(OcrError::Timeout(3))
        ));
        assert_eq!(polls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejected_key_is_a_status_error() {
        let (base, polls) = service::start(service::Outcome::Succeeded).await;
        let client = OcrClient::new(&base, "wrong".to_string(), &fast_config(3)).unwrap();
        assert!(matches!(
            client.read_pdf(b"%PDF-1.4").await,
            Err(OcrError::Status { status: 401, .. })
        ));
        assert_eq!(polls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
