//! Progress reporting, the resumable ingest ledger, and Ctrl+C handling.
//!
//! Progress lines go to **stderr** so stdout remains parseable for scripts.
//!
//! Long passes (ingest, embedding) can run for hours over a shared drive. The
//! [`ProgressLedger`] records which file hashes were processed and is flushed
//! every few files and when the [`InterruptFlag`] trips, so a rerun picks up
//! where the previous one stopped.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// A pass is discovering its work items (total unknown).
    Scanning { pass: String },
    /// n items processed out of total.
    Processing { pass: String, n: u64, total: u64 },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "ingest  processing  1,234 / 5,000 items".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Scanning { pass } => format!("{}  scanning...\n", pass),
            ProgressEvent::Processing { pass, n, total } => format!(
                "{}  processing  {} / {} items\n",
                pass,
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Scanning { pass } => serde_json::json!({
                "event": "progress",
                "pass": pass,
                "phase": "scanning"
            }),
            ProgressEvent::Processing { pass, n, total } => serde_json::json!({
                "event": "progress",
                "pass": pass,
                "phase": "processing",
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

/// Persistent record of processed files, kept as JSON next to the database.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProgressLedger {
    #[serde(default)]
    processed: BTreeSet<String>,
    #[serde(default)]
    pub total_chunks: u64,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub updated_at: Option<i64>,
    #[serde(skip)]
    path: PathBuf,
    #[serde(skip)]
    unsaved: usize,
}

impl ProgressLedger {
    /// Loads the ledger at `path`, or starts an empty one if the file does
    /// not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        let mut ledger = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read progress ledger {}", path.display()))?;
            serde_json::from_str::<ProgressLedger>(&content)
                .with_context(|| format!("Corrupt progress ledger {}", path.display()))?
        } else {
            ProgressLedger::default()
        };
        ledger.path = path.to_path_buf();
        Ok(ledger)
    }

    pub fn is_processed(&self, file_hash: &str) -> bool {
        self.processed.contains(file_hash)
    }

    pub fn mark_processed(&mut self, file_hash: &str, chunks: u64, cost: f64) {
        if self.processed.insert(file_hash.to_string()) {
            self.total_chunks += chunks;
            self.total_cost += cost;
        }
        self.unsaved += 1;
    }

    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }

    /// Saves once `every` files have been marked since the last save.
    pub fn save_if_due(&mut self, every: usize) -> Result<bool> {
        if self.unsaved >= every.max(1) {
            self.save()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Writes the ledger atomically (temp file + rename).
    pub fn save(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.updated_at = Some(chrono::Utc::now().timestamp());
        let json = serde_json::to_string_pretty(self)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        self.unsaved = 0;
        Ok(())
    }
}

/// Set once the process receives Ctrl+C (or SIGTERM on Unix). Passes check it
/// between items and stop after flushing their state.
#[derive(Clone, Debug, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a signal listener on the current tokio runtime.
    pub fn install() -> Self {
        let flag = Self::new();
        let handle = flag.clone();
        tokio::spawn(async move {
            wait_for_shutdown().await;
            tracing::warn!("interrupt received, stopping after the current item");
            handle.trigger();
        });
        flag
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn ledger_survives_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state/ingest_progress.json");

        let mut ledger = ProgressLedger::load(&path).unwrap();
        assert!(ledger.is_empty());
        ledger.mark_processed("abc", 3, 0.5);
        ledger.mark_processed("abc", 3, 0.5);
        ledger.mark_processed("def", 2, 0.25);
        ledger.save().unwrap();

        let reloaded = ProgressLedger::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.is_processed("abc"));
        assert!(!reloaded.is_processed("xyz"));
        assert_eq!(reloaded.total_chunks, 5);
        assert!((reloaded.total_cost - 0.75).abs() < 1e-9);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn ledger_saves_every_n_files() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ledger.json");
        let mut ledger = ProgressLedger::load(&path).unwrap();

        ledger.mark_processed("a", 1, 0.0);
        assert!(!ledger.save_if_due(2).unwrap());
        assert!(!path.exists());
        ledger.mark_processed("b", 1, 0.0);
        assert!(ledger.save_if_due(2).unwrap());
        assert!(path.exists());
    }

    #[test]
    fn corrupt_ledger_is_reported() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ledger.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = ProgressLedger::load(&path).unwrap_err();
        assert!(err.to_string().contains("Corrupt progress ledger"));
    }

    #[test]
    fn interrupt_flag_is_shared() {
        let flag = InterruptFlag::new();
        let other = flag.clone();
        assert!(!other.is_set());
        flag.trigger();
        assert!(other.is_set());
    }
}
