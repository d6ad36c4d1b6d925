use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

fn options(config: &Config) -> Result<SqliteConnectOptions> {
    let db_path = &config.db.path;
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
        .with_context(|| format!("Invalid database path: {}", db_path.display()))?
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(10));
    Ok(options)
}

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = config.db.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(
            options(config)?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal),
        )
        .await
        .with_context(|| format!("Failed to open database {}", config.db.path.display()))?;

    Ok(pool)
}

/// Opens the database with a read-only connection. Used by the ad-hoc SQL
/// tool so that a statement slipping past the keyword guard still cannot write.
pub async fn connect_read_only(config: &Config) -> Result<SqlitePool> {
    if !config.db.path.exists() {
        anyhow::bail!(
            "Database not found at {}. Run `estate init` first.",
            config.db.path.display()
        );
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options(config)?.read_only(true))
        .await
        .with_context(|| format!("Failed to open database {}", config.db.path.display()))?;

    Ok(pool)
}
