//! # Estate Harness CLI (`estate`)
//!
//! ## Usage
//!
//! ```bash
//! estate --config ./config/estate.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `estate init` | Create the database and seed configured properties |
//! | `estate ingest` | Scan, extract, chunk and embed documents |
//! | `estate embed pending` | Backfill missing or stale embeddings |
//! | `estate embed rebuild` | Delete and regenerate all embeddings |
//! | `estate link` | Attach chunks to properties by rule scoring |
//! | `estate link-units` | Attach documents to units by filename reference |
//! | `estate import <xlsx> --property <name>` | Import a rent roll |
//! | `estate import-register <xlsx> --kind <kind>` | Import maintenance, insurance, servitude, dispute or incident registers |
//! | `estate classify-units` | Re-derive unit types |
//! | `estate cleanup` | Remove placeholder rows and merge duplicate tenants |
//! | `estate search "<query>"` | Keyword, semantic or hybrid search |
//! | `estate get <id>` | Show a document with its chunks |
//! | `estate properties list\|dashboard\|compare` | Property reports |
//! | `estate leases expiring` | Leases ending soon |
//! | `estate finance` / `maintenance` / `servitudes` | Portfolio reports |
//! | `estate sql "<select>"` | Guarded read-only SQL |
//! | `estate stats` | Database overview |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use estate_harness::progress::ProgressMode;
use estate_harness::query::{self, Tool};
use estate_harness::register::{self, RegisterKind};
use estate_harness::search::{self, SearchMode, SearchOptions};
use estate_harness::{
    cleanup, config, embed_cmd, get, ingest, link, migrate, rentroll, stats,
};

/// Estate Harness CLI: portfolio ETL and retrieval.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/estate.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "estate",
    about = "Estate Harness: document ingestion, property linking and portfolio queries",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/estate.toml")]
    config: PathBuf,

    /// Progress output on stderr: `off`, `human` or `json`.
    /// Defaults to `human` when stderr is a terminal.
    #[arg(long, global = true, value_parser = parse_progress)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and seed `[[properties]]`.
    ///
    /// Idempotent; safe to re-run after editing the property list.
    Init,

    /// Scan `[scan].root`, extract text, chunk, embed and store documents.
    ///
    /// Unchanged files (same content hash) are skipped unless `--full`.
    Ingest {
        /// Reprocess every file, ignoring the progress ledger.
        #[arg(long)]
        full: bool,

        /// Show what would be ingested without writing.
        #[arg(long)]
        dry_run: bool,

        /// Maximum number of files to process.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Link chunks to properties using the configured detection rules.
    Link {
        /// Re-examine chunks that are already linked.
        #[arg(long)]
        relink: bool,

        #[arg(long)]
        dry_run: bool,
    },

    /// Link documents to units from unit references in their file names.
    LinkUnits {
        #[arg(long)]
        dry_run: bool,
    },

    /// Search indexed documents.
    Search {
        query: String,

        /// `keyword` (FTS5), `semantic` (vector) or `hybrid`.
        #[arg(long, default_value = "keyword")]
        mode: String,

        /// Restrict to one property (exact name, case-insensitive).
        #[arg(long)]
        property: Option<String>,

        /// Restrict to one document category (e.g. `lease`, `insurance`).
        #[arg(long)]
        category: Option<String>,

        #[arg(long)]
        limit: Option<i64>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Retrieve a document by id with its linkage and chunks.
    Get {
        id: String,

        #[arg(long)]
        json: bool,
    },

    /// Import a rent-roll spreadsheet for one property.
    Import {
        /// Path to the `.xlsx` file.
        file: PathBuf,

        /// Configured property name the rent roll belongs to.
        #[arg(long)]
        property: String,

        /// Parse and validate only.
        #[arg(long)]
        dry_run: bool,
    },

    /// Import a maintenance, insurance, servitude, dispute or incident register.
    ///
    /// Rows go to `--property` when given, otherwise to the property named
    /// in the sheet's property column.
    ImportRegister {
        /// Path to the `.xlsx` file.
        file: PathBuf,

        /// `maintenance`, `insurance`, `servitudes`, `disputes` or `incidents`.
        #[arg(long)]
        kind: String,

        #[arg(long)]
        property: Option<String>,

        /// Parse and validate only.
        #[arg(long)]
        dry_run: bool,
    },

    /// Re-derive unit types from unit numbers and tenant names.
    ClassifyUnits {
        #[arg(long)]
        property: Option<String>,

        #[arg(long)]
        dry_run: bool,
    },

    /// Remove placeholder units/tenants and merge duplicate tenants.
    Cleanup {
        #[arg(long)]
        dry_run: bool,
    },

    /// Property reports.
    Properties {
        #[command(subcommand)]
        action: PropertiesAction,
    },

    /// Lease reports.
    Leases {
        #[command(subcommand)]
        action: LeasesAction,
    },

    /// Monthly and annual rent per property and for the portfolio.
    Finance,

    /// Maintenance contracts and their annual cost.
    Maintenance,

    /// Search servitudes by property and type.
    Servitudes {
        /// Property name (partial, case-insensitive).
        #[arg(long)]
        property: Option<String>,

        /// Servitude type substring, e.g. `passage`.
        #[arg(long = "type")]
        servitude_type: Option<String>,

        /// Include cancelled and expired servitudes.
        #[arg(long)]
        all: bool,
    },

    /// Run a single read-only SELECT/WITH statement.
    Sql {
        query: String,

        #[arg(long, default_value_t = query::DEFAULT_MAX_ROWS)]
        max_rows: usize,
    },

    /// Show database statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks that are missing or have stale embeddings.
    Pending {
        #[arg(long)]
        limit: Option<usize>,

        /// Override `[embedding].batch_size`.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Show counts and estimated cost without calling the provider.
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete and regenerate all embeddings.
    Rebuild {
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

#[derive(Subcommand)]
enum PropertiesAction {
    /// All properties with unit and document counts.
    List,
    /// Units, occupancy, leases, maintenance and servitudes of one property.
    Dashboard {
        /// Property name (partial, case-insensitive).
        name: String,
    },
    /// Two dashboards side by side.
    Compare { first: String, second: String },
}

#[derive(Subcommand)]
enum LeasesAction {
    /// Leases ending within the next N months.
    Expiring {
        #[arg(long, default_value_t = 6)]
        months: u32,
    },
}

fn parse_progress(s: &str) -> Result<ProgressMode, String> {
    match s.to_ascii_lowercase().as_str() {
        "off" | "none" => Ok(ProgressMode::Off),
        "human" => Ok(ProgressMode::Human),
        "json" => Ok(ProgressMode::Json),
        other => Err(format!(
            "invalid progress mode '{}': expected off, human or json",
            other
        )),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Init => {
            let seeded = migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
            println!("  properties seeded: {}", seeded);
        }
        Commands::Ingest {
            full,
            dry_run,
            limit,
        } => {
            let reporter = progress.reporter();
            ingest::run_ingest(&cfg, full, dry_run, limit, reporter.as_ref()).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending {
                limit,
                batch_size,
                dry_run,
            } => {
                embed_cmd::run_embed_pending(&cfg, limit, batch_size, dry_run).await?;
            }
            EmbedAction::Rebuild { batch_size } => {
                embed_cmd::run_embed_rebuild(&cfg, batch_size).await?;
            }
        },
        Commands::Link { relink, dry_run } => {
            link::run_link(&cfg, relink, dry_run).await?;
        }
        Commands::LinkUnits { dry_run } => {
            link::run_link_units(&cfg, dry_run).await?;
        }
        Commands::Search {
            query,
            mode,
            property,
            category,
            limit,
            json,
        } => {
            let opts = SearchOptions {
                mode: SearchMode::parse(&mode)?,
                limit,
                property,
                category,
            };
            search::run_search(&cfg, &query, &opts, json).await?;
        }
        Commands::Get { id, json } => {
            get::run_get(&cfg, &id, json).await?;
        }
        Commands::Import {
            file,
            property,
            dry_run,
        } => {
            rentroll::run_import(&cfg, &file, &property, dry_run).await?;
        }
        Commands::ImportRegister {
            file,
            kind,
            property,
            dry_run,
        } => {
            let kind = RegisterKind::parse(&kind)?;
            register::run_import_register(&cfg, &file, kind, property.as_deref(), dry_run).await?;
        }
        Commands::ClassifyUnits { property, dry_run } => {
            cleanup::run_classify_units(&cfg, property.as_deref(), dry_run).await?;
        }
        Commands::Cleanup { dry_run } => {
            cleanup::run_cleanup(&cfg, dry_run).await?;
        }
        Commands::Properties { action } => {
            let tool = match action {
                PropertiesAction::List => Tool::ListProperties,
                PropertiesAction::Dashboard { name } => Tool::Dashboard { name },
                PropertiesAction::Compare { first, second } => Tool::Compare { first, second },
            };
            query::run_tool(&cfg, tool).await?;
        }
        Commands::Leases {
            action: LeasesAction::Expiring { months },
        } => {
            query::run_tool(&cfg, Tool::ExpiringLeases { months }).await?;
        }
        Commands::Finance => query::run_tool(&cfg, Tool::Finance).await?,
        Commands::Maintenance => query::run_tool(&cfg, Tool::Maintenance).await?,
        Commands::Servitudes {
            property,
            servitude_type,
            all,
        } => {
            query::run_tool(
                &cfg,
                Tool::Servitudes {
                    property,
                    servitude_type,
                    include_inactive: all,
                },
            )
            .await?;
        }
        Commands::Sql {
            query: sql,
            max_rows,
        } => {
            query::run_tool(&cfg, Tool::Sql { query: sql, max_rows }).await?;
        }
        Commands::Stats { json } => {
            stats::run_stats(&cfg, json).await?;
        }
    }

    Ok(())
}
