//! Database schema creation and property seeding.
//!
//! Every statement is idempotent so `estate init` can be re-run against an
//! existing database. The FTS5 table is looked up in `sqlite_master` before
//! it is created.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::{Config, PropertyConfig};
use crate::db;

const TABLES: &[(&str, &str)] = &[
    (
        "properties",
        r#"
        CREATE TABLE IF NOT EXISTS properties (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            address TEXT,
            city TEXT,
            purchase_price REAL,
            mortgage_amount REAL,
            construction_year INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "units",
        r#"
        CREATE TABLE IF NOT EXISTS units (
            id TEXT PRIMARY KEY,
            property_id TEXT NOT NULL REFERENCES properties(id) ON DELETE CASCADE,
            unit_number TEXT NOT NULL,
            unit_type TEXT NOT NULL DEFAULT 'apartment',
            surface_area REAL,
            rooms REAL,
            floor TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(property_id, unit_number)
        )
        "#,
    ),
    (
        "tenants",
        r#"
        CREATE TABLE IF NOT EXISTS tenants (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            email TEXT,
            phone TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "leases",
        r#"
        CREATE TABLE IF NOT EXISTS leases (
            id TEXT PRIMARY KEY,
            unit_id TEXT NOT NULL REFERENCES units(id) ON DELETE CASCADE,
            tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
            rent_net REAL NOT NULL DEFAULT 0,
            charges REAL NOT NULL DEFAULT 0,
            start_date TEXT,
            end_date TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(unit_id, tenant_id, start_date)
        )
        "#,
    ),
    (
        "documents",
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            file_path TEXT NOT NULL UNIQUE,
            file_name TEXT NOT NULL,
            file_hash TEXT NOT NULL,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            content_type TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT 'other',
            language TEXT,
            extraction TEXT NOT NULL DEFAULT 'text',
            body TEXT NOT NULL,
            property_id TEXT REFERENCES properties(id) ON DELETE SET NULL,
            unit_id TEXT REFERENCES units(id) ON DELETE SET NULL,
            tenant_id TEXT REFERENCES tenants(id) ON DELETE SET NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "document_chunks",
        r#"
        CREATE TABLE IF NOT EXISTS document_chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            property_id TEXT REFERENCES properties(id) ON DELETE SET NULL,
            unit_number TEXT,
            tenant_id TEXT REFERENCES tenants(id) ON DELETE SET NULL,
            detection_score INTEGER,
            detection_method TEXT,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            linked_at INTEGER,
            UNIQUE(document_id, chunk_index)
        )
        "#,
    ),
    (
        "embeddings",
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            chunk_id TEXT PRIMARY KEY REFERENCES document_chunks(id) ON DELETE CASCADE,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            hash TEXT NOT NULL
        )
        "#,
    ),
    (
        "chunk_vectors",
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY REFERENCES document_chunks(id) ON DELETE CASCADE,
            document_id TEXT NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    ),
    (
        "servitudes",
        r#"
        CREATE TABLE IF NOT EXISTS servitudes (
            id TEXT PRIMARY KEY,
            property_id TEXT NOT NULL REFERENCES properties(id) ON DELETE CASCADE,
            servitude_type TEXT NOT NULL,
            description TEXT,
            beneficiary TEXT,
            registry_number TEXT,
            start_date TEXT,
            end_date TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "servitudes_units",
        r#"
        CREATE TABLE IF NOT EXISTS servitudes_units (
            servitude_id TEXT NOT NULL REFERENCES servitudes(id) ON DELETE CASCADE,
            unit_id TEXT NOT NULL REFERENCES units(id) ON DELETE CASCADE,
            PRIMARY KEY (servitude_id, unit_id)
        )
        "#,
    ),
    (
        "insurance_policies",
        r#"
        CREATE TABLE IF NOT EXISTS insurance_policies (
            id TEXT PRIMARY KEY,
            property_id TEXT NOT NULL REFERENCES properties(id) ON DELETE CASCADE,
            insurer TEXT,
            policy_number TEXT,
            coverage_type TEXT,
            annual_premium REAL,
            start_date TEXT,
            end_date TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "maintenance",
        r#"
        CREATE TABLE IF NOT EXISTS maintenance (
            id TEXT PRIMARY KEY,
            property_id TEXT NOT NULL REFERENCES properties(id) ON DELETE CASCADE,
            unit_id TEXT REFERENCES units(id) ON DELETE SET NULL,
            contractor TEXT,
            contract_type TEXT,
            description TEXT,
            annual_cost REAL,
            start_date TEXT,
            end_date TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "disputes",
        r#"
        CREATE TABLE IF NOT EXISTS disputes (
            id TEXT PRIMARY KEY,
            property_id TEXT NOT NULL REFERENCES properties(id) ON DELETE CASCADE,
            unit_id TEXT REFERENCES units(id) ON DELETE SET NULL,
            tenant_id TEXT REFERENCES tenants(id) ON DELETE SET NULL,
            subject TEXT NOT NULL,
            amount REAL,
            status TEXT NOT NULL DEFAULT 'open',
            opened_at TEXT,
            closed_at TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "incidents",
        r#"
        CREATE TABLE IF NOT EXISTS incidents (
            id TEXT PRIMARY KEY,
            property_id TEXT NOT NULL REFERENCES properties(id) ON DELETE CASCADE,
            unit_id TEXT REFERENCES units(id) ON DELETE SET NULL,
            incident_type TEXT,
            description TEXT,
            occurred_at TEXT,
            cost REAL,
            status TEXT NOT NULL DEFAULT 'open',
            created_at INTEGER NOT NULL
        )
        "#,
    ),
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_units_property ON units(property_id)",
    "CREATE INDEX IF NOT EXISTS idx_leases_unit ON leases(unit_id)",
    "CREATE INDEX IF NOT EXISTS idx_leases_tenant ON leases(tenant_id)",
    "CREATE INDEX IF NOT EXISTS idx_leases_end_date ON leases(end_date)",
    "CREATE INDEX IF NOT EXISTS idx_documents_hash ON documents(file_hash)",
    "CREATE INDEX IF NOT EXISTS idx_documents_property ON documents(property_id)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_document ON document_chunks(document_id)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_property ON document_chunks(property_id)",
    "CREATE INDEX IF NOT EXISTS idx_servitudes_property ON servitudes(property_id)",
    "CREATE INDEX IF NOT EXISTS idx_maintenance_property ON maintenance(property_id)",
];

/// Creates the schema and upserts `[[properties]]`. Returns the number of
/// properties seeded.
pub async fn run_migrations(config: &Config) -> Result<u64> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    let seeded = seed_properties(&pool, &config.properties).await?;
    pool.close().await;
    Ok(seeded)
}

/// Creates every table, the FTS index and the secondary indexes.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    for (name, ddl) in TABLES {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to create table {}", name))?;
    }

    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                document_id UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    for ddl in INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }

    Ok(())
}

/// Upserts the configured properties by name. Fields left out of the config
/// keep whatever value the database already holds. Returns the number of
/// properties written.
pub async fn seed_properties(pool: &SqlitePool, properties: &[PropertyConfig]) -> Result<u64> {
    let now = chrono::Utc::now().timestamp();
    let mut written = 0u64;

    for prop in properties {
        sqlx::query(
            r#"
            INSERT INTO properties (id, name, address, city, purchase_price, mortgage_amount, construction_year, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                address = COALESCE(excluded.address, properties.address),
                city = COALESCE(excluded.city, properties.city),
                purchase_price = COALESCE(excluded.purchase_price, properties.purchase_price),
                mortgage_amount = COALESCE(excluded.mortgage_amount, properties.mortgage_amount),
                construction_year = COALESCE(excluded.construction_year, properties.construction_year),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(prop.name.trim())
        .bind(&prop.address)
        .bind(&prop.city)
        .bind(prop.purchase_price)
        .bind(prop.mortgage_amount)
        .bind(prop.construction_year)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to seed property '{}'", prop.name))?;
        written += 1;
    }

    Ok(written)
}

/// Looks up a property id by exact (case-insensitive) name.
pub async fn property_id_by_name(pool: &SqlitePool, name: &str) -> Result<Option<String>> {
    let id: Option<String> =
        sqlx::query_scalar("SELECT id FROM properties WHERE lower(name) = lower(?)")
            .bind(name.trim())
            .fetch_optional(pool)
            .await?;
    Ok(id)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::DetectionRules;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Fresh in-memory database with the full schema, shared by module tests.
    pub(crate) async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        create_schema(&pool).await.unwrap();
        pool
    }

    pub(crate) fn property(name: &str) -> PropertyConfig {
        PropertyConfig {
            name: name.to_string(),
            address: None,
            city: None,
            purchase_price: None,
            mortgage_amount: None,
            construction_year: None,
            rules: DetectionRules::default(),
        }
    }

    #[tokio::test]
    async fn schema_is_idempotent() {
        let pool = memory_pool().await;
        create_schema(&pool).await.unwrap();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='document_chunks'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn seeding_keeps_existing_values() {
        let pool = memory_pool().await;
        let mut gare = property("Gare 28");
        gare.city = Some("Martigny".to_string());
        seed_properties(&pool, &[gare]).await.unwrap();

        let id_before = property_id_by_name(&pool, "gare 28").await.unwrap();
        seed_properties(&pool, &[property("Gare 28")]).await.unwrap();
        let id_after = property_id_by_name(&pool, "Gare 28").await.unwrap();
        assert_eq!(id_before, id_after);

        let city: Option<String> =
            sqlx::query_scalar("SELECT city FROM properties WHERE name = 'Gare 28'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(city.as_deref(), Some("Martigny"));
    }
}
