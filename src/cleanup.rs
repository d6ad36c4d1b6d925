//! Repairs for records that slipped through older imports, and unit type
//! reclassification.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

use crate::classify;
use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::models::UnitType;
use crate::rentroll;

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub bad_units: Vec<String>,
    pub bad_tenants: Vec<String>,
    /// `(kept, merged)` tenant names.
    pub merged_tenants: Vec<(String, String)>,
    pub leases_removed: u64,
    pub leases_repointed: u64,
}

fn is_placeholder(s: &str) -> bool {
    let s = s.trim();
    s.is_empty() || s.eq_ignore_ascii_case("nan")
}

/// Case and whitespace insensitive key used to spot duplicate tenants.
fn tenant_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub async fn run_cleanup(config: &Config, dry_run: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let report = cleanup(&pool, dry_run).await?;

    println!("cleanup{}", if dry_run { " (dry-run)" } else { "" });
    println!("  placeholder units: {}", report.bad_units.len());
    for u in &report.bad_units {
        println!("    '{}'", u);
    }
    println!("  bad tenant names: {}", report.bad_tenants.len());
    for t in &report.bad_tenants {
        println!("    '{}'", t);
    }
    println!("  duplicate tenants merged: {}", report.merged_tenants.len());
    for (kept, merged) in &report.merged_tenants {
        println!("    '{}' <- '{}'", kept, merged);
    }
    println!("  leases removed: {}", report.leases_removed);
    println!("  leases re-pointed: {}", report.leases_repointed);

    pool.close().await;
    Ok(())
}

pub async fn cleanup(pool: &SqlitePool, dry_run: bool) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();
    let mut tx = pool.begin().await?;

    let units: Vec<(String, String)> = sqlx::query_as("SELECT id, unit_number FROM units")
        .fetch_all(&mut *tx)
        .await?;
    for (id, number) in units.into_iter().filter(|(_, n)| is_placeholder(n)) {
        let leases: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM leases WHERE unit_id = ?")
            .bind(&id)
            .fetch_one(&mut *tx)
            .await?;
        report.leases_removed += leases as u64;
        report.bad_units.push(number);
        if !dry_run {
            sqlx::query("DELETE FROM leases WHERE unit_id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM units WHERE id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
        }
    }

    let tenants: Vec<(String, String)> =
        sqlx::query_as("SELECT id, name FROM tenants ORDER BY created_at, id")
            .fetch_all(&mut *tx)
            .await?;

    let mut kept: BTreeMap<String, (String, String)> = BTreeMap::new();
    for (id, name) in tenants {
        if is_placeholder(&name) || rentroll::is_date_like(&name) {
            let leases: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM leases WHERE tenant_id = ?")
                .bind(&id)
                .fetch_one(&mut *tx)
                .await?;
            report.leases_removed += leases as u64;
            report.bad_tenants.push(name);
            if !dry_run {
                sqlx::query("DELETE FROM leases WHERE tenant_id = ?")
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
                unlink_tenant(&mut tx, &id, None).await?;
                sqlx::query("DELETE FROM tenants WHERE id = ?")
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
            }
            continue;
        }

        let key = tenant_key(&name);
        let Some((keep_id, keep_name)) = kept.get(&key).cloned() else {
            kept.insert(key, (id, name));
            continue;
        };

        let leases: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM leases WHERE tenant_id = ?")
            .bind(&id)
            .fetch_one(&mut *tx)
            .await?;
        if !dry_run {
            // a lease the kept tenant already has for the same unit and start is a duplicate
            let moved = sqlx::query("UPDATE OR IGNORE leases SET tenant_id = ? WHERE tenant_id = ?")
                .bind(&keep_id)
                .bind(&id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            let dropped = sqlx::query("DELETE FROM leases WHERE tenant_id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            report.leases_repointed += moved;
            report.leases_removed += dropped;

            sqlx::query(
                r#"
                UPDATE tenants SET
                    email = COALESCE(email, (SELECT email FROM tenants WHERE id = ?2)),
                    phone = COALESCE(phone, (SELECT phone FROM tenants WHERE id = ?2))
                WHERE id = ?1
                "#,
            )
            .bind(&keep_id)
            .bind(&id)
            .execute(&mut *tx)
            .await?;
            unlink_tenant(&mut tx, &id, Some(&keep_id)).await?;
            sqlx::query("DELETE FROM tenants WHERE id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
        } else {
            report.leases_repointed += leases as u64;
        }
        report.merged_tenants.push((keep_name, name));
    }

    tx.commit().await?;
    Ok(report)
}

/// Points every reference to tenant `from` at `to` (or clears it).
async fn unlink_tenant(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    from: &str,
    to: Option<&str>,
) -> Result<()> {
    for table in ["documents", "document_chunks", "disputes"] {
        sqlx::query(&format!(
            "UPDATE {} SET tenant_id = ? WHERE tenant_id = ?",
            table
        ))
        .bind(to)
        .bind(from)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitTypeChange {
    pub property: String,
    pub unit_number: String,
    pub from: String,
    pub to: UnitType,
}

pub async fn run_classify_units(config: &Config, property: Option<&str>, dry_run: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let property_id = match property {
        Some(name) => match migrate::property_id_by_name(&pool, name).await? {
            Some(id) => Some(id),
            None => {
                pool.close().await;
                bail!("Unknown property: {}", name);
            }
        },
        None => None,
    };

    let (examined, changes) = classify_units(&pool, property_id.as_deref(), dry_run).await?;

    println!("classify-units{}", if dry_run { " (dry-run)" } else { "" });
    println!("  units examined: {}", examined);
    println!("  units changed: {}", changes.len());
    for c in &changes {
        println!("    {} / {}: {} -> {}", c.property, c.unit_number, c.from, c.to);
    }

    pool.close().await;
    Ok(())
}

/// Recomputes every unit's type from its number, its latest tenant and its
/// size. Returns the number of units examined and the changes.
pub async fn classify_units(
    pool: &SqlitePool,
    property_id: Option<&str>,
    dry_run: bool,
) -> Result<(u64, Vec<UnitTypeChange>)> {
    let rows = sqlx::query(
        r#"
        SELECT u.id, u.unit_number, u.unit_type, u.surface_area, u.rooms, p.name AS property,
               (SELECT t.name FROM leases l JOIN tenants t ON t.id = l.tenant_id
                WHERE l.unit_id = u.id ORDER BY l.start_date DESC LIMIT 1) AS tenant
        FROM units u
        JOIN properties p ON p.id = u.property_id
        WHERE ?1 IS NULL OR u.property_id = ?1
        ORDER BY p.name, u.unit_number
        "#,
    )
    .bind(property_id)
    .fetch_all(pool)
    .await?;

    let mut changes = Vec::new();
    let now = chrono::Utc::now().timestamp();

    for row in &rows {
        let current: String = row.get("unit_type");
        let tenant: Option<String> = row.get("tenant");
        let new_type = classify::classify_unit(
            row.get::<String, _>("unit_number").as_str(),
            tenant.as_deref(),
            row.get("surface_area"),
            row.get("rooms"),
        );
        if new_type.as_str() == current {
            continue;
        }
        if !dry_run {
            sqlx::query("UPDATE units SET unit_type = ?, updated_at = ? WHERE id = ?")
                .bind(new_type.as_str())
                .bind(now)
                .bind(row.get::<String, _>("id"))
                .execute(pool)
                .await?;
        }
        changes.push(UnitTypeChange {
            property: row.get("property"),
            unit_number: row.get("unit_number"),
            from: current,
            to: new_type,
        });
    }

    Ok((rows.len() as u64, changes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::tests::{memory_pool, property};

    async fn insert_unit(pool: &SqlitePool, id: &str, property_id: &str, number: &str, surface: Option<f64>) {
        sqlx::query(
            "INSERT INTO units (id, property_id, unit_number, surface_area, created_at, updated_at) VALUES (?, ?, ?, ?, 0, 0)",
        )
        .bind(id)
        .bind(property_id)
        .bind(number)
        .bind(surface)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn insert_tenant(pool: &SqlitePool, id: &str, name: &str, created_at: i64) {
        sqlx::query("INSERT INTO tenants (id, name, created_at, updated_at) VALUES (?, ?, ?, 0)")
            .bind(id)
            .bind(name)
            .bind(created_at)
            .execute(pool)
            .await
            .unwrap();
    }

    async fn insert_lease(pool: &SqlitePool, id: &str, unit: &str, tenant: &str, start: &str) {
        sqlx::query(
            "INSERT INTO leases (id, unit_id, tenant_id, rent_net, start_date, created_at, updated_at) VALUES (?, ?, ?, 1000, ?, 0, 0)",
        )
        .bind(id)
        .bind(unit)
        .bind(tenant)
        .bind(start)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn setup() -> (SqlitePool, String) {
        let pool = memory_pool().await;
        migrate::seed_properties(&pool, &[property("Gare 28")]).await.unwrap();
        let pid = migrate::property_id_by_name(&pool, "Gare 28").await.unwrap().unwrap();
        (pool, pid)
    }

    async fn count(pool: &SqlitePool, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn removes_placeholders_and_merges_duplicates() {
        let (pool, pid) = setup().await;
        insert_unit(&pool, "u1", &pid, "3.2", None).await;
        insert_unit(&pool, "u2", &pid, "nan", None).await;
        insert_unit(&pool, "u3", &pid, "4.1", None).await;
        insert_tenant(&pool, "t1", "Marie Dupont", 1).await;
        insert_tenant(&pool, "t2", "marie  dupont", 2).await;
        insert_tenant(&pool, "t3", "2023-01-01 00:00:00", 3).await;
        insert_lease(&pool, "l1", "u1", "t1", "2023-04-01").await;
        insert_lease(&pool, "l2", "u1", "t2", "2023-04-01").await;
        insert_lease(&pool, "l3", "u3", "t2", "2024-01-01").await;
        insert_lease(&pool, "l4", "u2", "t1", "2022-01-01").await;
        insert_lease(&pool, "l5", "u3", "t3", "2021-01-01").await;

        let dry = cleanup(&pool, true).await.unwrap();
        assert_eq!(dry.bad_units, vec!["nan".to_string()]);
        assert_eq!(count(&pool, "leases").await, 5);

        let report = cleanup(&pool, false).await.unwrap();
        assert_eq!(report.bad_units.len(), 1);
        assert_eq!(report.bad_tenants, vec!["2023-01-01 00:00:00".to_string()]);
        assert_eq!(
            report.merged_tenants,
            vec![("Marie Dupont".to_string(), "marie  dupont".to_string())]
        );
        assert_eq!(report.leases_repointed, 1);

        assert_eq!(count(&pool, "tenants").await, 1);
        assert_eq!(count(&pool, "units").await, 2);
        let owners: Vec<String> = sqlx::query_scalar("SELECT DISTINCT tenant_id FROM leases")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(owners, vec!["t1".to_string()]);
        assert_eq!(count(&pool, "leases").await, 2);

        let again = cleanup(&pool, false).await.unwrap();
        assert!(again.bad_units.is_empty() && again.merged_tenants.is_empty());
    }

    #[tokio::test]
    async fn reclassifies_units() {
        let (pool, pid) = setup().await;
        insert_unit(&pool, "u1", &pid, "Place de parc 12", None).await;
        insert_unit(&pool, "u2", &pid, "1.01", Some(180.0)).await;
        insert_unit(&pool, "u3", &pid, "3.2", Some(82.0)).await;
        insert_tenant(&pool, "t1", "Fiduciaire Rhône SA", 1).await;
        insert_lease(&pool, "l1", "u2", "t1", "2020-01-01").await;

        let (examined, changes) = classify_units(&pool, None, false).await.unwrap();
        assert_eq!(examined, 3);
        let summary: Vec<(&str, UnitType)> = changes
            .iter()
            .map(|c| (c.unit_number.as_str(), c.to))
            .collect();
        assert_eq!(
            summary,
            vec![("1.01", UnitType::Office), ("Place de parc 12", UnitType::Parking)]
        );

        let (_, second) = classify_units(&pool, Some(&pid), false).await.unwrap();
        assert!(second.is_empty());
    }
}
