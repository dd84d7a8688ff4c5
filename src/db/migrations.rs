//! Schema history. Each step is one SQL file applied inside the same
//! transaction as the `user_version` bump, so a crash mid-upgrade leaves the
//! previous version intact and any queued readings untouched.

use anyhow::{bail, Context, Result};
use log::info;
use rusqlite::Connection;

struct Migration {
    version: i32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "pending_readings",
        sql: include_str!("schemas/schema_v1.sql"),
    },
    Migration {
        version: 2,
        name: "kv_store",
        sql: include_str!("schemas/schema_v2.sql"),
    },
];

const CURRENT_SCHEMA_VERSION: i32 = MIGRATIONS.len() as i32;

pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")?;

    if version > CURRENT_SCHEMA_VERSION {
        bail!(
            "database schema v{version} is newer than this build understands (v{CURRENT_SCHEMA_VERSION})"
        );
    }

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > version).collect();
    if pending.is_empty() {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .context("failed to open migration transaction")?;
    for migration in &pending {
        tx.execute_batch(migration.sql).with_context(|| {
            format!("migration v{} ({}) failed", migration.version, migration.name)
        })?;
        info!("Applied schema v{} ({})", migration.version, migration.name);
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
        .context("failed to update user_version pragma")?;
    tx.commit().context("failed to commit migrations")?;

    Ok(())
}
