//! # Schema Migrations
//!
//! The member/team schema ships inside the binary.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Database::new(config)   run_migrations = true                         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  _sqlx_migrations ledger (created on first run)                        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  apply each embedded script not yet in the ledger, oldest first        │
//! │       └── 001_initial_schema.sql   team, member, indexes               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! New scripts go in `migrations/sqlite/` as `NNN_description.sql`. Applied
//! scripts are checksummed, so an edited one fails the next startup.

use sqlx::SqlitePool;
use tracing::info;

use crate::error::DbResult;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Applies pending scripts. A no-op once the schema is current.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    MIGRATOR.run(pool).await?;
    info!(scripts = MIGRATOR.migrations.len(), "Schema up to date");
    Ok(())
}

/// `(embedded, applied)` script counts. A fresh database reports no
/// applied scripts.
pub async fn migration_status(pool: &SqlitePool) -> DbResult<(usize, usize)> {
    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
        .fetch_one(pool)
        .await
        .unwrap_or(0);
    Ok((MIGRATOR.migrations.len(), usize::try_from(applied).unwrap_or(0)))
}
