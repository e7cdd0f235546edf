//! # Database Handle
//!
//! Opens the SQLite pool, builds the repositories and hands out units of
//! work.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Database Handle                                    │
//! │                                                                         │
//! │  DbConfig::new("quarry.db")   pool sizing, busy timeout, settings     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Database::new(config).await                                           │
//! │       ├── create pool (WAL, foreign keys, busy timeout)                │
//! │       ├── run migrations                                               │
//! │       └── build repositories: every method contract derived ONCE,      │
//! │           a bad contract fails here, never on first call               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  db.begin().await ──► UnitOfWork (one transaction + identity map)      │
//! │       │                                                                 │
//! │       │  db.members().find_by_username(&mut uow, "m1").await           │
//! │       ▼                                                                 │
//! │  uow.commit().await                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## WAL Mode
//! SQLite WAL (Write-Ahead Logging) mode is enabled so readers don't block
//! the single writer. Pessimistic write locks contend on that writer slot.

use quarry_core::{EntityRegistry, Modifying};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::RepositorySettings;
use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::member::MemberRepository;
use crate::repository::team::TeamRepository;
use crate::sqlite::SqliteSession;
use crate::unit_of_work::UnitOfWork;

// =============================================================================
// Configuration
// =============================================================================

/// Where the database lives and how the pool talks to it.
///
/// ## Example
/// ```rust,ignore
/// let config = DbConfig::new("/path/to/quarry.db")
///     .max_connections(5)
///     .busy_timeout(Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// SQLite file, or `:memory:`.
    pub path: PathBuf,

    /// Upper bound on open connections, one per concurrent unit of work.
    /// Default: 5
    pub max_connections: u32,

    /// Default: 1
    pub min_connections: u32,

    /// How long `begin()` waits for a free connection.
    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// Default: 10 minutes
    pub connection_idle: Duration,

    /// How long a statement waits for another connection's write lock
    /// before failing with a lock conflict.
    /// Default: 5 seconds
    pub busy_timeout: Duration,

    /// Apply the embedded schema on connect.
    /// Default: true
    pub run_migrations: bool,

    /// Settings handed to every repository and unit of work.
    pub repository: RepositorySettings,
}

impl DbConfig {
    /// File-backed database, created on first connect.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            path: path.into(),
            max_connections: 5,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            connection_idle: Duration::from_secs(600),
            busy_timeout: Duration::from_secs(5),
            run_migrations: true,
            repository: RepositorySettings::default(),
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min.min(self.max_connections);
        self
    }

    pub fn connect_timeout(mut self, wait: Duration) -> Self {
        self.connect_timeout = wait;
        self
    }

    /// Sets the busy timeout used when no lock timeout applies.
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn run_migrations(mut self, enabled: bool) -> Self {
        self.run_migrations = enabled;
        self
    }

    pub fn repository(mut self, settings: RepositorySettings) -> Self {
        self.repository = settings;
        self
    }

    /// Private in-memory database.
    ///
    /// Each connection would see its own empty database, so the pool holds
    /// exactly one: every unit of work must finish before the next begins.
    pub fn in_memory() -> Self {
        DbConfig {
            path: PathBuf::from(":memory:"),
            max_connections: 1,
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            connection_idle: Duration::from_secs(3600),
            busy_timeout: Duration::from_secs(5),
            run_migrations: true,
            repository: RepositorySettings::default(),
        }
    }

    fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == ":memory:"
    }

    fn connect_options(&self) -> DbResult<SqliteConnectOptions> {
        let base = if self.is_in_memory() {
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| DbError::ConnectionFailed(e.to_string()))?
        } else {
            SqliteConnectOptions::new()
                .filename(&self.path)
                .create_if_missing(true)
                // WAL mode: readers don't block the writer
                .journal_mode(SqliteJournalMode::Wal)
        };

        Ok(base
            .synchronous(SqliteSynchronous::Normal)
            // member.team_id must name an existing team
            .foreign_keys(true)
            .busy_timeout(self.busy_timeout)
            // LIKE compares case-sensitively; IgnoreCase clauses use UPPER()
            .pragma("case_sensitive_like", "ON"))
    }
}

// =============================================================================
// Database
// =============================================================================

/// Main database handle: pool, entity registry and the repositories built
/// against it. Cheap to clone.
///
/// ## Usage
/// ```rust,ignore
/// let db = Database::new(DbConfig::in_memory()).await?;
/// let mut uow = db.begin().await?;
/// let team = db.teams().save(&mut uow, Team::new("teamA")).await?;
/// db.members().save(&mut uow, Member::with_team("member1", 10, &team)).await?;
/// uow.commit().await?;
/// ```
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    registry: Arc<EntityRegistry>,
    settings: RepositorySettings,
    members: Arc<MemberRepository>,
    teams: Arc<TeamRepository>,
}

impl Database {
    /// Creates the pool, runs migrations (if enabled) and builds the
    /// repositories.
    ///
    /// ## Returns
    /// * `Err(DbError::Core(_))` - a repository method contract is invalid
    /// * `Err(DbError::ConnectionFailed(_))` / `MigrationFailed(_)`
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(path = %config.path.display(), "Opening quarry database");

        let options = config.connect_options()?;
        debug!(busy_timeout_ms = config.busy_timeout.as_millis() as u64, "SQLite options ready");

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(Some(config.connection_idle))
            .connect_with(options)
            .await
            .map_err(|e| DbError::ConnectionFailed(format!("{}: {}", config.path.display(), e)))?;

        info!(max_connections = config.max_connections, "Pool open");

        if config.run_migrations {
            migrations::run_migrations(&pool).await?;
        }

        let registry = Arc::new(quarry_core::types::registry()?);
        let settings = RepositorySettings {
            lock_timeout_ms: config
                .repository
                .lock_timeout_ms
                .or_else(|| u64::try_from(config.busy_timeout.as_millis()).ok()),
            ..config.repository.clone()
        };
        let policy = if settings.clear_automatically {
            Modifying::default()
        } else {
            Modifying::keep_cache()
        };

        let members = Arc::new(MemberRepository::new(registry.clone(), policy)?);
        let teams = Arc::new(TeamRepository::new(registry.clone(), policy)?);
        info!("Repositories built");

        Ok(Database {
            pool,
            registry,
            settings,
            members,
            teams,
        })
    }

    /// Runs pending migrations (when `run_migrations` was off at connect).
    pub async fn run_migrations(&self) -> DbResult<()> {
        migrations::run_migrations(&self.pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &RepositorySettings {
        &self.settings
    }

    pub fn members(&self) -> &MemberRepository {
        &self.members
    }

    pub fn teams(&self) -> &TeamRepository {
        &self.teams
    }

    /// Starts a unit of work on its own transaction.
    pub async fn begin(&self) -> DbResult<UnitOfWork> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;
        let session = SqliteSession::new(tx, self.registry.clone(), self.settings.clone());
        Ok(UnitOfWork::new(Box::new(session), self.registry.clone()))
    }

    /// Waits for open units of work to release their connections, then
    /// closes the pool. Later calls to [`Database::begin`] fail.
    pub async fn close(&self) {
        info!(open = self.pool.size(), "Closing quarry database");
        self.pool.close().await;
    }

    /// `true` when a connection can be acquired and the schema is current.
    pub async fn is_ready(&self) -> bool {
        matches!(
            migrations::migration_status(&self.pool).await,
            Ok((total, applied)) if total == applied
        )
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database_is_migrated() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert!(db.is_ready().await);
        assert_eq!(db.registry().require("Member").unwrap().table, "member");
    }

    #[tokio::test]
    async fn test_skipped_migrations_are_not_ready() {
        let db = Database::new(DbConfig::in_memory().run_migrations(false)).await.unwrap();
        assert!(!db.is_ready().await);
        db.run_migrations().await.unwrap();
        assert!(db.is_ready().await);
    }

    #[test]
    fn test_min_connections_never_exceed_max() {
        let config = DbConfig::new("quarry.db").max_connections(2).min_connections(4);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.path, PathBuf::from("quarry.db"));
        assert!(!config.is_in_memory());
        assert!(DbConfig::in_memory().is_in_memory());
    }

    #[tokio::test]
    async fn test_lock_timeout_defaults_to_busy_timeout() {
        let db = Database::new(DbConfig::in_memory().busy_timeout(Duration::from_millis(750)))
            .await
            .unwrap();
        assert_eq!(db.settings().lock_timeout_ms, Some(750));

        let explicit = RepositorySettings {
            lock_timeout_ms: Some(20),
            ..RepositorySettings::default()
        };
        let db = Database::new(DbConfig::in_memory().repository(explicit)).await.unwrap();
        assert_eq!(db.settings().lock_timeout(), Some(Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_closed_database_cannot_begin() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.close().await;
        assert!(matches!(db.begin().await, Err(DbError::TransactionFailed(_))));
    }
}
