//! # Quarry Configuration
//!
//! File and environment configuration for the database and repositories.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     QUARRY_DATABASE_PATH=./data/quarry.db                              │
//! │     QUARRY_CLEAR_AUTOMATICALLY=false                                   │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     $QUARRY_CONFIG, or ./quarry.toml                                   │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [database]
//! path = "./data/quarry.db"
//! max_connections = 5
//! busy_timeout_ms = 5000
//!
//! [repository]
//! clear_automatically = true
//! lock_timeout_ms = 3000
//! log_statements = false
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{DbError, DbResult};
use crate::pool::DbConfig;

// =============================================================================
// Database Settings
// =============================================================================

/// Connection settings, turned into a [`DbConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file path, or `:memory:`.
    #[serde(default = "default_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// How long a statement waits on another connection's write lock.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

fn default_path() -> PathBuf {
    PathBuf::from("quarry.db")
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_busy_timeout() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_path(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            busy_timeout_ms: default_busy_timeout(),
            run_migrations: true,
        }
    }
}

// =============================================================================
// Repository Settings
// =============================================================================

/// Behaviour shared by every repository built from a [`crate::Database`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositorySettings {
    /// Default for modifying methods that don't declare a policy.
    #[serde(default = "default_true")]
    pub clear_automatically: bool,

    /// Lock acquisition timeout when a lock request carries none.
    #[serde(default)]
    pub lock_timeout_ms: Option<u64>,

    /// Log every rendered statement at `debug`.
    #[serde(default)]
    pub log_statements: bool,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        RepositorySettings {
            clear_automatically: true,
            lock_timeout_ms: None,
            log_statements: false,
        }
    }
}

impl RepositorySettings {
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuarryConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub repository: RepositorySettings,
}

impl QuarryConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (`quarry.toml`)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> DbResult<Self> {
        let mut config = Self::default();

        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            info!(?path, "Loading quarry config from file");
            let contents = std::fs::read_to_string(&path)?;
            config = Self::from_toml(&contents)?;
        } else {
            debug!(?path, "Config file not found, using defaults");
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load quarry config: {}. Using defaults.", e);
            Self::default()
        })
    }

    pub fn from_toml(contents: &str) -> DbResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.database.max_connections == 0 {
            return Err(DbError::Config("max_connections must be greater than 0".into()));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(DbError::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }
        if self.database.path.as_os_str().is_empty() {
            return Err(DbError::Config("database path is empty".into()));
        }
        Ok(())
    }

    /// Applies `QUARRY_*` overrides read through `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("QUARRY_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Some(max) = lookup("QUARRY_MAX_CONNECTIONS") {
            match max.parse::<u32>() {
                Ok(n) => self.database.max_connections = n,
                Err(_) => warn!(value = %max, "Ignoring invalid QUARRY_MAX_CONNECTIONS"),
            }
        }

        if let Some(ms) = lookup("QUARRY_BUSY_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                self.database.busy_timeout_ms = ms;
            }
        }

        if let Some(clear) = lookup("QUARRY_CLEAR_AUTOMATICALLY") {
            match clear.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.repository.clear_automatically = true,
                "false" | "0" | "no" => self.repository.clear_automatically = false,
                _ => warn!(value = %clear, "Ignoring invalid QUARRY_CLEAR_AUTOMATICALLY"),
            }
        }

        if let Some(ms) = lookup("QUARRY_LOCK_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                debug!(lock_timeout_ms = ms, "Overriding lock timeout from environment");
                self.repository.lock_timeout_ms = Some(ms);
            }
        }

        if let Some(log) = lookup("QUARRY_LOG_STATEMENTS") {
            self.repository.log_statements = matches!(log.to_lowercase().as_str(), "true" | "1" | "yes");
        }
    }

    fn default_config_path() -> PathBuf {
        std::env::var("QUARRY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("quarry.toml"))
    }

    /// Pool configuration for these settings.
    pub fn db_config(&self) -> DbConfig {
        let db = &self.database;
        let base = if db.path.as_os_str() == ":memory:" {
            DbConfig::in_memory()
        } else {
            DbConfig::new(&db.path)
                .max_connections(db.max_connections)
                .min_connections(db.min_connections)
        };
        base.connect_timeout(Duration::from_secs(db.connect_timeout_secs))
            .busy_timeout(Duration::from_millis(db.busy_timeout_ms))
            .run_migrations(db.run_migrations)
            .repository(self.repository.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = QuarryConfig::default();
        assert!(config.repository.clear_automatically);
        assert_eq!(config.database.max_connections, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = QuarryConfig::from_toml(
            r#"
            [database]
            path = ":memory:"

            [repository]
            clear_automatically = false
            lock_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.database.path, PathBuf::from(":memory:"));
        assert_eq!(config.database.busy_timeout_ms, 5_000);
        assert!(!config.repository.clear_automatically);
        assert_eq!(config.repository.lock_timeout(), Some(Duration::from_millis(250)));

        let db = config.db_config();
        assert_eq!(db.max_connections, 1);
        assert!(!db.repository.clear_automatically);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("QUARRY_DATABASE_PATH", "/tmp/other.db"),
            ("QUARRY_CLEAR_AUTOMATICALLY", "no"),
            ("QUARRY_LOCK_TIMEOUT_MS", "100"),
            ("QUARRY_MAX_CONNECTIONS", "many"),
        ]
        .into_iter()
        .collect();

        let mut config = QuarryConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.database.path, PathBuf::from("/tmp/other.db"));
        assert!(!config.repository.clear_automatically);
        assert_eq!(config.repository.lock_timeout_ms, Some(100));
        // unparsable values leave the default alone
        assert_eq!(config.database.max_connections, 5);
    }

    #[test]
    fn test_validation() {
        let mut config = QuarryConfig::default();
        config.database.max_connections = 0;
        assert!(matches!(config.validate(), Err(DbError::Config(_))));

        config.database.max_connections = 2;
        config.database.min_connections = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quarry.toml");
        std::fs::write(&path, "[repository]\nlog_statements = true\n").unwrap();

        let config = QuarryConfig::load(Some(path)).unwrap();
        assert!(config.repository.log_statements);
    }
}
