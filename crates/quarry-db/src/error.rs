//! # Persistence Errors
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  sqlx::Error                       CoreError (quarry-core)             │
//! │       │                                 │                               │
//! │       ▼                                 ▼                               │
//! │  DbError: one variant per outcome a caller can act on                   │
//! │       │                                                                 │
//! │       ├── NotFound / NonUniqueResult   single-result contracts         │
//! │       ├── LockConflict / ConstraintViolation / ForeignKeyViolation     │
//! │       │        conflicts, never retried (is_conflict)                  │
//! │       └── everything else              connection, migration, query    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use quarry_core::{BindError, CoreError, DerivationError};
use thiserror::Error;

/// Errors from repositories, units of work and the SQLite session.
#[derive(Debug, Error)]
pub enum DbError {
    /// A single-result method matched no row.
    ///
    /// ## When This Occurs
    /// - `find_by_id` with an id that doesn't exist
    /// - A `One` method (e.g. `findMemberByUsername`) with no match
    #[error("{entity} not found: {criteria}")]
    NotFound { entity: String, criteria: String },

    /// A single-result method matched more than one row.
    #[error("{method} expected at most one result, found {found}")]
    NonUniqueResult { method: String, found: usize },

    /// A UNIQUE, NOT NULL or CHECK constraint rejected the write.
    #[error("{constraint} constraint rejected write: {detail}")]
    ConstraintViolation { constraint: String, detail: String },

    /// ## When This Occurs
    /// - Saving a member whose team id doesn't exist
    /// - Removing a team that still has members
    #[error("member/team reference broken: {message}")]
    ForeignKeyViolation { message: String },

    /// The database write lock could not be taken in time.
    ///
    /// ## When This Occurs
    /// - A pessimistic lock while another unit of work holds the write lock
    /// - Any write blocked past the busy timeout
    #[error("Lock conflict: {0}")]
    LockConflict(String),

    /// A statement ran past its timeout hint.
    #[error("Statement timed out after {millis}ms")]
    Timeout { millis: u128 },

    /// Derivation, binding or argument errors from quarry-core.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The repository has no method registered under this name.
    #[error("{entity} repository has no method '{method}'")]
    UnknownMethod { entity: String, method: String },

    /// A method was invoked through an accessor that does not match its
    /// declared return shape (e.g. `page()` on a `List` method).
    #[error("method '{method}' returns {declared}, not {requested}")]
    ReturnShapeMismatch {
        method: String,
        declared: String,
        requested: String,
    },

    /// The database file could not be opened or created.
    #[error("cannot open database: {0}")]
    ConnectionFailed(String),

    #[error("schema migration failed: {0}")]
    MigrationFailed(String),

    /// SQLite rejected a rendered statement.
    #[error("statement failed: {0}")]
    QueryFailed(String),

    /// Begin, commit or rollback failed.
    #[error("transaction error: {0}")]
    TransactionFailed(String),

    /// `quarry.toml` could not be read or is invalid.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Every connection is held by an open unit of work.
    #[error("no free connection within the connect timeout")]
    PoolTimedOut,

    /// A bug in statement rendering or row decoding.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    pub fn not_found(entity: impl Into<String>, criteria: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            criteria: criteria.into(),
        }
    }

    /// Returns true for concurrency and constraint conflicts.
    ///
    /// Conflicts surface to the caller as-is; nothing in this crate retries.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            DbError::LockConflict(_) | DbError::ConstraintViolation { .. } | DbError::ForeignKeyViolation { .. }
        )
    }
}

impl From<DerivationError> for DbError {
    fn from(err: DerivationError) -> Self {
        DbError::Core(CoreError::Derivation(err))
    }
}

impl From<BindError> for DbError {
    fn from(err: BindError) -> Self {
        DbError::Core(CoreError::Bind(err))
    }
}

/// SQLite primary result codes (the low byte of an extended code).
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Classifies a SQLite error by result code first, message second.
///
/// ```text
/// SQLITE_BUSY / SQLITE_LOCKED            → LockConflict
/// "FOREIGN KEY constraint failed"        → ForeignKeyViolation
/// "<KIND> constraint failed: <detail>"   → ConstraintViolation
/// anything else from the database        → QueryFailed
/// ```
fn classify(db_err: &dyn sqlx::error::DatabaseError) -> DbError {
    let message = db_err.message();
    let primary = db_err
        .code()
        .and_then(|code| code.parse::<i32>().ok())
        .map(|code| code & 0xff);

    if matches!(primary, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)) || message.contains("is locked") {
        return DbError::LockConflict(message.to_string());
    }
    if message.starts_with("FOREIGN KEY") {
        return DbError::ForeignKeyViolation {
            message: message.to_string(),
        };
    }
    match message.split_once(" constraint failed") {
        Some((constraint, detail)) => DbError::ConstraintViolation {
            constraint: constraint.to_string(),
            detail: detail.trim_start_matches(':').trim().to_string(),
        },
        None => DbError::QueryFailed(message.to_string()),
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => classify(db_err.as_ref()),
            sqlx::Error::PoolTimedOut => DbError::PoolTimedOut,
            sqlx::Error::PoolClosed => DbError::ConnectionFailed("database was closed".to_string()),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::Internal(format!("column {} could not be decoded: {}", index, source))
            }
            other => DbError::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

impl From<toml::de::Error> for DbError {
    fn from(err: toml::de::Error) -> Self {
        DbError::Config(err.to_string())
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        DbError::Config(err.to_string())
    }
}

pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        assert!(DbError::LockConflict("database is locked".into()).is_conflict());
        assert!(DbError::ConstraintViolation {
            constraint: "NOT NULL".to_string(),
            detail: "member.username".to_string(),
        }
        .is_conflict());
        assert!(!DbError::not_found("Member", "id = 1").is_conflict());
        assert!(!DbError::Timeout { millis: 10 }.is_conflict());
    }

    #[test]
    fn test_core_errors_convert() {
        let err: DbError = DerivationError::UnknownEntity {
            entity: "Order".to_string(),
        }
        .into();
        assert!(matches!(err, DbError::Core(CoreError::Derivation(_))));
        assert_eq!(err.to_string(), "Derivation error: entity Order is not registered");
    }
}
