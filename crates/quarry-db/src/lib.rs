//! # quarry-db: Persistence Layer for Quarry
//!
//! Executes the query specifications derived by `quarry-core` against
//! SQLite, through sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Quarry Call Flow                               │
//! │                                                                         │
//! │  db.members().find_by_age(&mut uow, 10, page)                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     quarry-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │  Repositories │    │  UnitOfWork   │    │   sqlite/    │  │   │
//! │  │   │ (repository/) │───►│ identity map  │───►│ SqlRenderer  │  │   │
//! │  │   │ bind template │    │ bulk policy   │    │ SqliteSession│  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────┬───────┘  │   │
//! │  │                                                     │          │   │
//! │  │   ┌───────────────┐    ┌───────────────┐           │          │   │
//! │  │   │   Database    │    │  Migrations   │           │          │   │
//! │  │   │   (pool.rs)   │    │  (embedded)   │           │          │   │
//! │  │   └───────────────┘    └───────────────┘           │          │   │
//! │  └─────────────────────────────────────────────────────┼──────────┘   │
//! │                                                        ▼              │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database (WAL)                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - `quarry.toml` loading and validation
//! - [`pool`] - Connection pool creation and the [`Database`] handle
//! - [`migrations`] - Embedded schema migrations
//! - [`error`] - Database error types
//! - [`session`] - The persistence boundary trait
//! - [`sqlite`] - SQL rendering, row decoding and the SQLite session
//! - [`unit_of_work`] - Transactions with identity maps
//! - [`repository`] - Generic and entity-specific repositories
//!
//! ## Usage
//!
//! ```rust,ignore
//! use quarry_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("quarry.db")).await?;
//! let mut uow = db.begin().await?;
//! let members = db.members().find_by_username(&mut uow, "member1").await?;
//! uow.commit().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod session;
pub mod sqlite;
pub mod unit_of_work;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{DatabaseSettings, QuarryConfig, RepositorySettings};
pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use session::{PersistenceSession, ResultRow, SessionStats};
pub use unit_of_work::UnitOfWork;

// Repository re-exports for convenience
pub use repository::member::MemberRepository;
pub use repository::team::TeamRepository;
pub use repository::Repository;
