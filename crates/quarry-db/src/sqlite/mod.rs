//! # SQLite Backend
//!
//! Renders query specifications to SQLite statements and runs them inside
//! one transaction per unit of work.
//!
//! ## Pessimistic Locks
//! SQLite has no row locks. A pessimistic write lock is taken as the
//! database write lock: a no-op `UPDATE` over the selected rows runs before
//! the select, with `busy_timeout` set to the lock timeout. A second writer
//! that cannot get the lock in time fails with [`crate::DbError::LockConflict`].

mod decode;
mod render;
mod session;

pub use render::{RenderedSelect, RowLayout, SqlRenderer, SqlStatement};
pub use session::SqliteSession;
