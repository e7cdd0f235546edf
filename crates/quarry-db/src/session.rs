//! # Persistence Session
//!
//! The boundary between query specifications and a concrete store.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  UnitOfWork ──► dyn PersistenceSession ──► SqliteSession ──► SQLite     │
//! │                                                                         │
//! │  execute            select rows (entities, paths or native columns)    │
//! │  execute_count      count / exists                                     │
//! │  execute_mutation   bulk update / delete, returns affected rows        │
//! │  persist / merge / remove / find_by_id   single-entity operations      │
//! │                                                                         │
//! │  Lock request and fetch plan travel inside the specification.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use quarry_core::query::QuerySpecification;
use quarry_core::{Record, Value};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::DbResult;

/// One materialized result row.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultRow {
    /// A full entity, or the partial entity selected by a closed projection.
    Entity(Record),
    /// Raw native columns keyed by label.
    Columns(BTreeMap<String, Value>),
}

/// Statement counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Statements sent to the store.
    pub round_trips: u64,
    /// Single-entity loads issued to initialize lazy references.
    pub lazy_loads: u64,
    pub rows_read: u64,
    pub rows_written: u64,
}

#[async_trait]
pub trait PersistenceSession: Send {
    async fn execute(&mut self, spec: &QuerySpecification) -> DbResult<Vec<ResultRow>>;

    /// Row count for `Count`, 0 or 1 for `Exists`.
    async fn execute_count(&mut self, spec: &QuerySpecification) -> DbResult<u64>;

    /// Runs an `Update`/`Delete` specification as one statement.
    async fn execute_mutation(&mut self, spec: &QuerySpecification) -> DbResult<u64>;

    /// Inserts `record` and returns its identifier.
    async fn persist(&mut self, record: &Record) -> DbResult<i64>;

    async fn merge(&mut self, record: &Record) -> DbResult<()>;

    async fn remove(&mut self, entity: &str, id: i64) -> DbResult<()>;

    /// Loads one entity with its eager relations.
    async fn find_by_id(&mut self, entity: &str, id: i64) -> DbResult<Option<Record>>;

    fn stats(&self) -> SessionStats;

    /// Counts a load issued to initialize a lazy reference.
    fn record_lazy_load(&mut self);

    async fn commit(self: Box<Self>) -> DbResult<()>;

    async fn rollback(self: Box<Self>) -> DbResult<()>;
}
