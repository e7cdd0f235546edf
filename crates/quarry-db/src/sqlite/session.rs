//! SQLite-backed [`PersistenceSession`] running on one transaction.

use async_trait::async_trait;
use quarry_core::entity::FetchType;
use quarry_core::lock::LockMode;
use quarry_core::query::{FetchPlan, QueryKind, QuerySpecification};
use quarry_core::{EntityRegistry, Predicate, Record, Value};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Sqlite, Transaction};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::decode;
use super::render::{RowLayout, SqlRenderer, SqlStatement};
use crate::config::RepositorySettings;
use crate::error::{DbError, DbResult};
use crate::session::{PersistenceSession, ResultRow, SessionStats};

pub struct SqliteSession {
    tx: Transaction<'static, Sqlite>,
    registry: Arc<EntityRegistry>,
    settings: RepositorySettings,
    stats: SessionStats,
}

impl SqliteSession {
    pub fn new(tx: Transaction<'static, Sqlite>, registry: Arc<EntityRegistry>, settings: RepositorySettings) -> Self {
        SqliteSession {
            tx,
            registry,
            settings,
            stats: SessionStats::default(),
        }
    }

    fn log(&self, statement: &SqlStatement, spec: Option<&QuerySpecification>) {
        if self.settings.log_statements {
            debug!(
                sql = %statement.sql,
                params = statement.params.len(),
                spec = %spec.map(QuerySpecification::describe).unwrap_or_default(),
                "Executing statement"
            );
        }
    }

    async fn fetch(&mut self, statement: &SqlStatement, timeout: Option<Duration>) -> DbResult<Vec<SqliteRow>> {
        let query = bind(&statement.sql, &statement.params)?;
        let rows = timed(timeout, query.fetch_all(&mut *self.tx)).await?;
        self.stats.round_trips += 1;
        self.stats.rows_read += rows.len() as u64;
        Ok(rows)
    }

    async fn run(&mut self, statement: &SqlStatement, timeout: Option<Duration>) -> DbResult<(u64, i64)> {
        let query = bind(&statement.sql, &statement.params)?;
        let result = timed(timeout, query.execute(&mut *self.tx)).await?;
        self.stats.round_trips += 1;
        self.stats.rows_written += result.rows_affected();
        Ok((result.rows_affected(), result.last_insert_rowid()))
    }

    /// Takes the database write lock over the rows `spec` reads, waiting at
    /// most the lock timeout.
    async fn acquire_lock(&mut self, spec: &QuerySpecification) -> DbResult<()> {
        match spec.lock.mode {
            LockMode::None => return Ok(()),
            LockMode::PessimisticRead => {
                // readers never block each other under WAL
                debug!(entity = %spec.entity, "Shared lock requested");
                return Ok(());
            }
            LockMode::PessimisticWrite => {}
        }
        let Some(statement) = SqlRenderer::new(&self.registry).lock(spec)? else {
            return Ok(());
        };

        let wait = spec.lock.timeout.or_else(|| self.settings.lock_timeout());
        let previous = match wait {
            Some(wait) => {
                let previous: i64 = sqlx::query_scalar("PRAGMA busy_timeout")
                    .fetch_one(&mut *self.tx)
                    .await?;
                set_busy_timeout(&mut self.tx, wait.as_millis()).await?;
                Some(previous)
            }
            None => None,
        };

        self.log(&statement, Some(spec));
        let outcome = self.run(&statement, None).await;

        if let Some(previous) = previous {
            set_busy_timeout(&mut self.tx, u128::try_from(previous).unwrap_or(0)).await?;
        }

        match outcome {
            Ok(_) => Ok(()),
            Err(DbError::LockConflict(message)) => {
                warn!(entity = %spec.entity, wait_ms = ?wait.map(|w| w.as_millis()), "Lock not acquired");
                Err(DbError::LockConflict(message))
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for SqliteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSession").field("stats", &self.stats).finish()
    }
}

#[async_trait]
impl PersistenceSession for SqliteSession {
    async fn execute(&mut self, spec: &QuerySpecification) -> DbResult<Vec<ResultRow>> {
        self.acquire_lock(spec).await?;

        let rendered = SqlRenderer::new(&self.registry).select(spec)?;
        self.log(&rendered.statement, Some(spec));
        let rows = self.fetch(&rendered.statement, spec.hints.timeout).await?;

        let registry = self.registry.clone();
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let decoded = match &rendered.layout {
                RowLayout::Entity(slots) => ResultRow::Entity(decode::entity(row, slots, &registry)?),
                RowLayout::Paths(slots) => ResultRow::Entity(decode::paths(row, &spec.entity, slots)?),
                RowLayout::NativeEntity => {
                    ResultRow::Entity(decode::native_entity(row, registry.require(&spec.entity)?)?)
                }
                RowLayout::Columns => ResultRow::Columns(decode::columns(row)?),
            };
            out.push(decoded);
        }
        debug!(entity = %spec.entity, rows = out.len(), "Query executed");
        Ok(out)
    }

    async fn execute_count(&mut self, spec: &QuerySpecification) -> DbResult<u64> {
        let statement = SqlRenderer::new(&self.registry).count(spec)?;
        self.log(&statement, Some(spec));
        let rows = self.fetch(&statement, spec.hints.timeout).await?;
        let count = match rows.first() {
            Some(row) => decode::typed(row, 0, quarry_core::SemanticType::Integer)?
                .as_i64()
                .unwrap_or(0),
            None => 0,
        };
        let count = u64::try_from(count).unwrap_or(0);
        Ok(match spec.kind {
            QueryKind::Exists => count.min(1),
            _ => count,
        })
    }

    async fn execute_mutation(&mut self, spec: &QuerySpecification) -> DbResult<u64> {
        let statement = SqlRenderer::new(&self.registry).mutation(spec)?;
        self.log(&statement, Some(spec));
        let (affected, _) = self.run(&statement, spec.hints.timeout).await?;
        debug!(entity = %spec.entity, affected, "Bulk statement executed");
        Ok(affected)
    }

    async fn persist(&mut self, record: &Record) -> DbResult<i64> {
        let statement = SqlRenderer::new(&self.registry).insert(record)?;
        self.log(&statement, None);
        let (_, id) = self.run(&statement, None).await?;
        debug!(entity = %record.entity, id, "Entity persisted");
        Ok(record.id.unwrap_or(id))
    }

    async fn merge(&mut self, record: &Record) -> DbResult<()> {
        let statement = SqlRenderer::new(&self.registry).update(record)?;
        self.log(&statement, None);
        let (affected, _) = self.run(&statement, None).await?;
        if affected == 0 {
            return Err(DbError::not_found(
                &record.entity,
                format!("id = {}", record.id.unwrap_or_default()),
            ));
        }
        Ok(())
    }

    async fn remove(&mut self, entity: &str, id: i64) -> DbResult<()> {
        let statement = SqlRenderer::new(&self.registry).delete_by_id(entity, id)?;
        self.log(&statement, None);
        let (affected, _) = self.run(&statement, None).await?;
        if affected == 0 {
            return Err(DbError::not_found(entity, format!("id = {}", id)));
        }
        Ok(())
    }

    async fn find_by_id(&mut self, entity: &str, id: i64) -> DbResult<Option<Record>> {
        let descriptor = self.registry.require(entity)?;
        let mut fetch = FetchPlan::none();
        for relation in descriptor.to_one_relations().filter(|r| r.fetch == FetchType::Eager) {
            fetch.merge(&FetchPlan::of(&[relation.name.as_str()]));
        }
        let spec = QuerySpecification::select(entity)
            .with_predicate(Predicate::eq(&descriptor.id.name, id))
            .with_fetch(fetch);

        let rows = self.execute(&spec).await?;
        Ok(rows.into_iter().find_map(|row| match row {
            ResultRow::Entity(record) => Some(record),
            ResultRow::Columns(_) => None,
        }))
    }

    fn stats(&self) -> SessionStats {
        self.stats
    }

    fn record_lazy_load(&mut self) {
        self.stats.lazy_loads += 1;
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))
    }
}

async fn set_busy_timeout(tx: &mut Transaction<'static, Sqlite>, millis: u128) -> DbResult<()> {
    // PRAGMA values cannot be bound
    sqlx::query(&format!("PRAGMA busy_timeout = {}", millis))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn timed<T>(timeout: Option<Duration>, fut: impl Future<Output = Result<T, sqlx::Error>>) -> DbResult<T> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DbError::Timeout {
                millis: limit.as_millis(),
            }),
        },
        None => Ok(fut.await?),
    }
}

fn bind<'q>(sql: &'q str, params: &'q [Value]) -> DbResult<Query<'q, Sqlite, SqliteArguments<'q>>> {
    let mut query = sqlx::query(sql);
    for value in params {
        query = match value {
            Value::Null => query.bind(Option::<i64>::None),
            Value::Integer(n) => query.bind(*n),
            Value::Real(x) => query.bind(*x),
            Value::Text(s) => query.bind(s.as_str()),
            Value::Boolean(b) => query.bind(*b),
            Value::Timestamp(t) => query.bind(*t),
            Value::List(_) => {
                return Err(DbError::Internal(
                    "collection values must be expanded before binding".to_string(),
                ))
            }
        };
    }
    Ok(query)
}
