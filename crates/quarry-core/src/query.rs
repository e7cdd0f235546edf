//! # Query Specification
//!
//! The intermediate representation handed to a persistence session.
//!
//! ## Anatomy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │ QuerySpecification                                                      │
//! │                                                                         │
//! │  entity     Member                                                     │
//! │  kind       Select | Count | Exists | Update(assignments) | Delete     │
//! │  source     Predicate(tree) | Native { sql, params }                   │
//! │  selection  Entity | Paths([..]) | Columns                             │
//! │  distinct   bool                                                       │
//! │  sort       [(path, Asc|Desc)]                                         │
//! │  window     offset / limit                                             │
//! │  fetch      relation paths join-loaded with the root                   │
//! │  lock       None | PessimisticRead | PessimisticWrite (+ timeout)      │
//! │  hints      read_only, comment, timeout                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Specifications are built fresh for each call and never mutated; the
//! `with_*` helpers consume and return a new value.

use serde::Serialize;
use std::time::Duration;

use crate::bulk::Assignment;
use crate::lock::LockRequest;
use crate::page::{Sort, Window};
use crate::predicate::Predicate;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum QueryKind {
    Select,
    Count,
    Exists,
    Update(Vec<Assignment>),
    Delete,
}

impl QueryKind {
    pub fn is_mutation(&self) -> bool {
        matches!(self, QueryKind::Update(_) | QueryKind::Delete)
    }
}

/// Native SQL with positional `?` placeholders and their values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NativeQuery {
    pub sql: String,
    pub params: Vec<Value>,
    /// The statement already returns a single count column.
    pub returns_count: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum QuerySource {
    Predicate(Option<Predicate>),
    Native(NativeQuery),
}

/// What each result row carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Selection {
    /// Full entity columns plus fetched relations.
    Entity,
    /// Only these dotted paths (closed projections).
    Paths(Vec<String>),
    /// Raw native columns, keyed by column label.
    Columns,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum JoinKind {
    #[default]
    Left,
    Inner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchJoin {
    pub path: String,
    pub kind: JoinKind,
}

/// Relation paths materialized in the same round trip as the root.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct FetchPlan {
    pub joins: Vec<FetchJoin>,
}

impl FetchPlan {
    pub fn none() -> Self {
        FetchPlan::default()
    }

    /// Left-joins every path.
    pub fn of(paths: &[&str]) -> Self {
        let mut plan = FetchPlan::default();
        for path in paths {
            plan.add(path, JoinKind::Left);
        }
        plan
    }

    /// Adds `path` and every prefix of it. An existing entry is upgraded to
    /// an inner join when requested.
    pub fn add(&mut self, path: &str, kind: JoinKind) {
        let segments: Vec<&str> = path.split('.').collect();
        for end in 1..=segments.len() {
            let prefix = segments[..end].join(".");
            match self.joins.iter_mut().find(|j| j.path == prefix) {
                Some(existing) => {
                    if kind == JoinKind::Inner {
                        existing.kind = JoinKind::Inner;
                    }
                }
                None => self.joins.push(FetchJoin { path: prefix, kind }),
            }
        }
    }

    pub fn merge(&mut self, other: &FetchPlan) {
        for join in &other.joins {
            self.add(&join.path, join.kind);
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.joins.iter().any(|j| j.path == path)
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct QueryHints {
    /// Rows are returned without being attached to the identity map.
    pub read_only: bool,
    /// Prepended to the rendered SQL as `/* comment */`.
    pub comment: Option<String>,
    /// Per-statement timeout applied by the session.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuerySpecification {
    pub entity: String,
    pub kind: QueryKind,
    pub source: QuerySource,
    pub selection: Selection,
    pub distinct: bool,
    pub sort: Sort,
    pub window: Option<Window>,
    pub fetch: FetchPlan,
    pub lock: LockRequest,
    pub hints: QueryHints,
}

impl QuerySpecification {
    /// Unfiltered select of full `entity` rows.
    pub fn select(entity: &str) -> Self {
        QuerySpecification {
            entity: entity.to_string(),
            kind: QueryKind::Select,
            source: QuerySource::Predicate(None),
            selection: Selection::Entity,
            distinct: false,
            sort: Sort::unsorted(),
            window: None,
            fetch: FetchPlan::none(),
            lock: LockRequest::none(),
            hints: QueryHints::default(),
        }
    }

    pub fn native(entity: &str, native: NativeQuery, selection: Selection) -> Self {
        QuerySpecification {
            source: QuerySource::Native(native),
            selection,
            ..Self::select(entity)
        }
    }

    pub fn with_predicate(self, predicate: Predicate) -> Self {
        QuerySpecification {
            source: QuerySource::Predicate(Some(predicate)),
            ..self
        }
    }

    pub fn with_sort(self, sort: Sort) -> Self {
        QuerySpecification { sort, ..self }
    }

    pub fn with_window(self, window: Option<Window>) -> Self {
        QuerySpecification { window, ..self }
    }

    pub fn with_fetch(self, fetch: FetchPlan) -> Self {
        QuerySpecification { fetch, ..self }
    }

    pub fn predicate(&self) -> Option<&Predicate> {
        match &self.source {
            QuerySource::Predicate(p) => p.as_ref(),
            QuerySource::Native(_) => None,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self.source, QuerySource::Native(_))
    }

    /// Compact JSON form used in statement logs.
    pub fn describe(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?} {}", self.kind, self.entity))
    }

    /// Count over the same rows: sort, window, lock and left fetch joins
    /// dropped. Inner joins filter rows, so they stay.
    pub fn to_count(&self) -> Self {
        QuerySpecification {
            entity: self.entity.clone(),
            kind: QueryKind::Count,
            source: self.source.clone(),
            selection: Selection::Entity,
            distinct: self.distinct,
            sort: Sort::unsorted(),
            window: None,
            fetch: FetchPlan::none(),
            lock: LockRequest::none(),
            hints: QueryHints {
                read_only: true,
                ..self.hints.clone()
            },
        }
    }

    pub fn to_exists(&self) -> Self {
        QuerySpecification {
            kind: QueryKind::Exists,
            window: Some(Window { offset: 0, limit: 1 }),
            ..self.to_count()
        }
    }
}
