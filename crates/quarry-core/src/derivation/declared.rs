//! Programmatic queries attached to a method instead of name derivation.

use crate::bulk::Assignment;
use crate::page::Sort;
use crate::predicate::Predicate;
use crate::projection::ProjectionShape;

#[derive(Debug, Clone, PartialEq)]
pub enum DeclaredKind {
    Select,
    Update(Vec<Assignment>),
    Delete,
}

/// A query written with the predicate builder.
///
/// Operands use [`Operand::Named`](crate::predicate::Operand::Named) to
/// refer to method parameters by name.
///
/// ```rust
/// use quarry_core::derivation::DeclaredQuery;
/// use quarry_core::predicate::{Operand, Predicate};
///
/// let query = DeclaredQuery::select()
///     .filter(Predicate::eq("username", Operand::named("username"))
///         .and(Predicate::eq("age", Operand::named("age"))));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredQuery {
    pub kind: DeclaredKind,
    pub filter: Option<Predicate>,
    pub projection: Option<ProjectionShape>,
    pub sort: Sort,
    pub fetch: Vec<String>,
    pub distinct: bool,
}

impl DeclaredQuery {
    fn new(kind: DeclaredKind) -> Self {
        DeclaredQuery {
            kind,
            filter: None,
            projection: None,
            sort: Sort::unsorted(),
            fetch: Vec::new(),
            distinct: false,
        }
    }

    pub fn select() -> Self {
        Self::new(DeclaredKind::Select)
    }

    pub fn update(assignments: Vec<Assignment>) -> Self {
        Self::new(DeclaredKind::Update(assignments))
    }

    pub fn delete() -> Self {
        Self::new(DeclaredKind::Delete)
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filter = Some(predicate);
        self
    }

    pub fn project(mut self, shape: impl Into<ProjectionShape>) -> Self {
        self.projection = Some(shape.into());
        self
    }

    pub fn order_by(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    /// Join-loads a relation path (`join fetch`).
    pub fn fetch(mut self, path: &str) -> Self {
        self.fetch.push(path.to_string());
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn is_modifying(&self) -> bool {
        !matches!(self.kind, DeclaredKind::Select)
    }
}
