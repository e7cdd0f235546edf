//! # Locking
//!
//! Lock requests travel inside a `QuerySpecification`; the persistence
//! boundary acquires them. Scope is the row set of the query and lifetime is
//! the enclosing unit of work's transaction.

use serde::Serialize;
use std::time::Duration;

use crate::error::DerivationError;
use crate::query::{QueryKind, QuerySpecification, Selection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum LockMode {
    #[default]
    None,
    PessimisticRead,
    PessimisticWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LockRequest {
    pub mode: LockMode,
    /// Acquisition timeout. `None` uses the store's default busy timeout.
    pub timeout: Option<Duration>,
}

impl LockRequest {
    pub fn none() -> Self {
        LockRequest::default()
    }

    pub fn write() -> Self {
        LockRequest {
            mode: LockMode::PessimisticWrite,
            timeout: None,
        }
    }

    pub fn read() -> Self {
        LockRequest {
            mode: LockMode::PessimisticRead,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_none(&self) -> bool {
        self.mode == LockMode::None
    }
}

pub struct LockManager;

impl LockManager {
    /// Checks that a lock can be attached to a query of this shape.
    ///
    /// ## Errors
    /// - non-select queries (count, exists, mutations)
    /// - projections, since locked rows must be full entities
    /// - DISTINCT selects
    pub fn validate(
        method: &str,
        request: &LockRequest,
        kind: &QueryKind,
        selection: &Selection,
        distinct: bool,
    ) -> Result<(), DerivationError> {
        if request.is_none() {
            return Ok(());
        }
        let invalid = |reason: &str| DerivationError::InvalidLock {
            method: method.to_string(),
            reason: reason.to_string(),
        };
        if !matches!(kind, QueryKind::Select) {
            return Err(invalid("only select queries can be locked"));
        }
        if !matches!(selection, Selection::Entity) {
            return Err(invalid("projections cannot be locked"));
        }
        if distinct {
            return Err(invalid("DISTINCT queries cannot be locked"));
        }
        Ok(())
    }

    /// Attaches `request` to an already built specification.
    pub fn apply(
        method: &str,
        spec: QuerySpecification,
        request: LockRequest,
    ) -> Result<QuerySpecification, DerivationError> {
        Self::validate(method, &request, &spec.kind, &spec.selection, spec.distinct)?;
        Ok(QuerySpecification { lock: request, ..spec })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_only_on_entity_selects() {
        let spec = QuerySpecification::select("Member");
        let locked = LockManager::apply("findLockByUsername", spec.clone(), LockRequest::write()).unwrap();
        assert_eq!(locked.lock.mode, LockMode::PessimisticWrite);

        let count = spec.to_count();
        assert!(matches!(
            LockManager::apply("countLock", count, LockRequest::write()),
            Err(DerivationError::InvalidLock { .. })
        ));

        let distinct = QuerySpecification {
            distinct: true,
            ..QuerySpecification::select("Member")
        };
        assert!(LockManager::apply("findDistinct", distinct, LockRequest::read()).is_err());

        // no lock requested: anything goes
        assert!(LockManager::apply("countAll", QuerySpecification::select("Member").to_count(), LockRequest::none()).is_ok());
    }
}
