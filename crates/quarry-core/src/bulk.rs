//! # Bulk Operations
//!
//! Set-based update and delete contracts.
//!
//! A bulk statement bypasses the unit of work's identity map, so every
//! instance already loaded for the touched entity may hold pre-update state
//! afterwards. [`Modifying::clear_automatically`] (on by default) tells the
//! executor to clear the map; opting out yields a [`StaleCacheWarning`].

use serde::Serialize;

use crate::entity::{EntityRegistry, PathLeaf};
use crate::error::DerivationError;
use crate::predicate::Operand;
use crate::value::SemanticType;

// =============================================================================
// Assignments
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AssignmentValue {
    /// `property = value`
    Set(Operand),
    /// `property = property + value`
    Increment(Operand),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub property: String,
    pub value: AssignmentValue,
}

impl Assignment {
    pub fn set(property: &str, operand: impl Into<Operand>) -> Self {
        Assignment {
            property: property.to_string(),
            value: AssignmentValue::Set(operand.into()),
        }
    }

    pub fn increment(property: &str, operand: impl Into<Operand>) -> Self {
        Assignment {
            property: property.to_string(),
            value: AssignmentValue::Increment(operand.into()),
        }
    }

    pub fn operand(&self) -> &Operand {
        match &self.value {
            AssignmentValue::Set(o) | AssignmentValue::Increment(o) => o,
        }
    }

    /// Resolves the assigned property and returns the type its operand must have.
    ///
    /// Only direct properties and to-one relations (by foreign key) may be
    /// assigned. The identifier and insert-only columns are rejected, and
    /// increments need a numeric property.
    pub fn validate(&self, registry: &EntityRegistry, entity: &str) -> Result<SemanticType, DerivationError> {
        let invalid = |reason: &str| DerivationError::InvalidAssignment {
            entity: entity.to_string(),
            property: self.property.clone(),
            reason: reason.to_string(),
        };

        let path = registry.resolve_path(entity, &self.property)?;
        if !path.relations.is_empty() {
            return Err(invalid("only properties of the updated entity can be assigned"));
        }

        let ty = match &path.leaf {
            PathLeaf::Id => return Err(invalid("the identifier cannot be assigned")),
            PathLeaf::Relation { .. } => SemanticType::Integer,
            PathLeaf::Property { name, ty, .. } => {
                let descriptor = registry.require(entity)?;
                if descriptor.property(name).is_some_and(|p| !p.updatable) {
                    return Err(invalid("column is not updatable"));
                }
                *ty
            }
        };

        if matches!(self.value, AssignmentValue::Increment(_))
            && !matches!(ty, SemanticType::Integer | SemanticType::Real)
        {
            return Err(invalid("increment needs a numeric property"));
        }

        if let Operand::Value(v) = self.operand() {
            if !v.conforms_to(ty) {
                return Err(invalid(&format!("value {} is not {}", v, ty)));
            }
        }

        Ok(ty)
    }
}

// =============================================================================
// Modifying Policy and Result
// =============================================================================

/// Cache policy attached to a modifying method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Modifying {
    pub clear_automatically: bool,
}

impl Default for Modifying {
    fn default() -> Self {
        Modifying {
            clear_automatically: true,
        }
    }
}

impl Modifying {
    /// Leaves the identity map untouched after the statement.
    pub fn keep_cache() -> Self {
        Modifying {
            clear_automatically: false,
        }
    }
}

/// Instances still cached after a bulk statement ran without clearing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleCacheWarning {
    pub entity: String,
    pub cached_ids: Vec<i64>,
}

impl std::fmt::Display for StaleCacheWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} cached {} instance(s) may hold pre-update state until reloaded",
            self.cached_ids.len(),
            self.entity
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkUpdateResult {
    pub affected: u64,
    pub stale: Option<StaleCacheWarning>,
}

/// Turns a statement outcome into a [`BulkUpdateResult`] under a policy.
pub struct BulkOperationExecutor;

impl BulkOperationExecutor {
    /// `cached_ids` are the ids of `entity` held by the identity map before
    /// it is (possibly) cleared.
    pub fn outcome(entity: &str, affected: u64, policy: Modifying, cached_ids: Vec<i64>) -> BulkUpdateResult {
        let stale = if policy.clear_automatically || cached_ids.is_empty() || affected == 0 {
            None
        } else {
            Some(StaleCacheWarning {
                entity: entity.to_string(),
                cached_ids,
            })
        };
        BulkUpdateResult { affected, stale }
    }
}
