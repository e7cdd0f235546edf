//! # Error Types
//!
//! Error types for quarry-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  quarry-core errors (this file)                                        │
//! │  ├── DerivationError  - Method contract cannot become a query          │
//! │  │                      (raised while a repository is being built)     │
//! │  ├── BindError        - A row cannot be mapped onto a typed value      │
//! │  └── CoreError        - Everything above plus call-time argument and   │
//! │                         registry problems                              │
//! │                                                                         │
//! │  quarry-db errors (separate crate)                                     │
//! │  └── DbError          - Persistence boundary failures                  │
//! │                                                                         │
//! │  Flow: DerivationError → CoreError → DbError → caller                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Fail Fast
//! Every [`DerivationError`] is produced while a repository is constructed,
//! never on the first call. A repository that builds successfully can only
//! fail at call time with argument, binding or persistence errors.

use thiserror::Error;

use crate::value::SemanticType;

// =============================================================================
// Derivation Error
// =============================================================================

/// A repository method contract could not be turned into a query template.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DerivationError {
    /// Method name does not start with a known subject keyword.
    ///
    /// ## When This Occurs
    /// - `fetchByUsername` (unknown prefix)
    /// - An empty method name
    #[error("method '{method}' does not start with a query subject (find, count, exists, delete, ...)")]
    UnsupportedSubject { method: String },

    /// A predicate clause between `And`/`Or` is empty.
    #[error("method '{method}' has an empty predicate clause")]
    EmptyPredicatePart { method: String },

    /// A property path does not exist on the entity.
    ///
    /// ## When This Occurs
    /// - `findByNickname` when Member has no `nickname`
    /// - `findByTeamLabel` when neither `teamLabel` nor `team.label` exist
    #[error("no property '{path}' found on entity {entity}")]
    UnknownProperty { entity: String, path: String },

    /// A path walks through a to-many relation, which cannot be compared,
    /// sorted or join-fetched.
    #[error("path '{path}' on entity {entity} traverses a to-many relation")]
    ToManyPath { entity: String, path: String },

    /// Entity type is not registered.
    #[error("entity {entity} is not registered")]
    UnknownEntity { entity: String },

    /// The number of value parameters does not match the clauses.
    #[error("method '{method}' expects {expected} value parameter(s) but declares {actual}")]
    ArityMismatch {
        method: String,
        expected: usize,
        actual: usize,
    },

    /// A parameter's declared type does not fit the clause it binds to.
    #[error("parameter '{parameter}' of '{method}' must be {expected}, declared {actual}")]
    ParameterTypeMismatch {
        method: String,
        parameter: String,
        expected: String,
        actual: String,
    },

    /// A comparator cannot be applied to a property of this type.
    ///
    /// ## When This Occurs
    /// - `findByAgeLike` (LIKE on an integer)
    /// - `findByUsernameTrue` (boolean test on text)
    #[error("comparator {comparator} is not supported for '{path}' of type {ty}")]
    UnsupportedComparator {
        path: String,
        comparator: String,
        ty: SemanticType,
    },

    /// A declared query names a parameter the method does not declare.
    #[error("method '{method}' references unknown parameter ':{name}'")]
    UnknownParameter { method: String, name: String },

    /// A value parameter is declared but never referenced.
    #[error("parameter '{name}' of method '{method}' is never used")]
    UnusedParameter { method: String, name: String },

    /// More than one Pageable/Sort parameter, or both together.
    #[error("method '{method}' declares conflicting special parameters: {reason}")]
    SpecialParameterConflict { method: String, reason: String },

    /// Return shape is not valid for the query subject or parameters.
    ///
    /// ## When This Occurs
    /// - `Page` return without a `Pageable` parameter
    /// - `countByAge` declared to return a `List`
    #[error("method '{method}' has an invalid return shape: {reason}")]
    InvalidReturnShape { method: String, reason: String },

    /// A named query could not be found in the registry.
    #[error("named query '{name}' is not registered")]
    UnknownNamedQuery { name: String },

    /// Native query text is malformed (e.g. mixes `?` and `:name`).
    #[error("native query of '{method}' is invalid: {reason}")]
    InvalidNativeQuery { method: String, reason: String },

    /// Lock requested on a query that cannot carry one.
    #[error("method '{method}' cannot take a lock: {reason}")]
    InvalidLock { method: String, reason: String },

    /// Bulk update assignment is not valid.
    #[error("cannot assign '{property}' on {entity}: {reason}")]
    InvalidAssignment {
        entity: String,
        property: String,
        reason: String,
    },

    /// Two methods registered under the same name.
    #[error("method '{method}' is registered twice")]
    DuplicateMethod { method: String },
}

// =============================================================================
// Bind Error
// =============================================================================

/// A materialized row cannot be mapped onto an entity or projection.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BindError {
    /// A required field is absent from the row.
    #[error("{owner} row has no value for '{field}'")]
    MissingField { owner: String, field: String },

    /// The field value has an unexpected type.
    #[error("field '{field}' expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },

    /// A relation referenced by an expression was not loaded.
    #[error("relation '{relation}' of {entity} is not loaded")]
    RelationNotLoaded { entity: String, relation: String },

    /// An entity references another entity that has no identifier yet.
    ///
    /// ## When This Occurs
    /// Saving a Member whose Team was never saved.
    #[error("{entity}.{relation} references an unsaved entity")]
    TransientReference { entity: String, relation: String },
}

// =============================================================================
// Core Error
// =============================================================================

/// Core errors: derivation, binding, and call-time argument problems.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    #[error("Derivation error: {0}")]
    Derivation(#[from] DerivationError),

    #[error("Bind error: {0}")]
    Bind(#[from] BindError),

    /// Page request with size 0.
    #[error("Invalid page request: {reason}")]
    InvalidPageRequest { reason: String },

    /// Call-time arguments do not match the method contract.
    ///
    /// ## When This Occurs
    /// - Passing 1 value to `findByUsernameAndAgeGreaterThan`
    /// - Passing text where an integer parameter is declared
    /// - Calling a `Page` method without a page request
    #[error("Arguments for '{method}' do not match its contract: {reason}")]
    ArgumentMismatch { method: String, reason: String },

    /// Runtime sort names a property that does not exist.
    #[error("Cannot sort {entity} by '{property}'")]
    InvalidSort { entity: String, property: String },

    /// Entity descriptor is malformed or registered twice.
    #[error("Invalid entity descriptor {entity}: {reason}")]
    InvalidDescriptor { entity: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
