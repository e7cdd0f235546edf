//! # quarry-core: Pure Query Derivation for Quarry
//!
//! Everything that decides WHAT to query lives here, with zero I/O:
//! entity metadata, the predicate tree, method-name derivation, paging
//! arithmetic, projection planning, and bulk/lock contracts.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Quarry Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │        Typed repositories (MemberRepository, TeamRepository)    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ quarry-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   entity ─► predicate ─► derivation ─► query                    │   │
//! │  │               page · projection · bulk · lock · native          │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • DERIVATION RUNS ONCE PER METHOD       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ QuerySpecification                     │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │          quarry-db (PersistenceSession on SQLite)               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use quarry_core::derivation::{Arguments, MethodContract, QueryDerivationEngine};
//! use quarry_core::predicate::Predicate;
//!
//! let registry = quarry_core::types::registry().unwrap();
//! let template = QueryDerivationEngine::new(&registry)
//!     .derive(
//!         "Member",
//!         &MethodContract::new("findByUsernameAndAgeGreaterThan")
//!             .text("username")
//!             .integer("age"),
//!     )
//!     .unwrap();
//!
//! let bound = template
//!     .bind(&registry, &Arguments::new().value("AAA").value(15), None)
//!     .unwrap();
//! let expected = Predicate::eq("username", "AAA").and(Predicate::gt("age", 15));
//! assert_eq!(bound.spec.predicate(), Some(&expected));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod bulk;
pub mod derivation;
pub mod entity;
pub mod error;
pub mod lock;
pub mod native;
pub mod page;
pub mod predicate;
pub mod projection;
pub mod query;
pub mod types;
pub mod value;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use bulk::{Assignment, BulkUpdateResult, Modifying, StaleCacheWarning};
pub use derivation::{Arguments, DeclaredQuery, MethodContract, QueryDerivationEngine, QueryTemplate, ReturnShape};
pub use entity::{Entity, EntityDescriptor, EntityRegistry, Record, Reference, RelationState};
pub use error::{BindError, CoreError, CoreResult, DerivationError};
pub use lock::{LockMode, LockRequest};
pub use page::{Direction, Order, Page, PageRequest, Slice, Sort};
pub use predicate::{Comparator, Operand, Predicate};
pub use projection::{Expr, ProjectedRow, Projection, ProjectionShape};
pub use query::{FetchPlan, QuerySpecification};
pub use types::{Member, MemberDto, MemberProjection, NestedClosedProjection, Team, UsernameOnly, UsernameOnlyDto};
pub use value::{SemanticType, Value};
