//! # Repository Module
//!
//! Generic repository over one entity, plus the typed repositories built
//! on it.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    How a Repository Call Runs                           │
//! │                                                                         │
//! │  db.members().find_by_username_and_age_greater_than(&mut uow, "AAA", 15)│
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  MemberRepository  (typed wrapper, one per entity)                     │
//! │       │  Arguments::new().value("AAA").value(15)                       │
//! │       ▼                                                                 │
//! │  Repository<Member>                                                    │
//! │  ├── template("findByUsernameAndAgeGreaterThan")  derived at build     │
//! │  ├── template.bind(args)  ──► BoundQuery (fresh QuerySpecification)    │
//! │  └── shape the rows: list / one / optional / page / slice / projection │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  UnitOfWork ──► PersistenceSession ──► SQLite                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`MemberRepository`] - derived, declared, native, paging, projections,
//!   bulk update, entity graphs and locks over `Member`
//! - [`TeamRepository`] - teams and their member collections

pub mod member;
pub mod team;

pub use member::MemberRepository;
pub use team::TeamRepository;

use chrono::Utc;
use quarry_core::derivation::BoundQuery;
use quarry_core::page::PageComputer;
use quarry_core::projection::{ProjectedValue, ProjectionBinder};
use quarry_core::query::QuerySpecification;
use quarry_core::{
    Arguments, BulkUpdateResult, DerivationError, Entity, EntityRegistry, MethodContract, Modifying, Page, PageRequest,
    Projection, ProjectedRow, ProjectionShape, QueryDerivationEngine, QueryTemplate, ReturnShape, Slice, Sort,
    Value,
};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::session::ResultRow;
use crate::unit_of_work::UnitOfWork;

// =============================================================================
// Builder
// =============================================================================

/// Collects method contracts and derives them all at once.
pub struct RepositoryBuilder<E> {
    registry: Arc<EntityRegistry>,
    policy: Modifying,
    contracts: Vec<MethodContract>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> RepositoryBuilder<E> {
    pub fn method(mut self, contract: MethodContract) -> Self {
        self.contracts.push(contract);
        self
    }

    /// Derives every registered method.
    ///
    /// ## Returns
    /// * `Err(DbError::Core(_))` - the first contract that fails derivation,
    ///   or a method name registered twice
    pub fn build(self) -> DbResult<Repository<E>> {
        let entity = &E::descriptor().name;
        let engine = QueryDerivationEngine::new(&self.registry).with_default_modifying(self.policy);

        let mut methods = HashMap::with_capacity(self.contracts.len());
        for contract in &self.contracts {
            if methods.contains_key(contract.name()) {
                return Err(DerivationError::DuplicateMethod {
                    method: contract.name().to_string(),
                }
                .into());
            }
            let template = engine.derive(entity, contract)?;
            methods.insert(contract.name().to_string(), template);
        }

        debug!(entity = %entity, methods = methods.len(), "Repository built");
        Ok(Repository {
            registry: self.registry,
            methods,
            _entity: PhantomData,
        })
    }
}

// =============================================================================
// Repository
// =============================================================================

/// CRUD plus every derived, declared and native method of one entity.
pub struct Repository<E> {
    registry: Arc<EntityRegistry>,
    methods: HashMap<String, QueryTemplate>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> fmt::Debug for Repository<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.methods.keys().collect();
        names.sort();
        f.debug_struct("Repository").field("methods", &names).finish()
    }
}

impl<E: Entity> Repository<E> {
    pub fn builder(registry: Arc<EntityRegistry>, policy: Modifying) -> RepositoryBuilder<E> {
        RepositoryBuilder {
            registry,
            policy,
            contracts: Vec::new(),
            _entity: PhantomData,
        }
    }

    fn entity_name() -> &'static str {
        &E::descriptor().name
    }

    pub fn template(&self, method: &str) -> DbResult<&QueryTemplate> {
        self.methods.get(method).ok_or_else(|| DbError::UnknownMethod {
            entity: Self::entity_name().to_string(),
            method: method.to_string(),
        })
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Binds `args` to `method`, which must declare one of `accepted`.
    fn bind(
        &self,
        method: &str,
        args: &Arguments,
        accepted: &[ReturnShape],
        dynamic: Option<&ProjectionShape>,
    ) -> DbResult<BoundQuery> {
        let template = self.template(method)?;
        if !accepted.contains(&template.returns) {
            return Err(DbError::ReturnShapeMismatch {
                method: method.to_string(),
                declared: format!("{:?}", template.returns),
                requested: accepted
                    .iter()
                    .map(|s| format!("{:?}", s))
                    .collect::<Vec<_>>()
                    .join("/"),
            });
        }
        Ok(template.bind(&self.registry, args, dynamic)?)
    }

    // -------------------------------------------------------------------------
    // CRUD
    // -------------------------------------------------------------------------

    /// Inserts a new entity or merges an existing one, stamping audit dates.
    pub async fn save(&self, uow: &mut UnitOfWork, mut entity: E) -> DbResult<E> {
        let now = Utc::now();
        match entity.id() {
            None => {
                entity.on_persist(now);
                let saved = uow.persist(entity.to_record()?).await?;
                if let Some(id) = saved.id {
                    entity.set_id(id);
                }
                debug!(entity = Self::entity_name(), id = ?entity.id(), "Saved new entity");
            }
            Some(id) => {
                entity.on_merge(now);
                uow.merge(entity.to_record()?).await?;
                debug!(entity = Self::entity_name(), id, "Merged entity");
            }
        }
        Ok(entity)
    }

    pub async fn find_by_id(&self, uow: &mut UnitOfWork, id: i64) -> DbResult<Option<E>> {
        match uow.find(Self::entity_name(), id).await? {
            Some(record) => Ok(Some(E::from_record(&record)?)),
            None => Ok(None),
        }
    }

    pub async fn find_all(&self, uow: &mut UnitOfWork) -> DbResult<Vec<E>> {
        self.find_all_sorted(uow, Sort::unsorted()).await
    }

    pub async fn find_all_sorted(&self, uow: &mut UnitOfWork, sort: Sort) -> DbResult<Vec<E>> {
        for order in &sort.orders {
            self.registry
                .resolve_path(Self::entity_name(), &order.property)
                .map_err(|_| quarry_core::CoreError::InvalidSort {
                    entity: Self::entity_name().to_string(),
                    property: order.property.clone(),
                })?;
        }
        let spec = QuerySpecification::select(Self::entity_name()).with_sort(sort);
        entities(uow.execute(&spec).await?)
    }

    pub async fn find_all_paged(&self, uow: &mut UnitOfWork, request: PageRequest) -> DbResult<Page<E>> {
        let spec = QuerySpecification::select(Self::entity_name())
            .with_sort(request.sort().clone())
            .with_window(PageComputer::page_window(&request, None));
        let content = entities(uow.execute(&spec).await?)?;
        let total = match PageComputer::total_without_count(&request, content.len()) {
            Some(total) => total,
            None => uow.execute_count(&spec.to_count()).await?,
        };
        Ok(PageComputer::page(&request, content, total))
    }

    pub async fn count(&self, uow: &mut UnitOfWork) -> DbResult<u64> {
        uow.execute_count(&QuerySpecification::select(Self::entity_name()).to_count())
            .await
    }

    pub async fn delete(&self, uow: &mut UnitOfWork, entity: &E) -> DbResult<()> {
        let id = entity
            .id()
            .ok_or_else(|| DbError::not_found(Self::entity_name(), "entity was never saved"))?;
        self.delete_by_id(uow, id).await
    }

    pub async fn delete_by_id(&self, uow: &mut UnitOfWork, id: i64) -> DbResult<()> {
        uow.remove(Self::entity_name(), id).await
    }

    // -------------------------------------------------------------------------
    // Method Invocation
    // -------------------------------------------------------------------------

    pub async fn list(&self, uow: &mut UnitOfWork, method: &str, args: Arguments) -> DbResult<Vec<E>> {
        let bound = self.bind(method, &args, &[ReturnShape::List], None)?;
        entities(self.rows(uow, &bound).await?)
    }

    /// Exactly one result: zero rows is `NotFound`, more is `NonUniqueResult`.
    pub async fn one(&self, uow: &mut UnitOfWork, method: &str, args: Arguments) -> DbResult<E> {
        let bound = self.bind(method, &args, &[ReturnShape::One], None)?;
        let rows = entities(self.rows(uow, &bound).await?)?;
        single(method, rows)?.ok_or_else(|| DbError::not_found(Self::entity_name(), criteria(method, &bound)))
    }

    pub async fn optional(&self, uow: &mut UnitOfWork, method: &str, args: Arguments) -> DbResult<Option<E>> {
        let bound = self.bind(method, &args, &[ReturnShape::Optional], None)?;
        single(method, entities(self.rows(uow, &bound).await?)?)
    }

    pub async fn page(&self, uow: &mut UnitOfWork, method: &str, args: Arguments) -> DbResult<Page<E>> {
        let bound = self.bind(method, &args, &[ReturnShape::Page], None)?;
        let (rows, total) = self.page_rows(uow, &bound).await?;
        Ok(PageComputer::page(&page_request(method, &bound)?, entities(rows)?, total))
    }

    pub async fn slice(&self, uow: &mut UnitOfWork, method: &str, args: Arguments) -> DbResult<Slice<E>> {
        let bound = self.bind(method, &args, &[ReturnShape::Slice], None)?;
        let request = page_request(method, &bound)?;
        Ok(Slice::from_lookahead(entities(self.rows(uow, &bound).await?)?, &request))
    }

    pub async fn count_by(&self, uow: &mut UnitOfWork, method: &str, args: Arguments) -> DbResult<u64> {
        let bound = self.bind(method, &args, &[ReturnShape::Count], None)?;
        uow.execute_count(&bound.spec).await
    }

    pub async fn exists(&self, uow: &mut UnitOfWork, method: &str, args: Arguments) -> DbResult<bool> {
        let bound = self.bind(method, &args, &[ReturnShape::Exists], None)?;
        Ok(uow.execute_count(&bound.spec).await? > 0)
    }

    /// Runs a modifying method under its cache policy.
    pub async fn bulk(&self, uow: &mut UnitOfWork, method: &str, args: Arguments) -> DbResult<BulkUpdateResult> {
        let bound = self.bind(method, &args, &[ReturnShape::Affected], None)?;
        uow.execute_bulk(&bound).await
    }

    // -------------------------------------------------------------------------
    // Projections
    // -------------------------------------------------------------------------

    /// Rows of a method with a static projection.
    pub async fn project<P: Projection>(&self, uow: &mut UnitOfWork, method: &str, args: Arguments) -> DbResult<Vec<P>> {
        let bound = self.bind(method, &args, &[ReturnShape::List], None)?;
        self.projected(uow, &bound).await
    }

    /// Rows of a dynamic-projection method, shaped by `P`.
    pub async fn project_dynamic<P: Projection>(
        &self,
        uow: &mut UnitOfWork,
        method: &str,
        args: Arguments,
    ) -> DbResult<Vec<P>> {
        let shape = P::shape();
        let bound = self.bind(method, &args, &[ReturnShape::List], Some(&shape))?;
        self.projected(uow, &bound).await
    }

    pub async fn project_page<P: Projection>(
        &self,
        uow: &mut UnitOfWork,
        method: &str,
        args: Arguments,
    ) -> DbResult<Page<P>> {
        let bound = self.bind(method, &args, &[ReturnShape::Page], None)?;
        let (rows, total) = self.page_rows(uow, &bound).await?;
        let content = project_rows(&bound, rows, &self.registry)?;
        Ok(PageComputer::page(&page_request(method, &bound)?, content, total))
    }

    /// First column of every row of a single-field projection method.
    pub async fn scalars(&self, uow: &mut UnitOfWork, method: &str, args: Arguments) -> DbResult<Vec<Value>> {
        let bound = self.bind(method, &args, &[ReturnShape::List], None)?;
        let rows: Vec<ProjectedRow> = self.projected_rows(uow, &bound).await?;
        rows.into_iter()
            .map(|row| {
                let mut values = row.fields.into_values();
                match (values.next(), values.next()) {
                    (Some(ProjectedValue::Value(value)), None) => Ok(value),
                    _ => Err(DbError::Internal(format!("{} does not project a single column", method))),
                }
            })
            .collect()
    }

    async fn projected<P: Projection>(&self, uow: &mut UnitOfWork, bound: &BoundQuery) -> DbResult<Vec<P>> {
        let rows = self.rows(uow, bound).await?;
        project_rows(bound, rows, &self.registry)
    }

    async fn projected_rows(&self, uow: &mut UnitOfWork, bound: &BoundQuery) -> DbResult<Vec<ProjectedRow>> {
        let shape = bound
            .projection
            .as_ref()
            .ok_or_else(|| DbError::Internal(format!("{} has no projection", bound.spec.entity)))?;
        let rows = self.rows(uow, bound).await?;
        rows.iter().map(|row| bind_row(shape, row, &self.registry)).collect()
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    async fn rows(&self, uow: &mut UnitOfWork, bound: &BoundQuery) -> DbResult<Vec<ResultRow>> {
        if bound.empty {
            return Ok(Vec::new());
        }
        uow.execute(&bound.spec).await
    }

    /// Content rows plus the total, counting only when the content cannot
    /// determine it.
    async fn page_rows(&self, uow: &mut UnitOfWork, bound: &BoundQuery) -> DbResult<(Vec<ResultRow>, u64)> {
        let request = page_request(&bound.spec.entity, bound)?;
        let rows = self.rows(uow, bound).await?;

        let total = match PageComputer::total_without_count(&request, rows.len()) {
            Some(total) if !bound.empty => total,
            _ => {
                let count = bound.count.as_ref().ok_or_else(|| {
                    DbError::Internal(format!("page query on {} has no count query", bound.spec.entity))
                })?;
                PageComputer::capped_total(uow.execute_count(count).await?, bound.top)
            }
        };
        Ok((rows, total))
    }
}

// =============================================================================
// Row Shaping
// =============================================================================

fn entities<E: Entity>(rows: Vec<ResultRow>) -> DbResult<Vec<E>> {
    rows.iter()
        .map(|row| match row {
            ResultRow::Entity(record) => Ok(E::from_record(record)?),
            ResultRow::Columns(columns) => {
                Ok(E::from_record(&E::descriptor().record_from_columns(columns))?)
            }
        })
        .collect()
}

fn bind_row(shape: &ProjectionShape, row: &ResultRow, registry: &EntityRegistry) -> DbResult<ProjectedRow> {
    let bound = match row {
        ResultRow::Entity(record) => ProjectionBinder::bind(shape, record, registry)?,
        ResultRow::Columns(columns) => ProjectionBinder::bind_columns(shape, columns)?,
    };
    Ok(bound)
}

fn project_rows<P: Projection>(bound: &BoundQuery, rows: Vec<ResultRow>, registry: &EntityRegistry) -> DbResult<Vec<P>> {
    let shape = bound.projection.clone().unwrap_or_else(P::shape);
    rows.iter()
        .map(|row| Ok(P::from_row(&bind_row(&shape, row, registry)?)?))
        .collect()
}

fn single<T>(method: &str, mut rows: Vec<T>) -> DbResult<Option<T>> {
    match rows.len() {
        0 => Ok(None),
        1 => Ok(rows.pop()),
        found => Err(DbError::NonUniqueResult {
            method: method.to_string(),
            found,
        }),
    }
}

fn page_request(method: &str, bound: &BoundQuery) -> DbResult<PageRequest> {
    bound
        .page
        .clone()
        .ok_or_else(|| DbError::Internal(format!("{} was bound without a page request", method)))
}

fn criteria(method: &str, bound: &BoundQuery) -> String {
    match bound.spec.predicate() {
        Some(predicate) => format!("{} {:?}", method, predicate),
        None => method.to_string(),
    }
}
