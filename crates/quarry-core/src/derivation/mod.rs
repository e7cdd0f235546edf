//! # Query Derivation
//!
//! Turns a [`MethodContract`] into an immutable [`QueryTemplate`] once, when
//! a repository is built. Each call then binds [`Arguments`] to the template
//! and gets a fresh [`QuerySpecification`].
//!
//! ## Lookup Precedence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │ 1. explicit override     .declared(..) / .native(..)                    │
//! │ 2. named query           .named_query("..") or "<Entity>.<method>"      │
//! │ 3. name derivation       findByUsernameAndAgeGreaterThan                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Fail Fast
//! Unknown properties, parameter arity or type mismatches, unsupported
//! comparators, bad return shapes and invalid locks are all reported by
//! [`QueryDerivationEngine::derive`]. Binding only checks the call-time
//! arguments against the already validated contract.

mod declared;
pub mod grammar;
mod path;

pub use declared::{DeclaredKind, DeclaredQuery};
pub use path::resolve_token;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use tracing::debug;

use crate::bulk::{Assignment, AssignmentValue, Modifying};
use crate::entity::{EntityRegistry, FetchType};
use crate::error::{CoreError, CoreResult, DerivationError};
use crate::lock::{LockManager, LockRequest};
use crate::native::{NativeStatement, Placeholder, PlaceholderStyle};
use crate::page::{Order, PageComputer, PageRequest, Sort, Window};
use crate::predicate::{Comparator, Comparison, Operand, Predicate};
use crate::projection::{ProjectionBinder, ProjectionShape};
use crate::query::{FetchPlan, JoinKind, QueryHints, QueryKind, QuerySource, QuerySpecification, Selection};
use crate::value::{SemanticType, Value};
use grammar::{PartTree, SubjectKind};

// =============================================================================
// Method Contracts
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Scalar(SemanticType),
    Collection(SemanticType),
    Pageable,
    Sort,
}

impl ParamType {
    fn is_special(&self) -> bool {
        matches!(self, ParamType::Pageable | ParamType::Sort)
    }

    /// Whether an argument declared as `self` can feed a clause expecting `expected`.
    fn accepts(&self, expected: ParamType) -> bool {
        match (self, expected) {
            (ParamType::Scalar(a), ParamType::Scalar(b)) | (ParamType::Collection(a), ParamType::Collection(b)) => {
                *a == b || (*a == SemanticType::Integer && b == SemanticType::Real)
            }
            _ => false,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Scalar(t) => write!(f, "{}", t),
            ParamType::Collection(t) => write!(f, "collection of {}", t),
            ParamType::Pageable => write!(f, "page request"),
            ParamType::Sort => write!(f, "sort"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDecl {
    pub name: String,
    pub ty: ParamType,
}

/// Declared result cardinality of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnShape {
    /// Exactly one row; zero rows is `NotFound`.
    One,
    Optional,
    List,
    Page,
    Slice,
    Count,
    Exists,
    /// Affected-row count of a modifying method.
    Affected,
}

impl ReturnShape {
    fn is_rows(&self) -> bool {
        matches!(
            self,
            ReturnShape::One | ReturnShape::Optional | ReturnShape::List | ReturnShape::Page | ReturnShape::Slice
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionMode {
    Entity,
    Static(ProjectionShape),
    /// Shape chosen per call.
    Dynamic,
}

#[derive(Debug, Clone, PartialEq)]
enum QueryOverride {
    None,
    Declared(DeclaredQuery),
    Named(String),
    Native(String),
}

#[derive(Debug, Clone, PartialEq)]
enum CountOverride {
    Declared(DeclaredQuery),
    Native(String),
}

/// Everything declared about one repository method.
///
/// ## Example
/// ```rust
/// use quarry_core::derivation::{MethodContract, ReturnShape};
///
/// let contract = MethodContract::new("findByUsernameAndAgeGreaterThan")
///     .text("username")
///     .integer("age")
///     .returns(ReturnShape::List);
/// assert_eq!(contract.name(), "findByUsernameAndAgeGreaterThan");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MethodContract {
    name: String,
    params: Vec<ParamDecl>,
    returns: ReturnShape,
    query: QueryOverride,
    count_query: Option<CountOverride>,
    entity_graph: Vec<String>,
    lock: LockRequest,
    hints: QueryHints,
    modifying: Option<Modifying>,
    projection: ProjectionMode,
}

impl MethodContract {
    pub fn new(name: &str) -> Self {
        MethodContract {
            name: name.to_string(),
            params: Vec::new(),
            returns: ReturnShape::List,
            query: QueryOverride::None,
            count_query: None,
            entity_graph: Vec::new(),
            lock: LockRequest::none(),
            hints: QueryHints::default(),
            modifying: None,
            projection: ProjectionMode::Entity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ParamDecl] {
        &self.params
    }

    pub fn param(mut self, name: &str, ty: ParamType) -> Self {
        self.params.push(ParamDecl {
            name: name.to_string(),
            ty,
        });
        self
    }

    pub fn text(self, name: &str) -> Self {
        self.param(name, ParamType::Scalar(SemanticType::Text))
    }

    pub fn integer(self, name: &str) -> Self {
        self.param(name, ParamType::Scalar(SemanticType::Integer))
    }

    pub fn collection(self, name: &str, of: SemanticType) -> Self {
        self.param(name, ParamType::Collection(of))
    }

    pub fn pageable(self) -> Self {
        self.param("pageable", ParamType::Pageable)
    }

    pub fn sort(self) -> Self {
        self.param("sort", ParamType::Sort)
    }

    pub fn returns(mut self, shape: ReturnShape) -> Self {
        self.returns = shape;
        self
    }

    pub fn declared(mut self, query: DeclaredQuery) -> Self {
        self.query = QueryOverride::Declared(query);
        self
    }

    /// Uses the registry query registered under `name`.
    pub fn named_query(mut self, name: &str) -> Self {
        self.query = QueryOverride::Named(name.to_string());
        self
    }

    pub fn native(mut self, sql: &str) -> Self {
        self.query = QueryOverride::Native(sql.to_string());
        self
    }

    /// Count used by `Page` returns instead of the derived one.
    pub fn count_query(mut self, query: DeclaredQuery) -> Self {
        self.count_query = Some(CountOverride::Declared(query));
        self
    }

    /// Native count statement returning a single number.
    pub fn native_count(mut self, sql: &str) -> Self {
        self.count_query = Some(CountOverride::Native(sql.to_string()));
        self
    }

    /// Relation paths join-loaded with the root (entity graph).
    pub fn entity_graph(mut self, paths: &[&str]) -> Self {
        self.entity_graph.extend(paths.iter().map(|p| p.to_string()));
        self
    }

    pub fn lock(mut self, request: LockRequest) -> Self {
        self.lock = request;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.hints.read_only = true;
        self
    }

    pub fn comment(mut self, comment: &str) -> Self {
        self.hints.comment = Some(comment.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.hints.timeout = Some(timeout);
        self
    }

    pub fn modifying(mut self, policy: Modifying) -> Self {
        self.modifying = Some(policy);
        self
    }

    pub fn projection(mut self, shape: impl Into<ProjectionShape>) -> Self {
        self.projection = ProjectionMode::Static(shape.into());
        self
    }

    pub fn dynamic_projection(mut self) -> Self {
        self.projection = ProjectionMode::Dynamic;
        self
    }
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Value(Value),
    Page(PageRequest),
    Sort(Sort),
}

/// Call-time arguments in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    args: Vec<Argument>,
}

impl Arguments {
    pub fn new() -> Self {
        Arguments::default()
    }

    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.args.push(Argument::Value(value.into()));
        self
    }

    pub fn page(mut self, request: PageRequest) -> Self {
        self.args.push(Argument::Page(request));
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.args.push(Argument::Sort(sort));
        self
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

// =============================================================================
// Templates
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum TemplateSource {
    Predicate(Option<Predicate>),
    Native { statement: NativeStatement, returns_count: bool },
}

/// A method contract validated and parsed once.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTemplate {
    pub method: String,
    pub entity: String,
    pub returns: ReturnShape,
    params: Vec<ParamDecl>,
    kind: QueryKind,
    source: TemplateSource,
    count_source: Option<TemplateSource>,
    selection: Selection,
    projection: ProjectionMode,
    distinct: bool,
    sort: Sort,
    top: Option<u64>,
    fetch: FetchPlan,
    lock: LockRequest,
    hints: QueryHints,
    modifying: Modifying,
}

/// A template bound to one call's arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundQuery {
    pub spec: QuerySpecification,
    /// Count specification for `Page` returns.
    pub count: Option<QuerySpecification>,
    pub page: Option<PageRequest>,
    pub top: Option<u64>,
    /// The requested page lies past the `Top N` cap.
    pub empty: bool,
    /// Shape rows are bound with, when projecting.
    pub projection: Option<ProjectionShape>,
    pub modifying: Modifying,
}

impl QueryTemplate {
    pub fn kind(&self) -> &QueryKind {
        &self.kind
    }

    pub fn top(&self) -> Option<u64> {
        self.top
    }

    pub fn static_sort(&self) -> &Sort {
        &self.sort
    }

    pub fn fetch(&self) -> &FetchPlan {
        &self.fetch
    }

    pub fn is_dynamic_projection(&self) -> bool {
        self.projection == ProjectionMode::Dynamic
    }

    pub fn is_projection(&self) -> bool {
        self.projection != ProjectionMode::Entity
    }

    /// Binds call arguments. `dynamic` supplies the shape of a dynamic
    /// projection method and is ignored otherwise.
    pub fn bind(
        &self,
        registry: &EntityRegistry,
        args: &Arguments,
        dynamic: Option<&ProjectionShape>,
    ) -> CoreResult<BoundQuery> {
        let mismatch = |reason: String| CoreError::ArgumentMismatch {
            method: self.method.clone(),
            reason,
        };

        if args.len() != self.params.len() {
            return Err(mismatch(format!(
                "expected {} argument(s), got {}",
                self.params.len(),
                args.len()
            )));
        }

        let mut values: Vec<(&str, Value)> = Vec::new();
        let mut page: Option<PageRequest> = None;
        let mut runtime_sort: Option<Sort> = None;

        for (param, arg) in self.params.iter().zip(&args.args) {
            match (param.ty, arg) {
                (ParamType::Scalar(ty), Argument::Value(v)) if v.conforms_to(ty) => {
                    values.push((param.name.as_str(), v.clone()));
                }
                (ParamType::Collection(ty), Argument::Value(Value::List(items)))
                    if items.iter().all(|i| i.conforms_to(ty)) =>
                {
                    values.push((param.name.as_str(), Value::List(items.clone())));
                }
                (ParamType::Pageable, Argument::Page(p)) => page = Some(p.clone()),
                (ParamType::Sort, Argument::Sort(s)) => runtime_sort = Some(s.clone()),
                (ty, arg) => {
                    return Err(mismatch(format!(
                        "parameter '{}' expects {}, got {:?}",
                        param.name, ty, arg
                    )))
                }
            }
        }

        let by_name: HashMap<&str, &Value> = values.iter().map(|(n, v)| (*n, v)).collect();
        let mut resolve = |operand: &Operand| -> CoreResult<Value> {
            match operand {
                Operand::Value(v) => Ok(v.clone()),
                Operand::Param(i) => values
                    .get(*i)
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| mismatch(format!("no value for parameter #{}", i))),
                Operand::Named(n) => by_name
                    .get(n.as_str())
                    .map(|v| (*v).clone())
                    .ok_or_else(|| mismatch(format!("no value for parameter '{}'", n))),
            }
        };

        let source = self.bind_source(&self.source, &mut resolve, &values)?;
        let kind = match &self.kind {
            QueryKind::Update(assignments) => QueryKind::Update(
                assignments
                    .iter()
                    .map(|a| {
                        let operand = Operand::Value(resolve(a.operand())?);
                        Ok(Assignment {
                            property: a.property.clone(),
                            value: match a.value {
                                AssignmentValue::Set(_) => AssignmentValue::Set(operand),
                                AssignmentValue::Increment(_) => AssignmentValue::Increment(operand),
                            },
                        })
                    })
                    .collect::<CoreResult<_>>()?,
            ),
            other => other.clone(),
        };

        // runtime sort from the page request or a Sort parameter
        let runtime = page
            .as_ref()
            .map(|p| p.sort().clone())
            .or(runtime_sort)
            .unwrap_or_default();
        for order in &runtime.orders {
            self.check_runtime_sort(registry, order)?;
        }
        let sort = runtime.merged_with(&self.sort);

        let (selection, projection, mut fetch) = match &self.projection {
            ProjectionMode::Entity => (self.selection.clone(), None, self.fetch.clone()),
            ProjectionMode::Static(shape) => (self.selection.clone(), Some(shape.clone()), self.fetch.clone()),
            ProjectionMode::Dynamic => {
                let shape = dynamic.ok_or_else(|| mismatch("a projection type is required".to_string()))?;
                if matches!(self.source, TemplateSource::Native { .. }) {
                    (Selection::Columns, Some(shape.clone()), self.fetch.clone())
                } else {
                    let plan = ProjectionBinder::plan(registry, &self.entity, shape)?;
                    let mut fetch = self.fetch.clone();
                    fetch.merge(&plan.fetch);
                    (plan.selection, Some(shape.clone()), fetch)
                }
            }
        };
        if !matches!(selection, Selection::Entity) {
            // closed projections join only what their paths need
            fetch = FetchPlan {
                joins: fetch.joins.into_iter().filter(|j| selection_uses(&selection, &j.path)).collect(),
            };
        }

        let (window, empty) = match (self.returns, page.as_ref()) {
            (ReturnShape::Page, Some(p)) | (ReturnShape::List, Some(p)) | (ReturnShape::One, Some(p)) | (ReturnShape::Optional, Some(p)) => {
                match PageComputer::page_window(p, self.top) {
                    Some(w) => (Some(w), false),
                    None => (None, true),
                }
            }
            (ReturnShape::Slice, Some(p)) => match PageComputer::slice_window(p, self.top) {
                Some(w) => (Some(w), false),
                None => (None, true),
            },
            (ReturnShape::Exists, _) => (Some(Window { offset: 0, limit: 1 }), false),
            (_, _) => (self.top.map(|n| Window { offset: 0, limit: n }), false),
        };

        let spec = QuerySpecification {
            entity: self.entity.clone(),
            kind,
            source,
            selection,
            distinct: self.distinct,
            sort,
            window,
            fetch,
            lock: self.lock,
            hints: self.hints.clone(),
        };

        let count = match self.returns {
            ReturnShape::Page => Some(match &self.count_source {
                Some(count_source) => {
                    let source = self.bind_source(count_source, &mut resolve, &values)?;
                    // a declared count query is used as written
                    QuerySpecification {
                        source,
                        fetch: FetchPlan::none(),
                        ..spec.to_count()
                    }
                }
                None => spec.to_count(),
            }),
            _ => None,
        };

        debug!(method = %self.method, entity = %self.entity, "bound query template");

        Ok(BoundQuery {
            spec,
            count,
            page,
            top: self.top,
            empty,
            projection,
            modifying: self.modifying,
        })
    }

    fn bind_source(
        &self,
        source: &TemplateSource,
        resolve: &mut impl FnMut(&Operand) -> CoreResult<Value>,
        values: &[(&str, Value)],
    ) -> CoreResult<QuerySource> {
        match source {
            TemplateSource::Predicate(None) => Ok(QuerySource::Predicate(None)),
            TemplateSource::Predicate(Some(p)) => Ok(QuerySource::Predicate(Some(p.bind_operands(resolve)?))),
            TemplateSource::Native {
                statement,
                returns_count,
            } => {
                let native = statement.bind(*returns_count, |placeholder| match placeholder {
                    Placeholder::Named(n) => values
                        .iter()
                        .find(|(name, _)| name == n)
                        .map(|(_, v)| v.clone())
                        .ok_or_else(|| CoreError::ArgumentMismatch {
                            method: self.method.clone(),
                            reason: format!("no value for ':{}'", n),
                        }),
                    Placeholder::Positional(i) => {
                        values
                            .get(*i)
                            .map(|(_, v)| v.clone())
                            .ok_or_else(|| CoreError::ArgumentMismatch {
                                method: self.method.clone(),
                                reason: format!("no value for positional parameter {}", i + 1),
                            })
                    }
                })?;
                Ok(QuerySource::Native(native))
            }
        }
    }

    fn check_runtime_sort(&self, registry: &EntityRegistry, order: &Order) -> CoreResult<()> {
        let invalid = || CoreError::InvalidSort {
            entity: self.entity.clone(),
            property: order.property.clone(),
        };
        match &self.source {
            TemplateSource::Native { .. } => {
                if order.property.is_empty()
                    || !order
                        .property
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
                {
                    return Err(invalid());
                }
                Ok(())
            }
            TemplateSource::Predicate(_) => registry
                .resolve_path(&self.entity, &order.property)
                .map(|_| ())
                .map_err(|_| invalid()),
        }
    }
}

fn selection_uses(selection: &Selection, relation_path: &str) -> bool {
    match selection {
        Selection::Paths(paths) => paths
            .iter()
            .any(|p| p.starts_with(relation_path) && p[relation_path.len()..].starts_with('.')),
        _ => true,
    }
}

// =============================================================================
// Derivation Engine
// =============================================================================

/// Validates method contracts against a registry and builds templates.
pub struct QueryDerivationEngine<'a> {
    registry: &'a EntityRegistry,
    default_modifying: Modifying,
}

/// Parameter bookkeeping shared by the derivation paths.
struct ParamScope<'c> {
    method: &'c str,
    values: Vec<&'c ParamDecl>,
    used: BTreeSet<usize>,
}

impl<'c> ParamScope<'c> {
    fn by_name(&mut self, name: &str) -> Result<&'c ParamDecl, DerivationError> {
        let index = self
            .values
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| DerivationError::UnknownParameter {
                method: self.method.to_string(),
                name: name.to_string(),
            })?;
        self.used.insert(index);
        Ok(self.values[index])
    }

    fn by_index(&mut self, index: usize) -> Result<&'c ParamDecl, DerivationError> {
        let param = self.values.get(index).ok_or_else(|| DerivationError::ArityMismatch {
            method: self.method.to_string(),
            expected: index + 1,
            actual: self.values.len(),
        })?;
        self.used.insert(index);
        Ok(*param)
    }

    fn check_all_used(&self) -> Result<(), DerivationError> {
        match (0..self.values.len()).find(|i| !self.used.contains(i)) {
            Some(i) => Err(DerivationError::UnusedParameter {
                method: self.method.to_string(),
                name: self.values[i].name.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Intermediate result of one derivation path.
struct Derived {
    kind: QueryKind,
    source: TemplateSource,
    selection_hint: Option<ProjectionShape>,
    distinct: bool,
    sort: Sort,
    top: Option<u64>,
    fetch: Vec<String>,
}

impl<'a> QueryDerivationEngine<'a> {
    pub fn new(registry: &'a EntityRegistry) -> Self {
        QueryDerivationEngine {
            registry,
            default_modifying: Modifying::default(),
        }
    }

    /// Policy for mutations whose contract does not declare one.
    pub fn with_default_modifying(mut self, policy: Modifying) -> Self {
        self.default_modifying = policy;
        self
    }

    pub fn derive(&self, entity: &str, contract: &MethodContract) -> Result<QueryTemplate, DerivationError> {
        let method = contract.name.as_str();
        let descriptor = self.registry.require(entity)?;

        let pageables = contract.params.iter().filter(|p| p.ty == ParamType::Pageable).count();
        let sorts = contract.params.iter().filter(|p| p.ty == ParamType::Sort).count();
        if pageables > 1 || sorts > 1 || (pageables == 1 && sorts == 1) {
            return Err(DerivationError::SpecialParameterConflict {
                method: method.to_string(),
                reason: "at most one page request or one sort parameter".to_string(),
            });
        }
        if matches!(contract.returns, ReturnShape::Page | ReturnShape::Slice) && pageables == 0 {
            return Err(self.shape_error(method, "Page and Slice returns need a page request parameter"));
        }

        let mut scope = ParamScope {
            method,
            values: contract.params.iter().filter(|p| !p.ty.is_special()).collect(),
            used: BTreeSet::new(),
        };

        let implicit_named = format!("{}.{}", entity, method);
        let derived = match &contract.query {
            QueryOverride::Declared(query) => self.from_declared(entity, contract, query, &mut scope)?,
            QueryOverride::Native(sql) => self.from_native(contract, sql, &mut scope)?,
            QueryOverride::Named(name) => {
                let query = self
                    .registry
                    .named_query(name)
                    .ok_or_else(|| DerivationError::UnknownNamedQuery { name: name.clone() })?;
                self.from_declared(entity, contract, query, &mut scope)?
            }
            QueryOverride::None => match self.registry.named_query(&implicit_named) {
                Some(query) => self.from_declared(entity, contract, query, &mut scope)?,
                None => self.from_name(entity, contract, &mut scope)?,
            },
        };

        let count_source = match &contract.count_query {
            None => None,
            Some(_) if contract.returns != ReturnShape::Page => {
                return Err(self.shape_error(method, "a count query only applies to Page returns"));
            }
            Some(CountOverride::Native(sql)) => {
                let statement = NativeStatement::parse(method, sql)?;
                self.check_native_params(method, &statement, &mut scope, false)?;
                Some(TemplateSource::Native {
                    statement,
                    returns_count: true,
                })
            }
            Some(CountOverride::Declared(query)) => {
                if query.is_modifying() {
                    return Err(self.shape_error(method, "a count query must be a select"));
                }
                let filter = match &query.filter {
                    Some(p) => Some(self.check_declared_predicate(entity, p, &mut scope)?),
                    None => None,
                };
                Some(TemplateSource::Predicate(filter))
            }
        };

        // return shape against the query kind
        match (&derived.kind, contract.returns) {
            (QueryKind::Select, r) if r.is_rows() => {}
            (QueryKind::Count, ReturnShape::Count) | (QueryKind::Exists, ReturnShape::Exists) => {}
            (QueryKind::Update(_) | QueryKind::Delete, ReturnShape::Affected) => {}
            (kind, returns) => {
                return Err(self.shape_error(method, &format!("{:?} cannot return {:?}", kind, returns)));
            }
        }
        if contract.modifying.is_some() && !derived.kind.is_mutation() {
            return Err(self.shape_error(method, "only update and delete queries can be modifying"));
        }

        // projection
        let projection = match (&contract.projection, derived.selection_hint) {
            (ProjectionMode::Entity, Some(shape)) => ProjectionMode::Static(shape),
            (mode, _) => mode.clone(),
        };
        if projection != ProjectionMode::Entity && !(derived.kind == QueryKind::Select && contract.returns.is_rows()) {
            return Err(self.shape_error(method, "projections apply to row-returning select queries only"));
        }
        let is_native = matches!(derived.source, TemplateSource::Native { .. });
        let mut fetch = FetchPlan::none();
        let selection = match &projection {
            ProjectionMode::Entity => Selection::Entity,
            ProjectionMode::Static(_) | ProjectionMode::Dynamic if is_native => Selection::Columns,
            ProjectionMode::Static(shape) => {
                let plan = ProjectionBinder::plan(self.registry, entity, shape)?;
                fetch.merge(&plan.fetch);
                plan.selection
            }
            // resolved per call
            ProjectionMode::Dynamic => Selection::Paths(Vec::new()),
        };

        // entity graph, declared fetches and eager relations
        if derived.kind == QueryKind::Select && !is_native {
            for path in contract.entity_graph.iter().chain(&derived.fetch) {
                self.registry.resolve_relation_path(entity, path)?;
                fetch.add(path, JoinKind::Left);
            }
            if selection == Selection::Entity {
                for relation in descriptor.to_one_relations() {
                    if relation.fetch == FetchType::Eager {
                        fetch.add(&relation.name, JoinKind::Left);
                    }
                }
            }
        } else if !contract.entity_graph.is_empty() {
            return Err(self.shape_error(method, "entity graphs apply to derived or declared selects only"));
        }

        LockManager::validate(method, &contract.lock, &derived.kind, &selection, derived.distinct)?;
        if !contract.lock.is_none() && is_native {
            return Err(DerivationError::InvalidLock {
                method: method.to_string(),
                reason: "native queries cannot be locked".to_string(),
            });
        }

        let modifying = match derived.kind {
            QueryKind::Update(_) | QueryKind::Delete => contract.modifying.unwrap_or(self.default_modifying),
            _ => Modifying::default(),
        };

        debug!(
            method,
            entity,
            kind = ?derived.kind,
            returns = ?contract.returns,
            "derived query template"
        );

        Ok(QueryTemplate {
            method: method.to_string(),
            entity: entity.to_string(),
            returns: contract.returns,
            params: contract.params.clone(),
            kind: derived.kind,
            source: derived.source,
            count_source,
            selection,
            projection,
            distinct: derived.distinct,
            sort: derived.sort,
            top: derived.top,
            fetch,
            lock: contract.lock,
            hints: contract.hints.clone(),
            modifying,
        })
    }

    fn shape_error(&self, method: &str, reason: &str) -> DerivationError {
        DerivationError::InvalidReturnShape {
            method: method.to_string(),
            reason: reason.to_string(),
        }
    }

    // -------------------------------------------------------------------------
    // Name derivation
    // -------------------------------------------------------------------------

    fn from_name(&self, entity: &str, contract: &MethodContract, scope: &mut ParamScope<'_>) -> Result<Derived, DerivationError> {
        let method = contract.name.as_str();
        let tree: PartTree = grammar::parse(method)?;

        let expected: usize = tree.parts().map(|p| p.comparator.arity()).sum();
        if expected != scope.values.len() {
            return Err(DerivationError::ArityMismatch {
                method: method.to_string(),
                expected,
                actual: scope.values.len(),
            });
        }

        let mut next_param = 0usize;
        let mut alternatives = Vec::new();
        for group in &tree.alternatives {
            let mut conjuncts = Vec::new();
            for part in group {
                let (path, comparator, ty) = match path::resolve_token(self.registry, entity, &part.property) {
                    Ok((path, resolved)) => (path, part.comparator, resolved.semantic_type()),
                    Err(err) => {
                        // `findByCheckIn` where `checkIn` is the property
                        match path::resolve_token(self.registry, entity, &part.token) {
                            Ok((path, resolved)) if part.comparator != Comparator::Eq => {
                                (path, Comparator::Eq, resolved.semantic_type())
                            }
                            _ => return Err(err),
                        }
                    }
                };

                if !comparator.supports(ty) {
                    return Err(DerivationError::UnsupportedComparator {
                        path,
                        comparator: comparator.to_string(),
                        ty,
                    });
                }
                if part.ignore_case && ty != SemanticType::Text {
                    return Err(DerivationError::UnsupportedComparator {
                        path,
                        comparator: "IgnoreCase".to_string(),
                        ty,
                    });
                }

                let mut operands = Vec::new();
                for _ in 0..comparator.arity() {
                    let param = scope.by_index(next_param)?;
                    check_param_type(method, param, comparator, ty)?;
                    operands.push(Operand::Param(next_param));
                    next_param += 1;
                }

                conjuncts.push(Predicate::Compare(Comparison {
                    path,
                    comparator,
                    operands,
                    ignore_case: part.ignore_case || (tree.all_ignore_case && ty == SemanticType::Text),
                }));
            }
            alternatives.push(conjunction(conjuncts));
        }
        // comparators with arity 0 may have dropped params the arity check counted
        if next_param != scope.values.len() {
            return Err(DerivationError::ArityMismatch {
                method: method.to_string(),
                expected: next_param,
                actual: scope.values.len(),
            });
        }

        let predicate = match alternatives.len() {
            0 => None,
            1 => alternatives.pop(),
            _ => Some(Predicate::Or(alternatives)),
        };

        let mut sort = Sort::unsorted();
        for (token, direction) in &tree.orders {
            let (path, _) = path::resolve_token(self.registry, entity, token)?;
            sort = sort.and(Order {
                property: path,
                direction: *direction,
            });
        }

        let kind = match tree.subject.kind {
            SubjectKind::Select => QueryKind::Select,
            SubjectKind::Count => QueryKind::Count,
            SubjectKind::Exists => QueryKind::Exists,
            SubjectKind::Delete => QueryKind::Delete,
        };

        Ok(Derived {
            kind,
            source: TemplateSource::Predicate(predicate),
            selection_hint: None,
            distinct: tree.subject.distinct,
            sort,
            top: tree.subject.top,
            fetch: Vec::new(),
        })
    }

    // -------------------------------------------------------------------------
    // Declared queries
    // -------------------------------------------------------------------------

    fn from_declared(
        &self,
        entity: &str,
        contract: &MethodContract,
        query: &DeclaredQuery,
        scope: &mut ParamScope<'_>,
    ) -> Result<Derived, DerivationError> {
        let method = contract.name.as_str();

        let kind = match &query.kind {
            DeclaredKind::Select => match contract.returns {
                ReturnShape::Count => QueryKind::Count,
                ReturnShape::Exists => QueryKind::Exists,
                _ => QueryKind::Select,
            },
            DeclaredKind::Delete => QueryKind::Delete,
            DeclaredKind::Update(assignments) => {
                if assignments.is_empty() {
                    return Err(self.shape_error(method, "an update needs at least one assignment"));
                }
                for assignment in assignments {
                    let ty = assignment.validate(self.registry, entity)?;
                    self.check_operand(method, &assignment.property, assignment.operand(), ParamType::Scalar(ty), scope)?;
                }
                QueryKind::Update(assignments.clone())
            }
        };

        let filter = match &query.filter {
            Some(p) => Some(self.check_declared_predicate(entity, p, scope)?),
            None => None,
        };
        scope.check_all_used()?;

        for order in &query.sort.orders {
            self.registry.resolve_path(entity, &order.property)?;
        }

        Ok(Derived {
            kind,
            source: TemplateSource::Predicate(filter),
            selection_hint: query.projection.clone(),
            distinct: query.distinct,
            sort: query.sort.clone(),
            top: None,
            fetch: query.fetch.clone(),
        })
    }

    fn check_declared_predicate(
        &self,
        entity: &str,
        predicate: &Predicate,
        scope: &mut ParamScope<'_>,
    ) -> Result<Predicate, DerivationError> {
        let method = scope.method;
        for comparison in predicate.comparisons() {
            let resolved = self.registry.resolve_path(entity, &comparison.path)?;
            let ty = resolved.semantic_type();
            let comparator = comparison.comparator;
            if !comparator.supports(ty) || (comparison.ignore_case && ty != SemanticType::Text) {
                return Err(DerivationError::UnsupportedComparator {
                    path: comparison.path.clone(),
                    comparator: comparator.to_string(),
                    ty,
                });
            }
            if comparison.operands.len() != comparator.arity() {
                return Err(DerivationError::ArityMismatch {
                    method: method.to_string(),
                    expected: comparator.arity(),
                    actual: comparison.operands.len(),
                });
            }
            let expected = if comparator.takes_collection() {
                ParamType::Collection(ty)
            } else {
                ParamType::Scalar(ty)
            };
            for operand in &comparison.operands {
                self.check_operand(method, &comparison.path, operand, expected, scope)?;
            }
        }
        Ok(predicate.clone())
    }

    fn check_operand(
        &self,
        method: &str,
        path: &str,
        operand: &Operand,
        expected: ParamType,
        scope: &mut ParamScope<'_>,
    ) -> Result<(), DerivationError> {
        let param = match operand {
            Operand::Named(name) => scope.by_name(name)?,
            Operand::Param(i) => scope.by_index(*i)?,
            Operand::Value(v) => {
                let ok = match (expected, v) {
                    (ParamType::Collection(ty), Value::List(items)) => items.iter().all(|i| i.conforms_to(ty)),
                    (ParamType::Scalar(ty), v) => v.conforms_to(ty),
                    _ => false,
                };
                if !ok {
                    return Err(DerivationError::ParameterTypeMismatch {
                        method: method.to_string(),
                        parameter: format!("literal for '{}'", path),
                        expected: expected.to_string(),
                        actual: format!("{:?}", v),
                    });
                }
                return Ok(());
            }
        };
        if !param.ty.accepts(expected) {
            return Err(DerivationError::ParameterTypeMismatch {
                method: method.to_string(),
                parameter: param.name.clone(),
                expected: expected.to_string(),
                actual: param.ty.to_string(),
            });
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Native queries
    // -------------------------------------------------------------------------

    fn from_native(&self, contract: &MethodContract, sql: &str, scope: &mut ParamScope<'_>) -> Result<Derived, DerivationError> {
        let method = contract.name.as_str();
        if contract.modifying.is_some() || contract.returns == ReturnShape::Affected {
            return Err(DerivationError::InvalidNativeQuery {
                method: method.to_string(),
                reason: "native statements cannot be modifying".to_string(),
            });
        }

        let statement = NativeStatement::parse(method, sql)?;
        self.check_native_params(method, &statement, scope, true)?;

        let kind = match contract.returns {
            ReturnShape::Count => QueryKind::Count,
            ReturnShape::Exists => QueryKind::Exists,
            _ => QueryKind::Select,
        };
        Ok(Derived {
            source: TemplateSource::Native {
                statement,
                returns_count: kind == QueryKind::Count,
            },
            kind,
            selection_hint: None,
            distinct: false,
            sort: Sort::unsorted(),
            top: None,
            fetch: Vec::new(),
        })
    }

    fn check_native_params(
        &self,
        method: &str,
        statement: &NativeStatement,
        scope: &mut ParamScope<'_>,
        require_all: bool,
    ) -> Result<(), DerivationError> {
        match statement.style() {
            PlaceholderStyle::Named => {
                for name in statement.named_parameters() {
                    scope.by_name(name)?;
                }
                if require_all {
                    scope.check_all_used()?;
                }
            }
            PlaceholderStyle::Positional => {
                let count = statement.positional_count();
                if count > scope.values.len() || (require_all && count != scope.values.len()) {
                    return Err(DerivationError::ArityMismatch {
                        method: method.to_string(),
                        expected: count,
                        actual: scope.values.len(),
                    });
                }
                for i in 0..count {
                    scope.by_index(i)?;
                }
            }
            PlaceholderStyle::None => {
                if require_all && !scope.values.is_empty() {
                    scope.check_all_used()?;
                }
            }
        }
        Ok(())
    }
}

fn conjunction(mut parts: Vec<Predicate>) -> Predicate {
    if parts.len() == 1 {
        parts.remove(0)
    } else {
        Predicate::And(parts)
    }
}

fn check_param_type(method: &str, param: &ParamDecl, comparator: Comparator, ty: SemanticType) -> Result<(), DerivationError> {
    let expected = if comparator.takes_collection() {
        ParamType::Collection(ty)
    } else {
        ParamType::Scalar(ty)
    };
    if param.ty.accepts(expected) {
        Ok(())
    } else {
        Err(DerivationError::ParameterTypeMismatch {
            method: method.to_string(),
            parameter: param.name.clone(),
            expected: expected.to_string(),
            actual: param.ty.to_string(),
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityDescriptor;
    use crate::lock::LockMode;
    use crate::projection::Expr;

    fn registry() -> EntityRegistry {
        let team = EntityDescriptor::builder("Team", "team")
            .id("id", "team_id")
            .property("name", "name", SemanticType::Text)
            .one_to_many("members", "Member", "team")
            .build();
        let member = EntityDescriptor::builder("Member", "member")
            .id("id", "member_id")
            .property("username", "username", SemanticType::Text)
            .property("age", "age", SemanticType::Integer)
            .many_to_one("team", "Team", "team_id", FetchType::Lazy)
            .build();
        EntityRegistry::builder()
            .descriptor(team)
            .descriptor(member)
            .named_query(
                "Member.findByUsername",
                DeclaredQuery::select().filter(Predicate::eq("username", Operand::named("username"))),
            )
            .build()
            .unwrap()
    }

    fn derive(contract: MethodContract) -> Result<QueryTemplate, DerivationError> {
        let registry = registry();
        QueryDerivationEngine::new(&registry).derive("Member", &contract)
    }

    #[test]
    fn test_derived_predicate_matches_hand_written() {
        let registry = registry();
        let template = QueryDerivationEngine::new(&registry)
            .derive(
                "Member",
                &MethodContract::new("findByUsernameAndAgeGreaterThan")
                    .text("username")
                    .integer("age"),
            )
            .unwrap();
        let bound = template
            .bind(&registry, &Arguments::new().value("AAA").value(15), None)
            .unwrap();
        let expected = Predicate::eq("username", "AAA").and(Predicate::gt("age", 15));
        assert_eq!(bound.spec.predicate(), Some(&expected));
    }

    #[test]
    fn test_unknown_property_fails_at_derivation() {
        let err = derive(MethodContract::new("findByNickname").text("nickname")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "no property 'nickname' found on entity Member"
        );
    }

    #[test]
    fn test_arity_and_type_mismatch() {
        assert!(matches!(
            derive(MethodContract::new("findByUsernameAndAgeGreaterThan").text("username")),
            Err(DerivationError::ArityMismatch { expected: 2, actual: 1, .. })
        ));
        assert!(matches!(
            derive(MethodContract::new("findByAge").text("age")),
            Err(DerivationError::ParameterTypeMismatch { .. })
        ));
        assert!(matches!(
            derive(MethodContract::new("findByUsernameIn").text("names")),
            Err(DerivationError::ParameterTypeMismatch { .. })
        ));
        assert!(matches!(
            derive(MethodContract::new("findByAgeLike").integer("age")),
            Err(DerivationError::UnsupportedComparator { .. })
        ));
    }

    #[test]
    fn test_return_shape_rules() {
        assert!(matches!(
            derive(MethodContract::new("findByUsername").text("username").returns(ReturnShape::Page)),
            Err(DerivationError::InvalidReturnShape { .. })
        ));
        assert!(matches!(
            derive(MethodContract::new("countByAge").integer("age").returns(ReturnShape::List)),
            Err(DerivationError::InvalidReturnShape { .. })
        ));
        assert!(derive(MethodContract::new("countByAge").integer("age").returns(ReturnShape::Count)).is_ok());
        assert!(matches!(
            derive(MethodContract::new("findByAge").integer("age").pageable().sort()),
            Err(DerivationError::SpecialParameterConflict { .. })
        ));
    }

    #[test]
    fn test_named_query_precedence() {
        // "Member.findByUsername" is registered; the declared filter wins
        let registry = registry();
        let template = QueryDerivationEngine::new(&registry)
            .derive("Member", &MethodContract::new("findByUsername").text("username"))
            .unwrap();
        let bound = template.bind(&registry, &Arguments::new().value("m1"), None).unwrap();
        assert_eq!(bound.spec.predicate(), Some(&Predicate::eq("username", "m1")));

        assert!(matches!(
            derive(MethodContract::new("findUser").text("username").named_query("Member.missing")),
            Err(DerivationError::UnknownNamedQuery { .. })
        ));
    }

    #[test]
    fn test_declared_query_parameters() {
        let query = DeclaredQuery::select().filter(
            Predicate::eq("username", Operand::named("username")).and(Predicate::eq("age", Operand::named("age"))),
        );
        assert!(derive(MethodContract::new("findUser").text("username").integer("age").declared(query.clone())).is_ok());
        assert!(matches!(
            derive(MethodContract::new("findUser").text("username").declared(query.clone())),
            Err(DerivationError::UnknownParameter { .. })
        ));
        assert!(matches!(
            derive(
                MethodContract::new("findUser")
                    .text("username")
                    .integer("age")
                    .text("extra")
                    .declared(query)
            ),
            Err(DerivationError::UnusedParameter { .. })
        ));
    }

    #[test]
    fn test_page_binding_and_count() {
        let registry = registry();
        let template = QueryDerivationEngine::new(&registry)
            .derive(
                "Member",
                &MethodContract::new("findByAge")
                    .integer("age")
                    .pageable()
                    .returns(ReturnShape::Page),
            )
            .unwrap();
        let request = PageRequest::sorted(1, 3, Sort::by_desc(&["username"])).unwrap();
        let bound = template
            .bind(&registry, &Arguments::new().value(10).page(request), None)
            .unwrap();
        assert_eq!(bound.spec.window, Some(Window { offset: 3, limit: 3 }));
        assert_eq!(bound.spec.sort, Sort::by_desc(&["username"]));
        let count = bound.count.unwrap();
        assert_eq!(count.kind, QueryKind::Count);
        assert!(count.sort.is_unsorted());
    }

    #[test]
    fn test_runtime_sort_is_validated() {
        let registry = registry();
        let template = QueryDerivationEngine::new(&registry)
            .derive("Member", &MethodContract::new("findByAge").integer("age").sort())
            .unwrap();
        let result = template.bind(
            &registry,
            &Arguments::new().value(10).sort(Sort::by(&["nickname"])),
            None,
        );
        assert!(matches!(result, Err(CoreError::InvalidSort { .. })));
    }

    #[test]
    fn test_call_time_argument_checks() {
        let registry = registry();
        let template = QueryDerivationEngine::new(&registry)
            .derive("Member", &MethodContract::new("findByUsernameIn").collection("names", SemanticType::Text))
            .unwrap();
        assert!(template
            .bind(&registry, &Arguments::new().value(vec!["m1", "m2"]), None)
            .is_ok());
        assert!(matches!(
            template.bind(&registry, &Arguments::new().value("m1"), None),
            Err(CoreError::ArgumentMismatch { .. })
        ));
        assert!(matches!(
            template.bind(&registry, &Arguments::new(), None),
            Err(CoreError::ArgumentMismatch { .. })
        ));
    }

    #[test]
    fn test_entity_graph_and_projection_plans() {
        let template = derive(MethodContract::new("findMemberEntityGraphBy").entity_graph(&["team"])).unwrap();
        assert!(template.fetch().contains("team"));

        let template = derive(
            MethodContract::new("findProjectionsByUsername")
                .text("username")
                .projection(ProjectionShape::closed().field("username")),
        )
        .unwrap();
        assert!(template.fetch().is_empty());

        let template = derive(
            MethodContract::new("findOpenByUsername")
                .text("username")
                .projection(ProjectionShape::open().expr("label", Expr::template("{username} {team.name}"))),
        )
        .unwrap();
        assert!(template.fetch().contains("team"));
    }

    #[test]
    fn test_lock_validation() {
        let template = derive(MethodContract::new("findLockByUsername").text("username").lock(LockRequest::write())).unwrap();
        let registry = registry();
        let bound = template.bind(&registry, &Arguments::new().value("m1"), None).unwrap();
        assert_eq!(bound.spec.lock.mode, LockMode::PessimisticWrite);

        assert!(matches!(
            derive(
                MethodContract::new("findByUsername")
                    .text("username")
                    .projection(ProjectionShape::closed().field("username"))
                    .lock(LockRequest::write())
            ),
            Err(DerivationError::InvalidLock { .. })
        ));

        assert!(matches!(
            derive(
                MethodContract::new("findLockedNative")
                    .text("username")
                    .native("select * from member where username = ?")
                    .lock(LockRequest::write())
            ),
            Err(DerivationError::InvalidLock { .. })
        ));
    }

    #[test]
    fn test_bulk_update_template() {
        let registry = registry();
        let template = QueryDerivationEngine::new(&registry)
            .derive(
                "Member",
                &MethodContract::new("bulkAgePlus")
                    .integer("age")
                    .returns(ReturnShape::Affected)
                    .declared(
                        DeclaredQuery::update(vec![Assignment::increment("age", 1)])
                            .filter(Predicate::ge("age", Operand::named("age"))),
                    ),
            )
            .unwrap();
        assert!(template.kind().is_mutation());
        let bound = template.bind(&registry, &Arguments::new().value(20), None).unwrap();
        assert!(bound.modifying.clear_automatically);
        assert_eq!(bound.spec.predicate(), Some(&Predicate::ge("age", 20)));
    }

    #[test]
    fn test_native_query_binding() {
        let registry = registry();
        let template = QueryDerivationEngine::new(&registry)
            .derive(
                "Member",
                &MethodContract::new("findByNativeQuery")
                    .text("username")
                    .returns(ReturnShape::Optional)
                    .native("select * from member where username = :username"),
            )
            .unwrap();
        let bound = template.bind(&registry, &Arguments::new().value("m1"), None).unwrap();
        match &bound.spec.source {
            QuerySource::Native(native) => {
                assert_eq!(native.sql, "select * from member where username = ?");
                assert_eq!(native.params, vec![Value::from("m1")]);
            }
            other => panic!("expected native source, got {:?}", other),
        }

        assert!(matches!(
            derive(
                MethodContract::new("findNative")
                    .text("username")
                    .native("select * from member where username = :name")
            ),
            Err(DerivationError::UnknownParameter { .. })
        ));
    }

    #[test]
    fn test_top_with_list() {
        let registry = registry();
        let template = QueryDerivationEngine::new(&registry)
            .derive("Member", &MethodContract::new("findTop3HelloBy"))
            .unwrap();
        let bound = template.bind(&registry, &Arguments::new(), None).unwrap();
        assert_eq!(bound.spec.window, Some(Window { offset: 0, limit: 3 }));
        assert!(bound.spec.predicate().is_none());
    }
}
