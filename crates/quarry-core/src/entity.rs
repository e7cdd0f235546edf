//! # Entity Metadata
//!
//! Static descriptions of persisted types and the registry that owns them.
//!
//! ## Descriptor Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    EntityDescriptor ("Member")                          │
//! │                                                                         │
//! │  table: member                                                         │
//! │  id:    id ─────────────► member_id  INTEGER (generated)               │
//! │                                                                         │
//! │  properties (ordered)                                                  │
//! │  ├── username ──────────► username   TEXT       not null               │
//! │  ├── age ───────────────► age        INTEGER    not null               │
//! │  └── created_date ──────► created_date TEXT     nullable, no update    │
//! │                                                                         │
//! │  relations                                                             │
//! │  └── team ──► Team  ManyToOne  LAZY  join column team_id               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Registry Lifecycle
//! Descriptors are registered once while the [`EntityRegistry`] is built.
//! After [`EntityRegistryBuilder::build`] the registry is immutable and may be
//! shared freely between threads (`Arc<EntityRegistry>`); query derivation
//! only ever reads it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::derivation::DeclaredQuery;
use crate::error::{BindError, CoreError, CoreResult, DerivationError};
use crate::value::{SemanticType, Value};

// =============================================================================
// Descriptor Types
// =============================================================================

/// How many target rows a relation points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Cardinality {
    ManyToOne,
    OneToOne,
    OneToMany,
}

impl Cardinality {
    /// To-one relations own a join column and can be joined in a single row.
    pub fn is_to_one(&self) -> bool {
        matches!(self, Cardinality::ManyToOne | Cardinality::OneToOne)
    }
}

/// Default loading strategy of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum FetchType {
    #[default]
    Lazy,
    Eager,
}

/// The identifier property. Identifiers are always generated integers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdDescriptor {
    pub name: String,
    pub column: String,
}

/// A scalar property mapped to one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyDescriptor {
    pub name: String,
    pub column: String,
    pub ty: SemanticType,
    pub nullable: bool,
    pub insertable: bool,
    pub updatable: bool,
}

impl PropertyDescriptor {
    pub fn new(name: impl Into<String>, column: impl Into<String>, ty: SemanticType) -> Self {
        PropertyDescriptor {
            name: name.into(),
            column: column.into(),
            ty,
            nullable: false,
            insertable: true,
            updatable: true,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Column is written on insert only (e.g. a creation timestamp).
    pub fn not_updatable(mut self) -> Self {
        self.updatable = false;
        self
    }
}

/// A relation to another registered entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationDescriptor {
    pub name: String,
    pub target: String,
    pub cardinality: Cardinality,
    pub fetch: FetchType,
    /// Foreign key column on this entity's table (to-one only).
    pub join_column: Option<String>,
    /// Owning to-one relation on the target (to-many only).
    pub mapped_by: Option<String>,
}

/// Static metadata for one persisted type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityDescriptor {
    pub name: String,
    pub table: String,
    pub id: IdDescriptor,
    pub properties: Vec<PropertyDescriptor>,
    pub relations: Vec<RelationDescriptor>,
}

impl EntityDescriptor {
    /// Starts a descriptor for `name` stored in `table`.
    ///
    /// ## Example
    /// ```rust
    /// use quarry_core::entity::{EntityDescriptor, FetchType};
    /// use quarry_core::value::SemanticType;
    ///
    /// let member = EntityDescriptor::builder("Member", "member")
    ///     .id("id", "member_id")
    ///     .property("username", "username", SemanticType::Text)
    ///     .many_to_one("team", "Team", "team_id", FetchType::Lazy)
    ///     .build();
    /// assert!(member.property("username").is_some());
    /// ```
    pub fn builder(name: impl Into<String>, table: impl Into<String>) -> EntityDescriptorBuilder {
        let name = name.into();
        EntityDescriptorBuilder {
            descriptor: EntityDescriptor {
                name,
                table: table.into(),
                id: IdDescriptor {
                    name: "id".to_string(),
                    column: "id".to_string(),
                },
                properties: Vec::new(),
                relations: Vec::new(),
            },
        }
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDescriptor> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// To-one relations, in declaration order.
    pub fn to_one_relations(&self) -> impl Iterator<Item = &RelationDescriptor> {
        self.relations.iter().filter(|r| r.cardinality.is_to_one())
    }

    /// Converts a flat column map (as returned by a native query) into a
    /// record of this entity. Unknown columns are ignored.
    pub fn record_from_columns(&self, columns: &BTreeMap<String, Value>) -> Record {
        let mut record = Record::new(&self.name);
        if let Some(id) = columns.get(&self.id.column).and_then(Value::as_i64) {
            record.id = Some(id);
        }
        for property in &self.properties {
            if let Some(value) = columns.get(&property.column) {
                record.set(&property.name, value.clone());
            }
        }
        for relation in self.to_one_relations() {
            let Some(column) = relation.join_column.as_deref() else {
                continue;
            };
            let state = match columns.get(column).and_then(Value::as_i64) {
                Some(id) => RelationState::Unloaded(id),
                None => RelationState::Absent,
            };
            record.set_relation(&relation.name, state);
        }
        record
    }
}

/// Fluent builder for [`EntityDescriptor`].
#[derive(Debug, Clone)]
pub struct EntityDescriptorBuilder {
    descriptor: EntityDescriptor,
}

impl EntityDescriptorBuilder {
    pub fn id(mut self, name: impl Into<String>, column: impl Into<String>) -> Self {
        self.descriptor.id = IdDescriptor {
            name: name.into(),
            column: column.into(),
        };
        self
    }

    /// Adds a non-null property.
    pub fn property(self, name: &str, column: &str, ty: SemanticType) -> Self {
        self.with_property(PropertyDescriptor::new(name, column, ty))
    }

    pub fn with_property(mut self, property: PropertyDescriptor) -> Self {
        self.descriptor.properties.push(property);
        self
    }

    pub fn many_to_one(mut self, name: &str, target: &str, join_column: &str, fetch: FetchType) -> Self {
        self.descriptor.relations.push(RelationDescriptor {
            name: name.to_string(),
            target: target.to_string(),
            cardinality: Cardinality::ManyToOne,
            fetch,
            join_column: Some(join_column.to_string()),
            mapped_by: None,
        });
        self
    }

    pub fn one_to_many(mut self, name: &str, target: &str, mapped_by: &str) -> Self {
        self.descriptor.relations.push(RelationDescriptor {
            name: name.to_string(),
            target: target.to_string(),
            cardinality: Cardinality::OneToMany,
            fetch: FetchType::Lazy,
            join_column: None,
            mapped_by: Some(mapped_by.to_string()),
        });
        self
    }

    pub fn build(self) -> EntityDescriptor {
        self.descriptor
    }
}

// =============================================================================
// Property Paths
// =============================================================================

/// What a resolved path ends at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathLeaf {
    /// The identifier of the owning entity.
    Id,
    /// A scalar property.
    Property {
        name: String,
        ty: SemanticType,
        nullable: bool,
    },
    /// A to-one relation, compared through its foreign key.
    Relation { name: String },
}

/// A dotted property path validated against the registry.
///
/// `relations` lists the to-one relations walked from the root; the leaf
/// lives on the entity reached after the last of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub root: String,
    pub relations: Vec<String>,
    pub leaf: PathLeaf,
}

impl ResolvedPath {
    pub fn semantic_type(&self) -> SemanticType {
        match &self.leaf {
            PathLeaf::Id | PathLeaf::Relation { .. } => SemanticType::Integer,
            PathLeaf::Property { ty, .. } => *ty,
        }
    }

    pub fn leaf_name<'a>(&'a self, registry: &'a EntityRegistry) -> &'a str {
        match &self.leaf {
            PathLeaf::Id => registry
                .entity_at(&self.root, &self.relations)
                .map(|d| d.id.name.as_str())
                .unwrap_or("id"),
            PathLeaf::Property { name, .. } | PathLeaf::Relation { name } => name,
        }
    }

    /// Dotted form, e.g. `team.name`.
    pub fn dotted(&self, registry: &EntityRegistry) -> String {
        let mut parts: Vec<&str> = self.relations.iter().map(String::as_str).collect();
        parts.push(self.leaf_name(registry));
        parts.join(".")
    }
}

// =============================================================================
// Entity Registry
// =============================================================================

/// Process-wide, read-only registry of entity descriptors and named queries.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: HashMap<String, EntityDescriptor>,
    named_queries: HashMap<String, DeclaredQuery>,
}

impl EntityRegistry {
    pub fn builder() -> EntityRegistryBuilder {
        EntityRegistryBuilder::default()
    }

    pub fn get(&self, entity: &str) -> Option<&EntityDescriptor> {
        self.entities.get(entity)
    }

    /// Like [`get`](Self::get) but reports an unknown entity as a derivation error.
    pub fn require(&self, entity: &str) -> Result<&EntityDescriptor, DerivationError> {
        self.get(entity).ok_or_else(|| DerivationError::UnknownEntity {
            entity: entity.to_string(),
        })
    }

    pub fn named_query(&self, name: &str) -> Option<&DeclaredQuery> {
        self.named_queries.get(name)
    }

    /// Walks `relations` from `root` and returns the entity reached.
    pub fn entity_at(&self, root: &str, relations: &[String]) -> Option<&EntityDescriptor> {
        let mut current = self.get(root)?;
        for name in relations {
            let relation = current.relation(name)?;
            current = self.get(&relation.target)?;
        }
        Some(current)
    }

    /// Resolves a dotted path (`username`, `team.name`, `team`) on `root`.
    pub fn resolve_path(&self, root: &str, dotted: &str) -> Result<ResolvedPath, DerivationError> {
        let unknown = || DerivationError::UnknownProperty {
            entity: root.to_string(),
            path: dotted.to_string(),
        };
        let segments: Vec<&str> = dotted.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(unknown());
        }

        let mut current = self.require(root)?;
        let mut relations = Vec::new();

        for (i, segment) in segments.iter().enumerate() {
            let last = i + 1 == segments.len();

            if last {
                let leaf = if *segment == current.id.name {
                    PathLeaf::Id
                } else if let Some(p) = current.property(segment) {
                    PathLeaf::Property {
                        name: p.name.clone(),
                        ty: p.ty,
                        nullable: p.nullable,
                    }
                } else if let Some(r) = current.relation(segment) {
                    if !r.cardinality.is_to_one() {
                        return Err(DerivationError::ToManyPath {
                            entity: root.to_string(),
                            path: dotted.to_string(),
                        });
                    }
                    PathLeaf::Relation { name: r.name.clone() }
                } else {
                    return Err(unknown());
                };
                return Ok(ResolvedPath {
                    root: root.to_string(),
                    relations,
                    leaf,
                });
            }

            let relation = current.relation(segment).ok_or_else(unknown)?;
            if !relation.cardinality.is_to_one() {
                return Err(DerivationError::ToManyPath {
                    entity: root.to_string(),
                    path: dotted.to_string(),
                });
            }
            relations.push(relation.name.clone());
            current = self.require(&relation.target)?;
        }

        Err(unknown())
    }

    /// Validates a fetch path: every segment must be a to-one relation.
    pub fn resolve_relation_path(&self, root: &str, dotted: &str) -> Result<Vec<String>, DerivationError> {
        let mut current = self.require(root)?;
        let mut walked = Vec::new();
        for segment in dotted.split('.') {
            let relation = current
                .relation(segment)
                .ok_or_else(|| DerivationError::UnknownProperty {
                    entity: root.to_string(),
                    path: dotted.to_string(),
                })?;
            if !relation.cardinality.is_to_one() {
                return Err(DerivationError::ToManyPath {
                    entity: root.to_string(),
                    path: dotted.to_string(),
                });
            }
            walked.push(relation.name.clone());
            current = self.require(&relation.target)?;
        }
        Ok(walked)
    }
}

/// Builder collecting descriptors before the registry is frozen.
#[derive(Debug, Default)]
pub struct EntityRegistryBuilder {
    descriptors: Vec<EntityDescriptor>,
    named_queries: Vec<(String, DeclaredQuery)>,
}

impl EntityRegistryBuilder {
    /// Registers a typed entity.
    pub fn entity<E: Entity>(self) -> Self {
        self.descriptor(E::descriptor().clone())
    }

    pub fn descriptor(mut self, descriptor: EntityDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Registers a query under a name such as `Member.findByUsername`.
    pub fn named_query(mut self, name: impl Into<String>, query: DeclaredQuery) -> Self {
        self.named_queries.push((name.into(), query));
        self
    }

    /// Validates every descriptor and freezes the registry.
    ///
    /// ## Checks
    /// - entity names are unique
    /// - property and relation names are unique per entity
    /// - relation targets are registered
    /// - to-one relations have a join column
    /// - to-many relations point back through a to-one `mapped_by`
    pub fn build(self) -> CoreResult<EntityRegistry> {
        let mut entities: HashMap<String, EntityDescriptor> = HashMap::new();
        for descriptor in self.descriptors {
            if entities.contains_key(&descriptor.name) {
                return Err(invalid(&descriptor.name, "registered twice"));
            }
            entities.insert(descriptor.name.clone(), descriptor);
        }

        for descriptor in entities.values() {
            let mut names = vec![descriptor.id.name.as_str()];
            names.extend(descriptor.properties.iter().map(|p| p.name.as_str()));
            names.extend(descriptor.relations.iter().map(|r| r.name.as_str()));
            let mut sorted = names.clone();
            sorted.sort_unstable();
            sorted.dedup();
            if sorted.len() != names.len() {
                return Err(invalid(&descriptor.name, "duplicate property or relation name"));
            }

            for relation in &descriptor.relations {
                let target = entities.get(&relation.target).ok_or_else(|| {
                    invalid(
                        &descriptor.name,
                        &format!("relation '{}' targets unregistered {}", relation.name, relation.target),
                    )
                })?;
                if relation.cardinality.is_to_one() {
                    if relation.join_column.is_none() {
                        return Err(invalid(
                            &descriptor.name,
                            &format!("to-one relation '{}' has no join column", relation.name),
                        ));
                    }
                } else {
                    let back = relation
                        .mapped_by
                        .as_deref()
                        .and_then(|m| target.relation(m))
                        .filter(|b| b.cardinality.is_to_one() && b.target == descriptor.name);
                    if back.is_none() {
                        return Err(invalid(
                            &descriptor.name,
                            &format!("to-many relation '{}' has no owning side", relation.name),
                        ));
                    }
                }
            }
        }

        Ok(EntityRegistry {
            entities,
            named_queries: self.named_queries.into_iter().collect(),
        })
    }
}

fn invalid(entity: &str, reason: &str) -> CoreError {
    CoreError::InvalidDescriptor {
        entity: entity.to_string(),
        reason: reason.to_string(),
    }
}

// =============================================================================
// Records
// =============================================================================

/// Load state of one relation inside a [`Record`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RelationState {
    /// Foreign key is null.
    Absent,
    /// Foreign key is known; the target has not been loaded.
    Unloaded(i64),
    /// Target was join-loaded in the same statement.
    Loaded(Box<Record>),
    /// Lazy to-many collection, loaded on demand.
    Collection,
}

/// A materialized row: scalar values plus relation states.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub entity: String,
    pub id: Option<i64>,
    pub values: BTreeMap<String, Value>,
    pub relations: BTreeMap<String, RelationState>,
}

impl Record {
    pub fn new(entity: &str) -> Self {
        Record {
            entity: entity.to_string(),
            id: None,
            values: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn set_relation(&mut self, name: &str, state: RelationState) {
        self.relations.insert(name.to_string(), state);
    }

    pub fn relation(&self, name: &str) -> Option<&RelationState> {
        self.relations.get(name)
    }

    /// Resolves a dotted path through loaded relations.
    ///
    /// A path crossing an absent relation yields `Value::Null`; crossing an
    /// unloaded one is an error because the caller forgot to fetch it.
    /// The final segment may name the id of whichever entity it lands on.
    pub fn value_at(&self, dotted: &str, registry: &EntityRegistry) -> Result<Value, BindError> {
        let mut current = self;
        let segments: Vec<&str> = dotted.split('.').collect();
        for (i, segment) in segments.iter().enumerate() {
            let last = i + 1 == segments.len();
            if last {
                let id_name = registry.get(&current.entity).map(|d| d.id.name.as_str());
                if id_name == Some(*segment) && !current.values.contains_key(*segment) {
                    return Ok(current.id.map(Value::Integer).unwrap_or(Value::Null));
                }
                if let Some(value) = current.values.get(*segment) {
                    return Ok(value.clone());
                }
                return match current.relations.get(*segment) {
                    Some(RelationState::Absent) => Ok(Value::Null),
                    Some(RelationState::Unloaded(id)) => Ok(Value::Integer(*id)),
                    Some(RelationState::Loaded(target)) => {
                        Ok(target.id.map(Value::Integer).unwrap_or(Value::Null))
                    }
                    _ => Err(BindError::MissingField {
                        owner: current.entity.clone(),
                        field: (*segment).to_string(),
                    }),
                };
            }
            match current.relations.get(*segment) {
                Some(RelationState::Loaded(target)) => current = target,
                Some(RelationState::Absent) => return Ok(Value::Null),
                Some(_) => {
                    return Err(BindError::RelationNotLoaded {
                        entity: current.entity.clone(),
                        relation: (*segment).to_string(),
                    })
                }
                None => {
                    return Err(BindError::MissingField {
                        owner: current.entity.clone(),
                        field: (*segment).to_string(),
                    })
                }
            }
        }
        Err(BindError::MissingField {
            owner: self.entity.clone(),
            field: dotted.to_string(),
        })
    }

    // -------------------------------------------------------------------------
    // Typed accessors used by `Entity::from_record`
    // -------------------------------------------------------------------------

    fn required(&self, field: &str) -> Result<&Value, BindError> {
        match self.values.get(field) {
            Some(Value::Null) | None => Err(BindError::MissingField {
                owner: self.entity.clone(),
                field: field.to_string(),
            }),
            Some(v) => Ok(v),
        }
    }

    pub fn text(&self, field: &str) -> Result<String, BindError> {
        let value = self.required(field)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| mismatch(field, "text", value))
    }

    pub fn integer(&self, field: &str) -> Result<i64, BindError> {
        let value = self.required(field)?;
        value.as_i64().ok_or_else(|| mismatch(field, "integer", value))
    }

    pub fn opt_timestamp(&self, field: &str) -> Result<Option<DateTime<Utc>>, BindError> {
        match self.values.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_timestamp()
                .map(Some)
                .ok_or_else(|| mismatch(field, "timestamp", value)),
        }
    }
}

fn mismatch(field: &str, expected: &str, found: &Value) -> BindError {
    BindError::TypeMismatch {
        field: field.to_string(),
        expected: expected.to_string(),
        found: found
            .semantic_type()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "null".to_string()),
    }
}

// =============================================================================
// Typed Entities
// =============================================================================

/// A Rust type persisted through an [`EntityDescriptor`].
///
/// Implementations are hand-written per entity; the trait only converts
/// between the typed value and its [`Record`].
pub trait Entity: Clone + Send + Sync + 'static {
    fn descriptor() -> &'static EntityDescriptor;

    fn id(&self) -> Option<i64>;

    fn set_id(&mut self, id: i64);

    fn to_record(&self) -> Result<Record, BindError>;

    fn from_record(record: &Record) -> Result<Self, BindError>;

    /// Called right before the first insert.
    fn on_persist(&mut self, _now: DateTime<Utc>) {}

    /// Called right before an update of an existing row.
    fn on_merge(&mut self, _now: DateTime<Utc>) {}
}

/// A typed to-one relation held by an entity.
///
/// ```text
/// None        foreign key is null
/// Lazy(id)    target known by id, not loaded (proxy)
/// Loaded(T)   target materialized (join fetch or explicit load)
/// ```
#[derive(Clone)]
pub enum Reference<T> {
    None,
    Lazy(i64),
    Loaded(Box<T>),
}

impl<T> Default for Reference<T> {
    fn default() -> Self {
        Reference::None
    }
}

impl<T: Entity> Reference<T> {
    pub fn to(entity: T) -> Self {
        Reference::Loaded(Box::new(entity))
    }

    pub fn id(&self) -> Option<i64> {
        match self {
            Reference::None => None,
            Reference::Lazy(id) => Some(*id),
            Reference::Loaded(target) => target.id(),
        }
    }

    pub fn loaded(&self) -> Option<&T> {
        match self {
            Reference::Loaded(target) => Some(target),
            _ => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Reference::Loaded(_))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Reference::None)
    }

    /// Reads the reference held by `relation` of `record`.
    pub fn from_record(record: &Record, relation: &str) -> Result<Self, BindError> {
        match record.relation(relation) {
            None | Some(RelationState::Absent) => Ok(Reference::None),
            Some(RelationState::Unloaded(id)) => Ok(Reference::Lazy(*id)),
            Some(RelationState::Loaded(target)) => Ok(Reference::to(T::from_record(target)?)),
            Some(RelationState::Collection) => Err(BindError::TypeMismatch {
                field: relation.to_string(),
                expected: "to-one reference".to_string(),
                found: "collection".to_string(),
            }),
        }
    }

    /// Converts to a relation state for persisting `owner`.
    pub fn to_state(&self, owner: &str, relation: &str) -> Result<RelationState, BindError> {
        match self {
            Reference::None => Ok(RelationState::Absent),
            Reference::Lazy(id) => Ok(RelationState::Unloaded(*id)),
            Reference::Loaded(target) => {
                if target.id().is_none() {
                    return Err(BindError::TransientReference {
                        entity: owner.to_string(),
                        relation: relation.to_string(),
                    });
                }
                Ok(RelationState::Loaded(Box::new(target.to_record()?)))
            }
        }
    }
}

/// References are equal when they point at the same row.
impl<T: Entity> PartialEq for Reference<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl<T: Entity> fmt::Debug for Reference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::None => write!(f, "None"),
            Reference::Lazy(id) => write!(f, "Lazy({})", id),
            Reference::Loaded(target) => write!(f, "Loaded({:?})", target.id()),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

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
            .build()
            .unwrap()
    }

    #[test]
    fn test_resolve_direct_and_nested_paths() {
        let registry = registry();

        let path = registry.resolve_path("Member", "username").unwrap();
        assert!(path.relations.is_empty());
        assert_eq!(path.semantic_type(), SemanticType::Text);

        let path = registry.resolve_path("Member", "team.name").unwrap();
        assert_eq!(path.relations, vec!["team".to_string()]);
        assert_eq!(path.dotted(&registry), "team.name");

        let path = registry.resolve_path("Member", "team").unwrap();
        assert_eq!(path.leaf, PathLeaf::Relation { name: "team".to_string() });

        let path = registry.resolve_path("Member", "id").unwrap();
        assert_eq!(path.leaf, PathLeaf::Id);
    }

    #[test]
    fn test_resolve_rejects_unknown_and_to_many() {
        let registry = registry();
        assert!(matches!(
            registry.resolve_path("Member", "nickname"),
            Err(DerivationError::UnknownProperty { .. })
        ));
        assert!(matches!(
            registry.resolve_path("Team", "members.username"),
            Err(DerivationError::ToManyPath { .. })
        ));
        assert!(matches!(
            registry.resolve_relation_path("Team", "members"),
            Err(DerivationError::ToManyPath { .. })
        ));
    }

    #[test]
    fn test_registry_rejects_unknown_target() {
        let member = EntityDescriptor::builder("Member", "member")
            .id("id", "member_id")
            .many_to_one("team", "Team", "team_id", FetchType::Lazy)
            .build();
        let result = EntityRegistry::builder().descriptor(member).build();
        assert!(matches!(result, Err(CoreError::InvalidDescriptor { .. })));
    }

    #[test]
    fn test_record_value_at_through_relations() {
        let registry = registry();
        let mut team = Record::new("Team").with_id(7);
        team.set("name", Value::from("teamA"));
        let mut member = Record::new("Member").with_id(1);
        member.set("username", Value::from("m1"));
        member.set_relation("team", RelationState::Loaded(Box::new(team)));

        assert_eq!(member.value_at("team.name", &registry).unwrap(), Value::from("teamA"));
        assert_eq!(member.value_at("id", &registry).unwrap(), Value::Integer(1));
        assert_eq!(member.value_at("team", &registry).unwrap(), Value::Integer(7));

        member.set_relation("team", RelationState::Unloaded(7));
        assert!(matches!(
            member.value_at("team.name", &registry),
            Err(BindError::RelationNotLoaded { .. })
        ));

        member.set_relation("team", RelationState::Absent);
        assert_eq!(member.value_at("team.name", &registry).unwrap(), Value::Null);
    }

    #[test]
    fn test_record_from_native_columns() {
        let registry = registry();
        let member = registry.get("Member").unwrap();
        let mut columns = BTreeMap::new();
        columns.insert("member_id".to_string(), Value::Integer(3));
        columns.insert("username".to_string(), Value::from("m3"));
        columns.insert("team_id".to_string(), Value::Integer(9));
        columns.insert("unrelated".to_string(), Value::from("x"));

        let record = member.record_from_columns(&columns);
        assert_eq!(record.id, Some(3));
        assert_eq!(record.value("username"), Some(&Value::from("m3")));
        assert_eq!(record.relation("team"), Some(&RelationState::Unloaded(9)));
        assert!(record.value("unrelated").is_none());
    }
}
