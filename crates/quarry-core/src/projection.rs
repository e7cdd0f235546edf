//! # Projections
//!
//! Narrow result shapes bound from query rows.
//!
//! ## Cost Model
//! ```text
//! ┌────────────────────────────────────┬────────────────────────────────────┐
//! │ Closed                             │ Open                               │
//! ├────────────────────────────────────┼────────────────────────────────────┤
//! │ SELECT t0.username FROM member t0  │ SELECT t0.*, j0.* FROM member t0   │
//! │                                    │   LEFT JOIN team j0 ON ...         │
//! │ only declared paths (+ join keys)  │ full entity + every relation an    │
//! │ nested shapes join, select subset  │ expression references              │
//! │ → a SELECT optimization            │ → evaluated after loading          │
//! └────────────────────────────────────┴────────────────────────────────────┘
//! ```

use serde::Serialize;
use std::collections::BTreeMap;

use crate::entity::{EntityRegistry, Record, RelationState};
use crate::error::{BindError, DerivationError};
use crate::query::{FetchPlan, JoinKind, Selection};
use crate::value::Value;

// =============================================================================
// Expressions (open projections)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Expr {
    Path(String),
    Literal(Value),
    Concat(Vec<Expr>),
}

impl Expr {
    pub fn path(path: &str) -> Self {
        Expr::Path(path.to_string())
    }

    /// Parses `"{username} {age} {team.name}"` into a concatenation.
    /// Text outside braces is literal; an unmatched `{` is literal too.
    pub fn template(template: &str) -> Self {
        let mut parts = Vec::new();
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}').map(|c| open + c) else {
                break;
            };
            if open > 0 {
                parts.push(Expr::Literal(Value::from(&rest[..open])));
            }
            parts.push(Expr::Path(rest[open + 1..close].trim().to_string()));
            rest = &rest[close + 1..];
        }
        if !rest.is_empty() {
            parts.push(Expr::Literal(Value::from(rest)));
        }
        match parts.len() {
            1 => parts.remove(0),
            _ => Expr::Concat(parts),
        }
    }

    /// Every property path the expression reads.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            Expr::Path(p) => vec![p.as_str()],
            Expr::Literal(_) => Vec::new(),
            Expr::Concat(parts) => parts.iter().flat_map(Expr::paths).collect(),
        }
    }

    pub fn eval(&self, record: &Record, registry: &EntityRegistry) -> Result<Value, BindError> {
        match self {
            Expr::Path(p) => record.value_at(p, registry),
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Concat(parts) => {
                let mut out = String::new();
                for part in parts {
                    out.push_str(&part.eval(record, registry)?.to_string());
                }
                Ok(Value::Text(out))
            }
        }
    }
}

// =============================================================================
// Shapes
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ClosedField {
    /// A property path, possibly crossing to-one relations.
    Path { alias: String, path: String },
    /// A nested closed projection over a to-one relation.
    Nested {
        alias: String,
        relation: String,
        shape: ClosedShape,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct ClosedShape {
    pub fields: Vec<ClosedField>,
    pub join: JoinKind,
}

impl ClosedShape {
    /// Field whose alias is the property name.
    pub fn field(mut self, path: &str) -> Self {
        let alias = path.rsplit('.').next().unwrap_or(path).to_string();
        self.fields.push(ClosedField::Path {
            alias,
            path: path.to_string(),
        });
        self
    }

    pub fn field_as(mut self, alias: &str, path: &str) -> Self {
        self.fields.push(ClosedField::Path {
            alias: alias.to_string(),
            path: path.to_string(),
        });
        self
    }

    pub fn nested(mut self, relation: &str, shape: ClosedShape) -> Self {
        self.fields.push(ClosedField::Nested {
            alias: relation.to_string(),
            relation: relation.to_string(),
            shape,
        });
        self
    }

    /// Join nested and crossed relations with INNER instead of LEFT.
    pub fn inner_join(mut self) -> Self {
        self.join = JoinKind::Inner;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct OpenShape {
    pub fields: Vec<(String, Expr)>,
}

impl OpenShape {
    pub fn expr(mut self, alias: &str, expr: Expr) -> Self {
        self.fields.push((alias.to_string(), expr));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ProjectionShape {
    Closed(ClosedShape),
    Open(OpenShape),
}

impl ProjectionShape {
    pub fn closed() -> ClosedShape {
        ClosedShape::default()
    }

    pub fn open() -> OpenShape {
        OpenShape::default()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ProjectionShape::Closed(_))
    }
}

impl From<ClosedShape> for ProjectionShape {
    fn from(shape: ClosedShape) -> Self {
        ProjectionShape::Closed(shape)
    }
}

impl From<OpenShape> for ProjectionShape {
    fn from(shape: OpenShape) -> Self {
        ProjectionShape::Open(shape)
    }
}

// =============================================================================
// Projected Rows
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ProjectedValue {
    Value(Value),
    Nested(Option<ProjectedRow>),
}

/// One projected result, keyed by alias.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ProjectedRow {
    pub fields: BTreeMap<String, ProjectedValue>,
}

impl ProjectedRow {
    pub fn get(&self, alias: &str) -> Option<&Value> {
        match self.fields.get(alias) {
            Some(ProjectedValue::Value(v)) => Some(v),
            _ => None,
        }
    }

    fn required(&self, alias: &str) -> Result<&Value, BindError> {
        self.get(alias).ok_or_else(|| BindError::MissingField {
            owner: "projection".to_string(),
            field: alias.to_string(),
        })
    }

    pub fn text(&self, alias: &str) -> Result<String, BindError> {
        match self.required(alias)? {
            Value::Text(s) => Ok(s.clone()),
            other => Err(type_mismatch(alias, "text", other)),
        }
    }

    pub fn integer(&self, alias: &str) -> Result<i64, BindError> {
        match self.required(alias)? {
            Value::Integer(v) => Ok(*v),
            other => Err(type_mismatch(alias, "integer", other)),
        }
    }

    pub fn opt_text(&self, alias: &str) -> Result<Option<String>, BindError> {
        match self.get(alias) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Text(s)) => Ok(Some(s.clone())),
            Some(other) => Err(type_mismatch(alias, "text", other)),
        }
    }

    /// `Ok(None)` when the nested relation is absent.
    pub fn nested(&self, alias: &str) -> Result<Option<&ProjectedRow>, BindError> {
        match self.fields.get(alias) {
            Some(ProjectedValue::Nested(row)) => Ok(row.as_ref()),
            _ => Err(BindError::MissingField {
                owner: "projection".to_string(),
                field: alias.to_string(),
            }),
        }
    }
}

fn type_mismatch(field: &str, expected: &str, found: &Value) -> BindError {
    BindError::TypeMismatch {
        field: field.to_string(),
        expected: expected.to_string(),
        found: found
            .semantic_type()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "null".to_string()),
    }
}

/// A typed projection.
pub trait Projection: Sized + Send + 'static {
    fn shape() -> ProjectionShape;

    fn from_row(row: &ProjectedRow) -> Result<Self, BindError>;
}

// =============================================================================
// Binder
// =============================================================================

/// Selection and joins needed to materialize a shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionPlan {
    pub selection: Selection,
    pub fetch: FetchPlan,
}

pub struct ProjectionBinder;

impl ProjectionBinder {
    /// Validates `shape` against `entity` and computes what to load.
    ///
    /// Closed shapes select only their paths plus the identifier of every
    /// relation they cross. Open shapes select the entity and fetch every
    /// relation an expression reaches.
    pub fn plan(registry: &EntityRegistry, entity: &str, shape: &ProjectionShape) -> Result<ProjectionPlan, DerivationError> {
        match shape {
            ProjectionShape::Closed(closed) => {
                let mut paths = Vec::new();
                let mut fetch = FetchPlan::none();
                plan_closed(registry, entity, "", closed, &mut paths, &mut fetch)?;
                Ok(ProjectionPlan {
                    selection: Selection::Paths(paths),
                    fetch,
                })
            }
            ProjectionShape::Open(open) => {
                let mut fetch = FetchPlan::none();
                for (_, expr) in &open.fields {
                    for path in expr.paths() {
                        let resolved = registry.resolve_path(entity, path)?;
                        if !resolved.relations.is_empty() {
                            fetch.add(&resolved.relations.join("."), JoinKind::Left);
                        }
                    }
                }
                Ok(ProjectionPlan {
                    selection: Selection::Entity,
                    fetch,
                })
            }
        }
    }

    /// Binds a row loaded for `shape` (partial for closed, full for open).
    pub fn bind(shape: &ProjectionShape, record: &Record, registry: &EntityRegistry) -> Result<ProjectedRow, BindError> {
        match shape {
            ProjectionShape::Closed(closed) => bind_closed(closed, record, registry),
            ProjectionShape::Open(open) => {
                let mut row = ProjectedRow::default();
                for (alias, expr) in &open.fields {
                    row.fields
                        .insert(alias.clone(), ProjectedValue::Value(expr.eval(record, registry)?));
                }
                Ok(row)
            }
        }
    }

    /// Binds native result columns by alias. Nested fields are not
    /// supported for native rows and bind as absent.
    pub fn bind_columns(shape: &ProjectionShape, columns: &BTreeMap<String, Value>) -> Result<ProjectedRow, BindError> {
        let mut row = ProjectedRow::default();
        let aliases: Vec<&str> = match shape {
            ProjectionShape::Closed(closed) => closed
                .fields
                .iter()
                .map(|f| match f {
                    ClosedField::Path { alias, .. } | ClosedField::Nested { alias, .. } => alias.as_str(),
                })
                .collect(),
            ProjectionShape::Open(open) => open.fields.iter().map(|(a, _)| a.as_str()).collect(),
        };
        for alias in aliases {
            let value = columns
                .get(alias)
                .or_else(|| {
                    columns
                        .iter()
                        .find(|(k, _)| k.eq_ignore_ascii_case(alias))
                        .map(|(_, v)| v)
                })
                .ok_or_else(|| BindError::MissingField {
                    owner: "native row".to_string(),
                    field: alias.to_string(),
                })?;
            row.fields.insert(alias.to_string(), ProjectedValue::Value(value.clone()));
        }
        Ok(row)
    }
}

fn plan_closed(
    registry: &EntityRegistry,
    root: &str,
    prefix: &str,
    shape: &ClosedShape,
    paths: &mut Vec<String>,
    fetch: &mut FetchPlan,
) -> Result<(), DerivationError> {
    let qualify = |p: &str| {
        if prefix.is_empty() {
            p.to_string()
        } else {
            format!("{}.{}", prefix, p)
        }
    };

    for field in &shape.fields {
        match field {
            ClosedField::Path { path, .. } => {
                let full = qualify(path);
                let resolved = registry.resolve_path(root, &full)?;
                if !resolved.relations.is_empty() {
                    let relations = resolved.relations.join(".");
                    fetch.add(&relations, shape.join);
                    push_key(registry, root, &relations, paths)?;
                }
                push_unique(paths, full);
            }
            ClosedField::Nested { relation, shape: nested, .. } => {
                let full = qualify(relation);
                registry.resolve_relation_path(root, &full)?;
                fetch.add(&full, stronger(nested.join, shape.join));
                push_key(registry, root, &full, paths)?;
                plan_closed(registry, root, &full, nested, paths, fetch)?;
            }
        }
    }
    Ok(())
}

/// Selects `<relations>.<id>` so an absent relation can be told apart.
fn push_key(registry: &EntityRegistry, root: &str, relations: &str, paths: &mut Vec<String>) -> Result<(), DerivationError> {
    let walked = registry.resolve_relation_path(root, relations)?;
    let target = registry
        .entity_at(root, &walked)
        .ok_or_else(|| DerivationError::UnknownProperty {
            entity: root.to_string(),
            path: relations.to_string(),
        })?;
    push_unique(paths, format!("{}.{}", relations, target.id.name));
    Ok(())
}

fn push_unique(paths: &mut Vec<String>, path: String) {
    if !paths.contains(&path) {
        paths.push(path);
    }
}

/// Inner wins over left.
fn stronger(a: JoinKind, b: JoinKind) -> JoinKind {
    if a == JoinKind::Inner || b == JoinKind::Inner {
        JoinKind::Inner
    } else {
        JoinKind::Left
    }
}

fn bind_closed(shape: &ClosedShape, record: &Record, registry: &EntityRegistry) -> Result<ProjectedRow, BindError> {
    let mut row = ProjectedRow::default();
    for field in &shape.fields {
        match field {
            ClosedField::Path { alias, path } => {
                row.fields
                    .insert(alias.clone(), ProjectedValue::Value(record.value_at(path, registry)?));
            }
            ClosedField::Nested { alias, relation, shape } => {
                let nested = match record.relation(relation) {
                    Some(RelationState::Loaded(target)) => Some(bind_closed(shape, target, registry)?),
                    Some(RelationState::Absent) | None => None,
                    Some(_) => {
                        return Err(BindError::RelationNotLoaded {
                            entity: record.entity.clone(),
                            relation: relation.clone(),
                        })
                    }
                };
                row.fields.insert(alias.clone(), ProjectedValue::Nested(nested));
            }
        }
    }
    Ok(row)
}
