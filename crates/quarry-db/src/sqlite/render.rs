//! # SQL Rendering
//!
//! Turns query specifications into SQLite statements plus the layout the
//! decoder reads rows with.
//!
//! ## Aliases
//! ```text
//! SELECT t0.member_id, t0.username, ..., j0.team_id, j0.name, ...
//! FROM member t0
//! LEFT JOIN team j0 ON j0.team_id = t0.team_id      ← fetch plan / predicate
//! WHERE t0.username = ? AND t0.age > ?
//! ORDER BY t0.username ASC
//! LIMIT ? OFFSET ?
//! ```
//!
//! The root is always `t0`; relation joins are `j0, j1, ...` in the order
//! they are first needed. A path ending at a relation identifier
//! (`team.id`) reads the foreign key and needs no join.

use quarry_core::bulk::AssignmentValue;
use quarry_core::entity::{EntityDescriptor, PathLeaf, RelationState};
use quarry_core::lock::LockMode;
use quarry_core::page::{Direction, Sort, Window};
use quarry_core::predicate::{Comparator, Comparison, Operand};
use quarry_core::query::{JoinKind, NativeQuery, QueryKind, QuerySource, QuerySpecification, Selection};
use quarry_core::{BindError, DerivationError, EntityRegistry, Predicate, Record, SemanticType, Value};

use crate::error::{DbError, DbResult};

/// SQL text with positional `?` parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Where each selected column lands when a row is decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum RowLayout {
    /// Full entities: the root at column 0, then one slot per fetch join.
    Entity(Vec<EntitySlot>),
    /// One column per closed-projection path.
    Paths(Vec<PathSlot>),
    /// Native rows mapped onto the root entity by column name.
    NativeEntity,
    /// Native rows kept as labelled columns.
    Columns,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntitySlot {
    /// Relation chain from the root; empty for the root itself.
    pub path: Vec<String>,
    pub entity: String,
    pub start: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathSlot {
    /// `(relation, target entity)` for every hop from the root.
    pub chain: Vec<(String, String)>,
    pub leaf: PathLeaf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedSelect {
    pub statement: SqlStatement,
    pub layout: RowLayout,
}

/// Number of columns an entity slot occupies: identifier, properties,
/// then the join column of every to-one relation, in descriptor order.
pub(crate) fn entity_width(descriptor: &EntityDescriptor) -> usize {
    1 + descriptor.properties.len() + descriptor.to_one_relations().count()
}

fn entity_columns(alias: &str, descriptor: &EntityDescriptor, out: &mut Vec<String>) {
    out.push(format!("{}.{}", alias, descriptor.id.column));
    for property in &descriptor.properties {
        out.push(format!("{}.{}", alias, property.column));
    }
    for relation in descriptor.to_one_relations() {
        if let Some(column) = &relation.join_column {
            out.push(format!("{}.{}", alias, column));
        }
    }
}

// =============================================================================
// Joins
// =============================================================================

struct JoinEntry<'r> {
    path: Vec<String>,
    alias: String,
    kind: JoinKind,
    descriptor: &'r EntityDescriptor,
    parent_alias: String,
    join_column: String,
}

/// FROM clause under construction.
struct FromClause<'r> {
    registry: &'r EntityRegistry,
    root: &'r EntityDescriptor,
    joins: Vec<JoinEntry<'r>>,
}

impl<'r> FromClause<'r> {
    fn new(registry: &'r EntityRegistry, entity: &str) -> DbResult<Self> {
        Ok(FromClause {
            registry,
            root: registry.require(entity)?,
            joins: Vec::new(),
        })
    }

    /// Joins every prefix of `relations`. Inner requests upgrade existing
    /// left joins.
    fn ensure(&mut self, relations: &[String], kind: JoinKind) -> DbResult<(String, &'r EntityDescriptor)> {
        let mut alias = "t0".to_string();
        let mut current = self.root;
        for end in 1..=relations.len() {
            let prefix = &relations[..end];
            if let Some(existing) = self.joins.iter_mut().find(|j| j.path == prefix) {
                if kind == JoinKind::Inner {
                    existing.kind = JoinKind::Inner;
                }
                alias = existing.alias.clone();
                current = existing.descriptor;
                continue;
            }
            let name = &relations[end - 1];
            let relation = current.relation(name).ok_or_else(|| unknown_path(&self.root.name, name))?;
            let join_column = relation
                .join_column
                .clone()
                .ok_or_else(|| DbError::Internal(format!("relation '{}' has no join column", name)))?;
            let target = self.registry.require(&relation.target)?;
            let entry = JoinEntry {
                path: prefix.to_vec(),
                alias: format!("j{}", self.joins.len()),
                kind,
                descriptor: target,
                parent_alias: alias,
                join_column,
            };
            alias = entry.alias.clone();
            current = target;
            self.joins.push(entry);
        }
        Ok((alias, current))
    }

    /// Qualified column for a dotted path, joining as needed.
    fn column(&mut self, path: &str) -> DbResult<(String, SemanticType)> {
        let resolved = self.registry.resolve_path(&self.root.name, path)?;
        let ty = resolved.semantic_type();
        let relations = &resolved.relations;

        if let (PathLeaf::Id, Some((last, parents))) = (&resolved.leaf, relations.split_last()) {
            // foreign key on the parent row
            let (parent_alias, parent) = self.ensure(parents, JoinKind::Left)?;
            let relation = parent.relation(last).ok_or_else(|| unknown_path(&self.root.name, path))?;
            let column = relation
                .join_column
                .as_deref()
                .ok_or_else(|| unknown_path(&self.root.name, path))?;
            return Ok((format!("{}.{}", parent_alias, column), ty));
        }

        let (alias, descriptor) = self.ensure(relations, JoinKind::Left)?;
        let column = match &resolved.leaf {
            PathLeaf::Id => descriptor.id.column.clone(),
            PathLeaf::Property { name, .. } => descriptor
                .property(name)
                .map(|p| p.column.clone())
                .ok_or_else(|| unknown_path(&self.root.name, path))?,
            PathLeaf::Relation { name } => descriptor
                .relation(name)
                .and_then(|r| r.join_column.clone())
                .ok_or_else(|| unknown_path(&self.root.name, path))?,
        };
        Ok((format!("{}.{}", alias, column), ty))
    }

    fn render(&self) -> String {
        let mut sql = format!("{} t0", self.root.table);
        for join in &self.joins {
            let keyword = match join.kind {
                JoinKind::Left => "LEFT JOIN",
                JoinKind::Inner => "INNER JOIN",
            };
            sql.push_str(&format!(
                " {} {} {} ON {}.{} = {}.{}",
                keyword,
                join.descriptor.table,
                join.alias,
                join.alias,
                join.descriptor.id.column,
                join.parent_alias,
                join.join_column
            ));
        }
        sql
    }
}

fn unknown_path(entity: &str, path: &str) -> DbError {
    DbError::from(DerivationError::UnknownProperty {
        entity: entity.to_string(),
        path: path.to_string(),
    })
}

// =============================================================================
// Renderer
// =============================================================================

pub struct SqlRenderer<'r> {
    registry: &'r EntityRegistry,
}

impl<'r> SqlRenderer<'r> {
    pub fn new(registry: &'r EntityRegistry) -> Self {
        SqlRenderer { registry }
    }

    /// Renders a `Select` specification.
    pub fn select(&self, spec: &QuerySpecification) -> DbResult<RenderedSelect> {
        match &spec.source {
            QuerySource::Native(native) => self.native_select(spec, native),
            QuerySource::Predicate(predicate) => self.predicate_select(spec, predicate.as_ref()),
        }
    }

    fn predicate_select(&self, spec: &QuerySpecification, predicate: Option<&Predicate>) -> DbResult<RenderedSelect> {
        let mut from = FromClause::new(self.registry, &spec.entity)?;
        let mut columns = Vec::new();

        for join in &spec.fetch.joins {
            let relations: Vec<String> = join.path.split('.').map(str::to_string).collect();
            from.ensure(&relations, join.kind)?;
        }

        let layout = match &spec.selection {
            Selection::Entity => {
                entity_columns("t0", from.root, &mut columns);
                let mut slots = vec![EntitySlot {
                    path: Vec::new(),
                    entity: from.root.name.clone(),
                    start: 0,
                }];
                for join in &from.joins {
                    slots.push(EntitySlot {
                        path: join.path.clone(),
                        entity: join.descriptor.name.clone(),
                        start: columns.len(),
                    });
                    entity_columns(&join.alias, join.descriptor, &mut columns);
                }
                RowLayout::Entity(slots)
            }
            Selection::Paths(paths) => {
                let mut slots = Vec::new();
                for path in paths {
                    let resolved = self.registry.resolve_path(&spec.entity, path)?;
                    let mut chain = Vec::new();
                    let mut current = from.root;
                    for name in &resolved.relations {
                        let relation = current.relation(name).ok_or_else(|| unknown_path(&spec.entity, path))?;
                        chain.push((name.clone(), relation.target.clone()));
                        current = self.registry.require(&relation.target)?;
                    }
                    let (column, _) = from.column(path)?;
                    columns.push(column);
                    slots.push(PathSlot {
                        chain,
                        leaf: resolved.leaf,
                    });
                }
                RowLayout::Paths(slots)
            }
            Selection::Columns => {
                return Err(DbError::Internal(format!(
                    "column selection of {} needs a native query",
                    spec.entity
                )))
            }
        };

        let mut params = Vec::new();
        let filter = match predicate {
            Some(p) => Some(render_predicate(&mut from, p, &mut params)?),
            None => None,
        };
        let order = render_order(&mut from, &spec.sort)?;

        let mut sql = comment(spec);
        sql.push_str(if spec.distinct { "SELECT DISTINCT " } else { "SELECT " });
        sql.push_str(&columns.join(", "));
        sql.push_str(" FROM ");
        sql.push_str(&from.render());
        if let Some(filter) = filter {
            sql.push_str(" WHERE ");
            sql.push_str(&filter);
        }
        if let Some(order) = order {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order);
        }
        push_window(&mut sql, &mut params, spec.window);

        Ok(RenderedSelect {
            statement: SqlStatement { sql, params },
            layout,
        })
    }

    fn native_select(&self, spec: &QuerySpecification, native: &NativeQuery) -> DbResult<RenderedSelect> {
        let inner = trim_native(&native.sql);
        let mut params = native.params.clone();
        let mut sql = comment(spec);

        if spec.sort.is_unsorted() && spec.window.is_none() {
            sql.push_str(inner);
        } else {
            sql.push_str(&format!("SELECT * FROM ({}) AS q", inner));
            if !spec.sort.is_unsorted() {
                let keys: Vec<String> = spec
                    .sort
                    .orders
                    .iter()
                    .map(|o| format!("{} {}", quote_label(&o.property), direction(o.direction)))
                    .collect();
                sql.push_str(" ORDER BY ");
                sql.push_str(&keys.join(", "));
            }
            push_window(&mut sql, &mut params, spec.window);
        }

        let layout = match spec.selection {
            Selection::Entity => RowLayout::NativeEntity,
            Selection::Paths(_) | Selection::Columns => RowLayout::Columns,
        };
        Ok(RenderedSelect {
            statement: SqlStatement { sql, params },
            layout,
        })
    }

    /// Renders `Count` and `Exists` specifications to a single number.
    pub fn count(&self, spec: &QuerySpecification) -> DbResult<SqlStatement> {
        let exists = matches!(spec.kind, QueryKind::Exists);
        let mut sql = comment(spec);

        match &spec.source {
            QuerySource::Native(native) => {
                let inner = trim_native(&native.sql);
                if native.returns_count && !exists {
                    sql.push_str(inner);
                } else if exists {
                    sql.push_str(&format!("SELECT COUNT(*) FROM (SELECT 1 FROM ({}) LIMIT 1)", inner));
                } else {
                    sql.push_str(&format!("SELECT COUNT(*) FROM ({}) AS q", inner));
                }
                Ok(SqlStatement {
                    sql,
                    params: native.params.clone(),
                })
            }
            QuerySource::Predicate(predicate) => {
                let mut from = FromClause::new(self.registry, &spec.entity)?;
                // only inner joins survive to_count(); they filter rows
                for join in &spec.fetch.joins {
                    let relations: Vec<String> = join.path.split('.').map(str::to_string).collect();
                    from.ensure(&relations, join.kind)?;
                }
                let mut params = Vec::new();
                let filter = match predicate {
                    Some(p) => Some(render_predicate(&mut from, p, &mut params)?),
                    None => None,
                };
                let id = format!("t0.{}", from.root.id.column);
                let mut body = format!("FROM {}", from.render());
                if let Some(filter) = filter {
                    body.push_str(" WHERE ");
                    body.push_str(&filter);
                }
                if exists {
                    sql.push_str(&format!("SELECT COUNT(*) FROM (SELECT 1 {} LIMIT 1)", body));
                } else if spec.distinct || !spec.fetch.is_empty() {
                    sql.push_str(&format!("SELECT COUNT(DISTINCT {}) {}", id, body));
                } else {
                    sql.push_str(&format!("SELECT COUNT(*) {}", body));
                }
                Ok(SqlStatement { sql, params })
            }
        }
    }

    /// Renders a bulk `Update` or `Delete`.
    ///
    /// The predicate always runs inside an identifier sub-select, so
    /// predicates over relations need no join support in UPDATE/DELETE.
    pub fn mutation(&self, spec: &QuerySpecification) -> DbResult<SqlStatement> {
        let descriptor = self.registry.require(&spec.entity)?;
        let mut params = Vec::new();
        let mut sql = comment(spec);

        match &spec.kind {
            QueryKind::Update(assignments) => {
                let mut sets = Vec::new();
                for assignment in assignments {
                    let column = if let Some(p) = descriptor.property(&assignment.property) {
                        p.column.clone()
                    } else {
                        descriptor
                            .relation(&assignment.property)
                            .and_then(|r| r.join_column.clone())
                            .ok_or_else(|| unknown_path(&spec.entity, &assignment.property))?
                    };
                    match &assignment.value {
                        AssignmentValue::Set(operand) => {
                            sets.push(format!("{} = ?", column));
                            params.push(bound(operand)?);
                        }
                        AssignmentValue::Increment(operand) => {
                            sets.push(format!("{} = {} + ?", column, column));
                            params.push(bound(operand)?);
                        }
                    }
                }
                sql.push_str(&format!("UPDATE {} SET {}", descriptor.table, sets.join(", ")));
            }
            QueryKind::Delete => sql.push_str(&format!("DELETE FROM {}", descriptor.table)),
            other => {
                return Err(DbError::Internal(format!("{:?} is not a mutation", other)));
            }
        }

        match &spec.source {
            QuerySource::Predicate(Some(predicate)) => {
                let ids = self.id_subselect(&spec.entity, predicate, &mut params)?;
                sql.push_str(&format!(" WHERE {} IN ({})", descriptor.id.column, ids));
            }
            QuerySource::Predicate(None) => {}
            QuerySource::Native(_) => {
                return Err(DbError::Internal("native statements cannot run as bulk operations".to_string()));
            }
        }

        Ok(SqlStatement { sql, params })
    }

    /// No-op update over the rows a locked select will read. Taking the
    /// database write lock is how SQLite expresses a pessimistic write lock.
    pub fn lock(&self, spec: &QuerySpecification) -> DbResult<Option<SqlStatement>> {
        if spec.lock.mode != LockMode::PessimisticWrite {
            return Ok(None);
        }
        let descriptor = self.registry.require(&spec.entity)?;
        let id = &descriptor.id.column;
        let mut params = Vec::new();
        let mut sql = format!("UPDATE {} SET {} = {}", descriptor.table, id, id);
        if let Some(predicate) = spec.predicate() {
            let ids = self.id_subselect(&spec.entity, predicate, &mut params)?;
            sql.push_str(&format!(" WHERE {} IN ({})", id, ids));
        }
        Ok(Some(SqlStatement { sql, params }))
    }

    fn id_subselect(&self, entity: &str, predicate: &Predicate, params: &mut Vec<Value>) -> DbResult<String> {
        let mut from = FromClause::new(self.registry, entity)?;
        let filter = render_predicate(&mut from, predicate, params)?;
        Ok(format!(
            "SELECT t0.{} FROM {} WHERE {}",
            from.root.id.column,
            from.render(),
            filter
        ))
    }

    // -------------------------------------------------------------------------
    // Single-entity statements
    // -------------------------------------------------------------------------

    pub fn insert(&self, record: &Record) -> DbResult<SqlStatement> {
        let descriptor = self.registry.require(&record.entity)?;
        let mut columns = Vec::new();
        let mut params = Vec::new();

        if let Some(id) = record.id {
            columns.push(descriptor.id.column.clone());
            params.push(Value::Integer(id));
        }
        for property in descriptor.properties.iter().filter(|p| p.insertable) {
            columns.push(property.column.clone());
            params.push(record.value(&property.name).cloned().unwrap_or(Value::Null));
        }
        for relation in descriptor.to_one_relations() {
            if let Some(column) = &relation.join_column {
                columns.push(column.clone());
                params.push(foreign_key(record, &relation.name)?);
            }
        }

        let marks = vec!["?"; columns.len()].join(", ");
        Ok(SqlStatement {
            sql: format!("INSERT INTO {} ({}) VALUES ({})", descriptor.table, columns.join(", "), marks),
            params,
        })
    }

    pub fn update(&self, record: &Record) -> DbResult<SqlStatement> {
        let descriptor = self.registry.require(&record.entity)?;
        let id = record
            .id
            .ok_or_else(|| DbError::Internal(format!("cannot merge {} without an identifier", record.entity)))?;

        let mut sets = Vec::new();
        let mut params = Vec::new();
        for property in descriptor.properties.iter().filter(|p| p.updatable) {
            if let Some(value) = record.value(&property.name) {
                sets.push(format!("{} = ?", property.column));
                params.push(value.clone());
            }
        }
        for relation in descriptor.to_one_relations() {
            if let Some(column) = &relation.join_column {
                sets.push(format!("{} = ?", column));
                params.push(foreign_key(record, &relation.name)?);
            }
        }
        params.push(Value::Integer(id));

        Ok(SqlStatement {
            sql: format!(
                "UPDATE {} SET {} WHERE {} = ?",
                descriptor.table,
                sets.join(", "),
                descriptor.id.column
            ),
            params,
        })
    }

    pub fn delete_by_id(&self, entity: &str, id: i64) -> DbResult<SqlStatement> {
        let descriptor = self.registry.require(entity)?;
        Ok(SqlStatement {
            sql: format!("DELETE FROM {} WHERE {} = ?", descriptor.table, descriptor.id.column),
            params: vec![Value::Integer(id)],
        })
    }
}

fn foreign_key(record: &Record, relation: &str) -> DbResult<Value> {
    match record.relation(relation) {
        None | Some(RelationState::Absent) | Some(RelationState::Collection) => Ok(Value::Null),
        Some(RelationState::Unloaded(id)) => Ok(Value::Integer(*id)),
        Some(RelationState::Loaded(target)) => target.id.map(Value::Integer).ok_or_else(|| {
            DbError::from(BindError::TransientReference {
                entity: record.entity.clone(),
                relation: relation.to_string(),
            })
        }),
    }
}

// =============================================================================
// Predicates
// =============================================================================

fn render_predicate(from: &mut FromClause<'_>, predicate: &Predicate, params: &mut Vec<Value>) -> DbResult<String> {
    match predicate {
        Predicate::And(items) | Predicate::Or(items) if items.is_empty() => Ok("1 = 1".to_string()),
        Predicate::And(items) => join_group(from, items, " AND ", params),
        Predicate::Or(items) => join_group(from, items, " OR ", params),
        Predicate::Compare(comparison) => render_comparison(from, comparison, params),
    }
}

fn join_group(from: &mut FromClause<'_>, items: &[Predicate], separator: &str, params: &mut Vec<Value>) -> DbResult<String> {
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        let rendered = render_predicate(from, item, params)?;
        parts.push(match item {
            Predicate::Compare(_) => rendered,
            _ => format!("({})", rendered),
        });
    }
    Ok(parts.join(separator))
}

fn render_comparison(from: &mut FromClause<'_>, c: &Comparison, params: &mut Vec<Value>) -> DbResult<String> {
    let (column, ty) = from.column(&c.path)?;
    let fold = c.ignore_case && ty == SemanticType::Text;
    let col = if fold { format!("UPPER({})", column) } else { column };
    let mark = if fold { "UPPER(?)" } else { "?" };

    let mut values = Vec::with_capacity(c.operands.len());
    for operand in &c.operands {
        values.push(bound(operand)?);
    }
    let first = || {
        values
            .first()
            .cloned()
            .ok_or_else(|| DbError::Internal(format!("{} on '{}' has no operand", c.comparator, c.path)))
    };

    let sql = match c.comparator {
        Comparator::Eq => match first()? {
            Value::Null => format!("{} IS NULL", col),
            value => {
                params.push(value);
                format!("{} = {}", col, mark)
            }
        },
        Comparator::Ne => match first()? {
            Value::Null => format!("{} IS NOT NULL", col),
            value => {
                params.push(value);
                format!("{} <> {}", col, mark)
            }
        },
        Comparator::Lt | Comparator::Le | Comparator::Gt | Comparator::Ge => {
            let op = match c.comparator {
                Comparator::Lt => "<",
                Comparator::Le => "<=",
                Comparator::Gt => ">",
                _ => ">=",
            };
            params.push(first()?);
            format!("{} {} {}", col, op, mark)
        }
        Comparator::Between => {
            if values.len() != 2 {
                return Err(DbError::Internal(format!("BETWEEN on '{}' needs two operands", c.path)));
            }
            params.extend(values.iter().cloned());
            format!("{} BETWEEN {} AND {}", col, mark, mark)
        }
        Comparator::IsNull => format!("{} IS NULL", col),
        Comparator::IsNotNull => format!("{} IS NOT NULL", col),
        Comparator::Like | Comparator::NotLike => {
            params.push(first()?);
            let op = if c.comparator == Comparator::Like { "LIKE" } else { "NOT LIKE" };
            format!("{} {} {}", col, op, mark)
        }
        Comparator::StartingWith | Comparator::EndingWith | Comparator::Containing | Comparator::NotContaining => {
            let text = match first()? {
                Value::Text(s) => escape_like(&s),
                other => escape_like(&other.to_string()),
            };
            let pattern = match c.comparator {
                Comparator::StartingWith => format!("{}%", text),
                Comparator::EndingWith => format!("%{}", text),
                _ => format!("%{}%", text),
            };
            params.push(Value::Text(pattern));
            let op = if c.comparator == Comparator::NotContaining { "NOT LIKE" } else { "LIKE" };
            format!("{} {} {} ESCAPE '\\'", col, op, mark)
        }
        Comparator::In | Comparator::NotIn => {
            let items = match first()? {
                Value::List(items) => items,
                single => vec![single],
            };
            let negate = c.comparator == Comparator::NotIn;
            if items.is_empty() {
                // nothing is in the empty set
                return Ok(if negate { "1 = 1" } else { "1 = 0" }.to_string());
            }
            let marks = vec![mark; items.len()].join(", ");
            params.extend(items);
            format!("{} {} ({})", col, if negate { "NOT IN" } else { "IN" }, marks)
        }
        Comparator::True => format!("{} = 1", col),
        Comparator::False => format!("{} = 0", col),
    };
    Ok(sql)
}

fn bound(operand: &Operand) -> DbResult<Value> {
    match operand {
        Operand::Value(value) => Ok(value.clone()),
        other => Err(DbError::Internal(format!("operand {:?} was never bound", other))),
    }
}

fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

// =============================================================================
// Clauses
// =============================================================================

fn render_order(from: &mut FromClause<'_>, sort: &Sort) -> DbResult<Option<String>> {
    if sort.is_unsorted() {
        return Ok(None);
    }
    let mut keys = Vec::with_capacity(sort.orders.len());
    for order in &sort.orders {
        let (column, _) = from.column(&order.property)?;
        keys.push(format!("{} {}", column, direction(order.direction)));
    }
    Ok(Some(keys.join(", ")))
}

fn direction(direction: Direction) -> &'static str {
    match direction {
        Direction::Asc => "ASC",
        Direction::Desc => "DESC",
    }
}

fn push_window(sql: &mut String, params: &mut Vec<Value>, window: Option<Window>) {
    if let Some(window) = window {
        sql.push_str(" LIMIT ? OFFSET ?");
        params.push(Value::Integer(i64::try_from(window.limit).unwrap_or(i64::MAX)));
        params.push(Value::Integer(i64::try_from(window.offset).unwrap_or(i64::MAX)));
    }
}

fn comment(spec: &QuerySpecification) -> String {
    match &spec.hints.comment {
        Some(text) => format!("/* {} */ ", text.replace("*/", "* /")),
        None => String::new(),
    }
}

fn trim_native(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

fn quote_label(label: &str) -> String {
    format!("\"{}\"", label.replace('"', "\"\""))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::query::{FetchPlan, QueryHints};
    use quarry_core::{Assignment, Sort};

    fn registry() -> EntityRegistry {
        quarry_core::types::registry().unwrap()
    }

    #[test]
    fn test_entity_select_with_predicate_and_window() {
        let registry = registry();
        let spec = QuerySpecification::select("Member")
            .with_predicate(Predicate::eq("username", "AAA").and(Predicate::gt("age", 15)))
            .with_sort(Sort::by_desc(&["username"]))
            .with_window(Some(Window { offset: 3, limit: 3 }));

        let rendered = SqlRenderer::new(&registry).select(&spec).unwrap();
        let sql = &rendered.statement.sql;
        assert!(sql.starts_with("SELECT t0.member_id, t0.username, t0.age"));
        assert!(sql.contains("FROM member t0 WHERE t0.username = ? AND t0.age > ?"));
        assert!(sql.ends_with("ORDER BY t0.username DESC LIMIT ? OFFSET ?"));
        assert!(!sql.contains("JOIN"));
        assert_eq!(
            rendered.statement.params,
            vec![Value::from("AAA"), Value::from(15), Value::from(3), Value::from(3)]
        );
    }

    #[test]
    fn test_fetch_join_adds_slot() {
        let registry = registry();
        let spec = QuerySpecification::select("Member").with_fetch(FetchPlan::of(&["team"]));
        let rendered = SqlRenderer::new(&registry).select(&spec).unwrap();

        assert!(rendered
            .statement
            .sql
            .contains("FROM member t0 LEFT JOIN team j0 ON j0.team_id = t0.team_id"));
        let RowLayout::Entity(slots) = rendered.layout else {
            panic!("expected entity layout");
        };
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[1].start, entity_width(registry.get("Member").unwrap()));
        assert_eq!(slots[1].path, vec!["team".to_string()]);
    }

    #[test]
    fn test_relation_id_uses_foreign_key() {
        let registry = registry();
        let spec = QuerySpecification::select("Member").with_predicate(Predicate::eq("team.id", 7));
        let sql = SqlRenderer::new(&registry).select(&spec).unwrap().statement.sql;
        assert!(sql.contains("WHERE t0.team_id = ?"));
        assert!(!sql.contains("JOIN"));

        let spec = QuerySpecification::select("Member").with_predicate(Predicate::eq("team.name", "teamA"));
        let sql = SqlRenderer::new(&registry).select(&spec).unwrap().statement.sql;
        assert!(sql.contains("LEFT JOIN team j0"));
        assert!(sql.contains("WHERE j0.name = ?"));
    }

    #[test]
    fn test_closed_projection_selects_only_paths() {
        let registry = registry();
        let spec = QuerySpecification {
            selection: Selection::Paths(vec!["username".to_string()]),
            ..QuerySpecification::select("Member")
        }
        .with_predicate(Predicate::eq("username", "m1"));
        let sql = SqlRenderer::new(&registry).select(&spec).unwrap().statement.sql;
        assert_eq!(sql, "SELECT t0.username FROM member t0 WHERE t0.username = ?");
    }

    #[test]
    fn test_comparator_rendering() {
        let registry = registry();
        let render = |p: Predicate| {
            let spec = QuerySpecification::select("Member").with_predicate(p);
            SqlRenderer::new(&registry).select(&spec).unwrap().statement
        };

        let stmt = render(Predicate::is_in("username", vec!["AAA", "BBB"]));
        assert!(stmt.sql.contains("t0.username IN (?, ?)"));

        let stmt = render(Predicate::is_in("username", Value::List(vec![])));
        assert!(stmt.sql.contains("WHERE 1 = 0"));
        assert!(stmt.params.is_empty());

        let stmt = render(Predicate::eq("username", Value::Null));
        assert!(stmt.sql.contains("t0.username IS NULL"));

        let stmt = render(Predicate::compare(
            "username",
            Comparator::StartingWith,
            vec![Operand::from("50%_")],
        ));
        assert!(stmt.sql.contains("t0.username LIKE ? ESCAPE '\\'"));
        assert_eq!(stmt.params, vec![Value::from("50\\%\\_%")]);

        let stmt = render(Predicate::eq("username", "aaa").ignoring_case());
        assert!(stmt.sql.contains("UPPER(t0.username) = UPPER(?)"));

        let stmt = render(Predicate::ge("age", 10).or(Predicate::is_null("team")));
        assert!(stmt.sql.contains("t0.age >= ? OR t0.team_id IS NULL"));
    }

    #[test]
    fn test_count_and_exists() {
        let registry = registry();
        let spec = QuerySpecification::select("Member")
            .with_predicate(Predicate::ge("age", 10))
            .to_count();
        let stmt = SqlRenderer::new(&registry).count(&spec).unwrap();
        assert_eq!(stmt.sql, "SELECT COUNT(*) FROM member t0 WHERE t0.age >= ?");

        let exists = QuerySpecification::select("Member").to_exists();
        let stmt = SqlRenderer::new(&registry).count(&exists).unwrap();
        assert_eq!(stmt.sql, "SELECT COUNT(*) FROM (SELECT 1 FROM member t0 LIMIT 1)");
    }

    #[test]
    fn test_count_keeps_inner_join() {
        let registry = registry();
        let mut fetch = FetchPlan::none();
        fetch.add("team", JoinKind::Inner);
        let spec = QuerySpecification::select("Member")
            .with_predicate(Predicate::ge("age", 10))
            .with_fetch(fetch)
            .to_count();
        let stmt = SqlRenderer::new(&registry).count(&spec).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT COUNT(DISTINCT t0.member_id) FROM member t0 INNER JOIN team j0 ON j0.team_id = t0.team_id WHERE t0.age >= ?"
        );

        let left = QuerySpecification::select("Member")
            .with_fetch(FetchPlan::of(&["team"]))
            .to_count();
        let stmt = SqlRenderer::new(&registry).count(&left).unwrap();
        assert_eq!(stmt.sql, "SELECT COUNT(*) FROM member t0");
    }

    #[test]
    fn test_bulk_update_uses_id_subselect() {
        let registry = registry();
        let spec = QuerySpecification {
            kind: QueryKind::Update(vec![Assignment::increment("age", 1)]),
            ..QuerySpecification::select("Member")
        }
        .with_predicate(Predicate::ge("age", 20));

        let stmt = SqlRenderer::new(&registry).mutation(&spec).unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE member SET age = age + ? WHERE member_id IN (SELECT t0.member_id FROM member t0 WHERE t0.age >= ?)"
        );
        assert_eq!(stmt.params, vec![Value::from(1), Value::from(20)]);
    }

    #[test]
    fn test_native_paging_wraps_statement() {
        let registry = registry();
        let native = NativeQuery {
            sql: "select m.member_id as id, m.username from member m;".to_string(),
            params: vec![],
            returns_count: false,
        };
        let spec = QuerySpecification::native("Member", native, Selection::Columns)
            .with_sort(Sort::by(&["username"]))
            .with_window(Some(Window { offset: 0, limit: 10 }));
        let rendered = SqlRenderer::new(&registry).select(&spec).unwrap();
        assert_eq!(
            rendered.statement.sql,
            "SELECT * FROM (select m.member_id as id, m.username from member m) AS q ORDER BY \"username\" ASC LIMIT ? OFFSET ?"
        );
        assert_eq!(rendered.layout, RowLayout::Columns);

        let count = SqlRenderer::new(&registry).count(&spec.to_count()).unwrap();
        assert!(count.sql.starts_with("SELECT COUNT(*) FROM (select m.member_id"));
    }

    #[test]
    fn test_comment_hint_and_lock_statement() {
        let registry = registry();
        let spec = QuerySpecification {
            hints: QueryHints {
                comment: Some("findLockByUsername".to_string()),
                ..QueryHints::default()
            },
            lock: quarry_core::LockRequest::write(),
            ..QuerySpecification::select("Member")
        }
        .with_predicate(Predicate::eq("username", "m1"));

        let renderer = SqlRenderer::new(&registry);
        assert!(renderer
            .select(&spec)
            .unwrap()
            .statement
            .sql
            .starts_with("/* findLockByUsername */ SELECT"));

        let lock = renderer.lock(&spec).unwrap().unwrap();
        assert!(lock.sql.starts_with("UPDATE member SET member_id = member_id WHERE member_id IN"));
    }

    #[test]
    fn test_insert_rejects_transient_reference() {
        let registry = registry();
        let mut record = Record::new("Member");
        record.set("username", Value::from("m1"));
        record.set("age", Value::from(10));
        record.set_relation("team", RelationState::Loaded(Box::new(Record::new("Team"))));

        assert!(matches!(
            SqlRenderer::new(&registry).insert(&record),
            Err(DbError::Core(quarry_core::CoreError::Bind(BindError::TransientReference { .. })))
        ));
    }
}
