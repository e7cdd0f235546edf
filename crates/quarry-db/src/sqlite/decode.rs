//! Row decoding for the layouts produced by [`super::render`].

use chrono::{DateTime, Utc};
use quarry_core::entity::{EntityDescriptor, PathLeaf, RelationState};
use quarry_core::{EntityRegistry, Record, SemanticType, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::collections::BTreeMap;

use super::render::{entity_width, EntitySlot, PathSlot};
use crate::error::{DbError, DbResult};

/// Reads column `index` as a value of `ty`.
pub(crate) fn typed(row: &SqliteRow, index: usize, ty: SemanticType) -> DbResult<Value> {
    if row.try_get_raw(index)?.is_null() {
        return Ok(Value::Null);
    }
    let value = match ty {
        SemanticType::Integer => Value::Integer(row.try_get::<i64, _>(index)?),
        SemanticType::Real => Value::Real(row.try_get::<f64, _>(index)?),
        SemanticType::Text => Value::Text(row.try_get::<String, _>(index)?),
        SemanticType::Boolean => Value::Boolean(row.try_get::<bool, _>(index)?),
        SemanticType::Timestamp => Value::Timestamp(row.try_get::<DateTime<Utc>, _>(index)?),
    };
    Ok(value)
}

/// Reads column `index` by its storage class.
fn dynamic(row: &SqliteRow, index: usize) -> DbResult<Value> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let class = raw.type_info().name().to_string();
    match class.as_str() {
        "INTEGER" | "INT8" | "BIGINT" => typed(row, index, SemanticType::Integer),
        "REAL" => typed(row, index, SemanticType::Real),
        "BOOLEAN" => typed(row, index, SemanticType::Boolean),
        "TEXT" | "DATETIME" | "DATE" | "TIME" => typed(row, index, SemanticType::Text),
        other => Err(DbError::QueryFailed(format!(
            "column {} has unsupported storage class {}",
            index, other
        ))),
    }
}

/// Native rows keyed by column label.
pub(crate) fn columns(row: &SqliteRow) -> DbResult<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();
    for column in row.columns() {
        out.insert(column.name().to_string(), dynamic(row, column.ordinal())?);
    }
    Ok(out)
}

/// Converts a loosely typed native value to the declared property type.
pub(crate) fn coerce(value: Value, ty: SemanticType) -> Value {
    match (value, ty) {
        (Value::Text(text), SemanticType::Timestamp) => match DateTime::parse_from_rfc3339(&text) {
            Ok(parsed) => Value::Timestamp(parsed.with_timezone(&Utc)),
            Err(_) => Value::Text(text),
        },
        (Value::Integer(n), SemanticType::Boolean) => Value::Boolean(n != 0),
        (Value::Integer(n), SemanticType::Real) => Value::Real(n as f64),
        (value, _) => value,
    }
}

/// Maps a native row onto `descriptor` by column name.
pub(crate) fn native_entity(row: &SqliteRow, descriptor: &EntityDescriptor) -> DbResult<Record> {
    let mut record = descriptor.record_from_columns(&columns(row)?);
    for property in &descriptor.properties {
        if let Some(value) = record.values.remove(&property.name) {
            record.set(&property.name, coerce(value, property.ty));
        }
    }
    Ok(record)
}

// =============================================================================
// Entity Layout
// =============================================================================

/// Reads one entity slot. `None` when the joined row is missing.
fn entity_slot(row: &SqliteRow, start: usize, descriptor: &EntityDescriptor) -> DbResult<Option<Record>> {
    let Some(id) = typed(row, start, SemanticType::Integer)?.as_i64() else {
        return Ok(None);
    };
    let mut record = Record::new(&descriptor.name).with_id(id);
    let mut index = start + 1;
    for property in &descriptor.properties {
        record.set(&property.name, typed(row, index, property.ty)?);
        index += 1;
    }
    for relation in &descriptor.relations {
        if !relation.cardinality.is_to_one() {
            record.set_relation(&relation.name, RelationState::Collection);
            continue;
        }
        let state = match typed(row, index, SemanticType::Integer)?.as_i64() {
            Some(target) => RelationState::Unloaded(target),
            None => RelationState::Absent,
        };
        record.set_relation(&relation.name, state);
        index += 1;
    }
    debug_assert_eq!(index - start, entity_width(descriptor));
    Ok(Some(record))
}

/// Root entity with every fetch-joined relation attached.
pub(crate) fn entity(row: &SqliteRow, slots: &[EntitySlot], registry: &EntityRegistry) -> DbResult<Record> {
    let mut records = BTreeMap::new();
    for slot in slots {
        let descriptor = registry.require(&slot.entity)?;
        records.insert(slot.path.clone(), entity_slot(row, slot.start, descriptor)?);
    }
    assemble(records)?.ok_or_else(|| DbError::Internal("selected row has a null identifier".to_string()))
}

// =============================================================================
// Path Layout
// =============================================================================

/// Partial entity holding only the selected paths.
pub(crate) fn paths(row: &SqliteRow, root: &str, slots: &[PathSlot]) -> DbResult<Record> {
    let mut records: BTreeMap<Vec<String>, Option<Record>> = BTreeMap::new();
    records.insert(Vec::new(), Some(Record::new(root)));

    for (index, slot) in slots.iter().enumerate() {
        let key: Vec<String> = slot.chain.iter().map(|(relation, _)| relation.clone()).collect();
        for end in 1..=slot.chain.len() {
            records
                .entry(key[..end].to_vec())
                .or_insert_with(|| Some(Record::new(&slot.chain[end - 1].1)));
        }
        let Some(Some(record)) = records.get_mut(&key) else {
            continue;
        };
        match &slot.leaf {
            PathLeaf::Id => record.id = typed(row, index, SemanticType::Integer)?.as_i64(),
            PathLeaf::Property { name, ty, .. } => record.set(name, typed(row, index, *ty)?),
            PathLeaf::Relation { name } => {
                let state = match typed(row, index, SemanticType::Integer)?.as_i64() {
                    Some(id) => RelationState::Unloaded(id),
                    None => RelationState::Absent,
                };
                record.set_relation(name, state);
            }
        }
    }

    // a joined record without an identifier came from a null foreign key
    for (path, record) in records.iter_mut() {
        if !path.is_empty() && record.as_ref().is_some_and(|r| r.id.is_none()) {
            *record = None;
        }
    }
    assemble(records)?.ok_or_else(|| DbError::Internal("projection lost its root record".to_string()))
}

/// Attaches records to their parents, deepest paths first.
fn assemble(mut records: BTreeMap<Vec<String>, Option<Record>>) -> DbResult<Option<Record>> {
    let mut paths: Vec<Vec<String>> = records.keys().filter(|p| !p.is_empty()).cloned().collect();
    paths.sort_by_key(|p| std::cmp::Reverse(p.len()));

    for path in paths {
        let child = records.remove(&path).flatten();
        let Some((relation, parent_path)) = path.split_last() else {
            continue;
        };
        let Some(Some(parent)) = records.get_mut(parent_path) else {
            continue;
        };
        let state = match child {
            Some(record) => RelationState::Loaded(Box::new(record)),
            None => RelationState::Absent,
        };
        parent.set_relation(relation, state);
    }
    Ok(records.remove(&Vec::new()).flatten())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_native_values() {
        assert_eq!(coerce(Value::Integer(1), SemanticType::Boolean), Value::Boolean(true));
        assert_eq!(
            coerce(Value::from("2024-03-01T10:00:00+00:00"), SemanticType::Timestamp)
                .as_timestamp()
                .map(|t| t.to_rfc3339()),
            Some("2024-03-01T10:00:00+00:00".to_string())
        );
        assert_eq!(coerce(Value::from("not a date"), SemanticType::Timestamp), Value::from("not a date"));
        assert_eq!(coerce(Value::from("m1"), SemanticType::Text), Value::from("m1"));
    }

    #[test]
    fn test_assemble_nests_and_drops_missing() {
        let mut records = BTreeMap::new();
        records.insert(Vec::new(), Some(Record::new("Member").with_id(1)));
        records.insert(vec!["team".to_string()], Some(Record::new("Team").with_id(7)));
        let root = assemble(records).unwrap().unwrap();
        match root.relation("team") {
            Some(RelationState::Loaded(team)) => assert_eq!(team.id, Some(7)),
            other => panic!("unexpected {:?}", other),
        }

        let mut records = BTreeMap::new();
        records.insert(Vec::new(), Some(Record::new("Member").with_id(1)));
        records.insert(vec!["team".to_string()], None);
        let root = assemble(records).unwrap().unwrap();
        assert_eq!(root.relation("team"), Some(&RelationState::Absent));
    }
}
