//! # Values
//!
//! Dynamically typed values flowing between the query engine and the
//! persistence boundary.
//!
//! ## Type Mapping
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    SemanticType ↔ Value ↔ SQLite                        │
//! │                                                                         │
//! │  SemanticType::Integer    Value::Integer(i64)     INTEGER              │
//! │  SemanticType::Real       Value::Real(f64)        REAL                 │
//! │  SemanticType::Text       Value::Text(String)     TEXT                 │
//! │  SemanticType::Boolean    Value::Boolean(bool)    INTEGER (0/1)        │
//! │  SemanticType::Timestamp  Value::Timestamp(..)    TEXT (RFC 3339)      │
//! │                                                                         │
//! │  Value::Null              any nullable column                          │
//! │  Value::List(Vec<Value>)  only as an IN-set parameter, never stored    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Semantic Type
// =============================================================================

/// The declared type of a property or parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Integer,
    Real,
    Text,
    Boolean,
    Timestamp,
}

impl SemanticType {
    /// Returns true if values of this type have a meaningful ordering
    /// for `<`, `>`, `BETWEEN` comparisons.
    pub fn is_ordered(&self) -> bool {
        !matches!(self, SemanticType::Boolean)
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SemanticType::Integer => write!(f, "integer"),
            SemanticType::Real => write!(f, "real"),
            SemanticType::Text => write!(f, "text"),
            SemanticType::Boolean => write!(f, "boolean"),
            SemanticType::Timestamp => write!(f, "timestamp"),
        }
    }
}

// =============================================================================
// Value
// =============================================================================

/// A single column or parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    List(Vec<Value>),
}

impl Value {
    /// Returns the semantic type of a non-null scalar value.
    ///
    /// `Null` and `List` have no single semantic type and return `None`.
    pub fn semantic_type(&self) -> Option<SemanticType> {
        match self {
            Value::Integer(_) => Some(SemanticType::Integer),
            Value::Real(_) => Some(SemanticType::Real),
            Value::Text(_) => Some(SemanticType::Text),
            Value::Boolean(_) => Some(SemanticType::Boolean),
            Value::Timestamp(_) => Some(SemanticType::Timestamp),
            Value::Null | Value::List(_) => None,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns true if this value may be bound to a parameter or column of
    /// type `ty`. Null is compatible with everything; integers widen to real.
    pub fn conforms_to(&self, ty: SemanticType) -> bool {
        match (self, ty) {
            (Value::Null, _) => true,
            (Value::Integer(_), SemanticType::Real) => true,
            (Value::List(_), _) => false,
            (v, ty) => v.semantic_type() == Some(ty),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            Value::Integer(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }
}

/// Renders values the way string concatenation in open projections
/// expects: bare text, decimal numbers, `null` for absent values.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Real(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conformance() {
        assert!(Value::from(10).conforms_to(SemanticType::Integer));
        assert!(Value::from(10).conforms_to(SemanticType::Real));
        assert!(!Value::from("AAA").conforms_to(SemanticType::Integer));
        assert!(Value::Null.conforms_to(SemanticType::Text));
        assert!(!Value::from(vec!["a", "b"]).conforms_to(SemanticType::Text));
    }

    #[test]
    fn test_display_for_concatenation() {
        assert_eq!(Value::from("m1").to_string(), "m1");
        assert_eq!(Value::from(10).to_string(), "10");
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::from(vec![1, 2]).to_string(), "[1, 2]");
    }

    #[test]
    fn test_option_conversion() {
        let none: Option<i32> = None;
        assert_eq!(Value::from(none), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".to_string()));
    }
}
