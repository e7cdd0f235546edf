//! # Predicate Tree
//!
//! Conjunctions and disjunctions of typed property comparisons.
//!
//! A predicate produced by derivation refers to its arguments through
//! [`Operand::Param`] (positional) or [`Operand::Named`] (declared queries).
//! Binding replaces every operand with an [`Operand::Value`], so the tree
//! stored in a `QuerySpecification` is always fully bound.

use serde::Serialize;
use std::fmt;

use crate::value::{SemanticType, Value};

// =============================================================================
// Comparator
// =============================================================================

/// Comparison applied to one property path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Between,
    IsNull,
    IsNotNull,
    Like,
    NotLike,
    StartingWith,
    EndingWith,
    Containing,
    NotContaining,
    In,
    NotIn,
    True,
    False,
}

impl Comparator {
    /// Number of value operands the comparator consumes.
    pub fn arity(&self) -> usize {
        match self {
            Comparator::Between => 2,
            Comparator::IsNull | Comparator::IsNotNull | Comparator::True | Comparator::False => 0,
            _ => 1,
        }
    }

    /// Pattern comparators rendered with `LIKE`.
    pub fn is_pattern(&self) -> bool {
        matches!(
            self,
            Comparator::Like
                | Comparator::NotLike
                | Comparator::StartingWith
                | Comparator::EndingWith
                | Comparator::Containing
                | Comparator::NotContaining
        )
    }

    /// Comparators whose single operand is a collection.
    pub fn takes_collection(&self) -> bool {
        matches!(self, Comparator::In | Comparator::NotIn)
    }

    pub fn is_ordering(&self) -> bool {
        matches!(
            self,
            Comparator::Lt | Comparator::Le | Comparator::Gt | Comparator::Ge | Comparator::Between
        )
    }

    /// Returns true if the comparator can be applied to a property of `ty`.
    pub fn supports(&self, ty: SemanticType) -> bool {
        if self.is_pattern() {
            return ty == SemanticType::Text;
        }
        if self.is_ordering() {
            return ty.is_ordered();
        }
        match self {
            Comparator::True | Comparator::False => ty == SemanticType::Boolean,
            _ => true,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Comparator::Eq => "Equals",
            Comparator::Ne => "Not",
            Comparator::Lt => "LessThan",
            Comparator::Le => "LessThanEqual",
            Comparator::Gt => "GreaterThan",
            Comparator::Ge => "GreaterThanEqual",
            Comparator::Between => "Between",
            Comparator::IsNull => "IsNull",
            Comparator::IsNotNull => "IsNotNull",
            Comparator::Like => "Like",
            Comparator::NotLike => "NotLike",
            Comparator::StartingWith => "StartingWith",
            Comparator::EndingWith => "EndingWith",
            Comparator::Containing => "Containing",
            Comparator::NotContaining => "NotContaining",
            Comparator::In => "In",
            Comparator::NotIn => "NotIn",
            Comparator::True => "True",
            Comparator::False => "False",
        };
        write!(f, "{}", name)
    }
}

// =============================================================================
// Operands
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Operand {
    /// `:name` in a declared query.
    Named(String),
    /// Index into the method's value parameters.
    Param(usize),
    /// A bound or literal value.
    Value(Value),
}

impl Operand {
    pub fn named(name: impl Into<String>) -> Self {
        Operand::Named(name.into())
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Operand::Value(v) => Some(v),
            _ => None,
        }
    }
}

macro_rules! operand_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Operand {
                fn from(v: $ty) -> Self {
                    Operand::Value(Value::from(v))
                }
            }
        )*
    };
}

operand_from!(i64, i32, u32, f64, bool, &str, String, chrono::DateTime<chrono::Utc>);

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Operand::Value(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Operand {
    fn from(v: Vec<T>) -> Self {
        Operand::Value(Value::from(v))
    }
}

// =============================================================================
// Predicate
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub path: String,
    pub comparator: Comparator,
    pub operands: Vec<Operand>,
    pub ignore_case: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Compare(Comparison),
}

impl Predicate {
    pub fn compare(path: &str, comparator: Comparator, operands: Vec<Operand>) -> Self {
        Predicate::Compare(Comparison {
            path: path.to_string(),
            comparator,
            operands,
            ignore_case: false,
        })
    }

    pub fn eq(path: &str, operand: impl Into<Operand>) -> Self {
        Self::compare(path, Comparator::Eq, vec![operand.into()])
    }

    pub fn ne(path: &str, operand: impl Into<Operand>) -> Self {
        Self::compare(path, Comparator::Ne, vec![operand.into()])
    }

    pub fn gt(path: &str, operand: impl Into<Operand>) -> Self {
        Self::compare(path, Comparator::Gt, vec![operand.into()])
    }

    pub fn ge(path: &str, operand: impl Into<Operand>) -> Self {
        Self::compare(path, Comparator::Ge, vec![operand.into()])
    }

    pub fn lt(path: &str, operand: impl Into<Operand>) -> Self {
        Self::compare(path, Comparator::Lt, vec![operand.into()])
    }

    pub fn le(path: &str, operand: impl Into<Operand>) -> Self {
        Self::compare(path, Comparator::Le, vec![operand.into()])
    }

    pub fn is_in(path: &str, operand: impl Into<Operand>) -> Self {
        Self::compare(path, Comparator::In, vec![operand.into()])
    }

    pub fn like(path: &str, operand: impl Into<Operand>) -> Self {
        Self::compare(path, Comparator::Like, vec![operand.into()])
    }

    pub fn is_null(path: &str) -> Self {
        Self::compare(path, Comparator::IsNull, Vec::new())
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut parts) => {
                parts.push(other);
                Predicate::And(parts)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut parts) => {
                parts.push(other);
                Predicate::Or(parts)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    /// Case-insensitive variant of a single comparison.
    pub fn ignoring_case(mut self) -> Self {
        if let Predicate::Compare(c) = &mut self {
            c.ignore_case = true;
        }
        self
    }

    /// Every comparison in the tree, depth first.
    pub fn comparisons(&self) -> Vec<&Comparison> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a Comparison>) {
        match self {
            Predicate::And(parts) | Predicate::Or(parts) => {
                for part in parts {
                    part.collect(out);
                }
            }
            Predicate::Compare(c) => out.push(c),
        }
    }

    /// Replaces every operand using `bind`.
    pub fn bind_operands<E>(&self, bind: &mut impl FnMut(&Operand) -> Result<Value, E>) -> Result<Predicate, E> {
        Ok(match self {
            Predicate::And(parts) => Predicate::And(
                parts
                    .iter()
                    .map(|p| p.bind_operands(bind))
                    .collect::<Result<_, E>>()?,
            ),
            Predicate::Or(parts) => Predicate::Or(
                parts
                    .iter()
                    .map(|p| p.bind_operands(bind))
                    .collect::<Result<_, E>>()?,
            ),
            Predicate::Compare(c) => Predicate::Compare(Comparison {
                path: c.path.clone(),
                comparator: c.comparator,
                operands: c
                    .operands
                    .iter()
                    .map(|o| bind(o).map(Operand::Value))
                    .collect::<Result<_, E>>()?,
                ignore_case: c.ignore_case,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_and_flattens() {
        let p = Predicate::eq("username", "AAA")
            .and(Predicate::gt("age", 15))
            .and(Predicate::is_null("team"));
        match &p {
            Predicate::And(parts) => assert_eq!(parts.len(), 3),
            other => panic!("expected And, got {:?}", other),
        }
        assert_eq!(p.comparisons().len(), 3);
    }

    #[test]
    fn test_comparator_support() {
        assert!(Comparator::Gt.supports(SemanticType::Integer));
        assert!(!Comparator::Like.supports(SemanticType::Integer));
        assert!(!Comparator::True.supports(SemanticType::Text));
        assert!(!Comparator::Lt.supports(SemanticType::Boolean));
        assert_eq!(Comparator::Between.arity(), 2);
        assert_eq!(Comparator::IsNull.arity(), 0);
    }

    #[test]
    fn test_bind_operands() {
        let p = Predicate::eq("username", Operand::named("name")).and(Predicate::gt("age", Operand::Param(0)));
        let bound = p
            .bind_operands(&mut |op: &Operand| -> Result<Value, ()> {
                Ok(match op {
                    Operand::Named(_) => Value::from("AAA"),
                    Operand::Param(_) => Value::from(15),
                    Operand::Value(v) => v.clone(),
                })
            })
            .unwrap();
        let values: Vec<_> = bound
            .comparisons()
            .iter()
            .flat_map(|c| c.operands.iter().filter_map(Operand::as_value).cloned())
            .collect();
        assert_eq!(values, vec![Value::from("AAA"), Value::from(15)]);
    }
}
