//! # Native Statements
//!
//! Placeholder scanning and binding for hand-written SQL.
//!
//! ## Placeholder Styles
//! ```text
//! :name     bound to the method parameter of the same name
//! ?         bound positionally, left to right
//! ?N        bound to the N-th (1-based) positional parameter
//! ```
//! A statement uses either named or positional placeholders, never both.
//! Placeholders inside string literals and quoted identifiers are ignored,
//! as is the `::` cast operator. A collection value expands into a
//! comma-separated placeholder list, so `IN (:names)` works for any length.

use crate::error::DerivationError;
use crate::query::NativeQuery;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    Named(String),
    /// Zero-based positional index.
    Positional(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Param(Placeholder),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    None,
    Named,
    Positional,
}

/// A native statement parsed once at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeStatement {
    segments: Vec<Segment>,
    style: PlaceholderStyle,
}

impl NativeStatement {
    pub fn parse(method: &str, sql: &str) -> Result<Self, DerivationError> {
        let invalid = |reason: &str| DerivationError::InvalidNativeQuery {
            method: method.to_string(),
            reason: reason.to_string(),
        };

        let chars: Vec<char> = sql.chars().collect();
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut next_bare = 0usize;
        let mut saw_bare = false;
        let mut saw_numbered = false;
        let mut saw_named = false;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            match c {
                '\'' | '"' => {
                    let end = chars[i + 1..]
                        .iter()
                        .position(|&q| q == c)
                        .map(|p| i + 1 + p)
                        .ok_or_else(|| invalid("unterminated quoted text"))?;
                    text.extend(&chars[i..=end]);
                    i = end + 1;
                }
                ':' if chars.get(i + 1) == Some(&':') => {
                    text.push_str("::");
                    i += 2;
                }
                ':' if chars.get(i + 1).is_some_and(|n| n.is_ascii_alphabetic() || *n == '_') => {
                    let start = i + 1;
                    let mut end = start;
                    while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                        end += 1;
                    }
                    flush(&mut text, &mut segments);
                    segments.push(Segment::Param(Placeholder::Named(chars[start..end].iter().collect())));
                    saw_named = true;
                    i = end;
                }
                '?' => {
                    let start = i + 1;
                    let mut end = start;
                    while end < chars.len() && chars[end].is_ascii_digit() {
                        end += 1;
                    }
                    flush(&mut text, &mut segments);
                    if end > start {
                        let n: usize = chars[start..end]
                            .iter()
                            .collect::<String>()
                            .parse()
                            .map_err(|_| invalid("positional index is not a number"))?;
                        if n == 0 {
                            return Err(invalid("positional placeholders are 1-based"));
                        }
                        segments.push(Segment::Param(Placeholder::Positional(n - 1)));
                        saw_numbered = true;
                    } else {
                        segments.push(Segment::Param(Placeholder::Positional(next_bare)));
                        next_bare += 1;
                        saw_bare = true;
                    }
                    i = end;
                }
                _ => {
                    text.push(c);
                    i += 1;
                }
            }
        }
        flush(&mut text, &mut segments);

        if saw_named && (saw_bare || saw_numbered) {
            return Err(invalid("mixes named and positional placeholders"));
        }
        if saw_bare && saw_numbered {
            return Err(invalid("mixes '?' and '?N' placeholders"));
        }

        let style = if saw_named {
            PlaceholderStyle::Named
        } else if saw_bare || saw_numbered {
            PlaceholderStyle::Positional
        } else {
            PlaceholderStyle::None
        };
        Ok(NativeStatement { segments, style })
    }

    pub fn style(&self) -> PlaceholderStyle {
        self.style
    }

    /// Distinct named placeholders in order of first appearance.
    pub fn named_parameters(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Param(Placeholder::Named(name)) = segment {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Highest positional index referenced, plus one.
    pub fn positional_count(&self) -> usize {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Param(Placeholder::Positional(i)) => Some(i + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// Produces SQL with `?` placeholders and the flattened values.
    pub fn bind<E>(
        &self,
        returns_count: bool,
        mut resolve: impl FnMut(&Placeholder) -> Result<Value, E>,
    ) -> Result<NativeQuery, E> {
        let mut sql = String::new();
        let mut params = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => sql.push_str(text),
                Segment::Param(placeholder) => match resolve(placeholder)? {
                    Value::List(items) if items.is_empty() => sql.push_str("NULL"),
                    Value::List(items) => {
                        let marks = vec!["?"; items.len()].join(", ");
                        sql.push_str(&marks);
                        params.extend(items);
                    }
                    value => {
                        sql.push('?');
                        params.push(value);
                    }
                },
            }
        }
        Ok(NativeQuery {
            sql,
            params,
            returns_count,
        })
    }
}

fn flush(text: &mut String, segments: &mut Vec<Segment>) {
    if !text.is_empty() {
        segments.push(Segment::Text(std::mem::take(text)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_placeholders_and_list_expansion() {
        let stmt = NativeStatement::parse(
            "findByNames",
            "select * from member where username in (:names) and age > :age and note = ':skip'",
        )
        .unwrap();
        assert_eq!(stmt.style(), PlaceholderStyle::Named);
        assert_eq!(stmt.named_parameters(), vec!["names", "age"]);

        let bound = stmt
            .bind(false, |p| -> Result<Value, ()> {
                Ok(match p {
                    Placeholder::Named(n) if n == "names" => Value::from(vec!["a", "b"]),
                    _ => Value::from(10),
                })
            })
            .unwrap();
        assert_eq!(
            bound.sql,
            "select * from member where username in (?, ?) and age > ? and note = ':skip'"
        );
        assert_eq!(bound.params, vec![Value::from("a"), Value::from("b"), Value::from(10)]);
    }

    #[test]
    fn test_positional_placeholders() {
        let stmt = NativeStatement::parse("findByUsername", "select * from member where username = ?").unwrap();
        assert_eq!(stmt.style(), PlaceholderStyle::Positional);
        assert_eq!(stmt.positional_count(), 1);

        let stmt = NativeStatement::parse("m", "select ?2, ?1").unwrap();
        assert_eq!(stmt.positional_count(), 2);
    }

    #[test]
    fn test_rejects_mixed_styles() {
        assert!(matches!(
            NativeStatement::parse("m", "select * from member where username = :name and age = ?"),
            Err(DerivationError::InvalidNativeQuery { .. })
        ));
        assert!(NativeStatement::parse("m", "select '1").is_err());
    }

    #[test]
    fn test_empty_list_matches_nothing() {
        let stmt = NativeStatement::parse("m", "select * from member where member_id in (:ids)").unwrap();
        let bound = stmt
            .bind(false, |_| -> Result<Value, ()> { Ok(Value::List(vec![])) })
            .unwrap();
        assert!(bound.sql.ends_with("in (NULL)"));
        assert!(bound.params.is_empty());
    }
}
