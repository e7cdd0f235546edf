//! Method-name grammar.
//!
//! ```text
//! find Distinct Top3 Member By UsernameIgnoreCase And AgeGreaterThan Or TeamNameIn AllIgnoreCase OrderBy AgeDesc UsernameAsc
//! └──┘ └─────────────────────┘ └┘ └─────────────────────────────────────────────────────────┘ └──────────┘ └───────────────────────┘
//! prefix  subject modifiers    By  clauses: Or-groups of And-parts                            global case   static sort
//! ```
//!
//! Parsing is purely lexical. Property tokens are resolved against the
//! entity afterwards, so this module never touches the registry.

use crate::error::DerivationError;
use crate::page::Direction;
use crate::predicate::Comparator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectKind {
    Select,
    Count,
    Exists,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub kind: SubjectKind,
    pub distinct: bool,
    pub top: Option<u64>,
}

/// One comparison clause, e.g. `AgeGreaterThan`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// The whole clause token minus any `IgnoreCase` suffix.
    pub token: String,
    /// Token with the comparator keyword stripped.
    pub property: String,
    pub comparator: Comparator,
    pub ignore_case: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartTree {
    pub subject: Subject,
    /// Disjunction of conjunctions.
    pub alternatives: Vec<Vec<Part>>,
    pub orders: Vec<(String, Direction)>,
    pub all_ignore_case: bool,
}

impl PartTree {
    pub fn parts(&self) -> impl Iterator<Item = &Part> {
        self.alternatives.iter().flatten()
    }
}

const PREFIXES: &[(&str, SubjectKind)] = &[
    ("find", SubjectKind::Select),
    ("read", SubjectKind::Select),
    ("get", SubjectKind::Select),
    ("query", SubjectKind::Select),
    ("search", SubjectKind::Select),
    ("stream", SubjectKind::Select),
    ("count", SubjectKind::Count),
    ("exists", SubjectKind::Exists),
    ("delete", SubjectKind::Delete),
    ("remove", SubjectKind::Delete),
];

/// Longest keyword wins; the table is sorted by length at lookup.
const KEYWORDS: &[(&str, Comparator)] = &[
    ("IsNotNull", Comparator::IsNotNull),
    ("NotNull", Comparator::IsNotNull),
    ("IsNull", Comparator::IsNull),
    ("Null", Comparator::IsNull),
    ("IsLessThanEqual", Comparator::Le),
    ("LessThanEqual", Comparator::Le),
    ("IsLessThan", Comparator::Lt),
    ("LessThan", Comparator::Lt),
    ("IsGreaterThanEqual", Comparator::Ge),
    ("GreaterThanEqual", Comparator::Ge),
    ("IsGreaterThan", Comparator::Gt),
    ("GreaterThan", Comparator::Gt),
    ("IsBefore", Comparator::Lt),
    ("Before", Comparator::Lt),
    ("IsAfter", Comparator::Gt),
    ("After", Comparator::Gt),
    ("IsBetween", Comparator::Between),
    ("Between", Comparator::Between),
    ("IsNotLike", Comparator::NotLike),
    ("NotLike", Comparator::NotLike),
    ("IsLike", Comparator::Like),
    ("Like", Comparator::Like),
    ("IsStartingWith", Comparator::StartingWith),
    ("StartingWith", Comparator::StartingWith),
    ("StartsWith", Comparator::StartingWith),
    ("IsEndingWith", Comparator::EndingWith),
    ("EndingWith", Comparator::EndingWith),
    ("EndsWith", Comparator::EndingWith),
    ("IsNotContaining", Comparator::NotContaining),
    ("NotContaining", Comparator::NotContaining),
    ("NotContains", Comparator::NotContaining),
    ("IsContaining", Comparator::Containing),
    ("Containing", Comparator::Containing),
    ("Contains", Comparator::Containing),
    ("IsNotIn", Comparator::NotIn),
    ("NotIn", Comparator::NotIn),
    ("IsIn", Comparator::In),
    ("In", Comparator::In),
    ("IsTrue", Comparator::True),
    ("True", Comparator::True),
    ("IsFalse", Comparator::False),
    ("False", Comparator::False),
    ("IsNot", Comparator::Ne),
    ("Not", Comparator::Ne),
    ("IsEquals", Comparator::Eq),
    ("Equals", Comparator::Eq),
    ("Is", Comparator::Eq),
];

/// Parses a method name into its subject, clauses and static sort.
pub fn parse(method: &str) -> Result<PartTree, DerivationError> {
    let unsupported = || DerivationError::UnsupportedSubject {
        method: method.to_string(),
    };

    let (kind, rest) = PREFIXES
        .iter()
        .find_map(|(prefix, kind)| {
            let rest = method.strip_prefix(prefix)?;
            match rest.chars().next() {
                None => Some((*kind, rest)),
                Some(c) if c.is_ascii_uppercase() => Some((*kind, rest)),
                Some(_) => None,
            }
        })
        .ok_or_else(unsupported)?;

    let (mut subject_text, mut predicate_text) = match find_keyword(rest, "By") {
        Some(i) => (&rest[..i], &rest[i + 2..]),
        None => (rest, ""),
    };
    // `findAllOrderByAge`: the first `By` belongs to `OrderBy`
    if let Some(stripped) = subject_text.strip_suffix("Order") {
        subject_text = stripped;
        predicate_text = &rest[stripped.len()..];
    }

    let subject = parse_subject(method, kind, subject_text)?;

    let (body, orders) = match find_keyword(predicate_text, "OrderBy") {
        Some(i) => (
            &predicate_text[..i],
            parse_orders(method, &predicate_text[i + "OrderBy".len()..])?,
        ),
        None => (predicate_text, Vec::new()),
    };

    let (body, all_ignore_case) = match body
        .strip_suffix("AllIgnoreCase")
        .or_else(|| body.strip_suffix("AllIgnoringCase"))
    {
        Some(stripped) => (stripped, true),
        None => (body, false),
    };

    let mut alternatives = Vec::new();
    if !body.is_empty() {
        for group in split_words(&words(body), "Or") {
            let mut parts = Vec::new();
            for clause in split_words(&group, "And") {
                if clause.is_empty() {
                    return Err(DerivationError::EmptyPredicatePart {
                        method: method.to_string(),
                    });
                }
                parts.push(parse_part(method, &clause.concat())?);
            }
            if parts.is_empty() {
                return Err(DerivationError::EmptyPredicatePart {
                    method: method.to_string(),
                });
            }
            alternatives.push(parts);
        }
    }

    Ok(PartTree {
        subject,
        alternatives,
        orders,
        all_ignore_case,
    })
}

fn parse_subject(method: &str, kind: SubjectKind, text: &str) -> Result<Subject, DerivationError> {
    let mut subject = Subject {
        kind,
        distinct: false,
        top: None,
    };
    for word in words(text) {
        if word == "Distinct" {
            subject.distinct = true;
            continue;
        }
        let limit = word.strip_prefix("Top").or_else(|| word.strip_prefix("First"));
        if let Some(digits) = limit {
            if digits.is_empty() {
                subject.top = Some(1);
            } else if digits.chars().all(|c| c.is_ascii_digit()) {
                let n: u64 = digits.parse().map_err(|_| DerivationError::UnsupportedSubject {
                    method: method.to_string(),
                })?;
                if n == 0 {
                    return Err(DerivationError::InvalidReturnShape {
                        method: method.to_string(),
                        reason: "a Top/First limit of 0 selects nothing".to_string(),
                    });
                }
                subject.top = Some(n);
            }
        }
        // any other word (e.g. `Member`, `Hello`) is descriptive only
    }
    if subject.top.is_some() && kind != SubjectKind::Select {
        return Err(DerivationError::InvalidReturnShape {
            method: method.to_string(),
            reason: "Top/First only applies to find queries".to_string(),
        });
    }
    Ok(subject)
}

fn parse_orders(method: &str, text: &str) -> Result<Vec<(String, Direction)>, DerivationError> {
    let empty = || DerivationError::EmptyPredicatePart {
        method: method.to_string(),
    };
    let mut orders = Vec::new();
    let mut token = String::new();
    for word in words(text) {
        let direction = match word {
            "Asc" => Some(Direction::Asc),
            "Desc" => Some(Direction::Desc),
            _ => None,
        };
        match direction {
            Some(d) => {
                if token.is_empty() {
                    return Err(empty());
                }
                orders.push((std::mem::take(&mut token), d));
            }
            None => token.push_str(word),
        }
    }
    if !token.is_empty() {
        orders.push((token, Direction::Asc));
    }
    if orders.is_empty() {
        return Err(empty());
    }
    Ok(orders)
}

fn parse_part(method: &str, clause: &str) -> Result<Part, DerivationError> {
    let (token, ignore_case) = match clause
        .strip_suffix("IgnoreCase")
        .or_else(|| clause.strip_suffix("IgnoringCase"))
    {
        Some(stripped) if !stripped.is_empty() => (stripped, true),
        _ => (clause, false),
    };

    let mut keywords: Vec<&(&str, Comparator)> = KEYWORDS.iter().collect();
    keywords.sort_by_key(|(kw, _)| std::cmp::Reverse(kw.len()));

    let (property, comparator) = keywords
        .iter()
        .find_map(|(kw, comparator)| {
            let property = token.strip_suffix(kw)?;
            (!property.is_empty()).then_some((property, *comparator))
        })
        .unwrap_or((token, Comparator::Eq));

    if property.is_empty() {
        return Err(DerivationError::EmptyPredicatePart {
            method: method.to_string(),
        });
    }

    Ok(Part {
        token: token.to_string(),
        property: property.to_string(),
        comparator,
        ignore_case,
    })
}

/// Position of `keyword` at a word boundary (followed by an upper-case
/// letter, `_` or the end of the text).
fn find_keyword(text: &str, keyword: &str) -> Option<usize> {
    text.match_indices(keyword).map(|(i, _)| i).find(|&i| {
        match text[i + keyword.len()..].chars().next() {
            None => true,
            Some(c) => c.is_ascii_uppercase() || c == '_',
        }
    })
}

/// Splits camel-case text into words; each word starts at an upper-case
/// letter. `_` and digits stay attached to the preceding word.
pub(crate) fn words(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if i > start && c.is_ascii_uppercase() {
            out.push(&text[start..i]);
            start = i;
        }
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

fn split_words<'a>(words: &[&'a str], separator: &str) -> Vec<Vec<&'a str>> {
    let mut groups = vec![Vec::new()];
    for word in words {
        if *word == separator {
            groups.push(Vec::new());
        } else if let Some(last) = groups.last_mut() {
            last.push(*word);
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_and_clauses() {
        let tree = parse("findByUsernameAndAgeGreaterThan").unwrap();
        assert_eq!(tree.subject.kind, SubjectKind::Select);
        assert_eq!(tree.alternatives.len(), 1);
        let parts = &tree.alternatives[0];
        assert_eq!(parts[0].property, "Username");
        assert_eq!(parts[0].comparator, Comparator::Eq);
        assert_eq!(parts[1].property, "Age");
        assert_eq!(parts[1].comparator, Comparator::Gt);
    }

    #[test]
    fn test_top_distinct_and_descriptive_words() {
        let tree = parse("findTop3HelloBy").unwrap();
        assert_eq!(tree.subject.top, Some(3));
        assert!(tree.alternatives.is_empty());

        let tree = parse("findDistinctFirstMemberByUsername").unwrap();
        assert!(tree.subject.distinct);
        assert_eq!(tree.subject.top, Some(1));

        let tree = parse("findAll").unwrap();
        assert!(tree.alternatives.is_empty());
    }

    #[test]
    fn test_or_and_order_by() {
        let tree = parse("findByUsernameOrAgeLessThanEqualOrderByAgeDescUsername").unwrap();
        assert_eq!(tree.alternatives.len(), 2);
        assert_eq!(tree.alternatives[1][0].comparator, Comparator::Le);
        assert_eq!(
            tree.orders,
            vec![
                ("Age".to_string(), Direction::Desc),
                ("Username".to_string(), Direction::Asc)
            ]
        );

        let tree = parse("findAllOrderByAgeDesc").unwrap();
        assert!(tree.alternatives.is_empty());
        assert_eq!(tree.orders.len(), 1);
    }

    #[test]
    fn test_longest_keyword_wins() {
        let tree = parse("findByUsernameIsNotNullAndAgeNotIn").unwrap();
        let parts = &tree.alternatives[0];
        assert_eq!(parts[0].comparator, Comparator::IsNotNull);
        assert_eq!(parts[0].property, "Username");
        assert_eq!(parts[1].comparator, Comparator::NotIn);
    }

    #[test]
    fn test_ignore_case() {
        let tree = parse("findByUsernameIgnoreCase").unwrap();
        assert!(tree.alternatives[0][0].ignore_case);

        let tree = parse("findByUsernameStartingWithAllIgnoreCase").unwrap();
        assert!(tree.all_ignore_case);
        assert_eq!(tree.alternatives[0][0].comparator, Comparator::StartingWith);
    }

    #[test]
    fn test_word_boundaries() {
        // `Order` and `Android` are not `Or`/`And`
        let tree = parse("findByOrderNumberAndAndroidVersion").unwrap();
        let parts = &tree.alternatives[0];
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].property, "OrderNumber");
        assert_eq!(parts[1].property, "AndroidVersion");
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            parse("fetchByUsername"),
            Err(DerivationError::UnsupportedSubject { .. })
        ));
        assert!(matches!(
            parse("finder"),
            Err(DerivationError::UnsupportedSubject { .. })
        ));
        assert!(matches!(
            parse("findByUsernameAnd"),
            Err(DerivationError::EmptyPredicatePart { .. })
        ));
        assert!(matches!(
            parse("countTop3ByAge"),
            Err(DerivationError::InvalidReturnShape { .. })
        ));
    }
}
