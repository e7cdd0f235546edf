//! Property path resolution for camel-case name tokens.
//!
//! `TeamName` on Member resolves to `teamName` if Member has such a
//! property, otherwise to `team.name` by splitting at the longest head that
//! names a to-one relation. `Team_Name` forces the split at `_`.

use super::grammar::words;
use crate::entity::{EntityRegistry, ResolvedPath};
use crate::error::DerivationError;

/// Resolves a name token such as `TeamName` to a validated path.
pub fn resolve_token(registry: &EntityRegistry, entity: &str, token: &str) -> Result<(String, ResolvedPath), DerivationError> {
    let mut crossed_to_many = false;
    match candidate(registry, entity, token, &mut crossed_to_many)? {
        Some(dotted) => {
            let resolved = registry.resolve_path(entity, &dotted)?;
            Ok((dotted, resolved))
        }
        None if crossed_to_many => Err(DerivationError::ToManyPath {
            entity: entity.to_string(),
            path: uncapitalize(token),
        }),
        None => Err(DerivationError::UnknownProperty {
            entity: entity.to_string(),
            path: uncapitalize(token),
        }),
    }
}

fn candidate(
    registry: &EntityRegistry,
    entity: &str,
    token: &str,
    crossed_to_many: &mut bool,
) -> Result<Option<String>, DerivationError> {
    let descriptor = registry.require(entity)?;

    if let Some((head, tail)) = token.split_once('_') {
        let head = uncapitalize(head);
        let Some(relation) = descriptor.relation(&head) else {
            return Ok(None);
        };
        if !relation.cardinality.is_to_one() {
            *crossed_to_many = true;
            return Ok(None);
        }
        return Ok(candidate(registry, &relation.target, tail, crossed_to_many)?.map(|rest| format!("{}.{}", head, rest)));
    }

    let whole = uncapitalize(token);
    if whole == descriptor.id.name || descriptor.property(&whole).is_some() || descriptor.relation(&whole).is_some() {
        return Ok(Some(whole));
    }

    let words = words(token);
    for split in (1..words.len()).rev() {
        let head = uncapitalize(&words[..split].concat());
        let Some(relation) = descriptor.relation(&head) else {
            continue;
        };
        if !relation.cardinality.is_to_one() {
            *crossed_to_many = true;
            continue;
        }
        let tail = words[split..].concat();
        if let Some(rest) = candidate(registry, &relation.target, &tail, crossed_to_many)? {
            return Ok(Some(format!("{}.{}", head, rest)));
        }
    }
    Ok(None)
}

pub(crate) fn uncapitalize(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => first.to_ascii_lowercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityDescriptor, FetchType};
    use crate::value::SemanticType;

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
        EntityRegistry::builder().descriptor(team).descriptor(member).build().unwrap()
    }

    #[test]
    fn test_direct_and_nested_tokens() {
        let registry = registry();
        assert_eq!(resolve_token(&registry, "Member", "Username").unwrap().0, "username");
        assert_eq!(resolve_token(&registry, "Member", "TeamName").unwrap().0, "team.name");
        assert_eq!(resolve_token(&registry, "Member", "Team_Name").unwrap().0, "team.name");
        assert_eq!(resolve_token(&registry, "Member", "TeamId").unwrap().0, "team.id");
        assert_eq!(resolve_token(&registry, "Member", "Team").unwrap().0, "team");
    }

    #[test]
    fn test_unknown_and_to_many_tokens() {
        let registry = registry();
        assert_eq!(
            resolve_token(&registry, "Member", "Nickname").unwrap_err(),
            DerivationError::UnknownProperty {
                entity: "Member".to_string(),
                path: "nickname".to_string()
            }
        );
        assert!(matches!(
            resolve_token(&registry, "Team", "MembersUsername"),
            Err(DerivationError::ToManyPath { .. })
        ));
    }
}
