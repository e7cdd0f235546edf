//! # Domain Types
//!
//! The Member/Team model and the projections read from it.
//!
//! ## Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  ┌──────────────────────┐         ┌──────────────────────┐              │
//! │  │       Member         │  N : 1  │        Team          │              │
//! │  │  ──────────────────  │────────►│  ──────────────────  │              │
//! │  │  id (member_id)      │  LAZY   │  id (team_id)        │              │
//! │  │  username            │         │  name                │              │
//! │  │  age                 │         │  members (mapped by  │              │
//! │  │  team (team_id FK)   │         │           team)      │              │
//! │  │  created_date        │         │  created_date        │              │
//! │  │  last_modified_date  │         │  last_modified_date  │              │
//! │  └──────────────────────┘         └──────────────────────┘              │
//! │                                                                         │
//! │  Projections over Member                                                │
//! │  ├── UsernameOnly            open    "{username} {age} {team.name}"     │
//! │  ├── UsernameOnlyDto         closed  username                           │
//! │  ├── NestedClosedProjection  closed  username + team { name }           │
//! │  ├── MemberDto               closed  id, username, team.name (inner)    │
//! │  └── MemberProjection        native  id, username, teamName             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Auditing
//! `created_date` is stamped once on persist and never updated;
//! `last_modified_date` is stamped on persist and on every merge.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::OnceLock;

use crate::derivation::DeclaredQuery;
use crate::entity::{Entity, EntityDescriptor, EntityRegistry, FetchType, PropertyDescriptor, Record, Reference};
use crate::error::{BindError, CoreResult};
use crate::predicate::{Operand, Predicate};
use crate::projection::{Expr, ProjectedRow, Projection, ProjectionShape};
use crate::value::{SemanticType, Value};

fn audit_columns(builder: crate::entity::EntityDescriptorBuilder) -> crate::entity::EntityDescriptorBuilder {
    builder
        .with_property(
            PropertyDescriptor::new("created_date", "created_date", SemanticType::Timestamp)
                .nullable()
                .not_updatable(),
        )
        .with_property(PropertyDescriptor::new("last_modified_date", "last_modified_date", SemanticType::Timestamp).nullable())
}

// =============================================================================
// Team
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Team {
    pub id: Option<i64>,
    pub name: String,
    pub created_date: Option<DateTime<Utc>>,
    pub last_modified_date: Option<DateTime<Utc>>,
}

impl Team {
    pub fn new(name: &str) -> Self {
        Team {
            id: None,
            name: name.to_string(),
            created_date: None,
            last_modified_date: None,
        }
    }
}

impl Entity for Team {
    fn descriptor() -> &'static EntityDescriptor {
        static DESCRIPTOR: OnceLock<EntityDescriptor> = OnceLock::new();
        DESCRIPTOR.get_or_init(|| {
            audit_columns(
                EntityDescriptor::builder("Team", "team")
                    .id("id", "team_id")
                    .property("name", "name", SemanticType::Text),
            )
            .one_to_many("members", "Member", "team")
            .build()
        })
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn to_record(&self) -> Result<Record, BindError> {
        let mut record = Record::new("Team");
        record.id = self.id;
        record.set("name", Value::from(self.name.as_str()));
        record.set("created_date", Value::from(self.created_date));
        record.set("last_modified_date", Value::from(self.last_modified_date));
        Ok(record)
    }

    fn from_record(record: &Record) -> Result<Self, BindError> {
        Ok(Team {
            id: record.id,
            name: record.text("name")?,
            created_date: record.opt_timestamp("created_date")?,
            last_modified_date: record.opt_timestamp("last_modified_date")?,
        })
    }

    fn on_persist(&mut self, now: DateTime<Utc>) {
        self.created_date = Some(now);
        self.last_modified_date = Some(now);
    }

    fn on_merge(&mut self, now: DateTime<Utc>) {
        self.last_modified_date = Some(now);
    }
}

// =============================================================================
// Member
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub id: Option<i64>,
    pub username: String,
    pub age: i32,
    pub team: Reference<Team>,
    pub created_date: Option<DateTime<Utc>>,
    pub last_modified_date: Option<DateTime<Utc>>,
}

impl Member {
    pub fn new(username: &str, age: i32) -> Self {
        Member {
            id: None,
            username: username.to_string(),
            age,
            team: Reference::None,
            created_date: None,
            last_modified_date: None,
        }
    }

    /// Member in `team`. The team must already be saved.
    pub fn with_team(username: &str, age: i32, team: &Team) -> Self {
        Member {
            team: Reference::to(team.clone()),
            ..Member::new(username, age)
        }
    }

    pub fn change_team(&mut self, team: &Team) {
        self.team = Reference::to(team.clone());
    }

    pub fn change_username(&mut self, username: &str) {
        self.username = username.to_string();
    }
}

impl Entity for Member {
    fn descriptor() -> &'static EntityDescriptor {
        static DESCRIPTOR: OnceLock<EntityDescriptor> = OnceLock::new();
        DESCRIPTOR.get_or_init(|| {
            audit_columns(
                EntityDescriptor::builder("Member", "member")
                    .id("id", "member_id")
                    .property("username", "username", SemanticType::Text)
                    .property("age", "age", SemanticType::Integer),
            )
            .many_to_one("team", "Team", "team_id", FetchType::Lazy)
            .build()
        })
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn to_record(&self) -> Result<Record, BindError> {
        let mut record = Record::new("Member");
        record.id = self.id;
        record.set("username", Value::from(self.username.as_str()));
        record.set("age", Value::from(self.age));
        record.set("created_date", Value::from(self.created_date));
        record.set("last_modified_date", Value::from(self.last_modified_date));
        record.set_relation("team", self.team.to_state("Member", "team")?);
        Ok(record)
    }

    fn from_record(record: &Record) -> Result<Self, BindError> {
        let age = record.integer("age")?;
        Ok(Member {
            id: record.id,
            username: record.text("username")?,
            age: i32::try_from(age).map_err(|_| BindError::TypeMismatch {
                field: "age".to_string(),
                expected: "32-bit integer".to_string(),
                found: age.to_string(),
            })?,
            team: Reference::from_record(record, "team")?,
            created_date: record.opt_timestamp("created_date")?,
            last_modified_date: record.opt_timestamp("last_modified_date")?,
        })
    }

    fn on_persist(&mut self, now: DateTime<Utc>) {
        self.created_date = Some(now);
        self.last_modified_date = Some(now);
    }

    fn on_merge(&mut self, now: DateTime<Utc>) {
        self.last_modified_date = Some(now);
    }
}

// =============================================================================
// Projections
// =============================================================================

/// Open projection: `"{username} {age} {team.name}"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsernameOnly {
    pub username: String,
}

impl Projection for UsernameOnly {
    fn shape() -> ProjectionShape {
        ProjectionShape::open()
            .expr("username", Expr::template("{username} {age} {team.name}"))
            .into()
    }

    fn from_row(row: &ProjectedRow) -> Result<Self, BindError> {
        Ok(UsernameOnly {
            username: row.text("username")?,
        })
    }
}

/// Closed projection bound by constructor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsernameOnlyDto {
    pub username: String,
}

impl Projection for UsernameOnlyDto {
    fn shape() -> ProjectionShape {
        ProjectionShape::closed().field("username").into()
    }

    fn from_row(row: &ProjectedRow) -> Result<Self, BindError> {
        Ok(UsernameOnlyDto {
            username: row.text("username")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeamInfo {
    pub name: String,
}

/// Closed projection with a nested team subset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NestedClosedProjection {
    pub username: String,
    pub team: Option<TeamInfo>,
}

impl Projection for NestedClosedProjection {
    fn shape() -> ProjectionShape {
        ProjectionShape::closed()
            .field("username")
            .nested("team", ProjectionShape::closed().field("name"))
            .into()
    }

    fn from_row(row: &ProjectedRow) -> Result<Self, BindError> {
        let team = match row.nested("team")? {
            Some(team) => Some(TeamInfo { name: team.text("name")? }),
            None => None,
        };
        Ok(NestedClosedProjection {
            username: row.text("username")?,
            team,
        })
    }
}

/// `select new MemberDto(m.id, m.username, t.name) from Member m join m.team t`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberDto {
    pub id: i64,
    pub username: String,
    pub team_name: String,
}

impl Projection for MemberDto {
    fn shape() -> ProjectionShape {
        ProjectionShape::closed()
            .field("id")
            .field("username")
            .field_as("teamName", "team.name")
            .inner_join()
            .into()
    }

    fn from_row(row: &ProjectedRow) -> Result<Self, BindError> {
        Ok(MemberDto {
            id: row.integer("id")?,
            username: row.text("username")?,
            team_name: row.text("teamName")?,
        })
    }
}

/// Row of the native `member left join team` projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberProjection {
    pub id: i64,
    pub username: String,
    pub team_name: Option<String>,
}

impl Projection for MemberProjection {
    fn shape() -> ProjectionShape {
        ProjectionShape::closed()
            .field("id")
            .field("username")
            .field_as("teamName", "team.name")
            .into()
    }

    fn from_row(row: &ProjectedRow) -> Result<Self, BindError> {
        Ok(MemberProjection {
            id: row.integer("id")?,
            username: row.text("username")?,
            team_name: row.opt_text("teamName")?,
        })
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Registry with Member, Team and the `Member.findByUsername` named query.
pub fn registry() -> CoreResult<EntityRegistry> {
    EntityRegistry::builder()
        .entity::<Team>()
        .entity::<Member>()
        .named_query(
            "Member.findByUsername",
            DeclaredQuery::select().filter(Predicate::eq("username", Operand::named("username"))),
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::RelationState;

    #[test]
    fn test_registry_builds() {
        let registry = registry().unwrap();
        assert!(registry.get("Member").is_some());
        assert!(registry.named_query("Member.findByUsername").is_some());
    }

    #[test]
    fn test_member_record_conversion() {
        let mut team = Team::new("teamA");
        team.set_id(1);
        let mut member = Member::with_team("member1", 10, &team);
        member.set_id(5);

        let record = member.to_record().unwrap();
        assert_eq!(record.value("age"), Some(&Value::Integer(10)));
        assert!(matches!(record.relation("team"), Some(RelationState::Loaded(_))));

        let back = Member::from_record(&record).unwrap();
        assert_eq!(back, member);
        assert_eq!(back.team.loaded().map(|t| t.name.as_str()), Some("teamA"));
    }

    #[test]
    fn test_unsaved_team_is_rejected() {
        let member = Member::with_team("member1", 10, &Team::new("teamA"));
        assert!(matches!(
            member.to_record(),
            Err(BindError::TransientReference { .. })
        ));
    }

    #[test]
    fn test_audit_hooks() {
        let mut member = Member::new("member1", 10);
        let created = Utc::now();
        member.on_persist(created);
        assert_eq!(member.created_date, Some(created));

        let later = created + chrono::Duration::seconds(5);
        member.on_merge(later);
        assert_eq!(member.created_date, Some(created));
        assert_eq!(member.last_modified_date, Some(later));
    }
}
