//! # Member Repository
//!
//! Typed methods over `Member`, each one a contract derived once when the
//! repository is built.
//!
//! ## Method Catalogue
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  derived       findByUsernameAndAgeGreaterThan, findTop3HelloBy,        │
//! │                findListByUsername, findMemberByUsername,                │
//! │                findOptionalByUsername, findByAge (page), findSliceByAge │
//! │  named         findByUsername  ("Member.findByUsername")                │
//! │  declared      findMember, findUsernameList, findMemberDto,             │
//! │                findMemberDtoPage, findByNames, bulkAgePlus,             │
//! │                findMemberFetchJoin                                      │
//! │  entity graph  findAll, findMemberEntityGraph, findEntityGraphByUsername│
//! │  hints/locks   findReadOnlyByUsername, findLockByUsername               │
//! │  projections   findProjectionsByUsername (shape chosen per call)        │
//! │  native        findByNativeQuery, findByNativeProjection (page)         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use quarry_core::derivation::DeclaredQuery;
use quarry_core::query::QuerySpecification;
use quarry_core::{
    Arguments, Assignment, BulkUpdateResult, Entity, EntityRegistry, LockRequest, Member, MemberDto,
    MemberProjection, MethodContract, Modifying, Operand, Page, PageRequest, Predicate, Projection, ProjectionShape,
    ReturnShape, SemanticType, Slice, Sort, Value,
};
use std::sync::Arc;
use std::time::Duration;

use super::Repository;
use crate::error::{DbError, DbResult};
use crate::session::ResultRow;
use crate::unit_of_work::UnitOfWork;

/// Repository for members.
///
/// ## Usage
/// ```rust,ignore
/// let mut uow = db.begin().await?;
/// let page = db
///     .members()
///     .find_by_age(&mut uow, 10, PageRequest::sorted(0, 3, Sort::by_desc(&["username"]))?)
///     .await?;
/// assert_eq!(page.total_elements, 5);
/// ```
#[derive(Debug)]
pub struct MemberRepository {
    repo: Repository<Member>,
}

fn contracts(policy: Modifying) -> Vec<MethodContract> {
    vec![
        MethodContract::new("findByUsernameAndAgeGreaterThan")
            .text("username")
            .integer("age"),
        MethodContract::new("findTop3HelloBy"),
        // resolved through the "Member.findByUsername" named query
        MethodContract::new("findByUsername").text("username"),
        MethodContract::new("findMember").text("username").integer("age").declared(
            DeclaredQuery::select().filter(
                Predicate::eq("username", Operand::named("username")).and(Predicate::eq("age", Operand::named("age"))),
            ),
        ),
        MethodContract::new("findUsernameList")
            .declared(DeclaredQuery::select().project(ProjectionShape::closed().field("username"))),
        MethodContract::new("findMemberDto").declared(DeclaredQuery::select().project(MemberDto::shape())),
        // the count keeps the inner team join
        MethodContract::new("findMemberDtoPage")
            .pageable()
            .returns(ReturnShape::Page)
            .declared(DeclaredQuery::select().project(MemberDto::shape())),
        MethodContract::new("findByNames")
            .collection("names", SemanticType::Text)
            .declared(DeclaredQuery::select().filter(Predicate::is_in("username", Operand::named("names")))),
        MethodContract::new("findListByUsername").text("username"),
        MethodContract::new("findMemberByUsername")
            .text("username")
            .returns(ReturnShape::One),
        MethodContract::new("findOptionalByUsername")
            .text("username")
            .returns(ReturnShape::Optional),
        MethodContract::new("findByAge")
            .integer("age")
            .pageable()
            .returns(ReturnShape::Page),
        MethodContract::new("findSliceByAge")
            .integer("age")
            .pageable()
            .returns(ReturnShape::Slice),
        // page whose count skips the team join
        MethodContract::new("findJoinedByAge")
            .integer("age")
            .pageable()
            .returns(ReturnShape::Page)
            .declared(
                DeclaredQuery::select()
                    .filter(Predicate::eq("age", Operand::named("age")))
                    .fetch("team"),
            )
            .count_query(DeclaredQuery::select().filter(Predicate::eq("age", Operand::named("age")))),
        MethodContract::new("bulkAgePlus")
            .integer("age")
            .returns(ReturnShape::Affected)
            .modifying(policy)
            .declared(
                DeclaredQuery::update(vec![Assignment::increment("age", 1)])
                    .filter(Predicate::ge("age", Operand::named("age"))),
            ),
        MethodContract::new("bulkAgePlusKeepingCache")
            .integer("age")
            .returns(ReturnShape::Affected)
            .modifying(Modifying::keep_cache())
            .declared(
                DeclaredQuery::update(vec![Assignment::increment("age", 1)])
                    .filter(Predicate::ge("age", Operand::named("age"))),
            ),
        MethodContract::new("countByAge").integer("age").returns(ReturnShape::Count),
        MethodContract::new("existsByUsername")
            .text("username")
            .returns(ReturnShape::Exists),
        MethodContract::new("findMemberFetchJoin").declared(DeclaredQuery::select().fetch("team")),
        MethodContract::new("findAll").entity_graph(&["team"]),
        MethodContract::new("findMemberEntityGraph")
            .entity_graph(&["team"])
            .declared(DeclaredQuery::select()),
        MethodContract::new("findEntityGraphByUsername")
            .text("username")
            .entity_graph(&["team"]),
        MethodContract::new("findReadOnlyByUsername")
            .text("username")
            .read_only(),
        MethodContract::new("findLockByUsername")
            .text("username")
            .lock(LockRequest::write())
            .comment("findLockByUsername"),
        MethodContract::new("findProjectionsByUsername")
            .text("username")
            .dynamic_projection(),
        MethodContract::new("findByNativeQuery")
            .text("username")
            .returns(ReturnShape::Optional)
            .timeout(Duration::from_secs(2))
            .native("select * from member where username = ?"),
        MethodContract::new("findByNativeProjection")
            .pageable()
            .returns(ReturnShape::Page)
            .projection(MemberProjection::shape())
            .native(
                "select m.member_id as id, m.username, t.name as teamName \
                 from member m left join team t on m.team_id = t.team_id",
            )
            .native_count("select count(*) from member"),
    ]
}

impl MemberRepository {
    /// Derives every member method.
    ///
    /// `policy` applies to `bulkAgePlus`; `bulkAgePlusKeepingCache` always
    /// keeps the cache.
    pub fn new(registry: Arc<EntityRegistry>, policy: Modifying) -> DbResult<Self> {
        let mut builder = Repository::builder(registry, policy);
        for contract in contracts(policy) {
            builder = builder.method(contract);
        }
        Ok(MemberRepository { repo: builder.build()? })
    }

    /// The generic repository, for calling methods by name.
    pub fn repository(&self) -> &Repository<Member> {
        &self.repo
    }

    // -------------------------------------------------------------------------
    // CRUD
    // -------------------------------------------------------------------------

    pub async fn save(&self, uow: &mut UnitOfWork, member: Member) -> DbResult<Member> {
        self.repo.save(uow, member).await
    }

    pub async fn find_by_id(&self, uow: &mut UnitOfWork, id: i64) -> DbResult<Option<Member>> {
        self.repo.find_by_id(uow, id).await
    }

    pub async fn count(&self, uow: &mut UnitOfWork) -> DbResult<u64> {
        self.repo.count(uow).await
    }

    pub async fn delete(&self, uow: &mut UnitOfWork, member: &Member) -> DbResult<()> {
        self.repo.delete(uow, member).await
    }

    /// Every member with its team, in one statement.
    pub async fn find_all(&self, uow: &mut UnitOfWork) -> DbResult<Vec<Member>> {
        self.repo.list(uow, "findAll", Arguments::new()).await
    }

    pub async fn find_all_paged(&self, uow: &mut UnitOfWork, request: PageRequest) -> DbResult<Page<Member>> {
        self.repo.find_all_paged(uow, request).await
    }

    // -------------------------------------------------------------------------
    // Derived and Declared Finders
    // -------------------------------------------------------------------------

    pub async fn find_by_username_and_age_greater_than(
        &self,
        uow: &mut UnitOfWork,
        username: &str,
        age: i32,
    ) -> DbResult<Vec<Member>> {
        let args = Arguments::new().value(username).value(age);
        self.repo.list(uow, "findByUsernameAndAgeGreaterThan", args).await
    }

    /// First three members in table order.
    pub async fn find_top3(&self, uow: &mut UnitOfWork) -> DbResult<Vec<Member>> {
        self.repo.list(uow, "findTop3HelloBy", Arguments::new()).await
    }

    pub async fn find_by_username(&self, uow: &mut UnitOfWork, username: &str) -> DbResult<Vec<Member>> {
        self.repo
            .list(uow, "findByUsername", Arguments::new().value(username))
            .await
    }

    pub async fn find_member(&self, uow: &mut UnitOfWork, username: &str, age: i32) -> DbResult<Vec<Member>> {
        let args = Arguments::new().value(username).value(age);
        self.repo.list(uow, "findMember", args).await
    }

    pub async fn find_username_list(&self, uow: &mut UnitOfWork) -> DbResult<Vec<String>> {
        let values = self.repo.scalars(uow, "findUsernameList", Arguments::new()).await?;
        values
            .into_iter()
            .map(|value| match value {
                Value::Text(username) => Ok(username),
                other => Err(DbError::Internal(format!("username column held {}", other))),
            })
            .collect()
    }

    /// Members that have a team, as DTOs.
    pub async fn find_member_dto(&self, uow: &mut UnitOfWork) -> DbResult<Vec<MemberDto>> {
        self.repo.project(uow, "findMemberDto", Arguments::new()).await
    }

    /// Page of [`Self::find_member_dto`]; members without a team are
    /// neither listed nor counted.
    pub async fn find_member_dto_page(&self, uow: &mut UnitOfWork, request: PageRequest) -> DbResult<Page<MemberDto>> {
        self.repo
            .project_page(uow, "findMemberDtoPage", Arguments::new().page(request))
            .await
    }

    pub async fn find_by_names(&self, uow: &mut UnitOfWork, names: &[&str]) -> DbResult<Vec<Member>> {
        let args = Arguments::new().value(Value::from(names.to_vec()));
        self.repo.list(uow, "findByNames", args).await
    }

    pub async fn find_list_by_username(&self, uow: &mut UnitOfWork, username: &str) -> DbResult<Vec<Member>> {
        self.repo
            .list(uow, "findListByUsername", Arguments::new().value(username))
            .await
    }

    /// ## Returns
    /// * `Err(DbError::NotFound)` - no member has this username
    /// * `Err(DbError::NonUniqueResult)` - several members do
    pub async fn find_member_by_username(&self, uow: &mut UnitOfWork, username: &str) -> DbResult<Member> {
        self.repo
            .one(uow, "findMemberByUsername", Arguments::new().value(username))
            .await
    }

    pub async fn find_optional_by_username(&self, uow: &mut UnitOfWork, username: &str) -> DbResult<Option<Member>> {
        self.repo
            .optional(uow, "findOptionalByUsername", Arguments::new().value(username))
            .await
    }

    pub async fn count_by_age(&self, uow: &mut UnitOfWork, age: i32) -> DbResult<u64> {
        self.repo.count_by(uow, "countByAge", Arguments::new().value(age)).await
    }

    pub async fn exists_by_username(&self, uow: &mut UnitOfWork, username: &str) -> DbResult<bool> {
        self.repo
            .exists(uow, "existsByUsername", Arguments::new().value(username))
            .await
    }

    // -------------------------------------------------------------------------
    // Paging
    // -------------------------------------------------------------------------

    pub async fn find_by_age(&self, uow: &mut UnitOfWork, age: i32, request: PageRequest) -> DbResult<Page<Member>> {
        let args = Arguments::new().value(age).page(request);
        self.repo.page(uow, "findByAge", args).await
    }

    /// Same rows as [`Self::find_by_age`] without a count query.
    pub async fn find_slice_by_age(&self, uow: &mut UnitOfWork, age: i32, request: PageRequest) -> DbResult<Slice<Member>> {
        let args = Arguments::new().value(age).page(request);
        self.repo.slice(uow, "findSliceByAge", args).await
    }

    pub async fn find_joined_by_age(&self, uow: &mut UnitOfWork, age: i32, request: PageRequest) -> DbResult<Page<Member>> {
        let args = Arguments::new().value(age).page(request);
        self.repo.page(uow, "findJoinedByAge", args).await
    }

    // -------------------------------------------------------------------------
    // Bulk Updates
    // -------------------------------------------------------------------------

    /// Adds one to the age of every member at least `age` old.
    pub async fn bulk_age_plus(&self, uow: &mut UnitOfWork, age: i32) -> DbResult<BulkUpdateResult> {
        self.repo.bulk(uow, "bulkAgePlus", Arguments::new().value(age)).await
    }

    /// [`Self::bulk_age_plus`] that leaves the identity map alone and reports
    /// what went stale.
    pub async fn bulk_age_plus_keeping_cache(&self, uow: &mut UnitOfWork, age: i32) -> DbResult<BulkUpdateResult> {
        self.repo
            .bulk(uow, "bulkAgePlusKeepingCache", Arguments::new().value(age))
            .await
    }

    // -------------------------------------------------------------------------
    // Fetch Plans
    // -------------------------------------------------------------------------

    pub async fn find_member_fetch_join(&self, uow: &mut UnitOfWork) -> DbResult<Vec<Member>> {
        self.repo.list(uow, "findMemberFetchJoin", Arguments::new()).await
    }

    pub async fn find_member_entity_graph(&self, uow: &mut UnitOfWork) -> DbResult<Vec<Member>> {
        self.repo.list(uow, "findMemberEntityGraph", Arguments::new()).await
    }

    pub async fn find_entity_graph_by_username(&self, uow: &mut UnitOfWork, username: &str) -> DbResult<Vec<Member>> {
        self.repo
            .list(uow, "findEntityGraphByUsername", Arguments::new().value(username))
            .await
    }

    // -------------------------------------------------------------------------
    // Hints and Locks
    // -------------------------------------------------------------------------

    /// Rows are not attached to the unit of work.
    pub async fn find_read_only_by_username(&self, uow: &mut UnitOfWork, username: &str) -> DbResult<Vec<Member>> {
        self.repo
            .list(uow, "findReadOnlyByUsername", Arguments::new().value(username))
            .await
    }

    /// Takes the write lock before reading.
    ///
    /// ## Returns
    /// * `Err(DbError::LockConflict)` - another unit of work holds the lock
    ///   past the lock timeout
    pub async fn find_lock_by_username(&self, uow: &mut UnitOfWork, username: &str) -> DbResult<Vec<Member>> {
        self.repo
            .list(uow, "findLockByUsername", Arguments::new().value(username))
            .await
    }

    // -------------------------------------------------------------------------
    // Projections and Native Queries
    // -------------------------------------------------------------------------

    pub async fn find_projections_by_username<P: Projection>(
        &self,
        uow: &mut UnitOfWork,
        username: &str,
    ) -> DbResult<Vec<P>> {
        self.repo
            .project_dynamic(uow, "findProjectionsByUsername", Arguments::new().value(username))
            .await
    }

    pub async fn find_by_native_query(&self, uow: &mut UnitOfWork, username: &str) -> DbResult<Option<Member>> {
        self.repo
            .optional(uow, "findByNativeQuery", Arguments::new().value(username))
            .await
    }

    pub async fn find_by_native_projection(
        &self,
        uow: &mut UnitOfWork,
        request: PageRequest,
    ) -> DbResult<Page<MemberProjection>> {
        self.repo
            .project_page(uow, "findByNativeProjection", Arguments::new().page(request))
            .await
    }

    /// Hand-written query outside the derived catalogue.
    pub async fn find_member_custom(&self, uow: &mut UnitOfWork) -> DbResult<Vec<Member>> {
        let spec = QuerySpecification::select("Member").with_sort(Sort::by(&["id"]));
        let rows = uow.execute(&spec).await?;
        rows.iter()
            .filter_map(|row| match row {
                ResultRow::Entity(record) => Some(record),
                ResultRow::Columns(_) => None,
            })
            .map(|record| Ok(Member::from_record(record)?))
            .collect()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use crate::sqlite::SqlRenderer;
    use quarry_core::{NestedClosedProjection, Team, UsernameOnly, UsernameOnlyDto};
    use std::time::Duration;

    async fn database() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    async fn save_all(db: &Database, uow: &mut UnitOfWork, members: &[(&str, i32)]) -> Vec<Member> {
        let mut saved = Vec::new();
        for (username, age) in members {
            saved.push(db.members().save(uow, Member::new(username, *age)).await.unwrap());
        }
        saved
    }

    #[tokio::test]
    async fn test_save_then_find_by_id() {
        let db = database().await;
        let mut uow = db.begin().await.unwrap();

        let team = db.teams().save(&mut uow, Team::new("teamA")).await.unwrap();
        let saved = db
            .members()
            .save(&mut uow, Member::with_team("memberA", 10, &team))
            .await
            .unwrap();
        assert!(saved.created_date.is_some());

        uow.clear();
        let found = db
            .members()
            .find_by_id(&mut uow, saved.id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, saved);
        assert_eq!(found.team.id(), team.id);
        assert!(!found.team.is_loaded());

        assert_eq!(db.members().count(&mut uow).await.unwrap(), 1);
        db.members().delete(&mut uow, &found).await.unwrap();
        assert_eq!(db.members().count(&mut uow).await.unwrap(), 0);
        uow.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_derived_finder_matches_hand_written_query() {
        let db = database().await;
        let mut uow = db.begin().await.unwrap();
        save_all(&db, &mut uow, &[("AAA", 10), ("AAA", 20), ("AAA", 30), ("BBB", 40)]).await;

        let derived = db
            .members()
            .find_by_username_and_age_greater_than(&mut uow, "AAA", 15)
            .await
            .unwrap();
        let ages: Vec<i32> = derived.iter().map(|m| m.age).collect();
        assert_eq!(ages, vec![20, 30]);

        let spec = QuerySpecification::select("Member")
            .with_predicate(Predicate::eq("username", "AAA").and(Predicate::gt("age", 15)));
        let rows = uow.execute(&spec).await.unwrap();
        assert_eq!(rows.len(), derived.len());
    }

    #[tokio::test]
    async fn test_derived_finder_is_repeatable() {
        let db = database().await;
        let mut uow = db.begin().await.unwrap();
        save_all(&db, &mut uow, &[("AAA", 10), ("AAA", 20), ("BBB", 30)]).await;
        let before = db.members().count(&mut uow).await.unwrap();

        let first = db
            .members()
            .find_by_username_and_age_greater_than(&mut uow, "AAA", 15)
            .await
            .unwrap();
        let second = db
            .members()
            .find_by_username_and_age_greater_than(&mut uow, "AAA", 15)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
        assert_eq!(db.members().count(&mut uow).await.unwrap(), before);

        uow.clear();
        let fresh = db
            .members()
            .find_by_username_and_age_greater_than(&mut uow, "AAA", 15)
            .await
            .unwrap();
        assert_eq!(fresh, first);
    }

    #[tokio::test]
    async fn test_comparators_against_rows() {
        let db = database().await;
        let repo = Repository::<Member>::builder(db.registry().clone(), Modifying::default())
            .method(MethodContract::new("findByAgeBetween").integer("from").integer("to"))
            .method(MethodContract::new("findByUsernameNotIn").collection("names", SemanticType::Text))
            .method(MethodContract::new("findByUsernameContaining").text("part"))
            .method(MethodContract::new("findByUsernameStartingWith").text("prefix"))
            .method(MethodContract::new("findByUsernameIgnoreCase").text("username"))
            .method(MethodContract::new("findByUsernameContainingIgnoreCase").text("part"))
            .build()
            .unwrap();
        let mut uow = db.begin().await.unwrap();
        save_all(&db, &mut uow, &[("a%b", 10), ("a_b", 20), ("axb", 30), ("Mixed", 40)]).await;

        let names = |members: Vec<Member>| {
            let mut names: Vec<String> = members.into_iter().map(|m| m.username).collect();
            names.sort();
            names
        };

        // bounds are inclusive
        let between = repo
            .list(&mut uow, "findByAgeBetween", Arguments::new().value(20).value(30))
            .await
            .unwrap();
        assert_eq!(names(between), vec!["a_b", "axb"]);

        let not_in = repo
            .list(
                &mut uow,
                "findByUsernameNotIn",
                Arguments::new().value(Value::from(vec!["a%b", "Mixed"])),
            )
            .await
            .unwrap();
        assert_eq!(names(not_in), vec!["a_b", "axb"]);

        let empty: Vec<&str> = Vec::new();
        let not_in_nothing = repo
            .list(&mut uow, "findByUsernameNotIn", Arguments::new().value(Value::from(empty)))
            .await
            .unwrap();
        assert_eq!(not_in_nothing.len(), 4);

        // wildcards in the argument match themselves only
        let percent = repo
            .list(&mut uow, "findByUsernameContaining", Arguments::new().value("%"))
            .await
            .unwrap();
        assert_eq!(names(percent), vec!["a%b"]);
        let underscore = repo
            .list(&mut uow, "findByUsernameContaining", Arguments::new().value("_"))
            .await
            .unwrap();
        assert_eq!(names(underscore), vec!["a_b"]);
        let prefix = repo
            .list(&mut uow, "findByUsernameStartingWith", Arguments::new().value("a_"))
            .await
            .unwrap();
        assert_eq!(names(prefix), vec!["a_b"]);

        let exact = repo
            .list(&mut uow, "findByUsernameIgnoreCase", Arguments::new().value("MIXED"))
            .await
            .unwrap();
        assert_eq!(names(exact), vec!["Mixed"]);
        let part = repo
            .list(&mut uow, "findByUsernameContainingIgnoreCase", Arguments::new().value("iXe"))
            .await
            .unwrap();
        assert_eq!(names(part), vec!["Mixed"]);

        // LIKE is case-sensitive without IgnoreCase
        let sensitive = repo
            .list(&mut uow, "findByUsernameContaining", Arguments::new().value("iXe"))
            .await
            .unwrap();
        assert!(sensitive.is_empty());
    }

    #[tokio::test]
    async fn test_named_declared_and_collection_queries() {
        let db = database().await;
        let mut uow = db.begin().await.unwrap();
        save_all(&db, &mut uow, &[("AAA", 10), ("BBB", 20), ("CCC", 30), ("DDD", 40)]).await;

        let named = db.members().find_by_username(&mut uow, "AAA").await.unwrap();
        assert_eq!(named.len(), 1);

        let declared = db.members().find_member(&mut uow, "BBB", 20).await.unwrap();
        assert_eq!(declared[0].username, "BBB");
        assert!(db.members().find_member(&mut uow, "BBB", 21).await.unwrap().is_empty());

        let by_names = db.members().find_by_names(&mut uow, &["AAA", "CCC"]).await.unwrap();
        let names: Vec<&str> = by_names.iter().map(|m| m.username.as_str()).collect();
        assert_eq!(names, vec!["AAA", "CCC"]);
        assert!(db.members().find_by_names(&mut uow, &[]).await.unwrap().is_empty());

        let usernames = db.members().find_username_list(&mut uow).await.unwrap();
        assert_eq!(usernames, vec!["AAA", "BBB", "CCC", "DDD"]);

        let top = db.members().find_top3(&mut uow).await.unwrap();
        assert_eq!(top.len(), 3);

        assert_eq!(db.members().count_by_age(&mut uow, 20).await.unwrap(), 1);
        assert!(db.members().exists_by_username(&mut uow, "DDD").await.unwrap());
        assert!(!db.members().exists_by_username(&mut uow, "ZZZ").await.unwrap());
    }

    #[tokio::test]
    async fn test_single_result_conventions() {
        let db = database().await;
        let mut uow = db.begin().await.unwrap();
        save_all(&db, &mut uow, &[("AAA", 10), ("BBB", 20), ("BBB", 30)]).await;

        assert!(db
            .members()
            .find_list_by_username(&mut uow, "nobody")
            .await
            .unwrap()
            .is_empty());
        assert!(matches!(
            db.members().find_member_by_username(&mut uow, "nobody").await,
            Err(DbError::NotFound { .. })
        ));
        assert!(db
            .members()
            .find_optional_by_username(&mut uow, "nobody")
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            db.members()
                .find_member_by_username(&mut uow, "AAA")
                .await
                .unwrap()
                .age,
            10
        );
        assert!(matches!(
            db.members().find_optional_by_username(&mut uow, "BBB").await,
            Err(DbError::NonUniqueResult { found: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_page_and_slice() {
        let db = database().await;
        let mut uow = db.begin().await.unwrap();
        save_all(&db, &mut uow, &[("m1", 10), ("m2", 10), ("m3", 10), ("m4", 10), ("m5", 10)]).await;

        let request = PageRequest::sorted(0, 3, Sort::by_desc(&["username"])).unwrap();
        let page = db.members().find_by_age(&mut uow, 10, request.clone()).await.unwrap();
        let names: Vec<&str> = page.content.iter().map(|m| m.username.as_str()).collect();
        assert_eq!(names, vec!["m5", "m4", "m3"]);
        assert_eq!(page.total_elements, 5);
        assert_eq!(page.number, 0);
        assert_eq!(page.total_pages(), 2);
        assert!(page.is_first());
        assert!(page.has_next());
        assert!(!page.is_last());

        // the last page is not full, so its total needs no count query
        let before = uow.stats().round_trips;
        let last = db.members().find_by_age(&mut uow, 10, request.next()).await.unwrap();
        assert_eq!(last.content.len(), 2);
        assert_eq!(last.total_elements, 5);
        assert_eq!(uow.stats().round_trips, before + 1);

        let slice = db.members().find_slice_by_age(&mut uow, 10, request).await.unwrap();
        assert_eq!(slice.content.len(), 3);
        assert_eq!(slice.number, 0);
        assert!(slice.is_first());
        assert!(slice.has_next);
        assert!(!slice.is_last());

        let joined = db
            .members()
            .find_joined_by_age(&mut uow, 10, PageRequest::of(1, 2).unwrap())
            .await
            .unwrap();
        assert_eq!(joined.content.len(), 2);
        assert_eq!(joined.total_elements, 5);
    }

    #[tokio::test]
    async fn test_bulk_update_clears_identity_map() {
        let db = database().await;
        let mut uow = db.begin().await.unwrap();
        save_all(&db, &mut uow, &[("m1", 10), ("m2", 19), ("m3", 20), ("m4", 21), ("m5", 40)]).await;

        let result = db.members().bulk_age_plus(&mut uow, 20).await.unwrap();
        assert_eq!(result.affected, 3);
        assert!(result.stale.is_none());

        let mut ages: Vec<i32> = db
            .members()
            .find_member_custom(&mut uow)
            .await
            .unwrap()
            .iter()
            .map(|m| m.age)
            .collect();
        ages.sort_unstable();
        assert_eq!(ages, vec![10, 19, 21, 22, 41]);
    }

    #[tokio::test]
    async fn test_bulk_update_keeping_cache_reports_stale_entities() {
        let db = database().await;
        let mut uow = db.begin().await.unwrap();
        let saved = save_all(&db, &mut uow, &[("m1", 10), ("m5", 40)]).await;

        let result = db.members().bulk_age_plus_keeping_cache(&mut uow, 20).await.unwrap();
        assert_eq!(result.affected, 1);
        let stale = result.stale.unwrap();
        assert_eq!(stale.entity, "Member");
        assert_eq!(stale.cached_ids.len(), saved.len());

        // the managed instance still holds the pre-update age
        let cached = db.members().find_by_username(&mut uow, "m5").await.unwrap();
        assert_eq!(cached[0].age, 40);

        uow.clear();
        let fresh = db.members().find_by_username(&mut uow, "m5").await.unwrap();
        assert_eq!(fresh[0].age, 41);
    }

    #[tokio::test]
    async fn test_lazy_loading_versus_entity_graph() {
        let db = database().await;
        let mut uow = db.begin().await.unwrap();
        let team_a = db.teams().save(&mut uow, Team::new("teamA")).await.unwrap();
        let team_b = db.teams().save(&mut uow, Team::new("teamB")).await.unwrap();
        db.members()
            .save(&mut uow, Member::with_team("m1", 10, &team_a))
            .await
            .unwrap();
        db.members()
            .save(&mut uow, Member::with_team("m2", 10, &team_b))
            .await
            .unwrap();
        uow.clear();

        // N + 1: one select for members, one per distinct team
        let start = uow.stats();
        let members = db.members().find_member_custom(&mut uow).await.unwrap();
        let mut teams = Vec::new();
        for member in &members {
            assert!(!member.team.is_loaded());
            teams.push(uow.load_reference(&member.team).await.unwrap().unwrap().name);
        }
        assert_eq!(teams, vec!["teamA", "teamB"]);
        assert_eq!(uow.stats().round_trips - start.round_trips, 3);
        assert_eq!(uow.stats().lazy_loads - start.lazy_loads, 2);

        uow.clear();
        let start = uow.stats();
        for members in [
            db.members().find_all(&mut uow).await.unwrap(),
            db.members().find_member_fetch_join(&mut uow).await.unwrap(),
            db.members().find_member_entity_graph(&mut uow).await.unwrap(),
            db.members().find_entity_graph_by_username(&mut uow, "m1").await.unwrap(),
        ] {
            assert!(members.iter().all(|m| m.team.is_loaded()));
        }
        assert_eq!(uow.stats().round_trips - start.round_trips, 4);
        assert_eq!(uow.stats().lazy_loads, start.lazy_loads);
    }

    #[tokio::test]
    async fn test_read_only_rows_are_not_managed() {
        let db = database().await;
        let mut uow = db.begin().await.unwrap();
        let saved = save_all(&db, &mut uow, &[("m1", 10)]).await;
        let id = saved[0].id.unwrap();
        uow.clear();

        let rows = db.members().find_read_only_by_username(&mut uow, "m1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!uow.contains("Member", id));

        db.members().find_list_by_username(&mut uow, "m1").await.unwrap();
        assert!(uow.contains("Member", id));
    }

    #[tokio::test]
    async fn test_projections() {
        let db = database().await;
        let mut uow = db.begin().await.unwrap();
        let team = db.teams().save(&mut uow, Team::new("team1")).await.unwrap();
        db.members()
            .save(&mut uow, Member::with_team("m1", 10, &team))
            .await
            .unwrap();
        db.members().save(&mut uow, Member::new("m2", 20)).await.unwrap();
        uow.clear();

        let dtos: Vec<UsernameOnlyDto> = db.members().find_projections_by_username(&mut uow, "m1").await.unwrap();
        assert_eq!(dtos, vec![UsernameOnlyDto { username: "m1".into() }]);

        let nested: Vec<NestedClosedProjection> =
            db.members().find_projections_by_username(&mut uow, "m1").await.unwrap();
        assert_eq!(nested[0].team.as_ref().map(|t| t.name.as_str()), Some("team1"));

        let without_team: Vec<NestedClosedProjection> =
            db.members().find_projections_by_username(&mut uow, "m2").await.unwrap();
        assert!(without_team[0].team.is_none());

        let open: Vec<UsernameOnly> = db.members().find_projections_by_username(&mut uow, "m1").await.unwrap();
        assert_eq!(open[0].username, "m1 10 team1");

        // inner join drops the member without a team
        let member_dtos = db.members().find_member_dto(&mut uow).await.unwrap();
        assert_eq!(member_dtos.len(), 1);
        assert_eq!(member_dtos[0].team_name, "team1");
    }

    #[tokio::test]
    async fn test_projected_page_counts_only_joined_rows() {
        let db = database().await;
        let mut uow = db.begin().await.unwrap();
        let team = db.teams().save(&mut uow, Team::new("t1")).await.unwrap();
        db.members()
            .save(&mut uow, Member::with_team("m1", 10, &team))
            .await
            .unwrap();
        save_all(&db, &mut uow, &[("m2", 20), ("m3", 30)]).await;

        let first = db
            .members()
            .find_member_dto_page(&mut uow, PageRequest::of(0, 1).unwrap())
            .await
            .unwrap();
        assert_eq!(first.content.len(), 1);
        assert_eq!(first.content[0].team_name, "t1");
        assert_eq!(first.total_elements, 1);
        assert_eq!(first.total_pages(), 1);
        assert!(!first.has_next());

        let second = db
            .members()
            .find_member_dto_page(&mut uow, PageRequest::of(1, 1).unwrap())
            .await
            .unwrap();
        assert!(second.content.is_empty());
        assert_eq!(second.total_elements, 1);

        let bound = db
            .members()
            .repository()
            .template("findMemberDtoPage")
            .unwrap()
            .bind(
                db.registry(),
                &Arguments::new().page(PageRequest::of(0, 1).unwrap()),
                None,
            )
            .unwrap();
        let count = bound.count.unwrap();
        let sql = SqlRenderer::new(db.registry()).count(&count).unwrap().sql;
        assert!(sql.contains("INNER JOIN team j0"));
    }

    #[tokio::test]
    async fn test_slow_statement_times_out() {
        let db = database().await;
        let repo = Repository::<Member>::builder(db.registry().clone(), Modifying::default())
            .method(
                MethodContract::new("findSlowByUsername")
                    .text("username")
                    .timeout(Duration::from_millis(20))
                    .native(
                        "with recursive c(x) as (select 1 union all select x + 1 from c where x < 20000000) \
                         select m.* from member m where m.username = ? and (select count(*) from c) > 0",
                    ),
            )
            .build()
            .unwrap();
        let mut uow = db.begin().await.unwrap();
        save_all(&db, &mut uow, &[("m1", 10)]).await;

        let err = repo
            .list(&mut uow, "findSlowByUsername", Arguments::new().value("m1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Timeout { millis: 20 }));
        assert!(!err.is_conflict());

        let template = db.members().repository().template("findByNativeQuery").unwrap();
        let bound = template
            .bind(db.registry(), &Arguments::new().value("m1"), None)
            .unwrap();
        assert_eq!(bound.spec.hints.timeout, Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_projection_statements() {
        let db = database().await;
        let registry = db.registry().clone();
        let template = db.members().repository().template("findProjectionsByUsername").unwrap();
        let args = Arguments::new().value("m1");

        let closed = template
            .bind(&registry, &args, Some(&UsernameOnlyDto::shape()))
            .unwrap();
        let sql = SqlRenderer::new(&registry).select(&closed.spec).unwrap().statement.sql;
        assert_eq!(sql, "SELECT t0.username FROM member t0 WHERE t0.username = ?");

        let open = template.bind(&registry, &args, Some(&UsernameOnly::shape())).unwrap();
        let sql = SqlRenderer::new(&registry).select(&open.spec).unwrap().statement.sql;
        assert!(sql.contains("t0.created_date"));
        assert!(sql.contains("LEFT JOIN team j0"));

        // binding the same arguments twice yields the same specification
        assert_eq!(template.bind(&registry, &args, Some(&UsernameOnly::shape())).unwrap(), open);
    }

    #[tokio::test]
    async fn test_native_queries() {
        let db = database().await;
        let mut uow = db.begin().await.unwrap();
        let team = db.teams().save(&mut uow, Team::new("team1")).await.unwrap();
        db.members()
            .save(&mut uow, Member::with_team("m1", 10, &team))
            .await
            .unwrap();
        db.members().save(&mut uow, Member::new("m2", 10)).await.unwrap();

        let member = db.members().find_by_native_query(&mut uow, "m1").await.unwrap().unwrap();
        assert_eq!(member.age, 10);
        assert_eq!(member.team.id(), team.id);
        assert!(member.created_date.is_some());

        let page = db
            .members()
            .find_by_native_projection(&mut uow, PageRequest::of(0, 10).unwrap())
            .await
            .unwrap();
        assert_eq!(page.total_elements, 2);
        assert_eq!(page.content[0].team_name.as_deref(), Some("team1"));
        assert_eq!(page.content[1].team_name, None);

        // a full first page cannot prove its total: the native count runs
        let first = db
            .members()
            .find_by_native_projection(&mut uow, PageRequest::sorted(0, 1, Sort::by_desc(&["username"])).unwrap())
            .await
            .unwrap();
        assert_eq!(first.content[0].username, "m2");
        assert_eq!(first.total_elements, 2);
    }

    #[tokio::test]
    async fn test_unknown_method_and_wrong_accessor() {
        let db = database().await;
        let mut uow = db.begin().await.unwrap();
        let repo = db.members().repository();

        assert!(matches!(
            repo.list(&mut uow, "findByNickname", Arguments::new()).await,
            Err(DbError::UnknownMethod { .. })
        ));
        assert!(matches!(
            repo.list(&mut uow, "findOptionalByUsername", Arguments::new().value("m1")).await,
            Err(DbError::ReturnShapeMismatch { .. })
        ));
        assert!(matches!(
            repo.list(&mut uow, "findListByUsername", Arguments::new().value(3)).await,
            Err(DbError::Core(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_contract_fails_at_build() {
        let registry = Arc::new(quarry_core::types::registry().unwrap());
        let result = Repository::<Member>::builder(registry.clone(), Modifying::default())
            .method(MethodContract::new("findByNickname").text("nickname"))
            .build();
        assert!(matches!(result, Err(DbError::Core(_))));

        let duplicate = Repository::<Member>::builder(registry, Modifying::default())
            .method(MethodContract::new("findListByUsername").text("username"))
            .method(MethodContract::new("findListByUsername").text("username"))
            .build();
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn test_pessimistic_lock_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let config = DbConfig::new(dir.path().join("lock.db"))
            .max_connections(2)
            .busy_timeout(Duration::from_millis(100));
        let db = Database::new(config).await.unwrap();

        let mut setup = db.begin().await.unwrap();
        save_all(&db, &mut setup, &[("m1", 10)]).await;
        setup.commit().await.unwrap();

        let mut holder = db.begin().await.unwrap();
        let locked = db.members().find_lock_by_username(&mut holder, "m1").await.unwrap();
        assert_eq!(locked.len(), 1);

        let mut contender = db.begin().await.unwrap();
        let err = db
            .members()
            .find_lock_by_username(&mut contender, "m1")
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::LockConflict(_)));
        assert!(err.is_conflict());
        contender.rollback().await.unwrap();

        holder.commit().await.unwrap();

        // released on commit
        let mut next = db.begin().await.unwrap();
        assert_eq!(db.members().find_lock_by_username(&mut next, "m1").await.unwrap().len(), 1);
        next.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_member_team_change_is_merged() {
        let db = database().await;
        let mut uow = db.begin().await.unwrap();
        let team_a = db.teams().save(&mut uow, Team::new("teamA")).await.unwrap();
        let team_b = db.teams().save(&mut uow, Team::new("teamB")).await.unwrap();
        let mut member = db
            .members()
            .save(&mut uow, Member::with_team("m1", 10, &team_a))
            .await
            .unwrap();
        let created = member.created_date;

        member.change_team(&team_b);
        let merged = db.members().save(&mut uow, member).await.unwrap();
        assert_eq!(merged.created_date, created);

        uow.clear();
        let reloaded = db.members().find_by_id(&mut uow, merged.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(reloaded.team.id(), team_b.id);
    }
}
