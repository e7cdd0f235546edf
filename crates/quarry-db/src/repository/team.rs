//! Repository for teams.

use quarry_core::{Arguments, EntityRegistry, Member, MethodContract, Modifying, ReturnShape, Sort, Team};
use std::sync::Arc;

use super::Repository;
use crate::error::DbResult;
use crate::unit_of_work::UnitOfWork;

#[derive(Debug)]
pub struct TeamRepository {
    repo: Repository<Team>,
}

impl TeamRepository {
    pub fn new(registry: Arc<EntityRegistry>, policy: Modifying) -> DbResult<Self> {
        let repo = Repository::builder(registry, policy)
            .method(
                MethodContract::new("findByName")
                    .text("name")
                    .returns(ReturnShape::Optional),
            )
            .method(MethodContract::new("findByNameContaining").text("name").sort())
            .build()?;
        Ok(TeamRepository { repo })
    }

    pub fn repository(&self) -> &Repository<Team> {
        &self.repo
    }

    pub async fn save(&self, uow: &mut UnitOfWork, team: Team) -> DbResult<Team> {
        self.repo.save(uow, team).await
    }

    pub async fn find_by_id(&self, uow: &mut UnitOfWork, id: i64) -> DbResult<Option<Team>> {
        self.repo.find_by_id(uow, id).await
    }

    pub async fn find_all(&self, uow: &mut UnitOfWork) -> DbResult<Vec<Team>> {
        self.repo.find_all(uow).await
    }

    pub async fn delete(&self, uow: &mut UnitOfWork, team: &Team) -> DbResult<()> {
        self.repo.delete(uow, team).await
    }

    pub async fn find_by_name(&self, uow: &mut UnitOfWork, name: &str) -> DbResult<Option<Team>> {
        self.repo
            .optional(uow, "findByName", Arguments::new().value(name))
            .await
    }

    pub async fn find_by_name_containing(&self, uow: &mut UnitOfWork, fragment: &str, sort: Sort) -> DbResult<Vec<Team>> {
        self.repo
            .list(uow, "findByNameContaining", Arguments::new().value(fragment).sort(sort))
            .await
    }

    /// Lazily loads the members of `team`. Costs one round trip.
    pub async fn members_of(&self, uow: &mut UnitOfWork, team: &Team) -> DbResult<Vec<Member>> {
        match team.id {
            Some(id) => uow.load_collection::<Member>("Team", id, "members").await,
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn test_team_finders() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut uow = db.begin().await.unwrap();
        for name in ["teamB", "teamA", "other"] {
            db.teams().save(&mut uow, Team::new(name)).await.unwrap();
        }

        let found = db.teams().find_by_name(&mut uow, "teamA").await.unwrap().unwrap();
        assert!(found.id.is_some());
        assert!(db.teams().find_by_name(&mut uow, "nope").await.unwrap().is_none());

        let teams = db
            .teams()
            .find_by_name_containing(&mut uow, "team", Sort::by(&["name"]))
            .await
            .unwrap();
        let names: Vec<&str> = teams.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["teamA", "teamB"]);
        assert_eq!(db.teams().find_all(&mut uow).await.unwrap().len(), 3);

        assert!(matches!(
            db.teams()
                .find_by_name_containing(&mut uow, "team", Sort::by(&["colour"]))
                .await,
            Err(DbError::Core(_))
        ));
    }

    #[tokio::test]
    async fn test_members_of_team() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut uow = db.begin().await.unwrap();
        let team = db.teams().save(&mut uow, Team::new("teamA")).await.unwrap();
        for name in ["m1", "m2"] {
            db.members()
                .save(&mut uow, Member::with_team(name, 10, &team))
                .await
                .unwrap();
        }
        db.members().save(&mut uow, Member::new("loner", 30)).await.unwrap();

        let before = uow.stats();
        let members = db.teams().members_of(&mut uow, &team).await.unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(uow.stats().lazy_loads, before.lazy_loads + 1);

        assert!(db.teams().members_of(&mut uow, &Team::new("unsaved")).await.unwrap().is_empty());
    }
}
