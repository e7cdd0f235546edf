//! # Unit of Work
//!
//! One transaction plus the identity map of every entity it has seen.
//!
//! ## Identity Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  (entity, id) ──► Record                                               │
//! │                                                                         │
//! │  select rows       attached unless read-only; a cached instance wins   │
//! │                    over the fresh row (it may carry unflushed intent)  │
//! │  persist / merge   cache updated with the written state                │
//! │  remove            evicted                                             │
//! │  bulk statement    cleared (default) or left stale with a warning      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Dropping a unit of work without [`UnitOfWork::commit`] rolls the
//! transaction back.

use quarry_core::bulk::BulkOperationExecutor;
use quarry_core::derivation::BoundQuery;
use quarry_core::query::{QuerySpecification, Selection};
use quarry_core::{BulkUpdateResult, Entity, EntityRegistry, Predicate, Record, Reference, RelationState};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use crate::session::{PersistenceSession, ResultRow, SessionStats};

pub struct UnitOfWork {
    id: Uuid,
    session: Box<dyn PersistenceSession>,
    registry: Arc<EntityRegistry>,
    identity: HashMap<(String, i64), Record>,
}

impl UnitOfWork {
    pub fn new(session: Box<dyn PersistenceSession>, registry: Arc<EntityRegistry>) -> Self {
        let id = Uuid::new_v4();
        debug!(uow = %id, "Unit of work started");
        UnitOfWork {
            id,
            session,
            registry,
            identity: HashMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn stats(&self) -> SessionStats {
        self.session.stats()
    }

    /// Whether `entity#id` is held by the identity map.
    pub fn contains(&self, entity: &str, id: i64) -> bool {
        self.identity.contains_key(&(entity.to_string(), id))
    }

    /// Cached state of `entity#id`, without touching the store.
    pub fn cached(&self, entity: &str, id: i64) -> Option<&Record> {
        self.identity.get(&(entity.to_string(), id))
    }

    /// Detaches every entity. Later reads go back to the store.
    pub fn clear(&mut self) {
        debug!(uow = %self.id, evicted = self.identity.len(), "Identity map cleared");
        self.identity.clear();
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub async fn execute(&mut self, spec: &QuerySpecification) -> DbResult<Vec<ResultRow>> {
        let rows = self.session.execute(spec).await?;
        if spec.hints.read_only || spec.selection != Selection::Entity || spec.is_native() {
            return Ok(rows);
        }
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(match row {
                ResultRow::Entity(record) => ResultRow::Entity(self.attach(record)),
                columns => columns,
            });
        }
        Ok(out)
    }

    pub async fn execute_count(&mut self, spec: &QuerySpecification) -> DbResult<u64> {
        self.session.execute_count(spec).await
    }

    /// Runs a bulk update/delete and applies its cache policy.
    pub async fn execute_bulk(&mut self, bound: &BoundQuery) -> DbResult<BulkUpdateResult> {
        let entity = bound.spec.entity.clone();
        let affected = self.session.execute_mutation(&bound.spec).await?;

        let mut cached_ids: Vec<i64> = self
            .identity
            .keys()
            .filter(|(name, _)| *name == entity)
            .map(|(_, id)| *id)
            .collect();
        cached_ids.sort_unstable();

        if bound.modifying.clear_automatically {
            self.clear();
        }

        let result = BulkOperationExecutor::outcome(&entity, affected, bound.modifying, cached_ids);
        if let Some(stale) = &result.stale {
            warn!(uow = %self.id, entity = %stale.entity, cached = stale.cached_ids.len(), "{}", stale);
        }
        Ok(result)
    }

    /// Puts `record` (and every record joined into it) under identity
    /// management and returns the managed state.
    fn attach(&mut self, mut record: Record) -> Record {
        for state in record.relations.values_mut() {
            if let RelationState::Loaded(target) = state {
                let attached = self.attach(target.as_ref().clone());
                *target = Box::new(attached);
            }
        }

        let Some(id) = record.id else {
            return record;
        };
        match self.identity.get_mut(&(record.entity.clone(), id)) {
            Some(cached) => {
                // a join fetch can still initialize a lazy relation
                for (name, state) in record.relations {
                    let upgrade = matches!(state, RelationState::Loaded(_))
                        && !matches!(cached.relations.get(&name), Some(RelationState::Loaded(_)));
                    if upgrade {
                        cached.relations.insert(name, state);
                    }
                }
                cached.clone()
            }
            None => {
                self.identity.insert((record.entity.clone(), id), record.clone());
                record
            }
        }
    }

    // -------------------------------------------------------------------------
    // Single Entities
    // -------------------------------------------------------------------------

    pub async fn persist(&mut self, mut record: Record) -> DbResult<Record> {
        let id = self.session.persist(&record).await?;
        record.id = Some(id);
        self.identity.insert((record.entity.clone(), id), record.clone());
        Ok(record)
    }

    pub async fn merge(&mut self, record: Record) -> DbResult<Record> {
        self.session.merge(&record).await?;
        if let Some(id) = record.id {
            self.identity.insert((record.entity.clone(), id), record.clone());
        }
        Ok(record)
    }

    pub async fn remove(&mut self, entity: &str, id: i64) -> DbResult<()> {
        self.session.remove(entity, id).await?;
        self.identity.remove(&(entity.to_string(), id));
        Ok(())
    }

    /// Identity map first, then the store.
    pub async fn find(&mut self, entity: &str, id: i64) -> DbResult<Option<Record>> {
        if let Some(cached) = self.cached(entity, id) {
            return Ok(Some(cached.clone()));
        }
        match self.session.find_by_id(entity, id).await? {
            Some(record) => Ok(Some(self.attach(record))),
            None => Ok(None),
        }
    }

    /// Initializes a lazy reference. Costs a round trip only when the
    /// target is not already managed.
    pub async fn load_reference<T: Entity>(&mut self, reference: &Reference<T>) -> DbResult<Option<T>> {
        let id = match reference {
            Reference::None => return Ok(None),
            Reference::Loaded(target) => return Ok(Some(target.as_ref().clone())),
            Reference::Lazy(id) => *id,
        };
        let entity = &T::descriptor().name;
        if !self.contains(entity, id) {
            self.session.record_lazy_load();
        }
        let record = self
            .find(entity, id)
            .await?
            .ok_or_else(|| DbError::not_found(entity, format!("id = {}", id)))?;
        Ok(Some(T::from_record(&record)?))
    }

    /// Loads the to-many `relation` of `owner#owner_id`.
    pub async fn load_collection<T: Entity>(&mut self, owner: &str, owner_id: i64, relation: &str) -> DbResult<Vec<T>> {
        let descriptor = self.registry.require(owner)?;
        let mapped_by = descriptor
            .relation(relation)
            .and_then(|r| r.mapped_by.clone())
            .ok_or_else(|| DbError::Internal(format!("{}.{} is not a mapped collection", owner, relation)))?;
        let path = format!("{}.{}", mapped_by, descriptor.id.name);
        let spec = QuerySpecification::select(&T::descriptor().name).with_predicate(Predicate::eq(&path, owner_id));

        self.session.record_lazy_load();
        let rows = self.execute(&spec).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let ResultRow::Entity(record) = row {
                out.push(T::from_record(&record)?);
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Completion
    // -------------------------------------------------------------------------

    pub async fn commit(self) -> DbResult<()> {
        let stats = self.session.stats();
        self.session.commit().await?;
        debug!(uow = %self.id, round_trips = stats.round_trips, "Unit of work committed");
        Ok(())
    }

    pub async fn rollback(self) -> DbResult<()> {
        self.session.rollback().await?;
        debug!(uow = %self.id, "Unit of work rolled back");
        Ok(())
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("managed", &self.identity.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use quarry_core::{Member, Team};

    async fn database() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn test_persist_and_find_uses_identity_map() {
        let db = database().await;
        let mut uow = db.begin().await.unwrap();

        let saved = uow.persist(Team::new("teamA").to_record().unwrap()).await.unwrap();
        let id = saved.id.unwrap();
        let before = uow.stats().round_trips;

        let found = uow.find("Team", id).await.unwrap().unwrap();
        assert_eq!(found.text("name").unwrap(), "teamA");
        assert_eq!(uow.stats().round_trips, before);

        uow.clear();
        assert!(uow.find("Team", id).await.unwrap().is_some());
        assert_eq!(uow.stats().round_trips, before + 1);
        uow.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_lazy_reference_and_collection() {
        let db = database().await;
        let mut uow = db.begin().await.unwrap();

        let team = uow.persist(Team::new("teamA").to_record().unwrap()).await.unwrap();
        let team = Team::from_record(&team).unwrap();
        for name in ["member1", "member2"] {
            uow.persist(Member::with_team(name, 10, &team).to_record().unwrap())
                .await
                .unwrap();
        }
        uow.clear();

        let rows = uow
            .execute(&QuerySpecification::select("Member").with_predicate(Predicate::eq("username", "member1")))
            .await
            .unwrap();
        let ResultRow::Entity(record) = &rows[0] else {
            panic!("expected entity row");
        };
        let member = Member::from_record(record).unwrap();
        assert!(!member.team.is_loaded());

        let loaded = uow.load_reference(&member.team).await.unwrap().unwrap();
        assert_eq!(loaded.name, "teamA");
        assert_eq!(uow.stats().lazy_loads, 1);

        // second access hits the identity map
        uow.load_reference(&member.team).await.unwrap();
        assert_eq!(uow.stats().lazy_loads, 1);

        let members: Vec<Member> = uow.load_collection("Team", team.id.unwrap(), "members").await.unwrap();
        assert_eq!(members.len(), 2);
        uow.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_evicts() {
        let db = database().await;
        let mut uow = db.begin().await.unwrap();
        let team = uow.persist(Team::new("teamA").to_record().unwrap()).await.unwrap();
        let id = team.id.unwrap();

        uow.remove("Team", id).await.unwrap();
        assert!(!uow.contains("Team", id));
        assert!(uow.find("Team", id).await.unwrap().is_none());
        assert!(matches!(uow.remove("Team", id).await, Err(DbError::NotFound { .. })));
    }
}
