//! Session: identity map and unit of work
//!
//! A session owns one store transaction. Reads go through the identity map
//! first, then the entity cache, then the store. Writes are buffered in the
//! identity map until flush; the coordinator publishes cache evictions and
//! timestamp bumps when the session commits. Store reads and query results
//! reach the shared caches only after a successful commit.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use ahash::RandomState;
use rowstore::{Id, IdGeneration, Value};
use tracing::{debug, warn};

use crate::coordinator::CacheCoordinator;
use crate::driver::DriverTransaction;
use crate::entity::{DehydratedState, EntityHandle, EntityKey, EntityState};
use crate::error::{Error, Result};
use crate::metadata::EntityType;
use crate::query::Query;
use crate::query_cache::{QueryKey, QueryResultEntry};
use crate::timestamps::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    /// Persisted, not yet written
    PendingInsert,
    /// In sync with the store as of the last flush
    Loaded,
    /// Removed, not yet written
    PendingDelete,
    /// Delete written
    Deleted,
}

struct ManagedEntry {
    handle: EntityHandle,
    /// Values as last read from or written to the store
    snapshot: Option<Vec<Value>>,
    status: EntryStatus,
}

enum Action {
    Insert(EntityKey, Vec<Value>),
    Update(EntityKey, Vec<Value>, Vec<Value>),
    Delete(EntityKey, Vec<Value>),
}

/// A unit of work
///
/// Dropping a session that was neither committed nor rolled back rolls it
/// back.
pub struct Session {
    id: u64,
    /// Taken before the first read; loads are offered to L2 as of this time
    started: Timestamp,
    coordinator: Arc<CacheCoordinator>,
    tx: Option<Box<dyn DriverTransaction>>,
    entries: HashMap<EntityKey, ManagedEntry, RandomState>,
    order: Vec<EntityKey>,
    inserts: Vec<EntityKey>,
    deletes: Vec<EntityKey>,
    /// L2 keys to evict at commit
    evictions: BTreeSet<EntityKey>,
    /// Types pre-invalidated in the update timestamps
    spaces: BTreeSet<String>,
    /// Store reads offered to L2 at commit
    loaded: Vec<(Arc<EntityType>, Id, DehydratedState)>,
    /// Query results offered to the query cache at commit
    results: Vec<PendingResult>,
}

struct PendingResult {
    key: QueryKey,
    created: Timestamp,
    roots: Vec<EntityKey>,
    fetched: Vec<EntityKey>,
}

impl Session {
    pub(crate) fn new(id: u64, coordinator: Arc<CacheCoordinator>, tx: Box<dyn DriverTransaction>) -> Self {
        let started = coordinator.timestamper().next();
        debug!(session = id, started, "session opened");
        Self {
            id,
            started,
            coordinator,
            tx: Some(tx),
            entries: HashMap::with_hasher(RandomState::new()),
            order: Vec::new(),
            inserts: Vec::new(),
            deletes: Vec::new(),
            evictions: BTreeSet::new(),
            spaces: BTreeSet::new(),
            loaded: Vec::new(),
            results: Vec::new(),
        }
    }

    /// Session number, unique per coordinator
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the unit of work can still be used
    pub fn is_open(&self) -> bool {
        self.tx.is_some()
    }

    /// Owning coordinator
    pub fn coordinator(&self) -> &Arc<CacheCoordinator> {
        &self.coordinator
    }

    fn ensure_open(&self) -> Result<()> {
        if self.tx.is_none() {
            return Err(Error::SessionClosed);
        }
        Ok(())
    }

    fn tx(&self) -> Result<&dyn DriverTransaction> {
        self.tx.as_deref().ok_or(Error::SessionClosed)
    }

    fn entity_type(&self, entity: &str) -> Result<Arc<EntityType>> {
        Ok(self.coordinator.metamodel().entity(entity)?.clone())
    }

    /// A new transient instance
    pub fn instantiate(&self, entity: &str) -> Result<EntityHandle> {
        Ok(EntityHandle::transient(self.entity_type(entity)?))
    }

    /// Find an entity; `None` if it does not exist
    pub fn get(&mut self, entity: &str, id: Id) -> Result<Option<EntityHandle>> {
        self.ensure_open()?;
        let entity_type = self.entity_type(entity)?;
        self.get_by_type(&entity_type, id)
    }

    /// Find an entity that must exist
    pub fn load(&mut self, entity: &str, id: Id) -> Result<EntityHandle> {
        self.get(entity, id)?
            .ok_or_else(|| Error::NotFound(EntityKey::new(entity, id)))
    }

    fn get_by_type(&mut self, entity_type: &Arc<EntityType>, id: Id) -> Result<Option<EntityHandle>> {
        let key = EntityKey::new(entity_type.name(), id);
        if let Some(entry) = self.entries.get(&key) {
            debug!(session = self.id, %key, "first-level cache hit");
            return Ok(match entry.status {
                EntryStatus::PendingDelete | EntryStatus::Deleted => None,
                _ => Some(entry.handle.clone()),
            });
        }

        if let Some(state) = self.coordinator.cached_state(entity_type, id) {
            return Ok(Some(self.hydrate(entity_type, id, (*state).clone())));
        }

        let state = self.tx()?.fetch_by_id(entity_type, id)?;
        self.coordinator.statistics().record_entity_fetch();
        match state {
            Some(state) => {
                self.loaded.push((entity_type.clone(), id, state.clone()));
                Ok(Some(self.hydrate(entity_type, id, state)))
            }
            None => Ok(None),
        }
    }

    fn hydrate(&mut self, entity_type: &Arc<EntityType>, id: Id, state: DehydratedState) -> EntityHandle {
        let key = EntityKey::new(entity_type.name(), id);
        let snapshot = state.values.clone();
        let handle = EntityHandle::managed(entity_type.clone(), id, state);
        self.sync_unflushed_children(entity_type, &handle, id);

        self.entries.insert(
            key.clone(),
            ManagedEntry {
                handle: handle.clone(),
                snapshot: Some(snapshot),
                status: EntryStatus::Loaded,
            },
        );
        self.order.push(key);
        handle
    }

    /// Reflect unflushed inserts and deletes of children in a freshly
    /// loaded parent
    fn sync_unflushed_children(&self, entity_type: &EntityType, parent: &EntityHandle, id: Id) {
        for (relation_idx, relation) in entity_type.table().relations().iter().enumerate() {
            let pending = self
                .inserts
                .iter()
                .map(|key| (key, true))
                .chain(self.deletes.iter().map(|key| (key, false)))
                .filter(|(key, _)| key.entity == relation.table);
            for (key, added) in pending {
                let Some(child) = self.entries.get(key) else {
                    continue;
                };
                if child.handle.get(&relation.column).ok().and_then(|v| v.as_id()) != Some(id) {
                    continue;
                }
                if added {
                    parent.add_related(relation_idx, key.id);
                } else {
                    parent.remove_related(relation_idx, key.id);
                }
            }
        }
    }

    /// Keep in-memory inverse relations of managed parents in step with a
    /// child's reference columns
    fn link_to_parents(&self, entity_type: &EntityType, values: &[Value], id: Id, added: bool) {
        for (column, value) in entity_type.table().columns().iter().zip(values) {
            let (Some(target), Some(parent_id)) = (column.target(), value.as_id()) else {
                continue;
            };
            let Some(parent) = self.entries.get(&EntityKey::new(target, parent_id)) else {
                continue;
            };
            let parent_type = parent.handle.entity_type();
            for (relation_idx, relation) in parent_type.table().relations().iter().enumerate() {
                if relation.table != entity_type.name() || relation.column != column.name {
                    continue;
                }
                if added {
                    parent.handle.add_related(relation_idx, id);
                } else {
                    parent.handle.remove_related(relation_idx, id);
                }
            }
        }
    }

    fn managed_key(&self, handle: &EntityHandle) -> Result<EntityKey> {
        handle
            .key()
            .filter(|key| {
                self.entries
                    .get(key)
                    .map_or(false, |entry| entry.handle.same_instance(handle))
            })
            .ok_or_else(|| Error::NotManaged(format!("{:?}", handle)))
    }

    /// Make a transient instance persistent
    ///
    /// Generated identifiers are drawn immediately; the row is written at
    /// the next flush.
    pub fn persist(&mut self, handle: &EntityHandle) -> Result<EntityKey> {
        self.ensure_open()?;
        match handle.state() {
            EntityState::Transient => {}
            EntityState::Managed => return self.managed_key(handle),
            _ => return Err(Error::NotManaged(format!("{:?}", handle))),
        }

        let entity_type = handle.entity_type();
        let id = match entity_type.table().id_strategy() {
            IdGeneration::Assigned => handle.id().ok_or_else(|| {
                Error::MissingId(format!("{} uses assigned identifiers", entity_type.name()))
            })?,
            IdGeneration::Sequence => match handle.id() {
                Some(id) => {
                    return Err(Error::NotManaged(format!(
                        "{} already has id {}",
                        entity_type.name(),
                        id
                    )))
                }
                None => self.tx()?.next_id(),
            },
            IdGeneration::Shared { column } => {
                handle.reference(column)?.map(|key| key.id).ok_or_else(|| {
                    Error::MissingId(format!(
                        "{}.{} must reference a persistent entity",
                        entity_type.name(),
                        column
                    ))
                })?
            }
        };

        let key = EntityKey::new(entity_type.name(), id);
        if self.entries.contains_key(&key) {
            return Err(Error::DuplicateInstance(key));
        }

        handle.assign(id, EntityState::Managed);
        self.entries.insert(
            key.clone(),
            ManagedEntry {
                handle: handle.clone(),
                snapshot: None,
                status: EntryStatus::PendingInsert,
            },
        );
        self.order.push(key.clone());
        self.inserts.push(key.clone());
        self.link_to_parents(&entity_type, &handle.values(), id, true);
        debug!(session = self.id, %key, "persisted");
        Ok(key)
    }

    /// Schedule a managed instance for deletion
    pub fn remove(&mut self, handle: &EntityHandle) -> Result<()> {
        self.ensure_open()?;
        let key = self.managed_key(handle)?;
        let entity_type = handle.entity_type();

        let status = self.entries.get(&key).map(|entry| entry.status);
        match status {
            Some(EntryStatus::PendingInsert) => {
                self.entries.remove(&key);
                self.order.retain(|k| *k != key);
                self.inserts.retain(|k| *k != key);
            }
            Some(EntryStatus::Loaded) => {
                if let Some(entry) = self.entries.get_mut(&key) {
                    entry.status = EntryStatus::PendingDelete;
                }
                self.deletes.push(key.clone());
            }
            _ => return Ok(()),
        }

        handle.set_state(EntityState::Removed);
        self.link_to_parents(&entity_type, &handle.values(), key.id, false);
        debug!(session = self.id, %key, "removed");
        Ok(())
    }

    /// Entities on the inverse side of a relation
    pub fn relation(&mut self, handle: &EntityHandle, relation: &str) -> Result<Vec<EntityHandle>> {
        self.ensure_open()?;
        let entity_type = handle.entity_type();
        let target = entity_type
            .table()
            .relation_index(relation)
            .map(|idx| entity_type.table().relations()[idx].table.clone())
            .ok_or_else(|| Error::UnknownAttribute {
                entity: entity_type.name().to_string(),
                attribute: relation.to_string(),
            })?;
        let target = self.entity_type(&target)?;

        let mut related = Vec::new();
        for id in handle.relation_ids(relation)? {
            if let Some(child) = self.get_by_type(&target, id)? {
                related.push(child);
            }
        }
        Ok(related)
    }

    /// Entity a reference column points at
    pub fn reference(&mut self, handle: &EntityHandle, column: &str) -> Result<Option<EntityHandle>> {
        self.ensure_open()?;
        match handle.reference(column)? {
            Some(key) => {
                let target = self.entity_type(&key.entity)?;
                self.get_by_type(&target, key.id)
            }
            None => Ok(None),
        }
    }

    /// Whether this exact instance is managed by the session
    pub fn contains(&self, handle: &EntityHandle) -> bool {
        self.managed_key(handle).is_ok()
    }

    /// Whether a flush would write anything
    pub fn is_dirty(&self) -> bool {
        !self.inserts.is_empty()
            || !self.deletes.is_empty()
            || self.entries.values().any(is_modified)
    }

    fn has_pending_changes(&self, spaces: &BTreeSet<String>) -> bool {
        self.inserts
            .iter()
            .chain(self.deletes.iter())
            .any(|key| spaces.contains(&key.entity))
            || self
                .entries
                .iter()
                .any(|(key, entry)| spaces.contains(&key.entity) && is_modified(entry))
    }

    /// Start building a query
    pub fn create_query(&mut self, text: &str) -> Query<'_> {
        Query::new(self, text)
    }

    /// Write buffered changes to the store transaction
    ///
    /// Inserts go first in persist order, then updates, then deletes. A
    /// store failure rolls the session back.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        match self.write_pending() {
            Ok(touched) => {
                let fresh: BTreeSet<String> = touched.difference(&self.spaces).cloned().collect();
                if !fresh.is_empty() {
                    self.coordinator.pre_invalidate(&fresh);
                    self.spaces.extend(fresh);
                }
                Ok(())
            }
            Err(e) => {
                warn!(session = self.id, error = %e, "flush failed, rolling back");
                self.abort();
                Err(e)
            }
        }
    }

    fn pending_actions(&self) -> Vec<Action> {
        let mut actions = Vec::new();
        for key in &self.inserts {
            if let Some(entry) = self.entries.get(key) {
                actions.push(Action::Insert(key.clone(), entry.handle.values()));
            }
        }
        for key in &self.order {
            if let Some(entry) = self.entries.get(key) {
                if let (EntryStatus::Loaded, Some(snapshot)) = (entry.status, &entry.snapshot) {
                    let values = entry.handle.values();
                    if values != *snapshot {
                        actions.push(Action::Update(key.clone(), values, snapshot.clone()));
                    }
                }
            }
        }
        for key in &self.deletes {
            if let Some(ManagedEntry {
                snapshot: Some(snapshot),
                ..
            }) = self.entries.get(key)
            {
                actions.push(Action::Delete(key.clone(), snapshot.clone()));
            }
        }
        actions
    }

    fn write_pending(&mut self) -> Result<BTreeSet<String>> {
        let actions = self.pending_actions();
        if actions.is_empty() {
            return Ok(BTreeSet::new());
        }

        let coordinator = self.coordinator.clone();
        let metamodel = coordinator.metamodel();
        let tx = self.tx.as_deref_mut().ok_or(Error::SessionClosed)?;
        for action in &actions {
            match action {
                Action::Insert(key, values) => {
                    tx.insert(metamodel.entity(&key.entity)?, key.id, values.clone())?
                }
                Action::Update(key, values, _) => {
                    tx.update(metamodel.entity(&key.entity)?, key.id, values.clone())?
                }
                Action::Delete(key, _) => tx.delete(metamodel.entity(&key.entity)?, key.id)?,
            }
        }

        let mut touched = BTreeSet::new();
        for action in actions {
            match action {
                Action::Insert(key, values) => {
                    self.note_parents(&key, &values, None);
                    if let Some(entry) = self.entries.get_mut(&key) {
                        entry.status = EntryStatus::Loaded;
                        entry.snapshot = Some(values);
                    }
                    debug!(session = self.id, %key, "insert flushed");
                    touched.insert(key.entity);
                }
                Action::Update(key, values, old) => {
                    self.note_parents(&key, &values, Some(&old));
                    if let Some(entry) = self.entries.get_mut(&key) {
                        entry.snapshot = Some(values);
                    }
                    debug!(session = self.id, %key, "update flushed");
                    touched.insert(key.entity.clone());
                    self.evictions.insert(key);
                }
                Action::Delete(key, old) => {
                    self.note_parents(&key, &old, None);
                    if let Some(entry) = self.entries.get_mut(&key) {
                        entry.status = EntryStatus::Deleted;
                    }
                    debug!(session = self.id, %key, "delete flushed");
                    touched.insert(key.entity.clone());
                    self.evictions.insert(key);
                }
            }
        }
        self.inserts.clear();
        self.deletes.clear();
        coordinator.statistics().record_flush();
        Ok(touched)
    }

    /// Parents whose cached relation lists change with this write
    fn note_parents(&mut self, key: &EntityKey, values: &[Value], old: Option<&[Value]>) {
        let Ok(entity_type) = self.coordinator.metamodel().entity(&key.entity) else {
            return;
        };
        let table = entity_type.table().clone();
        for (idx, column) in table.columns().iter().enumerate() {
            let Some(target) = column.target() else {
                continue;
            };
            let mut ids = vec![values[idx].as_id()];
            if let Some(old) = old {
                if old[idx] == values[idx] {
                    continue;
                }
                ids.push(old[idx].as_id());
            }
            for parent_id in ids.into_iter().flatten() {
                self.evictions.insert(EntityKey::new(target, parent_id));
            }
        }
    }

    /// Run a query through the query cache when allowed
    pub(crate) fn execute_query(
        &mut self,
        text: &str,
        parameters: &[(String, Value)],
        cacheable: bool,
    ) -> Result<Vec<EntityHandle>> {
        self.ensure_open()?;
        let coordinator = self.coordinator.clone();
        let query = rowstore::Query::parse(text)?;
        let spaces = query.plan(coordinator.metamodel().schema())?.spaces();
        let bound = query
            .parameters()
            .into_iter()
            .map(|name| {
                parameters
                    .iter()
                    .find(|(n, _)| n == name)
                    .cloned()
                    .ok_or_else(|| {
                        Error::Store(rowstore::Error::Query(format!("parameter :{} is not bound", name)))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        if self.has_pending_changes(&spaces) {
            debug!(session = self.id, "auto-flush before query");
            self.flush()?;
        }

        let cache = match coordinator.query_cache() {
            Some(cache) if cacheable => cache,
            _ => return Ok(self.run_query(text, &bound)?.0),
        };

        // Own uncommitted writes must not be hidden by, or leak into, the cache
        let in_flight = !self.spaces.is_disjoint(&spaces);
        let key = QueryKey::new(text, bound.clone(), spaces);
        if !in_flight {
            if let Some(entry) = cache.lookup(&key) {
                if let Some(handles) = self.assemble(&entry)? {
                    return Ok(handles);
                }
                debug!(session = self.id, query = key.text(), "cached result references evicted entities");
            }
        }

        let created = coordinator.timestamper().next();
        let (handles, roots, fetched) = self.run_query(text, &bound)?;
        if !in_flight {
            self.results.push(PendingResult {
                key,
                created,
                roots,
                fetched,
            });
        }
        Ok(handles)
    }

    fn run_query(
        &mut self,
        text: &str,
        parameters: &[(String, Value)],
    ) -> Result<(Vec<EntityHandle>, Vec<EntityKey>, Vec<EntityKey>)> {
        let rows = self.tx()?.execute_query(text, parameters)?;
        self.coordinator.statistics().record_query_execution();

        let mut fetched = Vec::with_capacity(rows.fetched.len());
        for (key, state) in rows.fetched {
            self.register_loaded(&key, state)?;
            fetched.push(key);
        }
        let mut handles = Vec::with_capacity(rows.roots.len());
        let mut roots = Vec::with_capacity(rows.roots.len());
        for (key, state) in rows.roots {
            handles.push(self.register_loaded(&key, state)?);
            roots.push(key);
        }
        Ok((handles, roots, fetched))
    }

    /// Identity-map a row returned by a query; the managed instance wins
    fn register_loaded(&mut self, key: &EntityKey, state: DehydratedState) -> Result<EntityHandle> {
        if let Some(entry) = self.entries.get(key) {
            return Ok(entry.handle.clone());
        }
        let entity_type = self.entity_type(&key.entity)?;
        self.loaded.push((entity_type.clone(), key.id, state.clone()));
        Ok(self.hydrate(&entity_type, key.id, state))
    }

    /// Rebuild a cached result from the identity map and the entity cache
    ///
    /// `None` if any referenced entity is unavailable.
    fn assemble(&mut self, entry: &QueryResultEntry) -> Result<Option<Vec<EntityHandle>>> {
        for key in &entry.fetched {
            if self.resolve_cached(key)?.is_none() {
                return Ok(None);
            }
        }
        let mut handles = Vec::with_capacity(entry.roots.len());
        for key in &entry.roots {
            match self.resolve_cached(key)? {
                Some(handle) => handles.push(handle),
                None => return Ok(None),
            }
        }
        Ok(Some(handles))
    }

    fn resolve_cached(&mut self, key: &EntityKey) -> Result<Option<EntityHandle>> {
        if let Some(entry) = self.entries.get(key) {
            return Ok(match entry.status {
                EntryStatus::PendingDelete | EntryStatus::Deleted => None,
                _ => Some(entry.handle.clone()),
            });
        }
        let entity_type = self.entity_type(&key.entity)?;
        Ok(self
            .coordinator
            .cached_state(&entity_type, key.id)
            .map(|state| self.hydrate(&entity_type, key.id, (*state).clone())))
    }

    /// Flush and commit the unit of work
    pub fn commit(mut self) -> Result<()> {
        self.flush()?;
        let tx = self.tx.take().ok_or(Error::SessionClosed)?;
        let evictions = std::mem::take(&mut self.evictions);
        let spaces = std::mem::take(&mut self.spaces);
        let result = self.coordinator.complete(self.id, tx, &evictions, &spaces);
        debug!(session = self.id, ok = result.is_ok(), "session committed");
        if result.is_ok() {
            self.publish(&evictions);
        }
        self.detach_all();
        result
    }

    /// Offer the reads of a committed unit of work to the shared caches
    ///
    /// Keys written by this unit of work are skipped; the rest still go
    /// through the invalidation check against the session start.
    fn publish(&mut self, evictions: &BTreeSet<EntityKey>) {
        for (entity_type, id, state) in std::mem::take(&mut self.loaded) {
            if !evictions.contains(&EntityKey::new(entity_type.name(), id)) {
                self.coordinator.cache_loaded(&entity_type, id, &state, self.started);
            }
        }
        let results = std::mem::take(&mut self.results);
        if let Some(cache) = self.coordinator.query_cache() {
            for result in results {
                cache.store(result.key, result.created, result.roots, result.fetched);
            }
        }
    }

    /// Discard the unit of work
    pub fn rollback(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(tx) = self.tx.take() {
            tx.rollback();
            let spaces = std::mem::take(&mut self.spaces);
            self.coordinator.abandon(&spaces);
            debug!(session = self.id, "session rolled back");
        }
        self.evictions.clear();
        self.loaded.clear();
        self.results.clear();
        self.detach_all();
    }

    fn detach_all(&mut self) {
        for entry in self.entries.values() {
            if entry.handle.state() == EntityState::Managed {
                entry.handle.set_state(EntityState::Detached);
            }
        }
        self.entries.clear();
        self.order.clear();
        self.inserts.clear();
        self.deletes.clear();
    }
}

fn is_modified(entry: &ManagedEntry) -> bool {
    match (&entry.status, &entry.snapshot) {
        (EntryStatus::Loaded, Some(snapshot)) => entry.handle.values() != *snapshot,
        _ => false,
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.abort();
        }
    }
}
