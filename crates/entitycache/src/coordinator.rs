//! Cache coordinator
//!
//! Owns the shared caches and drives the write protocol at commit:
//!
//! 1. soft-lock the L2 entries of every updated or deleted entity (and of
//!    parents whose relation lists changed)
//! 2. commit the store transaction
//! 3. release the locks, which evicts the entries and stamps them with the
//!    commit timestamp so that older transactions cannot reload them
//! 4. bump the update timestamps of every mutated type
//!
//! A store failure releases the locks restoring the previous entries and
//! drops the in-flight timestamp markers without a bump.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rowstore::Id;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::driver::{DriverTransaction, PersistenceDriver};
use crate::entity::{DehydratedState, EntityKey};
use crate::entity_cache::EntityCache;
use crate::error::{Error, Result};
use crate::metadata::{EntityType, Metamodel};
use crate::query_cache::QueryCache;
use crate::region::{LockOutcome, LockToken, RegionKind, RegionStore};
use crate::session::Session;
use crate::stats::{RegionStatistics, Statistics};
use crate::timestamps::{Timestamp, Timestamper, UpdateTimestamps};

/// Region holding query results
pub const QUERY_RESULTS_REGION: &str = "default-query-results-region";

/// Region holding update timestamps
pub const UPDATE_TIMESTAMPS_REGION: &str = "default-update-timestamps-region";

/// Shared cache state and session factory
pub struct CacheCoordinator {
    settings: Settings,
    metamodel: Metamodel,
    driver: Arc<dyn PersistenceDriver>,
    regions: Arc<RegionStore>,
    entity_cache: EntityCache,
    timestamper: Arc<Timestamper>,
    timestamps: Option<Arc<UpdateTimestamps>>,
    query_cache: Option<QueryCache>,
    stats: Arc<Statistics>,
    next_session: AtomicU64,
}

impl CacheCoordinator {
    /// Validate settings and set up the regions
    pub fn new(settings: Settings, metamodel: Metamodel, driver: Arc<dyn PersistenceDriver>) -> Result<Arc<Self>> {
        settings.validate()?;

        let regions = Arc::new(RegionStore::new(&settings));
        let stats = Arc::new(Statistics::new());
        let timestamper = Arc::new(Timestamper::new());

        let (timestamps, query_cache) = if settings.use_query_cache {
            let region = regions
                .region(UPDATE_TIMESTAMPS_REGION, RegionKind::Timestamps)
                .map_err(|e| Error::Config(e.to_string()))?;
            let timestamps = Arc::new(UpdateTimestamps::new(region, timestamper.clone()));
            let region = regions
                .region(QUERY_RESULTS_REGION, RegionKind::Query)
                .map_err(|e| Error::Config(e.to_string()))?;
            let query_cache = QueryCache::new(region, timestamps.clone(), stats.clone());
            (Some(timestamps), Some(query_cache))
        } else {
            (None, None)
        };

        info!(
            second_level = settings.use_second_level_cache,
            query_cache = settings.use_query_cache,
            factory = regions.factory_name(),
            cached_types = metamodel.entities().filter(|t| t.is_cached()).count(),
            "cache coordinator ready"
        );

        Ok(Arc::new(Self {
            entity_cache: EntityCache::new(regions.clone(), stats.clone(), settings.soft_lock_timeout),
            settings,
            metamodel,
            driver,
            regions,
            timestamper,
            timestamps,
            query_cache,
            stats,
            next_session: AtomicU64::new(0),
        }))
    }

    /// Begin a unit of work
    pub fn open_session(self: &Arc<Self>) -> Result<Session> {
        let tx = self.driver.begin()?;
        let id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats.record_session();
        Ok(Session::new(id, self.clone(), tx))
    }

    /// Active settings
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Entity types
    pub fn metamodel(&self) -> &Metamodel {
        &self.metamodel
    }

    /// Coordinator-wide counters
    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    /// Region store
    pub fn regions(&self) -> &RegionStore {
        &self.regions
    }

    /// Counters of every region, ordered by name
    pub fn region_stats(&self) -> Vec<RegionStatistics> {
        self.regions
            .regions()
            .iter()
            .map(|region| RegionStatistics::of(region))
            .collect()
    }

    pub(crate) fn timestamper(&self) -> &Timestamper {
        &self.timestamper
    }

    pub(crate) fn query_cache(&self) -> Option<&QueryCache> {
        self.query_cache.as_ref()
    }

    fn caches(&self, entity_type: &EntityType) -> bool {
        self.settings.use_second_level_cache && entity_type.is_cached()
    }

    /// L2 state of an entity
    pub(crate) fn cached_state(&self, entity_type: &EntityType, id: Id) -> Option<Arc<DehydratedState>> {
        if !self.caches(entity_type) {
            return None;
        }
        self.entity_cache.get(entity_type, id)
    }

    /// Offer state read from the store by a session started at `since` to L2
    pub(crate) fn cache_loaded(&self, entity_type: &EntityType, id: Id, state: &DehydratedState, since: Timestamp) {
        if self.caches(entity_type) {
            self.entity_cache.put_from_load(entity_type, id, state, since);
        }
    }

    /// Mark flushed writes to `spaces` as in flight
    pub(crate) fn pre_invalidate(&self, spaces: &BTreeSet<String>) {
        if let Some(timestamps) = &self.timestamps {
            if let Err(e) = timestamps.pre_invalidate(spaces) {
                warn!(error = %e, "pre-invalidation failed");
                self.evict_query_regions();
            }
        }
    }

    /// Roll back the bookkeeping of an aborted unit of work
    pub(crate) fn abandon(&self, spaces: &BTreeSet<String>) {
        if let Some(timestamps) = &self.timestamps {
            if let Err(e) = timestamps.release(spaces) {
                warn!(error = %e, "releasing in-flight markers failed");
            }
        }
        self.stats.record_rollback();
    }

    /// Commit a flushed unit of work
    pub(crate) fn complete(
        &self,
        owner: u64,
        tx: Box<dyn DriverTransaction>,
        evictions: &BTreeSet<EntityKey>,
        spaces: &BTreeSet<String>,
    ) -> Result<()> {
        let mut locked: Vec<(Arc<EntityType>, LockToken)> = Vec::new();
        let mut unlocked: Vec<(Arc<EntityType>, Id)> = Vec::new();
        for key in evictions {
            let Ok(entity_type) = self.metamodel.entity(&key.entity) else {
                continue;
            };
            if !self.caches(entity_type) {
                continue;
            }
            match self.entity_cache.lock(entity_type, key.id, owner) {
                Ok(token) => locked.push((entity_type.clone(), token)),
                Err(e) => {
                    warn!(%key, error = %e, "soft lock failed");
                    unlocked.push((entity_type.clone(), key.id));
                }
            }
        }

        if let Err(e) = tx.commit() {
            for (entity_type, token) in locked {
                if let Err(e) = self.entity_cache.release(&entity_type, token, LockOutcome::Aborted) {
                    warn!(entity = entity_type.name(), error = %e, "soft lock release failed");
                }
            }
            self.abandon(spaces);
            return Err(e);
        }

        let committed_at = self.timestamper.next();
        for (entity_type, token) in locked {
            let outcome = LockOutcome::Committed(committed_at);
            if let Err(e) = self.entity_cache.release(&entity_type, token, outcome) {
                self.entity_cache.evict_conservatively(&entity_type, &e);
            }
        }
        for (entity_type, id) in unlocked {
            if let Err(e) = self.entity_cache.evict(&entity_type, id) {
                self.entity_cache.evict_conservatively(&entity_type, &e);
            }
        }

        if let Some(timestamps) = &self.timestamps {
            if !spaces.is_empty() {
                match timestamps.invalidate(spaces) {
                    Ok(ts) => debug!(?spaces, timestamp = ts, "update timestamps bumped"),
                    Err(e) => {
                        warn!(error = %e, "timestamp bump failed, evicting query cache");
                        self.evict_query_regions();
                    }
                }
            }
        }

        self.stats.record_commit();
        Ok(())
    }

    /// Whether L2 holds state for an entity
    pub fn contains_entity(&self, entity: &str, id: Id) -> Result<bool> {
        let entity_type = self.metamodel.entity(entity)?;
        Ok(self.caches(entity_type) && self.entity_cache.contains(entity_type, id))
    }

    /// Drop one entity from L2
    pub fn evict_entity(&self, entity: &str, id: Id) -> Result<()> {
        let entity_type = self.metamodel.entity(entity)?;
        if let Err(e) = self.entity_cache.evict(entity_type, id) {
            warn!(entity, id, error = %e, "eviction failed");
        }
        Ok(())
    }

    /// Drop every instance of a type from L2
    pub fn evict_entity_region(&self, entity: &str) -> Result<()> {
        let entity_type = self.metamodel.entity(entity)?;
        if let Err(e) = self.entity_cache.evict_region(entity_type) {
            warn!(entity, error = %e, "region eviction failed");
        }
        Ok(())
    }

    /// Drop every entity region
    pub fn evict_entity_regions(&self) {
        for entity_type in self.metamodel.entities().filter(|t| t.is_cached()) {
            if let Err(e) = self.entity_cache.evict_region(entity_type) {
                warn!(entity = entity_type.name(), error = %e, "region eviction failed");
            }
        }
    }

    /// Drop every query result and distrust results created before now
    pub fn evict_query_regions(&self) {
        if let Some(timestamps) = &self.timestamps {
            timestamps.raise_floor();
        }
        if let Some(query_cache) = &self.query_cache {
            query_cache.evict_all();
        }
    }

    /// Empty every region
    pub fn evict_all_regions(&self) {
        let result = match &self.timestamps {
            Some(timestamps) => timestamps.evict_all_with(|| self.regions.evict_all_regions()),
            None => self.regions.evict_all_regions(),
        };
        match result {
            Ok(n) => info!(entries = n, "all regions evicted"),
            Err(e) => warn!(error = %e, "evicting all regions failed"),
        }
    }
}
