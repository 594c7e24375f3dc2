//! Entity (L2) cache
//!
//! One region per cached entity type holding [`DehydratedState`] keyed by
//! [`EntityKey`]. Under the nonstrict-read-write strategy entries are only
//! written after a store read; updates and deletes evict them.

use std::sync::Arc;
use std::time::Duration;

use rowstore::Id;
use tracing::{debug, error, info, warn};

use crate::entity::{DehydratedState, EntityKey};
use crate::error::CacheError;
use crate::metadata::{CacheConcurrencyStrategy, EntityType};
use crate::region::{
    CacheValue, LockMode, LockOutcome, LockToken, Region, RegionKey, RegionKind, RegionStore, Slot,
};
use crate::stats::Statistics;
use crate::timestamps::Timestamp;

/// Entity state cache
pub struct EntityCache {
    regions: Arc<RegionStore>,
    stats: Arc<Statistics>,
    lock_timeout: Duration,
}

impl EntityCache {
    /// Cache entity state in `regions`
    pub fn new(regions: Arc<RegionStore>, stats: Arc<Statistics>, lock_timeout: Duration) -> Self {
        Self {
            regions,
            stats,
            lock_timeout,
        }
    }

    fn region(&self, entity_type: &EntityType) -> Result<Arc<Region>, CacheError> {
        self.regions.region(entity_type.region_name(), RegionKind::Entity)
    }

    fn key(entity_type: &EntityType, id: Id) -> RegionKey {
        RegionKey::Entity(EntityKey::new(entity_type.name(), id))
    }

    /// Cached state; failures and inconsistent entries read as a miss
    pub fn get(&self, entity_type: &EntityType, id: Id) -> Option<Arc<DehydratedState>> {
        let result = self
            .region(entity_type)
            .and_then(|region| region.get(&Self::key(entity_type, id)))
            .and_then(|value| match value {
                Some(CacheValue::Entity(state)) => {
                    check_shape(entity_type, &state)?;
                    Ok(Some(state))
                }
                Some(_) => Err(CacheError::InvariantViolation {
                    region: entity_type.region_name().to_string(),
                    reason: "entry is not entity state".to_string(),
                }),
                None => Ok(None),
            });

        match result {
            Ok(Some(state)) => {
                debug!(entity = entity_type.name(), id, "second-level cache hit");
                self.stats.second_level().record_hit();
                Some(state)
            }
            Ok(None) => {
                debug!(entity = entity_type.name(), id, "second-level cache miss");
                self.stats.second_level().record_miss();
                None
            }
            Err(e) => {
                self.stats.second_level().record_miss();
                self.handle_failure(entity_type, &e);
                None
            }
        }
    }

    /// Cache state read by a transaction started at `since`, unless the key
    /// is present, locked or invalidated by a newer commit
    pub fn put_from_load(&self, entity_type: &EntityType, id: Id, state: &DehydratedState, since: Timestamp) -> bool {
        match entity_type.cache_strategy() {
            Some(CacheConcurrencyStrategy::NonstrictReadWrite) => {}
            None => return false,
        }
        let result = self.region(entity_type).and_then(|region| {
            region.put_from_load(
                Self::key(entity_type, id),
                CacheValue::Entity(Arc::new(state.clone())),
                since,
            )
        });
        match result {
            Ok(stored) => {
                if stored {
                    self.stats.second_level().record_insert();
                }
                stored
            }
            Err(e) => {
                self.handle_failure(entity_type, &e);
                false
            }
        }
    }

    /// Soft-lock a key ahead of a store write
    pub fn lock(&self, entity_type: &EntityType, id: Id, owner: u64) -> Result<LockToken, CacheError> {
        self.region(entity_type)?
            .lock(Self::key(entity_type, id), owner, LockMode::Stackable, self.lock_timeout)
    }

    /// Release a lock after the store write finished
    pub fn release(&self, entity_type: &EntityType, token: LockToken, outcome: LockOutcome) -> Result<(), CacheError> {
        self.region(entity_type)?.release(token, outcome)
    }

    /// Remove one entry
    pub fn evict(&self, entity_type: &EntityType, id: Id) -> Result<bool, CacheError> {
        match self.regions.existing(entity_type.region_name()) {
            Some(region) => region.evict(&Self::key(entity_type, id)),
            None => Ok(false),
        }
    }

    /// Empty the region of a type
    pub fn evict_region(&self, entity_type: &EntityType) -> Result<usize, CacheError> {
        self.regions.evict_all(entity_type.region_name())
    }

    /// Whether a live entry exists, without touching statistics
    pub fn contains(&self, entity_type: &EntityType, id: Id) -> bool {
        self.regions
            .existing(entity_type.region_name())
            .and_then(|region| region.peek(&Self::key(entity_type, id)).ok().flatten())
            .map_or(false, |slot| matches!(slot, Slot::Value { .. }))
    }

    /// Log a failure and evict the region if its content cannot be trusted
    pub(crate) fn handle_failure(&self, entity_type: &EntityType, e: &CacheError) {
        match e {
            CacheError::InvariantViolation { .. } => {
                error!(entity = entity_type.name(), error = %e, "evicting inconsistent region");
                if let Err(e) = self.evict_region(entity_type) {
                    warn!(entity = entity_type.name(), error = %e, "region eviction failed");
                }
            }
            _ => warn!(entity = entity_type.name(), error = %e, "second-level cache degraded"),
        }
    }

    /// Evict a whole region after a failed post-commit mutation
    pub(crate) fn evict_conservatively(&self, entity_type: &EntityType, e: &CacheError) {
        info!(entity = entity_type.name(), error = %e, "evicting region after failed cache update");
        if let Err(e) = self.evict_region(entity_type) {
            warn!(entity = entity_type.name(), error = %e, "region eviction failed");
        }
    }
}

fn check_shape(entity_type: &EntityType, state: &DehydratedState) -> Result<(), CacheError> {
    let table = entity_type.table();
    if state.values.len() != table.columns().len() || state.relations.len() != table.relations().len() {
        return Err(CacheError::InvariantViolation {
            region: entity_type.region_name().to_string(),
            reason: format!(
                "{} expects {} values and {} relations, cached state has {} and {}",
                entity_type.name(),
                table.columns().len(),
                table.relations().len(),
                state.values.len(),
                state.relations.len()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::metadata::tests::blog_metamodel;
    use crate::metadata::Metamodel;

    fn cache() -> (EntityCache, Arc<RegionStore>, Arc<Statistics>) {
        let regions = Arc::new(RegionStore::new(&Settings::default()));
        let stats = Arc::new(Statistics::new());
        (
            EntityCache::new(regions.clone(), stats.clone(), Duration::from_secs(60)),
            regions,
            stats,
        )
    }

    fn post_state(name: &str) -> DehydratedState {
        DehydratedState {
            values: vec![name.into()],
            relations: vec![vec![1], vec![2, 3]],
        }
    }

    #[test]
    fn test_miss_then_hit() {
        let model = blog_metamodel();
        let post = model.entity("Post").unwrap();
        let (cache, _, stats) = cache();

        assert!(cache.get(post, 1).is_none());
        assert!(cache.put_from_load(post, 1, &post_state("a"), 1));
        assert_eq!(*cache.get(post, 1).unwrap(), post_state("a"));
        assert!(cache.contains(post, 1));

        let snap = stats.snapshot();
        assert_eq!((snap.second_level_hits, snap.second_level_misses, snap.second_level_puts), (1, 1, 1));
    }

    #[test]
    fn test_uncached_type_is_never_stored() {
        let model = Metamodel::new(crate::metadata::tests::blog_schema());
        let post = model.entity("Post").unwrap();
        let (cache, _, _) = cache();

        assert!(!cache.put_from_load(post, 1, &post_state("a"), 1));
        assert!(!cache.contains(post, 1));
    }

    #[test]
    fn test_commit_evicts_instead_of_overwriting() {
        let model = blog_metamodel();
        let post = model.entity("Post").unwrap();
        let (cache, _, _) = cache();
        cache.put_from_load(post, 1, &post_state("a"), 1);

        let token = cache.lock(post, 1, 42).unwrap();
        assert!(cache.get(post, 1).is_none());
        assert!(!cache.put_from_load(post, 1, &post_state("b"), 2));

        cache.release(post, token, LockOutcome::Committed(3)).unwrap();
        assert!(!cache.contains(post, 1));
        assert!(!cache.put_from_load(post, 1, &post_state("b"), 2));
        assert!(cache.put_from_load(post, 1, &post_state("c"), 4));
    }

    #[test]
    fn test_arity_mismatch_evicts_region() {
        let model = blog_metamodel();
        let post = model.entity("Post").unwrap();
        let (cache, regions, _) = cache();

        cache.put_from_load(post, 2, &post_state("ok"), 1);
        regions
            .put(
                post.region_name(),
                RegionKey::Entity(EntityKey::new("Post", 1)),
                CacheValue::Entity(Arc::new(DehydratedState {
                    values: vec![],
                    relations: vec![],
                })),
            )
            .unwrap();

        assert!(cache.get(post, 1).is_none());
        assert!(!cache.contains(post, 2));
    }
}
