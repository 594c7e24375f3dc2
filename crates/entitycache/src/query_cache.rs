//! Query result cache
//!
//! Entries hold the keys of the selected and join-fetched entities, never
//! their state. The session rebuilds results from the entity cache.

use std::collections::BTreeSet;
use std::sync::Arc;

use rowstore::Value;
use tracing::{debug, info, warn};

use crate::entity::EntityKey;
use crate::region::{CacheValue, Region, RegionKey};
use crate::stats::Statistics;
use crate::timestamps::{Timestamp, UpdateTimestamps};

/// Fingerprint of a query execution
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    text: String,
    parameters: Vec<(String, Value)>,
    spaces: BTreeSet<String>,
}

impl QueryKey {
    /// Whitespace in `text` is normalised; `parameters` must be in declared
    /// order
    pub fn new(text: &str, parameters: Vec<(String, Value)>, spaces: BTreeSet<String>) -> Self {
        Self {
            text: text.split_whitespace().collect::<Vec<_>>().join(" "),
            parameters,
            spaces,
        }
    }

    /// Normalised query text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Bound parameters
    pub fn parameters(&self) -> &[(String, Value)] {
        &self.parameters
    }

    /// Entity types the result depends on
    pub fn spaces(&self) -> &BTreeSet<String> {
        &self.spaces
    }
}

/// Cached query result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResultEntry {
    /// Timestamp taken before the query ran
    pub created: Timestamp,
    /// Selected entities in result order
    pub roots: Vec<EntityKey>,
    /// Join-fetched entities
    pub fetched: Vec<EntityKey>,
}

/// Query cache over one region
pub struct QueryCache {
    region: Arc<Region>,
    timestamps: Arc<UpdateTimestamps>,
    stats: Arc<Statistics>,
}

impl QueryCache {
    /// Cache results in `region`, validated against `timestamps`
    pub fn new(region: Arc<Region>, timestamps: Arc<UpdateTimestamps>, stats: Arc<Statistics>) -> Self {
        Self {
            region,
            timestamps,
            stats,
        }
    }

    /// Backing region
    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    /// Fresh entry for `key`, if any
    ///
    /// Stale entries are evicted. Failures read as a miss.
    pub fn lookup(&self, key: &QueryKey) -> Option<Arc<QueryResultEntry>> {
        let region_key = RegionKey::Query(key.clone());
        let entry = match self.region.get(&region_key) {
            Ok(Some(CacheValue::Query(entry))) => entry,
            Ok(_) => {
                debug!(query = %key.text, "query cache miss");
                self.stats.query_cache().record_miss();
                return None;
            }
            Err(e) => {
                warn!(error = %e, "query cache unavailable");
                self.stats.query_cache().record_miss();
                return None;
            }
        };

        match self.timestamps.is_up_to_date(&key.spaces, entry.created) {
            Ok(true) => {
                debug!(query = %key.text, "query cache hit");
                self.stats.query_cache().record_hit();
                Some(entry)
            }
            Ok(false) => {
                info!(query = %key.text, created = entry.created, "query invalidation");
                self.evict(key);
                self.stats.query_cache().record_miss();
                None
            }
            Err(e) => {
                warn!(error = %e, "update timestamps unavailable");
                self.stats.query_cache().record_miss();
                None
            }
        }
    }

    /// Store a result computed from a snapshot taken at `created`
    pub fn store(&self, key: QueryKey, created: Timestamp, roots: Vec<EntityKey>, fetched: Vec<EntityKey>) -> bool {
        // A result older than the newest write may already be stale
        match self.timestamps.is_up_to_date(&key.spaces, created) {
            Ok(true) => {}
            Ok(false) => {
                debug!(query = %key.text, "query result outdated before it was stored");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "update timestamps unavailable");
                return false;
            }
        }

        let entry = QueryResultEntry {
            created,
            roots,
            fetched,
        };
        match self.region.put(RegionKey::Query(key), CacheValue::Query(Arc::new(entry))) {
            Ok(stored) => {
                if stored {
                    self.stats.query_cache().record_insert();
                }
                stored
            }
            Err(e) => {
                warn!(error = %e, "query cache unavailable");
                false
            }
        }
    }

    /// Drop one entry
    pub fn evict(&self, key: &QueryKey) {
        if let Err(e) = self.region.evict(&RegionKey::Query(key.clone())) {
            warn!(error = %e, "query cache unavailable");
        }
    }

    /// Drop every entry
    pub fn evict_all(&self) -> usize {
        match self.region.evict_all() {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "query cache unavailable");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionConfig;
    use crate::region::{LruStorage, RegionKind};
    use crate::timestamps::Timestamper;

    struct Fixture {
        cache: QueryCache,
        timestamps: Arc<UpdateTimestamps>,
        timestamper: Arc<Timestamper>,
        stats: Arc<Statistics>,
    }

    fn fixture() -> Fixture {
        let timestamper = Arc::new(Timestamper::new());
        let timestamps = Arc::new(UpdateTimestamps::new(
            Arc::new(Region::new(
                "timestamps",
                RegionKind::Timestamps,
                RegionConfig::unbounded(),
                Box::new(LruStorage::new(None)),
            )),
            timestamper.clone(),
        ));
        let stats = Arc::new(Statistics::new());
        let region = Arc::new(Region::new(
            "query",
            RegionKind::Query,
            RegionConfig::unbounded(),
            Box::new(LruStorage::new(None)),
        ));
        Fixture {
            cache: QueryCache::new(region, timestamps.clone(), stats.clone()),
            timestamps,
            timestamper,
            stats,
        }
    }

    fn post_query(id: i64) -> QueryKey {
        QueryKey::new(
            "select p from Post p join fetch p.details where p.id = :id",
            vec![("id".into(), Value::Int(id))],
            ["Post", "PostDetails"].iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_key_normalises_whitespace() {
        let a = QueryKey::new("select p\n  from Post p", vec![], BTreeSet::new());
        let b = QueryKey::new("select p from Post p", vec![], BTreeSet::new());
        assert_eq!(a, b);
        assert_ne!(post_query(1), post_query(2));
    }

    #[test]
    fn test_store_then_lookup() {
        let f = fixture();
        let created = f.timestamper.next();
        assert!(f.cache.lookup(&post_query(1)).is_none());

        assert!(f.cache.store(
            post_query(1),
            created,
            vec![EntityKey::new("Post", 1)],
            vec![EntityKey::new("PostDetails", 1)],
        ));
        let entry = f.cache.lookup(&post_query(1)).unwrap();
        assert_eq!(entry.roots, vec![EntityKey::new("Post", 1)]);

        let snap = f.stats.snapshot();
        assert_eq!(snap.query_cache_hits, 1);
        assert_eq!(snap.query_cache_misses, 1);
        assert_eq!(snap.query_cache_puts, 1);
    }

    #[test]
    fn test_bump_invalidates_and_evicts() {
        let f = fixture();
        let created = f.timestamper.next();
        f.cache.store(post_query(1), created, vec![EntityKey::new("Post", 1)], vec![]);

        f.timestamps.bump("PostDetails").unwrap();
        assert!(f.cache.lookup(&post_query(1)).is_none());
        assert!(f.cache.region().is_empty());
    }

    #[test]
    fn test_unrelated_bump_keeps_entry() {
        let f = fixture();
        let created = f.timestamper.next();
        f.cache.store(post_query(1), created, vec![EntityKey::new("Post", 1)], vec![]);

        f.timestamps.bump("Comment").unwrap();
        assert!(f.cache.lookup(&post_query(1)).is_some());
    }

    #[test]
    fn test_outdated_result_is_not_stored() {
        let f = fixture();
        let created = f.timestamper.next();
        f.timestamps.bump("Post").unwrap();

        assert!(!f.cache.store(post_query(1), created, vec![], vec![]));
        assert!(f.cache.region().is_empty());
    }
}
