//! Region store
//!
//! A region is a named key/value container with its own eviction policy.
//! Storage is pluggable through [`RegionFactory`]; the [`Region`] wrapper
//! adds expiry, statistics and soft locks on top of any storage.
//!
//! Soft locks replace an entry while a write is in flight. Readers treat a
//! locked key as a miss and loads do not repopulate it. Releasing the lock
//! after an abort restores the entry that was there before. Releasing it
//! after a commit evicts the key and leaves an invalidation marker stamped
//! with the commit timestamp, so that a load started before the commit
//! cannot put the old state back.

use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::{RegionConfig, Settings};
use crate::entity::{DehydratedState, EntityKey};
use crate::error::CacheError;
use crate::lru::LruCache;
use crate::query_cache::{QueryKey, QueryResultEntry};
use crate::stats::CacheStats;
use crate::timestamps::{Timestamp, TimestampEntry};

const LOCK_STRIPES: usize = 16;

/// What a region holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Dehydrated entity state
    Entity,
    /// Query results
    Query,
    /// Update timestamps per entity type
    Timestamps,
}

/// Key of a region entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RegionKey {
    /// Entity state
    Entity(EntityKey),
    /// Query result
    Query(QueryKey),
    /// Entity type name in the timestamps region
    Space(String),
}

/// Value of a region entry
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    /// Entity state
    Entity(Arc<DehydratedState>),
    /// Query result
    Query(Arc<QueryResultEntry>),
    /// Update timestamp
    Timestamp(TimestampEntry),
}

impl CacheValue {
    fn kind(&self) -> RegionKind {
        match self {
            CacheValue::Entity(_) => RegionKind::Entity,
            CacheValue::Query(_) => RegionKind::Query,
            CacheValue::Timestamp(_) => RegionKind::Timestamps,
        }
    }
}

/// Lock acquisition policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// A second acquirer fails while the lock is live
    Exclusive,
    /// Acquirers stack; the key stays locked until the last one releases
    Stackable,
}

/// How the write guarded by a lock ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// Store write succeeded at the given time; the entry is evicted
    Committed(Timestamp),
    /// Store write failed; the previous entry is restored
    Aborted,
}

/// Sentinel stored in place of an entry
#[derive(Debug, Clone)]
pub struct SoftLock {
    owner: u64,
    holders: u32,
    mode: LockMode,
    expires_at: Instant,
    committed: Option<Timestamp>,
    previous: Option<Box<Slot>>,
}

impl SoftLock {
    /// Owner of the first acquisition
    pub fn owner(&self) -> u64 {
        self.owner
    }

    /// Number of stacked acquisitions
    pub fn holders(&self) -> u32 {
        self.holders
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Proof of a lock acquisition, handed back on release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: RegionKey,
    owner: u64,
}

impl LockToken {
    /// Locked key
    pub fn key(&self) -> &RegionKey {
        &self.key
    }
}

/// Stored form of a region entry
#[derive(Debug, Clone)]
pub enum Slot {
    /// Cached value with its insertion time
    Value {
        /// Cached value
        value: CacheValue,
        /// When it was stored
        stored_at: Instant,
    },
    /// Key is soft-locked
    Locked(SoftLock),
    /// Key was written at `at`; loads from transactions started earlier are refused
    Invalidated {
        /// Commit timestamp of the write
        at: Timestamp,
        /// End of the marker's lifetime
        expires_at: Instant,
    },
}

/// Backing storage of one region
pub trait RegionStorage: Send + Sync {
    /// Look up a slot
    fn get(&self, key: &RegionKey) -> Result<Option<Slot>, CacheError>;

    /// Insert or replace a slot, returning how many entries were pushed out
    fn put(&self, key: RegionKey, slot: Slot) -> Result<usize, CacheError>;

    /// Remove a slot
    fn remove(&self, key: &RegionKey) -> Result<Option<Slot>, CacheError>;

    /// Remove every slot, returning how many there were
    fn clear(&self) -> Result<usize, CacheError>;

    /// Number of slots
    fn len(&self) -> usize;

    /// Whether the storage is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds storage for regions on first use
pub trait RegionFactory: Send + Sync {
    /// Short name used in configuration
    fn name(&self) -> &str;

    /// Storage for one region
    fn build(&self, region: &str, config: &RegionConfig) -> Result<Box<dyn RegionStorage>, CacheError>;
}

/// In-memory LRU storage
pub struct LruStorage {
    entries: RwLock<LruCache<RegionKey, Slot>>,
}

impl LruStorage {
    /// Storage bounded by `max_entries`, or unbounded
    pub fn new(max_entries: Option<usize>) -> Self {
        let entries = match max_entries {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };
        Self {
            entries: RwLock::new(entries),
        }
    }
}

impl RegionStorage for LruStorage {
    fn get(&self, key: &RegionKey) -> Result<Option<Slot>, CacheError> {
        // Unbounded lists have no recency to maintain
        {
            let entries = self.entries.read();
            if entries.capacity().is_none() {
                return Ok(entries.peek(key).cloned());
            }
        }
        Ok(self.entries.write().get(key).cloned())
    }

    fn put(&self, key: RegionKey, slot: Slot) -> Result<usize, CacheError> {
        Ok(self.entries.write().put(key, slot).map_or(0, |_| 1))
    }

    fn remove(&self, key: &RegionKey) -> Result<Option<Slot>, CacheError> {
        Ok(self.entries.write().remove(key))
    }

    fn clear(&self) -> Result<usize, CacheError> {
        Ok(self.entries.write().clear())
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Size- and time-bounded in-memory regions
#[derive(Debug, Clone, Copy, Default)]
pub struct LruRegionFactory;

impl RegionFactory for LruRegionFactory {
    fn name(&self) -> &str {
        "lru"
    }

    fn build(&self, _region: &str, config: &RegionConfig) -> Result<Box<dyn RegionStorage>, CacheError> {
        Ok(Box::new(LruStorage::new(config.max_entries)))
    }
}

/// Regions that store nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCachingRegionFactory;

struct NoStorage;

impl RegionStorage for NoStorage {
    fn get(&self, _key: &RegionKey) -> Result<Option<Slot>, CacheError> {
        Ok(None)
    }

    fn put(&self, _key: RegionKey, _slot: Slot) -> Result<usize, CacheError> {
        Ok(0)
    }

    fn remove(&self, _key: &RegionKey) -> Result<Option<Slot>, CacheError> {
        Ok(None)
    }

    fn clear(&self) -> Result<usize, CacheError> {
        Ok(0)
    }

    fn len(&self) -> usize {
        0
    }
}

impl RegionFactory for NoCachingRegionFactory {
    fn name(&self) -> &str {
        "none"
    }

    fn build(&self, _region: &str, _config: &RegionConfig) -> Result<Box<dyn RegionStorage>, CacheError> {
        Ok(Box::new(NoStorage))
    }
}

/// A named region
pub struct Region {
    name: String,
    kind: RegionKind,
    config: RegionConfig,
    storage: Box<dyn RegionStorage>,
    stats: CacheStats,
    stripes: Vec<Mutex<()>>,
    hasher: RandomState,
}

impl Region {
    /// Wrap storage built for this region
    pub fn new(
        name: impl Into<String>,
        kind: RegionKind,
        config: RegionConfig,
        storage: Box<dyn RegionStorage>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            config,
            storage,
            stats: CacheStats::new(),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            hasher: RandomState::new(),
        }
    }

    /// Region name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// What the region holds
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    /// Eviction policy
    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    /// Hit/miss counters
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of slots, locks included
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Whether the region is empty
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    fn stripe(&self, key: &RegionKey) -> &Mutex<()> {
        let idx = (BuildHasher::hash_one(&self.hasher, key) as usize) % self.stripes.len();
        &self.stripes[idx]
    }

    fn is_expired(&self, stored_at: Instant, now: Instant) -> bool {
        self.config
            .ttl
            .map_or(false, |ttl| now.duration_since(stored_at) >= ttl)
    }

    /// Whether a slot no longer counts: expired value or expired lock
    fn is_stale(&self, slot: &Slot, now: Instant) -> bool {
        match slot {
            Slot::Value { stored_at, .. } => self.is_expired(*stored_at, now),
            Slot::Locked(lock) => !lock.is_live(now),
            Slot::Invalidated { expires_at, .. } => now >= *expires_at,
        }
    }

    fn store(&self, key: RegionKey, value: CacheValue, stored_at: Instant) -> Result<(), CacheError> {
        let pushed_out = self.storage.put(key, Slot::Value { value, stored_at })?;
        self.stats.record_insert();
        if pushed_out > 0 {
            self.stats.record_evictions(pushed_out as u64);
        }
        Ok(())
    }

    /// Read a value; locked, expired and absent keys are misses
    pub fn get(&self, key: &RegionKey) -> Result<Option<CacheValue>, CacheError> {
        let now = Instant::now();
        match self.storage.get(key)? {
            Some(Slot::Value { value, stored_at }) if !self.is_expired(stored_at, now) => {
                self.stats.record_hit();
                Ok(Some(value))
            }
            Some(slot) => {
                self.stats.record_miss();
                if self.is_stale(&slot, now) {
                    let _guard = self.stripe(key).lock();
                    if let Some(current) = self.storage.get(key)? {
                        if self.is_stale(&current, now) {
                            self.storage.remove(key)?;
                            self.stats.record_evictions(1);
                        }
                    }
                }
                Ok(None)
            }
            None => {
                self.stats.record_miss();
                Ok(None)
            }
        }
    }

    /// Read the raw slot without touching statistics
    pub fn peek(&self, key: &RegionKey) -> Result<Option<Slot>, CacheError> {
        self.storage.get(key)
    }

    /// Store a value unless the key is locked
    pub fn put(&self, key: RegionKey, value: CacheValue) -> Result<bool, CacheError> {
        let _guard = self.stripe(&key).lock();
        let now = Instant::now();
        if let Some(Slot::Locked(lock)) = self.storage.get(&key)? {
            if lock.is_live(now) {
                return Ok(false);
            }
        }
        self.store(key, value, now)?;
        Ok(true)
    }

    /// Store a value loaded by a transaction started at `since`
    ///
    /// Refused while the key holds a live value or lock, or when the key
    /// was invalidated by a commit the loading transaction may not have seen.
    pub fn put_from_load(&self, key: RegionKey, value: CacheValue, since: Timestamp) -> Result<bool, CacheError> {
        let _guard = self.stripe(&key).lock();
        let now = Instant::now();
        let refused = match self.storage.get(&key)? {
            Some(Slot::Invalidated { at, expires_at }) => now < expires_at && since <= at,
            Some(slot) => !self.is_stale(&slot, now),
            None => false,
        };
        if refused {
            return Ok(false);
        }
        self.store(key, value, now)?;
        Ok(true)
    }

    /// Atomically replace a value
    ///
    /// `update` sees the live value, if any; returning `None` leaves the
    /// slot untouched. Locked keys are never passed to `update`.
    pub fn update<F>(&self, key: RegionKey, update: F) -> Result<Option<CacheValue>, CacheError>
    where
        F: FnOnce(Option<&CacheValue>) -> Option<CacheValue>,
    {
        let _guard = self.stripe(&key).lock();
        let now = Instant::now();
        let current = match self.storage.get(&key)? {
            Some(Slot::Locked(lock)) if lock.is_live(now) => return Ok(None),
            Some(Slot::Value { value, stored_at }) if !self.is_expired(stored_at, now) => Some(value),
            _ => None,
        };
        match update(current.as_ref()) {
            Some(value) => {
                self.store(key, value.clone(), now)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Remove one key, locked or not
    pub fn evict(&self, key: &RegionKey) -> Result<bool, CacheError> {
        let _guard = self.stripe(key).lock();
        let removed = self.storage.remove(key)?.is_some();
        if removed {
            self.stats.record_evictions(1);
        }
        Ok(removed)
    }

    /// Remove every key
    pub fn evict_all(&self) -> Result<usize, CacheError> {
        let removed = self.storage.clear()?;
        self.stats.record_evictions(removed as u64);
        info!(region = %self.name, entries = removed, "region evicted");
        Ok(removed)
    }

    /// Soft-lock a key for the duration of a write
    pub fn lock(
        &self,
        key: RegionKey,
        owner: u64,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<LockToken, CacheError> {
        let _guard = self.stripe(&key).lock();
        let now = Instant::now();

        let lock = match self.storage.get(&key)? {
            Some(Slot::Locked(mut lock)) if lock.is_live(now) => {
                let exclusive = lock.mode == LockMode::Exclusive || mode == LockMode::Exclusive;
                if exclusive && lock.owner != owner {
                    return Err(CacheError::Locked {
                        region: self.name.clone(),
                    });
                }
                lock.holders += 1;
                lock.expires_at = lock.expires_at.max(now + timeout);
                lock
            }
            current => SoftLock {
                owner,
                holders: 1,
                mode,
                expires_at: now + timeout,
                committed: None,
                previous: current
                    .filter(|slot| !matches!(slot, Slot::Locked(_)) && !self.is_stale(slot, now))
                    .map(Box::new),
            },
        };

        debug!(region = %self.name, ?key, holders = lock.holders, "soft lock acquired");
        let pushed_out = self.storage.put(key.clone(), Slot::Locked(lock))?;
        if pushed_out > 0 {
            self.stats.record_evictions(pushed_out as u64);
        }
        Ok(LockToken { key, owner })
    }

    /// Release a lock
    ///
    /// The last release invalidates the key if any holder committed and
    /// restores the previous entry otherwise.
    pub fn release(&self, token: LockToken, outcome: LockOutcome) -> Result<(), CacheError> {
        let LockToken { key, owner } = token;
        let _guard = self.stripe(&key).lock();

        match self.storage.get(&key)? {
            Some(Slot::Locked(mut lock)) => {
                lock.holders = lock.holders.saturating_sub(1);
                if let LockOutcome::Committed(at) = outcome {
                    lock.committed = Some(lock.committed.map_or(at, |c| c.max(at)));
                }
                if lock.holders > 0 {
                    self.storage.put(key, Slot::Locked(lock))?;
                    return Ok(());
                }
                debug!(region = %self.name, ?key, owner, ?outcome, "soft lock released");
                match (lock.committed, lock.previous) {
                    (Some(at), previous) => {
                        if matches!(previous.as_deref(), Some(Slot::Value { .. })) {
                            self.stats.record_evictions(1);
                        }
                        self.storage.put(
                            key,
                            Slot::Invalidated {
                                at,
                                expires_at: lock.expires_at,
                            },
                        )?;
                    }
                    (None, Some(previous)) => {
                        self.storage.put(key, *previous)?;
                    }
                    (None, None) => {
                        self.storage.remove(&key)?;
                    }
                }
            }
            // Lock expired or was evicted and the key was reloaded since
            Some(Slot::Value { .. }) if matches!(outcome, LockOutcome::Committed(_)) => {
                self.storage.remove(&key)?;
                self.stats.record_evictions(1);
            }
            _ => {}
        }
        Ok(())
    }
}

/// All regions of a coordinator, created on first use
pub struct RegionStore {
    factory: Arc<dyn RegionFactory>,
    default_config: RegionConfig,
    overrides: HashMap<String, RegionConfig, RandomState>,
    regions: RwLock<HashMap<String, Arc<Region>, RandomState>>,
}

impl RegionStore {
    /// Empty store building regions with the configured factory
    pub fn new(settings: &Settings) -> Self {
        Self {
            factory: settings.region_factory.clone(),
            default_config: settings.default_region,
            overrides: settings.regions.clone(),
            regions: RwLock::new(HashMap::with_hasher(RandomState::new())),
        }
    }

    /// Name of the storage provider
    pub fn factory_name(&self) -> &str {
        self.factory.name()
    }

    /// Get or create a region
    ///
    /// Timestamp regions are never bounded: losing an entry would make
    /// stale query results look fresh.
    pub fn region(&self, name: &str, kind: RegionKind) -> Result<Arc<Region>, CacheError> {
        if let Some(region) = self.regions.read().get(name) {
            return Ok(region.clone());
        }

        let mut regions = self.regions.write();
        if let Some(region) = regions.get(name) {
            return Ok(region.clone());
        }
        let config = match kind {
            RegionKind::Timestamps => RegionConfig::unbounded(),
            _ => self.overrides.get(name).copied().unwrap_or(self.default_config),
        };
        let storage = self.factory.build(name, &config)?;
        let region = Arc::new(Region::new(name, kind, config, storage));
        debug!(region = name, ?kind, ?config, "region created");
        regions.insert(name.to_string(), region.clone());
        Ok(region)
    }

    /// Existing region, if any
    pub fn existing(&self, name: &str) -> Option<Arc<Region>> {
        self.regions.read().get(name).cloned()
    }

    /// Read from a region; an absent region is a miss
    pub fn get(&self, region: &str, key: &RegionKey) -> Result<Option<CacheValue>, CacheError> {
        match self.existing(region) {
            Some(region) => region.get(key),
            None => Ok(None),
        }
    }

    /// Write into a region, creating it for the value's kind
    pub fn put(&self, region: &str, key: RegionKey, value: CacheValue) -> Result<bool, CacheError> {
        self.region(region, value.kind())?.put(key, value)
    }

    /// Remove one key from a region
    pub fn evict(&self, region: &str, key: &RegionKey) -> Result<bool, CacheError> {
        match self.existing(region) {
            Some(region) => region.evict(key),
            None => Ok(false),
        }
    }

    /// Empty one region
    pub fn evict_all(&self, region: &str) -> Result<usize, CacheError> {
        match self.existing(region) {
            Some(region) => region.evict_all(),
            None => Ok(0),
        }
    }

    /// Empty every region
    ///
    /// Region creation is blocked until every region has been cleared.
    /// Clearing continues past a failing region; the first failure is
    /// returned.
    pub fn evict_all_regions(&self) -> Result<usize, CacheError> {
        let regions = self.regions.write();
        let mut total = 0;
        let mut first_error = None;
        for region in regions.values() {
            match region.evict_all() {
                Ok(n) => total += n,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    /// Every region, ordered by name
    pub fn regions(&self) -> Vec<Arc<Region>> {
        let mut regions: Vec<_> = self.regions.read().values().cloned().collect();
        regions.sort_by(|a, b| a.name().cmp(b.name()));
        regions
    }
}
