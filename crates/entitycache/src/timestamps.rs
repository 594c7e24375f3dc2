//! Update timestamps
//!
//! One entry per entity type holding the timestamp of its last committed
//! mutation and the number of flushed but uncommitted writes touching it.
//! A query result created at `t` over types `S` is fresh iff every type
//! in `S` has no write in flight and was last mutated at or before `t`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::CacheError;
use crate::region::{CacheValue, Region, RegionKey};

/// Logical time
pub type Timestamp = u64;

/// Strictly increasing timestamp source
#[derive(Debug, Default)]
pub struct Timestamper {
    last: AtomicU64,
}

impl Timestamper {
    /// Start at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// A timestamp greater than every one issued before
    pub fn next(&self) -> Timestamp {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Most recently issued timestamp
    pub fn current(&self) -> Timestamp {
        self.last.load(Ordering::SeqCst)
    }
}

/// Timestamps region entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimestampEntry {
    /// Last committed mutation
    pub last: Timestamp,
    /// Flushed, uncommitted writes
    pub in_flight: u32,
}

/// Update timestamps over the timestamps region
pub struct UpdateTimestamps {
    region: Arc<Region>,
    timestamper: Arc<Timestamper>,
    floor: AtomicU64,
    guard: Mutex<()>,
}

impl UpdateTimestamps {
    /// Track timestamps in `region`
    pub fn new(region: Arc<Region>, timestamper: Arc<Timestamper>) -> Self {
        Self {
            region,
            timestamper,
            floor: AtomicU64::new(0),
            guard: Mutex::new(()),
        }
    }

    /// Backing region
    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    fn modify<F>(&self, space: &str, change: F) -> Result<TimestampEntry, CacheError>
    where
        F: FnOnce(&mut TimestampEntry),
    {
        let mut updated = TimestampEntry::default();
        self.region.update(RegionKey::Space(space.to_string()), |current| {
            if let Some(CacheValue::Timestamp(entry)) = current {
                updated = *entry;
            }
            change(&mut updated);
            Some(CacheValue::Timestamp(updated))
        })?;
        Ok(updated)
    }

    fn entry(&self, space: &str) -> Result<Option<TimestampEntry>, CacheError> {
        match self.region.get(&RegionKey::Space(space.to_string()))? {
            Some(CacheValue::Timestamp(entry)) => Ok(Some(entry)),
            _ => Ok(None),
        }
    }

    /// Mark writes to `spaces` as in flight
    pub fn pre_invalidate(&self, spaces: &BTreeSet<String>) -> Result<(), CacheError> {
        let _guard = self.guard.lock();
        for space in spaces {
            let entry = self.modify(space, |entry| entry.in_flight += 1)?;
            debug!(space = %space, in_flight = entry.in_flight, "pre-invalidated");
        }
        Ok(())
    }

    /// Record a committed mutation of one type
    pub fn bump(&self, space: &str) -> Result<Timestamp, CacheError> {
        let _guard = self.guard.lock();
        let ts = self.timestamper.next();
        self.modify(space, |entry| entry.last = ts)?;
        Ok(ts)
    }

    /// Commit writes that were pre-invalidated: stamp every space with one
    /// fresh timestamp and clear their in-flight markers
    pub fn invalidate(&self, spaces: &BTreeSet<String>) -> Result<Timestamp, CacheError> {
        let _guard = self.guard.lock();
        let ts = self.timestamper.next();
        for space in spaces {
            self.modify(space, |entry| {
                entry.last = ts;
                entry.in_flight = entry.in_flight.saturating_sub(1);
            })?;
            debug!(space = %space, timestamp = ts, "invalidated");
        }
        Ok(ts)
    }

    /// Drop in-flight markers of aborted writes without a bump
    pub fn release(&self, spaces: &BTreeSet<String>) -> Result<(), CacheError> {
        let _guard = self.guard.lock();
        for space in spaces {
            self.modify(space, |entry| entry.in_flight = entry.in_flight.saturating_sub(1))?;
        }
        Ok(())
    }

    /// Newest mutation over `spaces`
    ///
    /// A space with a write in flight reads as [`Timestamp::MAX`]. Missing
    /// entries read as the floor left by the last full eviction.
    pub fn read_all(&self, spaces: &BTreeSet<String>) -> Result<Timestamp, CacheError> {
        let mut newest = self.floor.load(Ordering::SeqCst);
        for space in spaces {
            if let Some(entry) = self.entry(space)? {
                if entry.in_flight > 0 {
                    return Ok(Timestamp::MAX);
                }
                newest = newest.max(entry.last);
            }
        }
        Ok(newest)
    }

    /// Whether a result created at `created` over `spaces` is still fresh
    pub fn is_up_to_date(&self, spaces: &BTreeSet<String>, created: Timestamp) -> Result<bool, CacheError> {
        Ok(self.read_all(spaces)? <= created)
    }

    /// Raise the floor to a fresh timestamp, distrusting every result created
    /// before now
    pub fn raise_floor(&self) -> Timestamp {
        let ts = self.timestamper.next();
        self.floor.fetch_max(ts, Ordering::SeqCst);
        ts
    }

    /// Run a full eviction that clears this region, with bumps and
    /// in-flight markers held off until it returns
    ///
    /// The floor is raised first, so results created before the call stay
    /// stale once their entries are gone.
    pub fn evict_all_with<F>(&self, evict: F) -> Result<usize, CacheError>
    where
        F: FnOnce() -> Result<usize, CacheError>,
    {
        let _guard = self.guard.lock();
        let floor = self.raise_floor();
        debug!(floor, "timestamps floor raised for full eviction");
        evict()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionConfig;
    use crate::region::{LruStorage, RegionKind};

    fn timestamps() -> UpdateTimestamps {
        let region = Region::new(
            "timestamps",
            RegionKind::Timestamps,
            RegionConfig::unbounded(),
            Box::new(LruStorage::new(None)),
        );
        UpdateTimestamps::new(Arc::new(region), Arc::new(Timestamper::new()))
    }

    fn spaces(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_timestamper_is_strictly_increasing() {
        let ts = Timestamper::new();
        let a = ts.next();
        let b = ts.next();
        assert!(b > a);
        assert_eq!(ts.current(), b);
    }

    #[test]
    fn test_bump_makes_older_results_stale() {
        let ts = timestamps();
        let created = ts.timestamper.next();
        assert!(ts.is_up_to_date(&spaces(&["Post"]), created).unwrap());

        ts.bump("Post").unwrap();
        assert!(!ts.is_up_to_date(&spaces(&["Post", "Comment"]), created).unwrap());
        assert!(ts.is_up_to_date(&spaces(&["Comment"]), created).unwrap());
    }

    #[test]
    fn test_in_flight_blocks_until_commit() {
        let ts = timestamps();
        let created = ts.timestamper.next();

        ts.pre_invalidate(&spaces(&["Comment"])).unwrap();
        let later = ts.timestamper.next();
        assert_eq!(ts.read_all(&spaces(&["Comment"])).unwrap(), Timestamp::MAX);
        assert!(!ts.is_up_to_date(&spaces(&["Comment"]), later).unwrap());

        let committed = ts.invalidate(&spaces(&["Comment"])).unwrap();
        assert!(committed > later);
        assert!(!ts.is_up_to_date(&spaces(&["Comment"]), created).unwrap());
        assert!(ts.is_up_to_date(&spaces(&["Comment"]), committed).unwrap());
    }

    #[test]
    fn test_release_does_not_bump() {
        let ts = timestamps();
        let created = ts.timestamper.next();

        ts.pre_invalidate(&spaces(&["Post"])).unwrap();
        ts.release(&spaces(&["Post"])).unwrap();
        assert!(ts.is_up_to_date(&spaces(&["Post"]), created).unwrap());
    }

    #[test]
    fn test_stacked_in_flight_markers() {
        let ts = timestamps();
        ts.pre_invalidate(&spaces(&["Post"])).unwrap();
        ts.pre_invalidate(&spaces(&["Post"])).unwrap();
        ts.release(&spaces(&["Post"])).unwrap();

        let created = ts.timestamper.next();
        assert!(!ts.is_up_to_date(&spaces(&["Post"]), created).unwrap());
        ts.invalidate(&spaces(&["Post"])).unwrap();
        let created = ts.timestamper.next();
        assert!(ts.is_up_to_date(&spaces(&["Post"]), created).unwrap());
    }

    #[test]
    fn test_evict_all_keeps_old_results_stale() {
        let ts = timestamps();
        let created = ts.timestamper.next();
        ts.bump("Post").unwrap();

        let region = ts.region().clone();
        assert_eq!(ts.evict_all_with(|| region.evict_all()).unwrap(), 1);
        assert!(ts.region().is_empty());
        assert!(!ts.is_up_to_date(&spaces(&["Post"]), created).unwrap());
        assert!(!ts.is_up_to_date(&spaces(&["Comment"]), created).unwrap());

        let fresh = ts.timestamper.next();
        assert!(ts.is_up_to_date(&spaces(&["Post"]), fresh).unwrap());
    }
}
