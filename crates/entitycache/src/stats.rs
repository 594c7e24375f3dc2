//! Cache statistics tracking

use std::sync::atomic::{AtomicU64, Ordering};

use crate::region::{Region, RegionKind};

/// Hit/miss counters for one region or cache layer
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    inserts: AtomicU64,
}

impl CacheStats {
    /// Create new stats tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cache hit
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cache miss
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record evictions
    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    /// Record an insert
    pub fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total hits
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get total misses
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get total evictions
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Get total inserts
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.inserts.store(0, Ordering::Relaxed);
    }
}

/// Coordinator-wide counters
#[derive(Debug, Default)]
pub struct Statistics {
    second_level: CacheStats,
    query_cache: CacheStats,
    entity_fetches: AtomicU64,
    query_executions: AtomicU64,
    flushes: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    sessions_opened: AtomicU64,
}

/// Point-in-time copy of [`Statistics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    /// Entity reads served by L2
    pub second_level_hits: u64,
    /// Entity reads that fell through L2
    pub second_level_misses: u64,
    /// States written into L2 after a store read
    pub second_level_puts: u64,
    /// Cacheable queries answered from the query cache
    pub query_cache_hits: u64,
    /// Cacheable queries that were executed
    pub query_cache_misses: u64,
    /// Results written into the query cache
    pub query_cache_puts: u64,
    /// Entity reads that reached the store
    pub entity_fetches: u64,
    /// Queries executed against the store
    pub query_executions: u64,
    /// Flushes that wrote something
    pub flushes: u64,
    /// Committed units of work
    pub commits: u64,
    /// Rolled back units of work
    pub rollbacks: u64,
    /// Sessions opened
    pub sessions_opened: u64,
}

impl Statistics {
    /// Create zeroed statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Entity (L2) counters
    pub fn second_level(&self) -> &CacheStats {
        &self.second_level
    }

    /// Query cache counters
    pub fn query_cache(&self) -> &CacheStats {
        &self.query_cache
    }

    pub(crate) fn record_entity_fetch(&self) {
        self.entity_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_query_execution(&self) {
        self.query_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_session(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy every counter
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            second_level_hits: self.second_level.hits(),
            second_level_misses: self.second_level.misses(),
            second_level_puts: self.second_level.inserts(),
            query_cache_hits: self.query_cache.hits(),
            query_cache_misses: self.query_cache.misses(),
            query_cache_puts: self.query_cache.inserts(),
            entity_fetches: self.entity_fetches.load(Ordering::Relaxed),
            query_executions: self.query_executions.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
        }
    }

    /// Reset every counter
    pub fn reset(&self) {
        self.second_level.reset();
        self.query_cache.reset();
        for counter in [
            &self.entity_fetches,
            &self.query_executions,
            &self.flushes,
            &self.commits,
            &self.rollbacks,
            &self.sessions_opened,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Counters of one region
#[derive(Debug, Clone, PartialEq)]
pub struct RegionStatistics {
    /// Region name
    pub name: String,
    /// What the region holds
    pub kind: RegionKind,
    /// Current number of slots
    pub entries: usize,
    /// Hits
    pub hits: u64,
    /// Misses
    pub misses: u64,
    /// Entries removed by eviction, expiry or invalidation
    pub evictions: u64,
    /// Entries stored
    pub inserts: u64,
}

impl RegionStatistics {
    /// Read the counters of a region
    pub fn of(region: &Region) -> Self {
        let stats = region.stats();
        Self {
            name: region.name().to_string(),
            kind: region.kind(),
            entries: region.len(),
            hits: stats.hits(),
            misses: stats.misses(),
            evictions: stats.evictions(),
            inserts: stats.inserts(),
        }
    }

    /// Hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_basic() {
        let stats = CacheStats::new();

        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_evictions(3);

        assert_eq!(stats.hits(), 2);
        assert_eq!(stats.misses(), 1);
        assert_eq!(stats.evictions(), 3);
        assert_eq!(stats.hit_ratio(), 2.0 / 3.0);
    }

    #[test]
    fn test_stats_reset() {
        let stats = CacheStats::new();

        stats.record_hit();
        stats.record_miss();
        stats.reset();

        assert_eq!(stats.hits(), 0);
        assert_eq!(stats.misses(), 0);
        assert_eq!(stats.hit_ratio(), 0.0);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let stats = Statistics::new();
        stats.second_level().record_hit();
        stats.query_cache().record_miss();
        stats.record_entity_fetch();
        stats.record_commit();

        let snap = stats.snapshot();
        assert_eq!(snap.second_level_hits, 1);
        assert_eq!(snap.query_cache_misses, 1);
        assert_eq!(snap.entity_fetches, 1);
        assert_eq!(snap.commits, 1);

        stats.reset();
        assert_eq!(stats.snapshot(), StatisticsSnapshot::default());
    }
}
