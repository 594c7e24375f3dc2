//! # entitycache
//!
//! Two-level entity cache in front of rowstore.
//!
//! ## Architecture
//! - **Session (L1)**: per unit of work identity map, buffers writes until flush
//! - **Entity cache (L2)**: shared regions of dehydrated state keyed by type and id
//! - **Query cache**: query fingerprint to entity keys, validated against update timestamps
//! - **Update timestamps**: per type logical time of the last committed write
//! - **Coordinator**: read path L1 → L2 → store, commit protocol with soft locks
//!
//! ## Concurrency strategy
//! Entity regions use nonstrict read-write: a write evicts the cached entry
//! instead of overwriting it, and readers never block on writers.
//!
//! ```no_run
//! use std::sync::Arc;
//! use entitycache::{CacheConcurrencyStrategy, CacheCoordinator, Metamodel, RowStoreDriver, Settings};
//! use rowstore::{Column, IdGeneration, RowStore, Schema, TableSchema};
//!
//! # fn main() -> entitycache::Result<()> {
//! let schema = Schema::new(vec![TableSchema::new("Post")
//!     .id_generation(IdGeneration::Sequence)
//!     .column(Column::text("name"))])?;
//! let store = RowStore::open("./data", schema.clone())?;
//! let metamodel = Metamodel::new(schema).cache("Post", CacheConcurrencyStrategy::NonstrictReadWrite)?;
//! let coordinator = CacheCoordinator::new(
//!     Settings::default().with_query_cache(true),
//!     metamodel,
//!     Arc::new(RowStoreDriver::new(store)),
//! )?;
//!
//! let mut session = coordinator.open_session()?;
//! let post = session.instantiate("Post")?;
//! post.set("name", "Hibernate Master Class")?;
//! let key = session.persist(&post)?;
//! session.commit()?;
//!
//! // Served from the entity cache
//! let mut session = coordinator.open_session()?;
//! let post = session.load("Post", key.id)?;
//! assert_eq!(post.get("name")?.as_str(), Some("Hibernate Master Class"));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
mod coordinator;
mod driver;
mod entity;
mod entity_cache;
mod error;
mod lru;
pub mod metadata;
mod query;
mod query_cache;
pub mod region;
mod session;
mod stats;
mod timestamps;

pub use config::{RegionConfig, Settings};
pub use coordinator::{CacheCoordinator, QUERY_RESULTS_REGION, UPDATE_TIMESTAMPS_REGION};
pub use driver::{DriverTransaction, PersistenceDriver, QueryRows, RowStoreDriver};
pub use entity::{DehydratedState, EntityHandle, EntityKey, EntityState};
pub use entity_cache::EntityCache;
pub use error::{CacheError, Error, Result};
pub use metadata::{CacheConcurrencyStrategy, EntityType, Metamodel};
pub use query::Query;
pub use query_cache::{QueryCache, QueryKey, QueryResultEntry};
pub use region::{
    CacheValue, LockMode, LockOutcome, LockToken, LruRegionFactory, NoCachingRegionFactory, Region,
    RegionFactory, RegionKey, RegionKind, RegionStorage, RegionStore, Slot, SoftLock,
};
pub use session::Session;
pub use stats::{CacheStats, RegionStatistics, Statistics, StatisticsSnapshot};
pub use timestamps::{Timestamp, TimestampEntry, Timestamper, UpdateTimestamps};
