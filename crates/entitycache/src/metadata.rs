//! Entity type metadata
//!
//! Every table of the schema is an entity type. A type opts into the
//! second-level cache by declaring a concurrency strategy.

use std::collections::HashMap;
use std::sync::Arc;

use ahash::RandomState;
use rowstore::{Schema, TableSchema};

use crate::error::{Error, Result};

/// Prefix of entity region names
pub const ENTITY_REGION_PREFIX: &str = "entity.";

/// How cached entity state is kept consistent with the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheConcurrencyStrategy {
    /// Evict on update and delete, never overwrite; tolerate one in-flight
    /// write of staleness
    NonstrictReadWrite,
}

/// Mapping metadata of one entity type
#[derive(Debug, Clone)]
pub struct EntityType {
    table: Arc<TableSchema>,
    strategy: Option<CacheConcurrencyStrategy>,
    region: String,
}

impl EntityType {
    fn new(table: Arc<TableSchema>) -> Self {
        let region = format!("{}{}", ENTITY_REGION_PREFIX, table.name());
        Self {
            table,
            strategy: None,
            region,
        }
    }

    /// Type name
    pub fn name(&self) -> &str {
        self.table.name()
    }

    /// Backing table
    pub fn table(&self) -> &Arc<TableSchema> {
        &self.table
    }

    /// Declared concurrency strategy
    pub fn cache_strategy(&self) -> Option<CacheConcurrencyStrategy> {
        self.strategy
    }

    /// Whether instances go to the second-level cache
    pub fn is_cached(&self) -> bool {
        self.strategy.is_some()
    }

    /// L2 region holding this type
    pub fn region_name(&self) -> &str {
        &self.region
    }
}

/// All entity types known to a coordinator
#[derive(Debug, Clone)]
pub struct Metamodel {
    schema: Schema,
    types: HashMap<String, Arc<EntityType>, RandomState>,
}

impl Metamodel {
    /// One uncached entity type per table
    pub fn new(schema: Schema) -> Self {
        let types = schema
            .tables()
            .map(|table| {
                (
                    table.name().to_string(),
                    Arc::new(EntityType::new(table.clone())),
                )
            })
            .collect();
        Self { schema, types }
    }

    /// Cache an entity type in its default region
    pub fn cache(self, entity: &str, strategy: CacheConcurrencyStrategy) -> Result<Self> {
        let region = format!("{}{}", ENTITY_REGION_PREFIX, entity);
        self.cache_in_region(entity, strategy, region)
    }

    /// Cache an entity type in a named region
    pub fn cache_in_region(
        mut self,
        entity: &str,
        strategy: CacheConcurrencyStrategy,
        region: impl Into<String>,
    ) -> Result<Self> {
        let entity_type = self
            .types
            .get_mut(entity)
            .ok_or_else(|| Error::UnknownEntity(entity.to_string()))?;
        let entity_type = Arc::make_mut(entity_type);
        entity_type.strategy = Some(strategy);
        entity_type.region = region.into();
        Ok(self)
    }

    /// Look up an entity type
    pub fn entity(&self, name: &str) -> Result<&Arc<EntityType>> {
        self.types
            .get(name)
            .ok_or_else(|| Error::UnknownEntity(name.to_string()))
    }

    /// Underlying schema
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Entity types in schema order
    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityType>> {
        self.schema
            .tables()
            .filter_map(move |table| self.types.get(table.name()))
    }
}
