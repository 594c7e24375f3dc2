//! Persistence driver
//!
//! The narrow boundary toward the store. A driver hands out transactions;
//! the session owns one for its lifetime and the coordinator decides when
//! it commits.

use rowstore::{Id, Row, RowStore, TableSchema, Value};

use crate::entity::{DehydratedState, EntityKey};
use crate::error::Result;
use crate::metadata::EntityType;

/// Rows returned by a query, dehydrated
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    /// Selected rows in result order
    pub roots: Vec<(EntityKey, DehydratedState)>,
    /// Join-fetched rows
    pub fetched: Vec<(EntityKey, DehydratedState)>,
}

/// Opens store transactions
pub trait PersistenceDriver: Send + Sync {
    /// Start a transaction
    fn begin(&self) -> Result<Box<dyn DriverTransaction>>;
}

/// One store transaction
pub trait DriverTransaction {
    /// Draw a generated identifier
    fn next_id(&self) -> Id;

    /// Read one entity, including the ids of its inverse relations
    fn fetch_by_id(&self, entity_type: &EntityType, id: Id) -> Result<Option<DehydratedState>>;

    /// Run a query with bound parameters
    fn execute_query(&self, text: &str, parameters: &[(String, Value)]) -> Result<QueryRows>;

    /// Stage an insert
    fn insert(&mut self, entity_type: &EntityType, id: Id, values: Vec<Value>) -> Result<()>;

    /// Stage an update
    fn update(&mut self, entity_type: &EntityType, id: Id, values: Vec<Value>) -> Result<()>;

    /// Stage a delete
    fn delete(&mut self, entity_type: &EntityType, id: Id) -> Result<()>;

    /// Apply staged writes
    fn commit(self: Box<Self>) -> Result<()>;

    /// Discard staged writes
    fn rollback(self: Box<Self>);
}

/// Driver over an embedded [`RowStore`]
#[derive(Clone)]
pub struct RowStoreDriver {
    store: RowStore,
}

impl RowStoreDriver {
    /// Wrap an open store
    pub fn new(store: RowStore) -> Self {
        Self { store }
    }

    /// Underlying store
    pub fn store(&self) -> &RowStore {
        &self.store
    }
}

impl PersistenceDriver for RowStoreDriver {
    fn begin(&self) -> Result<Box<dyn DriverTransaction>> {
        Ok(Box::new(RowStoreTransaction {
            tx: self.store.begin()?,
        }))
    }
}

struct RowStoreTransaction {
    tx: rowstore::Transaction,
}

impl RowStoreTransaction {
    fn dehydrate(&self, table: &TableSchema, row: Row) -> Result<(EntityKey, DehydratedState)> {
        let relations = table
            .relations()
            .iter()
            .map(|relation| self.tx.related(table.name(), row.id, &relation.name))
            .collect::<rowstore::Result<Vec<_>>>()?;
        Ok((
            EntityKey::new(table.name(), row.id),
            DehydratedState {
                values: row.values,
                relations,
            },
        ))
    }
}

impl DriverTransaction for RowStoreTransaction {
    fn next_id(&self) -> Id {
        self.tx.next_id()
    }

    fn fetch_by_id(&self, entity_type: &EntityType, id: Id) -> Result<Option<DehydratedState>> {
        match self.tx.get(entity_type.name(), id)? {
            Some(row) => Ok(Some(self.dehydrate(entity_type.table(), row)?.1)),
            None => Ok(None),
        }
    }

    fn execute_query(&self, text: &str, parameters: &[(String, Value)]) -> Result<QueryRows> {
        let output = self.tx.query(text, parameters)?;
        let schema = self.tx.schema();

        let root = schema.require(&output.table)?;
        let roots = output
            .roots
            .into_iter()
            .map(|row| self.dehydrate(root, row))
            .collect::<Result<Vec<_>>>()?;
        let fetched = output
            .fetched
            .into_iter()
            .map(|fetched| self.dehydrate(schema.require(&fetched.table)?, fetched.row))
            .collect::<Result<Vec<_>>>()?;

        Ok(QueryRows { roots, fetched })
    }

    fn insert(&mut self, entity_type: &EntityType, id: Id, values: Vec<Value>) -> Result<()> {
        Ok(self.tx.insert(entity_type.name(), id, values)?)
    }

    fn update(&mut self, entity_type: &EntityType, id: Id, values: Vec<Value>) -> Result<()> {
        Ok(self.tx.update(entity_type.name(), id, values)?)
    }

    fn delete(&mut self, entity_type: &EntityType, id: Id) -> Result<()> {
        Ok(self.tx.delete(entity_type.name(), id)?)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        Ok(self.tx.commit()?)
    }

    fn rollback(self: Box<Self>) {
        self.tx.rollback()
    }
}
