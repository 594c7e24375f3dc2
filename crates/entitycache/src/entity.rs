//! Entity keys, dehydrated state and live instances

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use rowstore::{Id, Value};

use crate::error::{Error, Result};
use crate::metadata::EntityType;

/// (entity type, identifier)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    /// Entity type name
    pub entity: String,
    /// Identifier
    pub id: Id,
}

impl EntityKey {
    /// Build a key
    pub fn new(entity: impl Into<String>, id: Id) -> Self {
        Self {
            entity: entity.into(),
            id,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

/// Cacheable form of an entity: column values plus the ids on the
/// inverse side of each relation, in metamodel order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DehydratedState {
    /// One value per column
    pub values: Vec<Value>,
    /// One id list per relation
    pub relations: Vec<Vec<Id>>,
}

/// Lifecycle of a live instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Not yet persisted
    Transient,
    /// Associated with an open session
    Managed,
    /// Scheduled for deletion
    Removed,
    /// Its session ended
    Detached,
}

pub(crate) struct EntityData {
    entity_type: Arc<EntityType>,
    id: Option<Id>,
    values: Vec<Value>,
    relations: Vec<Vec<Id>>,
    state: EntityState,
}

/// A live entity instance
///
/// Clones share the same instance, which is what the session identity map
/// hands out. Handles are tied to the thread of their session.
#[derive(Clone)]
pub struct EntityHandle(Rc<RefCell<EntityData>>);

impl EntityHandle {
    pub(crate) fn transient(entity_type: Arc<EntityType>) -> Self {
        let columns = entity_type.table().columns().len();
        let relations = entity_type.table().relations().len();
        Self(Rc::new(RefCell::new(EntityData {
            entity_type,
            id: None,
            values: vec![Value::Null; columns],
            relations: vec![Vec::new(); relations],
            state: EntityState::Transient,
        })))
    }

    pub(crate) fn managed(entity_type: Arc<EntityType>, id: Id, state: DehydratedState) -> Self {
        Self(Rc::new(RefCell::new(EntityData {
            entity_type,
            id: Some(id),
            values: state.values,
            relations: state.relations,
            state: EntityState::Managed,
        })))
    }

    /// Entity type name
    pub fn entity_name(&self) -> String {
        self.0.borrow().entity_type.name().to_string()
    }

    pub(crate) fn entity_type(&self) -> Arc<EntityType> {
        self.0.borrow().entity_type.clone()
    }

    /// Identifier, once assigned
    pub fn id(&self) -> Option<Id> {
        self.0.borrow().id
    }

    /// Key, once an identifier is assigned
    pub fn key(&self) -> Option<EntityKey> {
        let data = self.0.borrow();
        data.id.map(|id| EntityKey::new(data.entity_type.name(), id))
    }

    /// Lifecycle state
    pub fn state(&self) -> EntityState {
        self.0.borrow().state
    }

    /// Supply the identifier of an entity with assigned ids
    pub fn set_id(&self, id: Id) -> Result<()> {
        let mut data = self.0.borrow_mut();
        match data.id {
            Some(current) if current != id => Err(Error::ImmutableId(EntityKey::new(
                data.entity_type.name(),
                current,
            ))),
            _ => {
                data.id = Some(id);
                Ok(())
            }
        }
    }

    /// Value of a column
    pub fn get(&self, column: &str) -> Result<Value> {
        let data = self.0.borrow();
        let idx = column_index(&data, column)?;
        Ok(data.values[idx].clone())
    }

    /// Overwrite a column; managed instances are written at the next flush
    pub fn set(&self, column: &str, value: impl Into<Value>) -> Result<()> {
        let mut data = self.0.borrow_mut();
        let idx = column_index(&data, column)?;
        data.values[idx] = value.into();
        Ok(())
    }

    /// Key of the entity a reference column points at
    pub fn reference(&self, column: &str) -> Result<Option<EntityKey>> {
        let data = self.0.borrow();
        let idx = column_index(&data, column)?;
        let target = data.entity_type.table().columns()[idx]
            .target()
            .ok_or_else(|| unknown(&data, column))?;
        Ok(data.values[idx].as_id().map(|id| EntityKey::new(target, id)))
    }

    /// Point a reference column at another instance (or clear it)
    pub fn set_reference(&self, column: &str, target: Option<&EntityHandle>) -> Result<()> {
        let value = match target {
            Some(handle) => {
                let key = handle
                    .key()
                    .ok_or_else(|| Error::NotManaged(format!("{} without id", handle.entity_name())))?;
                Value::from_id(key.id)
            }
            None => Value::Null,
        };
        let mut data = self.0.borrow_mut();
        let idx = column_index(&data, column)?;
        if data.entity_type.table().columns()[idx].target().is_none() {
            return Err(unknown(&data, column));
        }
        data.values[idx] = value;
        Ok(())
    }

    /// Ids on the inverse side of a relation as currently known
    pub fn relation_ids(&self, relation: &str) -> Result<Vec<Id>> {
        let data = self.0.borrow();
        let idx = data
            .entity_type
            .table()
            .relation_index(relation)
            .ok_or_else(|| unknown(&data, relation))?;
        Ok(data.relations[idx].clone())
    }

    /// Whether both handles are the same instance
    pub fn same_instance(&self, other: &EntityHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn values(&self) -> Vec<Value> {
        self.0.borrow().values.clone()
    }

    pub(crate) fn assign(&self, id: Id, state: EntityState) {
        let mut data = self.0.borrow_mut();
        data.id = Some(id);
        data.state = state;
    }

    pub(crate) fn set_state(&self, state: EntityState) {
        self.0.borrow_mut().state = state;
    }

    pub(crate) fn add_related(&self, relation: usize, id: Id) {
        let mut data = self.0.borrow_mut();
        let ids = &mut data.relations[relation];
        if let Err(pos) = ids.binary_search(&id) {
            ids.insert(pos, id);
        }
    }

    pub(crate) fn remove_related(&self, relation: usize, id: Id) {
        self.0.borrow_mut().relations[relation].retain(|other| *other != id);
    }
}

fn column_index(data: &EntityData, column: &str) -> Result<usize> {
    data.entity_type
        .table()
        .column_index(column)
        .ok_or_else(|| unknown(data, column))
}

fn unknown(data: &EntityData, attribute: &str) -> Error {
    Error::UnknownAttribute {
        entity: data.entity_type.name().to_string(),
        attribute: attribute.to_string(),
    }
}

impl fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.0.borrow();
        f.debug_struct("EntityHandle")
            .field("entity", &data.entity_type.name())
            .field("id", &data.id)
            .field("state", &data.state)
            .field("values", &data.values)
            .finish()
    }
}
