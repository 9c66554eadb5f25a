//! Component types and their dense column storage.
//!
//! Every component type is registered once (see [`crate::runtime`]) and
//! receives a [`ComponentTypeId`] by registration order. Each type is stored
//! in its own dense [`Column`]: parallel `entities` / `values` vectors plus a
//! sparse index keyed by [`EntityRef`]. Removal swaps the last element into
//! the hole, so column order is a pure function of the operation history.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use slotmap::SecondaryMap;

use crate::checksum::{ChecksumError, ChecksumSerializer, StateHash};
use crate::id::{ComponentTypeId, EntityRef};

/// A plain-data component attached to entities.
///
/// `NAME` must be identical on every participant; it is used for error
/// reporting and registry diagnostics.
pub trait Component: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
}

// ---------------------------------------------------------------------------
// Column
// ---------------------------------------------------------------------------

/// Dense storage for one component type.
#[derive(Clone)]
pub struct Column<T> {
    entities: Vec<EntityRef>,
    values: Vec<T>,
    index: SecondaryMap<EntityRef, u32>,
}

impl<T: Component> Column<T> {
    pub fn new() -> Self {
        Self {
            entities: Vec::new(),
            values: Vec::new(),
            index: SecondaryMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains(&self, entity: EntityRef) -> bool {
        self.index.contains_key(entity)
    }

    /// Insert or replace. Returns the previous value if any.
    pub fn insert(&mut self, entity: EntityRef, value: T) -> Option<T> {
        if let Some(&slot) = self.index.get(entity) {
            return Some(std::mem::replace(&mut self.values[slot as usize], value));
        }
        self.index.insert(entity, self.values.len() as u32);
        self.entities.push(entity);
        self.values.push(value);
        None
    }

    pub fn remove(&mut self, entity: EntityRef) -> Option<T> {
        let slot = self.index.remove(entity)? as usize;
        self.entities.swap_remove(slot);
        let value = self.values.swap_remove(slot);
        if slot < self.entities.len() {
            let moved = self.entities[slot];
            self.index.insert(moved, slot as u32);
        }
        Some(value)
    }

    pub fn get(&self, entity: EntityRef) -> Option<&T> {
        let slot = *self.index.get(entity)?;
        self.values.get(slot as usize)
    }

    pub fn get_mut(&mut self, entity: EntityRef) -> Option<&mut T> {
        let slot = *self.index.get(entity)?;
        self.values.get_mut(slot as usize)
    }

    /// Dense access by position, used to slice work across tasks.
    pub fn at(&self, position: usize) -> Option<(EntityRef, &T)> {
        Some((*self.entities.get(position)?, self.values.get(position)?))
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityRef, &T)> {
        self.entities.iter().copied().zip(self.values.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntityRef, &mut T)> {
        self.entities.iter().copied().zip(self.values.iter_mut())
    }

    fn from_parts(entities: Vec<EntityRef>, values: Vec<T>) -> Result<Self, String> {
        if entities.len() != values.len() {
            return Err(format!(
                "column {} has {} entities but {} values",
                T::NAME,
                entities.len(),
                values.len()
            ));
        }
        let mut index = SecondaryMap::new();
        for (slot, &entity) in entities.iter().enumerate() {
            if index.insert(entity, slot as u32).is_some() || !index.contains_key(entity) {
                return Err(format!("column {} lists {entity:?} twice or as null", T::NAME));
            }
        }
        Ok(Self {
            entities,
            values,
            index,
        })
    }
}

impl<T: Component> Default for Column<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Column<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column")
            .field("len", &self.entities.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Type-erased column
// ---------------------------------------------------------------------------

/// Object-safe view of a [`Column`] used by the entity registry.
pub(crate) trait ErasedColumn: Send + Sync {
    fn len(&self) -> usize;
    fn entity_refs(&self) -> &[EntityRef];
    fn remove_entity(&mut self, entity: EntityRef) -> bool;
    fn clone_box(&self) -> Box<dyn ErasedColumn>;
    fn encode(&self) -> Result<Vec<u8>, bitcode::Error>;
    fn feed_checksum(
        &self,
        serializer: &mut ChecksumSerializer,
        hash: &mut StateHash,
    ) -> Result<(), ChecksumError>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Component> ErasedColumn for Column<T> {
    fn len(&self) -> usize {
        self.values.len()
    }

    fn entity_refs(&self) -> &[EntityRef] {
        &self.entities
    }

    fn remove_entity(&mut self, entity: EntityRef) -> bool {
        self.remove(entity).is_some()
    }

    fn clone_box(&self) -> Box<dyn ErasedColumn> {
        Box::new(self.clone())
    }

    fn encode(&self) -> Result<Vec<u8>, bitcode::Error> {
        bitcode::serialize(&(&self.entities, &self.values))
    }

    fn feed_checksum(
        &self,
        serializer: &mut ChecksumSerializer,
        hash: &mut StateHash,
    ) -> Result<(), ChecksumError> {
        serializer.feed(hash, &(&self.entities, &self.values))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn new_column<T: Component>() -> Box<dyn ErasedColumn> {
    Box::new(Column::<T>::new())
}

fn decode_column<T: Component>(bytes: &[u8]) -> Result<Box<dyn ErasedColumn>, String> {
    let (entities, values): (Vec<EntityRef>, Vec<T>) =
        bitcode::deserialize(bytes).map_err(|e| e.to_string())?;
    Column::from_parts(entities, values).map(|c| Box::new(c) as Box<dyn ErasedColumn>)
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

struct ComponentEntry {
    name: &'static str,
    make: fn() -> Box<dyn ErasedColumn>,
    decode: fn(&[u8]) -> Result<Box<dyn ErasedColumn>, String>,
}

/// Ordered list of every component type known to the process.
///
/// Frozen once handed to [`crate::runtime::init_once`].
#[derive(Default)]
pub struct ComponentRegistry {
    entries: Vec<ComponentEntry>,
    by_type: HashMap<TypeId, ComponentTypeId>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T`, returning its id. Registering twice returns the
    /// existing id.
    pub fn register<T: Component>(&mut self) -> ComponentTypeId {
        if let Some(&id) = self.by_type.get(&TypeId::of::<T>()) {
            return id;
        }
        let id = ComponentTypeId(self.entries.len() as u16);
        self.entries.push(ComponentEntry {
            name: T::NAME,
            make: new_column::<T>,
            decode: decode_column::<T>,
        });
        self.by_type.insert(TypeId::of::<T>(), id);
        id
    }

    pub fn id_of<T: Component>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    pub fn name(&self, id: ComponentTypeId) -> Option<&'static str> {
        self.entries.get(id.0 as usize).map(|e| e.name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn make_column(&self, id: ComponentTypeId) -> Option<Box<dyn ErasedColumn>> {
        self.entries.get(id.0 as usize).map(|e| (e.make)())
    }

    pub(crate) fn decode_column(
        &self,
        id: ComponentTypeId,
        bytes: &[u8],
    ) -> Option<Result<Box<dyn ErasedColumn>, String>> {
        self.entries.get(id.0 as usize).map(|e| (e.decode)(bytes))
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| e.name))
            .finish()
    }
}
