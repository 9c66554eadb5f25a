//! Entity registry: entity allocation plus per-type component columns.
//!
//! Entity keys come from a deterministic allocator whose free list is part
//! of the serialized state. A frame rebuilt from bytes therefore hands out
//! exactly the same [`EntityRef`]s as the frame it was captured from.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use slotmap::{Key, KeyData};

use crate::checksum::{ChecksumError, ChecksumSerializer, StateHash};
use crate::component::{Column, Component, ComponentRegistry, ErasedColumn};
use crate::fixed::Tick;
use crate::id::{ComponentTypeId, EntityRef};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntityError {
    #[error("entity {0:?} does not exist")]
    NoSuchEntity(EntityRef),
    #[error("component type {0} was not registered at init")]
    UnregisteredComponent(&'static str),
}

/// Failure decoding a serialized entity registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryDecodeError {
    #[error("unknown component type id {0}")]
    UnknownComponent(u16),
    #[error("component column {id} failed to decode: {reason}")]
    Column { id: u16, reason: String },
    #[error("entity allocator is inconsistent: {0}")]
    Allocator(String),
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

/// Metadata kept for every live entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInfo {
    pub created_at: Tick,
}

/// Generational index allocator with an explicit LIFO free list.
///
/// Versions are always odd while a slot is alive (slotmap's key
/// convention) and bumped by two when the slot is freed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct EntityAllocator {
    versions: Vec<u32>,
    infos: Vec<Option<EntityInfo>>,
    free: Vec<u32>,
    live: u32,
}

impl EntityAllocator {
    fn new() -> Self {
        Self {
            versions: Vec::new(),
            infos: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    fn key(index: u32, version: u32) -> EntityRef {
        EntityRef::from(KeyData::from_ffi(((version as u64) << 32) | index as u64))
    }

    fn split(entity: EntityRef) -> (u32, u32) {
        let ffi = entity.data().as_ffi();
        (ffi as u32, (ffi >> 32) as u32)
    }

    fn create(&mut self, info: EntityInfo) -> EntityRef {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let i = index as usize;
            self.infos[i] = Some(info);
            return Self::key(index, self.versions[i]);
        }
        let index = self.versions.len() as u32;
        self.versions.push(1);
        self.infos.push(Some(info));
        Self::key(index, 1)
    }

    fn contains(&self, entity: EntityRef) -> bool {
        let (index, version) = Self::split(entity);
        let i = index as usize;
        i < self.versions.len() && self.versions[i] == version && self.infos[i].is_some()
    }

    fn info(&self, entity: EntityRef) -> Option<&EntityInfo> {
        if !self.contains(entity) {
            return None;
        }
        self.infos[Self::split(entity).0 as usize].as_ref()
    }

    fn destroy(&mut self, entity: EntityRef) -> bool {
        if !self.contains(entity) {
            return false;
        }
        let (index, _) = Self::split(entity);
        let i = index as usize;
        self.infos[i] = None;
        self.versions[i] = self.versions[i].wrapping_add(2);
        self.free.push(index);
        self.live -= 1;
        true
    }

    fn iter(&self) -> impl Iterator<Item = (EntityRef, &EntityInfo)> {
        self.infos.iter().enumerate().filter_map(|(i, info)| {
            info.as_ref()
                .map(|info| (Self::key(i as u32, self.versions[i]), info))
        })
    }

    fn validate(&self) -> Result<(), RegistryDecodeError> {
        if self.versions.len() != self.infos.len() {
            return Err(RegistryDecodeError::Allocator(
                "version and info tables differ in length".into(),
            ));
        }
        let live = self.infos.iter().filter(|i| i.is_some()).count();
        if live != self.live as usize || live + self.free.len() != self.infos.len() {
            return Err(RegistryDecodeError::Allocator(format!(
                "{live} live + {} free != {} slots",
                self.free.len(),
                self.infos.len()
            )));
        }
        if let Some(i) = self.versions.iter().position(|v| v % 2 == 0) {
            return Err(RegistryDecodeError::Allocator(format!(
                "slot {i} carries even version {}",
                self.versions[i]
            )));
        }
        let mut seen = vec![false; self.infos.len()];
        for &index in &self.free {
            let i = index as usize;
            match self.infos.get(i) {
                None => {
                    return Err(RegistryDecodeError::Allocator(format!(
                        "free slot {index} out of range for {} slots",
                        self.infos.len()
                    )));
                }
                Some(Some(_)) => {
                    return Err(RegistryDecodeError::Allocator(format!(
                        "free slot {index} holds a live entity"
                    )));
                }
                Some(None) if seen[i] => {
                    return Err(RegistryDecodeError::Allocator(format!(
                        "free slot {index} listed twice"
                    )));
                }
                Some(None) => seen[i] = true,
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EntityRegistry
// ---------------------------------------------------------------------------

/// Serialized form of an [`EntityRegistry`]: the allocator plus one encoded
/// column per non-empty component type, in type-id order.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EncodedRegistry {
    allocator: EntityAllocator,
    columns: Vec<(ComponentTypeId, Vec<u8>)>,
}

/// All entities of a frame and their components.
pub struct EntityRegistry {
    types: Arc<ComponentRegistry>,
    allocator: EntityAllocator,
    columns: Vec<Option<Box<dyn ErasedColumn>>>,
}

impl EntityRegistry {
    pub fn new(types: Arc<ComponentRegistry>) -> Self {
        Self {
            types,
            allocator: EntityAllocator::new(),
            columns: Vec::new(),
        }
    }

    pub fn component_types(&self) -> &Arc<ComponentRegistry> {
        &self.types
    }

    // -- Entities --

    pub fn create(&mut self, tick: Tick) -> EntityRef {
        self.allocator.create(EntityInfo { created_at: tick })
    }

    /// Destroy an entity and drop all of its components.
    pub fn destroy(&mut self, entity: EntityRef) -> bool {
        if !self.allocator.destroy(entity) {
            return false;
        }
        for column in self.columns.iter_mut().flatten() {
            column.remove_entity(entity);
        }
        true
    }

    pub fn exists(&self, entity: EntityRef) -> bool {
        self.allocator.contains(entity)
    }

    pub fn info(&self, entity: EntityRef) -> Option<&EntityInfo> {
        self.allocator.info(entity)
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.allocator.live as usize
    }

    pub fn is_empty(&self) -> bool {
        self.allocator.live == 0
    }

    pub fn entities(&self) -> impl Iterator<Item = EntityRef> + '_ {
        self.allocator.iter().map(|(e, _)| e)
    }

    // -- Components --

    fn type_id<T: Component>(&self) -> Result<ComponentTypeId, EntityError> {
        self.types
            .id_of::<T>()
            .ok_or(EntityError::UnregisteredComponent(T::NAME))
    }

    fn column<T: Component>(&self) -> Option<&Column<T>> {
        let id = self.types.id_of::<T>()?;
        self.columns
            .get(id.0 as usize)?
            .as_ref()?
            .as_any()
            .downcast_ref::<Column<T>>()
    }

    fn column_mut<T: Component>(&mut self) -> Option<&mut Column<T>> {
        let id = self.types.id_of::<T>()?;
        self.columns
            .get_mut(id.0 as usize)?
            .as_mut()?
            .as_any_mut()
            .downcast_mut::<Column<T>>()
    }

    fn column_or_create<T: Component>(&mut self) -> Result<&mut Column<T>, EntityError> {
        let id = self.type_id::<T>()?;
        let slot = id.0 as usize;
        if self.columns.len() <= slot {
            self.columns.resize_with(slot + 1, || None);
        }
        if self.columns[slot].is_none() {
            self.columns[slot] = self.types.make_column(id);
        }
        self.columns[slot]
            .as_mut()
            .and_then(|c| c.as_any_mut().downcast_mut::<Column<T>>())
            .ok_or(EntityError::UnregisteredComponent(T::NAME))
    }

    /// Attach or replace a component. Returns the previous value.
    pub fn set<T: Component>(&mut self, entity: EntityRef, value: T) -> Result<Option<T>, EntityError> {
        if !self.exists(entity) {
            return Err(EntityError::NoSuchEntity(entity));
        }
        Ok(self.column_or_create::<T>()?.insert(entity, value))
    }

    pub fn get<T: Component>(&self, entity: EntityRef) -> Option<&T> {
        self.column::<T>()?.get(entity)
    }

    pub fn get_mut<T: Component>(&mut self, entity: EntityRef) -> Option<&mut T> {
        self.column_mut::<T>()?.get_mut(entity)
    }

    pub fn has<T: Component>(&self, entity: EntityRef) -> bool {
        self.column::<T>().is_some_and(|c| c.contains(entity))
    }

    pub fn remove<T: Component>(&mut self, entity: EntityRef) -> Option<T> {
        self.column_mut::<T>()?.remove(entity)
    }

    /// Number of entities carrying `T`.
    pub fn count<T: Component>(&self) -> usize {
        self.column::<T>().map_or(0, |c| c.len())
    }

    /// Dense positional access; positions `0..count::<T>()` are valid.
    pub fn component_at<T: Component>(&self, position: usize) -> Option<(EntityRef, &T)> {
        self.column::<T>()?.at(position)
    }

    pub fn iter<T: Component>(&self) -> impl Iterator<Item = (EntityRef, &T)> {
        self.column::<T>().into_iter().flat_map(|c| c.iter())
    }

    pub fn iter_mut<T: Component>(&mut self) -> impl Iterator<Item = (EntityRef, &mut T)> {
        self.column_mut::<T>().into_iter().flat_map(|c| c.iter_mut())
    }

    // -- Serialization --

    fn non_empty_columns(&self) -> impl Iterator<Item = (ComponentTypeId, &dyn ErasedColumn)> {
        self.columns.iter().enumerate().filter_map(|(i, c)| {
            c.as_deref()
                .filter(|c| c.len() > 0)
                .map(|c| (ComponentTypeId(i as u16), c))
        })
    }

    pub(crate) fn encode(&self) -> Result<EncodedRegistry, bitcode::Error> {
        let mut columns = Vec::new();
        for (id, column) in self.non_empty_columns() {
            columns.push((id, column.encode()?));
        }
        Ok(EncodedRegistry {
            allocator: self.allocator.clone(),
            columns,
        })
    }

    pub(crate) fn decode(
        types: Arc<ComponentRegistry>,
        encoded: EncodedRegistry,
    ) -> Result<Self, RegistryDecodeError> {
        encoded.allocator.validate()?;
        let mut columns: Vec<Option<Box<dyn ErasedColumn>>> = Vec::new();
        for (id, bytes) in encoded.columns {
            let column = types
                .decode_column(id, &bytes)
                .ok_or(RegistryDecodeError::UnknownComponent(id.0))?
                .map_err(|reason| RegistryDecodeError::Column { id: id.0, reason })?;
            if let Some(&dead) = column
                .entity_refs()
                .iter()
                .find(|&&e| !encoded.allocator.contains(e))
            {
                return Err(RegistryDecodeError::Column {
                    id: id.0,
                    reason: format!("component attached to dead entity {dead:?}"),
                });
            }
            let slot = id.0 as usize;
            if columns.len() <= slot {
                columns.resize_with(slot + 1, || None);
            }
            if columns[slot].is_some() {
                return Err(RegistryDecodeError::Column {
                    id: id.0,
                    reason: "column encoded twice".into(),
                });
            }
            columns[slot] = Some(column);
        }
        Ok(Self {
            types,
            allocator: encoded.allocator,
            columns,
        })
    }

    /// Feed the allocator and every non-empty column, in type-id order,
    /// into the checksum stream.
    pub(crate) fn feed_checksum(
        &self,
        serializer: &mut ChecksumSerializer,
        hash: &mut StateHash,
    ) -> Result<(), ChecksumError> {
        serializer.feed(hash, &self.allocator)?;
        for (id, column) in self.non_empty_columns() {
            hash.write_u32(id.0 as u32);
            column.feed_checksum(serializer, hash)?;
        }
        Ok(())
    }

    /// Checksum of each non-empty column on its own, for desync forensics.
    pub(crate) fn column_checksums(
        &self,
        serializer: &mut ChecksumSerializer,
    ) -> Result<Vec<(ComponentTypeId, u64)>, ChecksumError> {
        let mut out = Vec::new();
        for (id, column) in self.non_empty_columns() {
            let mut h = StateHash::new();
            column.feed_checksum(serializer, &mut h)?;
            out.push((id, h.finish()));
        }
        Ok(out)
    }
}

impl Clone for EntityRegistry {
    fn clone(&self) -> Self {
        Self {
            types: Arc::clone(&self.types),
            allocator: self.allocator.clone(),
            columns: self
                .columns
                .iter()
                .map(|c| c.as_ref().map(|c| c.clone_box()))
                .collect(),
        }
    }
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("live", &self.allocator.live)
            .field("slots", &self.allocator.infos.len())
            .field("columns", &self.non_empty_columns().count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Position, Velocity, component_types};

    fn registry() -> EntityRegistry {
        EntityRegistry::new(component_types())
    }

    #[test]
    fn create_set_get() {
        let mut reg = registry();
        let e = reg.create(0);
        reg.set(e, Position { x: 1, y: 2 }).unwrap();
        assert_eq!(reg.get::<Position>(e), Some(&Position { x: 1, y: 2 }));
        assert!(reg.has::<Position>(e));
        assert!(!reg.has::<Velocity>(e));
        assert_eq!(reg.count::<Position>(), 1);
    }

    #[test]
    fn set_on_missing_entity_fails() {
        let mut reg = registry();
        let e = reg.create(0);
        reg.destroy(e);
        assert_eq!(
            reg.set(e, Position { x: 0, y: 0 }),
            Err(EntityError::NoSuchEntity(e))
        );
    }

    #[test]
    fn destroy_removes_components_and_recycles_slot() {
        let mut reg = registry();
        let a = reg.create(0);
        reg.set(a, Velocity { dx: 1, dy: 1 }).unwrap();
        assert!(reg.destroy(a));
        assert!(!reg.exists(a));
        assert_eq!(reg.count::<Velocity>(), 0);

        let b = reg.create(1);
        assert_ne!(a, b, "recycled slot must carry a new version");
        assert!(reg.exists(b));
        assert!(!reg.destroy(a));
    }

    #[test]
    fn decoded_registry_allocates_identically() {
        let mut reg = registry();
        let es: Vec<_> = (0..6).map(|t| reg.create(t)).collect();
        reg.destroy(es[4]);
        reg.destroy(es[1]);
        reg.destroy(es[3]);
        reg.set(es[0], Position { x: 5, y: 6 }).unwrap();

        let encoded = reg.encode().unwrap();
        let bytes = bitcode::serialize(&encoded).unwrap();
        let mut restored =
            EntityRegistry::decode(component_types(), bitcode::deserialize(&bytes).unwrap()).unwrap();

        for t in 10..14 {
            assert_eq!(reg.create(t), restored.create(t));
        }
        assert_eq!(
            restored.get::<Position>(es[0]),
            Some(&Position { x: 5, y: 6 })
        );
    }

    fn decode_allocator(
        versions: Vec<u32>,
        infos: Vec<Option<EntityInfo>>,
        free: Vec<u32>,
    ) -> Result<EntityRegistry, RegistryDecodeError> {
        let live = infos.iter().filter(|i| i.is_some()).count() as u32;
        let encoded = EncodedRegistry {
            allocator: EntityAllocator {
                versions,
                infos,
                free,
                live,
            },
            columns: Vec::new(),
        };
        EntityRegistry::decode(component_types(), encoded)
    }

    fn alive() -> Option<EntityInfo> {
        Some(EntityInfo { created_at: 0 })
    }

    #[test]
    fn decode_rejects_broken_free_list() {
        let cases = [
            (vec![1], vec![None], vec![5]),
            (vec![1, 1], vec![None, alive()], vec![1]),
            (vec![1, 3], vec![None, None], vec![0, 0]),
            (vec![2], vec![alive()], vec![]),
        ];
        for (versions, infos, free) in cases {
            let label = format!("{versions:?} {free:?}");
            assert!(
                matches!(
                    decode_allocator(versions, infos, free),
                    Err(RegistryDecodeError::Allocator(_))
                ),
                "{label} was accepted"
            );
        }

        let mut reg = decode_allocator(vec![1, 3], vec![alive(), None], vec![1]).unwrap();
        let e = reg.create(4);
        assert!(reg.exists(e));
    }

    #[test]
    fn decode_rejects_components_on_dead_or_repeated_entities() {
        let mut reg = registry();
        let a = reg.create(0);
        let b = reg.create(0);
        reg.set(a, Position { x: 1, y: 1 }).unwrap();
        reg.set(b, Position { x: 2, y: 2 }).unwrap();
        let mut encoded = reg.encode().unwrap();
        let (id, _) = encoded.columns[0];

        let twice = bitcode::serialize(&(vec![a, a], vec![Position { x: 1, y: 1 }; 2])).unwrap();
        encoded.columns[0] = (id, twice);
        assert!(matches!(
            EntityRegistry::decode(component_types(), encoded),
            Err(RegistryDecodeError::Column { .. })
        ));

        let mut encoded = reg.encode().unwrap();
        let ghost = EntityAllocator::key(7, 1);
        let bytes = bitcode::serialize(&(vec![ghost], vec![Position { x: 0, y: 0 }])).unwrap();
        encoded.columns[0] = (id, bytes);
        assert!(matches!(
            EntityRegistry::decode(component_types(), encoded),
            Err(RegistryDecodeError::Column { .. })
        ));

        let mut encoded = reg.encode().unwrap();
        let first = encoded.columns[0].clone();
        encoded.columns.push(first);
        assert!(matches!(
            EntityRegistry::decode(component_types(), encoded),
            Err(RegistryDecodeError::Column { .. })
        ));
    }

    #[test]
    fn checksum_ignores_empty_columns() {
        let mut a = registry();
        let mut b = registry();
        let ea = a.create(0);
        let eb = b.create(0);
        a.set(ea, Velocity { dx: 0, dy: 0 }).unwrap();
        a.remove::<Velocity>(ea);
        assert_eq!(ea, eb);

        let mut ser = ChecksumSerializer::new();
        let mut ha = StateHash::new();
        let mut hb = StateHash::new();
        a.feed_checksum(&mut ser, &mut ha).unwrap();
        b.feed_checksum(&mut ser, &mut hb).unwrap();
        assert_eq!(ha.finish(), hb.finish());
    }

    #[test]
    fn iteration_follows_column_order() {
        let mut reg = registry();
        let es: Vec<_> = (0..3).map(|t| reg.create(t)).collect();
        for (i, &e) in es.iter().enumerate() {
            reg.set(e, Position { x: i as i32, y: 0 }).unwrap();
        }
        for (_, p) in reg.iter_mut::<Position>() {
            p.y = p.x * 10;
        }
        let ys: Vec<i32> = reg.iter::<Position>().map(|(_, p)| p.y).collect();
        assert_eq!(ys, vec![0, 10, 20]);
        assert_eq!(reg.component_at::<Position>(2).map(|(e, _)| e), Some(es[2]));
    }
}
