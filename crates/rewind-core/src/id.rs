use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies an entity in a frame's entity registry.
    pub struct EntityRef;
}

/// Index of a player slot in the session (0-based).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PlayerRef(pub u16);

/// Runtime index of a system node. Assigned once when the system graph is
/// built and never changes for the lifetime of the session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SystemId(pub u16);

/// Identifies a component type. Assigned by registration order at init.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ComponentTypeId(pub u16);

/// Local event-type id, stable across all participants of a session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EventTypeId(pub u16);

/// Identifies a dynamic asset created at runtime by simulation logic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DynamicAssetId(pub u32);

impl PlayerRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl SystemId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}
