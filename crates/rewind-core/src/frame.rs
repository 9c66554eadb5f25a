//! The per-tick state container.
//!
//! A [`Frame`] owns everything the simulation can observe or mutate for one
//! tick: a globals block, the entity registry, the player-data map, the
//! enabled-system bitset, a bump heap, and runtime-created assets. Cloning a
//! frame yields a fully independent copy, which is what makes prediction
//! and rollback possible.
//!
//! # Checksum domain
//!
//! The checksum covers the tick number, the globals block and the entity
//! registry, serialized canonically in that order. Heap bytes, player data,
//! dynamic assets and enablement bits are outside of it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::checksum::{ChecksumError, ChecksumSerializer, SharedChecksumSerializer, StateHash};
use crate::component::ComponentRegistry;
use crate::config::SessionConfig;
use crate::entity::EntityRegistry;
use crate::event::{Event, EventType};
use crate::fixed::{Fixed64, Tick, tick_delta};
use crate::heap::FrameHeap;
use crate::id::{DynamicAssetId, PlayerRef, SystemId};
use crate::player::PlayerDataMap;
use crate::rng::SimRng;
use crate::serialize::{self, DeserializeError, SerializeError, SerializeMode};

// ---------------------------------------------------------------------------
// Globals
// ---------------------------------------------------------------------------

/// Scalar simulation state shared by all systems.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Globals {
    pub rng: SimRng,
    pub delta_time: Fixed64,
    /// Simulated time since tick 0.
    pub elapsed: Fixed64,
    pub simulation_rate: i32,
    pub player_count: u16,
}

impl Globals {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            rng: SimRng::new(config.seed),
            delta_time: tick_delta(config.simulation_rate),
            elapsed: Fixed64::ZERO,
            simulation_rate: config.simulation_rate,
            player_count: config.player_count,
        }
    }
}

// ---------------------------------------------------------------------------
// SystemBits
// ---------------------------------------------------------------------------

/// One enabled bit per system, indexed by [`SystemId`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemBits {
    words: Vec<u64>,
    len: u16,
}

impl SystemBits {
    /// All `len` systems enabled.
    pub fn all_enabled(len: usize) -> Self {
        let len = len.min(u16::MAX as usize);
        let mut words = vec![u64::MAX; len.div_ceil(64)];
        if let Some(last) = words.last_mut()
            && len % 64 != 0
        {
            *last = (1u64 << (len % 64)) - 1;
        }
        Self {
            words,
            len: len as u16,
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Out-of-range ids read as disabled.
    pub fn get(&self, id: SystemId) -> bool {
        let i = id.index();
        i < self.len()
            && self
                .words
                .get(i / 64)
                .is_some_and(|w| w & (1 << (i % 64)) != 0)
    }

    /// Returns false if `id` is out of range.
    pub fn set(&mut self, id: SystemId, enabled: bool) -> bool {
        let i = id.index();
        if i >= self.len() {
            return false;
        }
        let Some(word) = self.words.get_mut(i / 64) else {
            return false;
        };
        if enabled {
            *word |= 1 << (i % 64);
        } else {
            *word &= !(1 << (i % 64));
        }
        true
    }

    /// Check a decoded bitset against the number of systems in the graph:
    /// one word per 64 systems and no bits set past the end.
    pub fn validate(&self, system_count: usize) -> Result<(), String> {
        if self.len() != system_count {
            return Err(format!(
                "{} system bits for a graph of {system_count} systems",
                self.len()
            ));
        }
        if self.words.len() != self.len().div_ceil(64) {
            return Err(format!(
                "{} words cannot hold exactly {} system bits",
                self.words.len(),
                self.len()
            ));
        }
        if let Some(&last) = self.words.last()
            && self.len() % 64 != 0
            && last >> (self.len() % 64) != 0
        {
            return Err("bits set past the last system".into());
        }
        Ok(())
    }

    pub fn count_enabled(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

// ---------------------------------------------------------------------------
// Dynamic assets
// ---------------------------------------------------------------------------

/// Assets created by simulation logic at runtime, keyed by a frame-local id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicAssets {
    next_id: u32,
    assets: BTreeMap<DynamicAssetId, Vec<u8>>,
}

impl DynamicAssets {
    pub fn add(&mut self, bytes: Vec<u8>) -> DynamicAssetId {
        let id = DynamicAssetId(self.next_id);
        self.next_id += 1;
        self.assets.insert(id, bytes);
        id
    }

    pub fn get(&self, id: DynamicAssetId) -> Option<&[u8]> {
        self.assets.get(&id).map(Vec::as_slice)
    }

    pub fn replace(&mut self, id: DynamicAssetId, bytes: Vec<u8>) -> Option<Vec<u8>> {
        self.assets.get_mut(&id).map(|slot| std::mem::replace(slot, bytes))
    }

    pub fn remove(&mut self, id: DynamicAssetId) -> Option<Vec<u8>> {
        self.assets.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

// ---------------------------------------------------------------------------
// FrameContext
// ---------------------------------------------------------------------------

/// Session-wide data every frame of a session refers to.
#[derive(Debug)]
pub struct FrameContext {
    components: Arc<ComponentRegistry>,
    shared_checksum: SharedChecksumSerializer,
    heap_capacity: usize,
    compression_level: i32,
    system_count: usize,
}

impl FrameContext {
    pub fn new(
        components: Arc<ComponentRegistry>,
        config: &SessionConfig,
        system_count: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            components,
            shared_checksum: SharedChecksumSerializer::new(config.allow_shared_checksum_serializer),
            heap_capacity: config.heap_capacity,
            compression_level: config.compression_level,
            system_count,
        })
    }

    pub fn components(&self) -> &Arc<ComponentRegistry> {
        &self.components
    }

    pub fn shared_checksum(&self) -> &SharedChecksumSerializer {
        &self.shared_checksum
    }

    pub fn heap_capacity(&self) -> usize {
        self.heap_capacity
    }

    pub fn compression_level(&self) -> i32 {
        self.compression_level
    }

    pub fn system_count(&self) -> usize {
        self.system_count
    }
}

// ---------------------------------------------------------------------------
// ChecksumBreakdown
// ---------------------------------------------------------------------------

/// Per-section checksums of a frame, for locating a desync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumBreakdown {
    pub tick: Tick,
    pub total: u64,
    pub globals: u64,
    pub systems: u64,
    /// `(component name, column checksum)` for every non-empty column.
    pub components: Vec<(String, u64)>,
}

impl ChecksumBreakdown {
    /// Names of sections whose checksums differ between two breakdowns.
    pub fn diff(&self, other: &ChecksumBreakdown) -> Vec<String> {
        let mut out = Vec::new();
        if self.globals != other.globals {
            out.push("globals".to_string());
        }
        if self.systems != other.systems {
            out.push("systems".to_string());
        }
        let theirs: BTreeMap<&str, u64> =
            other.components.iter().map(|(n, h)| (n.as_str(), *h)).collect();
        let ours: BTreeMap<&str, u64> =
            self.components.iter().map(|(n, h)| (n.as_str(), *h)).collect();
        for (name, hash) in &ours {
            if theirs.get(name) != Some(hash) {
                out.push((*name).to_string());
            }
        }
        for name in theirs.keys() {
            if !ours.contains_key(name) {
                out.push((*name).to_string());
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// Complete simulation state for one tick.
#[derive(Debug, Clone)]
pub struct Frame {
    tick: Tick,
    globals: Globals,
    entities: EntityRegistry,
    players: PlayerDataMap,
    systems: SystemBits,
    heap: FrameHeap,
    assets: DynamicAssets,
    inputs: BTreeMap<PlayerRef, Vec<u8>>,
    events: Vec<Event>,
    verified: bool,
    context: Arc<FrameContext>,
}

impl Frame {
    /// A tick-0 frame with every system enabled.
    pub fn new(context: Arc<FrameContext>, globals: Globals) -> Self {
        Self {
            tick: 0,
            globals,
            entities: EntityRegistry::new(Arc::clone(context.components())),
            players: PlayerDataMap::new(),
            systems: SystemBits::all_enabled(context.system_count()),
            heap: FrameHeap::new(context.heap_capacity()),
            assets: DynamicAssets::default(),
            inputs: BTreeMap::new(),
            events: Vec::new(),
            verified: false,
            context,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        context: Arc<FrameContext>,
        tick: Tick,
        globals: Globals,
        entities: EntityRegistry,
        players: PlayerDataMap,
        systems: SystemBits,
        heap: Option<FrameHeap>,
        assets: DynamicAssets,
    ) -> Self {
        let heap = heap.unwrap_or_else(|| FrameHeap::new(context.heap_capacity()));
        Self {
            tick,
            globals,
            entities,
            players,
            systems,
            heap,
            assets,
            inputs: BTreeMap::new(),
            events: Vec::new(),
            verified: false,
            context,
        }
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Whether this frame was computed from authoritative input only.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn context(&self) -> &Arc<FrameContext> {
        &self.context
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    pub fn globals_mut(&mut self) -> &mut Globals {
        &mut self.globals
    }

    pub fn entities(&self) -> &EntityRegistry {
        &self.entities
    }

    pub fn entities_mut(&mut self) -> &mut EntityRegistry {
        &mut self.entities
    }

    pub fn players(&self) -> &PlayerDataMap {
        &self.players
    }

    pub fn players_mut(&mut self) -> &mut PlayerDataMap {
        &mut self.players
    }

    pub fn system_bits(&self) -> &SystemBits {
        &self.systems
    }

    pub(crate) fn system_bits_mut(&mut self) -> &mut SystemBits {
        &mut self.systems
    }

    pub fn heap(&self) -> &FrameHeap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut FrameHeap {
        &mut self.heap
    }

    pub fn assets(&self) -> &DynamicAssets {
        &self.assets
    }

    pub fn assets_mut(&mut self) -> &mut DynamicAssets {
        &mut self.assets
    }

    /// Input bytes applied for `player` on this tick.
    pub fn input(&self, player: PlayerRef) -> Option<&[u8]> {
        self.inputs.get(&player).map(Vec::as_slice)
    }

    pub fn inputs(&self) -> impl Iterator<Item = (PlayerRef, &[u8])> {
        self.inputs.iter().map(|(&p, b)| (p, b.as_slice()))
    }

    // -- Events --

    /// Raise an event on this tick.
    pub fn raise<E: EventType>(&mut self, event: &E) -> Result<(), bitcode::Error> {
        self.events.push(Event::encode(event)?);
        Ok(())
    }

    pub(crate) fn push_event(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Events raised so far on this tick, in raise order.
    pub fn raised_events(&self) -> &[Event] {
        &self.events
    }

    pub(crate) fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    // -- Lifecycle --

    /// Advance to `tick` and install its inputs. Called by the session
    /// before the system graph runs.
    pub(crate) fn begin_tick(
        &mut self,
        tick: Tick,
        inputs: BTreeMap<PlayerRef, Vec<u8>>,
        verified: bool,
    ) {
        debug_assert!(tick > self.tick, "tick {tick} does not advance past {}", self.tick);
        self.tick = tick;
        self.inputs = inputs;
        self.events.clear();
        self.verified = verified;
        self.globals.elapsed += self.globals.delta_time;
    }

    pub(crate) fn set_verified(&mut self, verified: bool) {
        self.verified = verified;
    }

    /// Overwrite this frame with a deep copy of `other`.
    pub fn copy_from(&mut self, other: &Frame) {
        self.clone_from(other);
    }

    // -- Checksum --

    fn feed_checksum(
        &self,
        serializer: &mut ChecksumSerializer,
        hash: &mut StateHash,
    ) -> Result<(), ChecksumError> {
        hash.write_i32(self.tick);
        serializer.feed(hash, &self.globals)?;
        serializer.feed(hash, &self.systems)?;
        self.entities.feed_checksum(serializer, hash)
    }

    /// Deterministic checksum of the frame's checksum domain.
    ///
    /// With `use_shared_serializer` the session-wide scratch buffer is used;
    /// that fails if the session disabled it or another thread is
    /// checksumming concurrently.
    pub fn calculate_checksum(&self, use_shared_serializer: bool) -> Result<u64, ChecksumError> {
        let mut hash = StateHash::new();
        if use_shared_serializer {
            self.context
                .shared_checksum()
                .with(|s| self.feed_checksum(s, &mut hash))??;
        } else {
            self.feed_checksum(&mut ChecksumSerializer::new(), &mut hash)?;
        }
        Ok(hash.finish())
    }

    /// Checksum using the shared serializer when the session allows it.
    pub fn checksum(&self) -> Result<u64, ChecksumError> {
        self.calculate_checksum(self.context.shared_checksum().is_enabled())
    }

    pub fn checksum_breakdown(&self) -> Result<ChecksumBreakdown, ChecksumError> {
        let mut serializer = ChecksumSerializer::new();
        let globals = serializer.hash_of(&self.globals)?;
        let systems = serializer.hash_of(&self.systems)?;
        let components = self
            .entities
            .column_checksums(&mut serializer)?
            .into_iter()
            .map(|(id, h)| {
                let name = self
                    .context
                    .components()
                    .name(id)
                    .map_or_else(|| format!("#{}", id.0), str::to_string);
                (name, h)
            })
            .collect();
        let mut total = StateHash::new();
        self.feed_checksum(&mut serializer, &mut total)?;
        Ok(ChecksumBreakdown {
            tick: self.tick,
            total: total.finish(),
            globals,
            systems,
            components,
        })
    }

    // -- Wire format --

    pub fn serialize(&self, mode: SerializeMode) -> Result<Vec<u8>, SerializeError> {
        serialize::serialize_frame(self, mode)
    }

    /// Rebuild a frame from bytes, rejecting it if the recomputed checksum
    /// disagrees with the header.
    pub fn deserialize(context: Arc<FrameContext>, bytes: &[u8]) -> Result<Frame, DeserializeError> {
        serialize::deserialize_frame(context, bytes)
    }
}
