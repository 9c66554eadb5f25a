//! Per-player join data carried by every frame.
//!
//! The map is persistent: a frame copy shares the whole map by reference
//! and an insert clones only the top-level spine, never the records.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::id::PlayerRef;

/// Decoded player payload as submitted by the joining client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimePlayer {
    pub nickname: String,
    pub team: u8,
    pub properties: BTreeMap<String, i64>,
}

impl RuntimePlayer {
    pub fn encode(&self) -> Result<Vec<u8>, bitcode::Error> {
        bitcode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bitcode::Error> {
        bitcode::deserialize(bytes)
    }
}

/// One joined player: connection identity, the raw payload as received,
/// and its decoded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    pub actor_id: i32,
    pub raw: Vec<u8>,
    pub data: RuntimePlayer,
}

impl PlayerRecord {
    /// Decode `raw` into a record. Fails on a malformed payload.
    pub fn from_raw(actor_id: i32, raw: Vec<u8>) -> Result<Self, bitcode::Error> {
        let data = RuntimePlayer::decode(&raw)?;
        Ok(Self { actor_id, raw, data })
    }
}

/// Wire form of a single record; the decoded struct is rebuilt from `raw`.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EncodedPlayer {
    player: PlayerRef,
    actor_id: i32,
    raw: Vec<u8>,
}

/// Copy-on-write map of player index to record.
#[derive(Debug, Clone, Default)]
pub struct PlayerDataMap {
    inner: Arc<BTreeMap<PlayerRef, Arc<PlayerRecord>>>,
}

impl PlayerDataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, player: PlayerRef) -> Option<&PlayerRecord> {
        self.inner.get(&player).map(|r| r.as_ref())
    }

    /// Insert or overwrite a record, returning the previous one.
    pub fn insert(&mut self, player: PlayerRef, record: PlayerRecord) -> Option<Arc<PlayerRecord>> {
        Arc::make_mut(&mut self.inner).insert(player, Arc::new(record))
    }

    pub fn remove(&mut self, player: PlayerRef) -> Option<Arc<PlayerRecord>> {
        if !self.inner.contains_key(&player) {
            return None;
        }
        Arc::make_mut(&mut self.inner).remove(&player)
    }

    pub fn contains(&self, player: PlayerRef) -> bool {
        self.inner.contains_key(&player)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PlayerRef, &PlayerRecord)> {
        self.inner.iter().map(|(&p, r)| (p, r.as_ref()))
    }

    /// True when both maps share the same underlying storage.
    pub fn shares_storage_with(&self, other: &PlayerDataMap) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn encode(&self) -> Vec<EncodedPlayer> {
        self.inner
            .iter()
            .map(|(&player, r)| EncodedPlayer {
                player,
                actor_id: r.actor_id,
                raw: r.raw.clone(),
            })
            .collect()
    }

    pub(crate) fn decode(encoded: Vec<EncodedPlayer>) -> Result<Self, bitcode::Error> {
        let mut map = BTreeMap::new();
        for p in encoded {
            map.insert(p.player, Arc::new(PlayerRecord::from_raw(p.actor_id, p.raw)?));
        }
        Ok(Self {
            inner: Arc::new(map),
        })
    }
}

impl PartialEq for PlayerDataMap {
    fn eq(&self, other: &Self) -> bool {
        self.shares_storage_with(other) || self.inner == other.inner
    }
}

impl Eq for PlayerDataMap {}
