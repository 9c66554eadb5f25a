//! Frame wire format.
//!
//! Uncompressed layout (all integers little-endian):
//!
//! ```text
//! [mode: i32][tick: i32][checksum: u64]
//! [len: u32][players block]
//! [len: u32][state block]
//! [len: u32][dynamic-assets block]
//! ```
//!
//! Blocks are bitcode-encoded. The state block is prefixed with a
//! [`StateHash`] digest of its own encoded bytes, which covers the parts of
//! the state (the heap) that the frame checksum leaves out. The whole layout
//! is then zstd-compressed.
//!
//! Deserialization validates the decoded state, recomputes the checksum of
//! the rebuilt frame and rejects it when it disagrees with the header, then
//! checks the state digest.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::checksum::{ChecksumError, StateHash};
use crate::entity::{EncodedRegistry, EntityRegistry, RegistryDecodeError};
use crate::fixed::Tick;
use crate::frame::{DynamicAssets, Frame, FrameContext, Globals, SystemBits};
use crate::heap::FrameHeap;
use crate::player::{EncodedPlayer, PlayerDataMap};

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 16;

/// Size of the digest that opens the state block.
pub const STATE_DIGEST_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during serialization.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("bitcode encoding of {block} block failed: {reason}")]
    Encode { block: &'static str, reason: String },
    #[error(transparent)]
    Checksum(#[from] ChecksumError),
    #[error("{block} block is {len} bytes, larger than the u32 length prefix allows")]
    BlockTooLarge { block: &'static str, len: usize },
    #[error("compression failed: {0}")]
    Compression(String),
}

/// Errors that can occur during deserialization.
#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    #[error("decompression failed: {0}")]
    Compression(String),
    #[error("truncated frame: need {needed} bytes for the {what}, {available} available")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("{block} block declares {len} bytes but only {remaining} remain")]
    BlockLength {
        block: &'static str,
        len: usize,
        remaining: usize,
    },
    #[error("{0} unexpected bytes after the last block")]
    TrailingBytes(usize),
    #[error("unknown serialize mode {0}")]
    UnknownMode(i32),
    #[error("bitcode decoding of {block} block failed: {reason}")]
    Decode { block: &'static str, reason: String },
    #[error("unknown component type id {0}")]
    UnknownComponent(u16),
    #[error(transparent)]
    Registry(RegistryDecodeError),
    #[error("state block is inconsistent: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Checksum(#[from] ChecksumError),
    #[error("checksum mismatch: header says {expected:#018x}, state hashes to {actual:#018x}")]
    ChecksumMismatch { expected: u64, actual: u64 },
    #[error("state block digest mismatch: block says {expected:#018x}, bytes hash to {actual:#018x}")]
    StateDigestMismatch { expected: u64, actual: u64 },
}

impl From<RegistryDecodeError> for DeserializeError {
    fn from(e: RegistryDecodeError) -> Self {
        match e {
            RegistryDecodeError::UnknownComponent(id) => DeserializeError::UnknownComponent(id),
            other => DeserializeError::Registry(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Mode and header
// ---------------------------------------------------------------------------

/// What a serialized frame contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerializeMode {
    /// Everything needed to resume simulation.
    Full = 0,
    /// Only what the checksum and resimulation of player data need; heap
    /// and dynamic assets are left out.
    Checksum = 1,
}

impl SerializeMode {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(SerializeMode::Full),
            1 => Some(SerializeMode::Checksum),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub mode: i32,
    pub tick: Tick,
    pub checksum: u64,
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StateBlockRef<'a> {
    globals: &'a Globals,
    entities: EncodedRegistry,
    systems: &'a SystemBits,
    heap: Option<&'a FrameHeap>,
}

#[derive(Deserialize)]
struct StateBlock {
    globals: Globals,
    entities: EncodedRegistry,
    systems: SystemBits,
    heap: Option<FrameHeap>,
}

/// A frame split into its framed blocks, uncompressed.
///
/// Useful on its own for inspecting or patching individual blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePayload {
    pub header: FrameHeader,
    pub players: Vec<u8>,
    pub state: Vec<u8>,
    pub assets: Vec<u8>,
}

fn put_block(out: &mut Vec<u8>, block: &[u8]) {
    out.extend_from_slice(&(block.len() as u32).to_le_bytes());
    out.extend_from_slice(block);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], DeserializeError> {
        let available = self.data.len() - self.pos;
        if n > available {
            return Err(DeserializeError::Truncated {
                what,
                needed: n,
                available,
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], DeserializeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    fn block(&mut self, block: &'static str) -> Result<Vec<u8>, DeserializeError> {
        let len = u32::from_le_bytes(self.array(block)?) as usize;
        let remaining = self.data.len() - self.pos;
        if len > remaining {
            return Err(DeserializeError::BlockLength {
                block,
                len,
                remaining,
            });
        }
        Ok(self.take(len, block)?.to_vec())
    }
}

impl FramePayload {
    /// The uncompressed framed layout.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializeError> {
        for (block, bytes) in [
            ("players", &self.players),
            ("state", &self.state),
            ("dynamic-assets", &self.assets),
        ] {
            if bytes.len() > u32::MAX as usize {
                return Err(SerializeError::BlockTooLarge {
                    block,
                    len: bytes.len(),
                });
            }
        }
        let mut out = Vec::with_capacity(
            HEADER_LEN + 12 + self.players.len() + self.state.len() + self.assets.len(),
        );
        out.extend_from_slice(&self.header.mode.to_le_bytes());
        out.extend_from_slice(&self.header.tick.to_le_bytes());
        out.extend_from_slice(&self.header.checksum.to_le_bytes());
        put_block(&mut out, &self.players);
        put_block(&mut out, &self.state);
        put_block(&mut out, &self.assets);
        Ok(out)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DeserializeError> {
        let mut r = Reader { data, pos: 0 };
        let header = FrameHeader {
            mode: i32::from_le_bytes(r.array("header")?),
            tick: i32::from_le_bytes(r.array("header")?),
            checksum: u64::from_le_bytes(r.array("header")?),
        };
        let players = r.block("players")?;
        let state = r.block("state")?;
        let assets = r.block("dynamic-assets")?;
        if r.pos != data.len() {
            return Err(DeserializeError::TrailingBytes(data.len() - r.pos));
        }
        Ok(Self {
            header,
            players,
            state,
            assets,
        })
    }

    pub fn compress(&self, level: i32) -> Result<Vec<u8>, SerializeError> {
        zstd::bulk::compress(&self.to_bytes()?, level)
            .map_err(|e| SerializeError::Compression(e.to_string()))
    }

    pub fn decompress(bytes: &[u8]) -> Result<Self, DeserializeError> {
        let raw =
            zstd::stream::decode_all(bytes).map_err(|e| DeserializeError::Compression(e.to_string()))?;
        Self::from_bytes(&raw)
    }
}

// ---------------------------------------------------------------------------
// Frame <-> bytes
// ---------------------------------------------------------------------------

fn encode<T: Serialize + ?Sized>(block: &'static str, value: &T) -> Result<Vec<u8>, SerializeError> {
    bitcode::serialize(value).map_err(|e| SerializeError::Encode {
        block,
        reason: e.to_string(),
    })
}

fn decode<T: serde::de::DeserializeOwned>(
    block: &'static str,
    bytes: &[u8],
) -> Result<T, DeserializeError> {
    bitcode::deserialize(bytes).map_err(|e| DeserializeError::Decode {
        block,
        reason: e.to_string(),
    })
}

/// Prefix an encoded state body with its digest.
fn seal_state(body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(STATE_DIGEST_LEN + body.len());
    out.extend_from_slice(&StateHash::of(&body).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

/// Split a sealed state block into its recorded digest and body.
fn open_state(block: &[u8]) -> Result<(u64, &[u8]), DeserializeError> {
    if block.len() < STATE_DIGEST_LEN {
        return Err(DeserializeError::Truncated {
            what: "state digest",
            needed: STATE_DIGEST_LEN,
            available: block.len(),
        });
    }
    let (digest, body) = block.split_at(STATE_DIGEST_LEN);
    let mut raw = [0u8; STATE_DIGEST_LEN];
    raw.copy_from_slice(digest);
    Ok((u64::from_le_bytes(raw), body))
}

/// Split a frame into blocks without compressing.
pub fn frame_payload(frame: &Frame, mode: SerializeMode) -> Result<FramePayload, SerializeError> {
    let full = mode == SerializeMode::Full;
    let entities = frame.entities().encode().map_err(|e| SerializeError::Encode {
        block: "state",
        reason: e.to_string(),
    })?;
    let state = StateBlockRef {
        globals: frame.globals(),
        entities,
        systems: frame.system_bits(),
        heap: full.then(|| frame.heap()),
    };
    Ok(FramePayload {
        header: FrameHeader {
            mode: mode as i32,
            tick: frame.tick(),
            checksum: frame.checksum()?,
        },
        players: encode("players", &frame.players().encode())?,
        state: seal_state(encode("state", &state)?),
        assets: if full {
            encode("dynamic-assets", frame.assets())?
        } else {
            Vec::new()
        },
    })
}

pub fn serialize_frame(frame: &Frame, mode: SerializeMode) -> Result<Vec<u8>, SerializeError> {
    let payload = frame_payload(frame, mode)?;
    let bytes = payload.compress(frame.context().compression_level())?;
    log::trace!(
        "serialized frame {} ({:?}): {} state bytes, {} compressed",
        frame.tick(),
        mode,
        payload.state.len(),
        bytes.len()
    );
    Ok(bytes)
}

/// Rebuild a frame from already-decompressed blocks.
pub fn frame_from_payload(
    context: Arc<FrameContext>,
    payload: &FramePayload,
) -> Result<Frame, DeserializeError> {
    let header = payload.header;
    SerializeMode::from_i32(header.mode).ok_or(DeserializeError::UnknownMode(header.mode))?;

    let players_encoded: Vec<EncodedPlayer> = decode("players", &payload.players)?;
    let players = PlayerDataMap::decode(players_encoded).map_err(|e| DeserializeError::Decode {
        block: "players",
        reason: e.to_string(),
    })?;

    let (digest, body) = open_state(&payload.state)?;
    let state: StateBlock = decode("state", body)?;
    state
        .systems
        .validate(context.system_count())
        .map_err(DeserializeError::InvalidState)?;
    if let Some(heap) = &state.heap {
        heap.validate(context.heap_capacity())
            .map_err(DeserializeError::InvalidState)?;
    }
    let entities = EntityRegistry::decode(Arc::clone(context.components()), state.entities)?;

    let assets = if payload.assets.is_empty() {
        DynamicAssets::default()
    } else {
        decode("dynamic-assets", &payload.assets)?
    };

    let frame = Frame::from_parts(
        context,
        header.tick,
        state.globals,
        entities,
        players,
        state.systems,
        state.heap,
        assets,
    );

    let actual = frame.checksum()?;
    if actual != header.checksum {
        log::error!(
            "frame {} failed checksum validation: expected {:#018x}, got {:#018x}",
            header.tick,
            header.checksum,
            actual
        );
        return Err(DeserializeError::ChecksumMismatch {
            expected: header.checksum,
            actual,
        });
    }
    let body_digest = StateHash::of(body);
    if body_digest != digest {
        log::error!(
            "frame {} state block digest mismatch: expected {:#018x}, got {:#018x}",
            header.tick,
            digest,
            body_digest
        );
        return Err(DeserializeError::StateDigestMismatch {
            expected: digest,
            actual: body_digest,
        });
    }
    Ok(frame)
}

pub fn deserialize_frame(context: Arc<FrameContext>, bytes: &[u8]) -> Result<Frame, DeserializeError> {
    let payload = FramePayload::decompress(bytes)?;
    frame_from_payload(context, &payload)
}

// ===========================================================================
// Tests
// ===========================================================================
