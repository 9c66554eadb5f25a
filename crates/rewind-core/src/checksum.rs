//! Frame checksum accumulation.
//!
//! Checksums are computed by *serializing* state through a canonical,
//! order-preserving byte encoding and folding the bytes into a 64-bit
//! FNV-1a hash. Nothing is formatted as text, so the result depends only on
//! the values and their declaration order.
//!
//! A [`SharedChecksumSerializer`] lets a session reuse one scratch buffer
//! for every checksum it computes. It is **not** safe to use from two
//! threads at once: concurrent use is reported as an error instead of
//! blocking.

use std::sync::{Mutex, TryLockError};

use serde::Serialize;
use serde::ser::{self, SerializeMap, SerializeSeq, SerializeStruct, SerializeTuple};

// ---------------------------------------------------------------------------
// State hash
// ---------------------------------------------------------------------------

/// Deterministic FNV-1a (64-bit) accumulator. Not cryptographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHash(pub u64);

impl StateHash {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    pub fn new() -> Self {
        Self(Self::FNV_OFFSET)
    }

    /// Feed bytes into the hash.
    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write(&v.to_le_bytes());
    }

    pub fn finish(self) -> u64 {
        self.0
    }

    /// One-shot hash of a byte slice.
    pub fn of(bytes: &[u8]) -> u64 {
        let mut h = Self::new();
        h.write(bytes);
        h.finish()
    }
}

impl Default for StateHash {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChecksumError {
    /// A value refused to serialize into the checksum stream.
    #[error("checksum serialization failed: {0}")]
    Serialize(String),
    #[error("shared checksum serializer is disabled for this session")]
    SharedDisabled,
    #[error("shared checksum serializer used concurrently from two threads")]
    SharedBusy,
}

impl ser::Error for ChecksumError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        ChecksumError::Serialize(msg.to_string())
    }
}

// ---------------------------------------------------------------------------
// Canonical encoder
// ---------------------------------------------------------------------------

/// Serde serializer producing a canonical little-endian byte stream.
///
/// Field names are never written; struct fields contribute in declaration
/// order, enum variants by index, and every sequence or map is suffixed
/// with its element count.
#[derive(Debug, Default)]
pub struct CanonicalEncoder {
    out: Vec<u8>,
}

impl CanonicalEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.out
    }

    pub fn clear(&mut self) {
        self.out.clear();
    }

    /// Bytes currently reserved by the scratch buffer.
    pub fn capacity(&self) -> usize {
        self.out.capacity()
    }

    fn put(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    fn put_len(&mut self, len: usize) {
        self.put(&(len as u64).to_le_bytes());
    }
}

#[doc(hidden)]
pub struct Compound<'s> {
    enc: &'s mut CanonicalEncoder,
    count: usize,
}

impl Compound<'_> {
    fn finish_counted(self) -> Result<(), ChecksumError> {
        self.enc.put_len(self.count);
        Ok(())
    }
}

impl<'s> ser::Serializer for &'s mut CanonicalEncoder {
    type Ok = ();
    type Error = ChecksumError;
    type SerializeSeq = Compound<'s>;
    type SerializeTuple = Compound<'s>;
    type SerializeTupleStruct = Compound<'s>;
    type SerializeTupleVariant = Compound<'s>;
    type SerializeMap = Compound<'s>;
    type SerializeStruct = Compound<'s>;
    type SerializeStructVariant = Compound<'s>;

    fn serialize_bool(self, v: bool) -> Result<(), ChecksumError> {
        self.put(&[v as u8]);
        Ok(())
    }
    fn serialize_i8(self, v: i8) -> Result<(), ChecksumError> {
        self.put(&v.to_le_bytes());
        Ok(())
    }
    fn serialize_i16(self, v: i16) -> Result<(), ChecksumError> {
        self.put(&v.to_le_bytes());
        Ok(())
    }
    fn serialize_i32(self, v: i32) -> Result<(), ChecksumError> {
        self.put(&v.to_le_bytes());
        Ok(())
    }
    fn serialize_i64(self, v: i64) -> Result<(), ChecksumError> {
        self.put(&v.to_le_bytes());
        Ok(())
    }
    fn serialize_i128(self, v: i128) -> Result<(), ChecksumError> {
        self.put(&v.to_le_bytes());
        Ok(())
    }
    fn serialize_u8(self, v: u8) -> Result<(), ChecksumError> {
        self.put(&[v]);
        Ok(())
    }
    fn serialize_u16(self, v: u16) -> Result<(), ChecksumError> {
        self.put(&v.to_le_bytes());
        Ok(())
    }
    fn serialize_u32(self, v: u32) -> Result<(), ChecksumError> {
        self.put(&v.to_le_bytes());
        Ok(())
    }
    fn serialize_u64(self, v: u64) -> Result<(), ChecksumError> {
        self.put(&v.to_le_bytes());
        Ok(())
    }
    fn serialize_u128(self, v: u128) -> Result<(), ChecksumError> {
        self.put(&v.to_le_bytes());
        Ok(())
    }
    fn serialize_f32(self, v: f32) -> Result<(), ChecksumError> {
        self.put(&v.to_bits().to_le_bytes());
        Ok(())
    }
    fn serialize_f64(self, v: f64) -> Result<(), ChecksumError> {
        self.put(&v.to_bits().to_le_bytes());
        Ok(())
    }
    fn serialize_char(self, v: char) -> Result<(), ChecksumError> {
        self.put(&(v as u32).to_le_bytes());
        Ok(())
    }
    fn serialize_str(self, v: &str) -> Result<(), ChecksumError> {
        self.put_len(v.len());
        self.put(v.as_bytes());
        Ok(())
    }
    fn serialize_bytes(self, v: &[u8]) -> Result<(), ChecksumError> {
        self.put_len(v.len());
        self.put(v);
        Ok(())
    }
    fn serialize_none(self) -> Result<(), ChecksumError> {
        self.put(&[0]);
        Ok(())
    }
    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<(), ChecksumError> {
        self.put(&[1]);
        value.serialize(self)
    }
    fn serialize_unit(self) -> Result<(), ChecksumError> {
        Ok(())
    }
    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), ChecksumError> {
        Ok(())
    }
    fn serialize_unit_variant(
        self,
        _name: &'static str,
        variant_index: u32,
        _variant: &'static str,
    ) -> Result<(), ChecksumError> {
        self.put(&variant_index.to_le_bytes());
        Ok(())
    }
    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<(), ChecksumError> {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        variant_index: u32,
        _variant: &'static str,
        value: &T,
    ) -> Result<(), ChecksumError> {
        self.put(&variant_index.to_le_bytes());
        value.serialize(self)
    }
    fn serialize_seq(self, _len: Option<usize>) -> Result<Compound<'s>, ChecksumError> {
        Ok(Compound { enc: self, count: 0 })
    }
    fn serialize_tuple(self, _len: usize) -> Result<Compound<'s>, ChecksumError> {
        Ok(Compound { enc: self, count: 0 })
    }
    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Compound<'s>, ChecksumError> {
        Ok(Compound { enc: self, count: 0 })
    }
    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Compound<'s>, ChecksumError> {
        self.put(&variant_index.to_le_bytes());
        Ok(Compound { enc: self, count: 0 })
    }
    fn serialize_map(self, _len: Option<usize>) -> Result<Compound<'s>, ChecksumError> {
        Ok(Compound { enc: self, count: 0 })
    }
    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Compound<'s>, ChecksumError> {
        Ok(Compound { enc: self, count: 0 })
    }
    fn serialize_struct_variant(
        self,
        _name: &'static str,
        variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Compound<'s>, ChecksumError> {
        self.put(&variant_index.to_le_bytes());
        Ok(Compound { enc: self, count: 0 })
    }

    fn is_human_readable(&self) -> bool {
        false
    }
}

impl SerializeSeq for Compound<'_> {
    type Ok = ();
    type Error = ChecksumError;
    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), ChecksumError> {
        self.count += 1;
        value.serialize(&mut *self.enc)
    }
    fn end(self) -> Result<(), ChecksumError> {
        self.finish_counted()
    }
}

impl SerializeTuple for Compound<'_> {
    type Ok = ();
    type Error = ChecksumError;
    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), ChecksumError> {
        value.serialize(&mut *self.enc)
    }
    fn end(self) -> Result<(), ChecksumError> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for Compound<'_> {
    type Ok = ();
    type Error = ChecksumError;
    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), ChecksumError> {
        value.serialize(&mut *self.enc)
    }
    fn end(self) -> Result<(), ChecksumError> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for Compound<'_> {
    type Ok = ();
    type Error = ChecksumError;
    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), ChecksumError> {
        value.serialize(&mut *self.enc)
    }
    fn end(self) -> Result<(), ChecksumError> {
        Ok(())
    }
}

impl SerializeMap for Compound<'_> {
    type Ok = ();
    type Error = ChecksumError;
    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), ChecksumError> {
        self.count += 1;
        key.serialize(&mut *self.enc)
    }
    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), ChecksumError> {
        value.serialize(&mut *self.enc)
    }
    fn end(self) -> Result<(), ChecksumError> {
        self.finish_counted()
    }
}

impl SerializeStruct for Compound<'_> {
    type Ok = ();
    type Error = ChecksumError;
    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<(), ChecksumError> {
        value.serialize(&mut *self.enc)
    }
    fn end(self) -> Result<(), ChecksumError> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for Compound<'_> {
    type Ok = ();
    type Error = ChecksumError;
    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<(), ChecksumError> {
        value.serialize(&mut *self.enc)
    }
    fn end(self) -> Result<(), ChecksumError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Checksum serializer
// ---------------------------------------------------------------------------

/// Serializes values through the canonical encoder and folds the bytes into
/// a [`StateHash`]. Owns a scratch buffer that is reused between values.
#[derive(Debug, Default)]
pub struct ChecksumSerializer {
    encoder: CanonicalEncoder,
}

impl ChecksumSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize `value` and feed its canonical bytes into `hash`.
    pub fn feed<T: ?Sized + Serialize>(
        &mut self,
        hash: &mut StateHash,
        value: &T,
    ) -> Result<(), ChecksumError> {
        self.encoder.clear();
        value.serialize(&mut self.encoder)?;
        hash.write(self.encoder.bytes());
        Ok(())
    }

    /// Canonical hash of a single value.
    pub fn hash_of<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<u64, ChecksumError> {
        let mut h = StateHash::new();
        self.feed(&mut h, value)?;
        Ok(h.finish())
    }

    pub fn scratch_capacity(&self) -> usize {
        self.encoder.capacity()
    }
}

/// A session-wide [`ChecksumSerializer`] reused across checksum calls.
///
/// Single-threaded discipline is checked: a second concurrent user gets
/// [`ChecksumError::SharedBusy`] rather than waiting. Sessions that checksum from several threads must
/// construct this with `enabled = false` and use per-call serializers.
#[derive(Debug)]
pub struct SharedChecksumSerializer {
    enabled: bool,
    inner: Mutex<ChecksumSerializer>,
}

impl SharedChecksumSerializer {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            inner: Mutex::new(ChecksumSerializer::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Run `f` with exclusive use of the shared serializer.
    ///
    /// Fails if the shared serializer is disabled for this session, or if
    /// another thread holds it at the same moment.
    pub fn with<R>(
        &self,
        f: impl FnOnce(&mut ChecksumSerializer) -> R,
    ) -> Result<R, ChecksumError> {
        if !self.enabled {
            return Err(ChecksumError::SharedDisabled);
        }
        let mut guard = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                log::error!("shared checksum serializer used concurrently");
                return Err(ChecksumError::SharedBusy);
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        Ok(f(&mut guard))
    }
}
