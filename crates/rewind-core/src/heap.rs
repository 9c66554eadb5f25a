//! Per-frame bump allocator.
//!
//! Dynamic simulation structures (variable-length lists, scratch buffers
//! that must roll back with the frame) live in a single contiguous byte
//! arena owned by the [`Frame`](crate::frame::Frame). Allocations are
//! addressed by [`HeapPtr`] offset/length handles rather than pointers, so
//! copying a frame is a plain `Vec` clone and every handle stays valid in
//! the copy.
//!
//! Heap contents are serialized with full frame snapshots but are excluded
//! from the frame checksum.

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use crate::fixed::Fixed64;

/// Alignment of every allocation, in bytes.
const ALIGN: usize = 8;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("heap exhausted: requested {requested} bytes, {available} available")]
    Exhausted { requested: usize, available: usize },
    #[error("stale heap handle: generation {handle}, heap is at {current}")]
    Stale { handle: u32, current: u32 },
    #[error("heap handle out of bounds: offset {offset} + len {len} > {top}")]
    OutOfBounds { offset: u32, len: u32, top: u32 },
    #[error("index {index} out of range for list of {len}")]
    Index { index: usize, len: usize },
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Location of a raw byte allocation in a [`FrameHeap`].
///
/// Generation-scoped: a [`FrameHeap::reset`] invalidates every handle
/// issued before it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[must_use]
pub struct HeapPtr {
    generation: u32,
    offset: u32,
    len: u32,
}

impl HeapPtr {
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Length of the allocation in bytes.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Display for HeapPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HeapPtr(gen={}, off={}, len={})",
            self.generation, self.offset, self.len
        )
    }
}

/// Fixed-width value that can live in a [`HeapList`].
pub trait HeapScalar: Copy {
    const SIZE: usize;
    fn write_le(self, out: &mut [u8]);
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! heap_scalar_int {
    ($($t:ty),*) => {$(
        impl HeapScalar for $t {
            const SIZE: usize = std::mem::size_of::<$t>();
            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }
            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                <$t>::from_le_bytes(raw)
            }
        }
    )*};
}

heap_scalar_int!(u8, u16, u32, u64, i8, i16, i32, i64);

impl HeapScalar for Fixed64 {
    const SIZE: usize = 8;
    fn write_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_bits().to_le_bytes());
    }
    fn read_le(bytes: &[u8]) -> Self {
        Fixed64::from_bits(i64::read_le(bytes))
    }
}

/// Typed handle to a fixed-length list of `T` in a [`FrameHeap`].
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct HeapList<T: HeapScalar> {
    ptr: HeapPtr,
    count: u32,
    #[serde(skip)]
    _marker: PhantomData<fn() -> T>,
}

impl<T: HeapScalar> Clone for HeapList<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: HeapScalar> Copy for HeapList<T> {}

impl<T: HeapScalar> PartialEq for HeapList<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr && self.count == other.count
    }
}

impl<T: HeapScalar> Eq for HeapList<T> {}

impl<T: HeapScalar> fmt::Debug for HeapList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapList")
            .field("ptr", &self.ptr)
            .field("count", &self.count)
            .finish()
    }
}

impl<T: HeapScalar> HeapList<T> {
    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn ptr(&self) -> HeapPtr {
        self.ptr
    }
}

// ---------------------------------------------------------------------------
// FrameHeap
// ---------------------------------------------------------------------------

/// Contiguous bump arena with a fixed byte budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeap {
    bytes: Vec<u8>,
    capacity: usize,
    generation: u32,
    allocations: u32,
}

impl FrameHeap {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Vec::new(),
            capacity,
            generation: 0,
            allocations: 0,
        }
    }

    /// Bytes handed out so far (including alignment padding).
    pub fn used(&self) -> usize {
        self.bytes.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn allocation_count(&self) -> u32 {
        self.allocations
    }

    /// Allocate `len` zeroed bytes.
    pub fn alloc(&mut self, len: usize) -> Result<HeapPtr, HeapError> {
        let start = self.bytes.len().next_multiple_of(ALIGN);
        let end = start + len;
        if end > self.capacity {
            return Err(HeapError::Exhausted {
                requested: len,
                available: self.capacity.saturating_sub(start),
            });
        }
        self.bytes.resize(end, 0);
        self.allocations += 1;
        Ok(HeapPtr {
            generation: self.generation,
            offset: start as u32,
            len: len as u32,
        })
    }

    /// Allocate a zeroed list of `count` elements.
    pub fn alloc_list<T: HeapScalar>(&mut self, count: usize) -> Result<HeapList<T>, HeapError> {
        let ptr = self.alloc(count * T::SIZE)?;
        Ok(HeapList {
            ptr,
            count: count as u32,
            _marker: PhantomData,
        })
    }

    /// Allocate a list initialised from `values`.
    pub fn alloc_from<T: HeapScalar>(&mut self, values: &[T]) -> Result<HeapList<T>, HeapError> {
        let list = self.alloc_list::<T>(values.len())?;
        for (i, v) in values.iter().enumerate() {
            self.set(list, i, *v)?;
        }
        Ok(list)
    }

    fn range(&self, ptr: HeapPtr) -> Result<std::ops::Range<usize>, HeapError> {
        debug_assert!(
            ptr.generation == self.generation,
            "heap handle {ptr} used after reset (heap generation {})",
            self.generation
        );
        if ptr.generation != self.generation {
            return Err(HeapError::Stale {
                handle: ptr.generation,
                current: self.generation,
            });
        }
        let start = ptr.offset as usize;
        let end = start + ptr.len as usize;
        if end > self.bytes.len() {
            return Err(HeapError::OutOfBounds {
                offset: ptr.offset,
                len: ptr.len,
                top: self.bytes.len() as u32,
            });
        }
        Ok(start..end)
    }

    pub fn bytes(&self, ptr: HeapPtr) -> Result<&[u8], HeapError> {
        let range = self.range(ptr)?;
        Ok(&self.bytes[range])
    }

    pub fn bytes_mut(&mut self, ptr: HeapPtr) -> Result<&mut [u8], HeapError> {
        let range = self.range(ptr)?;
        Ok(&mut self.bytes[range])
    }

    pub fn get<T: HeapScalar>(&self, list: HeapList<T>, index: usize) -> Result<T, HeapError> {
        if index >= list.len() {
            return Err(HeapError::Index {
                index,
                len: list.len(),
            });
        }
        let bytes = self.bytes(list.ptr)?;
        let at = index * T::SIZE;
        Ok(T::read_le(&bytes[at..at + T::SIZE]))
    }

    pub fn set<T: HeapScalar>(
        &mut self,
        list: HeapList<T>,
        index: usize,
        value: T,
    ) -> Result<(), HeapError> {
        if index >= list.len() {
            return Err(HeapError::Index {
                index,
                len: list.len(),
            });
        }
        let bytes = self.bytes_mut(list.ptr)?;
        let at = index * T::SIZE;
        value.write_le(&mut bytes[at..at + T::SIZE]);
        Ok(())
    }

    /// Copy the list contents out into a `Vec`.
    pub fn to_vec<T: HeapScalar>(&self, list: HeapList<T>) -> Result<Vec<T>, HeapError> {
        let bytes = self.bytes(list.ptr)?;
        Ok(bytes.chunks_exact(T::SIZE).map(T::read_le).collect())
    }

    /// Release every allocation. Handles issued before the reset become stale.
    pub fn reset(&mut self) {
        self.bytes.clear();
        self.allocations = 0;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Check a decoded heap against the session's byte budget.
    pub fn validate(&self, capacity: usize) -> Result<(), String> {
        if self.capacity != capacity {
            return Err(format!(
                "heap capacity {} differs from the session's {capacity}",
                self.capacity
            ));
        }
        if self.bytes.len() > self.capacity {
            return Err(format!(
                "heap uses {} bytes of a {}-byte budget",
                self.bytes.len(),
                self.capacity
            ));
        }
        if self.allocations == 0 && !self.bytes.is_empty() {
            return Err(format!("{} bytes used without an allocation", self.bytes.len()));
        }
        Ok(())
    }
}

impl Default for FrameHeap {
    fn default() -> Self {
        Self::new(1 << 20)
    }
}
