//! Ring buffers of verified frames.
//!
//! Two consumers sample verified frames: checksum auditing (forensics when a
//! remote checksum disagrees) and instant replay. Each is configured by a
//! window and a sampling interval in ticks. When both sampling patterns
//! share a divisor greater than one, a single buffer sampled at that divisor
//! serves both; otherwise two buffers are kept.

use log::{debug, warn};

use crate::fixed::Tick;
use crate::frame::Frame;

/// Number of entries needed to cover `window` ticks at one sample per
/// `interval` ticks. Zero when sampling is disabled (`interval <= 0`).
pub fn get_size(window: Tick, interval: Tick) -> usize {
    if interval <= 0 {
        return 0;
    }
    1 + (window.max(0) / interval) as usize
}

fn gcd(mut a: Tick, mut b: Tick) -> Tick {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a.abs()
}

// ---------------------------------------------------------------------------
// FrameSnapshotBuffer
// ---------------------------------------------------------------------------

/// A fixed-capacity ring of verified frames sampled at a fixed interval.
///
/// When full, the oldest frame is evicted.
#[derive(Debug)]
pub struct FrameSnapshotBuffer {
    entries: Vec<Option<Frame>>,
    /// Write position (wraps around).
    head: usize,
    len: usize,
    interval: Tick,
    total_taken: u64,
}

impl FrameSnapshotBuffer {
    pub fn new(window: Tick, interval: Tick) -> Self {
        let capacity = get_size(window, interval);
        Self {
            entries: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
            interval,
            total_taken: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn interval(&self) -> Tick {
        self.interval
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total frames ever accepted (including evicted).
    pub fn total_taken(&self) -> u64 {
        self.total_taken
    }

    /// Whether `frame` qualifies for this buffer.
    pub fn accepts(&self, frame: &Frame) -> bool {
        self.capacity() > 0 && frame.is_verified() && frame.tick() % self.interval == 0
    }

    /// Store a copy of `frame` if it is verified and on the sampling grid.
    pub fn push(&mut self, frame: &Frame) -> bool {
        if !self.accepts(frame) {
            return false;
        }
        if self.latest().is_some_and(|f| f.tick() == frame.tick()) {
            return false;
        }
        let capacity = self.capacity();
        self.entries[self.head] = Some(frame.clone());
        self.head = (self.head + 1) % capacity;
        if self.len < capacity {
            self.len += 1;
        }
        self.total_taken += 1;
        true
    }

    /// Get a frame by age (0 = oldest).
    pub fn get(&self, index: usize) -> Option<&Frame> {
        if index >= self.len {
            return None;
        }
        let start = if self.len < self.capacity() { 0 } else { self.head };
        self.entries[(start + index) % self.capacity()].as_ref()
    }

    pub fn latest(&self) -> Option<&Frame> {
        self.len.checked_sub(1).and_then(|i| self.get(i))
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        (0..self.len).filter_map(|i| self.get(i))
    }

    pub fn find(&self, tick: Tick) -> Option<&Frame> {
        self.iter().find(|f| f.tick() == tick)
    }

    /// Newest frame whose tick is not after `tick`.
    pub fn find_at_or_before(&self, tick: Tick) -> Option<&Frame> {
        self.iter().filter(|f| f.tick() <= tick).last()
    }

    /// Frame nearest to `tick`; ties go to the earlier frame.
    pub fn find_closest(&self, tick: Tick) -> Option<&Frame> {
        self.iter()
            .min_by_key(|f| ((f.tick() as i64 - tick as i64).abs(), f.tick()))
    }

    pub fn clear(&mut self) {
        for entry in &mut self.entries {
            *entry = None;
        }
        self.head = 0;
        self.len = 0;
    }
}

// ---------------------------------------------------------------------------
// SnapshotBuffers
// ---------------------------------------------------------------------------

/// Window and interval of one sampling consumer, both in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sampling {
    pub window: Tick,
    pub interval: Tick,
}

impl Sampling {
    fn is_active(&self) -> bool {
        self.interval > 0
    }
}

#[derive(Debug)]
enum Layout {
    Merged(FrameSnapshotBuffer),
    Split {
        checksum: Option<FrameSnapshotBuffer>,
        replay: Option<FrameSnapshotBuffer>,
    },
}

/// Checksum-audit and replay snapshot storage.
#[derive(Debug)]
pub struct SnapshotBuffers {
    layout: Layout,
}

impl SnapshotBuffers {
    pub fn new(checksum: Sampling, replay: Option<Sampling>) -> Self {
        let replay = replay.filter(Sampling::is_active);
        let checksum_active = checksum.is_active();

        let layout = match replay {
            Some(replay) if checksum_active => {
                let common = gcd(checksum.interval, replay.interval);
                if common > 1 {
                    let window = checksum.window.max(replay.window);
                    debug!(
                        "merging snapshot buffers: interval {common}, window {window} ({} entries)",
                        get_size(window, common)
                    );
                    Layout::Merged(FrameSnapshotBuffer::new(window, common))
                } else {
                    warn!(
                        "checksum interval {} and replay interval {} share no divisor; keeping two snapshot buffers",
                        checksum.interval, replay.interval
                    );
                    Layout::Split {
                        checksum: Some(FrameSnapshotBuffer::new(checksum.window, checksum.interval)),
                        replay: Some(FrameSnapshotBuffer::new(replay.window, replay.interval)),
                    }
                }
            }
            Some(replay) => Layout::Split {
                checksum: None,
                replay: Some(FrameSnapshotBuffer::new(replay.window, replay.interval)),
            },
            None => Layout::Split {
                checksum: checksum_active
                    .then(|| FrameSnapshotBuffer::new(checksum.window, checksum.interval)),
                replay: None,
            },
        };
        Self { layout }
    }

    pub fn is_merged(&self) -> bool {
        matches!(self.layout, Layout::Merged(_))
    }

    /// Offer a frame to every buffer. Returns whether any buffer kept it.
    pub fn push(&mut self, frame: &Frame) -> bool {
        match &mut self.layout {
            Layout::Merged(buf) => buf.push(frame),
            Layout::Split { checksum, replay } => {
                let a = checksum.as_mut().is_some_and(|b| b.push(frame));
                let b = replay.as_mut().is_some_and(|b| b.push(frame));
                a || b
            }
        }
    }

    pub fn checksum_buffer(&self) -> Option<&FrameSnapshotBuffer> {
        match &self.layout {
            Layout::Merged(buf) => Some(buf),
            Layout::Split { checksum, .. } => checksum.as_ref(),
        }
    }

    pub fn replay_buffer(&self) -> Option<&FrameSnapshotBuffer> {
        match &self.layout {
            Layout::Merged(buf) => Some(buf),
            Layout::Split { replay, .. } => replay.as_ref(),
        }
    }

    /// Number of distinct buffers allocated.
    pub fn buffer_count(&self) -> usize {
        match &self.layout {
            Layout::Merged(_) => 1,
            Layout::Split { checksum, replay } => {
                checksum.is_some() as usize + replay.is_some() as usize
            }
        }
    }

    /// Drop every stored frame; history is no longer contiguous.
    pub fn clear(&mut self) {
        match &mut self.layout {
            Layout::Merged(buf) => buf.clear(),
            Layout::Split { checksum, replay } => {
                for buf in [checksum, replay].into_iter().flatten() {
                    buf.clear();
                }
            }
        }
    }
}
