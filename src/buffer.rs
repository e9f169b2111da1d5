//! Segment buffer pool: a pre-allocated arena of fixed-size "lines",
//! each holding one segment's data followed by its control element.
//!
//! This generalizes the rotating on-disk chunk pool technique into a
//! fixed-capacity in-memory arena: instead of appending variable-sized
//! records and rotating to a new file when full, segments are
//! allocated out of a free list of equal-sized slots and returned to it
//! on release.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::ids::{BufferId, SegmentId};
use crate::types::{SegmentControlElement, StreamSegmentLink, SEGMENT_CONTROL_ELEMENT_SIZE};

/// Sanity-fill byte patterns used in debug builds to catch use of
/// uninitialized or already-released segment memory.
#[cfg(debug_assertions)]
mod sanity {
    pub const FENCE: u8 = 0xFD;
    pub const CLEAR: u8 = 0xCD;
    pub const DEAD: u8 = 0xDD;
}

fn page_size() -> usize {
    4096
}

/// Computes the size of one buffer "line": the raw segment bytes,
/// followed by a page-aligned control element region so every line
/// starts on a page boundary.
#[derive(Debug, Clone, Copy)]
pub struct LineLayout {
    pub segment_size: usize,
    pub control_offset: usize,
    pub line_size: usize,
}

impl LineLayout {
    pub fn new(segment_size: usize) -> Self {
        let control_size = SEGMENT_CONTROL_ELEMENT_SIZE;
        let page = page_size();
        let control_offset = segment_size;
        let unaligned = control_offset + control_size;
        let line_size = unaligned.div_ceil(page) * page;
        LineLayout {
            segment_size,
            control_offset,
            line_size,
        }
    }
}

/// Opaque handle used to mark a buffer eligible for cross-process
/// handle transfer. This crate never performs real OS handle passing;
/// the buffer always backs itself with process memory, but callers that
/// care about handle-transfer eligibility can still branch on this.
pub type BufferHandle = u64;
pub const INVALID_HANDLE: BufferHandle = u64::MAX;

pub struct StreamBuffer {
    id: BufferId,
    layout: LineLayout,
    num_segments: usize,
    storage: Vec<u8>,
    shared: bool,
}

impl StreamBuffer {
    pub fn new(id: BufferId, segment_size: usize, num_segments: usize, shared: bool) -> Self {
        let layout = LineLayout::new(segment_size);
        let mut storage = vec![0u8; layout.line_size * num_segments];

        #[cfg(debug_assertions)]
        storage.fill(sanity::CLEAR);
        #[cfg(not(debug_assertions))]
        let _ = &mut storage;

        StreamBuffer {
            id,
            layout,
            num_segments,
            storage,
            shared,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn handle(&self) -> BufferHandle {
        if self.shared {
            self.id.0 as u64
        } else {
            INVALID_HANDLE
        }
    }

    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    fn line_offset(&self, index: usize) -> usize {
        index * self.layout.line_size
    }

    pub fn segment(&self, index: usize) -> &[u8] {
        let off = self.line_offset(index);
        &self.storage[off..off + self.layout.segment_size]
    }

    pub fn segment_mut(&mut self, index: usize) -> &mut [u8] {
        let off = self.line_offset(index);
        let size = self.layout.segment_size;
        &mut self.storage[off..off + size]
    }

    /// Offset of the first byte past the last valid entry, computed
    /// from the control element's raw entry count and a fixed entry
    /// size. Callers dealing with variable-sized entries track the
    /// write offset separately.
    pub fn segment_end(&self, index: usize, entry_size: usize) -> usize {
        let control = self.control(index);
        (control.raw_entry_count as usize * entry_size).min(self.layout.segment_size)
    }

    fn control_bytes(&self, index: usize) -> &[u8] {
        let off = self.line_offset(index) + self.layout.control_offset;
        &self.storage[off..off + SEGMENT_CONTROL_ELEMENT_SIZE]
    }

    fn control_bytes_mut(&mut self, index: usize) -> &mut [u8] {
        let off = self.line_offset(index) + self.layout.control_offset;
        &mut self.storage[off..off + SEGMENT_CONTROL_ELEMENT_SIZE]
    }

    pub fn control(&self, index: usize) -> SegmentControlElement {
        SegmentControlElement::decode(self.control_bytes(index))
    }

    pub fn write_control(&mut self, index: usize, control: SegmentControlElement) {
        self.control_bytes_mut(index).copy_from_slice(&control.encode());
    }

    #[cfg(debug_assertions)]
    pub fn sanity_fill(&mut self, index: usize) {
        let off = self.line_offset(index);
        let size = self.layout.line_size;
        self.storage[off..off + size].fill(sanity::DEAD);
    }

    #[cfg(debug_assertions)]
    pub fn sanity_check_clear(&self, index: usize) -> bool {
        let off = self.line_offset(index);
        let size = self.layout.segment_size;
        self.storage[off..off + size]
            .iter()
            .all(|&b| b == sanity::CLEAR || b == sanity::DEAD)
    }
}

struct PoolState {
    free: Vec<usize>,
}

/// A `StreamBuffer` paired with a free list, allocating/releasing whole
/// segment lines. Allocation retries a bounded number of times with a
/// sleep in between, matching the backpressure behavior expected of a
/// fixed-capacity memory pool.
pub struct SegmentPool {
    buffer: Mutex<StreamBuffer>,
    state: Mutex<PoolState>,
    not_empty: Condvar,
    retry_count: u32,
    retry_sleep: Duration,
    closed: AtomicBool,
}

impl SegmentPool {
    pub fn new(
        id: BufferId,
        segment_size: usize,
        num_segments: usize,
        shared: bool,
        retry_count: u32,
        retry_sleep: Duration,
    ) -> Self {
        SegmentPool {
            buffer: Mutex::new(StreamBuffer::new(id, segment_size, num_segments, shared)),
            state: Mutex::new(PoolState {
                free: (0..num_segments).collect(),
            }),
            not_empty: Condvar::new(),
            retry_count,
            retry_sleep,
            closed: AtomicBool::new(false),
        }
    }

    pub fn buffer_id(&self) -> BufferId {
        self.buffer.lock().id()
    }

    /// Allocates a free segment line, retrying up to `retry_count` times
    /// with `retry_sleep` between attempts before giving up.
    pub fn allocate(&self) -> Result<usize> {
        let mut attempts = 0u32;
        loop {
            {
                let mut state = self.state.lock();
                if let Some(index) = state.free.pop() {
                    return Ok(index);
                }
            }

            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::InvalidOperation("segment pool closed".into()));
            }

            if attempts >= self.retry_count {
                return Err(Error::AllocationRetryExceeded);
            }
            attempts += 1;

            let mut state = self.state.lock();
            if state.free.is_empty() {
                self.not_empty.wait_for(&mut state, self.retry_sleep);
            }
        }
    }

    pub fn release(&self, index: SegmentId, line: usize) {
        let _ = index;
        #[cfg(debug_assertions)]
        self.buffer.lock().sanity_fill(line);

        let mut state = self.state.lock();
        state.free.push(line);
        self.not_empty.notify_one();
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.not_empty.notify_all();
    }

    pub fn with_segment<R>(&self, line: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        let buffer = self.buffer.lock();
        f(buffer.segment(line))
    }

    pub fn with_segment_mut<R>(&self, line: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut buffer = self.buffer.lock();
        f(buffer.segment_mut(line))
    }

    pub fn control(&self, line: usize) -> SegmentControlElement {
        self.buffer.lock().control(line)
    }

    pub fn write_control(&self, line: usize, control: SegmentControlElement) {
        self.buffer.lock().write_control(line, control);
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn num_segments(&self) -> usize {
        self.buffer.lock().num_segments()
    }
}

pub fn initial_control(link: StreamSegmentLink, cookie: u64) -> SegmentControlElement {
    SegmentControlElement::empty(link, cookie)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::StreamId;

    fn pool() -> SegmentPool {
        SegmentPool::new(BufferId(0), 256, 4, false, 3, Duration::from_millis(1))
    }

    #[test]
    fn allocate_and_release_round_trips_through_free_list() {
        let pool = pool();
        assert_eq!(pool.free_count(), 4);
        let line = pool.allocate().unwrap();
        assert_eq!(pool.free_count(), 3);
        pool.release(SegmentId(0), line);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn allocate_fails_once_exhausted_and_retries_spent() {
        let pool = SegmentPool::new(BufferId(1), 64, 1, false, 1, Duration::from_millis(1));
        let line = pool.allocate().unwrap();
        let err = pool.allocate().unwrap_err();
        assert!(matches!(err, Error::AllocationRetryExceeded));
        pool.release(SegmentId(0), line);
        assert!(pool.allocate().is_ok());
    }

    #[test]
    fn control_element_round_trips() {
        let pool = pool();
        let line = pool.allocate().unwrap();
        let link = StreamSegmentLink {
            stream: StreamId(7),
            sequence_number: 3,
        };
        let control = initial_control(link, 0xABCD);
        pool.write_control(line, control);
        let read_back = pool.control(line);
        assert_eq!(read_back.cookie, 0xABCD);
        assert_eq!(read_back.link.stream, StreamId(7));
    }
}
