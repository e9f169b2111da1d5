//! Per-stream sequence allocation, segment state machine and the three
//! ordered range indexes (entry index, cycle count, wall-clock time)
//! used to answer `StreamOpenQuery`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{initial_control, SegmentPool};
use crate::error::{Error, Result};
use crate::ids::{SequenceNumber, StreamId, INVALID_SEQUENCE_NUMBER};
use crate::store::{ReadCache, StoreBackend};
use crate::types::{
    SegmentControlElement, StreamAccessFlags, StreamDescriptor, StreamRangeInformation,
    StreamSegmentLink, StreamStatistics,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Free,
    Writing,
    Completing,
    Committed,
    Aborted,
}

impl SegmentState {
    fn can_transition_to(self, next: SegmentState) -> bool {
        use SegmentState::*;
        matches!(
            (self, next),
            (Free, Writing)
                | (Writing, Completing)
                | (Completing, Committed)
                | (Completing, Aborted)
                | (Writing, Aborted)
        )
    }
}

struct SegmentRecord {
    line: usize,
    state: SegmentState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIndexType {
    Index,
    CycleCount,
    RealTime,
    SequenceNumber,
    NextValidSequenceNumber,
    PreviousValidSequenceNumber,
    UserIndex0,
    UserIndex1,
    UserIndex2,
    UserIndex3,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamOpenQuery {
    pub kind: QueryIndexType,
    pub value: u64,
    pub access: StreamAccessFlags,
}

pub enum StreamKind {
    Regular,
    Dynamic(u64),
}

/// Plug-in boundary for dynamic streams: reads and queries against a
/// dynamic stream are forwarded here rather than to the segment
/// buffer. No concrete generator ships with this crate beyond what
/// tests register.
pub trait DynamicStreamGenerator: Send + Sync {
    fn read(&self, sequence: SequenceNumber) -> Result<Vec<u8>>;
}

pub struct Stream {
    id: StreamId,
    descriptor: StreamDescriptor,
    kind: StreamKind,
    buffer: Arc<SegmentPool>,
    backend: Arc<dyn StoreBackend>,
    read_cache: Arc<ReadCache>,

    next_sequence: AtomicU64,
    append_lock: Mutex<()>,

    segments: Mutex<HashMap<SequenceNumber, SegmentRecord>>,
    controls: Mutex<HashMap<SequenceNumber, SegmentControlElement>>,

    by_index: Mutex<BTreeMap<u64, Vec<SequenceNumber>>>,
    by_cycle: Mutex<BTreeMap<u64, Vec<SequenceNumber>>>,
    by_time: Mutex<BTreeMap<u64, Vec<SequenceNumber>>>,

    entry_cursor: AtomicU64,
}

impl Stream {
    pub fn new(
        id: StreamId,
        descriptor: StreamDescriptor,
        kind: StreamKind,
        buffer: Arc<SegmentPool>,
        backend: Arc<dyn StoreBackend>,
        read_cache: Arc<ReadCache>,
    ) -> Result<Self> {
        if descriptor.name.is_empty() {
            return Err(Error::Argument("stream name must not be empty".into()));
        }

        Ok(Stream {
            id,
            descriptor,
            kind,
            buffer,
            backend,
            read_cache,
            next_sequence: AtomicU64::new(0),
            append_lock: Mutex::new(()),
            segments: Mutex::new(HashMap::new()),
            controls: Mutex::new(HashMap::new()),
            by_index: Mutex::new(BTreeMap::new()),
            by_cycle: Mutex::new(BTreeMap::new()),
            by_time: Mutex::new(BTreeMap::new()),
            entry_cursor: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    fn set_state(&self, sequence: SequenceNumber, next: SegmentState) -> Result<()> {
        let mut segments = self.segments.lock();
        let record = segments
            .get_mut(&sequence)
            .ok_or_else(|| Error::NotFound(format!("segment {sequence} not found")))?;
        if !record.state.can_transition_to(next) {
            return Err(Error::InvalidOperation(format!(
                "illegal segment transition {:?} -> {:?}",
                record.state, next
            )));
        }
        record.state = next;
        Ok(())
    }

    /// Begins writing a new segment. Sequence numbers are handed out in
    /// program order, serialized by the append lock; concurrently open
    /// segments are bounded only by the buffer pool's physical capacity
    /// (`SegmentPool::allocate` retries, then fails with
    /// `Error::AllocationRetryExceeded`), not by a single-slot gate, so
    /// segments may be closed out of order by whichever caller holds
    /// their sequence number.
    pub fn append(&self) -> Result<(SequenceNumber, usize)> {
        let _guard = self.append_lock.lock();

        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let line = self.buffer.allocate()?;

        let link = StreamSegmentLink {
            stream: self.id,
            sequence_number: sequence,
        };
        self.buffer
            .write_control(line, initial_control(link, 0x5A5A_5A5A_5A5A_5A5A));

        self.segments.lock().insert(
            sequence,
            SegmentRecord {
                line,
                state: SegmentState::Writing,
            },
        );

        Ok((sequence, line))
    }

    /// Completes the segment named by `sequence`, stamping server-side
    /// aggregates, persisting it through the store's backend, and
    /// indexing it for queries. The buffer line is released back to the
    /// pool once the backend accepts the write, so a later read of this
    /// segment's data goes through the read cache/backend rather than
    /// the (by then possibly reused) buffer line.
    pub fn close(&self, sequence: SequenceNumber, raw_entry_count: u32, start_cycle: u64, start_time: u64) -> Result<()> {
        self.set_state(sequence, SegmentState::Completing)?;

        let line = {
            let segments = self.segments.lock();
            segments.get(&sequence).unwrap().line
        };

        let start_index = self.entry_cursor.fetch_add(
            raw_entry_count as u64,
            Ordering::SeqCst,
        );
        let end_cycle = start_cycle.saturating_add(raw_entry_count as u64);
        let end_time = start_time;

        let mut control = self.buffer.control(line);
        control.raw_entry_count = raw_entry_count;
        control.entry_count = raw_entry_count;
        control.start_index = start_index;
        control.start_cycle = start_cycle;
        control.end_cycle = end_cycle;
        control.start_time = start_time;
        control.end_time = end_time;
        self.buffer.write_control(line, control);

        let entry_size = self.descriptor.stream_type.entry_size() as usize;
        let data = self.buffer.with_segment(line, |bytes| {
            let used = if entry_size == 0 {
                bytes.len()
            } else {
                (raw_entry_count as usize * entry_size).min(bytes.len())
            };
            bytes[..used].to_vec()
        });

        if let Err(err) = self.backend.write_segment(self.id, sequence, &data) {
            self.set_state(sequence, SegmentState::Aborted)?;
            self.buffer.release(crate::ids::SegmentId(line as u32), line);
            return Err(err);
        }

        self.by_index.lock().entry(start_index).or_default().push(sequence);
        self.by_cycle.lock().entry(start_cycle).or_default().push(sequence);
        self.by_time.lock().entry(start_time).or_default().push(sequence);
        self.controls.lock().insert(sequence, control);
        self.read_cache.insert((self.id, sequence), data);

        self.set_state(sequence, SegmentState::Committed)?;
        self.buffer.release(crate::ids::SegmentId(line as u32), line);
        Ok(())
    }

    /// Aborts the segment named by `sequence` without indexing it; its
    /// sequence number becomes a gap that `next_valid_sequence` skips.
    pub fn abort(&self, sequence: SequenceNumber) -> Result<()> {
        let line = {
            let segments = self.segments.lock();
            segments.get(&sequence).ok_or_else(|| Error::NotFound(format!("segment {sequence} not found")))?.line
        };
        self.set_state(sequence, SegmentState::Aborted)?;
        self.buffer.release(crate::ids::SegmentId(line as u32), line);
        Ok(())
    }

    /// Closes the segment named by `sequence` and opens the next one in
    /// a single call, so no intermediate "between segments" state is
    /// ever observable to a reader.
    pub fn close_and_open(
        &self,
        sequence: SequenceNumber,
        raw_entry_count: u32,
        start_cycle: u64,
        start_time: u64,
    ) -> Result<(SequenceNumber, usize)> {
        self.close(sequence, raw_entry_count, start_cycle, start_time)?;
        self.append()
    }

    /// Reads a committed segment's data, through the read cache with a
    /// backend fallback on a miss.
    pub fn read_segment(&self, sequence: SequenceNumber) -> Result<Vec<u8>> {
        if !self.is_committed(sequence) {
            return Err(Error::InvalidOperation(format!(
                "segment {sequence} is not committed"
            )));
        }
        if let Some(cached) = self.read_cache.get((self.id, sequence)) {
            return Ok(cached);
        }
        let data = self.backend.read_segment(self.id, sequence)?;
        self.read_cache.insert((self.id, sequence), data.clone());
        Ok(data)
    }

    pub fn state_of(&self, sequence: SequenceNumber) -> Option<SegmentState> {
        self.segments.lock().get(&sequence).map(|r| r.state)
    }

    pub fn committed_count(&self) -> usize {
        self.segments
            .lock()
            .values()
            .filter(|r| r.state == SegmentState::Committed)
            .count()
    }

    fn is_committed(&self, sequence: SequenceNumber) -> bool {
        self.segments
            .lock()
            .get(&sequence)
            .is_some_and(|r| r.state == SegmentState::Committed)
    }

    pub fn next_valid_sequence(&self, from: SequenceNumber) -> SequenceNumber {
        let max = self.next_sequence.load(Ordering::SeqCst);
        let mut s = from;
        while s < max {
            if self.is_committed(s) {
                return s;
            }
            s += 1;
        }
        INVALID_SEQUENCE_NUMBER
    }

    pub fn previous_valid_sequence(&self, from: SequenceNumber) -> SequenceNumber {
        let mut s = from;
        loop {
            if s == 0 {
                return INVALID_SEQUENCE_NUMBER;
            }
            s -= 1;
            if self.is_committed(s) {
                return s;
            }
        }
    }

    /// Resolves a `StreamOpenQuery` into the sequence number of the
    /// matching committed segment.
    pub fn resolve_query(&self, query: &StreamOpenQuery) -> Result<SequenceNumber> {
        match query.kind {
            QueryIndexType::SequenceNumber => {
                if self.is_committed(query.value) {
                    Ok(query.value)
                } else {
                    Err(Error::NotFound(format!("segment {} not found", query.value)))
                }
            }
            QueryIndexType::NextValidSequenceNumber => {
                let next = self.next_valid_sequence(query.value);
                if next == INVALID_SEQUENCE_NUMBER {
                    Err(Error::NotFound("no later valid segment".into()))
                } else {
                    Ok(next)
                }
            }
            QueryIndexType::PreviousValidSequenceNumber => {
                let prev = self.previous_valid_sequence(query.value);
                if prev == INVALID_SEQUENCE_NUMBER {
                    Err(Error::NotFound("no earlier valid segment".into()))
                } else {
                    Ok(prev)
                }
            }
            QueryIndexType::Index => self.lookup_range_index(&self.by_index, query.value),
            QueryIndexType::CycleCount => self.lookup_range_index(&self.by_cycle, query.value),
            QueryIndexType::RealTime => self.lookup_range_index(&self.by_time, query.value),
            QueryIndexType::UserIndex0
            | QueryIndexType::UserIndex1
            | QueryIndexType::UserIndex2
            | QueryIndexType::UserIndex3 => Err(Error::NotSupported),
        }
    }

    fn lookup_range_index(
        &self,
        index: &Mutex<BTreeMap<u64, Vec<SequenceNumber>>>,
        value: u64,
    ) -> Result<SequenceNumber> {
        let map = index.lock();
        // Last range whose start is <= value covers it, in a
        // monotonically increasing stream.
        match map.range(..=value).next_back() {
            Some((_, sequences)) => Ok(*sequences.last().unwrap()),
            None => Err(Error::NotFound("no segment covers requested value".into())),
        }
    }

    pub fn control_of(&self, sequence: SequenceNumber) -> Option<SegmentControlElement> {
        self.controls.lock().get(&sequence).copied()
    }

    pub fn line_of(&self, sequence: SequenceNumber) -> Option<usize> {
        self.segments.lock().get(&sequence).map(|r| r.line)
    }

    pub fn buffer(&self) -> &Arc<SegmentPool> {
        &self.buffer
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.kind, StreamKind::Dynamic(_))
    }

    pub fn statistics(&self) -> StreamStatistics {
        let controls = self.controls.lock();
        let mut stats = StreamStatistics::default();
        let mut ranges = StreamRangeInformation::default();
        let mut first = true;

        for control in controls.values() {
            stats.entry_count += control.entry_count as u64;
            stats.raw_entry_count += control.raw_entry_count as u64;

            if first {
                ranges.index.start = control.start_index;
                ranges.cycle.start = control.start_cycle;
                ranges.time.start = control.start_time;
                first = false;
            }
            ranges.index.end = ranges.index.end.max(control.start_index + control.entry_count as u64);
            ranges.cycle.end = ranges.cycle.end.max(control.end_cycle);
            ranges.time.end = ranges.time.end.max(control.end_time);
        }

        stats.ranges = ranges;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{BufferId, Guid};
    use crate::types::{StreamFlags, StreamTypeDescriptor, StreamTypeFlags};
    use std::time::Duration;

    fn make_stream_with_pool(pool: Arc<SegmentPool>) -> Stream {
        let stream_type =
            StreamTypeDescriptor::new("events", Guid::NIL, StreamTypeFlags::NONE, 16).unwrap();
        let descriptor = StreamDescriptor {
            name: "s0".into(),
            flags: StreamFlags::NONE,
            stream_type,
        };
        let backend = Arc::new(crate::store::MemoryBackend::new());
        let read_cache = Arc::new(ReadCache::new(4, false));
        Stream::new(StreamId(0), descriptor, StreamKind::Regular, pool, backend, read_cache).unwrap()
    }

    fn make_stream() -> Stream {
        let pool = Arc::new(SegmentPool::new(
            BufferId(0),
            4096,
            4,
            false,
            3,
            Duration::from_millis(1),
        ));
        make_stream_with_pool(pool)
    }

    #[test]
    fn append_close_commits_and_indexes_segment() {
        let stream = make_stream();
        let (seq, _line) = stream.append().unwrap();
        assert_eq!(stream.state_of(seq), Some(SegmentState::Writing));
        stream.close(seq, 10, 0, 1000).unwrap();
        assert_eq!(stream.state_of(seq), Some(SegmentState::Committed));
        assert_eq!(stream.committed_count(), 1);
    }

    #[test]
    fn append_is_gated_by_pool_capacity_not_a_single_open_slot() {
        let pool = Arc::new(SegmentPool::new(BufferId(0), 64, 1, false, 1, Duration::from_millis(1)));
        let stream = make_stream_with_pool(pool);
        let (seq0, _) = stream.append().unwrap();
        // The sole buffer line is still open under seq0; a second
        // concurrently open segment has nowhere to live.
        assert!(matches!(stream.append(), Err(Error::AllocationRetryExceeded)));
        stream.close(seq0, 1, 0, 0).unwrap();
        // Closing releases the line back to the pool, so a new segment
        // can open even though seq0 was never aborted.
        assert!(stream.append().is_ok());
    }

    #[test]
    fn next_valid_sequence_skips_aborted_segments() {
        let stream = make_stream();
        let (seq0, _) = stream.append().unwrap();
        stream.close(seq0, 5, 0, 0).unwrap();

        let (seq1, _) = stream.append().unwrap();
        stream.abort(seq1).unwrap();

        let (seq2, _) = stream.append().unwrap();
        stream.close(seq2, 5, 5, 100).unwrap();

        assert_eq!(stream.next_valid_sequence(seq0 + 1), seq2);
    }

    #[test]
    fn segments_can_close_out_of_order() {
        let pool = Arc::new(SegmentPool::new(BufferId(0), 64, 4, false, 3, Duration::from_millis(1)));
        let stream = make_stream_with_pool(pool);
        let (seq0, _) = stream.append().unwrap();
        let (seq1, _) = stream.append().unwrap();
        let (seq2, _) = stream.append().unwrap();

        // Close the most recently opened segment first.
        stream.close(seq2, 1, 0, 0).unwrap();
        assert_eq!(stream.state_of(seq0), Some(SegmentState::Writing));
        assert_eq!(stream.state_of(seq1), Some(SegmentState::Writing));
        assert_eq!(stream.state_of(seq2), Some(SegmentState::Committed));

        stream.close(seq0, 1, 0, 0).unwrap();
        stream.close(seq1, 1, 0, 0).unwrap();

        // next_valid_sequence still walks 0..N in order regardless of
        // the order segments actually committed in.
        assert_eq!(stream.next_valid_sequence(0), seq0);
        assert_eq!(stream.next_valid_sequence(seq0 + 1), seq1);
        assert_eq!(stream.next_valid_sequence(seq1 + 1), seq2);
    }

    #[test]
    fn close_and_open_leaves_no_intermediate_gap() {
        let stream = make_stream();
        let (seq, _) = stream.append().unwrap();
        let (next, _) = stream.close_and_open(seq, 3, 0, 0).unwrap();
        assert_eq!(stream.state_of(next), Some(SegmentState::Writing));
    }

    #[test]
    fn resolve_query_by_sequence_number() {
        let stream = make_stream();
        let (seq, _) = stream.append().unwrap();
        stream.close(seq, 1, 0, 0).unwrap();
        let query = StreamOpenQuery {
            kind: QueryIndexType::SequenceNumber,
            value: seq,
            access: StreamAccessFlags::NONE,
        };
        assert_eq!(stream.resolve_query(&query).unwrap(), seq);
    }

    #[test]
    fn read_segment_returns_committed_bytes_via_cache() {
        let stream = make_stream();
        let (seq, line) = stream.append().unwrap();
        stream.buffer().with_segment_mut(line, |bytes| bytes[..4].copy_from_slice(&[1, 2, 3, 4]));
        stream.close(seq, 1, 0, 0).unwrap();
        let data = stream.read_segment(seq).unwrap();
        assert_eq!(&data[..4], &[1, 2, 3, 4]);
    }
}
