//! Store: owns a set of segment buffer pools, streams and key/value
//! side tables, and enforces the configuration lock that freezes
//! registration once data has started flowing.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::buffer::SegmentPool;
use crate::error::{Error, Result};
use crate::ids::{BufferId, SequenceNumber, StreamId};
use crate::stream::{Stream, StreamKind};
use crate::types::{StreamDescriptor, StreamEnumFilter, StreamFlags, StreamQueryInformation};

pub const MAX_STREAM_BUFFERS: usize = 64;
pub const MAX_STREAMS: usize = 1024;

/// Minimal key/value side table, standing in for an on-disk backend's
/// auxiliary metadata pool.
#[derive(Default)]
pub struct DataPool {
    entries: HashMap<String, Vec<u8>>,
}

impl DataPool {
    pub fn set(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(|v| v.as_slice())
    }
}

/// Backend abstraction for persisting segments. The on-disk format and
/// compression scheme are out of scope; this crate ships only an
/// in-memory reference implementation used by tests.
pub trait StoreBackend: Send + Sync {
    fn write_segment(&self, stream: StreamId, sequence: SequenceNumber, data: &[u8]) -> Result<()>;
    fn read_segment(&self, stream: StreamId, sequence: SequenceNumber) -> Result<Vec<u8>>;
    fn supports_write_after_open(&self) -> bool {
        false
    }
}

pub struct MemoryBackend {
    segments: RwLock<HashMap<(StreamId, SequenceNumber), Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend {
            segments: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreBackend for MemoryBackend {
    fn write_segment(&self, stream: StreamId, sequence: SequenceNumber, data: &[u8]) -> Result<()> {
        self.segments
            .write()
            .insert((stream, sequence), data.to_vec());
        Ok(())
    }

    fn read_segment(&self, stream: StreamId, sequence: SequenceNumber) -> Result<Vec<u8>> {
        self.segments
            .read()
            .get(&(stream, sequence))
            .cloned()
            .ok_or_else(|| Error::NotFound("segment not found in backend".into()))
    }
}

/// Insertion-ordered cache of recently read segments. Oldest entries
/// evict first once `capacity` is exceeded; `disabled` bypasses
/// retention entirely when the store was configured with
/// `memmgmt.disableCache`.
pub struct ReadCache {
    capacity: usize,
    disabled: bool,
    order: parking_lot::Mutex<VecDeque<(StreamId, SequenceNumber)>>,
    entries: parking_lot::Mutex<HashMap<(StreamId, SequenceNumber), Vec<u8>>>,
}

impl ReadCache {
    pub fn new(capacity: usize, disabled: bool) -> Self {
        ReadCache {
            capacity,
            disabled,
            order: parking_lot::Mutex::new(VecDeque::new()),
            entries: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: (StreamId, SequenceNumber)) -> Option<Vec<u8>> {
        if self.disabled {
            return None;
        }
        self.entries.lock().get(&key).cloned()
    }

    pub fn insert(&self, key: (StreamId, SequenceNumber), data: Vec<u8>) {
        if self.disabled || self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        let mut order = self.order.lock();
        if !entries.contains_key(&key) {
            order.push_back(key);
        }
        entries.insert(key, data);

        while entries.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Store {
    buffers: RwLock<HashMap<BufferId, Arc<SegmentPool>>>,
    streams: RwLock<HashMap<StreamId, Arc<Stream>>>,
    data_pools: RwLock<HashMap<String, DataPool>>,
    configuration_locked: AtomicBool,
    backend: Arc<dyn StoreBackend>,
    pub read_cache: Arc<ReadCache>,
    next_buffer_id: std::sync::atomic::AtomicU32,
    next_stream_id: std::sync::atomic::AtomicU32,
    retry_count: u32,
    retry_sleep: Duration,
}

impl Store {
    pub fn new(backend: Arc<dyn StoreBackend>, read_ahead: usize, disable_cache: bool) -> Self {
        Store {
            buffers: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
            data_pools: RwLock::new(HashMap::new()),
            configuration_locked: AtomicBool::new(false),
            backend,
            read_cache: Arc::new(ReadCache::new(read_ahead, disable_cache)),
            next_buffer_id: std::sync::atomic::AtomicU32::new(0),
            next_stream_id: std::sync::atomic::AtomicU32::new(0),
            retry_count: 3,
            retry_sleep: Duration::from_millis(50),
        }
    }

    fn check_unlocked(&self) -> Result<()> {
        if self.configuration_locked.load(Ordering::SeqCst) && !self.backend.supports_write_after_open() {
            return Err(Error::InvalidOperation(
                "store configuration is locked".into(),
            ));
        }
        Ok(())
    }

    pub fn register_stream_buffer(&self, segment_size: usize, num_segments: usize, shared: bool) -> Result<BufferId> {
        self.check_unlocked()?;
        let mut buffers = self.buffers.write();
        if buffers.len() >= MAX_STREAM_BUFFERS {
            return Err(Error::InvalidOperation("stream buffer capacity exceeded".into()));
        }
        let id = BufferId(self.next_buffer_id.fetch_add(1, Ordering::SeqCst));
        let pool = Arc::new(SegmentPool::new(
            id,
            segment_size,
            num_segments,
            shared,
            self.retry_count,
            self.retry_sleep,
        ));
        buffers.insert(id, pool);
        Ok(id)
    }

    pub fn register_stream(
        &self,
        buffer: BufferId,
        descriptor: StreamDescriptor,
        kind: StreamKind,
    ) -> Result<StreamId> {
        self.check_unlocked()?;
        let pool = self
            .buffers
            .read()
            .get(&buffer)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("buffer {buffer} not found")))?;

        let mut streams = self.streams.write();
        if streams.len() >= MAX_STREAMS {
            return Err(Error::InvalidOperation("stream capacity exceeded".into()));
        }
        let id = StreamId(self.next_stream_id.fetch_add(1, Ordering::SeqCst));
        let stream = Arc::new(Stream::new(
            id,
            descriptor,
            kind,
            pool,
            self.backend.clone(),
            self.read_cache.clone(),
        )?);
        streams.insert(id, stream);
        Ok(id)
    }

    /// Reads a committed segment's data for `stream`, through the read
    /// cache with a backend fallback on a miss.
    pub fn read_segment(&self, stream: StreamId, sequence: SequenceNumber) -> Result<Vec<u8>> {
        let stream = self
            .stream(stream)
            .ok_or_else(|| Error::NotFound(format!("stream {stream} not found")))?;
        stream.read_segment(sequence)
    }

    pub fn register_data_pool(&self, name: impl Into<String>) -> Result<()> {
        self.check_unlocked()?;
        self.data_pools.write().insert(name.into(), DataPool::default());
        Ok(())
    }

    pub fn with_data_pool<R>(&self, name: &str, f: impl FnOnce(Option<&DataPool>) -> R) -> R {
        f(self.data_pools.read().get(name))
    }

    pub fn stream(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.streams.read().get(&id).cloned()
    }

    pub fn buffer(&self, id: BufferId) -> Option<Arc<SegmentPool>> {
        self.buffers.read().get(&id).cloned()
    }

    pub fn enumerate_buffers(&self) -> Vec<BufferId> {
        self.buffers.read().keys().copied().collect()
    }

    /// Flips the configuration lock; called once the first segment in
    /// this store reaches the committed state.
    pub fn lock_configuration(&self) {
        self.configuration_locked.store(true, Ordering::SeqCst);
    }

    pub fn is_configuration_locked(&self) -> bool {
        self.configuration_locked.load(Ordering::SeqCst)
    }

    pub fn enumerate_streams(&self, filter: StreamEnumFilter) -> Vec<StreamId> {
        self.streams
            .read()
            .values()
            .filter(|s| {
                let flags = s.descriptor().flags;
                let matches_hidden = flags.contains(StreamFlags::HIDDEN) && filter.contains(StreamEnumFilter::HIDDEN);
                let matches_dynamic = s.is_dynamic() && filter.contains(StreamEnumFilter::DYNAMIC);
                let matches_regular = !flags.contains(StreamFlags::HIDDEN)
                    && !s.is_dynamic()
                    && filter.contains(StreamEnumFilter::REGULAR);
                matches_hidden || matches_dynamic || matches_regular
            })
            .map(|s| s.id())
            .collect()
    }

    pub fn summarize_stream_stats(&self, filter: StreamEnumFilter) -> Vec<StreamQueryInformation> {
        self.enumerate_streams(filter)
            .into_iter()
            .filter_map(|id| self.stream(id))
            .map(|stream| StreamQueryInformation {
                descriptor: stream.descriptor().clone(),
                stats: stream.statistics(),
            })
            .collect()
    }

    pub fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Guid;
    use crate::types::{StreamTypeDescriptor, StreamTypeFlags};

    fn store() -> Store {
        Store::new(Arc::new(MemoryBackend::new()), 2, false)
    }

    fn descriptor() -> StreamDescriptor {
        StreamDescriptor {
            name: "s".into(),
            flags: StreamFlags::NONE,
            stream_type: StreamTypeDescriptor::new("t", Guid::NIL, StreamTypeFlags::NONE, 8).unwrap(),
        }
    }

    #[test]
    fn registration_rejected_once_locked() {
        let store = store();
        let buffer = store.register_stream_buffer(128, 2, false).unwrap();
        store.lock_configuration();
        assert!(store.register_stream(buffer, descriptor(), StreamKind::Regular).is_err());
    }

    #[test]
    fn enumerate_filters_by_hidden_flag() {
        let store = store();
        let buffer = store.register_stream_buffer(128, 2, false).unwrap();
        let mut hidden = descriptor();
        hidden.flags = StreamFlags::HIDDEN;
        store.register_stream(buffer, descriptor(), StreamKind::Regular).unwrap();
        store.register_stream(buffer, hidden, StreamKind::Regular).unwrap();

        let regular = store.enumerate_streams(StreamEnumFilter::REGULAR);
        assert_eq!(regular.len(), 1);
        let all = store.enumerate_streams(StreamEnumFilter::ALL);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn data_pool_round_trips_a_value() {
        let store = store();
        store.register_data_pool("meta").unwrap();
        assert!(store.with_data_pool("missing", |p| p.is_none()));
        assert!(store.with_data_pool("meta", |p| p.is_some()));
    }

    #[test]
    fn read_segment_goes_through_backend_and_populates_cache() {
        let store = store();
        let buffer = store.register_stream_buffer(128, 2, false).unwrap();
        let stream_id = store.register_stream(buffer, descriptor(), StreamKind::Regular).unwrap();
        let stream = store.stream(stream_id).unwrap();
        let (seq, _line) = stream.append().unwrap();
        stream.close(seq, 1, 0, 0).unwrap();

        assert!(!store.read_cache.is_empty());
        let data = store.read_segment(stream_id, seq).unwrap();
        assert_eq!(data.len(), stream.descriptor().stream_type.entry_size() as usize);
    }

    #[test]
    fn read_cache_evicts_oldest_first() {
        let cache = ReadCache::new(2, false);
        cache.insert((StreamId(0), 0), vec![1]);
        cache.insert((StreamId(0), 1), vec![2]);
        cache.insert((StreamId(0), 2), vec![3]);
        assert_eq!(cache.len(), 2);
        assert!(cache.get((StreamId(0), 0)).is_none());
        assert!(cache.get((StreamId(0), 2)).is_some());
    }
}
