use std::sync::Arc;
use std::time::Duration;

use simutrace::buffer::SegmentPool;
use simutrace::handlers::{ControlCode, Dispatcher, HandlerContext, RPC_SUCCESS};
use simutrace::ids::{BufferId, Guid, StreamId};
use simutrace::managers::{SessionManager, StoreManager};
use simutrace::message::{Message, Payload};
use simutrace::store::{MemoryBackend, Store};
use simutrace::stream::{QueryIndexType, Stream, StreamKind, StreamOpenQuery};
use simutrace::types::{
    StreamAccessFlags, StreamDescriptor, StreamFlags, StreamTypeDescriptor, StreamTypeFlags,
};
use simutrace::workers::WorkerPool;

fn context() -> HandlerContext {
    HandlerContext {
        sessions: Arc::new(SessionManager::new()),
        stores: Arc::new(StoreManager::new()),
        processing_pool: Arc::new(WorkerPool::new(1, "test-processing")),
    }
}

#[test]
fn session_create_then_close_round_trip() {
    let ctx = context();
    let dispatcher = Dispatcher::new();

    let create = Message::request(0, ControlCode::SessionCreate as u16, 0x0301, Payload::Embedded { parameter1: 0 });
    let response = dispatcher.dispatch(&ctx, None, (3, 1), &create);
    assert_eq!(response.control_code_or_status, RPC_SUCCESS);
    assert_eq!(ctx.sessions.open_session_count(), 1);

    let session_id = simutrace::ids::SessionId(response.parameter0);
    let close = Message::request(0, ControlCode::SessionClose as u16, 0, Payload::Embedded { parameter1: 0 });
    let response = dispatcher.dispatch(&ctx, Some(session_id), (3, 1), &close);
    assert_eq!(response.control_code_or_status, RPC_SUCCESS);
    assert_eq!(ctx.sessions.open_session_count(), 0);
}

#[test]
fn store_register_append_commit_and_query_by_time() {
    let store = Store::new(Arc::new(MemoryBackend::new()), 4, false);
    let buffer = store.register_stream_buffer(256, 4, false).unwrap();

    let descriptor = StreamDescriptor {
        name: "events".into(),
        flags: StreamFlags::NONE,
        stream_type: StreamTypeDescriptor::new("event_t", Guid::NIL, StreamTypeFlags::NONE, 8).unwrap(),
    };
    let stream_id = store
        .register_stream(buffer, descriptor, StreamKind::Regular)
        .unwrap();
    let stream = store.stream(stream_id).unwrap();

    stream.append().unwrap();
    stream.close(4, 0, 100).unwrap();
    let (seq2, _) = stream.append().unwrap();
    stream.close(6, 4, 200).unwrap();

    let query = StreamOpenQuery {
        kind: QueryIndexType::RealTime,
        value: 150,
        access: StreamAccessFlags::SEQUENTIAL_SCAN,
    };
    let resolved = stream.resolve_query(&query).unwrap();
    assert_eq!(resolved, seq2);

    let stats = stream.statistics();
    assert_eq!(stats.entry_count, 10);
}

#[test]
fn registering_after_first_commit_locks_configuration() {
    let store = Store::new(Arc::new(MemoryBackend::new()), 2, false);
    let buffer = store.register_stream_buffer(256, 2, false).unwrap();
    let descriptor = StreamDescriptor {
        name: "s".into(),
        flags: StreamFlags::NONE,
        stream_type: StreamTypeDescriptor::new("t", Guid::NIL, StreamTypeFlags::NONE, 8).unwrap(),
    };
    let stream_id = store
        .register_stream(buffer, descriptor.clone(), StreamKind::Regular)
        .unwrap();
    let stream = store.stream(stream_id).unwrap();
    stream.append().unwrap();
    stream.close(1, 0, 0).unwrap();
    store.lock_configuration();

    assert!(store.register_stream(buffer, descriptor, StreamKind::Regular).is_err());
}

#[test]
fn buffer_pool_exhaustion_and_recovery() {
    let pool = SegmentPool::new(BufferId(0), 64, 1, false, 1, Duration::from_millis(1));
    let line = pool.allocate().unwrap();
    assert!(pool.allocate().is_err());
    pool.release(simutrace::ids::SegmentId(0), line);
    assert!(pool.allocate().is_ok());
}

#[test]
fn variable_entry_block_chain_survives_many_appends() {
    use simutrace::types::{read_variable_data, write_variable_data};

    let block_size = 8;
    let mut buf = vec![0u8; block_size * 10];
    let payload: Vec<u8> = (0u8..30).collect();
    let blocks = write_variable_data(&mut buf, block_size, &payload).unwrap();
    assert!(blocks > 1);
    let read_back = read_variable_data(&buf, block_size).unwrap();
    assert_eq!(read_back, payload);
}

#[tokio::test]
async fn session_manager_close_drains_sessions_without_new_arrivals() {
    let manager = SessionManager::new();
    manager.create_session((3, 1)).unwrap();
    manager.create_session((3, 1)).unwrap();
    manager.close().await;
    assert_eq!(manager.open_session_count(), 0);
    assert!(manager.create_session((3, 1)).is_err());
}

#[test]
fn store_manager_deduplicates_same_path_open() {
    let manager = StoreManager::new();
    let store = Arc::new(Store::new(Arc::new(MemoryBackend::new()), 2, false));
    let first = manager.register("/tmp/store-a", store.clone());
    let second = manager.register("/tmp/store-a", Arc::new(Store::new(Arc::new(MemoryBackend::new()), 2, false)));
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(manager.open_store_count(), 1);
}

#[test]
fn stream_name_validation_rejects_empty_name() {
    let pool = Arc::new(SegmentPool::new(BufferId(0), 64, 2, false, 1, Duration::from_millis(1)));
    let descriptor = StreamDescriptor {
        name: "".into(),
        flags: StreamFlags::NONE,
        stream_type: StreamTypeDescriptor::new("t", Guid::NIL, StreamTypeFlags::NONE, 8).unwrap(),
    };
    let err = Stream::new(StreamId(0), descriptor, StreamKind::Regular, pool).unwrap_err();
    assert!(matches!(err, simutrace::error::Error::Argument(_)));
}
