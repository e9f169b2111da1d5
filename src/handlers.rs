//! Request dispatch: control codes, the version-keyed dispatch table,
//! and the handlers that turn a decoded `Message` into session/store
//! operations.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, NetworkErrorKind, Result};
use crate::ids::SessionId;
use crate::managers::{SessionManager, StoreManager};
use crate::message::{Message, Payload, PayloadType};
use crate::store::Store;
use crate::workers::{Priority, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ControlCode {
    Null = 0x0000,
    EnumerateSessions = 0x0001,
    SessionCreate = 0x0010,
    SessionOpen = 0x0011,
    SessionQuery = 0x0012,
    SessionClose = 0x0013,
    SessionSetConfiguration = 0x0014,
    StoreCreate = 0x0020,
    StoreClose = 0x0021,
    StreamBufferRegister = 0x0022,
    StreamBufferEnumerate = 0x0023,
    StreamBufferQuery = 0x0024,
    StreamRegister = 0x0030,
    StreamEnumerate = 0x0031,
    StreamQuery = 0x0032,
    StreamAppend = 0x0033,
    StreamCloseAndOpen = 0x0034,
    StreamClose = 0x0035,
}

impl ControlCode {
    pub fn from_u16(code: u16) -> Option<Self> {
        use ControlCode::*;
        let all = [
            Null,
            EnumerateSessions,
            SessionCreate,
            SessionOpen,
            SessionQuery,
            SessionClose,
            SessionSetConfiguration,
            StoreCreate,
            StoreClose,
            StreamBufferRegister,
            StreamBufferEnumerate,
            StreamBufferQuery,
            StreamRegister,
            StreamEnumerate,
            StreamQuery,
            StreamAppend,
            StreamCloseAndOpen,
            StreamClose,
        ];
        all.into_iter().find(|c| *c as u16 == code)
    }
}

pub const RPC_SUCCESS: u16 = 0x0000;
pub const RPC_FAILED: u16 = 0x0001;

/// Shared state every handler needs: the session/store registries. The
/// handler never touches a concrete `Port`, so it can be exercised with
/// a `LocalPort` in tests exactly as a `TcpPort` drives it in
/// production.
pub struct HandlerContext {
    pub sessions: Arc<SessionManager>,
    pub stores: Arc<StoreManager>,
    /// Segment encode + backend I/O is handed off here at `Priority::Low`
    /// rather than run on the request-handling thread, so a slow backend
    /// write never delays other requests ahead of it in the request pool.
    pub processing_pool: Arc<WorkerPool>,
}

/// Runs `close` (or `close_and_open`) on `ctx.processing_pool` and blocks
/// for its result. The handler thread itself already runs off of a
/// worker pool, so blocking here just hands the (possibly slow) backend
/// write to a dedicated pool instead of occupying a request-pool slot.
fn run_on_processing_pool<T: Send + 'static>(
    ctx: &HandlerContext,
    job: impl FnOnce() -> Result<T> + Send + 'static,
) -> Result<T> {
    let (tx, rx) = std::sync::mpsc::channel();
    ctx.processing_pool.submit(Priority::Low, move || {
        let _ = tx.send(job());
    });
    rx.recv()
        .map_err(|_| Error::InvalidOperation("processing pool dropped segment close job".into()))?
}

type HandlerFn = fn(&HandlerContext, Option<SessionId>, &Message) -> Result<Message>;

/// `(major, minor, control_code) -> handler`. Entries registered for
/// both 3.0 and 3.1 point at the same handler; `StreamCloseAndOpen`'s
/// two versions differ in response payload shape and get distinct
/// entries.
pub struct Dispatcher {
    table: HashMap<(u8, u8, u16), HandlerFn>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let mut table: HashMap<(u8, u8, u16), HandlerFn> = HashMap::new();

        for &(major, minor) in &[(3u8, 0u8), (3u8, 1u8)] {
            table.insert((major, minor, ControlCode::Null as u16), handle_null);
            table.insert(
                (major, minor, ControlCode::EnumerateSessions as u16),
                handle_enumerate_sessions,
            );
            table.insert((major, minor, ControlCode::SessionCreate as u16), handle_session_create);
            table.insert((major, minor, ControlCode::SessionOpen as u16), handle_session_open);
            table.insert((major, minor, ControlCode::SessionQuery as u16), handle_session_query);
            table.insert((major, minor, ControlCode::SessionClose as u16), handle_session_close);
            table.insert(
                (major, minor, ControlCode::SessionSetConfiguration as u16),
                handle_session_set_configuration,
            );
            table.insert((major, minor, ControlCode::StoreCreate as u16), handle_store_create);
            table.insert((major, minor, ControlCode::StoreClose as u16), handle_store_close);
            table.insert(
                (major, minor, ControlCode::StreamBufferRegister as u16),
                handle_stream_buffer_register,
            );
            table.insert(
                (major, minor, ControlCode::StreamBufferEnumerate as u16),
                handle_stream_buffer_enumerate,
            );
            table.insert(
                (major, minor, ControlCode::StreamBufferQuery as u16),
                handle_stream_buffer_query,
            );
            table.insert((major, minor, ControlCode::StreamRegister as u16), handle_stream_register);
            table.insert((major, minor, ControlCode::StreamEnumerate as u16), handle_stream_enumerate);
            table.insert((major, minor, ControlCode::StreamQuery as u16), handle_stream_query);
            table.insert((major, minor, ControlCode::StreamAppend as u16), handle_stream_append);
            table.insert((major, minor, ControlCode::StreamClose as u16), handle_stream_close);
        }

        // Version-divergent: 3.1 returns {SegmentId, offset}, 3.0
        // returns {StreamSegmentId, SegmentId}. Both route to the same
        // underlying stream operation; only the response shape differs.
        table.insert(
            (3, 1, ControlCode::StreamCloseAndOpen as u16),
            handle_stream_close_and_open_v31,
        );
        table.insert(
            (3, 0, ControlCode::StreamCloseAndOpen as u16),
            handle_stream_close_and_open_v30,
        );

        Dispatcher { table }
    }

    pub fn dispatch(
        &self,
        ctx: &HandlerContext,
        session: Option<SessionId>,
        version: (u8, u8),
        message: &Message,
    ) -> Message {
        let code = message.control_code_or_status;
        let outcome = ControlCode::from_u16(code)
            .ok_or_else(|| Error::network(NetworkErrorKind::RpcMessageMalformed, "unknown control code"))
            .and_then(|_| {
                self.table
                    .get(&(version.0, version.1, code))
                    .ok_or(Error::NotImplemented)
                    .and_then(|handler| handler(ctx, session, message))
            });

        match outcome {
            Ok(response) => response,
            Err(err) => error_response(message.sequence_number, &err),
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn error_response(sequence_number: u8, err: &Error) -> Message {
    tracing::warn!(error = %err, "request handler failed");
    Message::response(
        sequence_number,
        RPC_FAILED,
        0,
        Payload::Data {
            parameter1: 0,
            bytes: err.to_string().into_bytes(),
        },
    )
}

fn handle_null(_ctx: &HandlerContext, _session: Option<SessionId>, msg: &Message) -> Result<Message> {
    Ok(Message::response(msg.sequence_number, RPC_SUCCESS, 0, Payload::Embedded { parameter1: 0 }))
}

fn handle_enumerate_sessions(
    ctx: &HandlerContext,
    _session: Option<SessionId>,
    msg: &Message,
) -> Result<Message> {
    if !msg.test(PayloadType::Embedded, None) {
        return Err(Error::network(NetworkErrorKind::RpcMessageMalformed, "expected embedded payload"));
    }
    let count = ctx.sessions.open_session_count() as u64;
    Ok(Message::response(msg.sequence_number, RPC_SUCCESS, 0, Payload::Embedded { parameter1: count }))
}

fn handle_session_create(
    ctx: &HandlerContext,
    _session: Option<SessionId>,
    msg: &Message,
) -> Result<Message> {
    if !msg.test(PayloadType::Embedded, None) {
        return Err(Error::network(NetworkErrorKind::RpcMessageMalformed, "expected embedded payload"));
    }
    let major = (msg.parameter0 >> 8) as u8;
    let minor = msg.parameter0 as u8;
    let session = ctx.sessions.create_session((major, minor))?;
    Ok(Message::response(
        msg.sequence_number,
        RPC_SUCCESS,
        session.id().0,
        Payload::Embedded { parameter1: 0 },
    ))
}

fn handle_session_close(
    ctx: &HandlerContext,
    session: Option<SessionId>,
    msg: &Message,
) -> Result<Message> {
    let id = session.ok_or(Error::InvalidOperation("no active session".into()))?;
    if let Some(session) = ctx.sessions.get_session(id) {
        if session.detach() {
            session.close_store();
            ctx.sessions.release_session(id);
        }
    }
    Ok(Message::response(msg.sequence_number, RPC_SUCCESS, 0, Payload::Embedded { parameter1: 0 }))
}

/// Looks up the session and its currently open store, the combination
/// nearly every store/stream-scoped handler below needs first.
fn session_store(ctx: &HandlerContext, session: Option<SessionId>) -> Result<Arc<Store>> {
    let id = session.ok_or(Error::InvalidOperation("no active session".into()))?;
    let session = ctx
        .sessions
        .get_session(id)
        .ok_or_else(|| Error::NotFound(format!("session {id} not found")))?;
    session.store().ok_or(Error::InvalidOperation("no store open".into()))
}

fn data_bytes(msg: &Message) -> &[u8] {
    match &msg.payload {
        Payload::Data { bytes, .. } => bytes,
        _ => unreachable!("checked by msg.test above"),
    }
}

fn handle_session_open(
    ctx: &HandlerContext,
    _session: Option<SessionId>,
    msg: &Message,
) -> Result<Message> {
    if !msg.test(PayloadType::Embedded, None) {
        return Err(Error::network(NetworkErrorKind::RpcMessageMalformed, "expected embedded payload"));
    }
    let id = SessionId(msg.parameter0);
    let session = ctx
        .sessions
        .get_session(id)
        .ok_or_else(|| Error::NotFound(format!("session {id} not found")))?;
    session.attach();
    Ok(Message::response(
        msg.sequence_number,
        RPC_SUCCESS,
        id.0,
        Payload::Embedded {
            parameter1: session.reference_count() as u64,
        },
    ))
}

#[derive(Serialize)]
struct SessionQueryResponse {
    major: u8,
    minor: u8,
    reference_count: u32,
    has_store: bool,
}

fn handle_session_query(
    ctx: &HandlerContext,
    session: Option<SessionId>,
    msg: &Message,
) -> Result<Message> {
    if !msg.test(PayloadType::Embedded, None) {
        return Err(Error::network(NetworkErrorKind::RpcMessageMalformed, "expected embedded payload"));
    }
    let id = session.ok_or(Error::InvalidOperation("no active session".into()))?;
    let session = ctx
        .sessions
        .get_session(id)
        .ok_or_else(|| Error::NotFound(format!("session {id} not found")))?;
    let (major, minor) = session.peer_version();
    let response = SessionQueryResponse {
        major,
        minor,
        reference_count: session.reference_count(),
        has_store: session.has_store(),
    };
    let bytes = serde_json::to_vec(&response)
        .map_err(|e| Error::InvalidOperation(format!("failed to encode session query response: {e}")))?;
    Ok(Message::response(
        msg.sequence_number,
        RPC_SUCCESS,
        id.0,
        Payload::Data {
            parameter1: bytes.len() as u32,
            bytes,
        },
    ))
}

#[derive(Deserialize)]
struct StoreCreateRequest {
    name: String,
    always_create: bool,
}

fn handle_store_create(
    ctx: &HandlerContext,
    session: Option<SessionId>,
    msg: &Message,
) -> Result<Message> {
    if !msg.test(PayloadType::Data, None) {
        return Err(Error::network(NetworkErrorKind::RpcMessageMalformed, "expected data payload"));
    }
    let id = session.ok_or(Error::InvalidOperation("no active session".into()))?;
    let session = ctx
        .sessions
        .get_session(id)
        .ok_or_else(|| Error::NotFound(format!("session {id} not found")))?;
    let request: StoreCreateRequest = serde_json::from_slice(data_bytes(msg))
        .map_err(|e| Error::Argument(format!("malformed store create payload: {e}")))?;

    let existing = ctx.stores.find(&request.name);
    let (store, outcome) = session.open_or_create_store(existing, request.always_create);
    ctx.stores.register(&request.name, store);

    Ok(Message::response(
        msg.sequence_number,
        RPC_SUCCESS,
        outcome as u32,
        Payload::Embedded { parameter1: 0 },
    ))
}

fn handle_store_close(
    ctx: &HandlerContext,
    session: Option<SessionId>,
    msg: &Message,
) -> Result<Message> {
    let id = session.ok_or(Error::InvalidOperation("no active session".into()))?;
    let session = ctx
        .sessions
        .get_session(id)
        .ok_or_else(|| Error::NotFound(format!("session {id} not found")))?;
    session.close_store();
    Ok(Message::response(msg.sequence_number, RPC_SUCCESS, 0, Payload::Embedded { parameter1: 0 }))
}

#[derive(Deserialize)]
struct StreamBufferRegisterRequest {
    segment_size: usize,
    num_segments: usize,
    shared: bool,
}

fn handle_stream_buffer_register(
    ctx: &HandlerContext,
    session: Option<SessionId>,
    msg: &Message,
) -> Result<Message> {
    if !msg.test(PayloadType::Data, None) {
        return Err(Error::network(NetworkErrorKind::RpcMessageMalformed, "expected data payload"));
    }
    let store = session_store(ctx, session)?;
    let request: StreamBufferRegisterRequest = serde_json::from_slice(data_bytes(msg))
        .map_err(|e| Error::Argument(format!("malformed stream buffer payload: {e}")))?;
    let buffer_id = store.register_stream_buffer(request.segment_size, request.num_segments, request.shared)?;
    Ok(Message::response(
        msg.sequence_number,
        RPC_SUCCESS,
        buffer_id.0,
        Payload::Embedded { parameter1: 0 },
    ))
}

fn handle_stream_buffer_enumerate(
    ctx: &HandlerContext,
    session: Option<SessionId>,
    msg: &Message,
) -> Result<Message> {
    if !msg.test(PayloadType::Embedded, None) {
        return Err(Error::network(NetworkErrorKind::RpcMessageMalformed, "expected embedded payload"));
    }
    let store = session_store(ctx, session)?;
    let ids: Vec<u32> = store.enumerate_buffers().into_iter().map(|id| id.0).collect();
    let count = ids.len() as u32;
    let bytes = serde_json::to_vec(&ids).map_err(|e| Error::InvalidOperation(format!("failed to encode buffer list: {e}")))?;
    Ok(Message::response(
        msg.sequence_number,
        RPC_SUCCESS,
        count,
        Payload::Data {
            parameter1: bytes.len() as u32,
            bytes,
        },
    ))
}

#[derive(Serialize)]
struct StreamBufferQueryResponse {
    num_segments: usize,
    free_count: usize,
}

fn handle_stream_buffer_query(
    ctx: &HandlerContext,
    session: Option<SessionId>,
    msg: &Message,
) -> Result<Message> {
    if !msg.test(PayloadType::Embedded, None) {
        return Err(Error::network(NetworkErrorKind::RpcMessageMalformed, "expected embedded payload"));
    }
    let store = session_store(ctx, session)?;
    let buffer_id = crate::ids::BufferId(msg.parameter0);
    let buffer = store
        .buffer(buffer_id)
        .ok_or_else(|| Error::NotFound(format!("buffer {buffer_id} not found")))?;
    let response = StreamBufferQueryResponse {
        num_segments: buffer.num_segments(),
        free_count: buffer.free_count(),
    };
    let bytes = serde_json::to_vec(&response)
        .map_err(|e| Error::InvalidOperation(format!("failed to encode buffer query response: {e}")))?;
    Ok(Message::response(
        msg.sequence_number,
        RPC_SUCCESS,
        buffer_id.0,
        Payload::Data {
            parameter1: bytes.len() as u32,
            bytes,
        },
    ))
}

#[derive(Deserialize)]
struct StreamRegisterRequest {
    buffer_id: u32,
    name: String,
    stream_type_name: String,
    entry_size: u32,
    variable: bool,
    temporal_order: bool,
    hidden: bool,
}

fn handle_stream_register(
    ctx: &HandlerContext,
    session: Option<SessionId>,
    msg: &Message,
) -> Result<Message> {
    if !msg.test(PayloadType::Data, None) {
        return Err(Error::network(NetworkErrorKind::RpcMessageMalformed, "expected data payload"));
    }
    let store = session_store(ctx, session)?;
    let request: StreamRegisterRequest = serde_json::from_slice(data_bytes(msg))
        .map_err(|e| Error::Argument(format!("malformed stream register payload: {e}")))?;

    let mut type_flags = crate::types::StreamTypeFlags::NONE;
    if request.temporal_order {
        type_flags |= crate::types::StreamTypeFlags::TEMPORAL_ORDER;
    }
    let encoded_entry_size = if request.variable {
        crate::types::make_variable_entry_size(request.entry_size)
    } else {
        request.entry_size
    };
    let stream_type = crate::types::StreamTypeDescriptor::new(
        request.stream_type_name,
        crate::ids::Guid::NIL,
        type_flags,
        encoded_entry_size,
    )?;

    let mut flags = crate::types::StreamFlags::NONE;
    if request.hidden {
        flags |= crate::types::StreamFlags::HIDDEN;
    }
    let descriptor = crate::types::StreamDescriptor {
        name: request.name,
        flags,
        stream_type,
    };

    let stream_id = store.register_stream(
        crate::ids::BufferId(request.buffer_id),
        descriptor,
        crate::stream::StreamKind::Regular,
    )?;
    Ok(Message::response(
        msg.sequence_number,
        RPC_SUCCESS,
        stream_id.0,
        Payload::Embedded { parameter1: 0 },
    ))
}

fn handle_stream_enumerate(
    ctx: &HandlerContext,
    session: Option<SessionId>,
    msg: &Message,
) -> Result<Message> {
    if !msg.test(PayloadType::Embedded, None) {
        return Err(Error::network(NetworkErrorKind::RpcMessageMalformed, "expected embedded payload"));
    }
    let store = session_store(ctx, session)?;
    let filter = crate::types::StreamEnumFilter::from_bits_truncate(msg.parameter0);
    let ids: Vec<u32> = store.enumerate_streams(filter).into_iter().map(|id| id.0).collect();
    let count = ids.len() as u32;
    let bytes = serde_json::to_vec(&ids).map_err(|e| Error::InvalidOperation(format!("failed to encode stream list: {e}")))?;
    Ok(Message::response(
        msg.sequence_number,
        RPC_SUCCESS,
        count,
        Payload::Data {
            parameter1: bytes.len() as u32,
            bytes,
        },
    ))
}

#[derive(Serialize, Deserialize)]
struct StreamQueryResponse {
    name: String,
    entry_count: u64,
    raw_entry_count: u64,
    index_start: u64,
    index_end: u64,
}

fn handle_stream_query(
    ctx: &HandlerContext,
    session: Option<SessionId>,
    msg: &Message,
) -> Result<Message> {
    if !msg.test(PayloadType::Embedded, None) {
        return Err(Error::network(NetworkErrorKind::RpcMessageMalformed, "expected embedded payload"));
    }
    let store = session_store(ctx, session)?;
    let stream_id = crate::ids::StreamId(msg.parameter0);
    let stream = store
        .stream(stream_id)
        .ok_or_else(|| Error::NotFound(format!("stream {stream_id} not found")))?;
    let stats = stream.statistics();
    let response = StreamQueryResponse {
        name: stream.descriptor().name.clone(),
        entry_count: stats.entry_count,
        raw_entry_count: stats.raw_entry_count,
        index_start: stats.ranges.index.start,
        index_end: stats.ranges.index.end,
    };
    let bytes = serde_json::to_vec(&response)
        .map_err(|e| Error::InvalidOperation(format!("failed to encode stream query response: {e}")))?;
    Ok(Message::response(
        msg.sequence_number,
        RPC_SUCCESS,
        stream_id.0,
        Payload::Data {
            parameter1: bytes.len() as u32,
            bytes,
        },
    ))
}

fn handle_stream_append(
    ctx: &HandlerContext,
    session: Option<SessionId>,
    msg: &Message,
) -> Result<Message> {
    if !msg.test(PayloadType::Embedded, None) {
        return Err(Error::network(NetworkErrorKind::RpcMessageMalformed, "expected embedded payload"));
    }
    let store = session_store(ctx, session)?;
    let stream_id = crate::ids::StreamId(msg.parameter0);
    let stream = store
        .stream(stream_id)
        .ok_or_else(|| Error::NotFound(format!("stream {stream_id} not found")))?;
    let (sequence, line) = stream.append()?;
    Ok(Message::response(
        msg.sequence_number,
        RPC_SUCCESS,
        line as u32,
        Payload::Embedded { parameter1: sequence },
    ))
}

#[derive(Deserialize)]
struct StreamCloseRequest {
    sequence_number: crate::ids::SequenceNumber,
    raw_entry_count: u32,
    start_cycle: u64,
    start_time: u64,
}

fn handle_stream_close(
    ctx: &HandlerContext,
    session: Option<SessionId>,
    msg: &Message,
) -> Result<Message> {
    if !msg.test(PayloadType::Data, None) {
        return Err(Error::network(NetworkErrorKind::RpcMessageMalformed, "expected data payload"));
    }
    let store = session_store(ctx, session)?;
    let stream_id = crate::ids::StreamId(msg.parameter0);
    let stream = store
        .stream(stream_id)
        .ok_or_else(|| Error::NotFound(format!("stream {stream_id} not found")))?;
    let request: StreamCloseRequest = serde_json::from_slice(data_bytes(msg))
        .map_err(|e| Error::Argument(format!("malformed stream close payload: {e}")))?;

    run_on_processing_pool(ctx, move || {
        stream.close(request.sequence_number, request.raw_entry_count, request.start_cycle, request.start_time)
    })?;

    // The first committed segment in a store freezes its buffer/stream
    // registration, per Store::lock_configuration's contract.
    store.lock_configuration();
    Ok(Message::response(msg.sequence_number, RPC_SUCCESS, 0, Payload::Embedded { parameter1: 0 }))
}

fn handle_session_set_configuration(
    ctx: &HandlerContext,
    session: Option<SessionId>,
    msg: &Message,
) -> Result<Message> {
    if !msg.test(PayloadType::Data, None) {
        return Err(Error::network(NetworkErrorKind::RpcMessageMalformed, "expected data payload"));
    }
    let id = session.ok_or(Error::InvalidOperation("no active session".into()))?;
    let session = ctx
        .sessions
        .get_session(id)
        .ok_or_else(|| Error::NotFound(format!("session {id} not found")))?;

    let payload = std::str::from_utf8(data_bytes(msg))
        .map_err(|_| Error::network(NetworkErrorKind::RpcMessageMalformed, "configuration payload is not utf-8"))?;
    session.apply_settings_from_json(payload)?;

    Ok(Message::response(msg.sequence_number, RPC_SUCCESS, 0, Payload::Embedded { parameter1: 0 }))
}

fn handle_stream_close_and_open_v31(
    ctx: &HandlerContext,
    session: Option<SessionId>,
    msg: &Message,
) -> Result<Message> {
    let (segment_id, offset) = close_and_open_common(ctx, session, msg)?;
    Ok(Message::response(
        msg.sequence_number,
        RPC_SUCCESS,
        segment_id,
        Payload::Embedded {
            parameter1: offset as u64,
        },
    ))
}

fn handle_stream_close_and_open_v30(
    ctx: &HandlerContext,
    session: Option<SessionId>,
    msg: &Message,
) -> Result<Message> {
    let (segment_id, _offset) = close_and_open_common(ctx, session, msg)?;
    // v3.0 response shape is {StreamSegmentId, SegmentId} rather than
    // {SegmentId, offset}; the stream segment link doubles as
    // parameter0 here since this crate's segment ids already encode
    // the owning stream via the control element's link field.
    Ok(Message::response(
        msg.sequence_number,
        RPC_SUCCESS,
        segment_id,
        Payload::Embedded {
            parameter1: segment_id as u64,
        },
    ))
}

fn close_and_open_common(
    ctx: &HandlerContext,
    session: Option<SessionId>,
    msg: &Message,
) -> Result<(u32, usize)> {
    if !msg.test(PayloadType::Data, None) {
        return Err(Error::network(NetworkErrorKind::RpcMessageMalformed, "expected data payload"));
    }
    let store = session_store(ctx, session)?;
    let stream_id = crate::ids::StreamId(msg.parameter0);
    let stream = store.stream(stream_id).ok_or_else(|| Error::NotFound(format!("stream {stream_id} not found")))?;

    let request: StreamCloseRequest = serde_json::from_slice(data_bytes(msg))
        .map_err(|e| Error::Argument(format!("malformed close-and-open payload: {e}")))?;

    let (_sequence, line) = run_on_processing_pool(ctx, move || {
        stream.close_and_open(request.sequence_number, request.raw_entry_count, request.start_cycle, request.start_time)
    })?;
    store.lock_configuration();
    Ok((stream_id.0, line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, Payload};

    fn context() -> HandlerContext {
        HandlerContext {
            sessions: Arc::new(SessionManager::new()),
            stores: Arc::new(StoreManager::new()),
            processing_pool: Arc::new(WorkerPool::new(1, "test-processing")),
        }
    }

    #[test]
    fn dispatches_null_to_success() {
        let ctx = context();
        let dispatcher = Dispatcher::new();
        let request = Message::request(0, ControlCode::Null as u16, 0, Payload::Embedded { parameter1: 0 });
        let response = dispatcher.dispatch(&ctx, None, (3, 1), &request);
        assert_eq!(response.control_code_or_status, RPC_SUCCESS);
    }

    #[test]
    fn unknown_control_code_returns_failure() {
        let ctx = context();
        let dispatcher = Dispatcher::new();
        let request = Message::request(0, 0xFFFF, 0, Payload::Embedded { parameter1: 0 });
        let response = dispatcher.dispatch(&ctx, None, (3, 1), &request);
        assert_eq!(response.control_code_or_status, RPC_FAILED);
    }

    #[test]
    fn set_configuration_applies_json_payload() {
        let ctx = context();
        let dispatcher = Dispatcher::new();
        let create = Message::request(0, ControlCode::SessionCreate as u16, 0x0301, Payload::Embedded { parameter1: 0 });
        let created = dispatcher.dispatch(&ctx, None, (3, 1), &create);
        let session_id = crate::ids::SessionId(created.parameter0);

        let config = Message::request(
            0,
            ControlCode::SessionSetConfiguration as u16,
            0,
            Payload::Data {
                parameter1: 0,
                bytes: br#"{"cache.size": 4}"#.to_vec(),
            },
        );
        let response = dispatcher.dispatch(&ctx, Some(session_id), (3, 1), &config);
        assert_eq!(response.control_code_or_status, RPC_SUCCESS);
    }

    #[test]
    fn session_create_allocates_a_session() {
        let ctx = context();
        let dispatcher = Dispatcher::new();
        let request = Message::request(0, ControlCode::SessionCreate as u16, 0x0301, Payload::Embedded { parameter1: 0 });
        let response = dispatcher.dispatch(&ctx, None, (3, 1), &request);
        assert_eq!(response.control_code_or_status, RPC_SUCCESS);
        assert_eq!(ctx.sessions.open_session_count(), 1);
    }

    #[test]
    fn full_session_to_stream_close_round_trip() {
        let ctx = context();
        let dispatcher = Dispatcher::new();

        let create = Message::request(0, ControlCode::SessionCreate as u16, 0x0301, Payload::Embedded { parameter1: 0 });
        let session_id = SessionId(dispatcher.dispatch(&ctx, None, (3, 1), &create).parameter0);

        let store_create = Message::request(
            0,
            ControlCode::StoreCreate as u16,
            0,
            Payload::Data {
                parameter1: 0,
                bytes: br#"{"name": "s0", "always_create": false}"#.to_vec(),
            },
        );
        let response = dispatcher.dispatch(&ctx, Some(session_id), (3, 1), &store_create);
        assert_eq!(response.control_code_or_status, RPC_SUCCESS);
        assert_eq!(ctx.stores.open_store_count(), 1);

        let buffer_register = Message::request(
            0,
            ControlCode::StreamBufferRegister as u16,
            0,
            Payload::Data {
                parameter1: 0,
                bytes: br#"{"segment_size": 256, "num_segments": 2, "shared": false}"#.to_vec(),
            },
        );
        let response = dispatcher.dispatch(&ctx, Some(session_id), (3, 1), &buffer_register);
        assert_eq!(response.control_code_or_status, RPC_SUCCESS);
        let buffer_id = response.parameter0;

        let stream_register = Message::request(
            0,
            ControlCode::StreamRegister as u16,
            0,
            Payload::Data {
                parameter1: 0,
                bytes: serde_json::to_vec(&serde_json::json!({
                    "buffer_id": buffer_id,
                    "name": "events",
                    "stream_type_name": "event_t",
                    "entry_size": 8,
                    "variable": false,
                    "temporal_order": false,
                    "hidden": false,
                }))
                .unwrap(),
            },
        );
        let response = dispatcher.dispatch(&ctx, Some(session_id), (3, 1), &stream_register);
        assert_eq!(response.control_code_or_status, RPC_SUCCESS);
        let stream_id = response.parameter0;

        let enumerate = Message::request(
            0,
            ControlCode::StreamEnumerate as u16,
            crate::types::StreamEnumFilter::ALL.bits(),
            Payload::Embedded { parameter1: 0 },
        );
        let response = dispatcher.dispatch(&ctx, Some(session_id), (3, 1), &enumerate);
        assert_eq!(response.control_code_or_status, RPC_SUCCESS);
        assert_eq!(response.parameter0, 1);

        let append = Message::request(0, ControlCode::StreamAppend as u16, stream_id, Payload::Embedded { parameter1: 0 });
        let response = dispatcher.dispatch(&ctx, Some(session_id), (3, 1), &append);
        assert_eq!(response.control_code_or_status, RPC_SUCCESS);
        let sequence_number = match response.payload {
            Payload::Embedded { parameter1 } => parameter1,
            _ => panic!("expected embedded payload"),
        };

        let close = Message::request(
            0,
            ControlCode::StreamClose as u16,
            stream_id,
            Payload::Data {
                parameter1: 0,
                bytes: serde_json::to_vec(&serde_json::json!({
                    "sequence_number": sequence_number,
                    "raw_entry_count": 3,
                    "start_cycle": 0,
                    "start_time": 100,
                }))
                .unwrap(),
            },
        );
        let response = dispatcher.dispatch(&ctx, Some(session_id), (3, 1), &close);
        assert_eq!(response.control_code_or_status, RPC_SUCCESS);

        let query = Message::request(0, ControlCode::StreamQuery as u16, stream_id, Payload::Embedded { parameter1: 0 });
        let response = dispatcher.dispatch(&ctx, Some(session_id), (3, 1), &query);
        assert_eq!(response.control_code_or_status, RPC_SUCCESS);
        let info: StreamQueryResponse = serde_json::from_slice(data_bytes(&response)).unwrap();
        assert_eq!(info.entry_count, 3);
    }

    #[test]
    fn session_open_attaches_a_reference() {
        let ctx = context();
        let dispatcher = Dispatcher::new();
        let create = Message::request(0, ControlCode::SessionCreate as u16, 0x0301, Payload::Embedded { parameter1: 0 });
        let session_id = SessionId(dispatcher.dispatch(&ctx, None, (3, 1), &create).parameter0);

        let open = Message::request(0, ControlCode::SessionOpen as u16, session_id.0, Payload::Embedded { parameter1: 0 });
        let response = dispatcher.dispatch(&ctx, None, (3, 1), &open);
        assert_eq!(response.control_code_or_status, RPC_SUCCESS);
        assert_eq!(ctx.sessions.get_session(session_id).unwrap().reference_count(), 2);
    }
}
