//! Root server context and the accept/shutdown loop. Every component is
//! constructed from and holds a reference to this context rather than
//! reaching for global or thread-local state.

use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::{Binding, ServerConfig};
use crate::error::{Error, Result};
use crate::handlers::{Dispatcher, HandlerContext};
use crate::managers::{SessionManager, StoreManager};
use crate::message::TcpPort;
use crate::workers::WorkerPool;

pub struct RootContext {
    pub config: ServerConfig,
    pub sessions: Arc<SessionManager>,
    pub stores: Arc<StoreManager>,
    pub request_pool: Arc<WorkerPool>,
    pub processing_pool: Arc<WorkerPool>,
    pub dispatcher: Arc<Dispatcher>,
}

impl RootContext {
    pub fn new(config: ServerConfig) -> Self {
        let request_pool = Arc::new(WorkerPool::new(config.server.requestworkerpool.size, "request"));
        let processing_pool = Arc::new(WorkerPool::new(config.server.workerpool.size, "processing"));

        RootContext {
            config,
            sessions: Arc::new(SessionManager::new()),
            stores: Arc::new(StoreManager::new()),
            request_pool,
            processing_pool,
            dispatcher: Arc::new(Dispatcher::new()),
        }
    }

    fn handler_context(&self) -> HandlerContext {
        HandlerContext {
            sessions: self.sessions.clone(),
            stores: self.stores.clone(),
            processing_pool: self.processing_pool.clone(),
        }
    }
}

/// Dispatches one decoded request on `root.request_pool` and awaits its
/// result, so request handling runs on the dedicated request worker
/// pool rather than a generic async-executor blocking slot.
async fn dispatch_on_request_pool(
    root: &Arc<RootContext>,
    session: Option<crate::ids::SessionId>,
    message: crate::message::Message,
) -> crate::message::Message {
    let ctx = root.handler_context();
    let dispatcher = root.dispatcher.clone();
    let version = (3, 1);
    let (tx, rx) = tokio::sync::oneshot::channel();

    root.request_pool.submit(crate::workers::Priority::Normal, move || {
        let response = dispatcher.dispatch(&ctx, session, version, &message);
        let _ = tx.send(response);
    });

    rx.await.unwrap_or_else(|_| {
        crate::message::Message::response(
            0,
            crate::handlers::RPC_FAILED,
            0,
            crate::message::Payload::Embedded { parameter1: 0 },
        )
    })
}

async fn serve_connection(root: Arc<RootContext>, stream: tokio::net::TcpStream) {
    let mut port = TcpPort::new(stream);
    let mut session: Option<crate::ids::SessionId> = None;

    loop {
        let message = match port.receive().await {
            Ok(m) => m,
            Err(_) => break,
        };

        let is_session_create =
            message.control_code_or_status == crate::handlers::ControlCode::SessionCreate as u16;

        let response = dispatch_on_request_pool(&root, session, message).await;

        if session.is_none() && is_session_create && response.control_code_or_status == crate::handlers::RPC_SUCCESS {
            session = Some(crate::ids::SessionId(response.parameter0));
        }

        if port.send(&response).await.is_err() {
            break;
        }
    }
}

/// Binds every configured binding and serves connections until
/// `shutdown` resolves, then stops accepting new sessions, closes
/// existing ones, and closes both worker pools.
pub async fn run(root: Arc<RootContext>, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
    let bindings = Binding::parse_list(&root.config.server.bindings)?;

    let mut listeners = Vec::new();
    for binding in &bindings {
        if let Binding::Socket { host, port } = binding {
            let addr = format!("{}:{}", if host == "*" { "0.0.0.0" } else { host }, port);
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(Error::Platform)?;
            tracing::info!(address = %addr, "listening");
            listeners.push(listener);
        } else {
            tracing::warn!(?binding, "local bindings are not yet accepted over TCP accept loop");
        }
    }

    if listeners.is_empty() {
        return Err(Error::Configuration("no socket bindings to serve".into()));
    }

    // Each listener gets its own accept task forwarding into one
    // channel, so the select below only ever waits on two things:
    // "a connection arrived" and "shutdown requested".
    let (accepted_tx, mut accepted_rx) = tokio::sync::mpsc::channel(32);
    for listener in listeners {
        let tx = accepted_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        if tx.send(stream).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        });
    }
    drop(accepted_tx);

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown requested");
                break;
            }
            stream = accepted_rx.recv() => {
                match stream {
                    Some(stream) => {
                        let root = root.clone();
                        tokio::spawn(serve_connection(root, stream));
                    }
                    None => break,
                }
            }
        }
    }

    root.sessions.close().await;
    root.request_pool.close(false);
    root.processing_pool.close(false);

    Ok(())
}
