//! Session and store managers: the top-level registries a server root
//! context owns. Lock ranking: `SessionManager`'s map lock is always
//! acquired before a `Session`'s own lock, which is acquired before
//! `StoreManager`'s map lock, matching the acquisition order every
//! request handler follows to avoid deadlock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::ids::SessionId;
use crate::session::Session;
use crate::store::Store;

pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    next_id: AtomicU32,
    closing: AtomicBool,
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(0),
            closing: AtomicBool::new(false),
        }
    }

    pub fn create_session(&self, peer_version: (u8, u8)) -> Result<Arc<Session>> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::InvalidOperation("session manager is shutting down".into()));
        }
        let id = SessionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let session = Arc::new(Session::new(id, peer_version));
        self.sessions.write().insert(id, session.clone());
        Ok(session)
    }

    pub fn get_session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn enumerate_sessions(&self) -> Vec<SessionId> {
        self.sessions.read().keys().copied().collect()
    }

    pub fn open_session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Called when a session's reference count drops to zero. Removes
    /// it from the registry; the caller is responsible for having
    /// already closed the session's store.
    pub fn release_session(&self, id: SessionId) {
        if self.sessions.write().remove(&id).is_some() {
            tracing::debug!(session = id.0, "session released");
        }
    }

    /// Stops accepting new sessions and closes every existing one
    /// concurrently, via a `JoinSet` rather than awaiting each close in
    /// turn.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let sessions: Vec<_> = self.sessions.read().values().cloned().collect();

        let mut set = tokio::task::JoinSet::new();
        for session in sessions {
            set.spawn(async move {
                session.close_store();
                session.id()
            });
        }

        let mut closed_ids = Vec::new();
        while let Some(result) = set.join_next().await {
            if let Ok(id) = result {
                closed_ids.push(id);
            }
        }

        let mut map = self.sessions.write();
        for id in closed_ids {
            map.remove(&id);
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

pub struct StoreManager {
    stores: RwLock<HashMap<String, Arc<Store>>>,
}

impl StoreManager {
    pub fn new() -> Self {
        StoreManager {
            stores: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the already-open store for `path` if one exists, without
    /// creating anything.
    pub fn find(&self, path: &str) -> Option<Arc<Store>> {
        self.stores.read().get(path).cloned()
    }

    /// Registers a freshly created store under `path`, deduplicating a
    /// racing concurrent open by returning whichever store won.
    pub fn register(&self, path: impl Into<String>, store: Arc<Store>) -> Arc<Store> {
        let path = path.into();
        let mut stores = self.stores.write();
        stores.entry(path).or_insert(store).clone()
    }

    pub fn close(&self, path: &str) {
        self.stores.write().remove(path);
    }

    pub fn open_store_count(&self) -> usize {
        self.stores.read().len()
    }
}

impl Default for StoreManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_drains_all_sessions() {
        let manager = SessionManager::new();
        manager.create_session((3, 1)).unwrap();
        manager.create_session((3, 1)).unwrap();
        assert_eq!(manager.open_session_count(), 2);
        manager.close().await;
        assert_eq!(manager.open_session_count(), 0);
        assert!(manager.create_session((3, 1)).is_err());
    }

    #[test]
    fn store_manager_dedupes_concurrent_register() {
        let manager = StoreManager::new();
        let a = Arc::new(Store::new(
            Arc::new(crate::store::MemoryBackend::new()),
            2,
            false,
        ));
        let b = Arc::new(Store::new(
            Arc::new(crate::store::MemoryBackend::new()),
            2,
            false,
        ));
        let first = manager.register("foo", a.clone());
        let second = manager.register("foo", b);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&second, &a));
    }
}
