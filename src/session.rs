//! Session lifecycle: peer version, reference counting, configuration
//! settings and the single store a session may have open.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::SessionId;
use crate::store::{MemoryBackend, Store};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

/// A session may create a store (failing if one already exists unless
/// `always_create` drops it), or open one that must already exist.
/// This mirrors the documented exists/always-create table: exists=false
/// always yields a fresh store; exists=true only survives when the
/// caller did not ask to always create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOpenOutcome {
    Created,
    Opened,
    Replaced,
}

pub struct Session {
    id: SessionId,
    peer_version: (u8, u8),
    reference_count: AtomicU32,
    settings: RwLock<HashMap<String, ConfigValue>>,
    lock_list: RwLock<Vec<String>>,
    store: RwLock<Option<Arc<Store>>>,
}

impl Session {
    pub fn new(id: SessionId, peer_version: (u8, u8)) -> Self {
        Session {
            id,
            peer_version,
            reference_count: AtomicU32::new(1),
            settings: RwLock::new(HashMap::new()),
            lock_list: RwLock::new(Vec::new()),
            store: RwLock::new(None),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer_version(&self) -> (u8, u8) {
        self.peer_version
    }

    pub fn attach(&self) {
        self.reference_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Detaches one reference; returns true if this was the last one,
    /// at which point the caller (the session manager) should close and
    /// drop the session.
    pub fn detach(&self) -> bool {
        self.reference_count.fetch_sub(1, Ordering::SeqCst) == 1
    }

    pub fn reference_count(&self) -> u32 {
        self.reference_count.load(Ordering::SeqCst)
    }

    pub fn lock_setting(&self, prefix: impl Into<String>) {
        self.lock_list.write().push(prefix.into());
    }

    fn is_locked(&self, name: &str) -> bool {
        self.lock_list.read().iter().any(|prefix| name.starts_with(prefix.as_str()))
    }

    /// Applies a setting regardless of whether a store is currently
    /// open, as long as its name does not match a locked prefix.
    pub fn apply_setting(&self, name: &str, value: ConfigValue) -> Result<()> {
        if self.is_locked(name) {
            return Err(Error::InvalidOperation(format!(
                "setting '{name}' is locked for this session"
            )));
        }
        self.settings.write().insert(name.to_string(), value);
        Ok(())
    }

    pub fn setting(&self, name: &str) -> Option<ConfigValue> {
        self.settings.read().get(name).cloned()
    }

    /// Applies every entry of a serialized `SessionSetConfiguration`
    /// payload (a JSON object of name -> value), rejecting the whole
    /// batch if any entry's name is locked.
    pub fn apply_settings_from_json(&self, payload: &str) -> Result<()> {
        let incoming: HashMap<String, ConfigValue> = serde_json::from_str(payload)
            .map_err(|e| Error::Argument(format!("malformed configuration payload: {e}")))?;

        for name in incoming.keys() {
            if self.is_locked(name) {
                return Err(Error::InvalidOperation(format!(
                    "setting '{name}' is locked for this session"
                )));
            }
        }
        self.settings.write().extend(incoming);
        Ok(())
    }

    pub fn has_store(&self) -> bool {
        self.store.read().is_some()
    }

    pub fn store(&self) -> Option<Arc<Store>> {
        self.store.read().clone()
    }

    /// `exists`/`always_create` truth table: no existing store always
    /// creates; an existing store survives unless the caller explicitly
    /// asks to always create, in which case it is replaced.
    pub fn open_or_create_store(
        &self,
        existing: Option<Arc<Store>>,
        always_create: bool,
    ) -> (Arc<Store>, StoreOpenOutcome) {
        match existing {
            None => {
                let store = Arc::new(Store::new(Arc::new(MemoryBackend::new()), 2, false));
                *self.store.write() = Some(store.clone());
                (store, StoreOpenOutcome::Created)
            }
            Some(store) if !always_create => {
                *self.store.write() = Some(store.clone());
                (store, StoreOpenOutcome::Opened)
            }
            Some(_) => {
                let store = Arc::new(Store::new(Arc::new(MemoryBackend::new()), 2, false));
                *self.store.write() = Some(store.clone());
                (store, StoreOpenOutcome::Replaced)
            }
        }
    }

    pub fn close_store(&self) {
        *self.store.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detach_reports_last_reference() {
        let session = Session::new(SessionId(0), (3, 1));
        session.attach();
        assert!(!session.detach());
        assert!(session.detach());
    }

    #[test]
    fn locked_setting_rejected() {
        let session = Session::new(SessionId(0), (3, 1));
        session.lock_setting("net.");
        assert!(session.apply_setting("net.timeout", ConfigValue::Int(5)).is_err());
        assert!(session.apply_setting("cache.size", ConfigValue::Int(5)).is_ok());
    }

    #[test]
    fn settings_payload_applies_all_or_rejects_whole_batch() {
        let session = Session::new(SessionId(0), (3, 1));
        session.lock_setting("net.");
        assert!(session
            .apply_settings_from_json(r#"{"cache.size": 10, "net.timeout": 5}"#)
            .is_err());
        // Rejected batch must not partially apply.
        assert!(session.setting("cache.size").is_none());

        assert!(session
            .apply_settings_from_json(r#"{"cache.size": 10}"#)
            .is_ok());
        assert!(matches!(session.setting("cache.size"), Some(ConfigValue::Int(10))));
    }

    #[test]
    fn open_with_no_existing_store_creates() {
        let session = Session::new(SessionId(0), (3, 1));
        let (_store, outcome) = session.open_or_create_store(None, false);
        assert_eq!(outcome, StoreOpenOutcome::Created);
    }

    #[test]
    fn open_existing_without_always_create_reuses_it() {
        let session = Session::new(SessionId(0), (3, 1));
        let existing = Arc::new(Store::new(Arc::new(MemoryBackend::new()), 2, false));
        let (_store, outcome) = session.open_or_create_store(Some(existing), false);
        assert_eq!(outcome, StoreOpenOutcome::Opened);
    }

    #[test]
    fn open_existing_with_always_create_replaces_it() {
        let session = Session::new(SessionId(0), (3, 1));
        let existing = Arc::new(Store::new(Arc::new(MemoryBackend::new()), 2, false));
        let (_store, outcome) = session.open_or_create_store(Some(existing), true);
        assert_eq!(outcome, StoreOpenOutcome::Replaced);
    }
}
