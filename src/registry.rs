use crate::error::RegistryError;
use crate::session::Session;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Process-wide map from stream key to live session.
///
/// An explicitly owned instance injected into the ingest listener and the
/// HTTP server through `AppState`; there is no ambient singleton. The
/// at-most-one-session-per-key invariant is enforced here: the second of two
/// racing registrations loses with `DuplicateStream` while the first keeps
/// publishing.
#[derive(Default)]
pub struct StreamRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for a new session. Fails if the key is already live.
    pub fn register(
        &self,
        key: &str,
        window_size: usize,
        target_duration: u32,
    ) -> Result<Arc<Session>, RegistryError> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(key) {
            return Err(RegistryError::DuplicateStream(key.to_string()));
        }
        let session = Arc::new(Session::new(key, window_size, target_duration));
        sessions.insert(key.to_string(), session.clone());
        info!(%key, "Session registered");
        Ok(session)
    }

    pub fn lookup(&self, key: &str) -> Result<Arc<Session>, RegistryError> {
        self.sessions
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))
    }

    /// Drop the key from the map. Outstanding readers hold `Arc`s to the
    /// session and its segment payloads, so destruction is deferred until the
    /// last of them finishes; new lookups see `NotFound` immediately.
    pub fn unregister(&self, key: &str) {
        if self.sessions.lock().remove(key).is_some() {
            info!(%key, "Session unregistered");
        }
    }

    pub fn active_keys(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }
}
