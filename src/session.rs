use crate::store::SegmentStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Connection lifecycle of one publishing session.
///
/// `Connecting → Live → Draining → Closed`, where `Live` is entered on the
/// first published segment. The only transitions that skip `Draining` are the
/// hard failure paths `Connecting → Closed` (ingest never produced a segment)
/// and `Live → Closed` (unrecoverable transcoder failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Live,
    Draining,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Live => "live",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

impl SessionState {
    fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Live)
                | (Connecting, Closed)
                | (Live, Draining)
                | (Live, Closed)
                | (Draining, Closed)
        )
    }
}

/// Live state for one stream key. Owned by the registry; handed out as `Arc`
/// so in-flight HTTP reads outlive unregistration safely.
pub struct Session {
    key: String,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    store: Arc<SegmentStore>,
}

impl Session {
    pub fn new(key: &str, window_size: usize, target_duration: u32) -> Self {
        Self {
            key: key.to_string(),
            created_at: Utc::now(),
            state: Mutex::new(SessionState::Connecting),
            store: Arc::new(SegmentStore::new(key, window_size, target_duration)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn store(&self) -> &Arc<SegmentStore> {
        &self.store
    }

    /// Advance the state machine. Illegal transitions are ignored with a
    /// warning rather than panicking: racing `Draining`/`Closed` requests at
    /// teardown are expected.
    pub fn advance(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if *state == next {
            return false;
        }
        if state.can_advance_to(next) {
            debug!(key = %self.key, from = %*state, to = %next, "Session state change");
            *state = next;
            true
        } else {
            warn!(key = %self.key, from = %*state, to = %next, "Ignoring illegal session transition");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("mystream", 3, 2)
    }

    #[test]
    fn normal_lifecycle() {
        let s = session();
        assert_eq!(s.state(), SessionState::Connecting);
        assert!(s.advance(SessionState::Live));
        assert!(s.advance(SessionState::Draining));
        assert!(s.advance(SessionState::Closed));
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn connecting_can_close_directly() {
        let s = session();
        assert!(s.advance(SessionState::Closed));
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn live_can_close_on_fatal_error() {
        let s = session();
        s.advance(SessionState::Live);
        assert!(s.advance(SessionState::Closed));
    }

    #[test]
    fn cannot_skip_draining_backwards_or_reopen() {
        let s = session();
        assert!(!s.advance(SessionState::Draining)); // never went live
        s.advance(SessionState::Live);
        s.advance(SessionState::Draining);
        assert!(!s.advance(SessionState::Live));
        s.advance(SessionState::Closed);
        assert!(!s.advance(SessionState::Live));
        assert_eq!(s.state(), SessionState::Closed);
    }
}
