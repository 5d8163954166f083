//! Concurrent registry of proxied WebSocket sessions, keyed by `ws_id`.
//!
//! Grounded on the `DashMap`-backed stores used elsewhere in this codebase
//! for concurrent state shared between a reader task and many writer tasks
//! (e.g. the stream-offset store): sharded locking gives us safe concurrent
//! insert/get/remove without a single global mutex serialising every
//! session.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

/// Write half of a local-server WebSocket connection.
pub type LocalWsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
/// Read half of a local-server WebSocket connection.
pub type LocalWsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Open,
    Closing,
    Closed,
}

pub struct Session {
    pub ws_id: String,
    pub sink: tokio::sync::Mutex<LocalWsSink>,
    pub state: std::sync::Mutex<SessionState>,
}

impl Session {
    pub fn new(ws_id: String, sink: LocalWsSink) -> Self {
        Self {
            ws_id,
            sink: tokio::sync::Mutex::new(sink),
            state: std::sync::Mutex::new(SessionState::Open),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }
}

/// Safe-for-concurrent-use map from `ws_id` to [`Session`].
#[derive(Default, Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, ws_id: String, session: Arc<Session>) {
        self.sessions.insert(ws_id, session);
    }

    pub fn get(&self, ws_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(ws_id).map(|entry| entry.value().clone())
    }

    /// Idempotent: returns `None` if the session was already gone.
    pub fn remove(&self, ws_id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(ws_id).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// A consistent snapshot of every currently-registered session, used
    /// only by the shutdown coordinator.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_on_empty_registry_is_none() {
        let registry = SessionRegistry::new();
        assert!(registry.get("w1").is_none());
        assert_eq!(registry.len(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_twice_is_safe() {
        let registry: SessionRegistry = SessionRegistry::new();
        assert!(registry.remove("missing").is_none());
        assert!(registry.remove("missing").is_none());
    }

    #[test]
    fn snapshot_observes_consistent_view() {
        let registry = SessionRegistry::new();
        assert!(registry.snapshot().is_empty());
    }
}
