//! Thread/task-safe handle for writing frames onto the one outbound tunnel
//! connection.
//!
//! Every handler (the HTTP invoker, the WebSocket relay tasks, the
//! dispatcher's own error paths) needs to write frames back onto the same
//! transport concurrently. `TunnelWriter` funnels all of them through one
//! `tokio::sync::Mutex`-guarded sink so a single frame's bytes are never
//! interleaved with another's, while imposing no ordering between distinct
//! frames from distinct handlers (see the ordering guarantees in
//! SPEC_FULL.md §5).

use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream::SplitSink, SinkExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::error::TunnelError;
use crate::frame::Frame;

pub type TunnelStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type TunnelSink = SplitSink<TunnelStream, Message>;

/// Bound on the websocket close handshake: if the peer doesn't ack within
/// this long, stop waiting and drop the socket anyway.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct TunnelWriter {
    sink: Arc<Mutex<TunnelSink>>,
}

impl TunnelWriter {
    pub fn new(sink: TunnelSink) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    /// Encode and write one frame. Held atomic by the sink's mutex so the
    /// frame's bytes are never split across another writer's frame.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), TunnelError> {
        let bytes = frame.encode()?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(bytes.into()))
            .await
            .map_err(TunnelError::Connect)
    }

    pub async fn send_ping(&self, payload: Vec<u8>) -> Result<(), TunnelError> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Ping(payload.into()))
            .await
            .map_err(TunnelError::Connect)
    }

    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
    }
}

/// Signals the frame-read loop observing `Pong` messages to the keepalive
/// task waiting on them, so a missed pong can be detected without the two
/// sharing a lock-protected timestamp.
#[derive(Clone)]
pub struct PongTracker(Arc<Notify>);

impl PongTracker {
    pub fn new() -> Self {
        Self(Arc::new(Notify::new()))
    }

    /// Called by the frame-read loop when a `Pong` message arrives.
    pub fn record(&self) {
        self.0.notify_one();
    }

    /// Resolves the next time a pong is recorded.
    pub async fn wait(&self) {
        self.0.notified().await;
    }
}
