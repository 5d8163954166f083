//! Bridges a logical `ws_id` to a real WebSocket connection on the local
//! server.
//!
//! The bidirectional bridging shape (split sink/stream, one task reading one
//! side and writing the other) is grounded on the `ws_to_tcp` /
//! `tcp_to_ws` pair in the noVNC proxy this crate starts from; the
//! difference here is that both ends are WebSockets (local server <->
//! tunnel frames) rather than WebSocket <-> raw TCP, and framing goes
//! through `Frame::WsData` instead of base64-vs-binary sniffing.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::frame::Frame;
use crate::registry::{LocalWsStream, Session, SessionRegistry, SessionState};
use crate::transport::TunnelWriter;

#[derive(Clone)]
pub struct WsInvoker {
    local_base: String,
    registry: SessionRegistry,
    writer: TunnelWriter,
}

impl WsInvoker {
    pub fn new(local_base: String, registry: SessionRegistry, writer: TunnelWriter) -> Self {
        Self {
            local_base: local_base.trim_end_matches('/').to_string(),
            registry,
            writer,
        }
    }

    /// Open a WebSocket to the local server for `ws_id` and spawn the relay
    /// task that forwards local frames back onto the tunnel.
    pub async fn open(&self, ws_id: String, path: String, query_string: String) {
        let url = local_ws_url(&self.local_base, &path, &query_string);

        tracing::debug!(ws_id = %ws_id, %url, "opening local websocket");

        let (stream, _response) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(ws_id = %ws_id, %url, error = %err, "failed to open local websocket");
                let _ = self.writer.send_frame(Frame::WsClose { ws_id }).await;
                return;
            }
        };

        let (sink, stream) = stream.split();
        let session = std::sync::Arc::new(Session::new(ws_id.clone(), sink));
        self.registry.insert(ws_id.clone(), session);

        let registry = self.registry.clone();
        let writer = self.writer.clone();
        let relay_ws_id = ws_id.clone();
        tokio::spawn(async move {
            relay_from_local(relay_ws_id, stream, registry, writer).await;
        });
    }

    /// Forward browser-originated data to the local server. Silently
    /// dropped if the session is absent or already closing.
    pub async fn forward(&self, ws_id: String, data: Vec<u8>, is_text: bool) {
        let Some(session) = self.registry.get(&ws_id) else {
            return;
        };
        if session.state() != SessionState::Open {
            return;
        }

        let message = if is_text {
            match String::from_utf8(data) {
                Ok(text) => Message::Text(text.into()),
                Err(err) => {
                    tracing::warn!(ws_id = %ws_id, error = %err, "dropping non-utf8 text frame");
                    return;
                }
            }
        } else {
            Message::Binary(data.into())
        };

        let send_result = {
            let mut sink = session.sink.lock().await;
            sink.send(message).await
        };

        if let Err(err) = send_result {
            tracing::warn!(ws_id = %ws_id, error = %err, "failed to forward data to local websocket");
            self.close_and_notify(&ws_id).await;
        }
    }

    /// Close a session in response to a `ws_close` frame from the server.
    /// Idempotent.
    pub async fn close(&self, ws_id: String) {
        self.close_and_notify(&ws_id).await;
    }

    async fn close_and_notify(&self, ws_id: &str) {
        let Some(session) = self.registry.remove(ws_id) else {
            return;
        };
        session.set_state(SessionState::Closed);
        {
            let mut sink = session.sink.lock().await;
            let _ = sink.close().await;
        }
        let _ = self
            .writer
            .send_frame(Frame::WsClose {
                ws_id: ws_id.to_string(),
            })
            .await;
    }
}

async fn relay_from_local(
    ws_id: String,
    mut stream: LocalWsStream,
    registry: SessionRegistry,
    writer: TunnelWriter,
) {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame = Frame::WsData {
                    ws_id: ws_id.clone(),
                    data: text.as_bytes().to_vec(),
                    is_text: true,
                };
                if writer.send_frame(frame).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Binary(data))) => {
                let frame = Frame::WsData {
                    ws_id: ws_id.clone(),
                    data: data.to_vec(),
                    is_text: false,
                };
                if writer.send_frame(frame).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Close(_))) => break,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                tracing::debug!(ws_id = %ws_id, error = %err, "local websocket relay error");
                break;
            }
            None => break,
        }
    }

    if let Some(session) = registry.remove(&ws_id) {
        session.set_state(SessionState::Closed);
        let _ = writer
            .send_frame(Frame::WsClose {
                ws_id: ws_id.clone(),
            })
            .await;
    }
}

fn local_ws_url(local_base: &str, path: &str, query_string: &str) -> String {
    let rewritten = if let Some(rest) = local_base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = local_base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        local_base.to_string()
    };

    if query_string.is_empty() {
        format!("{rewritten}{path}")
    } else {
        format!("{rewritten}{path}?{query_string}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_http_scheme_to_ws() {
        assert_eq!(
            local_ws_url("http://localhost:8123", "/api/websocket", ""),
            "ws://localhost:8123/api/websocket"
        );
    }

    #[test]
    fn rewrites_https_scheme_to_wss() {
        assert_eq!(
            local_ws_url("https://localhost:8123", "/api/websocket", "token=1"),
            "wss://localhost:8123/api/websocket?token=1"
        );
    }
}
