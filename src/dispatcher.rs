//! Reads frames off the tunnel and fans each one out to a detached handler
//! task.
//!
//! Grounded on the accept-loop shape of the proxy servers in this codebase
//! (`spawn_proxy`/`spawn_proxy_multi`): one reader drives a `JoinSet` of
//! per-request tasks, and dropping the set on the way out aborts whatever
//! is still running rather than leaking it past the connection's lifetime.
//! The loop also drains `handlers` via `join_next` as tasks finish, so a
//! long-lived connection serving many requests doesn't accumulate a
//! completed-but-unjoined task per request for the life of the connection.

use futures_util::StreamExt;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TunnelError;
use crate::frame::Frame;
use crate::http_invoker::HttpInvoker;
use crate::transport::{PongTracker, TunnelStream, TunnelWriter};
use crate::ws_invoker::WsInvoker;

/// Drive the dispatch loop until the tunnel read half errors or closes.
/// Returns the reason it stopped so the reconnect supervisor can log and
/// decide on backoff.
pub async fn run(
    mut reader: futures_util::stream::SplitStream<TunnelStream>,
    http: HttpInvoker,
    ws: WsInvoker,
    writer: TunnelWriter,
    pongs: PongTracker,
) -> TunnelError {
    // Dropped on every return path below, aborting whatever is still in
    // flight rather than letting it outlive this transport.
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            frame = reader.next() => {
                match frame {
                    Some(Ok(Message::Binary(bytes))) => match Frame::decode(&bytes) {
                        Ok(frame) => dispatch(frame, &http, &ws, &writer, &mut handlers),
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to decode frame, closing tunnel");
                            return TunnelError::Frame(err);
                        }
                    },
                    Some(Ok(Message::Pong(_))) => {
                        pongs.record();
                    }
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "tunnel closed by server");
                        return TunnelError::Closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "tunnel read error");
                        return TunnelError::Connect(err);
                    }
                    None => return TunnelError::Closed,
                }
            }
            Some(result) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(err) = result {
                    tracing::warn!(error = %err, "handler task did not finish cleanly");
                }
            }
        }
    }
}

fn dispatch(
    frame: Frame,
    http: &HttpInvoker,
    ws: &WsInvoker,
    writer: &TunnelWriter,
    handlers: &mut JoinSet<()>,
) {
    match frame {
        Frame::HttpRequest {
            request_id,
            method,
            path,
            query_string,
            headers,
            body,
        } => {
            let http = http.clone();
            let writer = writer.clone();
            handlers.spawn(async move {
                let response = http
                    .invoke(&request_id, &method, &path, &query_string, &headers, body)
                    .await;
                let _ = writer.send_frame(response).await;
            });
        }
        Frame::WsOpen {
            ws_id,
            path,
            query_string,
        } => {
            let ws = ws.clone();
            handlers.spawn(async move {
                ws.open(ws_id, path, query_string).await;
            });
        }
        Frame::WsData {
            ws_id,
            data,
            is_text,
        } => {
            let ws = ws.clone();
            handlers.spawn(async move {
                ws.forward(ws_id, data, is_text).await;
            });
        }
        Frame::WsClose { ws_id } => {
            let ws = ws.clone();
            handlers.spawn(async move {
                ws.close(ws_id).await;
            });
        }
        Frame::HttpResponse { .. } => {
            tracing::warn!("unexpected frame type from server, ignoring");
        }
    }
}
