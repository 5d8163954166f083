//! Reconnect state machine: init -> connecting -> running -> backoff ->
//! (connecting again, or terminated).
//!
//! Grounded on the retry-loop shape of `spawn_proxy_multi` (accept, handle,
//! log, keep looping) generalised to a client that dials out instead of
//! accepting: every failed or dropped connection is retried with
//! exponentially increasing delay, except that the delay is only ever reset
//! once the server has actually confirmed the session with a `welcome`
//! frame, per the handshake in `original_source/dimensiondoor/tunnel_client.py`.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::dispatcher;
use crate::error::TunnelError;
use crate::frame::Welcome;
use crate::http_invoker::HttpInvoker;
use crate::registry::SessionRegistry;
use crate::transport::{PongTracker, TunnelWriter};
use crate::ws_invoker::WsInvoker;

/// Frames larger than this are rejected by the handshake's websocket config,
/// matching the cap documented for this transport.
const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct SupervisorConfig {
    pub server_url: String,
    pub token: String,
    pub local_base: String,
}

/// Drive the reconnect loop until `stop` is set. Returns an error only for a
/// terminal server-side rejection (bad token, etc); any other disconnection
/// is retried.
pub async fn run(config: SupervisorConfig, mut stop: watch::Receiver<bool>) -> anyhow::Result<()> {
    let http_client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    let mut backoff = INITIAL_BACKOFF;

    loop {
        if *stop.borrow() {
            return Ok(());
        }

        tracing::info!(server = %config.server_url, "connecting to tunnel server");
        let attempt = connect_and_serve(&config, &http_client, &mut stop).await;

        match attempt.outcome {
            Ok(()) => return Ok(()),
            Err(TunnelError::Rejected(reason)) => {
                tracing::error!(reason = %reason, "server rejected tunnel connection");
                anyhow::bail!("server rejected tunnel connection: {reason}");
            }
            Err(err) => {
                if attempt.welcomed {
                    backoff = INITIAL_BACKOFF;
                    tracing::warn!(error = %err, "tunnel disconnected after a confirmed session, reconnecting");
                } else {
                    tracing::warn!(error = %err, delay = ?backoff, "tunnel connection failed, retrying");
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = stop.changed() => {
                if *stop.borrow() {
                    return Ok(());
                }
            }
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

struct Attempt {
    welcomed: bool,
    outcome: Result<(), TunnelError>,
}

async fn connect_and_serve(
    config: &SupervisorConfig,
    http_client: &reqwest::Client,
    stop: &mut watch::Receiver<bool>,
) -> Attempt {
    let request = match build_request(&config.server_url, &config.token) {
        Ok(request) => request,
        Err(err) => {
            return Attempt {
                welcomed: false,
                outcome: Err(err),
            }
        }
    };

    let ws_config = WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        max_frame_size: Some(MAX_MESSAGE_SIZE),
        ..Default::default()
    };

    let (stream, _response) =
        match tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false).await
        {
            Ok(pair) => pair,
            Err(err) => {
                return Attempt {
                    welcomed: false,
                    outcome: Err(TunnelError::Connect(err)),
                }
            }
        };

    let (sink, mut reader) = stream.split();
    let writer = TunnelWriter::new(sink);

    if let Err(err) = await_welcome(&mut reader).await {
        return Attempt {
            welcomed: false,
            outcome: Err(err),
        };
    }
    tracing::info!("tunnel handshake complete");

    let registry = SessionRegistry::new();
    let http_invoker = HttpInvoker::new(http_client.clone(), config.local_base.clone());
    let ws_invoker = WsInvoker::new(config.local_base.clone(), registry.clone(), writer.clone());
    let pongs = PongTracker::new();

    let outcome = tokio::select! {
        err = dispatcher::run(reader, http_invoker, ws_invoker, writer.clone(), pongs.clone()) => Err(err),
        err = keepalive_loop(writer.clone(), pongs) => Err(err),
        _ = stop.changed() => {
            if *stop.borrow() {
                Ok(())
            } else {
                Err(TunnelError::Closed)
            }
        }
    };

    writer.close().await;
    close_all_sessions(&registry).await;

    Attempt {
        welcomed: true,
        outcome,
    }
}

/// Read exactly one message and require it to be a non-rejecting JSON
/// `welcome`. The server sends this as a text message, not a MessagePack
/// `Frame` — everything after it is MessagePack binary frames.
async fn await_welcome(
    reader: &mut futures_util::stream::SplitStream<crate::transport::TunnelStream>,
) -> Result<(), TunnelError> {
    use tokio_tungstenite::tungstenite::Message;

    loop {
        match reader.next().await {
            Some(Ok(Message::Text(text))) => {
                let welcome = Welcome::parse(&text)?;
                return match welcome.error {
                    Some(reason) => Err(TunnelError::Rejected(reason)),
                    None => Ok(()),
                };
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(frame))) => {
                tracing::warn!(?frame, "tunnel closed by server before welcome");
                return Err(TunnelError::Closed);
            }
            Some(Ok(other)) => {
                return Err(TunnelError::Protocol(format!(
                    "expected welcome text message, got {other:?}"
                )))
            }
            Some(Err(err)) => return Err(TunnelError::Connect(err)),
            None => return Err(TunnelError::Closed),
        }
    }
}

/// Sends a ping every [`KEEPALIVE_INTERVAL`] and requires a pong within
/// [`KEEPALIVE_TIMEOUT`] of it; returns once either a send fails or the
/// deadline is missed, ending the connection so the supervisor reconnects.
async fn keepalive_loop(writer: TunnelWriter, pongs: PongTracker) -> TunnelError {
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(err) = writer.send_ping(Vec::new()).await {
            return err;
        }
        if tokio::time::timeout(KEEPALIVE_TIMEOUT, pongs.wait())
            .await
            .is_err()
        {
            tracing::warn!(timeout = ?KEEPALIVE_TIMEOUT, "no pong received, closing tunnel");
            return TunnelError::Closed;
        }
    }
}

async fn close_all_sessions(registry: &SessionRegistry) {
    use futures_util::SinkExt;
    for session in registry.snapshot() {
        let mut sink = session.sink.lock().await;
        let _ = sink.close().await;
    }
}

fn build_request(
    server_url: &str,
    token: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, TunnelError> {
    let mut url = url::Url::parse(server_url)?;
    url.query_pairs_mut().append_pair("token", token);

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(TunnelError::Connect)?;

    let auth_value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| TunnelError::InvalidToken("token contains invalid header bytes".into()))?;
    request.headers_mut().insert("Authorization", auth_value);

    Ok(request)
}
