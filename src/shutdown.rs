//! Coordinates a clean stop: flips a shared flag the supervisor polls
//! between connection attempts and mid-connection via `watch::Receiver`.
//!
//! Grounded on the `tokio::signal::ctrl_c` shutdown wiring used by the noVNC
//! proxy's binary entrypoint, generalised to also catch `SIGTERM` (the signal
//! a container orchestrator actually sends) and to broadcast through a
//! `watch` channel instead of a single oneshot, since both the supervisor's
//! outer loop and its in-flight connection need to observe the same signal.

use tokio::sync::watch;

/// A `watch` sender paired receiver pattern: call [`install`] once at
/// startup, hand the returned receiver to the supervisor, and the spawned
/// task will flip it to `true` the moment a shutdown signal arrives.
pub fn install() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(wait_for_signal(tx));
    rx
}

#[cfg(unix)]
async fn wait_for_signal(tx: watch::Sender<bool>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    let _ = tx.send(true);
}

#[cfg(not(unix))]
async fn wait_for_signal(tx: watch::Sender<bool>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("received ctrl-c, shutting down");
    }
    let _ = tx.send(true);
}
