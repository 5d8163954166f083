//! Command-line surface, grounded on the teacher binary's `clap` derive
//! struct (`--listen`, `--target-host`, ... each paired with a
//! `Cli::parse()` entrypoint and env-var fallbacks via `#[arg(env = ...)]`).

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "tunnel-client", about = "Reverse tunnel client for a local HTTP/WebSocket server")]
pub struct Cli {
    /// Bearer token presented to the tunnel server on connect.
    #[arg(long, env = "TUNNEL_CLIENT_TOKEN")]
    pub token: String,

    /// Tunnel server WebSocket URL.
    #[arg(long, env = "TUNNEL_CLIENT_SERVER", default_value = "wss://tunnel.example/ws/tunnel")]
    pub server: String,

    /// Base URL of the local server this client proxies requests to.
    #[arg(long, env = "TUNNEL_CLIENT_HA_URL", default_value = "http://localhost:8123")]
    pub ha_url: String,

    /// Log level: one of debug, info, warning, error.
    #[arg(long, env = "TUNNEL_CLIENT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Translate the CLI's `log_level` into the `EnvFilter` directive used to
    /// seed tracing, falling back to `info` for anything unrecognised rather
    /// than failing startup over a typo'd flag.
    pub fn filter_directive(&self) -> &'static str {
        match self.log_level.to_ascii_lowercase().as_str() {
            "debug" => "debug",
            "warning" | "warn" => "warn",
            "error" => "error",
            _ => "info",
        }
    }
}
