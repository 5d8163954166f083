use clap::Parser;

use tunnel_client::config::Cli;
use tunnel_client::shutdown;
use tunnel_client::supervisor::{self, SupervisorConfig};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tunnel_client={}", cli.filter_directive()).into()),
        )
        .compact()
        .init();

    let stop = shutdown::install();

    let config = SupervisorConfig {
        server_url: cli.server.clone(),
        token: cli.token.clone(),
        local_base: cli.ha_url.clone(),
    };

    match supervisor::run(config, stop).await {
        Ok(()) => {
            tracing::info!("tunnel client stopped");
        }
        Err(err) => {
            tracing::error!(error = %err, "tunnel client exited with a terminal error");
            std::process::exit(1);
        }
    }
}
