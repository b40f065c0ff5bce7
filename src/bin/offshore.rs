use std::process::ExitCode;

use clap::Parser;
use sealink::{
    OffshoreOpts, OffshoreProxy,
    net::{bind_listener, listen_addr},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Offshore relay: accepts the single link from the ship and performs the
/// actual origin connections.
#[derive(Parser)]
#[command(name = "sealink-offshore", version)]
struct Cli {
    /// Bind address for the link listener (":9090" binds all interfaces).
    #[clap(long, default_value = ":9090")]
    listen: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sealink=info".into()),
        )
        .init();
    let cli = Cli::parse();

    let listener = match bind_listener(&listen_addr(&cli.listen)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(listen = %cli.listen, %err, "failed to bind link listener");
            return ExitCode::FAILURE;
        }
    };
    let local_addr = listener.local_addr().ok();
    info!(listen = ?local_addr, "offshore relay listening");

    let proxy = OffshoreProxy::new(OffshoreOpts::default());

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    match proxy.run(listener, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "offshore relay terminated");
            ExitCode::FAILURE
        }
    }
}
