use std::{process::ExitCode, time::Duration};

use clap::Parser;
use sealink::{
    ShipOpts, ShipProxy,
    net::{bind_listener, listen_addr},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Ship-side proxy: presents an ordinary HTTP proxy to local user agents
/// and serialises every request onto the single offshore link.
#[derive(Parser)]
#[command(name = "sealink-ship", version)]
struct Cli {
    /// Bind address for the local proxy (":8080" binds all interfaces).
    #[clap(long, default_value = "127.0.0.1:8080")]
    listen: String,
    /// Address of the offshore relay.
    #[clap(long, default_value = "127.0.0.1:9090")]
    server: String,
    /// Per-stream idle timeout in seconds; 0 disables it.
    #[clap(long, default_value_t = 0)]
    idle_timeout: u64,
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
            error!(listen = %cli.listen, %err, "failed to bind proxy listener");
            return ExitCode::FAILURE;
        }
    };
    let local_addr = listener.local_addr().ok();
    info!(listen = ?local_addr, server = %cli.server, "ship proxy listening");

    let mut opts = ShipOpts::default();
    if cli.idle_timeout > 0 {
        opts.stream_idle_timeout = Some(Duration::from_secs(cli.idle_timeout));
    }
    let proxy = ShipProxy::new(cli.server, opts);

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
            error!(%err, "ship proxy terminated");
            ExitCode::FAILURE
        }
    }
}
