//! Standalone TCP pub/sub broker for reservation nodes and clients.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use node::LogFormat;
use node::telemetry::{init_tracing, shutdown_signal};
use tokio_util::sync::CancellationToken;
use transport::TcpBroker;

#[derive(Parser)]
#[command(name = "broker")]
#[command(about = "TCP pub/sub broker for station reservation nodes")]
#[command(version)]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "BROKER_ADDR", default_value = "127.0.0.1:1883")]
    listen: SocketAddr,

    /// Log output format (text or json).
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing("info", args.log_format);

    let listener = match tokio::net::TcpListener::bind(args.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %args.listen, error = %e, "failed to bind broker address");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });

    tracing::info!(addr = %args.listen, "broker listening");
    match TcpBroker::new().serve(listener, shutdown).await {
        Ok(()) => {
            tracing::info!("broker shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "broker failed");
            ExitCode::FAILURE
        }
    }
}
