//! One-shot client: publishes a reservation request and prints the response.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use common::{ClientId, NodeId, RequestId, ResourceRef};
use correlator::{CorrelatorConfig, ReservationClient};
use node::LogFormat;
use node::telemetry::init_tracing;
use transport::TcpConnector;

#[derive(Parser)]
#[command(name = "reserve")]
#[command(about = "Reserve stations through a node over pub/sub")]
#[command(version)]
struct Args {
    /// Node that coordinates the request.
    #[arg(short, long, env = "TARGET_NODE")]
    node: String,

    /// Stations to reserve, as node:resource, in evaluation order.
    #[arg(required = true, value_parser = parse_resource_ref)]
    resources: Vec<ResourceRef>,

    /// Client identity; responses arrive on responses/<client-id>.
    #[arg(long, env = "CLIENT_ID")]
    client_id: Option<String>,

    #[arg(long, env = "BROKER_ADDR", default_value = "127.0.0.1:1883")]
    broker: SocketAddr,

    /// Seconds to wait for the response.
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Opaque JSON object passed to the node.
    #[arg(long, default_value = "{}")]
    payload: String,

    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

fn parse_resource_ref(s: &str) -> Result<ResourceRef, String> {
    match s.split_once(':') {
        Some((node, resource)) if !node.is_empty() && !resource.is_empty() => {
            Ok(ResourceRef::new(node, resource))
        }
        _ => Err(format!("expected node:resource, got {s:?}")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing("warn", args.log_format);

    let payload: serde_json::Value = match serde_json::from_str(&args.payload) {
        Ok(payload) => payload,
        Err(e) => {
            eprintln!("invalid --payload: {e}");
            return ExitCode::from(64);
        }
    };

    let client_id = args
        .client_id
        .map(ClientId::from)
        .unwrap_or_else(|| ClientId::from(format!("cli-{}", RequestId::generate())));
    let config = CorrelatorConfig {
        default_timeout: Duration::from_secs(args.timeout),
        ..CorrelatorConfig::default()
    };

    let client = match ReservationClient::connect(
        TcpConnector::new(args.broker),
        client_id,
        config,
        Duration::from_secs(5),
    )
    .await
    {
        Ok(client) => client,
        Err(e) => {
            eprintln!("could not connect to broker {}: {e}", args.broker);
            return ExitCode::FAILURE;
        }
    };

    let result = client
        .reserve(NodeId::from(args.node), args.resources, payload)
        .await;
    client.shutdown();

    match result {
        Ok(response) => {
            match serde_json::to_string_pretty(&response) {
                Ok(json) => println!("{json}"),
                Err(e) => eprintln!("could not print response: {e}"),
            }
            if response.is_reserved() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            }
        }
        Err(e) => {
            eprintln!("reservation failed: {e}");
            ExitCode::FAILURE
        }
    }
}
