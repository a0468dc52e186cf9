//! Node entry point.

use std::sync::Arc;

use common::topics::request_topic;
use node::telemetry::{init_tracing, shutdown_signal};
use node::{AppState, NodeConfig};
use resource_store::{InMemoryResourceStore, PostgresResourceStore, ResourceStore};
use saga::{HttpPeerClient, PeerClient};
use transport::{TcpConnector, TopicFilter, TransportAdapter, TransportConfig};

/// Opens the PostgreSQL store if `DATABASE_URL` is set, the in-memory store
/// otherwise, and adds any seed stations it does not know yet.
async fn build_store(config: &NodeConfig) -> Arc<dyn ResourceStore> {
    let store: Arc<dyn ResourceStore> = match &config.database_url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .expect("failed to connect to database");
            let store = PostgresResourceStore::with_lock_wait(pool, config.lock_wait);
            store.run_migrations().await.expect("migrations failed");
            tracing::info!("using PostgreSQL resource store");
            Arc::new(store)
        }
        None => {
            tracing::info!("using in-memory resource store");
            Arc::new(InMemoryResourceStore::with_lock_wait(config.lock_wait))
        }
    };

    for resource in &config.seed_resources {
        let known = store
            .get_resource(&resource.id)
            .await
            .expect("failed to read seed resource");
        if known.is_none() {
            store
                .upsert_resource(resource.clone())
                .await
                .expect("failed to seed resource");
        }
    }
    store
}

#[tokio::main]
async fn main() {
    // 1. Load configuration and initialize tracing
    let config = NodeConfig::from_env().expect("invalid configuration");
    init_tracing(&config.log_level, config.log_format);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Store, peers and pub/sub connection
    let store = build_store(&config).await;
    let peers: Arc<dyn PeerClient> = Arc::new(
        HttpPeerClient::new(config.peer_config()).expect("failed to build peer HTTP client"),
    );

    let requests = TopicFilter::parse(&request_topic(&config.node_id))
        .expect("node id does not form a valid topic");
    let (transport, inbound) = TransportAdapter::start(
        TcpConnector::new(config.broker_addr),
        TransportConfig::new(config.node_id.as_str()).subscribe(requests),
    );

    let state = Arc::new(
        AppState::new(config.saga_config(), store, peers).with_transport(transport.clone()),
    );

    let pruner = state.coordinator.spawn_pruner(config.journal_sweep);

    // 4. Pub/sub request loop
    let dispatcher = node::request_dispatcher(state.clone(), Arc::new(transport.clone()))
        .expect("failed to build request dispatcher");
    let pump = tokio::spawn(dispatcher.run(inbound));

    // 5. Start HTTP server
    let app = node::create_app(state, metrics_handle);
    let addr = config.addr();
    tracing::info!(
        node_id = %config.node_id,
        %addr,
        broker = %config.broker_addr,
        peers = config.peers.len(),
        "starting node"
    );

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    transport.shutdown();
    pruner.abort();
    if let Err(e) = pump.await {
        tracing::warn!(error = %e, "request loop ended abnormally");
    }
    tracing::info!("node shut down gracefully");
}
