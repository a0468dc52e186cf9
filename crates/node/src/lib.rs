//! A station reservation node.
//!
//! Serves the HTTP surface (peer RPC, station administration, reservation
//! status) and coordinates reservation requests arriving over pub/sub, with
//! structured logging (tracing) and Prometheus metrics.

pub mod announce;
pub mod config;
pub mod error;
pub mod inbound;
pub mod routes;
pub mod state;
pub mod telemetry;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::{ConfigError, LogFormat, NodeConfig};
pub use error::ApiError;
pub use inbound::{RequestHandler, request_dispatcher};
pub use state::{AppState, NodeCoordinator};

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::ops::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::ops::health))
        .route(
            "/resources",
            get(routes::resources::list).post(routes::resources::create),
        )
        .route("/resources/{id}", get(routes::resources::get))
        .route(
            "/resources/{id}/maintenance",
            put(routes::resources::set_maintenance),
        )
        .route("/resources/{id}/reserve", post(routes::resources::reserve))
        .route("/resources/{id}/release", post(routes::resources::release))
        .route("/resources/{id}/confirm", post(routes::resources::confirm))
        .route(
            "/reservations",
            get(routes::reservations::list).post(routes::reservations::create),
        )
        .route("/reservations/{id}", get(routes::reservations::get))
        .route(
            "/reservations/{id}/cancel",
            post(routes::reservations::cancel),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
