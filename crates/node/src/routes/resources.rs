//! Station administration and the peer RPC surface.
//!
//! Peers reach this node's store only through the `reserve`, `release` and
//! `confirm` routes, which wrap the store's atomic operations.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use common::ResourceId;
use resource_store::{ReleaseOutcome, Resource, ResourceFilter};
use saga::peer::{confirm_owned, release_owned, reserve_owned};
use saga::{
    ConfirmReply, Confirmation, ReleaseBody, ReleaseReply, ReserveBody, ReserveReply,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateResourceRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub under_maintenance: bool,
}

#[derive(Deserialize)]
pub struct MaintenanceRequest {
    pub under_maintenance: bool,
}

/// GET /resources
#[tracing::instrument(skip(state))]
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ResourceFilter>,
) -> Result<Json<Vec<Resource>>, ApiError> {
    Ok(Json(state.store.list_resources(filter).await?))
}

/// GET /resources/{id}
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Resource>, ApiError> {
    state
        .store
        .get_resource(&ResourceId::from(id.as_str()))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Resource {id} not found")))
}

/// POST /resources: adds a station owned by this node, or replaces its
/// descriptive fields.
#[tracing::instrument(skip(state, req), fields(resource_id = %req.id))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateResourceRequest>,
) -> Result<(StatusCode, Json<Resource>), ApiError> {
    let resource = Resource::new(
        req.id.as_str(),
        req.name,
        req.location,
        state.node_id.clone(),
    )
    .with_maintenance(req.under_maintenance);

    state.store.upsert_resource(resource).await?;
    let stored = state
        .store
        .get_resource(&ResourceId::from(req.id.as_str()))
        .await?
        .ok_or_else(|| ApiError::Internal(format!("Resource {} vanished after upsert", req.id)))?;

    state.announcer.announce(&stored).await;
    Ok((StatusCode::CREATED, Json(stored)))
}

/// PUT /resources/{id}/maintenance
#[tracing::instrument(skip(state, req))]
pub async fn set_maintenance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<MaintenanceRequest>,
) -> Result<Json<Resource>, ApiError> {
    let resource = state
        .store
        .set_maintenance(&ResourceId::from(id.as_str()), req.under_maintenance)
        .await?;
    state.announcer.announce(&resource).await;
    Ok(Json(resource))
}

/// Parses an optional JSON body; an empty body yields the default.
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes, what: &str) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid {what} body: {e}")))
}

/// POST /resources/{id}/reserve: single-attempt check-and-reserve for a
/// coordinating peer. A `request_id` in the body becomes the station's holder.
#[tracing::instrument(skip(state, body))]
pub async fn reserve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<ReserveReply>, ApiError> {
    let body: ReserveBody = optional_body(&body, "reserve")?;
    let resource_id = ResourceId::from(id.as_str());
    let outcome = reserve_owned(
        state.store.as_ref(),
        &resource_id,
        body.request_id.as_ref(),
    )
    .await?;
    metrics::counter!("node_peer_requests_total", "op" => "reserve", "outcome" => outcome.as_str())
        .increment(1);

    if outcome.is_reserved() {
        state.announce_resources(std::slice::from_ref(&resource_id)).await;
    }
    Ok(Json(ReserveReply { outcome }))
}

/// POST /resources/{id}/release: idempotent release. With a `request_id`
/// in the body, that request's records are cancelled and the station is
/// freed only if the request holds it.
#[tracing::instrument(skip(state, body))]
pub async fn release(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<ReleaseReply>, ApiError> {
    let body: ReleaseBody = optional_body(&body, "release")?;

    let resource_id = ResourceId::from(id.as_str());
    let outcome = release_owned(
        state.store.as_ref(),
        &resource_id,
        body.request_id.as_ref(),
    )
    .await?;
    metrics::counter!("node_peer_requests_total", "op" => "release", "outcome" => outcome.as_str())
        .increment(1);

    if outcome == ReleaseOutcome::Released {
        state.announce_resources(std::slice::from_ref(&resource_id)).await;
    }
    Ok(Json(ReleaseReply { ack: true, outcome }))
}

/// POST /resources/{id}/confirm: records a committed leg on this node.
#[tracing::instrument(skip(state, confirmation), fields(request_id = %confirmation.request_id))]
pub async fn confirm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(confirmation): Json<Confirmation>,
) -> Result<Json<ConfirmReply>, ApiError> {
    let resource_id = ResourceId::from(id.as_str());
    if state.store.get_resource(&resource_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Resource {id} not found")));
    }

    confirm_owned(state.store.as_ref(), &resource_id, confirmation).await?;
    metrics::counter!("node_peer_requests_total", "op" => "confirm", "outcome" => "recorded")
        .increment(1);
    Ok(Json(ConfirmReply { ack: true }))
}
