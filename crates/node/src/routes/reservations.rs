//! Reservation endpoints: direct invocation of the coordinator and status
//! queries over its journal and the local records.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::{DateTime, Utc};
use common::{ClientId, RequestId, ReservationRequest, ResourceId};
use resource_store::{ReservationFilter, ReservationRecord};
use saga::{ReservationLeg, ReservationOutcome, SagaState};
use serde::Serialize;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct ReservationStatusResponse {
    pub request_id: RequestId,
    /// Saga details; absent when this node only holds records for a
    /// request another node coordinated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saga: Option<SagaSummary>,
    pub records: Vec<ReservationRecord>,
}

#[derive(Serialize)]
pub struct SagaSummary {
    pub client_id: Option<ClientId>,
    pub state: SagaState,
    pub legs: Vec<ReservationLeg>,
    pub failure_reason: Option<String>,
    pub compensation_failures: Vec<ResourceId>,
    pub cancelled: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub events: Vec<&'static str>,
}

/// POST /reservations: runs a saga synchronously and returns its outcome.
#[tracing::instrument(skip(state, request), fields(request_id = %request.request_id))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReservationRequest>,
) -> Result<Json<ReservationOutcome>, ApiError> {
    let outcome = state.coordinator.handle_reservation_request(request).await?;
    let local = state.local_resources(&outcome);
    state.announce_resources(&local).await;
    Ok(Json(outcome))
}

/// GET /reservations: lists this node's records.
#[tracing::instrument(skip(state))]
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ReservationFilter>,
) -> Result<Json<Vec<ReservationRecord>>, ApiError> {
    Ok(Json(state.store.list_reservations(filter).await?))
}

/// GET /reservations/{request_id}
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ReservationStatusResponse>, ApiError> {
    let request_id = RequestId::from(id.as_str());
    let records = state.store.reservations_for_request(&request_id).await?;

    let saga = state.coordinator.get_saga(&request_id).await.map(|saga| {
        SagaSummary {
            client_id: saga.client_id().cloned(),
            state: saga.state(),
            legs: saga.legs().to_vec(),
            failure_reason: saga.failure_reason().map(String::from),
            compensation_failures: saga.compensation_failures(),
            cancelled: saga.is_cancelled(),
            started_at: saga.started_at(),
            finished_at: saga.finished_at(),
            events: saga.history().iter().map(|e| e.event_type()).collect(),
        }
    });

    if saga.is_none() && records.is_empty() {
        return Err(ApiError::NotFound(format!("Reservation {id} not found")));
    }

    Ok(Json(ReservationStatusResponse {
        request_id,
        saga,
        records,
    }))
}

/// POST /reservations/{request_id}/cancel: releases every leg of a committed
/// reservation.
#[tracing::instrument(skip(state))]
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ReservationOutcome>, ApiError> {
    let outcome = state
        .coordinator
        .cancel_reservation(&RequestId::from(id.as_str()))
        .await?;
    let local = state.local_resources(&outcome);
    state.announce_resources(&local).await;
    Ok(Json(outcome))
}
