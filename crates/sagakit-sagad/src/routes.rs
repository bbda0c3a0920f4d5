//! Acceptance API routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sagakit::registry::SagaRegistry;
use sagakit::repository::SagaRepository;
use sagakit::transfer::{TransferData, TRANSFER_DATA_TYPE};
use sagakit_common::{Amount, Error};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shared handler state
#[derive(Debug, Clone)]
pub struct ApiState {
    /// Saga repository for acceptance and status reads
    pub repository: SagaRepository,
    /// Registry, used to resolve current step names
    pub registry: Arc<SagaRegistry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct CreateTransferRequest {
    from_user_id: String,
    to_user_id: String,
    amount: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct CreateTransferResponse {
    saga_id: Uuid,
    status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SagaStatusResponse {
    saga_id: Uuid,
    state: String,
    current_step: Option<String>,
    errors: Vec<String>,
}

/// Builds the acceptance API router.
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/transfers", post(post_transfer))
        .route("/transfers/{saga_id}", get(get_transfer))
        .with_state(state)
}

async fn post_transfer(
    State(state): State<ApiState>,
    Json(payload): Json<CreateTransferRequest>,
) -> Result<Response, Response> {
    let saga_id = Uuid::new_v4();
    let data = TransferData {
        saga_id,
        from_user_id: payload.from_user_id,
        to_user_id: payload.to_user_id,
        amount: Amount::from(payload.amount),
    };

    state
        .repository
        .create_saga(saga_id, &data, TRANSFER_DATA_TYPE)
        .await
        .map_err(into_error_response)?;

    Ok((
        StatusCode::ACCEPTED,
        [(header::LOCATION, format!("/transfers/{saga_id}"))],
        Json(CreateTransferResponse {
            saga_id,
            status: "Queued".to_string(),
        }),
    )
        .into_response())
}

async fn get_transfer(
    State(state): State<ApiState>,
    Path(saga_id): Path<Uuid>,
) -> Result<Json<SagaStatusResponse>, Response> {
    let snapshot = state
        .repository
        .get_snapshot(&saga_id)
        .await
        .map_err(into_error_response)?
        .ok_or_else(|| StatusCode::NOT_FOUND.into_response())?;

    let current_step = if snapshot.state.is_forward() {
        state
            .registry
            .step_names(&snapshot.data_type)
            .and_then(|names| names.get(snapshot.cursor).cloned())
    } else {
        None
    };

    Ok(Json(SagaStatusResponse {
        saga_id,
        state: snapshot.state.to_string(),
        current_step,
        errors: snapshot.error_log,
    }))
}

fn into_error_response(err: Error) -> Response {
    tracing::error!("Request failed: {}", err);
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}
