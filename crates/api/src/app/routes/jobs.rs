use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use flowforge_core::JobId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/steps", get(get_job_steps))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/steps/:step/decision", post(decide_step))
}

fn parse_job_id(id: &str) -> Result<JobId, axum::response::Response> {
    id.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.jobs.get(job_id) {
        Ok(Some(job)) => Json(dto::JobResponse::from(&job)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn get_job_steps(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.jobs.get(job_id) {
        Ok(Some(job)) => {
            let steps: Vec<dto::StepResponse> =
                job.steps.iter().map(dto::StepResponse::from).collect();
            Json(steps).into_response()
        }
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.scheduler.cancel_job(job_id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

/// Approval callback for a step parked in `awaiting_approval`. Idempotent:
/// a decision for an already-resolved step returns its current status.
pub async fn decide_step(
    Extension(services): Extension<Arc<AppServices>>,
    Path((id, step)): Path<(String, String)>,
    Json(body): Json<dto::DecisionRequest>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services
        .scheduler
        .resolve_approval(job_id, &step, body.decision)
        .await
    {
        Ok(status) => Json(dto::DecisionResponse { step, status }).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}
