use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};

use flowforge_core::OrgId;
use flowforge_events::TriggerEvent;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new().route("/events", post(ingest_event))
}

/// Trigger ingress: normalize the request into a [`TriggerEvent`] and run it
/// through the scheduler. The whole chain runs before the response.
pub async fn ingest_event(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::IngestEventRequest>,
) -> axum::response::Response {
    let org_id: OrgId = match body.org_id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid org id"),
    };

    let mut event = TriggerEvent::new(body.event_type, org_id, body.payload);
    if let Some(source_id) = body.source_id {
        event = event.with_source_id(source_id);
    }

    match services.scheduler.handle_event(event).await {
        Ok(outcome) => {
            let status = if outcome.absorbed {
                StatusCode::OK
            } else {
                StatusCode::ACCEPTED
            };
            (status, Json(dto::IngestEventResponse::from(outcome))).into_response()
        }
        Err(e) => errors::engine_error_to_response(e),
    }
}
