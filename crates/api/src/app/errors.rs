use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use flowforge_core::EngineError;
use flowforge_inbox::{InboxError, ItemStatus};

pub fn engine_error_to_response(err: EngineError) -> axum::response::Response {
    match err {
        EngineError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        EngineError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        EngineError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        EngineError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        EngineError::PolicyRejection(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "policy_rejection", msg)
        }
        EngineError::ChainDepthExceeded { .. } => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "chain_depth_exceeded", err.to_string())
        }
        EngineError::Timeout { .. } => {
            json_error(StatusCode::GATEWAY_TIMEOUT, "timeout", err.to_string())
        }
        EngineError::ExternalAction(msg) => {
            json_error(StatusCode::BAD_GATEWAY, "external_action_error", msg)
        }
        EngineError::Storage(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", msg)
        }
    }
}

pub fn inbox_error_to_response(err: InboxError) -> axum::response::Response {
    match err {
        InboxError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("inbox item {id}"))
        }
        InboxError::IllegalTransition { .. } => {
            json_error(StatusCode::CONFLICT, "illegal_transition", err.to_string())
        }
        InboxError::Storage(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_item_status(s: &str) -> Result<ItemStatus, axum::response::Response> {
    match s.to_lowercase().as_str() {
        "open" => Ok(ItemStatus::Open),
        "enriching" => Ok(ItemStatus::Enriching),
        "ready" => Ok(ItemStatus::Ready),
        "approved" => Ok(ItemStatus::Approved),
        "executing" => Ok(ItemStatus::Executing),
        "completed" => Ok(ItemStatus::Completed),
        "dismissed" => Ok(ItemStatus::Dismissed),
        "auto_resolved" => Ok(ItemStatus::AutoResolved),
        _ => Err(json_error(
            StatusCode::BAD_REQUEST,
            "invalid_status",
            "status must be one of: open, enriching, ready, approved, executing, completed, dismissed, auto_resolved",
        )),
    }
}
