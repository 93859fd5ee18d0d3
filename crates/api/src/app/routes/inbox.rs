use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use flowforge_core::{ItemId, OrgId};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/inbox", get(list_inbox))
        .route("/inbox/:id/dismiss", post(dismiss_item))
}

pub async fn list_inbox(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let Some(org_raw) = params.get("org_id") else {
        return errors::json_error(StatusCode::BAD_REQUEST, "missing_param", "org_id is required");
    };
    let org_id: OrgId = match org_raw.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid org id"),
    };
    let status = match params.get("status") {
        Some(s) => match errors::parse_item_status(s) {
            Ok(v) => Some(v),
            Err(resp) => return resp,
        },
        None => None,
    };

    match services.inbox_store.list(org_id, status) {
        Ok(items) => {
            let out: Vec<dto::InboxItemResponse> =
                items.iter().map(dto::InboxItemResponse::from).collect();
            Json(out).into_response()
        }
        Err(e) => errors::inbox_error_to_response(e),
    }
}

pub async fn dismiss_item(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let item_id: ItemId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid item id"),
    };
    match services.inbox.dismiss(item_id) {
        Ok(item) => Json(dto::InboxItemResponse::from(&item)).into_response(),
        Err(e) => errors::inbox_error_to_response(e),
    }
}
