use axum::Router;

pub mod events;
pub mod inbox;
pub mod jobs;
pub mod system;

pub fn router() -> Router {
    Router::new()
        .merge(events::router())
        .merge(jobs::router())
        .merge(inbox::router())
}
