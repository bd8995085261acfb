use axum::Router;

pub mod admin;
pub mod queue;
pub mod system;
pub mod tickets;

/// Router for all endpoints except `/health`.
pub fn router() -> Router {
    Router::new()
        .nest("/tickets", tickets::router())
        .nest("/queue", queue::router())
        .nest("/admin", admin::router())
}
