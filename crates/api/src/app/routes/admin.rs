use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/queues/:name/stats", get(queue_stats))
        .route("/escalations", get(list_escalations))
}

/// GET /admin/queues/:name/stats
///
/// Unknown queue names are rejected with 400.
pub async fn queue_stats(
    Extension(services): Extension<Arc<AppServices>>,
    Path(name): Path<String>,
) -> axum::response::Response {
    match services.jobs.get_stats(&name).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// GET /admin/escalations
///
/// SLA violations recorded since startup.
pub async fn list_escalations(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    Json(services.escalations.all()).into_response()
}
