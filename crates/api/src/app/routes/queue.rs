use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};

use helpdesk_infra::jobs::{JobFilter, JobKey, JobStatus, QueueName};

use crate::app::{dto, errors};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_jobs))
        .route("/jobs", post(submit_job))
        .route("/jobs/:key", delete(cancel_job))
        .route("/clear", delete(clear_terminal_jobs))
}

fn parse_queue(name: &str) -> Result<QueueName, axum::response::Response> {
    name.parse::<QueueName>()
        .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "unknown_queue", e.to_string()))
}

fn parse_status(status: &str) -> Result<JobStatus, axum::response::Response> {
    status
        .parse::<JobStatus>()
        .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_status", e.to_string()))
}

/// GET /queue?queue=notify&status=failed&page=1&pageSize=10
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    query: Result<Query<dto::ListJobsQuery>, QueryRejection>,
) -> axum::response::Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.body_text()),
    };

    let mut filter = JobFilter::default();
    if let Some(name) = query.queue.as_deref() {
        match parse_queue(name) {
            Ok(q) => filter.queue = Some(q),
            Err(resp) => return resp,
        }
    }
    if let Some(status) = query.status.as_deref() {
        match parse_status(status) {
            Ok(s) => filter = filter.with_status(s),
            Err(resp) => return resp,
        }
    }

    match services.jobs.list_jobs(filter, query.page, query.page_size).await {
        Ok(page) => Json(dto::JobListResponse::new(
            page.jobs,
            page.total,
            query.page,
            query.page_size,
        ))
        .into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// POST /queue/jobs
///
/// Idempotent on `key`: resubmitting returns the stored record unchanged.
pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::SubmitJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.body_text()),
    };
    let queue = match parse_queue(&body.queue) {
        Ok(q) => q,
        Err(resp) => return resp,
    };
    if body.key.trim().is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "key must not be empty");
    }

    let key = JobKey::new(body.key);
    let delay = Duration::from_millis(body.delay_ms);
    let submitted = match body.max_attempts {
        Some(max_attempts) => {
            services
                .jobs
                .submit_job(queue, key, body.payload, delay, max_attempts)
                .await
        }
        None => services.jobs.submit_with_policy(queue, key, body.payload, delay).await,
    };

    match submitted {
        Ok(job) => (StatusCode::CREATED, Json(dto::JobView::from(job))).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// DELETE /queue/jobs/:key
///
/// Missing keys and jobs that already started are not errors.
pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(key): Path<String>,
) -> axum::response::Response {
    match services.jobs.cancel_job(&JobKey::new(key)).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// DELETE /queue/clear?queue=sla
pub async fn clear_terminal_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ClearJobsQuery>,
) -> axum::response::Response {
    let queue = match query.queue.as_deref().map(parse_queue).transpose() {
        Ok(q) => q,
        Err(resp) => return resp,
    };

    match services.jobs.clear_terminal_jobs(queue).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}
