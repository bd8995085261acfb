use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use helpdesk_core::DomainError;
use helpdesk_infra::{
    config::ConfigurationError,
    jobs::{JobStoreError, QueueError},
    tickets::{TicketRepositoryError, TicketServiceError},
};

pub fn ticket_error_to_response(err: TicketServiceError) -> axum::response::Response {
    match err {
        TicketServiceError::Domain(e) => domain_error_to_response(e),
        TicketServiceError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("ticket {id} not found"))
        }
        TicketServiceError::Repository(TicketRepositoryError::AlreadyExists(id)) => {
            json_error(StatusCode::CONFLICT, "conflict", format!("ticket {id} already exists"))
        }
        TicketServiceError::Repository(e) => {
            tracing::error!(error = %e, "ticket repository failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
        TicketServiceError::Queue(e) => queue_error_to_response(e),
    }
}

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::InvalidRequest(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        QueueError::Configuration(e @ ConfigurationError::UnknownQueue(_)) => {
            json_error(StatusCode::BAD_REQUEST, "unknown_queue", e.to_string())
        }
        QueueError::Configuration(e) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "configuration_error", e.to_string())
        }
        QueueError::Store(e @ JobStoreError::NotFound(_)) => {
            json_error(StatusCode::NOT_FOUND, "not_found", e.to_string())
        }
        QueueError::Store(e @ JobStoreError::Storage(_)) => {
            tracing::error!(error = %e, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
        QueueError::Store(e) => json_error(StatusCode::CONFLICT, "conflict", e.to_string()),
    }
}

fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        DomainError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
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
