use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use helpdesk_core::TicketId;
use helpdesk_tickets::{NewTicket, TicketPatch, TicketQuery};

use crate::app::{dto, errors};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_tickets).post(create_ticket))
        .route("/stats/overview", get(ticket_overview))
        .route("/:id", get(get_ticket).patch(update_ticket).delete(delete_ticket))
}

fn parse_id(id: &str) -> Result<TicketId, axum::response::Response> {
    id.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid ticket id"))
}

pub async fn create_ticket(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<NewTicket>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.body_text()),
    };

    match services.tickets.create(body).await {
        Ok(ticket) => (StatusCode::CREATED, Json(dto::TicketView::from(ticket))).into_response(),
        Err(e) => errors::ticket_error_to_response(e),
    }
}

/// GET /tickets?status=OPEN&priority=HIGH&search=printer&page=1&pageSize=10&sortBy=created_at&sortOrder=DESC
pub async fn list_tickets(
    Extension(services): Extension<Arc<AppServices>>,
    query: Result<Query<TicketQuery>, QueryRejection>,
) -> axum::response::Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.body_text()),
    };

    match services.tickets.list(&query).await {
        Ok(page) => Json(dto::TicketListResponse {
            tickets: page.tickets.into_iter().map(dto::TicketView::from).collect(),
            total: page.total,
        })
        .into_response(),
        Err(e) => errors::ticket_error_to_response(e),
    }
}

pub async fn ticket_overview(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.tickets.overview().await {
        Ok(overview) => Json(overview).into_response(),
        Err(e) => errors::ticket_error_to_response(e),
    }
}

pub async fn get_ticket(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.tickets.get(id).await {
        Ok(ticket) => Json(dto::TicketView::from(ticket)).into_response(),
        Err(e) => errors::ticket_error_to_response(e),
    }
}

pub async fn update_ticket(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Result<Json<TicketPatch>, JsonRejection>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Json(patch) = match body {
        Ok(b) => b,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.body_text()),
    };

    match services.tickets.update(id, patch).await {
        Ok(ticket) => Json(dto::TicketView::from(ticket)).into_response(),
        Err(e) => errors::ticket_error_to_response(e),
    }
}

pub async fn delete_ticket(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.tickets.remove(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::ticket_error_to_response(e),
    }
}
