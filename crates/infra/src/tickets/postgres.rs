//! Postgres-backed ticket repository.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use helpdesk_core::TicketId;
use helpdesk_tickets::{SortOrder, Ticket, TicketOverview, TicketQuery, TicketSortBy};

use crate::jobs::handlers::TicketReader;
use crate::jobs::types::HandlerFailure;

use super::repository::{TicketPage, TicketRepository, TicketRepositoryError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tickets (
    id          UUID PRIMARY KEY,
    title       TEXT NOT NULL,
    description TEXT NOT NULL,
    status      TEXT NOT NULL,
    priority    TEXT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS tickets_created_idx ON tickets (created_at DESC);
CREATE INDEX IF NOT EXISTS tickets_status_idx ON tickets (status);
"#;

const COLUMNS: &str = "id, title, description, status, priority, created_at, updated_at";

// Shared by the page query and its count.
const FILTER: &str = r#"
    WHERE ($1::text IS NULL OR status = $1)
      AND ($2::text IS NULL OR priority = $2)
      AND ($3::text IS NULL
           OR strpos(lower(title), lower($3)) > 0
           OR strpos(lower(description), lower($3)) > 0)
"#;

#[derive(Debug, Clone)]
pub struct PostgresTicketRepository {
    pool: PgPool,
}

impl PostgresTicketRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(SCHEMA).execute(pool).await?;
        Ok(())
    }
}

/// Matches `TicketPriority::rank`.
const PRIORITY_RANK: &str = "CASE priority WHEN 'LOW' THEN 0 WHEN 'MEDIUM' THEN 1 ELSE 2 END";

fn order_by(query: &TicketQuery) -> String {
    let column = match query.sort_by {
        TicketSortBy::CreatedAt => "created_at",
        TicketSortBy::Status => "status",
        TicketSortBy::Priority => PRIORITY_RANK,
    };
    let direction = match query.sort_order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    format!("ORDER BY {column} {direction}, created_at {direction}, id {direction}")
}

#[async_trait]
impl TicketRepository for PostgresTicketRepository {
    #[instrument(skip(self, ticket), fields(ticket_id = %ticket.id), err)]
    async fn insert(&self, ticket: &Ticket) -> Result<(), TicketRepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO tickets (id, title, description, status, priority, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(ticket.id.as_uuid())
        .bind(&ticket.title)
        .bind(&ticket.description)
        .bind(ticket.status.as_str())
        .bind(ticket.priority.as_str())
        .bind(ticket.created_at)
        .bind(ticket.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                TicketRepositoryError::AlreadyExists(ticket.id)
            } else {
                map_sqlx_error("insert", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(ticket_id = %id), err)]
    async fn get(&self, id: TicketId) -> Result<Option<Ticket>, TicketRepositoryError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM tickets WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(ticket_from_row).transpose()
    }

    #[instrument(skip(self, ticket), fields(ticket_id = %ticket.id), err)]
    async fn update(&self, ticket: &Ticket) -> Result<bool, TicketRepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE tickets
            SET title = $2, description = $3, status = $4, priority = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(ticket.id.as_uuid())
        .bind(&ticket.title)
        .bind(&ticket.description)
        .bind(ticket.status.as_str())
        .bind(ticket.priority.as_str())
        .bind(ticket.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(ticket_id = %id), err)]
    async fn delete(&self, id: TicketId) -> Result<bool, TicketRepositoryError> {
        let result = sqlx::query("DELETE FROM tickets WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn list(&self, query: &TicketQuery) -> Result<TicketPage, TicketRepositoryError> {
        let status = query.status.map(|s| s.as_str());
        let priority = query.priority.map(|p| p.as_str());
        let search = query.search_term();

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM tickets {FILTER}"))
            .bind(status)
            .bind(priority)
            .bind(search)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_count", e))?;

        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM tickets {FILTER} {} LIMIT $4 OFFSET $5",
            order_by(query)
        ))
        .bind(status)
        .bind(priority)
        .bind(search)
        .bind(i64::from(query.page_size))
        .bind(query.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        let tickets = rows.iter().map(ticket_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(TicketPage {
            tickets,
            total: total as u64,
        })
    }

    #[instrument(skip(self), err)]
    async fn overview(&self) -> Result<TicketOverview, TicketRepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'OPEN')        AS open,
                COUNT(*) FILTER (WHERE status = 'IN_PROGRESS') AS in_progress,
                COUNT(*) FILTER (WHERE status = 'RESOLVED')    AS resolved
            FROM tickets
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("overview", e))?;

        let count = |column: &str| -> Result<u64, TicketRepositoryError> {
            row.try_get::<i64, _>(column)
                .map(|n| n as u64)
                .map_err(|e| map_sqlx_error("overview", e))
        };

        Ok(TicketOverview {
            total: count("total")?,
            open: count("open")?,
            in_progress: count("in_progress")?,
            resolved: count("resolved")?,
        })
    }
}

#[async_trait]
impl TicketReader for PostgresTicketRepository {
    async fn read_ticket(&self, id: TicketId) -> Result<Option<Ticket>, HandlerFailure> {
        self.get(id)
            .await
            .map_err(|e| HandlerFailure::new(e.to_string()))
    }
}

fn ticket_from_row(row: &PgRow) -> Result<Ticket, TicketRepositoryError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode", e);
    let id: uuid::Uuid = row.try_get("id").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let priority: String = row.try_get("priority").map_err(decode)?;

    Ok(Ticket {
        id: TicketId::from_uuid(id),
        title: row.try_get("title").map_err(decode)?,
        description: row.try_get("description").map_err(decode)?,
        status: status
            .parse()
            .map_err(|e| TicketRepositoryError::Storage(format!("bad status column: {e}")))?,
        priority: priority
            .parse()
            .map_err(|e| TicketRepositoryError::Storage(format!("bad priority column: {e}")))?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TicketRepositoryError {
    match err {
        sqlx::Error::Database(db_err) => TicketRepositoryError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        other => TicketRepositoryError::Storage(format!("{operation} failed: {other}")),
    }
}
