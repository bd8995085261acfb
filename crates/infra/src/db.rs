//! Postgres connection wiring.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::jobs::postgres::PostgresJobStore;
use crate::tickets::postgres::PostgresTicketRepository;

const MAX_CONNECTIONS: u32 = 10;

/// Connect to Postgres and create the job and ticket tables if missing.
pub async fn connect_and_migrate(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect(database_url)
        .await?;

    PostgresTicketRepository::ensure_schema(&pool).await?;
    PostgresJobStore::ensure_schema(&pool).await?;
    info!("postgres schema ready");

    Ok(pool)
}
