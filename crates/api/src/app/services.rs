use std::sync::Arc;

use sqlx::PgPool;

use helpdesk_infra::{
    clock::{SharedClock, SystemClock},
    config::{AppConfig, ConfigurationError, JobEngineConfig},
    db,
    jobs::{
        HandlerRegistry, InMemoryEscalationLog, InMemoryJobStore, JobQueue, LogNotifier,
        NotifyHandler, PostgresJobStore, QueueName, SharedJobStore, SlaHandler, TicketReader,
    },
    tickets::{
        InMemoryTicketRepository, PostgresTicketRepository, TicketLifecycleHook, TicketRepository,
        TicketService,
    },
};

/// Everything the HTTP handlers need.
#[derive(Debug)]
pub struct AppServices {
    pub tickets: TicketService,
    pub jobs: Arc<JobQueue>,
    pub escalations: Arc<InMemoryEscalationLog>,
}

/// Wire Postgres-backed stores when `DATABASE_URL` is set, in-memory ones otherwise.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<Arc<AppServices>> {
    let services = match &config.database_url {
        Some(url) => {
            let pool = db::connect_and_migrate(url).await?;
            build_postgres_services(pool, config.jobs.clone())?
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory stores");
            build_in_memory_services(config.jobs.clone())?
        }
    };
    Ok(Arc::new(services))
}

/// In-memory wiring (dev/test).
pub fn build_in_memory_services(jobs: JobEngineConfig) -> Result<AppServices, ConfigurationError> {
    let repo = InMemoryTicketRepository::arc();
    wire(repo.clone(), repo, InMemoryJobStore::arc(), jobs)
}

fn build_postgres_services(
    pool: PgPool,
    jobs: JobEngineConfig,
) -> Result<AppServices, ConfigurationError> {
    let repo = Arc::new(PostgresTicketRepository::new(pool.clone()));
    wire(repo.clone(), repo, Arc::new(PostgresJobStore::new(pool)), jobs)
}

fn wire(
    repo: Arc<dyn TicketRepository>,
    reader: Arc<dyn TicketReader>,
    store: SharedJobStore,
    jobs: JobEngineConfig,
) -> Result<AppServices, ConfigurationError> {
    let clock: SharedClock = Arc::new(SystemClock);
    let escalations = Arc::new(InMemoryEscalationLog::new());

    let handlers = HandlerRegistry::new()
        .with(QueueName::Notify, Arc::new(NotifyHandler::new(Arc::new(LogNotifier))))?
        .with(
            QueueName::Sla,
            Arc::new(SlaHandler::new(reader, escalations.clone(), clock.clone())),
        )?;

    let queue = Arc::new(JobQueue::new(store, clock, handlers, jobs)?);
    let tickets = TicketService::new(repo, TicketLifecycleHook::new(queue.clone()));

    Ok(AppServices {
        tickets,
        jobs: queue,
        escalations,
    })
}
