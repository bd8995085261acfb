//! Handlers for the `notify` and `sla` queues.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use helpdesk_core::TicketId;
use helpdesk_tickets::{Ticket, TicketPriority, TicketStatus};

use crate::clock::SharedClock;

use super::executor::JobHandler;
use super::types::{HandlerFailure, Job, JobResult};

/// Payload carried by every ticket job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketJobPayload {
    pub ticket_id: TicketId,
}

impl TicketJobPayload {
    pub fn new(ticket_id: TicketId) -> Self {
        Self { ticket_id }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({ "ticket_id": self.ticket_id })
    }

    pub fn from_job(job: &Job) -> Result<Self, HandlerFailure> {
        serde_json::from_value(job.payload.clone())
            .map_err(|e| HandlerFailure::new(format!("malformed ticket payload: {e}")))
    }
}

/// Outbound notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn ticket_created(&self, ticket_id: TicketId) -> Result<(), HandlerFailure>;
}

/// Notifier that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn ticket_created(&self, ticket_id: TicketId) -> Result<(), HandlerFailure> {
        info!(%ticket_id, "notification sent");
        Ok(())
    }
}

/// `notify` queue handler.
pub struct NotifyHandler {
    notifier: Arc<dyn Notifier>,
}

impl NotifyHandler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl JobHandler for NotifyHandler {
    async fn handle(&self, job: &Job) -> JobResult {
        let payload = TicketJobPayload::from_job(job)?;
        self.notifier.ticket_created(payload.ticket_id).await
    }
}

/// Read access to tickets at SLA fire time.
#[async_trait]
pub trait TicketReader: Send + Sync {
    async fn read_ticket(&self, id: TicketId) -> Result<Option<Ticket>, HandlerFailure>;
}

/// An open ticket whose SLA window elapsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaViolation {
    pub ticket_id: TicketId,
    pub title: String,
    pub priority: TicketPriority,
    pub status: TicketStatus,
    pub detected_at: DateTime<Utc>,
}

/// Escalation sink for SLA violations.
pub trait EscalationSink: Send + Sync + 'static {
    fn escalate(&self, violation: SlaViolation);
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryEscalationLog {
    inner: Mutex<Vec<SlaViolation>>,
}

impl InMemoryEscalationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<SlaViolation> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl EscalationSink for InMemoryEscalationLog {
    fn escalate(&self, violation: SlaViolation) {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(violation);
    }
}

/// `sla` queue handler.
///
/// The ticket is read when the job fires, not when it was scheduled: a ticket
/// resolved (or deleted) in the meantime is not a violation.
pub struct SlaHandler {
    tickets: Arc<dyn TicketReader>,
    escalations: Arc<dyn EscalationSink>,
    clock: SharedClock,
}

impl SlaHandler {
    pub fn new(
        tickets: Arc<dyn TicketReader>,
        escalations: Arc<dyn EscalationSink>,
        clock: SharedClock,
    ) -> Self {
        Self {
            tickets,
            escalations,
            clock,
        }
    }
}

#[async_trait]
impl JobHandler for SlaHandler {
    async fn handle(&self, job: &Job) -> JobResult {
        let payload = TicketJobPayload::from_job(job)?;
        let ticket_id = payload.ticket_id;

        let Some(ticket) = self.tickets.read_ticket(ticket_id).await? else {
            debug!(%ticket_id, "sla check: ticket no longer exists");
            return Ok(());
        };

        if ticket.is_resolved() {
            debug!(%ticket_id, "sla check: ticket resolved in time");
            return Ok(());
        }

        warn!(
            %ticket_id,
            status = ticket.status.as_str(),
            priority = ticket.priority.as_str(),
            "SLA violated"
        );
        self.escalations.escalate(SlaViolation {
            ticket_id,
            title: ticket.title,
            priority: ticket.priority,
            status: ticket.status,
            detected_at: self.clock.now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use helpdesk_tickets::NewTicket;

    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::types::{JobKey, NewJob, QueueName};

    #[derive(Default)]
    struct FixedTickets(HashMap<TicketId, Ticket>);

    #[async_trait]
    impl TicketReader for FixedTickets {
        async fn read_ticket(&self, id: TicketId) -> Result<Option<Ticket>, HandlerFailure> {
            Ok(self.0.get(&id).cloned())
        }
    }

    fn ticket(status: TicketStatus) -> Ticket {
        let mut ticket = Ticket::open(
            TicketId::new(),
            NewTicket {
                title: "Printer jam".to_string(),
                description: "Floor 3".to_string(),
                priority: TicketPriority::High,
            },
            Utc::now(),
        )
        .unwrap();
        ticket.status = status;
        ticket
    }

    fn sla_job(ticket_id: TicketId) -> Job {
        Job::from_submission(
            NewJob::new(
                QueueName::Sla,
                JobKey::new(format!("sla:{ticket_id}")),
                TicketJobPayload::new(ticket_id).to_value(),
            ),
            Utc::now(),
        )
    }

    fn handler(tickets: FixedTickets) -> (SlaHandler, Arc<InMemoryEscalationLog>) {
        let log = Arc::new(InMemoryEscalationLog::new());
        let handler = SlaHandler::new(
            Arc::new(tickets),
            log.clone(),
            ManualClock::arc(Utc::now()),
        );
        (handler, log)
    }

    #[tokio::test]
    async fn open_ticket_is_escalated() {
        for status in [TicketStatus::Open, TicketStatus::InProgress] {
            let open = ticket(status);
            let id = open.id;
            let (handler, log) = handler(FixedTickets(HashMap::from([(id, open)])));

            handler.handle(&sla_job(id)).await.unwrap();

            let escalations = log.all();
            assert_eq!(escalations.len(), 1);
            assert_eq!(escalations[0].ticket_id, id);
            assert_eq!(escalations[0].status, status);
        }
    }

    #[tokio::test]
    async fn resolved_or_missing_ticket_is_a_noop() {
        let resolved = ticket(TicketStatus::Resolved);
        let id = resolved.id;
        let (handler, log) = handler(FixedTickets(HashMap::from([(id, resolved)])));

        handler.handle(&sla_job(id)).await.unwrap();
        handler.handle(&sla_job(TicketId::new())).await.unwrap();

        assert!(log.all().is_empty());
    }

    #[tokio::test]
    async fn malformed_payload_fails_the_job() {
        let (handler, _) = handler(FixedTickets::default());
        let mut job = sla_job(TicketId::new());
        job.payload = serde_json::json!({ "ticket": 42 });

        let err = handler.handle(&job).await.unwrap_err();
        assert!(err.message().starts_with("malformed ticket payload"));
    }

    #[tokio::test]
    async fn notify_handler_calls_notifier() {
        let handler = NotifyHandler::new(Arc::new(LogNotifier));
        let mut job = sla_job(TicketId::new());
        job.queue = QueueName::Notify;

        assert!(handler.handle(&job).await.is_ok());
    }
}
