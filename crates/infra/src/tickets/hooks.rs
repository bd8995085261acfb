//! Ticket lifecycle → job queue.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use helpdesk_core::TicketId;

use crate::jobs::{CancelOutcome, JobKey, JobQueue, QueueError, QueueName, TicketJobPayload};

/// Schedules and cancels the jobs that belong to a ticket.
#[derive(Debug, Clone)]
pub struct TicketLifecycleHook {
    queue: Arc<JobQueue>,
}

impl TicketLifecycleHook {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self { queue }
    }

    /// Submit the ticket's notification (now) and SLA check (after the SLA delay).
    pub async fn on_created(&self, ticket_id: TicketId) -> Result<(), QueueError> {
        let payload = TicketJobPayload::new(ticket_id).to_value();

        self.queue
            .submit_with_policy(
                QueueName::Notify,
                JobKey::for_ticket(QueueName::Notify, ticket_id),
                payload.clone(),
                Duration::ZERO,
            )
            .await?;

        let sla_delay = self.queue.config().sla_delay;
        self.queue
            .submit_with_policy(
                QueueName::Sla,
                JobKey::for_ticket(QueueName::Sla, ticket_id),
                payload,
                sla_delay,
            )
            .await?;

        info!(%ticket_id, sla_delay_secs = sla_delay.as_secs(), "ticket jobs scheduled");
        Ok(())
    }

    /// Cancel the ticket's pending SLA check. A check already running is left alone.
    pub async fn on_resolved(&self, ticket_id: TicketId) -> Result<CancelOutcome, QueueError> {
        let outcome = self
            .queue
            .cancel_job(&JobKey::for_ticket(QueueName::Sla, ticket_id))
            .await?;
        info!(%ticket_id, outcome = ?outcome, "sla check cancellation requested");
        Ok(outcome)
    }
}
