//! Ticket application service: CRUD plus lifecycle hooks.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use helpdesk_core::{DomainError, TicketId};
use helpdesk_tickets::{NewTicket, Ticket, TicketOverview, TicketPatch, TicketQuery};

use crate::jobs::QueueError;

use super::hooks::TicketLifecycleHook;
use super::repository::{TicketPage, TicketRepository, TicketRepositoryError};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TicketServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("ticket not found: {0}")]
    NotFound(TicketId),
    #[error(transparent)]
    Repository(#[from] TicketRepositoryError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Clone)]
pub struct TicketService {
    tickets: Arc<dyn TicketRepository>,
    hook: TicketLifecycleHook,
}

impl std::fmt::Debug for TicketService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketService")
            .field("hook", &self.hook)
            .finish_non_exhaustive()
    }
}

impl TicketService {
    pub fn new(tickets: Arc<dyn TicketRepository>, hook: TicketLifecycleHook) -> Self {
        Self { tickets, hook }
    }

    /// Open a ticket and schedule its notification and SLA check.
    pub async fn create(&self, input: NewTicket) -> Result<Ticket, TicketServiceError> {
        let ticket = Ticket::open(TicketId::new(), input, Utc::now())?;
        self.tickets.insert(&ticket).await?;
        self.hook.on_created(ticket.id).await?;

        info!(ticket_id = %ticket.id, priority = ticket.priority.as_str(), "ticket created");
        Ok(ticket)
    }

    pub async fn list(&self, query: &TicketQuery) -> Result<TicketPage, TicketServiceError> {
        query.validate()?;
        Ok(self.tickets.list(query).await?)
    }

    pub async fn get(&self, id: TicketId) -> Result<Ticket, TicketServiceError> {
        self.tickets
            .get(id)
            .await?
            .ok_or(TicketServiceError::NotFound(id))
    }

    /// Apply a partial update. Resolving a ticket cancels its pending SLA check
    /// once the new status is stored.
    pub async fn update(
        &self,
        id: TicketId,
        patch: TicketPatch,
    ) -> Result<Ticket, TicketServiceError> {
        let mut ticket = self.get(id).await?;
        let resolves = patch.resolves();
        ticket.apply(patch, Utc::now())?;

        if !self.tickets.update(&ticket).await? {
            return Err(TicketServiceError::NotFound(id));
        }
        if resolves {
            self.hook.on_resolved(id).await?;
        }

        info!(ticket_id = %id, status = ticket.status.as_str(), "ticket updated");
        Ok(ticket)
    }

    /// Delete a ticket. A pending SLA check is left to find it gone.
    pub async fn remove(&self, id: TicketId) -> Result<(), TicketServiceError> {
        if !self.tickets.delete(id).await? {
            return Err(TicketServiceError::NotFound(id));
        }
        info!(ticket_id = %id, "ticket removed");
        Ok(())
    }

    pub async fn overview(&self) -> Result<TicketOverview, TicketServiceError> {
        Ok(self.tickets.overview().await?)
    }
}
