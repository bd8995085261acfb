//! Ticket persistence.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use helpdesk_core::TicketId;
use helpdesk_tickets::{Ticket, TicketOverview, TicketQuery};

use crate::jobs::handlers::TicketReader;
use crate::jobs::types::HandlerFailure;

/// One page of tickets plus the unpaginated total.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketPage {
    pub tickets: Vec<Ticket>,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TicketRepositoryError {
    #[error("ticket already exists: {0}")]
    AlreadyExists(TicketId),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait TicketRepository: Send + Sync {
    async fn insert(&self, ticket: &Ticket) -> Result<(), TicketRepositoryError>;

    async fn get(&self, id: TicketId) -> Result<Option<Ticket>, TicketRepositoryError>;

    /// Overwrite an existing ticket. Returns `false` if it does not exist.
    async fn update(&self, ticket: &Ticket) -> Result<bool, TicketRepositoryError>;

    /// Returns `false` if the ticket did not exist.
    async fn delete(&self, id: TicketId) -> Result<bool, TicketRepositoryError>;

    /// Filter, sort and paginate per `query`.
    async fn list(&self, query: &TicketQuery) -> Result<TicketPage, TicketRepositoryError>;

    async fn overview(&self) -> Result<TicketOverview, TicketRepositoryError>;
}

/// In-memory ticket repository for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTicketRepository {
    tickets: RwLock<HashMap<TicketId, Ticket>>,
}

impl InMemoryTicketRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn poisoned() -> TicketRepositoryError {
        TicketRepositoryError::Storage("ticket store lock poisoned".to_string())
    }
}

#[async_trait]
impl TicketRepository for InMemoryTicketRepository {
    async fn insert(&self, ticket: &Ticket) -> Result<(), TicketRepositoryError> {
        let mut tickets = self.tickets.write().map_err(|_| Self::poisoned())?;
        if tickets.contains_key(&ticket.id) {
            return Err(TicketRepositoryError::AlreadyExists(ticket.id));
        }
        tickets.insert(ticket.id, ticket.clone());
        Ok(())
    }

    async fn get(&self, id: TicketId) -> Result<Option<Ticket>, TicketRepositoryError> {
        let tickets = self.tickets.read().map_err(|_| Self::poisoned())?;
        Ok(tickets.get(&id).cloned())
    }

    async fn update(&self, ticket: &Ticket) -> Result<bool, TicketRepositoryError> {
        let mut tickets = self.tickets.write().map_err(|_| Self::poisoned())?;
        match tickets.get_mut(&ticket.id) {
            Some(existing) => {
                *existing = ticket.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: TicketId) -> Result<bool, TicketRepositoryError> {
        let mut tickets = self.tickets.write().map_err(|_| Self::poisoned())?;
        Ok(tickets.remove(&id).is_some())
    }

    async fn list(&self, query: &TicketQuery) -> Result<TicketPage, TicketRepositoryError> {
        let tickets = self.tickets.read().map_err(|_| Self::poisoned())?;
        let mut matching: Vec<&Ticket> = tickets.values().filter(|t| query.matches(t)).collect();
        matching.sort_by(|a, b| query.compare(a, b));

        let total = matching.len() as u64;
        let tickets = matching
            .into_iter()
            .skip(query.offset())
            .take(query.page_size as usize)
            .cloned()
            .collect();

        Ok(TicketPage { tickets, total })
    }

    async fn overview(&self) -> Result<TicketOverview, TicketRepositoryError> {
        let tickets = self.tickets.read().map_err(|_| Self::poisoned())?;
        Ok(tickets.values().collect())
    }
}

#[async_trait]
impl TicketReader for InMemoryTicketRepository {
    async fn read_ticket(&self, id: TicketId) -> Result<Option<Ticket>, HandlerFailure> {
        self.get(id)
            .await
            .map_err(|e| HandlerFailure::new(e.to_string()))
    }
}
