//! Ticket persistence and application service.

pub mod hooks;
pub mod postgres;
pub mod repository;
pub mod service;

pub use hooks::TicketLifecycleHook;
pub use postgres::PostgresTicketRepository;
pub use repository::{InMemoryTicketRepository, TicketPage, TicketRepository, TicketRepositoryError};
pub use service::{TicketService, TicketServiceError};
