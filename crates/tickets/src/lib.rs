//! Tickets domain module.
//!
//! Support tickets implemented as plain domain logic (no IO, no HTTP, no
//! storage). Persistence lives in `helpdesk-infra::tickets`.

pub mod query;
pub mod ticket;

pub use query::{SortOrder, TicketOverview, TicketQuery, TicketSortBy};
pub use ticket::{NewTicket, Ticket, TicketPatch, TicketPriority, TicketStatus};
