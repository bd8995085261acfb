//! Ticket listing: filters, sorting, pagination and overview counts.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use helpdesk_core::{DomainError, DomainResult};

use crate::ticket::{Ticket, TicketPriority, TicketStatus};

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketSortBy {
    #[default]
    CreatedAt,
    Status,
    Priority,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// List query as accepted by `GET /tickets`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct TicketQuery {
    pub status: Option<TicketStatus>,
    pub priority: Option<TicketPriority>,
    pub search: Option<String>,
    pub page: u32,
    pub page_size: u32,
    pub sort_by: TicketSortBy,
    pub sort_order: SortOrder,
}

impl Default for TicketQuery {
    fn default() -> Self {
        Self {
            status: None,
            priority: None,
            search: None,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            sort_by: TicketSortBy::default(),
            sort_order: SortOrder::default(),
        }
    }
}

impl TicketQuery {
    pub fn validate(&self) -> DomainResult<()> {
        if self.page < 1 {
            return Err(DomainError::validation("page must not be less than 1"));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(DomainError::validation(format!(
                "pageSize must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        Ok(())
    }

    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.page_size as usize
    }

    /// Search term with surrounding whitespace removed; empty terms are ignored.
    pub fn search_term(&self) -> Option<&str> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
    }

    pub fn matches(&self, ticket: &Ticket) -> bool {
        if self.status.is_some_and(|s| s != ticket.status) {
            return false;
        }
        if self.priority.is_some_and(|p| p != ticket.priority) {
            return false;
        }
        match self.search_term() {
            Some(term) => {
                let term = term.to_lowercase();
                ticket.title.to_lowercase().contains(&term)
                    || ticket.description.to_lowercase().contains(&term)
            }
            None => true,
        }
    }

    /// Order tickets the way the persistent store orders them.
    ///
    /// Status sorts by its wire string, priority by urgency. Ties fall back
    /// to `created_at` so pages are stable.
    pub fn compare(&self, a: &Ticket, b: &Ticket) -> Ordering {
        let primary = match self.sort_by {
            TicketSortBy::CreatedAt => a.created_at.cmp(&b.created_at),
            TicketSortBy::Status => a.status.as_str().cmp(b.status.as_str()),
            TicketSortBy::Priority => a.priority.rank().cmp(&b.priority.rank()),
        }
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id));

        match self.sort_order {
            SortOrder::Asc => primary,
            SortOrder::Desc => primary.reverse(),
        }
    }
}

/// Ticket counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketOverview {
    pub total: u64,
    pub open: u64,
    pub in_progress: u64,
    pub resolved: u64,
}

impl TicketOverview {
    pub fn record(&mut self, status: TicketStatus) {
        self.total += 1;
        match status {
            TicketStatus::Open => self.open += 1,
            TicketStatus::InProgress => self.in_progress += 1,
            TicketStatus::Resolved => self.resolved += 1,
        }
    }
}

impl<'a> FromIterator<&'a Ticket> for TicketOverview {
    fn from_iter<I: IntoIterator<Item = &'a Ticket>>(iter: I) -> Self {
        let mut overview = Self::default();
        for ticket in iter {
            overview.record(ticket.status);
        }
        overview
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use helpdesk_core::TicketId;

    use super::*;
    use crate::ticket::NewTicket;

    fn ticket(title: &str, description: &str, priority: TicketPriority, age_secs: i64) -> Ticket {
        Ticket::open(
            TicketId::new(),
            NewTicket {
                title: title.to_string(),
                description: description.to_string(),
                priority,
            },
            Utc::now() - Duration::seconds(age_secs),
        )
        .unwrap()
    }

    #[test]
    fn defaults_match_http_defaults() {
        let query: TicketQuery = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(query.page, 1);
        assert_eq!(query.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(query.sort_by, TicketSortBy::CreatedAt);
        assert_eq!(query.sort_order, SortOrder::Desc);
    }

    #[test]
    fn page_size_above_cap_is_rejected() {
        let query = TicketQuery {
            page_size: MAX_PAGE_SIZE + 1,
            ..Default::default()
        };
        assert!(query.validate().is_err());
    }

    #[test]
    fn search_matches_title_or_description_case_insensitively() {
        let query = TicketQuery {
            search: Some("  VPN ".to_string()),
            ..Default::default()
        };
        assert!(query.matches(&ticket("VPN drops hourly", "n/a", TicketPriority::Low, 0)));
        assert!(query.matches(&ticket("Laptop issue", "cannot reach vpn", TicketPriority::Low, 0)));
        assert!(!query.matches(&ticket("Laptop issue", "battery", TicketPriority::Low, 0)));
    }

    #[test]
    fn newest_first_by_default() {
        let query = TicketQuery::default();
        let old = ticket("Older ticket", "a", TicketPriority::Low, 60);
        let new = ticket("Newer ticket", "b", TicketPriority::Low, 0);
        let mut tickets = vec![old.clone(), new.clone()];
        tickets.sort_by(|a, b| query.compare(a, b));
        assert_eq!(tickets[0].id, new.id);
    }

    #[test]
    fn priority_sorts_by_urgency() {
        let query = TicketQuery {
            sort_by: TicketSortBy::Priority,
            sort_order: SortOrder::Asc,
            ..Default::default()
        };
        let high = ticket("Server down", "a", TicketPriority::High, 0);
        let low = ticket("Mouse broken", "b", TicketPriority::Low, 0);
        let medium = ticket("Printer jam", "c", TicketPriority::Medium, 0);
        let mut tickets = vec![high.clone(), low.clone(), medium.clone()];

        tickets.sort_by(|a, b| query.compare(a, b));
        let order: Vec<_> = tickets.iter().map(|t| t.priority).collect();
        assert_eq!(
            order,
            vec![TicketPriority::Low, TicketPriority::Medium, TicketPriority::High]
        );
    }

    #[test]
    fn overview_counts_each_status() {
        let mut resolved = ticket("Resolved one", "a", TicketPriority::Low, 0);
        resolved.status = TicketStatus::Resolved;
        let open = ticket("Open ticket", "b", TicketPriority::High, 0);

        let overview: TicketOverview = [&resolved, &open].into_iter().collect();
        assert_eq!(overview.total, 2);
        assert_eq!(overview.open, 1);
        assert_eq!(overview.resolved, 1);
        assert_eq!(overview.in_progress, 0);
    }
}
