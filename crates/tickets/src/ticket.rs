use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use helpdesk_core::{DomainError, DomainResult, TicketId};

pub const TITLE_MIN_CHARS: usize = 5;
pub const TITLE_MAX_CHARS: usize = 500;
pub const DESCRIPTION_MAX_CHARS: usize = 5000;

/// Ticket status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Open,
    InProgress,
    Resolved,
}

impl TicketStatus {
    pub const ALL: [TicketStatus; 3] = [Self::Open, Self::InProgress, Self::Resolved];

    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Open => "OPEN",
            TicketStatus::InProgress => "IN_PROGRESS",
            TicketStatus::Resolved => "RESOLVED",
        }
    }
}

impl core::str::FromStr for TicketStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                DomainError::validation("status must be one of: OPEN, IN_PROGRESS, RESOLVED")
            })
    }
}

/// Ticket priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketPriority {
    Low,
    #[default]
    Medium,
    High,
}

impl TicketPriority {
    pub const ALL: [TicketPriority; 3] = [Self::Low, Self::Medium, Self::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            TicketPriority::Low => "LOW",
            TicketPriority::Medium => "MEDIUM",
            TicketPriority::High => "HIGH",
        }
    }

    /// Urgency order: `Low < Medium < High`.
    pub fn rank(&self) -> u8 {
        match self {
            TicketPriority::Low => 0,
            TicketPriority::Medium => 1,
            TicketPriority::High => 2,
        }
    }
}

impl core::str::FromStr for TicketPriority {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|priority| priority.as_str() == s)
            .ok_or_else(|| DomainError::validation("priority must be one of: LOW, MEDIUM, HIGH"))
    }
}

/// Input for opening a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewTicket {
    pub title: String,
    pub description: String,
    pub priority: TicketPriority,
}

impl NewTicket {
    pub fn validate(&self) -> DomainResult<()> {
        validate_title(&self.title)?;
        validate_description(&self.description)
    }
}

/// Partial update of a ticket. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TicketPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<TicketPriority>,
    pub status: Option<TicketStatus>,
}

impl TicketPatch {
    pub fn validate(&self) -> DomainResult<()> {
        if let Some(title) = &self.title {
            validate_title(title)?;
        }
        if let Some(description) = &self.description {
            validate_description(description)?;
        }
        Ok(())
    }

    /// Whether applying this patch moves the ticket to `RESOLVED`.
    pub fn resolves(&self) -> bool {
        self.status == Some(TicketStatus::Resolved)
    }
}

fn validate_title(title: &str) -> DomainResult<()> {
    let len = title.chars().count();
    if title.trim().is_empty() {
        return Err(DomainError::validation("title must not be empty"));
    }
    if len < TITLE_MIN_CHARS {
        return Err(DomainError::validation(format!(
            "title must be at least {TITLE_MIN_CHARS} characters long"
        )));
    }
    if len > TITLE_MAX_CHARS {
        return Err(DomainError::validation(format!(
            "title must be {TITLE_MAX_CHARS} characters or less"
        )));
    }
    Ok(())
}

fn validate_description(description: &str) -> DomainResult<()> {
    if description.trim().is_empty() {
        return Err(DomainError::validation("description must not be empty"));
    }
    if description.chars().count() > DESCRIPTION_MAX_CHARS {
        return Err(DomainError::validation(format!(
            "description must be {DESCRIPTION_MAX_CHARS} characters or less"
        )));
    }
    Ok(())
}

/// A support ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub title: String,
    pub description: String,
    pub status: TicketStatus,
    pub priority: TicketPriority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    /// Open a new ticket. Tickets always start `OPEN`.
    pub fn open(id: TicketId, input: NewTicket, now: DateTime<Utc>) -> DomainResult<Self> {
        input.validate()?;
        Ok(Self {
            id,
            title: input.title,
            description: input.description,
            status: TicketStatus::Open,
            priority: input.priority,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.status == TicketStatus::Resolved
    }

    /// Apply a validated partial update.
    pub fn apply(&mut self, patch: TicketPatch, now: DateTime<Utc>) -> DomainResult<()> {
        patch.validate()?;
        if let Some(title) = patch.title {
            self.title = title;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_ticket(title: &str) -> NewTicket {
        NewTicket {
            title: title.to_string(),
            description: "Printer on floor 3 is jammed".to_string(),
            priority: TicketPriority::High,
        }
    }

    #[test]
    fn opened_ticket_starts_open() {
        let ticket = Ticket::open(TicketId::new(), new_ticket("Printer jam"), Utc::now()).unwrap();
        assert_eq!(ticket.status, TicketStatus::Open);
        assert_eq!(ticket.created_at, ticket.updated_at);
    }

    #[test]
    fn short_title_is_rejected() {
        let err = Ticket::open(TicketId::new(), new_ticket("Jam"), Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("at least 5")));
    }

    #[test]
    fn overlong_description_is_rejected() {
        let mut input = new_ticket("Printer jam");
        input.description = "x".repeat(DESCRIPTION_MAX_CHARS + 1);
        assert!(input.validate().is_err());
    }

    #[test]
    fn patch_applies_only_present_fields() {
        let created = Utc::now();
        let mut ticket = Ticket::open(TicketId::new(), new_ticket("Printer jam"), created).unwrap();
        let later = created + chrono::Duration::seconds(5);

        let patch = TicketPatch {
            status: Some(TicketStatus::Resolved),
            ..Default::default()
        };
        assert!(patch.resolves());
        ticket.apply(patch, later).unwrap();

        assert_eq!(ticket.title, "Printer jam");
        assert_eq!(ticket.priority, TicketPriority::High);
        assert!(ticket.is_resolved());
        assert_eq!(ticket.updated_at, later);
    }

    #[test]
    fn invalid_patch_leaves_ticket_untouched() {
        let mut ticket =
            Ticket::open(TicketId::new(), new_ticket("Printer jam"), Utc::now()).unwrap();
        let before = ticket.clone();
        let patch = TicketPatch {
            title: Some("no".to_string()),
            status: Some(TicketStatus::Resolved),
            ..Default::default()
        };
        assert!(ticket.apply(patch, Utc::now()).is_err());
        assert_eq!(ticket, before);
    }

    #[test]
    fn unknown_fields_are_rejected_on_create() {
        let body = serde_json::json!({
            "title": "Printer jam",
            "description": "jammed",
            "priority": "LOW",
            "status": "RESOLVED",
        });
        assert!(serde_json::from_value::<NewTicket>(body).is_err());
    }

    #[test]
    fn status_wire_format_is_screaming_snake_case() {
        let json = serde_json::to_value(TicketStatus::InProgress).unwrap();
        assert_eq!(json, "IN_PROGRESS");
        assert_eq!("IN_PROGRESS".parse::<TicketStatus>().unwrap(), TicketStatus::InProgress);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Any title within the length bounds is accepted.
            #[test]
            fn titles_within_bounds_validate(title in "[A-Za-z][A-Za-z0-9 ]{4,120}") {
                prop_assert!(new_ticket(&title).validate().is_ok());
            }

            /// Titles shorter than the minimum are always rejected.
            #[test]
            fn short_titles_never_validate(title in "[A-Za-z]{1,4}") {
                prop_assert!(new_ticket(&title).validate().is_err());
            }
        }
    }
}
