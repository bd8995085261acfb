use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use helpdesk_core::TicketId;
use helpdesk_infra::jobs::{Job, JobStatus, QueueName};
use helpdesk_tickets::{Ticket, TicketPriority, TicketStatus};

// -------------------------
// Request DTOs
// -------------------------

/// Query string of `GET /queue`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsQuery {
    pub queue: Option<String>,
    pub status: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    10
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SubmitJobRequest {
    pub queue: String,
    pub key: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub delay_ms: u64,
    /// Defaults to the queue's configured budget.
    pub max_attempts: Option<u32>,
}

/// Query string of `DELETE /queue/clear`.
#[derive(Debug, Default, Deserialize)]
pub struct ClearJobsQuery {
    pub queue: Option<String>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketView {
    pub id: TicketId,
    pub title: String,
    pub description: String,
    pub status: TicketStatus,
    pub priority: TicketPriority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Ticket> for TicketView {
    fn from(t: Ticket) -> Self {
        Self {
            id: t.id,
            title: t.title,
            description: t.description,
            status: t.status,
            priority: t.priority,
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TicketListResponse {
    pub tickets: Vec<TicketView>,
    pub total: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub key: String,
    pub queue: QueueName,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub ready_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            key: job.key.as_str().to_string(),
            queue: job.queue,
            payload: job.payload,
            status: job.status,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            ready_at: job.ready_at,
            last_error: job.last_error,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListResponse {
    pub jobs: Vec<JobView>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u64,
}

impl JobListResponse {
    pub fn new(jobs: Vec<Job>, total: u64, page: u32, page_size: u32) -> Self {
        Self {
            jobs: jobs.into_iter().map(JobView::from).collect(),
            total,
            page,
            page_size,
            total_pages: total.div_ceil(u64::from(page_size.max(1))),
        }
    }
}
