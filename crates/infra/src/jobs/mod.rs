//! Durable, at-least-once job queue.
//!
//! ## Design
//!
//! - Jobs are keyed by caller-chosen keys (`notify:<ticket>`, `sla:<ticket>`);
//!   submission is idempotent on the key
//! - Every status change is an atomic compare-and-set in the `JobStore`, which
//!   is what makes claims exclusive and lets cancellation race dispatch safely
//! - Bounded retries with exponential backoff; exhausted jobs end `failed`
//!
//! ## Components
//!
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `Scheduler`: per-queue dispatch loops with a concurrency ceiling
//! - `WorkerExecutor`: runs a claimed job and records the outcome
//! - `CancellationController`: cancels jobs that have not started
//! - `StatsAggregator`: per-queue status counts
//! - `JobQueue`: the facade over all of the above

pub mod cancel;
pub mod executor;
pub mod handlers;
pub mod postgres;
pub mod scheduler;
pub mod service;
pub mod stats;
pub mod store;
pub mod types;

pub use cancel::{CancelOutcome, CancellationController};
pub use executor::{ExecutionOutcome, HandlerRegistry, JobHandler, WorkerExecutor, handler_fn};
pub use handlers::{
    EscalationSink, InMemoryEscalationLog, LogNotifier, Notifier, NotifyHandler, SlaHandler,
    SlaViolation, TicketJobPayload, TicketReader,
};
pub use postgres::PostgresJobStore;
pub use scheduler::{Scheduler, SchedulerHandle};
pub use service::{JobQueue, QueueError, QueueWorkers};
pub use stats::StatsAggregator;
pub use store::{InMemoryJobStore, JobFilter, JobPage, JobPatch, JobStore, JobStoreError, SharedJobStore};
pub use types::{
    HandlerFailure, Job, JobKey, JobResult, JobStatus, NewJob, QueueName, QueueStats, RetryPolicy,
};
