//! Job executor: runs one claimed job and records the outcome.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::clock::SharedClock;
use crate::config::{ConfigurationError, JobEngineConfig};

use super::store::{JobPatch, SharedJobStore};
use super::types::{HandlerFailure, Job, JobResult, JobStatus, QueueName, after};

/// Processes jobs of one queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> JobResult;
}

/// Adapter for synchronous closures.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&Job) -> JobResult + Send + Sync,
{
    async fn handle(&self, job: &Job) -> JobResult {
        (self.0)(job)
    }
}

/// Wrap a closure as a shared handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(&Job) -> JobResult + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Queue → handler table, built once at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<QueueName, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `queue`. Each queue takes exactly one.
    pub fn register(
        &mut self,
        queue: QueueName,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), ConfigurationError> {
        if self.handlers.contains_key(&queue) {
            return Err(ConfigurationError::DuplicateHandler(queue));
        }
        self.handlers.insert(queue, handler);
        Ok(())
    }

    pub fn with(
        mut self,
        queue: QueueName,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self, ConfigurationError> {
        self.register(queue, handler)?;
        Ok(self)
    }

    pub fn get(&self, queue: QueueName) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(&queue)
    }

    /// Fail unless every queue has a handler.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match QueueName::ALL.into_iter().find(|q| !self.handlers.contains_key(q)) {
            Some(missing) => Err(ConfigurationError::MissingHandler(missing)),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("queues", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed,
    /// Failed with attempts left; back to `waiting` until `ready_at`
    Retrying { ready_at: DateTime<Utc>, error: String },
    /// Failed with the attempt budget spent
    Failed { error: String },
    /// The record left `active` while the handler ran; nothing was written
    Superseded,
    /// The handler finished but the store rejected the write-back
    Unrecorded { error: String },
}

/// Runs claimed jobs against their queue's handler.
///
/// Handler errors and panics are captured into `last_error`; they never
/// escape `execute`.
#[derive(Clone)]
pub struct WorkerExecutor {
    store: SharedJobStore,
    clock: SharedClock,
    handlers: HandlerRegistry,
    config: JobEngineConfig,
}

impl std::fmt::Debug for WorkerExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerExecutor")
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

impl WorkerExecutor {
    pub fn new(
        store: SharedJobStore,
        clock: SharedClock,
        handlers: HandlerRegistry,
        config: JobEngineConfig,
    ) -> Result<Self, ConfigurationError> {
        handlers.validate()?;
        Ok(Self {
            store,
            clock,
            handlers,
            config,
        })
    }

    /// Execute a job previously claimed (`active`, attempt counted).
    pub async fn execute(&self, job: Job) -> ExecutionOutcome {
        let span = info_span!(
            "job",
            queue = %job.queue,
            job_key = %job.key,
            attempt = job.attempts
        );
        self.run(job).instrument(span).await
    }

    async fn run(&self, job: Job) -> ExecutionOutcome {
        debug!("running job");

        let result = match self.handlers.get(job.queue) {
            Some(handler) => AssertUnwindSafe(handler.handle(&job))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(panic_failure(&*panic))),
            None => Err(HandlerFailure::new(format!(
                "no handler registered for queue {}",
                job.queue
            ))),
        };

        let now = self.clock.now();
        let (patch, outcome) = match result {
            Ok(()) => (JobPatch::complete(now), ExecutionOutcome::Completed),
            Err(failure) if job.has_attempts_left() => {
                let delay = self
                    .config
                    .queue(job.queue)
                    .retry
                    .delay_for_attempt(job.attempts);
                let ready_at = after(now, delay);
                (
                    JobPatch::retry(now, ready_at, failure.message()),
                    ExecutionOutcome::Retrying {
                        ready_at,
                        error: failure.to_string(),
                    },
                )
            }
            Err(failure) => (
                JobPatch::fail(now, failure.message()),
                ExecutionOutcome::Failed {
                    error: failure.to_string(),
                },
            ),
        };

        match self.store.transition(&job.key, &[JobStatus::Active], patch).await {
            Ok(_) => {
                match &outcome {
                    ExecutionOutcome::Completed => info!("job completed"),
                    ExecutionOutcome::Retrying { ready_at, error } => {
                        warn!(%error, retry_at = %ready_at, "job failed, will retry")
                    }
                    ExecutionOutcome::Failed { error } => {
                        warn!(%error, max_attempts = job.max_attempts, "job failed, retries exhausted")
                    }
                    _ => {}
                }
                outcome
            }
            Err(e) if e.is_lost_race() => {
                debug!(error = %e, "job record moved on during execution");
                ExecutionOutcome::Superseded
            }
            Err(e) => {
                error!(error = %e, "failed to record job outcome");
                ExecutionOutcome::Unrecorded {
                    error: e.to_string(),
                }
            }
        }
    }
}

fn panic_failure(panic: &(dyn Any + Send)) -> HandlerFailure {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    HandlerFailure::new(format!("handler panicked: {message}"))
}
