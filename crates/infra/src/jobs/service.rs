//! Queue facade: the operations callers (HTTP, lifecycle hooks) use.

use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::{error, info, warn};

use crate::clock::SharedClock;
use crate::config::{ConfigurationError, JobEngineConfig};

use super::cancel::{CancelOutcome, CancellationController};
use super::executor::{HandlerRegistry, WorkerExecutor};
use super::scheduler::{Scheduler, SchedulerHandle};
use super::stats::StatsAggregator;
use super::store::{JobFilter, JobPage, JobPatch, JobStoreError, SharedJobStore};
use super::types::{Job, JobKey, JobStatus, NewJob, QueueName, QueueStats};

pub const MAX_PAGE_SIZE: u32 = 100;

/// Queue facade error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// The job queue: scheduling, cancellation, listing and stats over one store.
#[derive(Clone)]
pub struct JobQueue {
    store: SharedJobStore,
    clock: SharedClock,
    scheduler: Scheduler,
    cancellation: CancellationController,
    stats: StatsAggregator,
    config: JobEngineConfig,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("scheduler", &self.scheduler)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    /// Wire the engine. Fails if any queue lacks a handler.
    pub fn new(
        store: SharedJobStore,
        clock: SharedClock,
        handlers: HandlerRegistry,
        config: JobEngineConfig,
    ) -> Result<Self, ConfigurationError> {
        let executor = WorkerExecutor::new(store.clone(), clock.clone(), handlers, config.clone())?;
        let scheduler = Scheduler::new(store.clone(), clock.clone(), executor, &config);

        Ok(Self {
            cancellation: CancellationController::new(
                store.clone(),
                clock.clone(),
                config.retain_cancelled,
            ),
            stats: StatsAggregator::new(store.clone(), clock.clone()),
            store,
            clock,
            scheduler,
            config,
        })
    }

    pub fn config(&self) -> &JobEngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Schedule a job. Idempotent on `key`: resubmitting returns the existing record.
    pub async fn submit_job(
        &self,
        queue: QueueName,
        key: JobKey,
        payload: serde_json::Value,
        delay: Duration,
        max_attempts: u32,
    ) -> Result<Job, QueueError> {
        if max_attempts == 0 {
            return Err(QueueError::InvalidRequest(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        let job = NewJob::new(queue, key, payload)
            .delayed(delay)
            .with_max_attempts(max_attempts);
        Ok(self.scheduler.submit(job).await?)
    }

    /// Schedule a job with its queue's configured attempt budget.
    pub async fn submit_with_policy(
        &self,
        queue: QueueName,
        key: JobKey,
        payload: serde_json::Value,
        delay: Duration,
    ) -> Result<Job, QueueError> {
        let max_attempts = self.config.queue(queue).retry.max_attempts;
        self.submit_job(queue, key, payload, delay, max_attempts).await
    }

    /// Prevent a waiting job from running. Missing or started jobs are not errors.
    pub async fn cancel_job(&self, key: &JobKey) -> Result<CancelOutcome, QueueError> {
        Ok(self.cancellation.cancel(key).await?)
    }

    /// Newest first. `page` is 1-based; `page_size` is 1..=100.
    pub async fn list_jobs(
        &self,
        filter: JobFilter,
        page: u32,
        page_size: u32,
    ) -> Result<JobPage, QueueError> {
        if page < 1 {
            return Err(QueueError::InvalidRequest(
                "page must not be less than 1".to_string(),
            ));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(QueueError::InvalidRequest(format!(
                "pageSize must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        Ok(self.store.list(&filter, page, page_size).await?)
    }

    /// Delete completed, failed and cancelled records. Returns how many went.
    pub async fn clear_terminal_jobs(&self, queue: Option<QueueName>) -> Result<u64, QueueError> {
        let mut removed = 0;
        for status in JobStatus::TERMINAL {
            removed += self.store.delete_by_status(queue, status).await?;
        }
        info!(queue = ?queue, removed, "cleared terminal jobs");
        Ok(removed)
    }

    pub async fn stats(&self, queue: QueueName) -> Result<QueueStats, QueueError> {
        Ok(self.stats.stats(queue).await?)
    }

    /// Stats by queue name. Unknown names are a configuration error.
    pub async fn get_stats(&self, queue_name: &str) -> Result<QueueStats, QueueError> {
        let queue: QueueName = queue_name.parse()?;
        self.stats(queue).await
    }

    /// Return jobs left `active` past the configured timeout to the queue.
    ///
    /// Jobs with no attempts left are failed instead. Does nothing unless
    /// `stuck_active_timeout` is set.
    pub async fn recover_stuck(&self, queue: QueueName) -> Result<usize, QueueError> {
        let Some(timeout) = self.config.stuck_active_timeout else {
            return Ok(0);
        };
        let now = self.clock.now();
        let cutoff = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| now.checked_sub_signed(t))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        let mut recovered = 0;
        for job in self.store.stuck_active(queue, cutoff).await? {
            let patch = if job.has_attempts_left() {
                JobPatch::requeue(now, "recovered after exceeding active timeout")
            } else {
                JobPatch::fail(now, "abandoned while active")
            };
            match self
                .store
                .transition(&job.key, &[JobStatus::Active], patch)
                .await
            {
                Ok(updated) => {
                    warn!(
                        queue = %queue,
                        job_key = %updated.key,
                        status = %updated.status,
                        "recovered stuck job"
                    );
                    recovered += 1;
                }
                Err(e) if e.is_lost_race() => {}
                Err(e) => return Err(e.into()),
            }
        }

        if recovered > 0 {
            self.scheduler.wake(queue);
        }
        Ok(recovered)
    }

    /// Start the dispatch loops, plus the recovery sweep when configured.
    pub fn start(&self) -> QueueWorkers {
        let scheduler = self.scheduler.start();
        let sweep = self.config.stuck_active_timeout.map(|timeout| {
            let queue = self.clone();
            let every = (timeout / 2).max(Duration::from_secs(1));
            let task = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                loop {
                    ticker.tick().await;
                    for name in QueueName::ALL {
                        if let Err(e) = queue.recover_stuck(name).await {
                            error!(queue = %name, error = %e, "recovery sweep failed");
                        }
                    }
                }
            });
            task.abort_handle()
        });

        QueueWorkers { scheduler, sweep }
    }
}

/// Running background tasks of a `JobQueue`.
#[derive(Debug)]
pub struct QueueWorkers {
    scheduler: SchedulerHandle,
    sweep: Option<AbortHandle>,
}

impl QueueWorkers {
    /// Stop the sweep and the dispatch loops, waiting for in-flight jobs.
    pub async fn shutdown(self) {
        if let Some(sweep) = self.sweep {
            sweep.abort();
        }
        self.scheduler.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::jobs::executor::handler_fn;
    use crate::jobs::store::{InMemoryJobStore, JobStore};

    fn queue_with(config: JobEngineConfig) -> (JobQueue, std::sync::Arc<InMemoryJobStore>, std::sync::Arc<ManualClock>) {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::arc(Utc::now());
        let handlers = HandlerRegistry::new()
            .with(QueueName::Notify, handler_fn(|_| Ok(())))
            .unwrap()
            .with(QueueName::Sla, handler_fn(|_| Ok(())))
            .unwrap();
        let queue = JobQueue::new(store.clone(), clock.clone(), handlers, config).unwrap();
        (queue, store, clock)
    }

    #[tokio::test]
    async fn missing_handler_is_a_configuration_error() {
        let handlers = HandlerRegistry::new()
            .with(QueueName::Notify, handler_fn(|_| Ok(())))
            .unwrap();
        let err = JobQueue::new(
            InMemoryJobStore::arc(),
            ManualClock::arc(Utc::now()),
            handlers,
            JobEngineConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err, ConfigurationError::MissingHandler(QueueName::Sla));
    }

    #[tokio::test]
    async fn unknown_queue_name_is_rejected() {
        let (queue, _, _) = queue_with(JobEngineConfig::default());

        assert!(queue.get_stats("sla").await.is_ok());
        assert!(matches!(
            queue.get_stats("email").await,
            Err(QueueError::Configuration(ConfigurationError::UnknownQueue(_)))
        ));
    }

    #[tokio::test]
    async fn list_validates_paging() {
        let (queue, _, _) = queue_with(JobEngineConfig::default());

        assert!(queue.list_jobs(JobFilter::default(), 0, 10).await.is_err());
        assert!(queue.list_jobs(JobFilter::default(), 1, 0).await.is_err());
        assert!(queue.list_jobs(JobFilter::default(), 1, 101).await.is_err());
        assert!(queue.list_jobs(JobFilter::default(), 1, 100).await.is_ok());
    }

    #[tokio::test]
    async fn clear_removes_only_terminal_records() {
        let (queue, store, clock) = queue_with(JobEngineConfig {
            retain_cancelled: true,
            ..Default::default()
        });

        for key in ["notify:done", "notify:cancelled", "notify:waiting"] {
            queue
                .submit_job(
                    QueueName::Notify,
                    JobKey::new(key),
                    serde_json::json!({}),
                    Duration::from_secs(60),
                    1,
                )
                .await
                .unwrap();
        }
        queue.cancel_job(&JobKey::new("notify:cancelled")).await.unwrap();
        clock.advance(Duration::from_secs(60));
        let done = JobKey::new("notify:done");
        store
            .transition(&done, &[JobStatus::Waiting], JobPatch::claim(clock.now()))
            .await
            .unwrap();
        store
            .transition(&done, &[JobStatus::Active], JobPatch::complete(clock.now()))
            .await
            .unwrap();

        assert_eq!(queue.clear_terminal_jobs(None).await.unwrap(), 2);
        let remaining = queue.list_jobs(JobFilter::default(), 1, 10).await.unwrap();
        assert_eq!(remaining.total, 1);
        assert_eq!(remaining.jobs[0].key.as_str(), "notify:waiting");
    }

    #[tokio::test]
    async fn stuck_jobs_are_recovered_only_when_enabled() {
        let (disabled, _, _) = queue_with(JobEngineConfig::default());
        assert_eq!(disabled.recover_stuck(QueueName::Notify).await.unwrap(), 0);

        let (queue, store, clock) = queue_with(JobEngineConfig {
            stuck_active_timeout: Some(Duration::from_secs(300)),
            ..Default::default()
        });
        for (key, attempts) in [("notify:retry", 3), ("notify:last", 1)] {
            let key = JobKey::new(key);
            queue
                .submit_job(QueueName::Notify, key.clone(), serde_json::json!({}), Duration::ZERO, attempts)
                .await
                .unwrap();
            store
                .transition(&key, &[JobStatus::Waiting], JobPatch::claim(clock.now()))
                .await
                .unwrap();
        }

        assert_eq!(queue.recover_stuck(QueueName::Notify).await.unwrap(), 0);
        clock.advance(Duration::from_secs(301));
        assert_eq!(queue.recover_stuck(QueueName::Notify).await.unwrap(), 2);

        let retried = store.get(&JobKey::new("notify:retry")).await.unwrap();
        assert_eq!(retried.status, JobStatus::Waiting);
        assert_eq!(retried.attempts, 1);
        let failed = store.get(&JobKey::new("notify:last")).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("abandoned while active"));
    }
}
