//! Job storage: the persistent mirror of every job's lifecycle.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{Job, JobKey, JobStatus, NewJob, QueueName, QueueStats};

/// Job store abstraction.
///
/// Every status change goes through `transition`, an atomic compare-and-set on
/// the current status. Terminal records never transition.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a waiting job, or return the existing record for `job.key` unchanged.
    async fn create(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, JobStoreError>;

    /// Apply `patch` if the record's status is one of `expected`.
    async fn transition(
        &self,
        key: &JobKey,
        expected: &[JobStatus],
        patch: JobPatch,
    ) -> Result<Job, JobStoreError>;

    async fn get(&self, key: &JobKey) -> Result<Job, JobStoreError>;

    /// Newest first (ties by key). `page` is 1-based.
    async fn list(
        &self,
        filter: &JobFilter,
        page: u32,
        page_size: u32,
    ) -> Result<JobPage, JobStoreError>;

    /// Waiting jobs with `ready_at <= now`, earliest `ready_at` first.
    async fn due(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    async fn counts(&self, queue: QueueName, now: DateTime<Utc>)
    -> Result<QueueStats, JobStoreError>;

    /// Remove every record in `status`, optionally restricted to one queue.
    async fn delete_by_status(
        &self,
        queue: Option<QueueName>,
        status: JobStatus,
    ) -> Result<u64, JobStoreError>;

    /// Remove a single record. Returns whether one existed.
    async fn delete(&self, key: &JobKey) -> Result<bool, JobStoreError>;

    /// Active jobs whose last update is at or before `older_than`.
    async fn stuck_active(
        &self,
        queue: QueueName,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;
}

pub type SharedJobStore = Arc<dyn JobStore>;

/// Job store error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobKey),
    #[error("job {key} cannot transition from {from}")]
    InvalidTransition { key: JobKey, from: JobStatus },
    #[error("job {key} is not ready until {ready_at}")]
    NotReady {
        key: JobKey,
        ready_at: DateTime<Utc>,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    /// The record moved on under us (deleted, cancelled, claimed elsewhere).
    pub fn is_lost_race(&self) -> bool {
        !matches!(self, JobStoreError::Storage(_))
    }
}

/// Changes applied by a successful `transition`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPatch {
    /// Becomes `updated_at`
    pub at: DateTime<Utc>,
    pub status: JobStatus,
    pub ready_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Count a new execution; refused once the attempt budget is spent
    pub bump_attempts: bool,
    /// Precondition: only apply if `ready_at <= due_by`
    pub due_by: Option<DateTime<Utc>>,
}

impl JobPatch {
    fn to(status: JobStatus, at: DateTime<Utc>) -> Self {
        Self {
            at,
            status,
            ready_at: None,
            last_error: None,
            completed_at: None,
            bump_attempts: false,
            due_by: None,
        }
    }

    /// `Waiting -> Active`, counting the attempt. Re-checks readiness.
    pub fn claim(now: DateTime<Utc>) -> Self {
        Self {
            bump_attempts: true,
            due_by: Some(now),
            ..Self::to(JobStatus::Active, now)
        }
    }

    pub fn complete(now: DateTime<Utc>) -> Self {
        Self {
            completed_at: Some(now),
            ..Self::to(JobStatus::Completed, now)
        }
    }

    /// Back to `Waiting` after a failed attempt.
    pub fn retry(now: DateTime<Utc>, ready_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            ready_at: Some(ready_at),
            last_error: Some(error.into()),
            ..Self::to(JobStatus::Waiting, now)
        }
    }

    pub fn fail(now: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            last_error: Some(error.into()),
            completed_at: Some(now),
            ..Self::to(JobStatus::Failed, now)
        }
    }

    pub fn cancel(now: DateTime<Utc>) -> Self {
        Self {
            completed_at: Some(now),
            ..Self::to(JobStatus::Cancelled, now)
        }
    }

    /// Put an abandoned active job back in line, ready immediately.
    pub fn requeue(now: DateTime<Utc>, note: impl Into<String>) -> Self {
        Self::retry(now, now, note)
    }

    /// Check the patch against the current record without applying it.
    pub fn check(&self, job: &Job, expected: &[JobStatus]) -> Result<(), JobStoreError> {
        let invalid = || JobStoreError::InvalidTransition {
            key: job.key.clone(),
            from: job.status,
        };

        if job.status.is_terminal() || !expected.contains(&job.status) {
            return Err(invalid());
        }
        if let Some(due_by) = self.due_by {
            if job.ready_at > due_by {
                return Err(JobStoreError::NotReady {
                    key: job.key.clone(),
                    ready_at: job.ready_at,
                });
            }
        }
        if self.bump_attempts && !job.has_attempts_left() {
            return Err(invalid());
        }
        if self.status == JobStatus::Active && self.ready_at.is_some() {
            return Err(invalid());
        }
        Ok(())
    }

    /// Apply to `job` after a successful `check`.
    pub fn apply(self, job: &mut Job) {
        job.status = self.status;
        job.updated_at = self.at;
        if self.bump_attempts {
            job.attempts += 1;
        }
        if let Some(ready_at) = self.ready_at {
            job.ready_at = ready_at;
        }
        if let Some(error) = self.last_error {
            job.last_error = Some(error);
        }
        if let Some(completed_at) = self.completed_at {
            job.completed_at = Some(completed_at);
        }
    }
}

/// Listing filter; `None` fields match everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub queue: Option<QueueName>,
    pub status: Option<JobStatus>,
}

impl JobFilter {
    pub fn queue(queue: QueueName) -> Self {
        Self {
            queue: Some(queue),
            status: None,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.queue.is_none_or(|q| q == job.queue) && self.status.is_none_or(|s| s == job.status)
    }
}

/// One page of a job listing plus the unpaginated total.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: u64,
}

pub(crate) fn page_offset(page: u32, page_size: u32) -> usize {
    page.saturating_sub(1) as usize * page_size as usize
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobKey, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<JobKey, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<JobKey, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut jobs = self.write()?;
        let record = jobs
            .entry(job.key.clone())
            .or_insert_with(|| Job::from_submission(job, now));
        Ok(record.clone())
    }

    async fn transition(
        &self,
        key: &JobKey,
        expected: &[JobStatus],
        patch: JobPatch,
    ) -> Result<Job, JobStoreError> {
        let mut jobs = self.write()?;
        let job = jobs
            .get_mut(key)
            .ok_or_else(|| JobStoreError::NotFound(key.clone()))?;
        patch.check(job, expected)?;
        patch.apply(job);
        Ok(job.clone())
    }

    async fn get(&self, key: &JobKey) -> Result<Job, JobStoreError> {
        self.read()?
            .get(key)
            .cloned()
            .ok_or_else(|| JobStoreError::NotFound(key.clone()))
    }

    async fn list(
        &self,
        filter: &JobFilter,
        page: u32,
        page_size: u32,
    ) -> Result<JobPage, JobStoreError> {
        let jobs = self.read()?;
        let mut matching: Vec<&Job> = jobs.values().filter(|j| filter.matches(j)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.key.cmp(&b.key)));

        let total = matching.len() as u64;
        let jobs = matching
            .into_iter()
            .skip(page_offset(page, page_size))
            .take(page_size as usize)
            .cloned()
            .collect();

        Ok(JobPage { jobs, total })
    }

    async fn due(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        let mut ready: Vec<&Job> = jobs
            .values()
            .filter(|j| j.queue == queue && j.is_due(now))
            .collect();
        ready.sort_by(|a, b| a.ready_at.cmp(&b.ready_at).then_with(|| a.key.cmp(&b.key)));

        Ok(ready.into_iter().take(limit).cloned().collect())
    }

    async fn counts(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<QueueStats, JobStoreError> {
        let jobs = self.read()?;
        let mut stats = QueueStats::default();
        for job in jobs.values().filter(|j| j.queue == queue) {
            stats.record(job, now);
        }
        Ok(stats)
    }

    async fn delete_by_status(
        &self,
        queue: Option<QueueName>,
        status: JobStatus,
    ) -> Result<u64, JobStoreError> {
        let filter = JobFilter {
            queue,
            status: Some(status),
        };
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|_, job| !filter.matches(job));
        Ok((before - jobs.len()) as u64)
    }

    async fn delete(&self, key: &JobKey) -> Result<bool, JobStoreError> {
        Ok(self.write()?.remove(key).is_some())
    }

    async fn stuck_active(
        &self,
        queue: QueueName,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        Ok(jobs
            .values()
            .filter(|j| {
                j.queue == queue && j.status == JobStatus::Active && j.updated_at <= older_than
            })
            .cloned()
            .collect())
    }
}
