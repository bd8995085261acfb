//! Cancellation of jobs that have not started.

use tracing::{debug, info};

use crate::clock::SharedClock;

use super::store::{JobPatch, JobStoreError, SharedJobStore};
use super::types::{JobKey, JobStatus};

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was waiting and will never run
    Cancelled,
    /// No record under that key
    NotFound,
    /// Already claimed or finished; execution is left alone
    AlreadyStarted,
}

/// Cancels waiting jobs.
///
/// Cancelling races with dispatch only through the store's compare-and-set,
/// so a job is either cancelled before its claim or runs to completion.
#[derive(Clone)]
pub struct CancellationController {
    store: SharedJobStore,
    clock: SharedClock,
    retain_cancelled: bool,
}

impl std::fmt::Debug for CancellationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationController")
            .field("retain_cancelled", &self.retain_cancelled)
            .finish_non_exhaustive()
    }
}

impl CancellationController {
    pub fn new(store: SharedJobStore, clock: SharedClock, retain_cancelled: bool) -> Self {
        Self {
            store,
            clock,
            retain_cancelled,
        }
    }

    pub async fn cancel(&self, key: &JobKey) -> Result<CancelOutcome, JobStoreError> {
        let patch = JobPatch::cancel(self.clock.now());
        match self.store.transition(key, &[JobStatus::Waiting], patch).await {
            Ok(_) => {}
            Err(JobStoreError::NotFound(_)) => {
                debug!(job_key = %key, "cancel: no such job");
                return Ok(CancelOutcome::NotFound);
            }
            Err(JobStoreError::InvalidTransition { from, .. }) => {
                debug!(job_key = %key, status = %from, "cancel: job already started");
                return Ok(CancelOutcome::AlreadyStarted);
            }
            Err(e) => return Err(e),
        }

        if !self.retain_cancelled {
            self.store.delete(key).await?;
        }
        info!(job_key = %key, retained = self.retain_cancelled, "job cancelled");
        Ok(CancelOutcome::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::jobs::store::{InMemoryJobStore, JobStore};
    use crate::jobs::types::{NewJob, QueueName};

    async fn waiting(store: &InMemoryJobStore, key: &str) -> JobKey {
        let key = JobKey::new(key);
        store
            .create(
                NewJob::new(QueueName::Sla, key.clone(), serde_json::json!({}))
                    .delayed(std::time::Duration::from_secs(900)),
                Utc::now(),
            )
            .await
            .unwrap();
        key
    }

    #[tokio::test]
    async fn cancelling_waiting_job_removes_it() {
        let store = InMemoryJobStore::arc();
        let controller =
            CancellationController::new(store.clone(), ManualClock::arc(Utc::now()), false);
        let key = waiting(&store, "sla:1").await;

        assert_eq!(controller.cancel(&key).await.unwrap(), CancelOutcome::Cancelled);
        assert!(matches!(store.get(&key).await, Err(JobStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn retained_cancellations_keep_the_record() {
        let store = InMemoryJobStore::arc();
        let controller =
            CancellationController::new(store.clone(), ManualClock::arc(Utc::now()), true);
        let key = waiting(&store, "sla:1").await;

        controller.cancel(&key).await.unwrap();
        let job = store.get(&key).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn missing_and_started_jobs_are_benign() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::arc(Utc::now());
        let controller = CancellationController::new(store.clone(), clock.clone(), false);

        assert_eq!(
            controller.cancel(&JobKey::new("sla:missing")).await.unwrap(),
            CancelOutcome::NotFound
        );

        let key = JobKey::new("notify:1");
        store
            .create(
                NewJob::new(QueueName::Notify, key.clone(), serde_json::json!({})),
                clock.now(),
            )
            .await
            .unwrap();
        store
            .transition(&key, &[JobStatus::Waiting], JobPatch::claim(clock.now()))
            .await
            .unwrap();

        assert_eq!(
            controller.cancel(&key).await.unwrap(),
            CancelOutcome::AlreadyStarted
        );
        assert_eq!(store.get(&key).await.unwrap().status, JobStatus::Active);
    }
}
