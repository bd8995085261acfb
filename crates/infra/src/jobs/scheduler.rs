//! Dispatch loop: finds due jobs, claims them, and hands them to the executor.
//!
//! Each queue gets a lane with its own concurrency ceiling (a semaphore) and
//! wake-up signal. A job is dispatched only by the caller whose claim
//! (`waiting -> active`) succeeds in the store, so concurrent ticks, or several
//! processes sharing one Postgres store, never run the same attempt twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::clock::SharedClock;
use crate::config::JobEngineConfig;

use super::executor::WorkerExecutor;
use super::store::{JobPatch, JobStoreError, SharedJobStore};
use super::types::{Job, JobStatus, NewJob, QueueName};

#[derive(Debug)]
struct Lane {
    concurrency: usize,
    permits: Arc<Semaphore>,
    wake: Arc<Notify>,
}

struct SchedulerInner {
    store: SharedJobStore,
    clock: SharedClock,
    executor: WorkerExecutor,
    lanes: HashMap<QueueName, Lane>,
    poll_interval: Duration,
}

/// Job scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("lanes", &self.inner.lanes)
            .field("poll_interval", &self.inner.poll_interval)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        store: SharedJobStore,
        clock: SharedClock,
        executor: WorkerExecutor,
        config: &JobEngineConfig,
    ) -> Self {
        let lanes = QueueName::ALL
            .into_iter()
            .map(|queue| {
                let concurrency = config.queue(queue).concurrency.max(1);
                let lane = Lane {
                    concurrency,
                    permits: Arc::new(Semaphore::new(concurrency)),
                    wake: Arc::new(Notify::new()),
                };
                (queue, lane)
            })
            .collect();

        Self {
            inner: Arc::new(SchedulerInner {
                store,
                clock,
                executor,
                lanes,
                poll_interval: config.poll_interval,
            }),
        }
    }

    fn lane(&self, queue: QueueName) -> &Lane {
        // Lanes are built for every queue in `new`.
        &self.inner.lanes[&queue]
    }

    /// Create the job (idempotent on key) and wake its lane if it is ready now.
    pub async fn submit(&self, job: NewJob) -> Result<Job, JobStoreError> {
        let now = self.inner.clock.now();
        let job = self.inner.store.create(job, now).await?;
        if job.is_due(now) {
            self.lane(job.queue).wake.notify_one();
        }
        Ok(job)
    }

    /// Wake a lane so it scans before its next poll.
    pub fn wake(&self, queue: QueueName) {
        self.lane(queue).wake.notify_one();
    }

    /// One dispatch pass over `queue`. Returns how many jobs were dispatched.
    pub async fn tick(&self, queue: QueueName) -> Result<usize, JobStoreError> {
        let lane = self.lane(queue);
        let available = lane.permits.available_permits();
        if available == 0 {
            return Ok(0);
        }

        let due = self
            .inner
            .store
            .due(queue, self.inner.clock.now(), available)
            .await?;

        let mut dispatched = 0;
        for job in due {
            let Ok(permit) = lane.permits.clone().try_acquire_owned() else {
                break;
            };

            let claim = JobPatch::claim(self.inner.clock.now());
            let claimed = match self
                .inner
                .store
                .transition(&job.key, &[JobStatus::Waiting], claim)
                .await
            {
                Ok(claimed) => claimed,
                Err(e) if e.is_lost_race() => {
                    debug!(queue = %queue, job_key = %job.key, error = %e, "claim lost");
                    continue;
                }
                Err(e) => return Err(e),
            };

            debug!(
                queue = %queue,
                job_key = %claimed.key,
                attempt = claimed.attempts,
                "job claimed"
            );

            let executor = self.inner.executor.clone();
            let wake = lane.wake.clone();
            tokio::spawn(async move {
                executor.execute(claimed).await;
                drop(permit);
                wake.notify_one();
            });
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Wait until nothing is in flight on `queue`.
    pub async fn wait_idle(&self, queue: QueueName) {
        let lane = self.lane(queue);
        // Holding every permit means no execution is running.
        let _all = lane.permits.acquire_many(lane.concurrency as u32).await;
    }

    /// Spawn one dispatch loop per queue.
    pub fn start(&self) -> SchedulerHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let loops = QueueName::ALL
            .into_iter()
            .map(|queue| {
                let scheduler = self.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move { scheduler.run_lane(queue, shutdown_rx).await })
            })
            .collect();

        info!(poll_interval_ms = self.inner.poll_interval.as_millis() as u64, "scheduler started");

        SchedulerHandle {
            shutdown,
            loops,
            scheduler: self.clone(),
        }
    }

    async fn run_lane(&self, queue: QueueName, mut shutdown: watch::Receiver<bool>) {
        let lane = self.lane(queue);
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick(queue).await {
                Ok(0) => {}
                Ok(n) => debug!(queue = %queue, dispatched = n, "dispatched jobs"),
                Err(e) => error!(queue = %queue, error = %e, "dispatch scan failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.inner.poll_interval) => {}
                _ = lane.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(queue = %queue, "dispatch loop stopped");
    }
}

/// Handle to control running dispatch loops.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
    scheduler: Scheduler,
}

impl SchedulerHandle {
    /// Stop scanning, then wait for in-flight executions to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.loops {
            let _ = handle.await;
        }
        for queue in QueueName::ALL {
            self.scheduler.wait_idle(queue).await;
        }
        info!("scheduler stopped");
    }
}
