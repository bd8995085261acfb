//! Per-queue status counts.

use crate::clock::SharedClock;

use super::store::{JobStoreError, SharedJobStore};
use super::types::{QueueName, QueueStats};

#[derive(Clone)]
pub struct StatsAggregator {
    store: SharedJobStore,
    clock: SharedClock,
}

impl StatsAggregator {
    pub fn new(store: SharedJobStore, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Counts for `queue` as of now. The fields partition the queue's records.
    pub async fn stats(&self, queue: QueueName) -> Result<QueueStats, JobStoreError> {
        self.store.counts(queue, self.clock.now()).await
    }
}
