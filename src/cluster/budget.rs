use crate::error::{LagError, Result, with_timeout};
use crate::kafka::{ClusterClient, OffsetTracker};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Limits on broker work against one cluster during a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallLimits {
    pub timeout: Duration,
    pub max_calls: usize,
    pub max_trackers: usize,
}

impl CallLimits {
    pub fn new(timeout: Duration, max_calls: usize, max_trackers: usize) -> Self {
        Self {
            timeout,
            max_calls: max_calls.max(1),
            max_trackers: max_trackers.max(1),
        }
    }
}

/// Broker call slots shared by every group task of one cluster.
///
/// A call first waits for a slot and only then starts its timeout, so a
/// call queued behind a busy cluster is not failed for time it spent
/// waiting. Offset trackers get their own slots, held for as long as the
/// tracker is open.
#[derive(Debug, Clone)]
pub struct CallBudget {
    calls: Arc<Semaphore>,
    trackers: Arc<Semaphore>,
    timeout: Duration,
}

impl CallBudget {
    pub fn new(limits: CallLimits) -> Self {
        Self {
            calls: Arc::new(Semaphore::new(limits.max_calls)),
            trackers: Arc::new(Semaphore::new(limits.max_trackers)),
            timeout: limits.timeout,
        }
    }

    /// Run one broker call once a slot is free, bounded by the call timeout.
    pub async fn call<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _slot = self.calls.acquire().await.map_err(closed)?;
        with_timeout(self.timeout, what, fut).await
    }

    /// Open `group_id`'s offset tracker once a tracker slot is free.
    pub async fn open_tracker(
        &self,
        client: &dyn ClusterClient,
        group_id: &str,
    ) -> Result<TrackerLease> {
        let slot = Arc::clone(&self.trackers)
            .acquire_owned()
            .await
            .map_err(closed)?;
        let tracker = self
            .call("open offset tracker", client.open_offset_tracker(group_id))
            .await?;

        Ok(TrackerLease {
            tracker,
            _slot: slot,
        })
    }
}

fn closed(_: AcquireError) -> LagError {
    LagError::Task("broker call budget closed".to_string())
}

/// An open offset tracker together with the slot it occupies. Dropping the
/// lease releases the tracker, then the slot.
pub struct TrackerLease {
    tracker: Box<dyn OffsetTracker>,
    _slot: OwnedSemaphorePermit,
}

impl TrackerLease {
    pub fn tracker(&self) -> &dyn OffsetTracker {
        self.tracker.as_ref()
    }
}
