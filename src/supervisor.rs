use std::future::Future;
use std::time::Duration;

use tokio_util::task::TaskTracker;

use crate::error::ShutdownError;

/// Tracks deferred bookkeeping tasks so the process can drain them
/// before exiting. The hot path only ever adds tasks; shutdown closes
/// the tracker and waits, bounded by a deadline.
#[derive(Clone, Default)]
pub struct Supervisor {
    tracker: TaskTracker,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a bookkeeping task on a fresh, unbounded context. The
    /// caller's cancellation must not reach the future passed here.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(future);
    }

    /// Outstanding bookkeeping tasks.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Waits for all tracked tasks, bounded by `deadline`. Records still
    /// in flight when the deadline elapses are lost; that is the
    /// documented worst case.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ShutdownError> {
        self.tracker.close();
        tokio::time::timeout(deadline, self.tracker.wait())
            .await
            .map_err(|_| ShutdownError::DeadlineExceeded {
                remaining: self.tracker.len(),
            })
    }
}
