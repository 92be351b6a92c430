//! Cancellable fire-once timers
//!
//! A [`ScheduledTask`] sleeps on the tokio clock and then posts an event to
//! the broker loop. Each task carries a [`TaskId`]; the owner remembers the id
//! of the task it is waiting for and ignores expiries carrying any other id.
//! That makes cancellation race-free: aborting stops tasks that have not
//! fired, and an expiry that was already queued is recognised as stale.

use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Identity of one scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Pending timer. Dropping it cancels it.
#[derive(Debug)]
pub struct ScheduledTask {
    id: TaskId,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Id to compare against when the expiry event arrives
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// True if `id` belongs to this task
    pub fn is(&self, id: TaskId) -> bool {
        self.id == id
    }

    /// Cancel if not yet fired; no effect otherwise
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Issues timers that deliver their expiry as an event of type `E`
#[derive(Debug)]
pub struct Scheduler<E> {
    tx: mpsc::UnboundedSender<E>,
    next_id: u64,
}

impl<E: Send + 'static> Scheduler<E> {
    /// Create a scheduler posting into `tx`
    pub fn new(tx: mpsc::UnboundedSender<E>) -> Self {
        Self { tx, next_id: 0 }
    }

    /// Post `make(id)` after `delay`
    pub fn schedule<F>(&mut self, delay: Duration, make: F) -> ScheduledTask
    where
        F: FnOnce(TaskId) -> E + Send + 'static,
    {
        self.next_id += 1;
        let id = TaskId(self.next_id);
        let tx = self.tx.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the loop has stopped
            let _ = tx.send(make(id));
        });

        ScheduledTask { id, handle }
    }
}
