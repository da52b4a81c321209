//! Delivery of completion callbacks
//!
//! Render results are produced on worker threads, but callers usually want
//! them on a thread they own (a UI loop, a test body). A [`CallbackContext`]
//! decides where a finished task runs.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

/// Unit of work posted to a [`CallbackContext`]
pub type Task = Box<dyn FnOnce() + Send>;

/// Where completion callbacks execute.
pub trait CallbackContext: Send + Sync + 'static {
    /// Schedule `task` to run exactly once.
    fn post(&self, task: Task);
}

/// Runs every task inline on the posting thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateContext;

impl CallbackContext for ImmediateContext {
    fn post(&self, task: Task) {
        task();
    }
}

/// Queues tasks for a [`ConsumerLoop`] to run on its own thread.
#[derive(Clone)]
pub struct QueuedContext {
    sender: Sender<Task>,
}

impl QueuedContext {
    /// Create a context and the loop that drains it.
    pub fn new() -> (Self, ConsumerLoop) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self { sender }, ConsumerLoop { receiver })
    }
}

impl CallbackContext for QueuedContext {
    fn post(&self, task: Task) {
        if self.sender.send(task).is_err() {
            tracing::trace!("consumer loop dropped, discarding callback");
        }
    }
}

/// Receiving end of a [`QueuedContext`].
pub struct ConsumerLoop {
    receiver: Receiver<Task>,
}

impl ConsumerLoop {
    /// Run every task queued so far without blocking.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.receiver.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Run tasks as they arrive until `deadline`.
    pub fn run_until(&self, deadline: Instant) -> usize {
        let mut ran = 0;
        loop {
            let timeout = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(timeout) {
                Ok(task) => {
                    task();
                    ran += 1;
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return ran,
            }
        }
    }

    /// Run tasks until `condition` holds or `timeout` passes.
    ///
    /// Returns whether the condition was met.
    pub fn wait_for<F>(&self, timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_pending();
            if condition() {
                return true;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            // Wake at least every 10ms to re-check conditions not tied to a task.
            let tick = remaining.min(Duration::from_millis(10));
            match self.receiver.recv_timeout(tick) {
                Ok(task) => task(),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return condition(),
            }
        }
    }
}
