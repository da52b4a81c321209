//! Job scheduler
//!
//! Ties the priority queue to the cancellation registry: every submitted job
//! gets a token, and cancelling a job both flips its token and pulls it out of
//! the queue if no worker has picked it up yet.

use crate::cancel::{CancellationRegistry, CancellationToken};
use crate::priority::{Job, JobId, JobKind, JobPriority, PriorityQueue};
use std::sync::Mutex;
use std::time::Duration;

/// Job scheduler statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,

    /// Jobs removed from the queue before a worker ran them
    pub jobs_cancelled: u64,

    /// Prefetch jobs promoted to foreground priority
    pub jobs_promoted: u64,

    pub queue_size: usize,
}

impl SchedulerStats {
    /// Jobs submitted but neither completed nor cancelled
    pub fn pending_jobs(&self) -> u64 {
        self.jobs_submitted - self.jobs_completed - self.jobs_cancelled
    }
}

/// Thread-safe scheduler handing jobs to workers in priority order.
///
/// # Example
///
/// ```
/// use folio_scheduler::{JobKind, JobPriority, JobScheduler};
///
/// let scheduler = JobScheduler::new();
/// let kind = JobKind::Dimensions { page_index: 0 };
/// let (job_id, token) = scheduler.submit(JobPriority::Foreground, kind);
///
/// if let Some(job) = scheduler.next_job() {
///     assert_eq!(job.id, job_id);
///     assert!(!token.is_cancelled());
///     scheduler.complete_job(job.id);
/// }
/// ```
pub struct JobScheduler {
    queue: PriorityQueue,
    stats: Mutex<SchedulerStats>,
    cancellation: CancellationRegistry,
}

impl JobScheduler {
    pub fn new() -> Self {
        Self {
            queue: PriorityQueue::new(),
            stats: Mutex::new(SchedulerStats::default()),
            cancellation: CancellationRegistry::new(),
        }
    }

    /// Queue a job and return its ID and cancellation token.
    ///
    /// The token is registered before the job becomes visible to workers.
    pub fn submit(&self, priority: JobPriority, kind: JobKind) -> (JobId, CancellationToken) {
        let job_id = self.queue.allocate_id();
        let token = self.cancellation.register(job_id);
        self.queue.insert(job_id, priority, kind);

        self.stats.lock().unwrap().jobs_submitted += 1;
        tracing::trace!(job_id, ?priority, ?kind, "job submitted");

        (job_id, token)
    }

    /// Take the highest priority job without waiting.
    ///
    /// Its token stays registered until [`complete_job`](Self::complete_job).
    pub fn next_job(&self) -> Option<Job> {
        self.queue.pop()
    }

    /// Take the highest priority job, waiting up to `timeout` for one.
    pub fn wait_next_job(&self, timeout: Duration) -> Option<Job> {
        self.queue.pop_timeout(timeout)
    }

    /// Mark a job a worker picked up as finished, whatever its outcome.
    pub fn complete_job(&self, job_id: JobId) {
        self.stats.lock().unwrap().jobs_completed += 1;
        self.cancellation.unregister(job_id);
    }

    /// Cancel a queued or running job.
    ///
    /// A queued job is removed outright; a running job only has its token
    /// cancelled. Returns `true` if the job was known.
    pub fn cancel_job(&self, job_id: JobId) -> bool {
        let token_cancelled = self.cancellation.cancel(job_id);
        let removed = self.queue.remove_if(|job| job.id == job_id);

        if removed.is_empty() {
            return token_cancelled;
        }

        self.stats.lock().unwrap().jobs_cancelled += removed.len() as u64;
        self.cancellation.unregister(job_id);
        true
    }

    /// Raise a queued job to foreground priority.
    ///
    /// Returns `false` if the job already left the queue (a worker holds it).
    pub fn promote(&self, job_id: JobId) -> bool {
        let promoted = self.queue.reprioritize(job_id, JobPriority::Foreground);
        if promoted {
            self.stats.lock().unwrap().jobs_promoted += 1;
        }
        promoted
    }

    pub fn pending_jobs(&self) -> usize {
        self.queue.len()
    }

    pub fn has_pending_jobs(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Cancel every job, queued or running, and empty the queue.
    pub fn clear(&self) {
        self.cancellation.cancel_all();
        let dropped = self.queue.remove_if(|_| true);

        if !dropped.is_empty() {
            self.stats.lock().unwrap().jobs_cancelled += dropped.len() as u64;
            for job in &dropped {
                self.cancellation.unregister(job.id);
            }
        }

        self.queue.wake_all();
    }

    /// Wake workers blocked waiting for a job (used on shutdown).
    pub fn wake_workers(&self) {
        self.queue.wake_all();
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = *self.stats.lock().unwrap();
        stats.queue_size = self.queue.len();
        stats
    }

    /// Token of a job that has not completed yet.
    pub fn get_cancellation_token(&self, job_id: JobId) -> Option<CancellationToken> {
        self.cancellation.get(job_id)
    }
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}
