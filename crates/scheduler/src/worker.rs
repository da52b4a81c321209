//! Render worker pool
//!
//! Worker threads pull jobs from a [`JobScheduler`], skip jobs whose token was
//! cancelled while queued, run the rest through a shared executor and mark
//! them complete.

use crate::{CancellationToken, Job, JobScheduler};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Callback run by a worker for each job it takes.
///
/// Long-running executors should check `token.is_cancelled()` between steps.
pub type JobExecutor = Arc<dyn Fn(&Job, &CancellationToken) + Send + Sync>;

/// Configuration for the worker pool
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads (default: available parallelism)
    pub num_workers: usize,

    /// How long an idle worker waits for a job before re-checking shutdown
    pub poll_interval: Duration,

    /// Thread name prefix; workers are named `{prefix}-{id}`
    pub thread_name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::new(default_worker_count())
    }
}

impl WorkerPoolConfig {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            poll_interval: Duration::from_millis(100),
            thread_name: "folio-render-worker".to_owned(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

}

/// Pool of worker threads executing scheduler jobs.
///
/// # Example
///
/// ```
/// use folio_scheduler::{
///     CancellationToken, Job, JobKind, JobPriority, JobScheduler, WorkerPool, WorkerPoolConfig,
/// };
/// use std::sync::mpsc;
/// use std::sync::{Arc, Mutex};
/// use std::time::Duration;
///
/// let scheduler = Arc::new(JobScheduler::new());
/// let (tx, rx) = mpsc::channel();
/// let tx = Mutex::new(tx);
///
/// let executor = Arc::new(move |job: &Job, _token: &CancellationToken| {
///     tx.lock().unwrap().send(job.kind.page_index()).unwrap();
/// });
///
/// let config = WorkerPoolConfig::new(2);
/// let mut pool = WorkerPool::new(scheduler.clone(), executor, config).unwrap();
/// scheduler.submit(JobPriority::Foreground, JobKind::render(3, 0, 100));
///
/// assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(3));
/// pool.shutdown();
/// ```
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    scheduler: Arc<JobScheduler>,
}

impl WorkerPool {
    /// Spawn the worker threads.
    ///
    /// Fails only if the OS refuses to spawn a thread; workers spawned before
    /// the failure are stopped again.
    pub fn new(
        scheduler: Arc<JobScheduler>,
        executor: JobExecutor,
        config: WorkerPoolConfig,
    ) -> io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut pool = Self {
            workers: Vec::with_capacity(config.num_workers),
            shutdown: shutdown.clone(),
            scheduler: scheduler.clone(),
        };

        for id in 0..config.num_workers.max(1) {
            let scheduler = scheduler.clone();
            let executor = executor.clone();
            let shutdown = shutdown.clone();
            let poll_interval = config.poll_interval;

            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, id))
                .spawn(move || {
                    run_worker(scheduler, executor, shutdown, poll_interval);
                })?;
            pool.workers.push(handle);
        }

        tracing::debug!(workers = pool.workers.len(), "worker pool started");
        Ok(pool)
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop all workers and wait for them to finish their current job.
    ///
    /// When called from one of the pool's own workers, that worker is
    /// detached instead of joined; it exits once the executor returns.
    /// Calling this again is a no-op.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.scheduler.wake_workers();

        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("render worker panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    scheduler: Arc<JobScheduler>,
    executor: JobExecutor,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    while !shutdown.load(Ordering::Acquire) {
        let Some(job) = scheduler.wait_next_job(poll_interval) else {
            continue;
        };

        let token = scheduler.get_cancellation_token(job.id).unwrap_or_default();
        if token.is_cancelled() {
            tracing::trace!(job_id = job.id, "skipping cancelled job");
        } else {
            let run = panic::catch_unwind(AssertUnwindSafe(|| executor(&job, &token)));
            if let Err(payload) = run {
                tracing::error!(
                    job_id = job.id,
                    page = job.kind.page_index(),
                    reason = panic_message(payload.as_ref()),
                    "render job panicked"
                );
            }
        }

        scheduler.complete_job(job.id);
    }
}

/// Text of a panic payload raised with a string message.
pub fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Number of logical CPUs, used as the default worker count.
pub(crate) fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobKind, JobPriority};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert!(config.num_workers > 0);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.thread_name, "folio-render-worker");
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(4)
            .with_poll_interval(Duration::from_millis(50));
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_worker_pool_creation() {
        let scheduler = Arc::new(JobScheduler::new());
        let executor = Arc::new(|_job: &Job, _token: &CancellationToken| {});

        let mut pool = WorkerPool::new(scheduler, executor, WorkerPoolConfig::new(2)).unwrap();
        assert_eq!(pool.num_workers(), 2);
        assert!(!pool.is_shutting_down());

        pool.shutdown();
        assert!(pool.is_shutting_down());
        assert_eq!(pool.num_workers(), 0);
    }

    #[test]
    fn test_worker_pool_executes_jobs() {
        let scheduler = Arc::new(JobScheduler::new());
        let executed = Arc::new(AtomicUsize::new(0));
        let counter = executed.clone();

        let executor = Arc::new(move |_job: &Job, _token: &CancellationToken| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut pool =
            WorkerPool::new(scheduler.clone(), executor, WorkerPoolConfig::new(2)).unwrap();

        for page in 0..5 {
            scheduler.submit(JobPriority::Foreground, JobKind::render(page, 0, 100));
        }

        assert!(wait_until(TIMEOUT, || executed.load(Ordering::SeqCst) == 5));
        pool.shutdown();
        assert_eq!(scheduler.stats().jobs_completed, 5);
    }

    #[test]
    fn test_worker_names() {
        let scheduler = Arc::new(JobScheduler::new());
        let names = Arc::new(Mutex::new(Vec::new()));
        let sink = names.clone();

        let executor = Arc::new(move |_job: &Job, _token: &CancellationToken| {
            let name = thread::current().name().unwrap_or_default().to_owned();
            sink.lock().unwrap().push(name);
        });
        let mut pool =
            WorkerPool::new(scheduler.clone(), executor, WorkerPoolConfig::new(1)).unwrap();
        scheduler.submit(JobPriority::Foreground, JobKind::render(0, 0, 10));

        assert!(wait_until(TIMEOUT, || !names.lock().unwrap().is_empty()));
        pool.shutdown();
        assert_eq!(names.lock().unwrap()[0], "folio-render-worker-0");
    }

    #[test]
    fn test_worker_pool_skips_cancelled_jobs() {
        let scheduler = Arc::new(JobScheduler::new());
        let started = Arc::new(AtomicUsize::new(0));
        let counter = started.clone();
        let gate = Arc::new(AtomicBool::new(false));
        let gate_worker = gate.clone();

        let executor = Arc::new(move |_job: &Job, _token: &CancellationToken| {
            counter.fetch_add(1, Ordering::SeqCst);
            while !gate_worker.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        });
        let mut pool =
            WorkerPool::new(scheduler.clone(), executor, WorkerPoolConfig::new(1)).unwrap();

        scheduler.submit(JobPriority::Foreground, JobKind::render(0, 0, 10));
        assert!(wait_until(TIMEOUT, || started.load(Ordering::SeqCst) == 1));

        let (queued, token) =
            scheduler.submit(JobPriority::Foreground, JobKind::render(1, 0, 10));
        scheduler.cancel_job(queued);
        gate.store(true, Ordering::SeqCst);

        thread::sleep(Duration::from_millis(50));
        pool.shutdown();

        assert!(token.is_cancelled());
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let scheduler = Arc::new(JobScheduler::new());
        let finished = Arc::new(Mutex::new(Vec::new()));
        let sink = finished.clone();

        let executor = Arc::new(move |job: &Job, _token: &CancellationToken| {
            if job.kind.page_index() == 0 {
                panic!("decoder blew up");
            }
            sink.lock().unwrap().push(job.kind.page_index());
        });
        let mut pool =
            WorkerPool::new(scheduler.clone(), executor, WorkerPoolConfig::new(1)).unwrap();

        scheduler.submit(JobPriority::Foreground, JobKind::render(0, 0, 10));
        scheduler.submit(JobPriority::Foreground, JobKind::render(1, 0, 10));

        assert!(wait_until(TIMEOUT, || !finished.lock().unwrap().is_empty()));
        assert!(wait_until(TIMEOUT, || scheduler.stats().jobs_completed == 2));
        pool.shutdown();
        assert_eq!(*finished.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_panic_message() {
        let text = panic::catch_unwind(|| panic!("static text")).unwrap_err();
        assert_eq!(panic_message(text.as_ref()), "static text");

        let page = 3;
        let formatted = panic::catch_unwind(|| panic!("page {page}")).unwrap_err();
        assert_eq!(panic_message(formatted.as_ref()), "page 3");
    }

    #[test]
    fn test_worker_pool_priority_ordering() {
        let scheduler = Arc::new(JobScheduler::new());
        scheduler.submit(JobPriority::Prefetch, JobKind::render(7, 0, 10));
        scheduler.submit(JobPriority::Prefetch, JobKind::render(8, 0, 10));
        scheduler.submit(JobPriority::Foreground, JobKind::render(5, 0, 10));

        let order = Arc::new(Mutex::new(Vec::new()));
        let sink = order.clone();
        let executor = Arc::new(move |job: &Job, _token: &CancellationToken| {
            sink.lock().unwrap().push(job.kind.page_index());
        });
        let mut pool =
            WorkerPool::new(scheduler.clone(), executor, WorkerPoolConfig::new(1)).unwrap();

        assert!(wait_until(TIMEOUT, || order.lock().unwrap().len() == 3));
        pool.shutdown();
        assert_eq!(*order.lock().unwrap(), vec![5, 7, 8]);
    }

    #[test]
    fn test_shutdown_from_worker_thread_does_not_deadlock() {
        let scheduler = Arc::new(JobScheduler::new());
        let pool_slot: Arc<Mutex<Option<WorkerPool>>> = Arc::new(Mutex::new(None));
        let slot = pool_slot.clone();
        let done = Arc::new(AtomicBool::new(false));
        let done_flag = done.clone();

        let executor = Arc::new(move |_job: &Job, _token: &CancellationToken| {
            if let Some(mut pool) = slot.lock().unwrap().take() {
                pool.shutdown();
            }
            done_flag.store(true, Ordering::SeqCst);
        });

        let pool = WorkerPool::new(scheduler.clone(), executor, WorkerPoolConfig::new(2)).unwrap();
        *pool_slot.lock().unwrap() = Some(pool);
        scheduler.submit(JobPriority::Foreground, JobKind::render(0, 0, 10));

        assert!(wait_until(TIMEOUT, || done.load(Ordering::SeqCst)));
    }
}
