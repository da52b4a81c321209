//! Folio scheduler library
//!
//! Job scheduling for page rendering: a two-level priority queue
//! (foreground requests ahead of silent prefetch), cancellation tokens,
//! a worker pool, the priority-aware render lock, prefetch planning and
//! render metrics.
//!
//! # Example
//!
//! ```
//! use folio_scheduler::{JobKind, JobPriority, JobScheduler};
//!
//! let scheduler = JobScheduler::new();
//!
//! let (prefetch_id, _) = scheduler.submit(JobPriority::Prefetch, JobKind::render(6, 0, 800));
//! let (visible_id, _) = scheduler.submit(JobPriority::Foreground, JobKind::render(5, 0, 800));
//!
//! // Foreground work always comes out first.
//! let job = scheduler.next_job().unwrap();
//! assert_eq!(job.id, visible_id);
//! scheduler.complete_job(job.id);
//!
//! // Navigating away drops the pending prefetch.
//! assert!(scheduler.cancel_job(prefetch_id));
//! ```

mod cancel;
mod lock;
mod metrics;
mod prefetch;
mod priority;
mod scheduler;
mod worker;

pub use cancel::{CancellationRegistry, CancellationToken};
pub use lock::{PriorityLock, PriorityLockGuard};
pub use metrics::{MetricsAggregator, MetricsSnapshot};
pub use prefetch::{PrefetchPlanner, ScrollDirection, ScrollTracker};
pub use priority::{Job, JobId, JobKind, JobPriority, PriorityQueue};
pub use scheduler::{JobScheduler, SchedulerStats};
pub use worker::{panic_message, JobExecutor, WorkerPool, WorkerPoolConfig};
