//! Priority queue of render jobs
//!
//! Jobs are popped in priority order, FIFO within a priority level. Workers
//! block on [`PriorityQueue::pop_timeout`] instead of sleeping between polls.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Job priority levels
///
/// Higher values are popped first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobPriority {
    /// Silent speculative render of a neighbouring page
    Prefetch = 0,

    /// A consumer is waiting on the result
    Foreground = 1,
}

impl JobPriority {
    pub fn is_foreground(self) -> bool {
        self == JobPriority::Foreground
    }
}

/// Unique job identifier
pub type JobId = u64;

/// Work a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Decode a page into a `width` x `height` target (width may be
    /// recomputed from the page aspect ratio)
    Render {
        page_index: usize,
        width: u32,
        height: u32,
    },

    /// Read a page's size in points
    Dimensions { page_index: usize },
}

impl JobKind {
    pub fn render(page_index: usize, width: u32, height: u32) -> Self {
        JobKind::Render {
            page_index,
            width,
            height,
        }
    }

    pub fn page_index(&self) -> usize {
        match *self {
            JobKind::Render { page_index, .. } | JobKind::Dimensions { page_index } => page_index,
        }
    }
}

/// A queued job
///
/// Ordered by priority, then by insertion order (earlier first).
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub priority: JobPriority,
    pub kind: JobKind,
    insertion_order: u64,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max heap, so earlier insertions must compare greater.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.insertion_order.cmp(&self.insertion_order))
    }
}

struct QueueState {
    heap: BinaryHeap<Job>,
    next_job_id: JobId,
    insertion_counter: u64,
}

impl QueueState {
    fn next_insertion(&mut self) -> u64 {
        let order = self.insertion_counter;
        self.insertion_counter += 1;
        order
    }
}

/// Thread-safe job queue ordered by priority and insertion order.
pub struct PriorityQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_job_id: 1,
                insertion_counter: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Reserve an ID for a job that will be [`insert`](Self::insert)ed later.
    pub fn allocate_id(&self) -> JobId {
        let mut state = self.state.lock().unwrap();
        let id = state.next_job_id;
        state.next_job_id += 1;
        id
    }

    /// Queue a job under an ID obtained from [`allocate_id`](Self::allocate_id).
    pub fn insert(&self, id: JobId, priority: JobPriority, kind: JobKind) {
        let mut state = self.state.lock().unwrap();
        let insertion_order = state.next_insertion();
        state.heap.push(Job {
            id,
            priority,
            kind,
            insertion_order,
        });
        drop(state);

        self.available.notify_one();
    }

    pub fn pop(&self) -> Option<Job> {
        self.state.lock().unwrap().heap.pop()
    }

    /// Pop the next job, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Job> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();

        loop {
            if let Some(job) = state.heap.pop() {
                return Some(job);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }

            state = self.available.wait_timeout(state, remaining).unwrap().0;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().heap.is_empty()
    }

    /// Remove all jobs matching a predicate, returning them.
    pub fn remove_if<F>(&self, predicate: F) -> Vec<Job>
    where
        F: Fn(&Job) -> bool,
    {
        let mut state = self.state.lock().unwrap();
        let (removed, kept): (Vec<Job>, Vec<Job>) = std::mem::take(&mut state.heap)
            .into_iter()
            .partition(|job| predicate(job));
        state.heap = kept.into_iter().collect();
        removed
    }

    /// Move a queued job to a new priority.
    ///
    /// The job is treated as newly inserted at its new level. Returns `false`
    /// if the job is no longer queued.
    pub fn reprioritize(&self, job_id: JobId, priority: JobPriority) -> bool {
        let mut state = self.state.lock().unwrap();
        let mut jobs = std::mem::take(&mut state.heap).into_vec();

        let found = match jobs.iter().position(|job| job.id == job_id) {
            Some(position) => {
                let insertion_order = state.next_insertion();
                let job = &mut jobs[position];
                job.priority = priority;
                job.insertion_order = insertion_order;
                true
            }
            None => false,
        };

        state.heap = jobs.into();
        found
    }

    /// Wake every thread blocked in [`pop_timeout`](Self::pop_timeout).
    pub fn wake_all(&self) {
        self.available.notify_all();
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}
