//! Cancellation tokens for render jobs
//!
//! A job is cancelled cooperatively: the worker checks its token before each
//! acquisition step (render lock, page handle, pixel buffer) and bails out
//! once it is set.

use crate::JobId;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

/// Cancellation token for cooperative job cancellation
///
/// Clones share the same flag.
///
/// # Example
///
/// ```
/// use folio_scheduler::CancellationToken;
///
/// let token = CancellationToken::new();
/// let worker_token = token.clone();
///
/// token.cancel();
/// assert!(worker_token.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token in the non-cancelled state.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel this token and every clone of it. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Tokens of every job that has been submitted and not yet completed.
///
/// # Example
///
/// ```
/// use folio_scheduler::CancellationRegistry;
///
/// let registry = CancellationRegistry::new();
/// let token = registry.register(1);
///
/// registry.cancel(1);
/// assert!(token.is_cancelled());
/// ```
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<JobId, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Create and store a token for `job_id`, returning a clone for the worker.
    pub fn register(&self, job_id: JobId) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().unwrap().insert(job_id, token.clone());
        token
    }

    /// Cancel one job. Returns `false` if the job is unknown.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let tokens = self.tokens.lock().unwrap();
        match tokens.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every registered job, returning how many there were.
    pub fn cancel_all(&self) -> usize {
        let tokens = self.tokens.lock().unwrap();
        tokens.values().for_each(CancellationToken::cancel);
        tokens.len()
    }

    /// Forget a job once it completed or left the queue.
    pub fn unregister(&self, job_id: JobId) -> bool {
        self.tokens.lock().unwrap().remove(&job_id).is_some()
    }

    pub fn get(&self, job_id: JobId) -> Option<CancellationToken> {
        self.tokens.lock().unwrap().get(&job_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().unwrap().is_empty()
    }

    /// Drop every token without cancelling it.
    pub fn clear(&self) {
        self.tokens.lock().unwrap().clear();
    }
}

impl Default for CancellationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_token_starts_live() {
        assert!(!CancellationToken::new().is_cancelled());
    }

    #[test]
    fn test_cancel_is_shared_and_idempotent() {
        let token = CancellationToken::new();
        let clone = token.clone();

        token.cancel();
        token.cancel();

        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_cancel_visible_across_threads() {
        let token = CancellationToken::new();
        let worker = token.clone();

        let handle = thread::spawn(move || {
            while !worker.is_cancelled() {
                thread::yield_now();
            }
        });

        token.cancel();
        handle.join().unwrap();
    }

    #[test]
    fn test_registry_register_and_cancel() {
        let registry = CancellationRegistry::new();
        let token = registry.register(7);

        assert_eq!(registry.len(), 1);
        assert!(registry.cancel(7));
        assert!(token.is_cancelled());
        assert!(!registry.cancel(8));
    }

    #[test]
    fn test_registry_cancel_all() {
        let registry = CancellationRegistry::new();
        let tokens: Vec<_> = (1..=3).map(|id| registry.register(id)).collect();

        assert_eq!(registry.cancel_all(), 3);
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }

    #[test]
    fn test_registry_unregister_and_clear() {
        let registry = CancellationRegistry::new();
        let token = registry.register(1);
        registry.register(2);

        assert!(registry.unregister(1));
        assert!(!registry.unregister(1));
        assert!(registry.get(1).is_none());
        assert!(registry.get(2).is_some());

        registry.clear();
        assert!(registry.is_empty());
        assert!(!token.is_cancelled());
    }
}
