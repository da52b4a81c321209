//! Render timing metrics
//!
//! Additive counters owned by one engine: pages rendered, total decode time
//! and the slowest page seen so far.

use std::sync::Mutex;
use std::time::Duration;

/// Point-in-time copy of the render counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub pages_rendered: u64,
    pub total_time: Duration,

    /// Page with the longest single render, if any page was rendered
    pub slowest_page: Option<usize>,
    pub slowest_time: Duration,
}

impl MetricsSnapshot {
    /// Mean render time, zero before the first render.
    pub fn average(&self) -> Duration {
        match u32::try_from(self.pages_rendered) {
            Ok(0) => Duration::ZERO,
            Ok(count) => self.total_time / count,
            Err(_) => {
                Duration::from_secs_f64(self.total_time.as_secs_f64() / self.pages_rendered as f64)
            }
        }
    }
}

/// Thread-safe accumulator of successful render timings.
///
/// # Example
///
/// ```
/// use folio_scheduler::MetricsAggregator;
/// use std::time::Duration;
///
/// let metrics = MetricsAggregator::new();
/// metrics.record(0, Duration::from_millis(40));
/// metrics.record(1, Duration::from_millis(120));
///
/// let snapshot = metrics.snapshot();
/// assert_eq!(snapshot.pages_rendered, 2);
/// assert_eq!(snapshot.slowest_page, Some(1));
/// assert_eq!(snapshot.average(), Duration::from_millis(80));
/// ```
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    inner: Mutex<MetricsSnapshot>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one successful render of `page_index` that took `elapsed`.
    pub fn record(&self, page_index: usize, elapsed: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.pages_rendered += 1;
        inner.total_time += elapsed;

        if inner.slowest_page.is_none() || elapsed > inner.slowest_time {
            inner.slowest_page = Some(page_index);
            inner.slowest_time = elapsed;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        *self.inner.lock().unwrap()
    }
}
