//! Prefetch planning around the reader's position

use std::collections::BTreeSet;

/// Pages prefetched on each side of the current page by default
pub const DEFAULT_PREFETCH_DISTANCE: usize = 2;

/// Direction the reader is moving through the document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum ScrollDirection {
    /// Towards higher page indices
    Forward,

    /// Towards lower page indices
    Backward,

    /// Unknown or stationary; prefetch both sides
    #[default]
    None,
}

/// Turns scroll deltas into a [`ScrollDirection`].
///
/// A zero delta keeps the previous direction.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScrollTracker {
    direction: ScrollDirection,
}

impl ScrollTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a vertical scroll delta and return the resulting direction.
    pub fn note(&mut self, dy: f64) -> ScrollDirection {
        if dy > 0.0 {
            self.direction = ScrollDirection::Forward;
        } else if dy < 0.0 {
            self.direction = ScrollDirection::Backward;
        }
        self.direction
    }

    pub fn direction(&self) -> ScrollDirection {
        self.direction
    }
}

/// Chooses which neighbouring pages to render ahead of time.
///
/// # Example
///
/// ```
/// use folio_scheduler::{PrefetchPlanner, ScrollDirection};
///
/// let planner = PrefetchPlanner::new(2);
/// let plan = planner.plan_around(5, ScrollDirection::None, 10, |_| false);
/// assert_eq!(plan.into_iter().collect::<Vec<_>>(), vec![3, 4, 6, 7]);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct PrefetchPlanner {
    distance: usize,
}

impl PrefetchPlanner {
    /// Planner looking `distance` pages ahead; zero disables prefetch.
    pub fn new(distance: usize) -> Self {
        Self { distance }
    }

    pub fn distance(&self) -> usize {
        self.distance
    }

    /// Pages worth prefetching around `current`.
    ///
    /// Out-of-range and already cached pages are left out.
    pub fn plan_around<F>(
        &self,
        current: usize,
        direction: ScrollDirection,
        page_count: usize,
        is_cached: F,
    ) -> BTreeSet<usize>
    where
        F: Fn(usize) -> bool,
    {
        if self.distance == 0 || page_count == 0 {
            return BTreeSet::new();
        }

        // Both windows end inside the document.
        let last = page_count - 1;
        let behind = match direction {
            ScrollDirection::Forward => 0..0,
            _ => current.saturating_sub(self.distance)..current.min(page_count),
        };
        let ahead = match direction {
            ScrollDirection::Backward => 1..=0,
            _ => current.saturating_add(1)..=current.saturating_add(self.distance).min(last),
        };

        behind
            .chain(ahead)
            .filter(|&page| page != current)
            .filter(|&page| !is_cached(page))
            .collect()
    }
}

impl Default for PrefetchPlanner {
    fn default() -> Self {
        Self::new(DEFAULT_PREFETCH_DISTANCE)
    }
}
