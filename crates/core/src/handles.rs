//! Page handle cache
//!
//! Opening a page handle is expensive, so recently used handles stay open.
//! The cache lives inside the render-lock guarded document state; every
//! method takes the backend by `&mut` and therefore runs serialized with
//! rendering.

use folio_backend::{BackendError, DocumentBackend};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How many page handles may be open at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandleMode {
    /// Up to the configured capacity
    #[default]
    Bounded,

    /// Degraded mode: at most one handle; every acquisition closes the others
    #[serde(alias = "single")]
    SingleHandle,
}

impl fmt::Display for HandleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleMode::Bounded => f.write_str("bounded"),
            HandleMode::SingleHandle => f.write_str("single-handle"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown handle mode '{0}' (expected bounded or single-handle)")]
pub struct ParseHandleModeError(String);

impl FromStr for HandleMode {
    type Err = ParseHandleModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "bounded" => Ok(HandleMode::Bounded),
            "single" | "single-handle" => Ok(HandleMode::SingleHandle),
            _ => Err(ParseHandleModeError(s.to_owned())),
        }
    }
}

/// Handle lifecycle counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleStats {
    pub opened: u64,
    pub closed: u64,

    /// Handles closed to make room (a subset of `closed`)
    pub evicted: u64,

    pub open_failures: u64,
}

/// Open page handles keyed by page index.
///
/// At most one handle per index is open at any time.
pub struct PageHandleCache<P> {
    handles: BTreeMap<usize, P>,
    capacity: usize,
    mode: HandleMode,
    stats: HandleStats,
}

impl<P> PageHandleCache<P> {
    /// Create a cache holding up to `capacity` handles (at least one).
    pub fn new(capacity: usize, mode: HandleMode) -> Self {
        Self {
            handles: BTreeMap::new(),
            capacity: capacity.max(1),
            mode,
            stats: HandleStats::default(),
        }
    }

    /// Return the open handle for `index`, opening it if needed.
    ///
    /// In bounded mode a newly opened handle may push out the numerically
    /// smallest other index; the requested handle is never the one evicted.
    /// In single-handle mode every other handle is closed first.
    pub fn acquire<B>(&mut self, backend: &mut B, index: usize) -> Result<&mut P, BackendError>
    where
        B: DocumentBackend<Page = P>,
    {
        if self.mode == HandleMode::SingleHandle {
            self.close_all_except(backend, index);
        }

        let page = match self.handles.remove(&index) {
            Some(page) => page,
            None => {
                let page = backend
                    .open_page(index)
                    .inspect_err(|_| self.stats.open_failures += 1)?;
                self.stats.opened += 1;
                tracing::trace!(page = index, "opened page handle");

                while self.handles.len() >= self.effective_capacity() {
                    if self.evict_oldest(backend).is_none() {
                        break;
                    }
                }
                page
            }
        };

        Ok(self.handles.entry(index).or_insert(page))
    }

    /// Close and drop the handle with the smallest index.
    pub fn evict_oldest<B>(&mut self, backend: &mut B) -> Option<usize>
    where
        B: DocumentBackend<Page = P>,
    {
        let (index, page) = self.handles.pop_first()?;
        self.close_handle(backend, index, page);
        self.stats.evicted += 1;
        tracing::debug!(page = index, "evicted page handle");
        Some(index)
    }

    /// Close every open handle. Close failures are logged, not returned.
    pub fn close_all<B>(&mut self, backend: &mut B)
    where
        B: DocumentBackend<Page = P>,
    {
        while let Some((index, page)) = self.handles.pop_first() {
            self.close_handle(backend, index, page);
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.handles.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Open handle indices in ascending order.
    pub fn resident_indices(&self) -> Vec<usize> {
        self.handles.keys().copied().collect()
    }

    pub fn mode(&self) -> HandleMode {
        self.mode
    }

    pub fn stats(&self) -> HandleStats {
        self.stats
    }

    fn effective_capacity(&self) -> usize {
        match self.mode {
            HandleMode::Bounded => self.capacity,
            HandleMode::SingleHandle => 1,
        }
    }

    fn close_all_except<B>(&mut self, backend: &mut B, keep: usize)
    where
        B: DocumentBackend<Page = P>,
    {
        let others: Vec<usize> = self
            .handles
            .keys()
            .copied()
            .filter(|&index| index != keep)
            .collect();
        for index in others {
            if let Some(page) = self.handles.remove(&index) {
                self.close_handle(backend, index, page);
            }
        }
    }

    fn close_handle<B>(&mut self, backend: &mut B, index: usize, page: P)
    where
        B: DocumentBackend<Page = P>,
    {
        self.stats.closed += 1;
        if let Err(err) = backend.close_page(page) {
            tracing::warn!(page = index, error = %err, "failed to close page handle");
        }
    }
}
