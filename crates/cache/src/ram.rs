//! RAM page cache with pluggable eviction
//!
//! Holds fully rendered page bitmaps keyed by page index. Entries are shared
//! as `Arc<Bitmap>` so readers never copy pixels and can never mutate what
//! the cache owns.

use crate::policy::{EntryInfo, EvictionPolicy, LruPolicy, NeighborhoodPolicy};
use folio_backend::Bitmap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use thiserror::Error;

const MB: usize = 1024 * 1024;

/// How aggressively rendered pages are retained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    /// Small budget, page cap, LRU eviction
    #[serde(alias = "memory")]
    MaximizeMemory,

    /// Large budget, no page cap, farthest-from-focus eviction
    #[default]
    #[serde(alias = "performance")]
    MaximizePerformance,
}

impl CacheStrategy {
    pub fn default_memory_limit(self) -> usize {
        match self {
            CacheStrategy::MaximizeMemory => 64 * MB,
            CacheStrategy::MaximizePerformance => 256 * MB,
        }
    }

    pub fn default_page_limit(self) -> Option<usize> {
        match self {
            CacheStrategy::MaximizeMemory => Some(8),
            CacheStrategy::MaximizePerformance => None,
        }
    }

    pub fn policy(self) -> Box<dyn EvictionPolicy> {
        match self {
            CacheStrategy::MaximizeMemory => Box::new(LruPolicy),
            CacheStrategy::MaximizePerformance => Box::new(NeighborhoodPolicy),
        }
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheStrategy::MaximizeMemory => f.write_str("memory"),
            CacheStrategy::MaximizePerformance => f.write_str("performance"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown cache strategy '{0}' (expected memory or performance)")]
pub struct ParseStrategyError(String);

impl FromStr for CacheStrategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "memory" | "maximize-memory" => Ok(CacheStrategy::MaximizeMemory),
            "performance" | "maximize-performance" => Ok(CacheStrategy::MaximizePerformance),
            _ => Err(ParseStrategyError(s.to_owned())),
        }
    }
}

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Number of pages currently in cache
    pub pages: usize,

    /// Total bytes held by cached bitmaps
    pub memory_used: usize,

    /// Byte budget
    pub memory_limit: usize,

    /// Page-count cap, if the strategy has one
    pub page_limit: Option<usize>,

    pub hits: u64,
    pub misses: u64,

    /// Pages evicted to stay within budget
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

}

struct CacheEntry {
    bitmap: Arc<Bitmap>,
    last_access: u64,
}

/// Internal cache state
struct CacheState {
    pages: HashMap<usize, CacheEntry>,

    /// Monotonic access counter
    tick: u64,

    /// Most recently accessed page
    focus: Option<usize>,

    memory_used: usize,
    memory_limit: usize,
    page_limit: Option<usize>,
    stats: CacheStats,
}

impl CacheState {
    fn new(memory_limit: usize, page_limit: Option<usize>) -> Self {
        Self {
            pages: HashMap::new(),
            tick: 0,
            focus: None,
            memory_used: 0,
            memory_limit,
            page_limit,
            stats: CacheStats {
                memory_limit,
                page_limit,
                ..Default::default()
            },
        }
    }

    fn touch(&mut self, page_index: usize) -> u64 {
        self.tick += 1;
        self.focus = Some(page_index);
        self.tick
    }

    fn take(&mut self, page_index: usize) -> Option<Arc<Bitmap>> {
        let entry = self.pages.remove(&page_index)?;
        self.memory_used = self.memory_used.saturating_sub(entry.bitmap.byte_len());
        self.sync_stats();
        Some(entry.bitmap)
    }

    fn over_budget(&self, incoming: usize) -> bool {
        let over_pages = self.page_limit.is_some_and(|limit| {
            let slots_needed = usize::from(incoming > 0);
            self.pages.len() + slots_needed > limit
        });
        over_pages || self.memory_used + incoming > self.memory_limit
    }

    /// Evict until `incoming` bytes (plus one page slot, if non-zero) fit
    fn evict_to_fit(&mut self, incoming: usize, policy: &dyn EvictionPolicy) -> Vec<Arc<Bitmap>> {
        let mut evicted = Vec::new();

        while !self.pages.is_empty() && self.over_budget(incoming) {
            let entries: Vec<EntryInfo> = self
                .pages
                .iter()
                .map(|(&page_index, entry)| EntryInfo {
                    page_index,
                    last_access: entry.last_access,
                    bytes: entry.bitmap.byte_len(),
                })
                .collect();

            let Some(victim) = policy.choose_victim(&entries, self.focus) else {
                break;
            };
            let Some(bitmap) = self.take(victim) else {
                break;
            };

            self.stats.evictions += 1;
            tracing::debug!(page = victim, policy = policy.name(), "evicted cached page");
            evicted.push(bitmap);
        }

        evicted
    }

    fn sync_stats(&mut self) {
        self.stats.pages = self.pages.len();
        self.stats.memory_used = self.memory_used;
    }
}

/// Thread-safe cache of rendered pages.
///
/// # Example
///
/// ```
/// use folio_backend::Bitmap;
/// use folio_cache::{CacheStrategy, RenderedPageCache};
/// use std::sync::Arc;
///
/// let cache = RenderedPageCache::new(CacheStrategy::MaximizeMemory);
/// cache.put(3, Arc::new(Bitmap::new(100, 130)));
///
/// let page = cache.get(3).expect("page 3 is cached");
/// assert_eq!(page.dimensions(), (100, 130));
/// assert_eq!(cache.stats().hits, 1);
/// ```
pub struct RenderedPageCache {
    state: Mutex<CacheState>,
    policy: Box<dyn EvictionPolicy>,
}

impl RenderedPageCache {
    /// Create a cache with the strategy's default budget and policy.
    pub fn new(strategy: CacheStrategy) -> Self {
        Self::with_memory_limit(strategy, strategy.default_memory_limit())
    }

    /// Create a cache with the strategy's policy and page cap but a custom byte budget.
    pub fn with_memory_limit(strategy: CacheStrategy, memory_limit: usize) -> Self {
        Self::with_policy(
            strategy.policy(),
            memory_limit,
            strategy.default_page_limit(),
        )
    }

    /// Create a cache with an explicit eviction policy.
    pub fn with_policy(
        policy: Box<dyn EvictionPolicy>,
        memory_limit: usize,
        page_limit: Option<usize>,
    ) -> Self {
        Self {
            state: Mutex::new(CacheState::new(memory_limit, page_limit)),
            policy,
        }
    }

    /// Store a rendered page.
    ///
    /// Returns every bitmap that left the cache as a result: the previous
    /// entry for `page_index`, if any, followed by evicted pages. Callers hand
    /// these back to their buffer pool.
    ///
    /// A bitmap larger than the whole budget is still stored, as the only entry.
    pub fn put(&self, page_index: usize, bitmap: Arc<Bitmap>) -> Vec<Arc<Bitmap>> {
        let mut state = self.state.lock().unwrap();
        let size = bitmap.byte_len();

        let mut released: Vec<_> = state.take(page_index).into_iter().collect();
        released.extend(state.evict_to_fit(size.max(1), self.policy.as_ref()));

        let last_access = state.touch(page_index);
        state.memory_used += size;
        let entry = CacheEntry {
            bitmap,
            last_access,
        };
        state.pages.insert(page_index, entry);
        state.sync_stats();

        released
    }

    /// Look up a page, marking it as most recently used.
    pub fn get(&self, page_index: usize) -> Option<Arc<Bitmap>> {
        self.get_matching(page_index, |_| true)
    }

    /// Look up a page that passes `accept`, marking it as most recently used.
    ///
    /// A cached page that `accept` rejects counts as a miss and keeps its
    /// place in the eviction order.
    pub fn get_matching(
        &self,
        page_index: usize,
        accept: impl FnOnce(&Bitmap) -> bool,
    ) -> Option<Arc<Bitmap>> {
        let mut state = self.state.lock().unwrap();

        let usable = state
            .pages
            .get(&page_index)
            .is_some_and(|entry| accept(&entry.bitmap));
        if !usable {
            state.stats.misses += 1;
            return None;
        }

        let tick = state.touch(page_index);
        state.stats.hits += 1;
        let entry = state.pages.get_mut(&page_index)?;
        entry.last_access = tick;
        Some(entry.bitmap.clone())
    }

    /// Look up a page without touching LRU order or stats.
    pub fn peek(&self, page_index: usize) -> Option<Arc<Bitmap>> {
        let state = self.state.lock().unwrap();
        state
            .pages
            .get(&page_index)
            .map(|entry| entry.bitmap.clone())
    }

    /// Check for a page without touching LRU order or stats.
    pub fn contains(&self, page_index: usize) -> bool {
        self.state.lock().unwrap().pages.contains_key(&page_index)
    }

    pub fn remove(&self, page_index: usize) -> Option<Arc<Bitmap>> {
        self.state.lock().unwrap().take(page_index)
    }

    /// Drop every page, returning the bitmaps so they can be recycled.
    pub fn clear(&self) -> Vec<Arc<Bitmap>> {
        let mut state = self.state.lock().unwrap();
        let drained = state.pages.drain().map(|(_, entry)| entry.bitmap).collect();
        state.memory_used = 0;
        state.focus = None;
        state.sync_stats();
        drained
    }

    pub fn stats(&self) -> CacheStats {
        self.state.lock().unwrap().stats
    }

    pub fn memory_used(&self) -> usize {
        self.state.lock().unwrap().memory_used
    }

    pub fn memory_limit(&self) -> usize {
        self.state.lock().unwrap().memory_limit
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

}

impl Default for RenderedPageCache {
    fn default() -> Self {
        Self::new(CacheStrategy::default())
    }
}
