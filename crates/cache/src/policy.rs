//! Eviction policies for [`RenderedPageCache`](crate::RenderedPageCache)

/// What a policy sees of one cached page when choosing a victim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub page_index: usize,

    /// Access tick of the last `get`/`put`; larger is more recent
    pub last_access: u64,

    /// Size of the cached bitmap in bytes
    pub bytes: usize,
}

/// Chooses which cached page to drop when the cache is over budget.
pub trait EvictionPolicy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Pick the page to evict from `entries`.
    ///
    /// `focus` is the most recently accessed page, if any. Returning `None`
    /// stops eviction.
    fn choose_victim(&self, entries: &[EntryInfo], focus: Option<usize>) -> Option<usize>;
}

/// Least recently used first.
#[derive(Debug, Clone, Copy, Default)]
pub struct LruPolicy;

impl EvictionPolicy for LruPolicy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn choose_victim(&self, entries: &[EntryInfo], _focus: Option<usize>) -> Option<usize> {
        entries
            .iter()
            .min_by_key(|entry| entry.last_access)
            .map(|entry| entry.page_index)
    }
}

/// Farthest page from the focus first, ties broken by LRU.
///
/// Keeps the pages around the reader's position warm while scrolling.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeighborhoodPolicy;

impl EvictionPolicy for NeighborhoodPolicy {
    fn name(&self) -> &'static str {
        "neighborhood"
    }

    fn choose_victim(&self, entries: &[EntryInfo], focus: Option<usize>) -> Option<usize> {
        let Some(focus) = focus else {
            return LruPolicy.choose_victim(entries, None);
        };

        entries
            .iter()
            .max_by(|a, b| {
                a.page_index
                    .abs_diff(focus)
                    .cmp(&b.page_index.abs_diff(focus))
                    .then(b.last_access.cmp(&a.last_access))
            })
            .map(|entry| entry.page_index)
    }
}
