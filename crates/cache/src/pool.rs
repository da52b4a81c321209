//! Bitmap pool
//!
//! Reuses pixel buffers of identical dimensions instead of allocating a fresh
//! buffer for every rendered page. Buffers are either pooled (free) or checked
//! out; `outstanding` in [`PoolStats`] counts the latter and is how leaks are
//! detected.

use folio_backend::Bitmap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Buffers kept per (width, height) slot by default.
pub const DEFAULT_SLOT_CAPACITY: usize = 4;

/// Counters describing pool usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers allocated because no pooled buffer matched
    pub allocated: u64,

    /// Acquisitions served from the pool
    pub reused: u64,

    /// Buffers handed back to a slot
    pub released: u64,

    /// Buffers that left the pool for good (slot full, or still shared on recycle)
    pub dropped: u64,

    /// Buffers currently sitting in slots
    pub pooled: usize,

    /// Buffers currently checked out
    pub outstanding: usize,
}

struct PoolState {
    slots: HashMap<(u32, u32), Vec<Bitmap>>,
    stats: PoolStats,
}

impl PoolState {
    fn check_in(&mut self, bitmap: Bitmap, max_per_size: usize) {
        self.stats.outstanding = self.stats.outstanding.saturating_sub(1);

        let slot = self.slots.entry(bitmap.dimensions()).or_default();
        if slot.len() < max_per_size {
            slot.push(bitmap);
            self.stats.released += 1;
            self.stats.pooled += 1;
        } else {
            self.stats.dropped += 1;
        }
    }
}

/// Thread-safe pool of reusable bitmaps keyed by dimensions.
///
/// # Example
///
/// ```
/// use folio_cache::BitmapPool;
///
/// let pool = BitmapPool::new();
/// let bitmap = pool.acquire(200, 300);
/// assert_eq!(bitmap.dimensions(), (200, 300));
///
/// pool.release(bitmap);
/// let again = pool.acquire(200, 300);
/// assert_eq!(pool.stats().reused, 1);
/// # pool.release(again);
/// ```
pub struct BitmapPool {
    state: Mutex<PoolState>,
    max_per_size: usize,
}

impl BitmapPool {
    pub fn new() -> Self {
        Self::with_slot_capacity(DEFAULT_SLOT_CAPACITY)
    }

    /// Create a pool that keeps at most `max_per_size` free buffers per dimension.
    pub fn with_slot_capacity(max_per_size: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                slots: HashMap::new(),
                stats: PoolStats::default(),
            }),
            max_per_size,
        }
    }

    /// Check out a `width` x `height` bitmap.
    ///
    /// A pooled buffer keeps whatever pixels it last held; callers are expected
    /// to overwrite it completely. Fresh buffers are zeroed.
    pub fn acquire(&self, width: u32, height: u32) -> Bitmap {
        let mut state = self.state.lock().unwrap();
        state.stats.outstanding += 1;

        if let Some(bitmap) = state.slots.get_mut(&(width, height)).and_then(Vec::pop) {
            state.stats.reused += 1;
            state.stats.pooled -= 1;
            return bitmap;
        }

        state.stats.allocated += 1;
        drop(state);

        Bitmap::new(width, height)
    }

    /// Return a checked-out bitmap for reuse.
    pub fn release(&self, bitmap: Bitmap) {
        let mut state = self.state.lock().unwrap();
        state.check_in(bitmap, self.max_per_size);
    }

    /// Return a bitmap that was shared through an `Arc`.
    ///
    /// If nobody else holds a reference the buffer goes back to its slot and
    /// `true` is returned. Otherwise the remaining holders own it from now on
    /// and it is only dropped from the pool's accounting.
    pub fn recycle(&self, bitmap: Arc<Bitmap>) -> bool {
        match Arc::try_unwrap(bitmap) {
            Ok(bitmap) => {
                self.release(bitmap);
                true
            }
            Err(_shared) => {
                let mut state = self.state.lock().unwrap();
                state.stats.outstanding = state.stats.outstanding.saturating_sub(1);
                state.stats.dropped += 1;
                false
            }
        }
    }

    /// Drop every pooled buffer.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.slots.clear();
        state.stats.pooled = 0;
    }

    pub fn stats(&self) -> PoolStats {
        self.state.lock().unwrap().stats
    }

    /// Free buffers currently pooled for one dimension.
    pub fn pooled_for(&self, width: u32, height: u32) -> usize {
        let state = self.state.lock().unwrap();
        state.slots.get(&(width, height)).map_or(0, Vec::len)
    }
}

impl Default for BitmapPool {
    fn default() -> Self {
        Self::new()
    }
}
