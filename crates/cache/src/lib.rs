//! Folio cache library
//!
//! In-memory storage for rendered pages: a pixel-buffer pool that recycles
//! bitmaps by dimension, and a page cache with pluggable eviction.

pub mod policy;
pub mod pool;
pub mod ram;

pub use policy::{EntryInfo, EvictionPolicy, LruPolicy, NeighborhoodPolicy};
pub use pool::{BitmapPool, PoolStats};
pub use ram::{CacheStats, CacheStrategy, ParseStrategyError, RenderedPageCache};
