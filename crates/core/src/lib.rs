//! Folio core library
//!
//! The render engine: one open document, a bounded set of page handles
//! behind a single render lock, rendered pages cached in memory, background
//! decoding with last-request-wins de-duplication and prefetch of the pages
//! around the reader.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod handles;

pub use config::EngineConfig;
pub use dispatch::{CallbackContext, ConsumerLoop, ImmediateContext, QueuedContext, Task};
pub use engine::{DimensionsCallback, PageResult, RenderCallback, RenderEngine, TargetSize};
pub use error::{ConfigError, EngineError, RenderError};
pub use handles::{HandleMode, HandleStats, PageHandleCache, ParseHandleModeError};

pub use folio_backend::{Bitmap, DocumentBackend, LopdfBackend, OpenSource, PageSize};
pub use folio_cache::{CacheStats, CacheStrategy, PoolStats};
pub use folio_scheduler::{MetricsSnapshot, ScrollDirection};
