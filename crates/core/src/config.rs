//! Engine configuration
//!
//! An [`EngineConfig`] can be built programmatically, read from `FOLIO_*`
//! environment variables or loaded from a TOML file. Sizes are stored in
//! bytes and durations as [`Duration`]; the file and environment use
//! megabytes and milliseconds.

use crate::error::ConfigError;
use crate::handles::HandleMode;
use folio_cache::CacheStrategy;
use folio_scheduler::WorkerPoolConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const MB: usize = 1024 * 1024;

/// Tunables for a [`RenderEngine`](crate::RenderEngine).
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Pages prefetched on each side of the current page; 0 disables prefetch
    pub prefetch_distance: usize,

    pub cache_strategy: CacheStrategy,

    /// Log per-render timings and slow renders
    pub debug_metrics: bool,

    /// Byte budget for rendered pages; `None` uses the strategy default
    pub cache_memory_limit: Option<usize>,

    /// Page handles kept open in bounded mode
    pub handle_capacity: usize,

    pub handle_mode: HandleMode,

    pub worker_threads: usize,

    /// How long an idle worker waits for a job before re-checking shutdown
    pub poll_interval: Duration,

    /// Prefetch around every page rendered for a consumer
    pub auto_prefetch: bool,

    /// Renders slower than this are logged at `warn` when `debug_metrics` is on
    pub slow_render_threshold: Duration,

    /// Free buffers kept per bitmap size
    pub pool_slot_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prefetch_distance: 2,
            cache_strategy: CacheStrategy::default(),
            debug_metrics: false,
            cache_memory_limit: None,
            handle_capacity: 5,
            handle_mode: HandleMode::Bounded,
            worker_threads: WorkerPoolConfig::default().num_workers,
            poll_interval: Duration::from_millis(100),
            auto_prefetch: true,
            slow_render_threshold: Duration::from_millis(500),
            pool_slot_capacity: 4,
        }
    }
}

/// On-disk representation; every key is optional.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    prefetch_distance: Option<usize>,
    cache_strategy: Option<CacheStrategy>,
    debug_metrics: Option<bool>,
    cache_memory_mb: Option<usize>,
    handle_capacity: Option<usize>,
    handle_mode: Option<HandleMode>,
    worker_threads: Option<usize>,
    poll_interval_ms: Option<u64>,
    auto_prefetch: Option<bool>,
    slow_render_threshold_ms: Option<u64>,
    pool_slot_capacity: Option<usize>,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefetch_distance(mut self, distance: usize) -> Self {
        self.prefetch_distance = distance;
        self
    }

    pub fn with_cache_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.cache_strategy = strategy;
        self
    }

    pub fn with_debug_metrics(mut self, enabled: bool) -> Self {
        self.debug_metrics = enabled;
        self
    }

    /// Override the rendered-page budget, in bytes.
    pub fn with_cache_memory_limit(mut self, bytes: usize) -> Self {
        self.cache_memory_limit = Some(bytes);
        self
    }

    pub fn with_handle_capacity(mut self, capacity: usize) -> Self {
        self.handle_capacity = capacity;
        self
    }

    pub fn with_handle_mode(mut self, mode: HandleMode) -> Self {
        self.handle_mode = mode;
        self
    }

    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_auto_prefetch(mut self, enabled: bool) -> Self {
        self.auto_prefetch = enabled;
        self
    }

    pub fn with_slow_render_threshold(mut self, threshold: Duration) -> Self {
        self.slow_render_threshold = threshold;
        self
    }

    pub fn with_pool_slot_capacity(mut self, capacity: usize) -> Self {
        self.pool_slot_capacity = capacity;
        self
    }

    /// Rendered-page budget in bytes, after applying the strategy default.
    pub fn effective_cache_memory_limit(&self) -> usize {
        self.cache_memory_limit.unwrap_or_else(|| self.cache_strategy.default_memory_limit())
    }

    /// Load configuration from environment variables on top of the defaults.
    ///
    /// Environment variables:
    /// - `FOLIO_PREFETCH_DISTANCE`: pages prefetched on each side (default: 2)
    /// - `FOLIO_CACHE_STRATEGY`: `memory` or `performance` (default: performance)
    /// - `FOLIO_DEBUG_METRICS`: `true`/`false`, `1`/`0`
    /// - `FOLIO_CACHE_MB`: rendered-page budget in MB
    /// - `FOLIO_HANDLE_CAPACITY`: open page handles (default: 5)
    /// - `FOLIO_HANDLE_MODE`: `bounded` or `single-handle`
    /// - `FOLIO_WORKER_THREADS`: render workers (default: CPU count)
    /// - `FOLIO_POLL_INTERVAL_MS`: idle worker poll interval
    /// - `FOLIO_AUTO_PREFETCH`: `true`/`false`, `1`/`0`
    /// - `FOLIO_SLOW_RENDER_MS`: slow render threshold (default: 500)
    /// - `FOLIO_POOL_SLOT_CAPACITY`: free buffers kept per size (default: 4)
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidValue`] for the first unparsable variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(distance) = env_value("FOLIO_PREFETCH_DISTANCE")? {
            config.prefetch_distance = distance;
        }
        if let Some(strategy) = env_value("FOLIO_CACHE_STRATEGY")? {
            config.cache_strategy = strategy;
        }
        if let Some(enabled) = env_flag("FOLIO_DEBUG_METRICS")? {
            config.debug_metrics = enabled;
        }
        if let Some(mb) = env_value("FOLIO_CACHE_MB")? {
            config.cache_memory_limit = Some(mb_to_bytes("FOLIO_CACHE_MB", mb)?);
        }
        if let Some(capacity) = env_value("FOLIO_HANDLE_CAPACITY")? {
            config.handle_capacity = capacity;
        }
        if let Some(mode) = env_value("FOLIO_HANDLE_MODE")? {
            config.handle_mode = mode;
        }
        if let Some(workers) = env_value("FOLIO_WORKER_THREADS")? {
            config.worker_threads = workers;
        }
        if let Some(ms) = env_value("FOLIO_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(enabled) = env_flag("FOLIO_AUTO_PREFETCH")? {
            config.auto_prefetch = enabled;
        }
        if let Some(ms) = env_value("FOLIO_SLOW_RENDER_MS")? {
            config.slow_render_threshold = Duration::from_millis(ms);
        }
        if let Some(capacity) = env_value("FOLIO_POOL_SLOT_CAPACITY")? {
            config.pool_slot_capacity = capacity;
        }

        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// Expected file format (all keys optional):
    /// ```toml
    /// prefetch_distance = 2
    /// cache_strategy = "memory"
    /// cache_memory_mb = 64
    /// handle_mode = "single-handle"
    /// slow_render_threshold_ms = 250
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from TOML text; missing keys keep their defaults.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(toml_str)?;
        let mut config = Self::default();

        if let Some(distance) = file.prefetch_distance {
            config.prefetch_distance = distance;
        }
        if let Some(strategy) = file.cache_strategy {
            config.cache_strategy = strategy;
        }
        if let Some(enabled) = file.debug_metrics {
            config.debug_metrics = enabled;
        }
        if let Some(mb) = file.cache_memory_mb {
            config.cache_memory_limit = Some(mb_to_bytes("cache_memory_mb", mb)?);
        }
        if let Some(capacity) = file.handle_capacity {
            config.handle_capacity = capacity;
        }
        if let Some(mode) = file.handle_mode {
            config.handle_mode = mode;
        }
        if let Some(workers) = file.worker_threads {
            config.worker_threads = workers;
        }
        if let Some(ms) = file.poll_interval_ms {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(enabled) = file.auto_prefetch {
            config.auto_prefetch = enabled;
        }
        if let Some(ms) = file.slow_render_threshold_ms {
            config.slow_render_threshold = Duration::from_millis(ms);
        }
        if let Some(capacity) = file.pool_slot_capacity {
            config.pool_slot_capacity = capacity;
        }

        Ok(config)
    }

    /// Render this configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        let file = ConfigFile {
            prefetch_distance: Some(self.prefetch_distance),
            cache_strategy: Some(self.cache_strategy),
            debug_metrics: Some(self.debug_metrics),
            cache_memory_mb: self.cache_memory_limit.map(|bytes| bytes / MB),
            handle_capacity: Some(self.handle_capacity),
            handle_mode: Some(self.handle_mode),
            worker_threads: Some(self.worker_threads),
            poll_interval_ms: Some(self.poll_interval.as_millis() as u64),
            auto_prefetch: Some(self.auto_prefetch),
            slow_render_threshold_ms: Some(self.slow_render_threshold.as_millis() as u64),
            pool_slot_capacity: Some(self.pool_slot_capacity),
        };
        Ok(toml::to_string(&file)?)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml_string()?)?;
        Ok(())
    }
}

fn mb_to_bytes(key: &str, mb: usize) -> Result<usize, ConfigError> {
    mb.checked_mul(MB).ok_or_else(|| ConfigError::InvalidValue {
        key: key.to_owned(),
        value: mb.to_string(),
    })
}

fn env_value<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_owned(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

fn env_flag(key: &str) -> Result<Option<bool>, ConfigError> {
    let Ok(value) = std::env::var(key) else {
        return Ok(None);
    };

    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_owned(),
            value,
        }),
    }
}
