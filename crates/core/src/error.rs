//! Error types for the render engine

use folio_backend::BackendError;
use std::io;
use thiserror::Error;

/// Why a page request did not produce a bitmap
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("page {index} is out of range (page_count={page_count})")]
    OutOfRange { index: usize, page_count: usize },

    #[error("failed to open page {index}: {source}")]
    HandleOpenFailure { index: usize, source: BackendError },

    #[error("failed to render page {index}: {source}")]
    RenderFailure { index: usize, source: BackendError },

    #[error("render engine is closed")]
    ResourceClosed,

    /// A later request for the same page replaced this one
    #[error("request for page {index} was superseded by a newer request")]
    Superseded { index: usize },

    /// The engine closed before the request completed
    #[error("request for page {index} was cancelled")]
    Cancelled { index: usize },
}

/// Errors loading an [`EngineConfig`](crate::EngineConfig)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for configuration key {key}")]
    InvalidValue { key: String, value: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Errors creating a [`RenderEngine`](crate::RenderEngine)
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn render workers: {0}")]
    WorkerSpawn(#[source] io::Error),
}
