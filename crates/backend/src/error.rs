//! Error types for document backends

use thiserror::Error;

/// Result type for backend operations
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Errors reported by the native render primitive
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PDF parse error: {0}")]
    Parse(#[from] lopdf::Error),

    #[error("page {index} out of range (page_count={page_count})")]
    PageOutOfRange { index: usize, page_count: usize },

    #[error("document is closed")]
    DocumentClosed,

    #[error("encrypted PDFs are not supported in the default backend")]
    EncryptedUnsupported,

    /// Rendering a page into its target buffer failed
    #[error("failed to render page {index}: {reason}")]
    Render { index: usize, reason: String },

    #[error("backend error: {0}")]
    Backend(String),
}
