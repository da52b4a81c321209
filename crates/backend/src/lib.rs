//! Folio document backends
//!
//! The native page-rendering primitive used by the render engine. A backend
//! owns one open document and can open page handles, report page sizes, fill a
//! pixel buffer for a page and close everything again. Backends are not
//! assumed to be reentrant: the engine serializes every call.

mod bitmap;
mod error;
mod lopdf_backend;

#[cfg(feature = "pdfium")]
pub mod pdfium_backend;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

use std::path::{Path, PathBuf};

pub use bitmap::{Bitmap, BYTES_PER_PIXEL};
pub use error::{BackendError, BackendResult};
pub use lopdf_backend::{LopdfBackend, LopdfPage};

/// Page size in PDF points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width_pt: f32,
    pub height_pt: f32,
}

impl PageSize {
    /// Placeholder reported when a page size cannot be determined.
    pub const UNKNOWN: PageSize = PageSize {
        width_pt: 1.0,
        height_pt: 1.0,
    };

    pub fn new(width_pt: f32, height_pt: f32) -> Self {
        Self {
            width_pt,
            height_pt,
        }
    }

    /// Width divided by height, 1.0 for degenerate sizes.
    pub fn aspect_ratio(&self) -> f32 {
        if self.height_pt <= 0.0 || self.width_pt <= 0.0 {
            1.0
        } else {
            self.width_pt / self.height_pt
        }
    }

    /// Pixel width that keeps this page's aspect ratio at `height_px`.
    pub fn width_for_height(&self, height_px: u32) -> u32 {
        ((height_px as f32 * self.aspect_ratio()).round() as u32).max(1)
    }
}

/// Where a document's bytes come from.
#[derive(Debug, Clone)]
pub enum OpenSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl From<PathBuf> for OpenSource {
    fn from(value: PathBuf) -> Self {
        Self::Path(value)
    }
}

impl From<&Path> for OpenSource {
    fn from(value: &Path) -> Self {
        Self::Path(value.to_path_buf())
    }
}

impl From<Vec<u8>> for OpenSource {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// An open document that can render its pages into caller-provided buffers.
///
/// Constructing a backend is the "open document" step; `page_count` is fixed
/// from then on. Page handles returned by [`open_page`](Self::open_page) must
/// be handed back to [`close_page`](Self::close_page), and none of the methods
/// may be called concurrently for the same document.
pub trait DocumentBackend: Send + 'static {
    /// Open handle to a single page.
    type Page: Send + 'static;

    fn page_count(&self) -> usize;

    fn open_page(&mut self, index: usize) -> BackendResult<Self::Page>;

    fn page_size(&self, page: &Self::Page) -> PageSize;

    /// Render `page` scaled to fill `target` completely.
    fn render_page(&mut self, page: &mut Self::Page, target: &mut Bitmap) -> BackendResult<()>;

    fn close_page(&mut self, page: Self::Page) -> BackendResult<()>;

    /// Close the document. Further calls fail with [`BackendError::DocumentClosed`].
    fn close(&mut self) -> BackendResult<()>;
}
