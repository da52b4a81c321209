//! Default backend built on `lopdf`.
//!
//! Reads the page tree and MediaBox sizes; pages are rasterized as blank
//! sheets with a border and an index-dependent header band, which is enough
//! for layout, scrolling and cache behavior without a native rasterizer.

use crate::{
    BackendError, BackendResult, Bitmap, DocumentBackend, OpenSource, PageSize,
};
use lopdf::Document;
use std::fs;

const DEFAULT_PAGE_SIZE: PageSize = PageSize {
    width_pt: 612.0,
    height_pt: 792.0,
};
const PAPER: [u8; 4] = [255, 255, 255, 255];
const BORDER: [u8; 4] = [220, 220, 220, 255];

/// Handle to one page of a [`LopdfBackend`] document.
#[derive(Debug)]
pub struct LopdfPage {
    index: usize,
    size: PageSize,
}

impl LopdfPage {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Document backend that parses page geometry with `lopdf`.
#[derive(Debug)]
pub struct LopdfBackend {
    page_sizes: Vec<PageSize>,
    open: bool,
}

impl LopdfBackend {
    /// Open a document and read its page sizes.
    pub fn open(source: OpenSource) -> BackendResult<Self> {
        let bytes = match source {
            OpenSource::Path(path) => fs::read(path)?,
            OpenSource::Bytes(bytes) => bytes,
        };

        let page_sizes = Self::parse_sizes(&bytes)?;
        tracing::debug!(pages = page_sizes.len(), "opened document");

        Ok(Self {
            page_sizes,
            open: true,
        })
    }

    fn parse_sizes(bytes: &[u8]) -> BackendResult<Vec<PageSize>> {
        let marker: &[u8] = b"/Encrypt";
        if bytes.windows(marker.len()).any(|window| window == marker) {
            return Err(BackendError::EncryptedUnsupported);
        }

        let doc = Document::load_mem(bytes)?;
        let pages = doc.get_pages();
        let mut sizes = Vec::with_capacity(pages.len());

        for (_, object_id) in pages {
            let dict = doc.get_dictionary(object_id)?;
            let size = dict
                .get(b"MediaBox")
                .ok()
                .and_then(|obj| obj.as_array().ok())
                .and_then(|array| {
                    if array.len() != 4 {
                        return None;
                    }
                    let x0 = array[0].as_float().ok()?;
                    let y0 = array[1].as_float().ok()?;
                    let x1 = array[2].as_float().ok()?;
                    let y1 = array[3].as_float().ok()?;
                    Some(PageSize::new((x1 - x0).abs(), (y1 - y0).abs()))
                })
                .unwrap_or(DEFAULT_PAGE_SIZE);

            sizes.push(size);
        }

        if sizes.is_empty() {
            return Err(BackendError::Backend("document has no pages".to_owned()));
        }

        Ok(sizes)
    }

    fn ensure_open(&self) -> BackendResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(BackendError::DocumentClosed)
        }
    }
}

impl DocumentBackend for LopdfBackend {
    type Page = LopdfPage;

    fn page_count(&self) -> usize {
        self.page_sizes.len()
    }

    fn open_page(&mut self, index: usize) -> BackendResult<LopdfPage> {
        self.ensure_open()?;
        let size = self
            .page_sizes
            .get(index)
            .copied()
            .ok_or(BackendError::PageOutOfRange {
                index,
                page_count: self.page_sizes.len(),
            })?;
        Ok(LopdfPage { index, size })
    }

    fn page_size(&self, page: &LopdfPage) -> PageSize {
        page.size
    }

    fn render_page(&mut self, page: &mut LopdfPage, target: &mut Bitmap) -> BackendResult<()> {
        self.ensure_open()?;
        let (width, height) = target.dimensions();
        if width == 0 || height == 0 {
            return Err(BackendError::Render {
                index: page.index,
                reason: format!("empty target {width}x{height}"),
            });
        }

        target.fill(PAPER);

        // Header band shade varies per page so neighbouring pages differ.
        let shade = 240 - ((page.index * 37) % 120) as u8;
        let band = (height / 16).max(1);
        for y in 0..band {
            for x in 0..width {
                target.put_pixel(x, y, [shade, shade, shade, 255]);
            }
        }

        if width >= 4 && height >= 4 {
            for x in 0..width {
                target.put_pixel(x, 0, BORDER);
                target.put_pixel(x, height - 1, BORDER);
            }
            for y in 0..height {
                target.put_pixel(0, y, BORDER);
                target.put_pixel(width - 1, y, BORDER);
            }
        }

        Ok(())
    }

    fn close_page(&mut self, _page: LopdfPage) -> BackendResult<()> {
        self.ensure_open()
    }

    fn close(&mut self) -> BackendResult<()> {
        self.ensure_open()?;
        self.open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_pdf_bytes;

    fn open_sample(pages: usize) -> LopdfBackend {
        LopdfBackend::open(OpenSource::Bytes(sample_pdf_bytes(pages, 612.0, 792.0)))
            .expect("sample document should open")
    }

    #[test]
    fn test_reads_page_count_and_sizes() {
        let mut backend = open_sample(3);
        assert_eq!(backend.page_count(), 3);

        let page = backend.open_page(2).unwrap();
        assert_eq!(page.index(), 2);
        assert_eq!(backend.page_size(&page), PageSize::new(612.0, 792.0));
    }

    #[test]
    fn test_open_page_out_of_range() {
        let mut backend = open_sample(2);
        let err = backend.open_page(5).unwrap_err();
        assert!(matches!(
            err,
            BackendError::PageOutOfRange {
                index: 5,
                page_count: 2,
            }
        ));
    }

    #[test]
    fn test_render_fills_target() {
        let mut backend = open_sample(1);
        let mut page = backend.open_page(0).unwrap();
        let mut target = Bitmap::new(40, 50);

        backend.render_page(&mut page, &mut target).unwrap();

        assert_eq!(target.pixel(0, 0), Some(BORDER));
        assert_eq!(target.pixel(20, 25), Some(PAPER));
    }

    #[test]
    fn test_render_rejects_empty_target() {
        let mut backend = open_sample(1);
        let mut page = backend.open_page(0).unwrap();
        let mut target = Bitmap::new(0, 10);

        assert!(matches!(
            backend.render_page(&mut page, &mut target),
            Err(BackendError::Render { index: 0, .. })
        ));
    }

    #[test]
    fn test_closed_document_rejects_calls() {
        let mut backend = open_sample(1);
        let page = backend.open_page(0).unwrap();
        backend.close().unwrap();

        assert!(matches!(backend.close_page(page), Err(BackendError::DocumentClosed)));
        assert!(matches!(backend.open_page(0), Err(BackendError::DocumentClosed)));
        assert!(matches!(backend.close(), Err(BackendError::DocumentClosed)));
    }

    #[test]
    fn test_invalid_bytes_fail_to_open() {
        let err = LopdfBackend::open(OpenSource::Bytes(b"not a pdf".to_vec())).unwrap_err();
        assert!(matches!(err, BackendError::Parse(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let source = OpenSource::Path("/nonexistent/folio.pdf".into());
        let err = LopdfBackend::open(source).unwrap_err();
        assert!(matches!(err, BackendError::Io(_)));
    }
}
