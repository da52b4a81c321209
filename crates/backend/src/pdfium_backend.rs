//! PDFium-backed document backend (feature `pdfium`).

use crate::{BackendError, BackendResult, Bitmap, DocumentBackend, OpenSource, PageSize};
use pdfium_render::prelude::*;
use std::sync::OnceLock;

/// Process-wide library binding; every document borrows it.
static PDFIUM: OnceLock<Pdfium> = OnceLock::new();

/// Handle to one page of a [`PdfiumBackend`] document.
#[derive(Debug)]
pub struct PdfiumPage {
    index: u16,
    size: PageSize,
}

/// Renders pages with the PDFium library.
pub struct PdfiumBackend {
    document: Option<PdfDocument<'static>>,
    page_count: usize,
}

impl PdfiumBackend {
    /// Bind PDFium, preferring a library next to the executable.
    fn init_pdfium() -> BackendResult<Pdfium> {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()));

        if let Some(ref dir) = exe_dir {
            if let Ok(bindings) =
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir))
            {
                return Ok(Pdfium::new(bindings));
            }
        }

        Ok(Pdfium::new(
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
                .or_else(|_| Pdfium::bind_to_system_library())
                .map_err(|e| BackendError::Backend(format!("failed to bind pdfium: {e}")))?,
        ))
    }

    /// The shared binding, created by the first successful open.
    ///
    /// A failed bind is not remembered, so a later open retries it.
    fn pdfium() -> BackendResult<&'static Pdfium> {
        if let Some(pdfium) = PDFIUM.get() {
            return Ok(pdfium);
        }
        let bound = Self::init_pdfium()?;
        Ok(PDFIUM.get_or_init(|| bound))
    }

    pub fn open(source: OpenSource) -> BackendResult<Self> {
        let pdfium = Self::pdfium()?;

        let document = match source {
            OpenSource::Path(path) => pdfium.load_pdf_from_file(&path, None),
            OpenSource::Bytes(bytes) => pdfium.load_pdf_from_byte_vec(bytes, None),
        }
        .map_err(|e| BackendError::Backend(format!("failed to load document: {e}")))?;

        let page_count = document.pages().len() as usize;
        Ok(Self {
            document: Some(document),
            page_count,
        })
    }

    fn document(&self) -> BackendResult<&PdfDocument<'static>> {
        self.document.as_ref().ok_or(BackendError::DocumentClosed)
    }
}

impl DocumentBackend for PdfiumBackend {
    type Page = PdfiumPage;

    fn page_count(&self) -> usize {
        self.page_count
    }

    fn open_page(&mut self, index: usize) -> BackendResult<PdfiumPage> {
        let page_count = self.page_count;
        let out_of_range = || BackendError::PageOutOfRange { index, page_count };
        let page_index = u16::try_from(index).map_err(|_| out_of_range())?;

        let page = self
            .document()?
            .pages()
            .get(page_index)
            .map_err(|_| out_of_range())?;
        let size = PageSize::new(page.width().value, page.height().value);

        Ok(PdfiumPage {
            index: page_index,
            size,
        })
    }

    fn page_size(&self, page: &PdfiumPage) -> PageSize {
        page.size
    }

    fn render_page(&mut self, page: &mut PdfiumPage, target: &mut Bitmap) -> BackendResult<()> {
        let index = page.index as usize;
        let render_err = |e: PdfiumError| BackendError::Render {
            index,
            reason: e.to_string(),
        };

        let pdf_page = self
            .document()?
            .pages()
            .get(page.index)
            .map_err(render_err)?;
        let config = PdfRenderConfig::new()
            .set_target_width(target.width() as i32)
            .set_target_height(target.height() as i32);

        let rendered = pdf_page.render_with_config(&config).map_err(render_err)?;
        let rgba = rendered.as_rgba_bytes();

        let out = target.pixels_mut();
        let len = out.len().min(rgba.len());
        out[..len].copy_from_slice(&rgba[..len]);

        Ok(())
    }

    fn close_page(&mut self, _page: PdfiumPage) -> BackendResult<()> {
        self.document().map(|_| ())
    }

    fn close(&mut self) -> BackendResult<()> {
        self.document
            .take()
            .map(drop)
            .ok_or(BackendError::DocumentClosed)
    }
}
