//! Scripted backend and fixtures for tests.
//!
//! [`ScriptedBackend`] behaves like a document with a fixed set of pages and
//! records every call in a shared [`BackendProbe`], so tests can assert how
//! many handles were opened, whether any index was opened twice, how many
//! renders ran and at which sizes. Failures and slow renders can be injected
//! per page, and renders can be held at a [`RenderGate`] until a test
//! releases them.

use crate::{BackendError, BackendResult, Bitmap, DocumentBackend, PageSize};
use lopdf::{dictionary, Document, Object};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Build an in-memory PDF with `page_count` empty pages of the given size.
pub fn sample_pdf_bytes(page_count: usize, width_pt: f32, height_pt: f32) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let media_box = vec![
        0.into(),
        0.into(),
        Object::Real(width_pt),
        Object::Real(height_pt),
    ];

    let kids: Vec<Object> = (0..page_count)
        .map(|_| {
            doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => media_box.clone(),
            })
            .into()
        })
        .collect();

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => page_count as i64,
        }),
    );

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("in-memory PDF serialization cannot fail");
    bytes
}

/// Call counters shared between a [`ScriptedBackend`] and the test body.
#[derive(Debug, Default)]
pub struct BackendProbe {
    opens: AtomicUsize,
    closes: AtomicUsize,
    renders_started: AtomicUsize,
    renders: AtomicUsize,
    double_opens: AtomicUsize,
    document_closes: AtomicUsize,
    max_open: AtomicUsize,
    open_pages: Mutex<HashMap<usize, usize>>,
    rendered: Mutex<Vec<(usize, u32, u32)>>,
}

impl BackendProbe {
    /// Total page handles opened.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Total page handles closed.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Completed render calls (successful or not).
    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn renders_started(&self) -> usize {
        self.renders_started.load(Ordering::SeqCst)
    }

    /// Number of times an index was opened while a handle for it was still open.
    pub fn double_opens(&self) -> usize {
        self.double_opens.load(Ordering::SeqCst)
    }

    pub fn document_closes(&self) -> usize {
        self.document_closes.load(Ordering::SeqCst)
    }

    /// Handles currently open.
    pub fn open_now(&self) -> usize {
        self.open_pages.lock().unwrap().values().sum()
    }

    /// Highest number of simultaneously open handles observed.
    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    /// Indices that currently have an open handle.
    pub fn open_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .open_pages
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(index, _)| *index)
            .collect();
        indices.sort_unstable();
        indices
    }

    /// `(page, width, height)` of every successful render, in order.
    pub fn rendered(&self) -> Vec<(usize, u32, u32)> {
        self.rendered.lock().unwrap().clone()
    }

    pub fn renders_of(&self, page: usize) -> usize {
        self.rendered
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _, _)| *p == page)
            .count()
    }

    /// Poll until at least `count` renders have started.
    pub fn wait_for_renders_started(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.renders_started() >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        self.renders_started() >= count
    }

    fn record_open(&self, index: usize) {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open_pages.lock().unwrap();
        let count = open.entry(index).or_insert(0);
        if *count > 0 {
            self.double_opens.fetch_add(1, Ordering::SeqCst);
        }
        *count += 1;
        let total: usize = open.values().sum();
        self.max_open.fetch_max(total, Ordering::SeqCst);
    }

    fn record_close(&self, index: usize) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open_pages.lock().unwrap();
        if let Some(count) = open.get_mut(&index) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Blocks renders until released.
#[derive(Debug, Default)]
pub struct RenderGate {
    held: Mutex<bool>,
    cv: Condvar,
}

impl RenderGate {
    /// A gate that starts out holding renders.
    pub fn closed() -> Arc<Self> {
        Arc::new(Self {
            held: Mutex::new(true),
            cv: Condvar::new(),
        })
    }

    pub fn release(&self) {
        *self.held.lock().unwrap() = false;
        self.cv.notify_all();
    }

    pub fn hold(&self) {
        *self.held.lock().unwrap() = true;
    }

    fn wait(&self) {
        let held = self.held.lock().unwrap();
        let _released = self.cv.wait_while(held, |held| *held).unwrap();
    }
}

/// Page handle of a [`ScriptedBackend`].
#[derive(Debug)]
pub struct ScriptedPage {
    index: usize,
    size: PageSize,
}

impl ScriptedPage {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Deterministic in-memory document for engine tests.
#[derive(Debug)]
pub struct ScriptedBackend {
    page_sizes: Vec<PageSize>,
    probe: Arc<BackendProbe>,
    render_delay: Duration,
    fail_open: HashSet<usize>,
    fail_render: HashSet<usize>,
    panic_open: HashSet<usize>,
    panic_render: HashSet<usize>,
    gate: Option<Arc<RenderGate>>,
    open: bool,
}

impl ScriptedBackend {
    /// A document of `page_count` US-letter pages.
    pub fn new(page_count: usize) -> Self {
        Self {
            page_sizes: vec![PageSize::new(612.0, 792.0); page_count],
            probe: Arc::new(BackendProbe::default()),
            render_delay: Duration::ZERO,
            fail_open: HashSet::new(),
            fail_render: HashSet::new(),
            panic_open: HashSet::new(),
            panic_render: HashSet::new(),
            gate: None,
            open: true,
        }
    }

    /// Give every page the same size.
    pub fn with_page_size(mut self, size: PageSize) -> Self {
        self.page_sizes.iter_mut().for_each(|s| *s = size);
        self
    }

    /// Override the size of one page.
    pub fn with_size_of(mut self, page: usize, size: PageSize) -> Self {
        if let Some(slot) = self.page_sizes.get_mut(page) {
            *slot = size;
        }
        self
    }

    /// Sleep this long inside every render call.
    pub fn with_render_delay(mut self, delay: Duration) -> Self {
        self.render_delay = delay;
        self
    }

    pub fn failing_open(mut self, page: usize) -> Self {
        self.fail_open.insert(page);
        self
    }

    pub fn failing_render(mut self, page: usize) -> Self {
        self.fail_render.insert(page);
        self
    }

    /// Panic instead of opening `page`.
    pub fn panicking_open(mut self, page: usize) -> Self {
        self.panic_open.insert(page);
        self
    }

    /// Panic instead of rendering `page`.
    pub fn panicking_render(mut self, page: usize) -> Self {
        self.panic_render.insert(page);
        self
    }

    /// Block every render at `gate` until it is released.
    pub fn with_gate(mut self, gate: Arc<RenderGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn probe(&self) -> Arc<BackendProbe> {
        self.probe.clone()
    }

    fn ensure_open(&self) -> BackendResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(BackendError::DocumentClosed)
        }
    }
}

impl DocumentBackend for ScriptedBackend {
    type Page = ScriptedPage;

    fn page_count(&self) -> usize {
        self.page_sizes.len()
    }

    fn open_page(&mut self, index: usize) -> BackendResult<ScriptedPage> {
        self.ensure_open()?;
        let size = self
            .page_sizes
            .get(index)
            .copied()
            .ok_or(BackendError::PageOutOfRange {
                index,
                page_count: self.page_sizes.len(),
            })?;
        if self.panic_open.contains(&index) {
            panic!("scripted open panic for page {index}");
        }
        if self.fail_open.contains(&index) {
            return Err(BackendError::Backend(format!("scripted open failure for page {index}")));
        }
        self.probe.record_open(index);
        Ok(ScriptedPage { index, size })
    }

    fn page_size(&self, page: &ScriptedPage) -> PageSize {
        page.size
    }

    fn render_page(&mut self, page: &mut ScriptedPage, target: &mut Bitmap) -> BackendResult<()> {
        self.ensure_open()?;
        self.probe.renders_started.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.wait();
        }
        if !self.render_delay.is_zero() {
            thread::sleep(self.render_delay);
        }

        self.probe.renders.fetch_add(1, Ordering::SeqCst);
        if self.panic_render.contains(&page.index) {
            panic!("scripted render panic for page {}", page.index);
        }
        if self.fail_render.contains(&page.index) {
            return Err(BackendError::Render {
                index: page.index,
                reason: "scripted render failure".to_owned(),
            });
        }

        let shade = (page.index % 256) as u8;
        target.fill([shade, shade, shade, 255]);
        self.probe
            .rendered
            .lock()
            .unwrap()
            .push((page.index, target.width(), target.height()));
        Ok(())
    }

    fn close_page(&mut self, page: ScriptedPage) -> BackendResult<()> {
        self.probe.record_close(page.index);
        self.ensure_open()
    }

    fn close(&mut self) -> BackendResult<()> {
        self.ensure_open()?;
        self.open = false;
        self.probe.document_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
