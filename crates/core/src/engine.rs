//! Render engine
//!
//! Owns one open document and everything built around it: the page handle
//! cache behind the render lock, the rendered-page cache, the bitmap pool,
//! the job scheduler with its worker pool, prefetch planning and metrics.
//!
//! Each page index has at most one active render job. The job table maps a
//! page to that job; a worker only publishes its bitmap to the cache if its
//! job is still the table entry when it finishes, so superseded or cancelled
//! work can never overwrite a newer result.

use crate::config::EngineConfig;
use crate::dispatch::{CallbackContext, ImmediateContext};
use crate::error::{EngineError, RenderError};
use crate::handles::{HandleStats, PageHandleCache};
use folio_backend::{BackendError, Bitmap, DocumentBackend, LopdfBackend, OpenSource, PageSize};
use folio_cache::{BitmapPool, CacheStats, PoolStats, RenderedPageCache};
use folio_scheduler::{
    panic_message, CancellationToken, Job, JobExecutor, JobId, JobKind, JobPriority, JobScheduler,
    MetricsAggregator, MetricsSnapshot, PrefetchPlanner, PriorityLock, ScrollDirection,
    ScrollTracker, WorkerPool, WorkerPoolConfig,
};
use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Requested output size in pixels.
///
/// The engine renders at `height` and derives the width from the page's
/// aspect ratio, so `width` only distinguishes otherwise identical requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Height actually rendered (never zero).
    pub fn render_height(&self) -> u32 {
        self.height.max(1)
    }
}

/// Outcome of one page request, delivered exactly once per request.
#[derive(Debug)]
pub struct PageResult {
    page_index: usize,
    outcome: Result<Arc<Bitmap>, RenderError>,
}

impl PageResult {
    pub fn success(page_index: usize, bitmap: Arc<Bitmap>) -> Self {
        Self {
            page_index,
            outcome: Ok(bitmap),
        }
    }

    pub fn failure(page_index: usize, error: RenderError) -> Self {
        Self {
            page_index,
            outcome: Err(error),
        }
    }

    pub fn page_index(&self) -> usize {
        self.page_index
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Shared, read-only view of the rendered page.
    pub fn bitmap(&self) -> Option<&Arc<Bitmap>> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&RenderError> {
        self.outcome.as_ref().err()
    }

    /// Human-readable failure reason.
    pub fn message(&self) -> Option<String> {
        self.error().map(ToString::to_string)
    }

    pub fn into_result(self) -> Result<Arc<Bitmap>, RenderError> {
        self.outcome
    }
}

/// Receives the result of [`RenderEngine::request_page`].
pub type RenderCallback = Box<dyn FnOnce(PageResult) + Send>;

/// Receives the result of [`RenderEngine::get_page_dimensions`].
pub type DimensionsCallback = Box<dyn FnOnce(PageSize) + Send>;

struct ActiveJob {
    job_id: JobId,
    token: CancellationToken,
    target: TargetSize,

    /// Shared with the worker waiting on the render lock, so a promotion
    /// takes effect while it waits.
    foreground: Arc<AtomicBool>,

    /// `None` for silent prefetch jobs
    callback: Option<RenderCallback>,
}

impl ActiveJob {
    fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct JobTable {
    renders: HashMap<usize, ActiveJob>,
    dimensions: HashMap<JobId, (usize, DimensionsCallback)>,
}

struct DocumentState<B: DocumentBackend> {
    backend: B,
    handles: PageHandleCache<B::Page>,
    open: bool,
}

/// A decoded page on its way from the render lock to the cache.
struct Rendered {
    bitmap: Bitmap,
    elapsed: Duration,
}

struct Shared<B: DocumentBackend> {
    document: PriorityLock<DocumentState<B>>,
    page_count: usize,
    closed: AtomicBool,
    scheduler: Arc<JobScheduler>,
    jobs: Mutex<JobTable>,
    cache: RenderedPageCache,
    pool: BitmapPool,
    dimensions: Mutex<HashMap<usize, PageSize>>,
    metrics: MetricsAggregator,
    planner: PrefetchPlanner,
    scroll: Mutex<ScrollTracker>,
    last_target: Mutex<Option<TargetSize>>,
    context: Arc<dyn CallbackContext>,
    config: EngineConfig,
}

/// Incremental page renderer for one open document.
///
/// Results are delivered through the engine's [`CallbackContext`]; rejected
/// requests (closed engine, index out of range) are answered inline on the
/// calling thread.
///
/// # Example
///
/// ```no_run
/// use folio_core::{EngineConfig, RenderEngine, TargetSize};
///
/// let path = std::path::Path::new("paper.pdf");
/// let engine = RenderEngine::open_document(path, EngineConfig::default())?;
/// engine.request_page(0, TargetSize::new(600, 800), |result| {
///     if let Some(bitmap) = result.bitmap() {
///         println!("page 0: {}x{}", bitmap.width(), bitmap.height());
///     }
/// });
/// engine.close();
/// # Ok::<(), folio_core::EngineError>(())
/// ```
pub struct RenderEngine<B: DocumentBackend> {
    shared: Arc<Shared<B>>,
    workers: Mutex<Option<WorkerPool>>,
}

impl RenderEngine<LopdfBackend> {
    /// Open a document with the default backend.
    ///
    /// Callbacks run on the worker thread that produced them
    /// ([`ImmediateContext`]); use [`with_backend`](Self::with_backend) to
    /// deliver them elsewhere.
    pub fn open_document(
        source: impl Into<OpenSource>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let backend = LopdfBackend::open(source.into())?;
        Self::with_backend(backend, Arc::new(ImmediateContext), config)
    }
}

impl<B: DocumentBackend> RenderEngine<B> {
    /// Build an engine around an already opened backend.
    pub fn with_backend(
        backend: B,
        context: Arc<dyn CallbackContext>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let page_count = backend.page_count();
        let handles = PageHandleCache::new(config.handle_capacity, config.handle_mode);

        let shared = Arc::new(Shared {
            document: PriorityLock::new(DocumentState {
                backend,
                handles,
                open: true,
            }),
            page_count,
            closed: AtomicBool::new(false),
            scheduler: Arc::new(JobScheduler::new()),
            jobs: Mutex::new(JobTable::default()),
            cache: RenderedPageCache::with_memory_limit(
                config.cache_strategy,
                config.effective_cache_memory_limit(),
            ),
            pool: BitmapPool::with_slot_capacity(config.pool_slot_capacity),
            dimensions: Mutex::new(HashMap::new()),
            metrics: MetricsAggregator::new(),
            planner: PrefetchPlanner::new(config.prefetch_distance),
            scroll: Mutex::new(ScrollTracker::new()),
            last_target: Mutex::new(None),
            context,
            config,
        });

        let executor: JobExecutor = {
            let shared = shared.clone();
            Arc::new(move |job: &Job, token: &CancellationToken| {
                shared.execute(job, token)
            })
        };
        let pool_config = WorkerPoolConfig::new(shared.config.worker_threads)
            .with_poll_interval(shared.config.poll_interval);
        let workers = WorkerPool::new(shared.scheduler.clone(), executor, pool_config)
            .map_err(EngineError::WorkerSpawn)?;

        tracing::info!(
            page_count,
            workers = workers.num_workers(),
            strategy = %shared.config.cache_strategy,
            handle_mode = %shared.config.handle_mode,
            "render engine ready"
        );

        Ok(Self {
            shared,
            workers: Mutex::new(Some(workers)),
        })
    }

    /// Request page `index` rendered at `target`.
    ///
    /// `callback` runs exactly once: with the bitmap, or with the reason the
    /// request failed. A later request for the same page supersedes this one
    /// unless it can join a matching prefetch.
    pub fn request_page<F>(&self, index: usize, target: TargetSize, callback: F)
    where
        F: FnOnce(PageResult) + Send + 'static,
    {
        self.shared.request_page(index, target, Box::new(callback));
    }

    /// Report the size of page `index` in points.
    ///
    /// Failures report [`PageSize::UNKNOWN`].
    pub fn get_page_dimensions<F>(&self, index: usize, callback: F)
    where
        F: FnOnce(PageSize) + Send + 'static,
    {
        self.shared.get_page_dimensions(index, Box::new(callback));
    }

    /// Prefetch around `current` at the most recently requested target size.
    ///
    /// Returns the pages enqueued; empty until a page has been requested.
    pub fn prefetch(&self, current: usize, direction: ScrollDirection) -> BTreeSet<usize> {
        let target = *self.shared.last_target.lock().unwrap();
        match target {
            Some(target) => self.shared.prefetch_at(current, direction, target),
            None => BTreeSet::new(),
        }
    }

    /// Prefetch around `current` at an explicit target size.
    pub fn prefetch_at(
        &self,
        current: usize,
        direction: ScrollDirection,
        target: TargetSize,
    ) -> BTreeSet<usize> {
        self.shared.prefetch_at(current, direction, target)
    }

    /// Feed a vertical scroll delta; the direction steers automatic prefetch.
    pub fn note_scroll(&self, dy: f64) -> ScrollDirection {
        self.shared.scroll.lock().unwrap().note(dy)
    }

    pub fn scroll_direction(&self) -> ScrollDirection {
        self.shared.scroll.lock().unwrap().direction()
    }

    pub fn page_count(&self) -> usize {
        self.shared.page_count
    }

    /// The cached bitmap for `index`, if any.
    pub fn cached_page(&self, index: usize) -> Option<Arc<Bitmap>> {
        self.shared.cache.get(index)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.cache.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    /// Handle counters. Waits for the render lock.
    pub fn handle_stats(&self) -> HandleStats {
        self.shared
            .document
            .lock(JobPriority::Foreground)
            .handles
            .stats()
    }

    /// Pages with an open handle, ascending. Waits for the render lock.
    pub fn open_handles(&self) -> Vec<usize> {
        self.shared
            .document
            .lock(JobPriority::Foreground)
            .handles
            .resident_indices()
    }

    /// Render jobs queued or running.
    pub fn active_jobs(&self) -> usize {
        self.shared.jobs.lock().unwrap().renders.len()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Cancel all work, close every page handle and the document, and release
    /// all buffers. Outstanding requests are answered with
    /// [`RenderError::Cancelled`]. Later calls do nothing.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shared.drain_jobs();

        let workers = self.workers.lock().unwrap().take();
        if let Some(mut workers) = workers {
            workers.shutdown();
        }

        self.shared.release_document();
        tracing::info!(metrics = ?self.shared.metrics.snapshot(), "render engine closed");
    }
}

impl<B: DocumentBackend> Drop for RenderEngine<B> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<B: DocumentBackend> Shared<B> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn deliver(&self, callback: RenderCallback, result: PageResult) {
        self.context.post(Box::new(move || callback(result)));
    }

    fn deliver_size(&self, callback: DimensionsCallback, size: PageSize) {
        self.context.post(Box::new(move || callback(size)));
    }

    /// Cached bitmap for `index` rendered at the target's height.
    fn cached_for(&self, index: usize, target: TargetSize) -> Option<Arc<Bitmap>> {
        self.cache.get_matching(index, |bitmap| bitmap.height() == target.render_height())
    }

    /// Like [`cached_for`](Self::cached_for) without touching eviction order.
    fn cached_at(&self, index: usize, target: TargetSize) -> Option<Arc<Bitmap>> {
        let height = target.render_height();
        self.cache
            .peek(index)
            .filter(|bitmap| bitmap.height() == height)
    }

    fn request_page(&self, index: usize, target: TargetSize, callback: RenderCallback) {
        if self.is_closed() {
            callback(PageResult::failure(index, RenderError::ResourceClosed));
            return;
        }
        if index >= self.page_count {
            let page_count = self.page_count;
            let err = RenderError::OutOfRange { index, page_count };
            callback(PageResult::failure(index, err));
            return;
        }

        *self.last_target.lock().unwrap() = Some(target);

        if let Some(bitmap) = self.cached_for(index, target) {
            if self.config.debug_metrics {
                tracing::debug!(page = index, "cache hit");
            }
            self.deliver(callback, PageResult::success(index, bitmap));
            return;
        }

        let mut jobs = self.jobs.lock().unwrap();
        if self.is_closed() {
            drop(jobs);
            callback(PageResult::failure(index, RenderError::ResourceClosed));
            return;
        }

        // A render may have landed between the lookup above and taking the table.
        if let Some(bitmap) = self.cached_at(index, target) {
            drop(jobs);
            self.deliver(callback, PageResult::success(index, bitmap));
            return;
        }

        if let Some(active) = jobs.renders.get_mut(&index) {
            let joinable = active.callback.is_none()
                && active.target == target
                && !active.token.is_cancelled();
            if joinable {
                active.callback = Some(callback);
                active.foreground.store(true, Ordering::Release);
                let job_id = active.job_id;
                self.document.raise_demand();
                self.scheduler.promote(job_id);
                tracing::debug!(page = index, job_id, "request joined prefetch job");
                return;
            }
        }

        let superseded = jobs.renders.remove(&index).and_then(|old| {
            self.scheduler.cancel_job(old.job_id);
            if old.is_foreground() {
                self.document.lower_demand();
            }
            tracing::debug!(page = index, job_id = old.job_id, "render job superseded");
            old.callback
        });

        self.document.raise_demand();
        let kind = JobKind::render(index, target.width, target.height);
        let (job_id, token) = self.scheduler.submit(JobPriority::Foreground, kind);
        jobs.renders.insert(
            index,
            ActiveJob {
                job_id,
                token,
                target,
                foreground: Arc::new(AtomicBool::new(true)),
                callback: Some(callback),
            },
        );
        drop(jobs);

        if let Some(old_callback) = superseded {
            self.deliver(
                old_callback,
                PageResult::failure(index, RenderError::Superseded { index }),
            );
        }
    }

    fn get_page_dimensions(&self, index: usize, callback: DimensionsCallback) {
        if self.is_closed() || index >= self.page_count {
            callback(PageSize::UNKNOWN);
            return;
        }

        let known = self.dimensions.lock().unwrap().get(&index).copied();
        if let Some(size) = known {
            self.deliver_size(callback, size);
            return;
        }

        let mut jobs = self.jobs.lock().unwrap();
        if self.is_closed() {
            drop(jobs);
            callback(PageSize::UNKNOWN);
            return;
        }
        self.document.raise_demand();
        let kind = JobKind::Dimensions { page_index: index };
        let (job_id, _token) = self.scheduler.submit(JobPriority::Foreground, kind);
        jobs.dimensions.insert(job_id, (index, callback));
    }

    fn prefetch_at(
        &self,
        current: usize,
        direction: ScrollDirection,
        target: TargetSize,
    ) -> BTreeSet<usize> {
        if self.is_closed() {
            return BTreeSet::new();
        }

        let mut jobs = self.jobs.lock().unwrap();
        if self.is_closed() {
            return BTreeSet::new();
        }

        let cached = |page| self.cached_at(page, target).is_some();
        let planned = self
            .planner
            .plan_around(current, direction, self.page_count, cached);
        let mut enqueued = BTreeSet::new();
        for page in planned {
            if jobs.renders.contains_key(&page) {
                continue;
            }
            let kind = JobKind::render(page, target.width, target.height);
            let (job_id, token) = self.scheduler.submit(JobPriority::Prefetch, kind);
            jobs.renders.insert(
                page,
                ActiveJob {
                    job_id,
                    token,
                    target,
                    foreground: Arc::new(AtomicBool::new(false)),
                    callback: None,
                },
            );
            enqueued.insert(page);
        }

        if !enqueued.is_empty() {
            tracing::debug!(current, ?direction, pages = ?enqueued, "prefetch enqueued");
        }
        enqueued
    }

    fn execute(&self, job: &Job, token: &CancellationToken) {
        match job.kind {
            JobKind::Render {
                page_index,
                width,
                height,
            } => {
                self.run_render(job.id, page_index, TargetSize::new(width, height), token);
            }
            JobKind::Dimensions { page_index } => self.run_dimensions(job.id, page_index, token),
        }
    }

    fn run_render(
        &self,
        job_id: JobId,
        index: usize,
        target: TargetSize,
        token: &CancellationToken,
    ) {
        let foreground = {
            let jobs = self.jobs.lock().unwrap();
            match jobs.renders.get(&index) {
                Some(active) if active.job_id == job_id => active.foreground.clone(),
                _ => {
                    tracing::trace!(job_id, page = index, "render job no longer active");
                    return;
                }
            }
        };

        let outcome = match self.check_live(index, token) {
            Err(err) => Err(err),
            Ok(()) => match self.document.lock_or_yield(&foreground) {
                Some(mut document) => self.render(&mut document, index, target, token),
                None => {
                    self.requeue_render(job_id, index, target);
                    return;
                }
            },
        };
        self.finish_render(job_id, index, outcome);
    }

    /// Queue a prefetch job again under a new ID after it gave up the render
    /// lock to pending foreground work.
    fn requeue_render(&self, job_id: JobId, index: usize, target: TargetSize) {
        let mut jobs = self.jobs.lock().unwrap();
        if self.is_closed() {
            return;
        }
        let active = jobs.renders.get_mut(&index);
        let Some(active) = active.filter(|active| active.job_id == job_id) else {
            return;
        };

        let priority = if active.is_foreground() {
            JobPriority::Foreground
        } else {
            JobPriority::Prefetch
        };
        let kind = JobKind::render(index, target.width, target.height);
        let (requeued, token) = self.scheduler.submit(priority, kind);
        active.job_id = requeued;
        active.token = token;
        tracing::trace!(
            job_id,
            requeued,
            page = index,
            "render job yielded to foreground work"
        );
    }

    fn check_live(&self, index: usize, token: &CancellationToken) -> Result<(), RenderError> {
        if self.is_closed() {
            Err(RenderError::ResourceClosed)
        } else if token.is_cancelled() {
            Err(RenderError::Cancelled { index })
        } else {
            Ok(())
        }
    }

    fn render(
        &self,
        document: &mut DocumentState<B>,
        index: usize,
        target: TargetSize,
        token: &CancellationToken,
    ) -> Result<Rendered, RenderError> {
        self.check_live(index, token)?;

        let started = Instant::now();
        let DocumentState {
            backend,
            handles,
            open,
        } = document;
        if !*open {
            return Err(RenderError::ResourceClosed);
        }

        let size = guarded(|| {
            let page = handles.acquire(backend, index)?;
            Ok(backend.page_size(page))
        })
        .map_err(|source| RenderError::HandleOpenFailure { index, source })?;
        self.dimensions.lock().unwrap().insert(index, size);

        let height = target.render_height();
        let width = size.width_for_height(height);
        self.check_live(index, token)?;

        let mut bitmap = self.pool.acquire(width, height);
        let rendered = guarded(|| {
            let page = handles.acquire(backend, index)?;
            backend.render_page(page, &mut bitmap)
        });
        if let Err(source) = rendered {
            self.pool.release(bitmap);
            return Err(RenderError::RenderFailure { index, source });
        }

        Ok(Rendered {
            bitmap,
            elapsed: started.elapsed(),
        })
    }

    fn finish_render(&self, job_id: JobId, index: usize, outcome: Result<Rendered, RenderError>) {
        let mut jobs = self.jobs.lock().unwrap();
        let still_active = jobs.renders.get(&index).map(|active| active.job_id) == Some(job_id);
        let active = if still_active {
            jobs.renders.remove(&index)
        } else {
            None
        };
        let Some(mut active) = active else {
            drop(jobs);
            if let Ok(rendered) = outcome {
                self.pool.release(rendered.bitmap);
            }
            tracing::trace!(job_id, page = index, "discarded result of stale job");
            return;
        };

        let foreground = active.is_foreground();
        if foreground {
            self.document.lower_demand();
        }

        match outcome {
            Ok(Rendered { bitmap, elapsed }) => {
                let bitmap = Arc::new(bitmap);
                let released = self.cache.put(index, bitmap.clone());
                drop(jobs);

                for old in released {
                    self.pool.recycle(old);
                }
                self.metrics.record(index, elapsed);
                self.log_render(index, elapsed, foreground);

                if let Some(callback) = active.callback.take() {
                    self.deliver(callback, PageResult::success(index, bitmap));
                }
                if foreground && self.config.auto_prefetch {
                    let direction = self.scroll.lock().unwrap().direction();
                    self.prefetch_at(index, direction, active.target);
                }
            }
            Err(err) => {
                drop(jobs);
                match &err {
                    RenderError::Cancelled { .. } | RenderError::ResourceClosed => {
                        tracing::debug!(job_id, page = index, error = %err, "render job stopped");
                    }
                    _ => tracing::error!(job_id, page = index, error = %err, "render failed"),
                }
                if let Some(callback) = active.callback.take() {
                    self.deliver(callback, PageResult::failure(index, err));
                }
            }
        }
    }

    fn log_render(&self, index: usize, elapsed: Duration, foreground: bool) {
        if !self.config.debug_metrics {
            return;
        }
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        tracing::debug!(page = index, elapsed_ms, foreground, "page rendered");
        if elapsed > self.config.slow_render_threshold {
            tracing::warn!(
                page = index,
                elapsed_ms,
                threshold_ms = self.config.slow_render_threshold.as_millis() as u64,
                "slow page render"
            );
        }
    }

    fn run_dimensions(&self, job_id: JobId, index: usize, token: &CancellationToken) {
        let measured = self.measure(index, token);

        let entry = self.jobs.lock().unwrap().dimensions.remove(&job_id);
        let Some((_, callback)) = entry else {
            return;
        };
        self.document.lower_demand();

        match measured {
            Ok(size) => {
                self.dimensions.lock().unwrap().insert(index, size);
                self.deliver_size(callback, size);
            }
            Err(err) => {
                tracing::warn!(page = index, error = %err, "failed to read page size");
                self.deliver_size(callback, PageSize::UNKNOWN);
            }
        }
    }

    fn measure(&self, index: usize, token: &CancellationToken) -> Result<PageSize, RenderError> {
        self.check_live(index, token)?;
        let known = self.dimensions.lock().unwrap().get(&index).copied();
        if let Some(size) = known {
            return Ok(size);
        }

        let mut document = self.document.lock(JobPriority::Foreground);
        self.check_live(index, token)?;
        let DocumentState {
            backend,
            handles,
            open,
        } = &mut *document;
        if !*open {
            return Err(RenderError::ResourceClosed);
        }

        guarded(|| {
            let page = handles.acquire(backend, index)?;
            Ok(backend.page_size(page))
        })
        .map_err(|source| RenderError::HandleOpenFailure { index, source })
    }

    /// Empty the job table and the queue, answering every waiting caller.
    fn drain_jobs(&self) {
        let (renders, dimensions) = {
            let mut jobs = self.jobs.lock().unwrap();
            let renders = std::mem::take(&mut jobs.renders);
            let dimensions = std::mem::take(&mut jobs.dimensions);
            self.scheduler.clear();
            (renders, dimensions)
        };

        for (index, active) in renders {
            if active.is_foreground() {
                self.document.lower_demand();
            }
            if let Some(callback) = active.callback {
                self.deliver(
                    callback,
                    PageResult::failure(index, RenderError::Cancelled { index }),
                );
            }
        }
        for (_, callback) in dimensions.into_values() {
            self.document.lower_demand();
            self.deliver_size(callback, PageSize::UNKNOWN);
        }
    }

    fn release_document(&self) {
        {
            let mut document = self.document.lock(JobPriority::Foreground);
            let DocumentState {
                backend,
                handles,
                open,
            } = &mut *document;
            if *open {
                handles.close_all(backend);
                if let Err(err) = backend.close() {
                    tracing::warn!(error = %err, "failed to close document");
                }
                *open = false;
            }
        }

        for bitmap in self.cache.clear() {
            self.pool.recycle(bitmap);
        }
        self.pool.clear();
    }
}

/// Run a backend call, reporting a panic inside it as a backend error.
fn guarded<T>(call: impl FnOnce() -> Result<T, BackendError>) -> Result<T, BackendError> {
    panic::catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|payload| {
        let reason = panic_message(payload.as_ref());
        tracing::error!(reason, "backend panicked");
        Err(BackendError::Backend(format!("backend panicked: {reason}")))
    })
}
