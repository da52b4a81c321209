use folio_backend::testing::{sample_pdf_bytes, BackendProbe, RenderGate, ScriptedBackend};
use folio_core::{
    CacheStrategy, ConsumerLoop, EngineConfig, EngineError, HandleMode, ImmediateContext,
    PageResult, PageSize, QueuedContext, RenderEngine, RenderError, ScrollDirection, TargetSize,
};
use std::collections::BTreeSet;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(10);

fn target(height: u32) -> TargetSize {
    TargetSize::new(height, height)
}

fn quiet_config() -> EngineConfig {
    EngineConfig::default()
        .with_worker_threads(1)
        .with_auto_prefetch(false)
}

fn queued(
    backend: ScriptedBackend,
    config: EngineConfig,
) -> (RenderEngine<ScriptedBackend>, ConsumerLoop) {
    let (context, consumer) = QueuedContext::new();
    let engine = RenderEngine::with_backend(backend, Arc::new(context), config)
        .expect("engine should start");
    (engine, consumer)
}

/// Collects page results delivered on the consumer loop.
#[derive(Clone, Default)]
struct Results(Arc<Mutex<Vec<PageResult>>>);

impl Results {
    fn sink(&self) -> impl FnOnce(PageResult) + Send + 'static {
        let results = self.0.clone();
        move |result| results.lock().unwrap().push(result)
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    fn wait_for(&self, consumer: &ConsumerLoop, count: usize) {
        assert!(
            consumer.wait_for(TIMEOUT, || self.len() >= count),
            "expected {count} results, got {}",
            self.len()
        );
    }

    fn take(&self) -> Vec<PageResult> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}

fn wait_renders_started(probe: &BackendProbe, count: usize) {
    assert!(
        probe.wait_for_renders_started(count, TIMEOUT),
        "render {count} never started"
    );
}

#[test]
fn every_request_calls_back_exactly_once() {
    let backend = ScriptedBackend::new(10).with_render_delay(Duration::from_millis(1));
    let (engine, consumer) = queued(backend, EngineConfig::default().with_worker_threads(3));
    let results = Results::default();

    let requests = [0, 1, 1, 2, 5, 5, 5, 9, 3, 12, 4, 0];
    for page in requests {
        engine.request_page(page, target(100), results.sink());
    }

    results.wait_for(&consumer, requests.len());
    consumer.run_until(Instant::now() + Duration::from_millis(100));

    let results = results.take();
    assert_eq!(results.len(), requests.len());
    for page in [0, 1, 2, 3, 4, 5, 9] {
        let delivered = |r: &PageResult| r.page_index() == page && r.is_success();
        assert!(
            results.iter().any(delivered),
            "page {page} should have been delivered"
        );
    }
    let out_of_range = |r: &PageResult| {
        matches!(r.error(), Some(RenderError::OutOfRange { index: 12, .. }))
    };
    assert!(results.iter().any(out_of_range));
}

#[test]
fn out_of_range_fails_inline_without_backend_calls() {
    let backend = ScriptedBackend::new(3);
    let probe = backend.probe();
    let (engine, consumer) = queued(backend, quiet_config());
    let results = Results::default();

    engine.request_page(3, target(100), results.sink());

    // Delivered before request_page returned, not through the consumer loop.
    let delivered = results.take();
    assert_eq!(delivered.len(), 1);
    assert!(matches!(
        delivered[0].error(),
        Some(RenderError::OutOfRange {
            index: 3,
            page_count: 3,
        })
    ));
    assert_eq!(consumer.run_pending(), 0);
    assert_eq!(probe.opens(), 0);
    assert_eq!(probe.renders_started(), 0);
    assert_eq!(engine.active_jobs(), 0);
}

#[test]
fn requests_after_close_fail_inline() {
    let (engine, consumer) = queued(ScriptedBackend::new(3), quiet_config());
    engine.close();

    let results = Results::default();
    engine.request_page(0, target(100), results.sink());
    let delivered = results.take();
    assert!(matches!(delivered[0].error(), Some(RenderError::ResourceClosed)));

    let (tx, rx) = mpsc::channel();
    engine.get_page_dimensions(0, move |size| tx.send(size).unwrap());
    assert_eq!(rx.try_recv(), Ok(PageSize::UNKNOWN));

    let planned = engine.prefetch_at(1, ScrollDirection::None, target(100));
    assert!(planned.is_empty());
    assert_eq!(consumer.run_pending(), 0);
}

#[test]
fn at_most_one_handle_per_page_is_open() {
    let backend = ScriptedBackend::new(12).with_render_delay(Duration::from_micros(200));
    let probe = backend.probe();
    let config = EngineConfig::default()
        .with_worker_threads(4)
        .with_handle_capacity(2);
    let (engine, consumer) = queued(backend, config);
    let results = Results::default();

    let pages = [3, 7, 3, 0, 11, 7, 6, 6, 2, 9, 3, 10];
    for (i, page) in pages.iter().enumerate() {
        engine.note_scroll(if i % 3 == 0 { -1.0 } else { 1.0 });
        engine.request_page(*page, target(80 + (i as u32 % 2) * 40), results.sink());
    }
    results.wait_for(&consumer, pages.len());
    wait_until(|| engine.active_jobs() == 0);

    assert_eq!(probe.double_opens(), 0);
    assert!(engine.open_handles().len() <= 2);

    engine.close();
    assert_eq!(probe.open_now(), 0);
    assert_eq!(probe.opens(), probe.closes());
}

#[test]
fn cached_page_is_served_without_render_lock() {
    let gate = RenderGate::closed();
    let backend = ScriptedBackend::new(10).with_gate(gate.clone());
    let probe = backend.probe();
    let (engine, consumer) = queued(backend, quiet_config());
    let results = Results::default();

    engine.request_page(3, target(120), results.sink());
    gate.release();
    results.wait_for(&consumer, 1);

    // Park a prefetch render inside the backend while it holds the render lock.
    gate.hold();
    let planned = engine.prefetch_at(7, ScrollDirection::Forward, target(120));
    assert_eq!(planned, BTreeSet::from([8, 9]));
    wait_renders_started(&probe, 2);

    engine.request_page(3, target(120), results.sink());
    results.wait_for(&consumer, 2);

    let delivered = results.take();
    assert!(delivered.iter().all(PageResult::is_success));
    assert!(Arc::ptr_eq(
        delivered[0].bitmap().unwrap(),
        delivered[1].bitmap().unwrap()
    ));
    assert_eq!(probe.renders_of(3), 1);
    assert!(engine.cache_stats().hits >= 1);

    gate.release();
}

#[test]
fn rapid_requests_deliver_the_later_size_without_leaks() {
    let gate = RenderGate::closed();
    let backend = ScriptedBackend::new(5).with_gate(gate.clone());
    let probe = backend.probe();
    let (engine, consumer) = queued(backend, quiet_config());
    let results = Results::default();

    engine.request_page(2, target(100), results.sink());
    wait_renders_started(&probe, 1);
    engine.request_page(2, target(200), results.sink());
    gate.release();

    results.wait_for(&consumer, 2);
    wait_until(|| engine.active_jobs() == 0);

    let delivered = results.take();
    assert!(matches!(
        delivered[0].error(),
        Some(RenderError::Superseded { index: 2 })
    ));
    let bitmap = delivered[1].bitmap().expect("later request should succeed");
    assert_eq!(bitmap.height(), 200);
    assert_eq!(engine.cached_page(2).unwrap().height(), 200);

    // The superseded render went back to the pool.
    assert_eq!(
        engine.pool_stats().outstanding,
        engine.cache_stats().pages
    );
    assert_eq!(engine.pool_stats().pooled, 1);
}

#[test]
fn queued_request_superseded_before_it_runs() {
    let gate = RenderGate::closed();
    let backend = ScriptedBackend::new(5).with_gate(gate.clone());
    let probe = backend.probe();
    let (engine, consumer) = queued(backend, quiet_config());
    let results = Results::default();

    engine.request_page(0, target(50), results.sink());
    wait_renders_started(&probe, 1);
    engine.request_page(4, target(50), results.sink());
    engine.request_page(4, target(60), results.sink());
    gate.release();

    results.wait_for(&consumer, 3);
    wait_until(|| engine.active_jobs() == 0);

    assert_eq!(probe.renders_of(4), 1);
    let width = PageSize::new(612.0, 792.0).width_for_height(60);
    assert_eq!(probe.rendered().last(), Some(&(4, width, 60)));
    assert_eq!(
        engine.pool_stats().outstanding,
        engine.cache_stats().pages
    );
}

#[test]
fn foreground_waits_for_at_most_one_prefetch_decode() {
    let gate = RenderGate::closed();
    let backend = ScriptedBackend::new(10).with_gate(gate.clone());
    let probe = backend.probe();
    let config = EngineConfig::default()
        .with_worker_threads(3)
        .with_auto_prefetch(false);
    let (engine, consumer) = queued(backend, config);
    let results = Results::default();

    let planned = engine.prefetch_at(5, ScrollDirection::None, target(100));
    assert_eq!(planned, BTreeSet::from([3, 4, 6, 7]));
    wait_renders_started(&probe, 1);

    engine.request_page(9, target(100), results.sink());
    gate.release();
    results.wait_for(&consumer, 1);

    let rendered = probe.rendered();
    assert!(rendered.len() >= 2);
    assert_ne!(rendered[0].0, 9);
    assert_eq!(rendered[1].0, 9);

    wait_until(|| engine.active_jobs() == 0);
    assert_eq!(probe.renders(), 5);
}

#[test]
fn request_joins_matching_prefetch() {
    let gate = RenderGate::closed();
    let backend = ScriptedBackend::new(10).with_gate(gate.clone());
    let probe = backend.probe();
    let (engine, consumer) = queued(backend, quiet_config());
    let results = Results::default();

    engine.prefetch_at(5, ScrollDirection::Forward, target(90));
    wait_renders_started(&probe, 1);

    // Page 6 is rendering, page 7 is still queued; both requests join.
    engine.request_page(7, target(90), results.sink());
    engine.request_page(6, target(90), results.sink());
    assert_eq!(engine.active_jobs(), 2);
    gate.release();

    results.wait_for(&consumer, 2);
    let delivered = results.take();
    assert!(delivered.iter().all(PageResult::is_success));
    assert_eq!(probe.renders_of(6), 1);
    assert_eq!(probe.renders_of(7), 1);
    assert_eq!(probe.opens(), 2);
}

#[test]
fn request_with_other_size_replaces_prefetch() {
    let gate = RenderGate::closed();
    let backend = ScriptedBackend::new(10).with_gate(gate.clone());
    let probe = backend.probe();
    let (engine, consumer) = queued(backend, quiet_config());
    let results = Results::default();

    engine.request_page(0, target(40), results.sink());
    wait_renders_started(&probe, 1);
    engine.prefetch_at(0, ScrollDirection::Forward, target(40));
    engine.request_page(1, target(80), results.sink());
    gate.release();

    results.wait_for(&consumer, 2);
    wait_until(|| engine.active_jobs() == 0);

    let delivered = results.take();
    assert!(delivered.iter().all(PageResult::is_success));
    assert_eq!(engine.cached_page(1).unwrap().height(), 80);
    assert_eq!(probe.renders_of(1), 1);
}

#[test]
fn ten_page_scenario_prefetches_neighbors() {
    let backend = ScriptedBackend::new(10);
    let probe = backend.probe();
    let config = quiet_config().with_prefetch_distance(2);
    let (engine, consumer) = queued(backend, config);
    let results = Results::default();

    engine.request_page(5, target(100), results.sink());
    results.wait_for(&consumer, 1);
    assert!(engine.cached_page(5).is_some());

    assert_eq!(
        engine.prefetch(5, ScrollDirection::None),
        BTreeSet::from([3, 4, 6, 7])
    );

    engine.request_page(6, target(100), results.sink());
    results.wait_for(&consumer, 2);
    wait_until(|| engine.active_jobs() == 0);

    assert!(results.take().iter().all(PageResult::is_success));
    assert_eq!(probe.renders_of(6), 1);
    assert_eq!(probe.double_opens(), 0);
    assert_eq!(probe.opens(), 5);
    assert_eq!(engine.handle_stats().evicted, 0);
}

#[test]
fn foreground_render_prefetches_in_scroll_direction() {
    let backend = ScriptedBackend::new(10);
    let probe = backend.probe();
    let config = EngineConfig::default()
        .with_worker_threads(2)
        .with_prefetch_distance(2);
    let (engine, consumer) = queued(backend, config);
    let results = Results::default();

    assert_eq!(engine.note_scroll(24.0), ScrollDirection::Forward);
    engine.request_page(5, target(100), results.sink());
    results.wait_for(&consumer, 1);

    wait_until(|| probe.renders() == 3);
    wait_until(|| engine.active_jobs() == 0);

    let pages: BTreeSet<usize> = probe
        .rendered()
        .into_iter()
        .map(|(page, _, _)| page)
        .collect();
    assert_eq!(pages, BTreeSet::from([5, 6, 7]));
    assert_eq!(engine.cache_stats().pages, 3);
    assert_eq!(engine.metrics().pages_rendered, 3);
}

#[test]
fn close_cancels_outstanding_requests_once() {
    let gate = RenderGate::closed();
    let backend = ScriptedBackend::new(6).with_gate(gate.clone());
    let probe = backend.probe();
    let (engine, consumer) = queued(backend, quiet_config());
    let results = Results::default();

    engine.request_page(1, target(100), results.sink());
    engine.request_page(2, target(100), results.sink());
    wait_renders_started(&probe, 1);

    let releaser = {
        let gate = gate.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            gate.release();
        })
    };
    engine.close();
    engine.close();
    releaser.join().unwrap();

    results.wait_for(&consumer, 2);
    consumer.run_until(Instant::now() + Duration::from_millis(50));
    let delivered = results.take();
    assert_eq!(delivered.len(), 2);
    let cancelled = |r: &PageResult| matches!(r.error(), Some(RenderError::Cancelled { .. }));
    assert!(delivered.iter().all(cancelled));

    assert!(engine.is_closed());
    assert_eq!(probe.document_closes(), 1);
    assert_eq!(probe.open_now(), 0);
    assert_eq!(probe.opens(), probe.closes());
    assert_eq!(engine.pool_stats().outstanding, 0);
    assert_eq!(engine.pool_stats().pooled, 0);
    assert_eq!(engine.cache_stats().pages, 0);
}

#[test]
fn close_from_callback_does_not_deadlock() {
    let backend = ScriptedBackend::new(4);
    let probe = backend.probe();
    let config = EngineConfig::default().with_worker_threads(2);
    let engine = RenderEngine::with_backend(backend, Arc::new(ImmediateContext), config).unwrap();
    let engine = Arc::new(engine);
    let (tx, rx) = mpsc::channel();

    let inner = engine.clone();
    engine.request_page(0, target(64), move |result| {
        inner.close();
        tx.send(result.is_success()).unwrap();
    });

    assert_eq!(rx.recv_timeout(TIMEOUT), Ok(true));
    assert!(engine.is_closed());
    assert_eq!(probe.document_closes(), 1);
}

#[test]
fn single_handle_mode_keeps_one_page_open() {
    let backend = ScriptedBackend::new(6);
    let probe = backend.probe();
    let config = EngineConfig::default()
        .with_worker_threads(3)
        .with_handle_mode(HandleMode::SingleHandle);
    let (engine, consumer) = queued(backend, config);
    let results = Results::default();

    for page in 0..6 {
        engine.request_page(page, target(50), results.sink());
    }
    results.wait_for(&consumer, 6);
    wait_until(|| engine.active_jobs() == 0);

    assert_eq!(probe.max_open(), 1);
    assert_eq!(probe.double_opens(), 0);
    assert!(engine.open_handles().len() <= 1);
}

#[test]
fn failures_are_reported_and_engine_stays_usable() {
    let backend = ScriptedBackend::new(5).failing_open(1).failing_render(2);
    let (engine, consumer) = queued(backend, quiet_config());
    let results = Results::default();

    for page in [1, 2, 3] {
        engine.request_page(page, target(40), results.sink());
    }
    results.wait_for(&consumer, 3);

    let delivered = results.take();
    let by_page = |page: usize| delivered.iter().find(|r| r.page_index() == page).unwrap();
    assert!(matches!(
        by_page(1).error(),
        Some(RenderError::HandleOpenFailure { index: 1, .. })
    ));
    assert!(matches!(
        by_page(2).error(),
        Some(RenderError::RenderFailure { index: 2, .. })
    ));
    assert!(by_page(2).message().unwrap().contains("page 2"));
    assert!(by_page(3).is_success());

    assert_eq!(engine.metrics().pages_rendered, 1);
    assert_eq!(engine.handle_stats().open_failures, 1);
    assert_eq!(engine.pool_stats().outstanding, 1);
}

#[test]
fn backend_panics_fail_the_request_and_keep_the_worker() {
    let backend = ScriptedBackend::new(5)
        .panicking_render(1)
        .panicking_open(2);
    let (engine, consumer) = queued(backend, quiet_config());
    let results = Results::default();

    for page in [1, 2, 3] {
        engine.request_page(page, target(40), results.sink());
    }
    results.wait_for(&consumer, 3);

    let delivered = results.take();
    let by_page = |page: usize| delivered.iter().find(|r| r.page_index() == page).unwrap();
    assert!(matches!(
        by_page(1).error(),
        Some(RenderError::RenderFailure { index: 1, .. })
    ));
    assert!(by_page(1).message().unwrap().contains("panicked"));
    assert!(matches!(
        by_page(2).error(),
        Some(RenderError::HandleOpenFailure { index: 2, .. })
    ));
    assert!(by_page(3).is_success());

    wait_until(|| engine.active_jobs() == 0);
    assert_eq!(engine.pool_stats().outstanding, 1);

    let sizes = Arc::new(Mutex::new(Vec::new()));
    let sink = sizes.clone();
    engine.get_page_dimensions(2, move |size| sink.lock().unwrap().push(size));
    assert!(consumer.wait_for(TIMEOUT, || sizes.lock().unwrap().len() == 1));
    assert_eq!(sizes.lock().unwrap()[0], PageSize::UNKNOWN);
}

#[test]
fn single_worker_serves_requests_queued_behind_prefetch() {
    let backend = ScriptedBackend::new(40);
    let probe = backend.probe();
    let (engine, consumer) = queued(backend, quiet_config());
    let results = Results::default();

    // Each request lands while the only worker may already hold a prefetch job.
    for round in 0..100 {
        let size = target(30 + round as u32);
        engine.prefetch_at(round % 40, ScrollDirection::None, size);
        engine.request_page((round + 20) % 40, size, results.sink());
        results.wait_for(&consumer, round + 1);
    }

    assert!(results.take().iter().all(PageResult::is_success));
    wait_until(|| engine.active_jobs() == 0);
    assert_eq!(probe.double_opens(), 0);
    assert_eq!(
        engine.pool_stats().outstanding,
        engine.cache_stats().pages
    );
}

#[test]
fn memory_strategy_bounds_cached_pages() {
    let backend = ScriptedBackend::new(12);
    let config = quiet_config().with_cache_strategy(CacheStrategy::MaximizeMemory);
    let (engine, consumer) = queued(backend, config);
    let results = Results::default();

    for page in 0..12 {
        engine.request_page(page, target(32), results.sink());
        results.wait_for(&consumer, page + 1);
    }

    let stats = engine.cache_stats();
    assert_eq!(stats.pages, 8);
    assert_eq!(stats.evictions, 4);
    assert!(engine.cached_page(0).is_none());
    assert!(engine.cached_page(11).is_some());
}

#[test]
fn dimensions_keep_the_handle_warm() {
    let backend = ScriptedBackend::new(4).with_size_of(2, PageSize::new(300.0, 150.0));
    let probe = backend.probe();
    let (engine, consumer) = queued(backend, quiet_config());
    let sizes = Arc::new(Mutex::new(Vec::new()));

    let sink = sizes.clone();
    engine.get_page_dimensions(2, move |size| sink.lock().unwrap().push(size));
    assert!(consumer.wait_for(TIMEOUT, || sizes.lock().unwrap().len() == 1));
    assert_eq!(sizes.lock().unwrap()[0], PageSize::new(300.0, 150.0));

    let results = Results::default();
    engine.request_page(2, target(100), results.sink());
    results.wait_for(&consumer, 1);

    assert_eq!(results.take()[0].bitmap().unwrap().dimensions(), (200, 100));
    assert_eq!(probe.opens(), 1);
}

#[test]
fn open_document_renders_pdf_bytes() {
    let bytes = sample_pdf_bytes(3, 200.0, 100.0);
    let engine = RenderEngine::open_document(bytes, quiet_config())
        .expect("sample PDF should open");
    assert_eq!(engine.page_count(), 3);

    let (tx, rx) = mpsc::channel();
    engine.request_page(1, target(50), move |result| tx.send(result).unwrap());
    let result = rx.recv_timeout(TIMEOUT).unwrap();

    assert_eq!(result.page_index(), 1);
    assert_eq!(result.bitmap().unwrap().dimensions(), (100, 50));
    engine.close();
}

#[test]
fn open_document_rejects_garbage() {
    let result = RenderEngine::open_document(b"not a pdf".to_vec(), EngineConfig::default());
    assert!(matches!(result, Err(EngineError::Backend(_))));
}
