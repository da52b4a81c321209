use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use folio_core::{
    Bitmap, CacheStrategy, EngineConfig, LopdfBackend, PageResult, PageSize, RenderEngine,
    TargetSize,
};
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// How long `scroll` waits for background prefetch before reporting.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "folio-cli")]
#[command(about = "Folio page rendering engine CLI")]
pub struct Cli {
    /// Log engine activity to stderr (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Engine configuration file (TOML). Defaults to FOLIO_* environment variables.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print machine-readable PDF metadata.
    Info {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Render one page through the engine into a PNG.
    Render {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 600)]
        width: u32,
        #[arg(long, default_value_t = 800)]
        height: u32,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Request a range of pages like a scrolling reader and report engine statistics.
    Scroll {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long, default_value_t = 600)]
        width: u32,
        #[arg(long, default_value_t = 800)]
        height: u32,
        #[arg(long)]
        prefetch_distance: Option<usize>,
        /// `memory` or `performance`
        #[arg(long)]
        strategy: Option<CacheStrategy>,
        /// First page (1-based)
        #[arg(long, default_value_t = 1)]
        from: usize,
        /// Last page (1-based, inclusive); defaults to the last page
        #[arg(long)]
        to: Option<usize>,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Serialize)]
struct InfoOutput {
    path: String,
    page_count: usize,
    first_page_size_pt: Option<PageSizeOutput>,
}

#[derive(Debug, Serialize)]
struct PageSizeOutput {
    width: f32,
    height: f32,
}

#[derive(Debug, Serialize)]
struct ScrollReport {
    path: String,
    strategy: String,
    prefetch_distance: usize,
    pages_requested: usize,
    pages_delivered: usize,
    failures: Vec<String>,
    metrics: MetricsOutput,
    cache: CacheOutput,
    pool: PoolOutput,
    handles: HandleOutput,
}

#[derive(Debug, Serialize)]
struct MetricsOutput {
    pages_rendered: u64,
    total_ms: f64,
    average_ms: f64,
    /// 1-based, like the page arguments
    slowest_page: Option<usize>,
    slowest_ms: f64,
}

#[derive(Debug, Serialize)]
struct CacheOutput {
    pages: usize,
    memory_used: usize,
    memory_limit: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    hit_rate: f64,
}

#[derive(Debug, Serialize)]
struct PoolOutput {
    allocated: u64,
    reused: u64,
    released: u64,
    dropped: u64,
    pooled: usize,
    outstanding: usize,
}

#[derive(Debug, Serialize)]
struct HandleOutput {
    opened: u64,
    closed: u64,
    evicted: u64,
    open_failures: u64,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    init_logging(cli.verbose);

    match cli.command {
        Commands::Info { file } => run_info(&file, cli.config.as_deref()),
        Commands::Render {
            file,
            page,
            width,
            height,
            output,
        } => {
            let target = TargetSize::new(width, height);
            run_render(&file, cli.config.as_deref(), page, target, output.as_deref())
        }
        Commands::Scroll {
            file,
            width,
            height,
            prefetch_distance,
            strategy,
            from,
            to,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(distance) = prefetch_distance {
                config = config.with_prefetch_distance(distance);
            }
            if let Some(strategy) = strategy {
                config = config.with_cache_strategy(strategy);
            }
            run_scroll(&file, config, TargetSize::new(width, height), from, to)
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // A subscriber may already be installed when `run` is called more than once.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => EngineConfig::from_env().context("invalid FOLIO_* environment configuration"),
    }
}

fn open_engine(file: &Path, config: EngineConfig) -> Result<RenderEngine<LopdfBackend>> {
    RenderEngine::open_document(file, config).context("failed to open PDF")
}

fn run_info(file: &Path, config_path: Option<&Path>) -> Result<()> {
    ensure_pdf_exists(file)?;
    let config = load_config(config_path)?
        .with_worker_threads(1)
        .with_auto_prefetch(false);
    let engine = open_engine(file, config)?;

    let page_count = engine.page_count();
    let first_page_size_pt = if page_count > 0 {
        let size = page_dimensions(&engine, 0)?;
        Some(PageSizeOutput {
            width: size.width_pt,
            height: size.height_pt,
        })
    } else {
        None
    };

    let payload = InfoOutput {
        path: file.display().to_string(),
        page_count,
        first_page_size_pt,
    };

    let json = serde_json::to_string_pretty(&payload)?;
    println!("{json}");

    engine.close();

    Ok(())
}

fn run_render(
    file: &Path,
    config_path: Option<&Path>,
    page: usize,
    target: TargetSize,
    output: Option<&Path>,
) -> Result<()> {
    ensure_pdf_exists(file)?;

    if page == 0 {
        anyhow::bail!("--page is 1-based and must be >= 1");
    }

    let config = load_config(config_path)?.with_auto_prefetch(false);
    let engine = open_engine(file, config)?;
    let page_count = engine.page_count();
    if page > page_count {
        anyhow::bail!("page {page} is out of range (document has {page_count} pages)");
    }

    let result = request_and_wait(&engine, page - 1, target)?;
    let bitmap = result
        .into_result()
        .with_context(|| format!("failed to render page {page}"))?;

    let output = output
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| default_render_output(file, page));
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    to_image(&bitmap)?
        .save(&output)
        .with_context(|| format!("failed to write image to {}", output.display()))?;

    println!("{}", output.display());

    engine.close();

    Ok(())
}

fn run_scroll(
    file: &Path,
    config: EngineConfig,
    target: TargetSize,
    from: usize,
    to: Option<usize>,
) -> Result<()> {
    ensure_pdf_exists(file)?;

    if from == 0 {
        anyhow::bail!("--from is 1-based and must be >= 1");
    }

    let strategy = config.cache_strategy;
    let prefetch_distance = config.prefetch_distance;
    let engine = open_engine(file, config)?;
    let page_count = engine.page_count();
    let to = to.unwrap_or(page_count).min(page_count);

    let mut pages_requested = 0;
    let mut pages_delivered = 0;
    let mut failures = Vec::new();

    for page in from..=to {
        engine.note_scroll(1.0);
        let result = request_and_wait(&engine, page - 1, target)?;
        pages_requested += 1;

        match result.message() {
            None => pages_delivered += 1,
            Some(message) => {
                tracing::warn!(page, %message, "page request failed");
                failures.push(format!("page {page}: {message}"));
            }
        }
    }

    wait_for_idle(&engine);

    let metrics = engine.metrics();
    let cache = engine.cache_stats();
    let pool = engine.pool_stats();
    let handles = engine.handle_stats();

    let report = ScrollReport {
        path: file.display().to_string(),
        strategy: strategy.to_string(),
        prefetch_distance,
        pages_requested,
        pages_delivered,
        failures,
        metrics: MetricsOutput {
            pages_rendered: metrics.pages_rendered,
            total_ms: millis(metrics.total_time),
            average_ms: millis(metrics.average()),
            slowest_page: metrics.slowest_page.map(|index| index + 1),
            slowest_ms: millis(metrics.slowest_time),
        },
        cache: CacheOutput {
            pages: cache.pages,
            memory_used: cache.memory_used,
            memory_limit: cache.memory_limit,
            hits: cache.hits,
            misses: cache.misses,
            evictions: cache.evictions,
            hit_rate: cache.hit_rate(),
        },
        pool: PoolOutput {
            allocated: pool.allocated,
            reused: pool.reused,
            released: pool.released,
            dropped: pool.dropped,
            pooled: pool.pooled,
            outstanding: pool.outstanding,
        },
        handles: HandleOutput {
            opened: handles.opened,
            closed: handles.closed,
            evicted: handles.evicted,
            open_failures: handles.open_failures,
        },
    };

    let json = serde_json::to_string_pretty(&report)?;
    println!("{json}");

    engine.close();

    Ok(())
}

fn request_and_wait(
    engine: &RenderEngine<LopdfBackend>,
    index: usize,
    target: TargetSize,
) -> Result<PageResult> {
    let (tx, rx) = mpsc::channel();
    engine.request_page(index, target, move |result| {
        let _ = tx.send(result);
    });
    rx.recv().context("render engine stopped before answering")
}

fn page_dimensions(engine: &RenderEngine<LopdfBackend>, index: usize) -> Result<PageSize> {
    let (tx, rx) = mpsc::channel();
    engine.get_page_dimensions(index, move |size| {
        let _ = tx.send(size);
    });
    rx.recv().context("render engine stopped before answering")
}

/// Let queued prefetch work finish so the report reflects it.
fn wait_for_idle(engine: &RenderEngine<LopdfBackend>) {
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    while engine.active_jobs() > 0 {
        if Instant::now() >= deadline {
            tracing::warn!(
                active = engine.active_jobs(),
                "prefetch still running, reporting anyway"
            );
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn to_image(bitmap: &Bitmap) -> Result<image::RgbaImage> {
    image::RgbaImage::from_raw(bitmap.width(), bitmap.height(), bitmap.pixels().to_vec())
        .context("rendered bitmap has an unexpected length")
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn ensure_pdf_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("file does not exist: {}", path.display());
    }

    if !path.is_file() {
        anyhow::bail!("path is not a file: {}", path.display());
    }

    Ok(())
}

fn default_render_output(file: &Path, page: usize) -> PathBuf {
    let stem = file
        .file_stem()
        .and_then(|name| name.to_str())
        .unwrap_or("page");

    file.with_file_name(format!("{stem}-page-{page}.png"))
}
