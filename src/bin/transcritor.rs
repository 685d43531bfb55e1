//! CLI binary for transcritor.
//!
//! A thin shim over the library crate: maps flags and environment variables
//! to `PipelineConfig` / `QueueConfig`, builds the store and providers, and
//! runs one of the subcommands.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use transcritor::pipeline::input::load_source;
use transcritor::server::create_router;
use transcritor::{
    MemoryVectorStore, Pipeline, PipelineConfig, PipelineObserver, PipelineStage, QueueConfig,
    RetryPolicy, TaskQueue, VectorStore,
};

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress observer using indicatif ────────────────────────────────────

/// Renders page progress for `transcritor process`. Pages complete out of
/// order, so every line names its page.
struct CliObserver {
    bar: ProgressBar,
    warnings: AtomicUsize,
}

impl CliObserver {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            warnings: AtomicUsize::new(0),
        })
    }
}

impl PipelineObserver for CliObserver {
    fn on_stage(&self, stage: PipelineStage) {
        match stage {
            PipelineStage::Splitting => self.bar.set_message("rendering pages…"),
            PipelineStage::Embedding | PipelineStage::Storing => {
                self.bar.set_prefix(stage.to_string());
                self.bar.set_message("");
            }
            PipelineStage::Done | PipelineStage::Failed => self.bar.finish_and_clear(),
            _ => {}
        }
    }

    fn on_pages_ready(&self, total_pages: usize) {
        self.bar.set_length(total_pages as u64);
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} pages  ⏱ {elapsed_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        self.bar.set_prefix("Transcribing");
    }

    fn on_page_complete(&self, page_index: usize, total_pages: usize, chunks: usize) {
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}",
            green("✓"),
            page_index + 1,
            total_pages,
            dim(&format!("{chunks:>3} chunks")),
        ));
        self.bar.inc(1);
    }

    fn on_page_warning(&self, page_index: usize, total_pages: usize, warning: &str) {
        self.warnings.fetch_add(1, Ordering::SeqCst);
        let msg: String = warning.chars().take(80).collect();
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}",
            red("✗"),
            page_index + 1,
            total_pages,
            red(&msg),
        ));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Create the pgvector table and index
  transcritor init-db

  # Run the HTTP API with two workers
  transcritor serve --bind 0.0.0.0:8000 --workers 2

  # Process one file inline and print the result as JSON
  transcritor process ficha.pdf

  # Query stored chunks
  transcritor search "diabetes" -k 5

ENVIRONMENT VARIABLES:
  DATABASE_URL            Postgres URL; without it an in-memory store is used
  OPENAI_API_KEY          OpenAI API key (vision + embeddings)
  ANTHROPIC_API_KEY       Anthropic API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Directory containing libpdfium
  RUST_LOG                Log filter, overrides --verbose / --quiet

  Every flag below can also be set through the TRANSCRITOR_* variable shown
  in its help text. A .env file in the working directory is loaded first.
"#;

/// Ingest handwritten medical PDFs into a vector store.
#[derive(Parser, Debug)]
#[command(
    name = "transcritor",
    version,
    about = "Ingest handwritten medical PDFs into a vector store",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "TRANSCRITOR_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "TRANSCRITOR_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API and the worker pool.
    Serve {
        /// Address to listen on.
        #[arg(long, env = "TRANSCRITOR_BIND", default_value = "0.0.0.0:8000")]
        bind: String,

        /// Number of worker loops.
        #[arg(long, env = "TRANSCRITOR_WORKERS", default_value_t = 2)]
        workers: usize,

        /// Task-level retries for transient and storage failures.
        #[arg(long, env = "TRANSCRITOR_TASK_MAX_RETRIES", default_value_t = 3)]
        task_max_retries: u32,

        /// Seconds a claimed job stays hidden from other workers.
        #[arg(long, env = "TRANSCRITOR_VISIBILITY_TIMEOUT", default_value_t = 1800)]
        visibility_timeout: u64,

        /// Seconds a finished task's status and result stay queryable.
        #[arg(long, env = "TRANSCRITOR_RESULT_TTL", default_value_t = 86400)]
        result_ttl: u64,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Process one local file or URL inline and print the result as JSON.
    Process {
        /// Local PDF file path or HTTP/HTTPS URL.
        input: String,

        /// Disable progress bar.
        #[arg(long, env = "TRANSCRITOR_NO_PROGRESS")]
        no_progress: bool,

        /// HTTP download timeout in seconds.
        #[arg(long, env = "TRANSCRITOR_DOWNLOAD_TIMEOUT", default_value_t = 120)]
        download_timeout: u64,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Create the extension, table and indexes (idempotent).
    InitDb {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Embed a query and print the nearest stored chunks as JSON.
    Search {
        query: String,

        /// Number of hits.
        #[arg(short, long, default_value_t = 5)]
        k: usize,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },
}

/// Flags shared by every subcommand that builds a pipeline.
#[derive(Args, Debug, Clone)]
struct PipelineArgs {
    /// Postgres connection URL. Without it an in-memory store is used.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Postgres pool size.
    #[arg(long, env = "TRANSCRITOR_DB_POOL_SIZE", default_value_t = 5)]
    db_pool_size: u32,

    /// Vision model ID (e.g. gpt-4.1-nano, gpt-4.1).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Directory containing the pdfium shared library.
    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib_path: Option<PathBuf>,

    /// Rendering DPI (72–600).
    #[arg(long, env = "TRANSCRITOR_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Pages of one document processed at once.
    #[arg(long, env = "TRANSCRITOR_PAGE_CONCURRENCY", default_value_t = 4)]
    page_concurrency: usize,

    /// Upper bound on outstanding extraction/parsing/embedding calls.
    #[arg(long, env = "TRANSCRITOR_MAX_EXTERNAL_CALLS", default_value_t = 8)]
    max_external_calls: usize,

    /// Per-call timeout for external capabilities, in seconds.
    #[arg(long, env = "TRANSCRITOR_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Retries per external call on transient failure.
    #[arg(long, env = "TRANSCRITOR_CALL_MAX_RETRIES", default_value_t = 3)]
    call_max_retries: u32,

    /// Median filter window (odd).
    #[arg(long, env = "TRANSCRITOR_MEDIAN_WINDOW", default_value_t = 3)]
    median_window: u32,

    /// CLAHE clip limit.
    #[arg(long, env = "TRANSCRITOR_CLAHE_CLIP", default_value_t = 2.0)]
    clahe_clip: f32,

    /// CLAHE tile grid size (tiles per side).
    #[arg(long, env = "TRANSCRITOR_CLAHE_TILES", default_value_t = 8)]
    clahe_tiles: u32,

    /// Sauvola window (odd).
    #[arg(long, env = "TRANSCRITOR_SAUVOLA_WINDOW", default_value_t = 15)]
    sauvola_window: u32,

    /// Sauvola k.
    #[arg(long, env = "TRANSCRITOR_SAUVOLA_K", default_value_t = 0.2)]
    sauvola_k: f32,

    /// Maximum chunk length in characters.
    #[arg(long, env = "TRANSCRITOR_CHUNK_SIZE", default_value_t = 1000)]
    chunk_size: usize,

    /// Overlap between consecutive chunks, in characters.
    #[arg(long, env = "TRANSCRITOR_CHUNK_OVERLAP", default_value_t = 200)]
    chunk_overlap: usize,

    /// Expected embedding vector length.
    #[arg(long, env = "TRANSCRITOR_EMBEDDING_DIMENSION", default_value_t = 1536)]
    embedding_dimension: usize,

    /// Chunk texts per embedding request.
    #[arg(long, env = "TRANSCRITOR_EMBEDDING_BATCH_SIZE", default_value_t = 32)]
    embedding_batch_size: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Missing .env is fine; variables may come from the environment.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // `process` shows a progress bar, so library INFO logs are suppressed
    // there unless --verbose is given.
    let show_progress = matches!(&cli.command, Command::Process { no_progress, .. } if !no_progress) && !cli.quiet;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Serve {
            bind,
            workers,
            task_max_retries,
            visibility_timeout,
            result_ttl,
            pipeline,
        } => {
            let queue_config = QueueConfig {
                workers,
                retry: RetryPolicy {
                    max_retries: task_max_retries,
                    ..QueueConfig::default().retry
                },
                visibility_timeout_secs: visibility_timeout,
                result_ttl_secs: result_ttl,
                ..QueueConfig::default()
            };
            serve(&bind, queue_config, &pipeline).await
        }
        Command::Process {
            input,
            no_progress,
            download_timeout,
            pipeline,
        } => process(&input, download_timeout, !no_progress && !cli.quiet, &pipeline).await,
        Command::InitDb { pipeline } => init_db(&pipeline).await,
        Command::Search { query, k, pipeline } => search(&query, k, &pipeline).await,
    }
}

// ── Subcommands ──────────────────────────────────────────────────────────────

async fn serve(bind: &str, queue_config: QueueConfig, args: &PipelineArgs) -> Result<()> {
    let pipeline = Arc::new(build_pipeline(args).await?);
    let queue = Arc::new(TaskQueue::new(pipeline, queue_config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = queue.spawn_workers(shutdown_rx);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!("Listening on {}", bind);

    axum::serve(listener, create_router(Arc::clone(&queue)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}

async fn process(input: &str, download_timeout: u64, show_progress: bool, args: &PipelineArgs) -> Result<()> {
    let document = load_source(input, download_timeout)
        .await
        .with_context(|| format!("Failed to load '{input}'"))?;

    let mut pipeline = build_pipeline(args).await?;
    if show_progress {
        let observer = CliObserver::new();
        pipeline = pipeline.with_observer(observer as Arc<dyn PipelineObserver>);
    }

    let result = pipeline.process(&document).await.context("Processing failed")?;

    if show_progress {
        let warned = result.warnings.len();
        eprintln!(
            "{} {} pages → {} chunks stored ({} new, {} updated){}",
            green("✔"),
            bold(&result.total_pages.to_string()),
            bold(&result.chunks_added.to_string()),
            result.chunks_inserted,
            result.chunks_updated,
            if warned > 0 {
                red(&format!("  {warned} warnings"))
            } else {
                String::new()
            }
        );
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to serialize result")?
    );
    Ok(())
}

async fn init_db(args: &PipelineArgs) -> Result<()> {
    if args.database_url.is_none() {
        bail!("init-db needs DATABASE_URL (or --database-url)");
    }
    let store = build_store(args).await?;
    store.ensure_schema().await.context("Schema creation failed")?;
    eprintln!("{} schema ready (vector({}))", green("✔"), args.embedding_dimension);
    Ok(())
}

async fn search(query: &str, k: usize, args: &PipelineArgs) -> Result<()> {
    let pipeline = build_pipeline(args).await?;
    let hits = pipeline.search(query, k).await.context("Search failed")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&hits).context("Failed to serialize hits")?
    );
    Ok(())
}

// ── Construction ─────────────────────────────────────────────────────────────

fn build_config(args: &PipelineArgs) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .dpi(args.dpi)
        .page_concurrency(args.page_concurrency)
        .max_external_calls(args.max_external_calls)
        .api_timeout_secs(args.api_timeout)
        .call_retry(RetryPolicy {
            max_retries: args.call_max_retries,
            ..RetryPolicy::default()
        })
        .median_window(args.median_window)
        .clahe(args.clahe_clip, args.clahe_tiles)
        .sauvola(args.sauvola_window, args.sauvola_k)
        .chunk_size(args.chunk_size)
        .chunk_overlap(args.chunk_overlap)
        .embedding_dimension(args.embedding_dimension)
        .embedding_batch_size(args.embedding_batch_size);

    if let Some(ref model) = args.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = args.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(ref path) = args.pdfium_lib_path {
        builder = builder.pdfium_lib_path(path.clone());
    }
    builder.build().context("Invalid configuration")
}

async fn build_store(args: &PipelineArgs) -> Result<Arc<dyn VectorStore>> {
    match args.database_url {
        #[cfg(feature = "postgres")]
        Some(ref url) => {
            let store = transcritor::PgVectorStore::connect(url, args.db_pool_size, args.embedding_dimension)
                .await
                .context("Failed to connect to Postgres")?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => bail!("DATABASE_URL is set but this binary was built without the `postgres` feature"),
        None => {
            warn!("DATABASE_URL not set; using an in-memory store (nothing persists)");
            Ok(Arc::new(MemoryVectorStore::new(args.embedding_dimension)))
        }
    }
}

async fn build_pipeline(args: &PipelineArgs) -> Result<Pipeline> {
    let config = build_config(args)?;
    let store = build_store(args).await?;
    store.ensure_schema().await.context("Schema creation failed")?;
    Pipeline::from_env(config, store).context("Failed to initialise pipeline")
}
