//! # transcritor
//!
//! Turn scanned, handwritten medical PDFs into embedded, retrieval-ready
//! text chunks stored in a vector database.
//!
//! ## Why this crate?
//!
//! Handwritten clinical forms defeat classic OCR: faint pen strokes, stamps,
//! scanner noise and uneven lighting come out as garbage. This crate restores
//! each page image first (grayscale, median denoise, CLAHE, Sauvola
//! binarisation), lets a vision model transcribe it, extracts the handful of
//! structured fields downstream search needs, and stores overlapping chunks
//! with their embeddings under deterministic ids, so re-processing a
//! document updates rows instead of duplicating them.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Split       rasterise pages via pdfium (CPU-bound, spawn_blocking)
//!  ├─ 2. Restore     grayscale → median → CLAHE → Sauvola
//!  ├─ 3. Transcribe  vision model, one call per page
//!  ├─ 4. Parse       client name, date, signature, illness mentions
//!  ├─ 5. Chunk       overlapping chunks, id = f(file_id, page, chunk index)
//!  ├─ 6. Embed       batched, fixed dimension
//!  └─ 7. Store       one upsert transaction per document
//! ```
//!
//! Steps 2–5 run concurrently across pages; every external call shares one
//! limiter, per-call timeout and retry policy. A bad page becomes a warning
//! on the [`PipelineResult`]; the document fails only when nothing usable
//! is left or storage fails.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use transcritor::{MemoryVectorStore, Pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Providers auto-detected from OPENAI_API_KEY / EDGEQUAKE_LLM_PROVIDER / …
//!     let config = PipelineConfig::default();
//!     let store = Arc::new(MemoryVectorStore::new(config.embedding_dimension));
//!     let pipeline = Pipeline::from_env(config, store)?;
//!
//!     let bytes = std::fs::read("ficha.pdf")?;
//!     let result = pipeline.process_pdf_pipeline(bytes).await?;
//!     eprintln!("{} pages → {} chunks stored ({} warnings)",
//!         result.total_pages, result.chunks_added, result.warnings.len());
//!     Ok(())
//! }
//! ```
//!
//! For asynchronous acceptance wrap the pipeline in a [`TaskQueue`]:
//! `enqueue` returns a task id at once and worker loops do the processing.
//!
//! ## Feature Flags
//!
//! | Feature    | Default | Description |
//! |------------|---------|-------------|
//! | `cli`      | on      | `transcritor` binary and axum HTTP surface (clap + anyhow + tracing-subscriber) |
//! | `postgres` | on      | `PgVectorStore` over sqlx + pgvector |
//!
//! Disable both when embedding only the library with your own store:
//! ```toml
//! transcritor = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod calls;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod providers;
pub mod queue;
pub mod retry;
#[cfg(feature = "cli")]
pub mod server;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ChunkConfig, PipelineConfig, PipelineConfigBuilder, PreprocessConfig, QueueConfig};
pub use error::{ErrorClass, ExternalError, PageError, PipelineError, QueueError, StoreError};
pub use model::{Chunk, EmbeddedChunk, Extracted, ParsedInfo, SourceDocument};
pub use orchestrator::{Capabilities, Pipeline};
pub use output::{PageWarning, PipelineResult, PipelineStats};
pub use progress::{NoopObserver, PipelineObserver, PipelineStage};
pub use queue::{Task, TaskQueue, TaskStatus};
pub use retry::RetryPolicy;
#[cfg(feature = "postgres")]
pub use store::PgVectorStore;
pub use store::{MemoryVectorStore, SearchHit, UpsertOutcome, VectorStore};
