//! Observer trait for pipeline stage and per-page events.
//!
//! Pass an [`Arc<dyn PipelineObserver>`] to
//! [`crate::orchestrator::Pipeline::with_observer`] to receive events as a
//! document moves through its stages. The CLI renders them as a progress
//! bar; the worker pool uses the default no-op.
//!
//! Callers may forward events anywhere (a channel, a task record, a
//! terminal). The trait is `Send + Sync` because pages are processed
//! concurrently.
//!
//! # Example
//!
//! ```rust
//! use transcritor::{PipelineObserver, PipelineStage};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountingObserver {
//!     pages_done: AtomicUsize,
//! }
//!
//! impl PipelineObserver for CountingObserver {
//!     fn on_page_complete(&self, page_index: usize, total_pages: usize, chunks: usize) {
//!         let done = self.pages_done.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("page {} ({}/{}) → {} chunks", page_index, done, total_pages, chunks);
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Stages of one document run.
///
/// ```text
/// Splitting ─▶ [Preprocessing ─▶ Extracting ─▶ Parsing ─▶ Formatting] per page
///           ─▶ Embedding ─▶ Storing ─▶ Done
///
/// any stage ──(document-level error)──▶ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Splitting,
    Preprocessing,
    Extracting,
    Parsing,
    Formatting,
    Embedding,
    Storing,
    Done,
    Failed,
}

impl PipelineStage {
    /// Stages that run once per page rather than once per document.
    pub fn is_per_page(self) -> bool {
        matches!(
            self,
            PipelineStage::Preprocessing
                | PipelineStage::Extracting
                | PipelineStage::Parsing
                | PipelineStage::Formatting
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineStage::Done | PipelineStage::Failed)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStage::Splitting => "SPLITTING",
            PipelineStage::Preprocessing => "PREPROCESSING",
            PipelineStage::Extracting => "EXTRACTING",
            PipelineStage::Parsing => "PARSING",
            PipelineStage::Formatting => "FORMATTING",
            PipelineStage::Embedding => "EMBEDDING",
            PipelineStage::Storing => "STORING",
            PipelineStage::Done => "DONE",
            PipelineStage::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Called by the pipeline as it processes a document.
///
/// All methods have default no-op implementations so observers only
/// override what they care about. Per-page methods may be called
/// concurrently from different tasks.
pub trait PipelineObserver: Send + Sync {
    /// A document-level stage begins (`Splitting`, `Embedding`, `Storing`,
    /// `Done`, `Failed`).
    fn on_stage(&self, stage: PipelineStage) {
        let _ = stage;
    }

    /// The split produced `total_pages` pages.
    fn on_pages_ready(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// A page entered one of its per-page stages.
    fn on_page_stage(&self, page_index: usize, stage: PipelineStage) {
        let _ = (page_index, stage);
    }

    /// A page finished and produced `chunks` chunks.
    fn on_page_complete(&self, page_index: usize, total_pages: usize, chunks: usize) {
        let _ = (page_index, total_pages, chunks);
    }

    /// A page produced a warning (it may still have produced chunks).
    fn on_page_warning(&self, page_index: usize, total_pages: usize, warning: &str) {
        let _ = (page_index, total_pages, warning);
    }
}

/// Observer that ignores every event. The default.
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Convenience alias for the shared observer handle.
pub type SharedObserver = Arc<dyn PipelineObserver>;
