//! Result types returned by a pipeline run.

use crate::error::PageError;
use serde::{Deserialize, Serialize};

/// Summary of one processed document.
///
/// Per-page failures live in `warnings`; a document that produced this value
/// was stored, even if some pages contributed nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub file_id: String,
    pub filename: Option<String>,
    pub total_pages: usize,
    pub chunks_produced: usize,
    /// Chunks written by the store (inserted + updated).
    pub chunks_added: usize,
    /// Of `chunks_added`, how many were new rows.
    pub chunks_inserted: usize,
    /// Of `chunks_added`, how many overwrote an existing `chunk_id`.
    pub chunks_updated: usize,
    /// Rows from an earlier run of a re-written page that no longer exist.
    #[serde(default)]
    pub chunks_removed: usize,
    pub warnings: Vec<PageWarning>,
    pub stats: PipelineStats,
}

impl PipelineResult {
    /// Pages that contributed text.
    pub fn pages_with_text(&self) -> usize {
        let lost = self.warnings.iter().filter(|w| w.error.drops_text()).count();
        self.total_pages.saturating_sub(lost)
    }

    /// 0-based indices of pages listed in `warnings`, sorted and deduplicated.
    pub fn warned_pages(&self) -> Vec<usize> {
        let mut pages: Vec<usize> = self.warnings.iter().map(|w| w.page_index).collect();
        pages.sort_unstable();
        pages.dedup();
        pages
    }
}

/// A page-level problem that did not fail the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageWarning {
    pub page_index: usize,
    pub error: PageError,
}

impl From<PageError> for PageWarning {
    fn from(error: PageError) -> Self {
        Self {
            page_index: error.page(),
            error,
        }
    }
}

/// Timing and call counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub split_duration_ms: u64,
    pub page_duration_ms: u64,
    pub embed_duration_ms: u64,
    pub store_duration_ms: u64,
    pub total_duration_ms: u64,
    /// Retries spent on external calls across all pages.
    pub external_retries: u32,
}
