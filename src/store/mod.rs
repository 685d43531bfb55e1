//! Vector storage for embedded chunks.
//!
//! The store is the only durable state the pipeline writes, and `chunk_id`
//! is its primary key. Every write is an upsert, which is what makes
//! re-running a document (after a crash or a redelivered job) safe: the
//! second run overwrites the rows of the first instead of adding to them.
//!
//! Implementations:
//! * [`memory::MemoryVectorStore`]: process-local, same semantics, for tests
//!   and single-process dev runs.
//! * [`postgres::PgVectorStore`] (feature `postgres`): pgvector with an HNSW
//!   cosine index.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::error::StoreError;
use crate::model::EmbeddedChunk;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};

pub use memory::MemoryVectorStore;
#[cfg(feature = "postgres")]
pub use postgres::PgVectorStore;

/// Row counts from one document upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
    /// Rows of re-written pages that the new chunk set no longer contains.
    #[serde(default)]
    pub removed: usize,
}

impl UpsertOutcome {
    /// Rows written, new or overwritten.
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// A chunk as it is stored, without its vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub chunk_id: String,
    pub file_id: String,
    pub page_index: usize,
    pub char_offset: usize,
    pub text: String,
    pub metadata: Value,
}

/// One nearest-neighbour result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk: StoredChunk,
    /// Cosine similarity in `[-1, 1]`; higher is closer.
    pub score: f32,
}

/// Durable, idempotent chunk storage with similarity search.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create extension, table and indexes if missing. Safe to call repeatedly.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Upsert all chunks of one document in a single transaction.
    ///
    /// Either every chunk is written or none is. Existing rows with the same
    /// `chunk_id` are overwritten (text, metadata and vector). For every page
    /// present in `chunks`, rows of that page whose id is not in `chunks` are
    /// deleted in the same transaction; rows of pages absent from `chunks`
    /// (a page that failed this run) are left alone.
    async fn upsert_document(
        &self,
        file_id: &str,
        chunks: &[EmbeddedChunk],
    ) -> Result<UpsertOutcome, StoreError>;

    /// Top-`k` chunks by cosine similarity to `embedding`.
    async fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<SearchHit>, StoreError>;

    /// Total number of stored chunks.
    async fn count(&self) -> Result<usize, StoreError>;

    /// Chunks of one document, ordered by page then offset.
    async fn chunks_for_file(&self, file_id: &str) -> Result<Vec<StoredChunk>, StoreError>;

    /// Chunk ids of one document, ordered by page then offset.
    async fn chunk_ids_for_file(&self, file_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .chunks_for_file(file_id)
            .await?
            .into_iter()
            .map(|c| c.chunk_id)
            .collect())
    }
}

/// Pages touched by `chunks` and the ids they now consist of.
pub(crate) fn page_set(chunks: &[EmbeddedChunk]) -> (BTreeSet<usize>, HashSet<&str>) {
    let pages = chunks.iter().map(|c| c.chunk().page_index).collect();
    let ids = chunks.iter().map(|c| c.chunk_id()).collect();
    (pages, ids)
}

/// Reject any vector whose length differs from the store's column.
pub(crate) fn check_dimensions(chunks: &[EmbeddedChunk], dimension: usize) -> Result<(), StoreError> {
    for c in chunks {
        if c.embedding().len() != dimension {
            return Err(StoreError::Dimension {
                chunk_id: c.chunk_id().to_string(),
                expected: dimension,
                actual: c.embedding().len(),
            });
        }
    }
    Ok(())
}
