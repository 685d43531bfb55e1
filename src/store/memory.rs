//! In-process [`VectorStore`] with the same upsert semantics as Postgres.

use super::{check_dimensions, page_set, SearchHit, StoredChunk, UpsertOutcome, VectorStore};
use crate::error::StoreError;
use crate::model::EmbeddedChunk;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct Row {
    chunk: StoredChunk,
    embedding: Vec<f32>,
}

/// `HashMap` keyed by `chunk_id`, guarded by a mutex.
///
/// A document upsert validates every chunk first and then applies all rows
/// under one lock acquisition, so readers never see half a document.
#[derive(Debug)]
pub struct MemoryVectorStore {
    dimension: usize,
    rows: Mutex<HashMap<String, Row>>,
}

impl MemoryVectorStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            rows: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Row>>, StoreError> {
        self.rows
            .lock()
            .map_err(|_| StoreError::Connection("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert_document(
        &self,
        file_id: &str,
        chunks: &[EmbeddedChunk],
    ) -> Result<UpsertOutcome, StoreError> {
        check_dimensions(chunks, self.dimension)?;

        let (pages, ids) = page_set(chunks);
        let mut rows = self.lock()?;
        let mut outcome = UpsertOutcome::default();

        let before = rows.len();
        rows.retain(|id, row| {
            row.chunk.file_id != file_id
                || !pages.contains(&row.chunk.page_index)
                || ids.contains(id.as_str())
        });
        outcome.removed = before - rows.len();

        for c in chunks {
            let chunk = c.chunk();
            let row = Row {
                chunk: StoredChunk {
                    chunk_id: chunk.chunk_id.clone(),
                    file_id: file_id.to_string(),
                    page_index: chunk.page_index,
                    char_offset: chunk.char_offset,
                    text: chunk.text.clone(),
                    metadata: chunk.metadata.clone(),
                },
                embedding: c.embedding().to_vec(),
            };
            if rows.insert(chunk.chunk_id.clone(), row).is_some() {
                outcome.updated += 1;
            } else {
                outcome.inserted += 1;
            }
        }
        Ok(outcome)
    }

    async fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<SearchHit>, StoreError> {
        let rows = self.lock()?;
        let mut hits: Vec<SearchHit> = rows
            .values()
            .map(|row| SearchHit {
                chunk: row.chunk.clone(),
                score: cosine_similarity(embedding, &row.embedding),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.len())
    }

    async fn chunks_for_file(&self, file_id: &str) -> Result<Vec<StoredChunk>, StoreError> {
        let rows = self.lock()?;
        let mut chunks: Vec<StoredChunk> = rows
            .values()
            .filter(|r| r.chunk.file_id == file_id)
            .map(|r| r.chunk.clone())
            .collect();
        chunks.sort_by_key(|c| (c.page_index, c.char_offset));
        Ok(chunks)
    }
}

/// Cosine similarity; `0.0` when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}
