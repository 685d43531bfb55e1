//! Embedding generation: chunk text → fixed-dimension vectors.
//!
//! ## Batching and attribution
//!
//! Chunks are sent in batches of [`crate::config::PipelineConfig::embedding_batch_size`]
//! texts. When a batch fails after its retries, each of its chunks is
//! retried on its own so the error names exactly the chunks that could not
//! be embedded, not the whole batch.
//!
//! ## Dimension check
//!
//! Every returned vector must have exactly the configured length. A wrong
//! length is a configuration error (model and column disagree), so it fails
//! the document immediately; vectors are never truncated or padded.

use crate::calls::ExternalCalls;
use crate::error::{ExternalError, PipelineError};
use crate::model::{Chunk, EmbeddedChunk};
use async_trait::async_trait;
use edgequake_llm::EmbeddingProvider;
use std::sync::Arc;
use tracing::{debug, warn};

/// Converts texts into vectors, one per input, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ExternalError>;
}

/// [`Embedder`] backed by an `edgequake-llm` embedding provider.
pub struct ProviderEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
}

impl ProviderEmbedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Embedder for ProviderEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ExternalError> {
        self.provider
            .embed(texts)
            .await
            .map_err(|e| ExternalError::classify(e.to_string()))
    }
}

/// Embeds chunks under the shared external-call guard.
pub struct EmbeddingGenerator {
    embedder: Arc<dyn Embedder>,
    calls: ExternalCalls,
    dimension: usize,
    batch_size: usize,
}

/// Result of embedding one document's chunks.
#[derive(Debug)]
pub struct EmbeddingOutcome {
    pub embedded: Vec<EmbeddedChunk>,
    pub retries: u32,
}

impl EmbeddingGenerator {
    pub fn new(embedder: Arc<dyn Embedder>, calls: ExternalCalls, dimension: usize, batch_size: usize) -> Self {
        Self {
            embedder,
            calls,
            dimension,
            batch_size: batch_size.max(1),
        }
    }

    /// Embed every chunk, preserving order.
    ///
    /// Fails with [`PipelineError::Embedding`] naming the chunks that could
    /// not be embedded, or [`PipelineError::DimensionMismatch`] on the first
    /// vector of the wrong length.
    pub async fn embed_chunks(&self, chunks: Vec<Chunk>) -> Result<EmbeddingOutcome, PipelineError> {
        let mut embedded = Vec::with_capacity(chunks.len());
        let mut retries = 0u32;
        let mut failed: Vec<(String, ExternalError)> = Vec::new();

        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let (result, spent) = self.call(&texts).await;
            retries += spent;

            match result {
                Ok(vectors) => {
                    debug!("Embedded batch of {} chunks", batch.len());
                    for (chunk, vector) in batch.iter().zip(vectors) {
                        embedded.push(EmbeddedChunk::new(chunk.clone(), vector, self.dimension)?);
                    }
                }
                Err(e) if batch.len() == 1 => {
                    failed.push((batch[0].chunk_id.clone(), e));
                }
                Err(e) => {
                    warn!(
                        "Embedding batch of {} failed ({}); retrying chunks individually",
                        batch.len(),
                        e
                    );
                    for chunk in batch {
                        let (result, spent) = self.call(std::slice::from_ref(&chunk.text)).await;
                        retries += spent;
                        match result {
                            Ok(mut vectors) => {
                                let vector = vectors.pop().unwrap_or_default();
                                embedded.push(EmbeddedChunk::new(chunk.clone(), vector, self.dimension)?);
                            }
                            Err(e) => failed.push((chunk.chunk_id.clone(), e)),
                        }
                    }
                }
            }
        }

        if !failed.is_empty() {
            let transient = failed.iter().all(|(_, e)| e.is_transient());
            let detail = failed[0].1.detail();
            return Err(PipelineError::Embedding {
                chunk_ids: failed.into_iter().map(|(id, _)| id).collect(),
                transient,
                detail,
            });
        }

        Ok(EmbeddingOutcome { embedded, retries })
    }

    /// Embed a free-text query (search path).
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>, PipelineError> {
        let (result, _) = self.call(&[query.to_string()]).await;
        let mut vectors = result.map_err(|e| PipelineError::Embedding {
            chunk_ids: Vec::new(),
            transient: e.is_transient(),
            detail: e.detail(),
        })?;
        let vector = vectors.pop().unwrap_or_default();
        if vector.len() != self.dimension {
            return Err(PipelineError::DimensionMismatch {
                chunk_id: "<query>".into(),
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }

    /// One guarded call that also checks the provider returned one vector
    /// per text.
    async fn call(&self, texts: &[String]) -> (Result<Vec<Vec<f32>>, ExternalError>, u32) {
        let embedder = Arc::clone(&self.embedder);
        let expected = texts.len();
        self.calls
            .run("embedding", || {
                let embedder = Arc::clone(&embedder);
                async move {
                    let vectors = embedder.embed(texts).await?;
                    if vectors.len() != expected {
                        return Err(ExternalError::Permanent(format!(
                            "provider returned {} vectors for {} texts",
                            vectors.len(),
                            expected
                        )));
                    }
                    Ok(vectors)
                }
            })
            .await
    }
}
