//! Deterministic fakes for the pipeline's external capabilities.
//!
//! Nothing here touches the network or pdfium: pages are synthetic images,
//! the extractor returns scripted text keyed by page index, and the
//! embedder hashes text into a small fixed-dimension vector.

#![allow(dead_code)]

use async_trait::async_trait;
use image::{DynamicImage, GrayImage, Luma};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use transcritor::error::{ExternalError, PipelineError, StoreError};
use transcritor::model::{EmbeddedChunk, PageImage, ParsedInfo, PreprocessedImage, SourceDocument};
use transcritor::pipeline::embed::Embedder;
use transcritor::pipeline::extract::TextExtractor;
use transcritor::pipeline::parse::{parse_info_response, InfoParser};
use transcritor::pipeline::split::PageSource;
use transcritor::store::{MemoryVectorStore, SearchHit, StoredChunk, UpsertOutcome, VectorStore};
use transcritor::{Capabilities, Pipeline, PipelineConfig, RetryPolicy};

pub const DIM: usize = 8;

/// Bytes that pass the `%PDF` check; `tag` makes the file id distinct.
pub fn pdf_bytes(tag: &str) -> Vec<u8> {
    format!("%PDF-1.7\n% synthetic {tag}\n").into_bytes()
}

/// Handwritten-form style text for one page, long enough to need two chunks.
pub fn page_text(page_index: usize) -> String {
    format!(
        "Paciente: Maria Silva\nData: 12/03/2024\n\n{}\n\nAssinatura: presente (pág. {})",
        "Queixa de dor lombar persistente há três semanas. ".repeat(24),
        page_index + 1
    )
}

pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        embedding_dimension: DIM,
        call_retry: RetryPolicy {
            max_retries: 3,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
        },
        ..Default::default()
    }
}

// ── Page source ──────────────────────────────────────────────────────────────

/// Produces `pages` light-gray images with a dark bar whose position depends
/// on the page index.
pub struct SyntheticPages {
    pub pages: usize,
}

#[async_trait]
impl PageSource for SyntheticPages {
    async fn split(&self, _doc: &SourceDocument) -> Result<Vec<PageImage>, PipelineError> {
        Ok((0..self.pages)
            .map(|i| {
                let mut img = GrayImage::from_pixel(48, 48, Luma([210]));
                let row = 4 + (i as u32 * 3) % 40;
                for x in 6..42 {
                    img.put_pixel(x, row, Luma([30]));
                }
                PageImage {
                    page_index: i,
                    image: DynamicImage::ImageLuma8(img),
                }
            })
            .collect())
    }
}

// ── Extractor ────────────────────────────────────────────────────────────────

pub type Script = dyn Fn(usize, usize) -> Result<String, ExternalError> + Send + Sync;

/// Calls `script(page_index, attempt)`; `attempt` counts calls for that page.
pub struct ScriptedExtractor {
    script: Box<Script>,
    calls: Mutex<HashMap<usize, usize>>,
    delay: Option<Box<dyn Fn(usize, usize) -> Duration + Send + Sync>>,
}

impl ScriptedExtractor {
    pub fn new(script: impl Fn(usize, usize) -> Result<String, ExternalError> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(HashMap::new()),
            delay: None,
        }
    }

    /// Every page succeeds with [`page_text`].
    pub fn healthy() -> Self {
        Self::new(|page, _| Ok(page_text(page)))
    }

    /// Sleep `delay(page_index, attempt)` before answering.
    pub fn with_delay(mut self, delay: impl Fn(usize, usize) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = Some(Box::new(delay));
        self
    }

    pub fn calls_for(&self, page_index: usize) -> usize {
        self.calls.lock().unwrap().get(&page_index).copied().unwrap_or(0)
    }
}

#[async_trait]
impl TextExtractor for ScriptedExtractor {
    async fn extract(&self, page: &PreprocessedImage) -> Result<String, ExternalError> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(page.page_index).or_insert(0);
            *n += 1;
            *n - 1
        };
        if let Some(ref delay) = self.delay {
            tokio::time::sleep(delay(page.page_index, attempt)).await;
        }
        (self.script)(page.page_index, attempt)
    }
}

// ── Parser ───────────────────────────────────────────────────────────────────

/// Answers like a well-behaved model; pages listed in `broken` get prose.
pub struct FakeParser {
    pub broken: Vec<usize>,
}

impl FakeParser {
    pub fn ok() -> Self {
        Self { broken: Vec::new() }
    }
}

#[async_trait]
impl InfoParser for FakeParser {
    async fn parse(&self, page_index: usize, _text: &str) -> Result<ParsedInfo, ExternalError> {
        let raw = if self.broken.contains(&page_index) {
            "Sorry, I could not find any fields on this page.".to_string()
        } else {
            "```json\n{\"client_name\": \"Maria Silva\", \"document_date\": \"12/03/2024\", \
             \"signature_found\": true, \"relevant_illness_mentions\": \"\"}\n```"
                .to_string()
        };
        parse_info_response(&raw)
    }
}

// ── Embedders ────────────────────────────────────────────────────────────────

/// Byte histogram folded into [`DIM`] buckets. Same text, same vector.
pub struct HashEmbedder {
    pub dim: usize,
    pub requests: AtomicUsize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self {
            dim: DIM,
            requests: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ExternalError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; self.dim];
                for (i, b) in t.bytes().enumerate() {
                    v[(b as usize + i) % self.dim] += 1.0;
                }
                v
            })
            .collect())
    }
}

/// Always fails transiently, like a rate-limited upstream.
pub struct RateLimitedEmbedder {
    pub requests: AtomicUsize,
}

#[async_trait]
impl Embedder for RateLimitedEmbedder {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ExternalError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Err(ExternalError::Transient("429 Too Many Requests".into()))
    }
}

// ── Stores ───────────────────────────────────────────────────────────────────

/// Memory store that records the page order of every upsert and can be told
/// to fail the first `fail_first` upserts.
pub struct RecordingStore {
    pub inner: MemoryVectorStore,
    pub upsert_pages: Mutex<Vec<Vec<usize>>>,
    fail_first: AtomicUsize,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::failing_first(0)
    }

    pub fn failing_first(n: usize) -> Self {
        Self {
            inner: MemoryVectorStore::new(DIM),
            upsert_pages: Mutex::new(Vec::new()),
            fail_first: AtomicUsize::new(n),
        }
    }
}

#[async_trait]
impl VectorStore for RecordingStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.inner.ensure_schema().await
    }

    async fn upsert_document(
        &self,
        file_id: &str,
        chunks: &[EmbeddedChunk],
    ) -> Result<UpsertOutcome, StoreError> {
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Connection("connection reset by peer".into()));
        }
        self.upsert_pages
            .lock()
            .unwrap()
            .push(chunks.iter().map(|c| c.chunk().page_index).collect());
        self.inner.upsert_document(file_id, chunks).await
    }

    async fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<SearchHit>, StoreError> {
        self.inner.search(embedding, k).await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.inner.count().await
    }

    async fn chunks_for_file(&self, file_id: &str) -> Result<Vec<StoredChunk>, StoreError> {
        self.inner.chunks_for_file(file_id).await
    }
}

// ── Assembly ─────────────────────────────────────────────────────────────────

pub struct Harness {
    pub pipeline: Pipeline,
    pub extractor: Arc<ScriptedExtractor>,
    pub embedder: Arc<dyn Embedder>,
    pub store: Arc<RecordingStore>,
}

pub fn harness(pages: usize, extractor: ScriptedExtractor) -> Harness {
    harness_with(pages, extractor, FakeParser::ok(), Arc::new(HashEmbedder::new()), RecordingStore::new(), test_config())
}

pub fn harness_with(
    pages: usize,
    extractor: ScriptedExtractor,
    parser: FakeParser,
    embedder: Arc<dyn Embedder>,
    store: RecordingStore,
    config: PipelineConfig,
) -> Harness {
    let extractor = Arc::new(extractor);
    let store = Arc::new(store);
    let pipeline = Pipeline::new(
        config,
        Capabilities {
            splitter: Arc::new(SyntheticPages { pages }),
            extractor: extractor.clone(),
            parser: Arc::new(parser),
            embedder: Arc::clone(&embedder),
            store: store.clone(),
        },
    )
    .expect("valid test config");
    Harness {
        pipeline,
        extractor,
        embedder,
        store,
    }
}
