//! Document pipeline orchestration.
//!
//! [`Pipeline::process`] takes one PDF from bytes to stored vectors:
//!
//! ```text
//! split ─▶ per page (bounded concurrency):
//!            preprocess ─▶ extract ─▶ clean ─▶ parse ─▶ format
//!       ─▶ embed all chunks ─▶ upsert into the vector store
//! ```
//!
//! ## Failure scope
//!
//! A page that cannot be restored or transcribed becomes a
//! [`PageWarning`] and contributes no chunks; a page whose fields cannot be
//! parsed is still chunked, without fields. The document fails only when
//! the split fails, when every page loses its text, when embedding fails,
//! or when the store rejects the write. In that last case nothing from this
//! run is visible in the store.
//!
//! ## Ordering
//!
//! Pages run concurrently and finish in any order; results are sorted by
//! page index before embedding, so chunk order and chunk ids never depend
//! on scheduling.

use crate::calls::ExternalCalls;
use crate::config::PipelineConfig;
use crate::error::{ExternalError, PageError, PipelineError};
use crate::model::{Chunk, PageImage, ParsedInfo, SourceDocument};
use crate::output::{PageWarning, PipelineResult, PipelineStats};
use crate::pipeline::chunk::{ChunkFormatter, DocumentRef};
use crate::pipeline::embed::{Embedder, EmbeddingGenerator, ProviderEmbedder};
use crate::pipeline::extract::{TextExtractor, VisionTextExtractor};
use crate::pipeline::input::validate_payload;
use crate::pipeline::parse::{InfoParser, LlmInfoParser};
use crate::pipeline::postprocess::clean_transcription;
use crate::pipeline::preprocess::preprocess_page;
use crate::pipeline::split::{PageSource, PdfiumSplitter};
use crate::progress::{NoopObserver, PipelineStage, SharedObserver};
use crate::providers::{resolve_embedding_provider, resolve_vision_provider};
use crate::store::{SearchHit, VectorStore};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// The external and storage capabilities a [`Pipeline`] drives.
///
/// Each is a trait object so tests can substitute deterministic fakes.
#[derive(Clone)]
pub struct Capabilities {
    pub splitter: Arc<dyn PageSource>,
    pub extractor: Arc<dyn TextExtractor>,
    pub parser: Arc<dyn InfoParser>,
    pub embedder: Arc<dyn Embedder>,
    pub store: Arc<dyn VectorStore>,
}

/// What one page contributed.
struct PageOutcome {
    page_index: usize,
    chunks: Vec<Chunk>,
    warnings: Vec<PageError>,
    retries: u32,
    /// Transcribed fine but carried no text.
    blank: bool,
}

impl PageOutcome {
    fn lost(page_index: usize, error: PageError, retries: u32) -> Self {
        Self {
            page_index,
            chunks: Vec::new(),
            warnings: vec![error],
            retries,
            blank: false,
        }
    }
}

/// Processes documents end to end. Cheap to share behind an `Arc`.
pub struct Pipeline {
    config: PipelineConfig,
    splitter: Arc<dyn PageSource>,
    extractor: Arc<dyn TextExtractor>,
    parser: Arc<dyn InfoParser>,
    embeddings: EmbeddingGenerator,
    store: Arc<dyn VectorStore>,
    calls: ExternalCalls,
    formatter: ChunkFormatter,
    observer: SharedObserver,
}

impl Pipeline {
    /// Build a pipeline over explicit capabilities.
    pub fn new(config: PipelineConfig, caps: Capabilities) -> Result<Self, PipelineError> {
        config.validate()?;
        let calls = ExternalCalls::from_config(&config);
        let embeddings = EmbeddingGenerator::new(
            caps.embedder,
            calls.clone(),
            config.embedding_dimension,
            config.embedding_batch_size,
        );
        Ok(Self {
            formatter: ChunkFormatter::new(config.chunking.clone()),
            splitter: caps.splitter,
            extractor: caps.extractor,
            parser: caps.parser,
            embeddings,
            store: caps.store,
            calls,
            observer: Arc::new(NoopObserver),
            config,
        })
    }

    /// Build a pipeline with pdfium splitting and providers resolved from
    /// the environment, writing into `store`.
    pub fn from_env(config: PipelineConfig, store: Arc<dyn VectorStore>) -> Result<Self, PipelineError> {
        let vision = resolve_vision_provider(&config)?;
        let embedding = resolve_embedding_provider()?;
        info!(
            "Using provider={}, model={}",
            config.provider_name.as_deref().unwrap_or("auto"),
            config.model.as_deref().unwrap_or("default")
        );
        let caps = Capabilities {
            splitter: Arc::new(PdfiumSplitter::new(&config)),
            extractor: Arc::new(VisionTextExtractor::new(Arc::clone(&vision), &config)),
            parser: Arc::new(LlmInfoParser::new(vision, &config)),
            embedder: Arc::new(ProviderEmbedder::new(embedding)),
            store,
        };
        Self::new(config, caps)
    }

    /// Replace the observer receiving stage and page events.
    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Process raw PDF bytes with no filename.
    pub async fn process_pdf_pipeline(
        &self,
        file_bytes: impl Into<Arc<[u8]>>,
    ) -> Result<PipelineResult, PipelineError> {
        let doc = SourceDocument::new(file_bytes, None);
        self.process(&doc).await
    }

    /// Run the full pipeline for one document.
    pub async fn process(&self, doc: &SourceDocument) -> Result<PipelineResult, PipelineError> {
        match self.run(doc).await {
            Ok(result) => {
                self.observer.on_stage(PipelineStage::Done);
                Ok(result)
            }
            Err(e) => {
                error!("Document {} failed [{}]: {}", doc.file_id(), e.class(), e);
                self.observer.on_stage(PipelineStage::Failed);
                Err(e)
            }
        }
    }

    /// Embed `query` and return the `k` nearest stored chunks.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>, PipelineError> {
        let embedding = self.embeddings.embed_query(query).await?;
        Ok(self.store.search(&embedding, k).await?)
    }

    async fn run(&self, doc: &SourceDocument) -> Result<PipelineResult, PipelineError> {
        let total_start = Instant::now();
        let mut stats = PipelineStats::default();

        validate_payload(doc.bytes())?;
        info!(
            "Processing {} ({} bytes, file_id={})",
            doc.filename().unwrap_or("<unnamed>"),
            doc.len(),
            doc.file_id()
        );

        // ── Step 1: Split into page images ───────────────────────────────────
        self.observer.on_stage(PipelineStage::Splitting);
        let split_start = Instant::now();
        let pages = self.splitter.split(doc).await?;
        let total_pages = pages.len();
        stats.split_duration_ms = split_start.elapsed().as_millis() as u64;
        info!("Split {} pages in {}ms", total_pages, stats.split_duration_ms);
        self.observer.on_pages_ready(total_pages);

        // ── Step 2: Per-page restore, transcribe, parse, format ─────────────
        let page_start = Instant::now();
        let doc_ref = DocumentRef {
            file_id: doc.file_id(),
            source_file: doc.filename(),
        };
        let mut outcomes: Vec<PageOutcome> = stream::iter(pages)
            .map(|page| self.process_page(doc_ref, page, total_pages))
            .buffer_unordered(self.config.page_concurrency.max(1))
            .collect()
            .await;
        outcomes.sort_by_key(|o| o.page_index);
        stats.page_duration_ms = page_start.elapsed().as_millis() as u64;

        let mut chunks = Vec::new();
        let mut warnings: Vec<PageWarning> = Vec::new();
        let mut blank_pages = 0;
        for outcome in outcomes {
            stats.external_retries += outcome.retries;
            blank_pages += usize::from(outcome.blank);
            chunks.extend(outcome.chunks);
            warnings.extend(outcome.warnings.into_iter().map(PageWarning::from));
        }

        // ── Step 3: Every page with content lost its text? ──────────────────
        // Blank pages neither count for nor against the document.
        let lost: Vec<&PageWarning> = warnings.iter().filter(|w| w.error.drops_text()).collect();
        if !lost.is_empty() && lost.len() + blank_pages == total_pages {
            return Err(PipelineError::AllPagesFailed {
                total: total_pages,
                transient: lost.iter().all(|w| w.error.is_transient()),
                first_error: lost[0].error.to_string(),
            });
        }

        // ── Step 4: Embed ───────────────────────────────────────────────────
        let chunks_produced = chunks.len();
        self.observer.on_stage(PipelineStage::Embedding);
        let embed_start = Instant::now();
        let embedded = self.embeddings.embed_chunks(chunks).await?;
        stats.external_retries += embedded.retries;
        stats.embed_duration_ms = embed_start.elapsed().as_millis() as u64;
        debug!("Embedded {} chunks in {}ms", chunks_produced, stats.embed_duration_ms);

        // ── Step 5: Store ───────────────────────────────────────────────────
        self.observer.on_stage(PipelineStage::Storing);
        let store_start = Instant::now();
        let stored = if embedded.embedded.is_empty() {
            Default::default()
        } else {
            self.store
                .upsert_document(doc.file_id(), &embedded.embedded)
                .await?
        };
        stats.store_duration_ms = store_start.elapsed().as_millis() as u64;
        stats.total_duration_ms = total_start.elapsed().as_millis() as u64;

        info!(
            "Stored {}/{} pages → {} chunks ({} new, {} updated, {} stale removed, {} warnings) in {}ms",
            total_pages - lost.len(),
            total_pages,
            stored.written(),
            stored.inserted,
            stored.updated,
            stored.removed,
            warnings.len(),
            stats.total_duration_ms
        );

        Ok(PipelineResult {
            file_id: doc.file_id().to_string(),
            filename: doc.filename().map(str::to_string),
            total_pages,
            chunks_produced,
            chunks_added: stored.written(),
            chunks_inserted: stored.inserted,
            chunks_updated: stored.updated,
            chunks_removed: stored.removed,
            warnings,
            stats,
        })
    }

    /// Everything that happens to one page. Never fails: problems become
    /// warnings on the outcome.
    async fn process_page(&self, doc: DocumentRef<'_>, page: PageImage, total_pages: usize) -> PageOutcome {
        let page_index = page.page_index;
        let outcome = self.process_page_inner(doc, page).await;

        for w in &outcome.warnings {
            warn!("{}", w);
            self.observer.on_page_warning(page_index, total_pages, &w.to_string());
        }
        self.observer
            .on_page_complete(page_index, total_pages, outcome.chunks.len());
        outcome
    }

    async fn process_page_inner(&self, doc: DocumentRef<'_>, page: PageImage) -> PageOutcome {
        let page_index = page.page_index;

        // Restore
        self.observer.on_page_stage(page_index, PipelineStage::Preprocessing);
        let restored = match preprocess_page(page, self.config.preprocess.clone()).await {
            Ok(img) => img,
            Err(e) => {
                let detail = match e {
                    PipelineError::Preprocessing { detail, .. } => detail,
                    other => other.to_string(),
                };
                return PageOutcome::lost(page_index, PageError::PreprocessingFailed { page: page_index, detail }, 0);
            }
        };

        // Transcribe
        self.observer.on_page_stage(page_index, PipelineStage::Extracting);
        let extractor = Arc::clone(&self.extractor);
        let label = format!("extract page {}", page_index);
        let (result, mut retries) = self
            .calls
            .run(&label, || {
                let extractor = Arc::clone(&extractor);
                let restored = &restored;
                async move { extractor.extract(restored).await }
            })
            .await;
        let raw = match result {
            Ok(raw) => raw,
            Err(ExternalError::TimedOut(secs)) => {
                return PageOutcome::lost(page_index, PageError::Timeout { page: page_index, secs }, retries);
            }
            Err(e) => {
                let error = PageError::ExtractionFailed {
                    page: page_index,
                    retries,
                    transient: e.is_transient(),
                    detail: e.detail(),
                };
                return PageOutcome::lost(page_index, error, retries);
            }
        };

        let text = clean_transcription(&raw);
        if text.is_empty() {
            debug!("Page {}: blank", page_index);
            return PageOutcome {
                page_index,
                chunks: Vec::new(),
                warnings: Vec::new(),
                retries,
                blank: true,
            };
        }

        // Parse fields
        self.observer.on_page_stage(page_index, PipelineStage::Parsing);
        let parser = Arc::clone(&self.parser);
        let label = format!("parse page {}", page_index);
        let (parsed, parse_retries) = self
            .calls
            .run(&label, || {
                let parser = Arc::clone(&parser);
                let text = text.as_str();
                async move { parser.parse(page_index, text).await }
            })
            .await;
        retries += parse_retries;
        let mut warnings = Vec::new();
        let info: Option<ParsedInfo> = match parsed {
            Ok(info) => Some(info),
            Err(e) => {
                warnings.push(PageError::ParsingFailed {
                    page: page_index,
                    transient: e.is_transient(),
                    detail: e.detail(),
                });
                None
            }
        };

        // Format
        self.observer.on_page_stage(page_index, PipelineStage::Formatting);
        let chunks = self.formatter.format_page(doc, page_index, &text, info.as_ref());
        debug!("Page {}: {} chars → {} chunks", page_index, text.chars().count(), chunks.len());

        PageOutcome {
            page_index,
            chunks,
            warnings,
            retries,
            blank: false,
        }
    }
}
