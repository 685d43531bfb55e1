//! Configuration types for the document pipeline and the task queue.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share a config across workers, log it at startup, and diff two
//! runs to understand why their outputs differ.
//!
//! The restoration filters ([`PreprocessConfig`]), chunk sizing
//! ([`ChunkConfig`]) and queue behaviour ([`QueueConfig`]) are grouped into
//! their own structs because each is consumed by exactly one component.

use crate::error::PipelineError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one pipeline instance.
///
/// # Example
/// ```rust
/// use transcritor::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .dpi(200)
///     .page_concurrency(4)
///     .chunk_size(800)
///     .chunk_overlap(100)
///     .build()
///     .unwrap();
/// assert_eq!(config.chunking.max_chars, 800);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Rendering DPI used when rasterising each page. Range: 72–600. Default: 200.
    ///
    /// Handwriting needs more pixels per stroke than print; 200 DPI keeps thin
    /// pen strokes at least two pixels wide after the median filter.
    pub dpi: u32,

    /// Maximum rendered image dimension (width or height) in pixels. Default: 2500.
    pub max_rendered_pixels: u32,

    /// Directory holding the pdfium shared library. If None, binds to the
    /// system library.
    pub pdfium_lib_path: Option<PathBuf>,

    /// Restoration filter chain parameters.
    pub preprocess: PreprocessConfig,

    /// Chunk sizing.
    pub chunking: ChunkConfig,

    /// Number of pages of one document processed at once. Default: 4.
    pub page_concurrency: usize,

    /// Upper bound on outstanding external calls (extraction, parsing,
    /// embedding) across everything sharing this pipeline. Default: 8.
    pub max_external_calls: usize,

    /// Per-call timeout for external capabilities, in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Retry policy for a single external call.
    pub call_retry: RetryPolicy,

    /// Expected embedding vector length. Default: 1536.
    pub embedding_dimension: usize,

    /// Number of chunk texts submitted per embedding request. Default: 32.
    pub embedding_batch_size: usize,

    /// Sampling temperature for transcription and field extraction. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens the model may generate per page. Default: 4096.
    pub max_tokens: usize,

    /// Model identifier for the vision model. If None, uses provider default.
    pub model: Option<String>,

    /// Provider name (e.g. "openai", "anthropic", "ollama"). If None, auto-detected.
    pub provider_name: Option<String>,

    /// Custom transcription prompt. If None, uses the built-in default.
    pub transcription_prompt: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dpi: 200,
            max_rendered_pixels: 2500,
            pdfium_lib_path: None,
            preprocess: PreprocessConfig::default(),
            chunking: ChunkConfig::default(),
            page_concurrency: 4,
            max_external_calls: 8,
            api_timeout_secs: 60,
            call_retry: RetryPolicy::default(),
            embedding_dimension: 1536,
            embedding_batch_size: 32,
            temperature: 0.0,
            max_tokens: 4096,
            model: None,
            provider_name: None,
            transcription_prompt: None,
        }
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Check every cross-field constraint.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(72..=600).contains(&self.dpi) {
            return Err(PipelineError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                self.dpi
            )));
        }
        if self.page_concurrency == 0 || self.max_external_calls == 0 {
            return Err(PipelineError::InvalidConfig(
                "Concurrency limits must be ≥ 1".into(),
            ));
        }
        if self.embedding_dimension == 0 {
            return Err(PipelineError::InvalidConfig(
                "Embedding dimension must be ≥ 1".into(),
            ));
        }
        if self.embedding_batch_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "Embedding batch size must be ≥ 1".into(),
            ));
        }
        self.preprocess.validate()?;
        self.chunking.validate()
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn pdfium_lib_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_lib_path = Some(path.into());
        self
    }

    pub fn preprocess(mut self, preprocess: PreprocessConfig) -> Self {
        self.config.preprocess = preprocess;
        self
    }

    pub fn median_window(mut self, size: u32) -> Self {
        self.config.preprocess.median_window = size;
        self
    }

    pub fn clahe(mut self, clip_limit: f32, tiles: u32) -> Self {
        self.config.preprocess.clahe_clip_limit = clip_limit;
        self.config.preprocess.clahe_tiles = tiles;
        self
    }

    pub fn sauvola(mut self, window: u32, k: f32) -> Self {
        self.config.preprocess.sauvola_window = window;
        self.config.preprocess.sauvola_k = k;
        self
    }

    pub fn chunk_size(mut self, chars: usize) -> Self {
        self.config.chunking.max_chars = chars;
        self
    }

    pub fn chunk_overlap(mut self, chars: usize) -> Self {
        self.config.chunking.overlap_chars = chars;
        self
    }

    pub fn min_chunk_chars(mut self, chars: usize) -> Self {
        self.config.chunking.min_chunk_chars = chars;
        self
    }

    pub fn page_concurrency(mut self, n: usize) -> Self {
        self.config.page_concurrency = n;
        self
    }

    pub fn max_external_calls(mut self, n: usize) -> Self {
        self.config.max_external_calls = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn call_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.call_retry = policy;
        self
    }

    pub fn embedding_dimension(mut self, dim: usize) -> Self {
        self.config.embedding_dimension = dim;
        self
    }

    pub fn embedding_batch_size(mut self, n: usize) -> Self {
        self.config.embedding_batch_size = n;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn transcription_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.transcription_prompt = Some(prompt.into());
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Parameters of the restoration filter chain.
///
/// The chain order is fixed (grayscale → median → CLAHE → Sauvola); only
/// the parameters of each stage are tunable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Median filter window edge in pixels. Odd, > 1. Default: 3.
    pub median_window: u32,

    /// CLAHE clip limit as a multiple of the mean bin height. Default: 2.0.
    ///
    /// 1.0 disables enhancement (every bin is clipped to the mean); values
    /// above ~4 start amplifying paper texture into the binarizer.
    pub clahe_clip_limit: f32,

    /// CLAHE tile grid (tiles per axis). Default: 8.
    pub clahe_tiles: u32,

    /// Sauvola window edge in pixels. Odd, ≥ 3. Default: 15.
    pub sauvola_window: u32,

    /// Sauvola weight `k`. Range (0, 1]. Default: 0.2.
    pub sauvola_k: f32,

    /// Sauvola dynamic range of the standard deviation `R`. Default: 128.
    pub sauvola_r: f32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            median_window: 3,
            clahe_clip_limit: 2.0,
            clahe_tiles: 8,
            sauvola_window: 15,
            sauvola_k: 0.2,
            sauvola_r: 128.0,
        }
    }
}

impl PreprocessConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.median_window <= 1 || self.median_window % 2 == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "Median window must be odd and > 1, got {}",
                self.median_window
            )));
        }
        if self.sauvola_window < 3 || self.sauvola_window % 2 == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "Sauvola window must be odd and ≥ 3, got {}",
                self.sauvola_window
            )));
        }
        if !(self.sauvola_k > 0.0 && self.sauvola_k <= 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "Sauvola k must be in (0, 1], got {}",
                self.sauvola_k
            )));
        }
        if self.sauvola_r <= 0.0 {
            return Err(PipelineError::InvalidConfig(
                "Sauvola R must be > 0".into(),
            ));
        }
        if self.clahe_tiles == 0 || self.clahe_clip_limit <= 0.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "CLAHE needs tiles ≥ 1 and clip limit > 0, got {} / {}",
                self.clahe_tiles, self.clahe_clip_limit
            )));
        }
        Ok(())
    }
}

/// Chunk sizing for the formatter. Lengths are in characters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Maximum characters per chunk. Default: 1000.
    pub max_chars: usize,

    /// Characters shared by consecutive chunks of the same page. Default: 200.
    pub overlap_chars: usize,

    /// Chunks shorter than this (after trimming) are dropped. Default: 20.
    pub min_chunk_chars: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chars: 1000,
            overlap_chars: 200,
            min_chunk_chars: 20,
        }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_chars == 0 {
            return Err(PipelineError::InvalidConfig(
                "Chunk size must be ≥ 1".into(),
            ));
        }
        if self.overlap_chars >= self.max_chars {
            return Err(PipelineError::InvalidConfig(format!(
                "Chunk overlap ({}) must be smaller than chunk size ({})",
                self.overlap_chars, self.max_chars
            )));
        }
        Ok(())
    }
}

/// Task queue behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of worker loops pulling jobs. Default: 2.
    pub workers: usize,

    /// Task-level retry budget and backoff.
    ///
    /// Defaults to 3 retries starting at 2 s, because a task retry re-runs
    /// the whole document and should give a struggling upstream time to
    /// recover.
    pub retry: RetryPolicy,

    /// How long a claimed job stays invisible to other workers. Default: 30 min.
    ///
    /// Must exceed the worst-case processing time of one document, otherwise
    /// a healthy worker's job gets redelivered while it is still running.
    pub visibility_timeout_secs: u64,

    /// How often an idle worker polls for visible jobs, in milliseconds. Default: 250.
    pub poll_interval_ms: u64,

    /// How long a finished task and its result stay queryable, in seconds.
    /// Default: 24 h.
    pub result_ttl_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            retry: RetryPolicy {
                max_retries: 3,
                base_backoff_ms: 2_000,
                max_backoff_ms: 60_000,
            },
            visibility_timeout_secs: 30 * 60,
            poll_interval_ms: 250,
            result_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        PipelineConfig::default().validate().expect("defaults valid");
        assert_eq!(PreprocessConfig::default().median_window, 3);
        assert_eq!(PipelineConfig::default().embedding_dimension, 1536);
    }

    #[test]
    fn even_median_window_rejected() {
        let err = PipelineConfig::builder().median_window(4).build().unwrap_err();
        assert!(err.to_string().contains("Median window"), "got: {err}");
    }

    #[test]
    fn median_window_of_one_rejected() {
        assert!(PipelineConfig::builder().median_window(1).build().is_err());
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        let err = PipelineConfig::builder()
            .chunk_size(100)
            .chunk_overlap(100)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("overlap"), "got: {err}");
    }

    #[test]
    fn sauvola_k_range() {
        assert!(PipelineConfig::builder().sauvola(15, 0.0).build().is_err());
        assert!(PipelineConfig::builder().sauvola(15, 0.5).build().is_ok());
        assert!(PipelineConfig::builder().sauvola(14, 0.5).build().is_err());
    }

    #[test]
    fn zero_dimension_rejected() {
        assert!(PipelineConfig::builder().embedding_dimension(0).build().is_err());
    }

    #[test]
    fn queue_defaults() {
        let q = QueueConfig::default();
        assert_eq!(q.retry.max_retries, 3);
        assert_eq!(q.visibility_timeout(), Duration::from_secs(1800));
    }
}
