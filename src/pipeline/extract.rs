//! Text extraction: send one restored page image to a vision model.
//!
//! This module is intentionally thin. One call to [`TextExtractor::extract`]
//! is exactly one request; retries, the per-call timeout and the global
//! concurrency limit are applied by the orchestrator around it, so fakes in
//! tests exercise the same retry path as the real provider.
//!
//! ## Message Layout
//!
//! 1. **System message**: the transcription prompt (or a configured override)
//! 2. **User message**: the page PNG as an image attachment, empty text
//!
//! The empty user text is intentional: vision APIs require at least one user
//! turn to respond to, but the image carries all the actual content.

use crate::config::PipelineConfig;
use crate::error::ExternalError;
use crate::model::PreprocessedImage;
use crate::pipeline::encode::encode_page;
use crate::prompts::TRANSCRIPTION_PROMPT;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Turns one restored page into raw text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Transcribe a page. An empty string means the page has no legible text.
    async fn extract(&self, page: &PreprocessedImage) -> Result<String, ExternalError>;
}

/// [`TextExtractor`] backed by an `edgequake-llm` vision provider.
pub struct VisionTextExtractor {
    provider: Arc<dyn LLMProvider>,
    prompt: String,
    options: CompletionOptions,
}

impl VisionTextExtractor {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        let prompt = config
            .transcription_prompt
            .clone()
            .unwrap_or_else(|| TRANSCRIPTION_PROMPT.to_string());
        Self {
            provider,
            prompt,
            options: build_options(config),
        }
    }
}

#[async_trait]
impl TextExtractor for VisionTextExtractor {
    async fn extract(&self, page: &PreprocessedImage) -> Result<String, ExternalError> {
        let start = Instant::now();
        let image = encode_page(&page.image)
            .map_err(|e| ExternalError::Permanent(format!("PNG encoding failed: {}", e)))?;

        let messages = vec![
            ChatMessage::system(self.prompt.as_str()),
            ChatMessage::user_with_images("", vec![image]),
        ];

        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| ExternalError::classify(e.to_string()))?;

        debug!(
            "Page {}: {} input tokens, {} output tokens, {:?}",
            page.page_index,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        Ok(response.content)
    }
}

/// Build `CompletionOptions` from the pipeline config.
pub(crate) fn build_options(config: &PipelineConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}
