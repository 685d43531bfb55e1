//! Resolution of the vision and embedding capabilities from configuration
//! and environment.
//!
//! ## Vision provider
//!
//! Resolved from most-specific to least-specific:
//!
//! 1. **Named provider + model** (`config.provider_name`): built with
//!    [`ProviderFactory::create_llm_provider`], which reads the matching API
//!    key from the environment.
//! 2. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`):
//!    honoured even when several API keys are present.
//! 3. **`OPENAI_API_KEY`**: OpenAI with the configured or default model.
//! 4. **Auto-detection** via [`ProviderFactory::from_env`].
//!
//! ## Embedding provider
//!
//! Always auto-detected with [`ProviderFactory::from_env`]. The vector length
//! it produces must match [`PipelineConfig::embedding_dimension`]; the
//! mismatch is caught on the first embedded chunk.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use edgequake_llm::{EmbeddingProvider, LLMProvider, ProviderFactory};
use std::sync::Arc;
use tracing::debug;

/// Model used when a provider is chosen without naming one.
pub const DEFAULT_VISION_MODEL: &str = "gpt-4.1-nano";

fn create_vision_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    debug!("Creating vision provider {}/{}", provider_name, model);
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PipelineError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the provider used for both transcription and field parsing.
pub fn resolve_vision_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    let model = config.model.as_deref().unwrap_or(DEFAULT_VISION_MODEL);

    if let Some(ref name) = config.provider_name {
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_vision_provider(&prov, &env_model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_vision_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) = ProviderFactory::from_env().map_err(auto_detect_failed)?;
    Ok(llm_provider)
}

/// Resolve the provider that turns chunk text into vectors.
pub fn resolve_embedding_provider() -> Result<Arc<dyn EmbeddingProvider>, PipelineError> {
    let (_llm, embedding) = ProviderFactory::from_env().map_err(auto_detect_failed)?;
    Ok(embedding)
}

fn auto_detect_failed(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::ProviderNotConfigured {
        provider: "auto".to_string(),
        hint: format!(
            "No provider could be auto-detected from environment.\n\
            Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or EDGEQUAKE_LLM_PROVIDER + EDGEQUAKE_MODEL.\n\
            Error: {}",
            e
        ),
    }
}
