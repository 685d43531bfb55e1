//! Field parsing: structured fields from one page's transcription.
//!
//! The model is asked for a bare JSON object (see
//! [`crate::prompts::FIELD_EXTRACTION_TEMPLATE`]), but in practice answers
//! arrive wrapped in code fences or with a sentence of chatter before the
//! brace. [`parse_info_response`] tolerates both and only fails when no JSON
//! object can be recovered at all.

use crate::config::PipelineConfig;
use crate::error::ExternalError;
use crate::model::ParsedInfo;
use crate::pipeline::extract::build_options;
use crate::prompts::field_extraction_prompt;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Extracts [`ParsedInfo`] from one page of text.
#[async_trait]
pub trait InfoParser: Send + Sync {
    async fn parse(&self, page_index: usize, text: &str) -> Result<ParsedInfo, ExternalError>;
}

/// [`InfoParser`] backed by an `edgequake-llm` chat provider.
pub struct LlmInfoParser {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl LlmInfoParser {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        Self {
            provider,
            options: build_options(config),
        }
    }
}

#[async_trait]
impl InfoParser for LlmInfoParser {
    async fn parse(&self, page_index: usize, text: &str) -> Result<ParsedInfo, ExternalError> {
        let messages = vec![ChatMessage::user(field_extraction_prompt(text))];
        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| ExternalError::classify(e.to_string()))?;

        let info = parse_info_response(&response.content)?;
        debug!("Page {}: parsed fields {:?}", page_index, info);
        Ok(info)
    }
}

static RE_JSON_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*\n(.*?)\n?```").expect("valid json fence regex")
});

/// Recover a [`ParsedInfo`] from a model answer.
///
/// Tries, in order: the whole answer, the first fenced block, and the span
/// from the first `{` to the last `}`. A non-object JSON value is rejected.
pub fn parse_info_response(raw: &str) -> Result<ParsedInfo, ExternalError> {
    let trimmed = raw.trim();

    let mut candidates: Vec<&str> = vec![trimmed];
    if let Some(caps) = RE_JSON_FENCE.captures(trimmed) {
        if let Some(m) = caps.get(1) {
            candidates.push(m.as_str());
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            candidates.push(&trimmed[start..=end]);
        }
    }

    for candidate in candidates {
        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(candidate) {
            return Ok(ParsedInfo::from_json_object(&obj));
        }
    }

    let preview: String = trimmed.chars().take(80).collect();
    Err(ExternalError::Permanent(format!(
        "field extraction returned no JSON object: {:?}",
        preview
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Extracted;

    #[test]
    fn bare_json() {
        let info = parse_info_response(
            r#"{"client_name":"João Carlos da Silva","document_date":"2025-04-15","signature_found":true,"relevant_illness_mentions":["Influenza H3N2","sinusite aguda"]}"#,
        )
        .unwrap();
        assert_eq!(info.client_name, Extracted::Present("João Carlos da Silva".into()));
        assert_eq!(info.signature_found, Extracted::Present(true));
        assert_eq!(
            info.relevant_illness_mentions.as_option().map(Vec::len),
            Some(2)
        );
    }

    #[test]
    fn fenced_json() {
        let raw = "```json\n{\"client_name\": null, \"document_date\": \"\"}\n```";
        let info = parse_info_response(raw).unwrap();
        assert_eq!(info.client_name, Extracted::Absent);
        assert_eq!(info.document_date, Extracted::Blank);
        assert_eq!(info.signature_found, Extracted::Absent);
    }

    #[test]
    fn json_after_chatter() {
        let raw = "Sure! Here you go: {\"signature_found\": false} Hope it helps.";
        let info = parse_info_response(raw).unwrap();
        assert_eq!(info.signature_found, Extracted::Present(false));
    }

    #[test]
    fn no_json_is_permanent() {
        let err = parse_info_response("I cannot read this page.").unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn array_is_rejected() {
        assert!(parse_info_response("[1, 2, 3]").is_err());
    }
}
