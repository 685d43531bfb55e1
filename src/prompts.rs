//! Prompts for page transcription and field extraction.
//!
//! Centralising every prompt here keeps the adapters in
//! [`crate::pipeline::extract`] and [`crate::pipeline::parse`] free of prompt
//! text, and lets unit tests inspect prompts without a live model.
//!
//! Callers can override the transcription prompt via
//! [`crate::config::PipelineConfig::transcription_prompt`].

/// Default system prompt for transcribing one restored page image.
pub const TRANSCRIPTION_PROMPT: &str = r#"You transcribe scanned, handwritten medical documents.

The image is a single page that has already been converted to black and white.

Rules:
1. Transcribe ALL legible text exactly as written, in reading order.
2. Keep the original language; do not translate.
3. Keep line breaks where the writer started a new line; separate blocks
   (headers, paragraphs, signatures, stamps) with a blank line.
4. Mark words you cannot read as [illegible]. Never guess names, dates or doses.
5. Describe a signature as [signature] and a stamp as [stamp: <text>].
6. Output plain text only. No Markdown, no code fences, no commentary."#;

/// Template for structured field extraction. `{page_text}` is replaced with
/// the transcription.
pub const FIELD_EXTRACTION_TEMPLATE: &str = r#"Analyze the following text transcribed from one page of a medical document.
Extract these fields:
- client_name: the patient's full name (null if not present).
- document_date: the document's date, YYYY-MM-DD when possible, otherwise as written (null if not present).
- signature_found: true/false, whether a professional signature is present or implied (null if undeterminable).
- relevant_illness_mentions: list of key medical conditions or symptoms (null if none are mentioned).

Return ONLY a JSON object with exactly these keys. No explanations.

Transcribed text:
```text
{page_text}
```

JSON:"#;

/// Render the field-extraction prompt for one page.
pub fn field_extraction_prompt(page_text: &str) -> String {
    FIELD_EXTRACTION_TEMPLATE.replace("{page_text}", page_text)
}
