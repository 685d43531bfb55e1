//! Error types for the transcritor library.
//!
//! Three error types reflect three distinct failure scopes:
//!
//! * [`PipelineError`]: **Fatal** for one document: the pipeline cannot
//!   produce a trustworthy result (unparseable PDF, storage outage, every page
//!   failed). Returned as `Err(PipelineError)` from
//!   [`crate::orchestrator::Pipeline::process`] and surfaced through the task
//!   status as a classified failure.
//!
//! * [`PageError`]: **Non-fatal**: a single page could not be transcribed or
//!   parsed. Stored as a warning inside [`crate::output::PipelineResult`] so
//!   one smudged page never blocks the rest of the document.
//!
//! * [`ExternalError`]: returned by every external capability adapter
//!   (text recognition, field extraction, embedding). It only records whether
//!   a retry could change the outcome; callers decide what a failure means
//!   at their level.
//!
//! Every fatal error maps to an [`ErrorClass`], which is what the task layer
//! uses to decide between retry and terminal failure.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification shared by the pipeline and the task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed or empty document. Never retried.
    InvalidInput,
    /// Rate limit, timeout or 5xx from an external capability.
    TransientExternal,
    /// Auth or validation failure from an external capability.
    PermanentExternal,
    /// Transaction or connection failure against the vector store.
    StorageFailure,
    /// Bug or environment problem (panicked task, missing library).
    Internal,
}

impl ErrorClass {
    /// Whether re-running the whole document may succeed.
    ///
    /// Storage failures are retryable because the upsert is keyed by
    /// `chunk_id` and re-execution cannot duplicate rows.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::TransientExternal | ErrorClass::StorageFailure)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::InvalidInput => "InvalidInput",
            ErrorClass::TransientExternal => "TransientExternal",
            ErrorClass::PermanentExternal => "PermanentExternal",
            ErrorClass::StorageFailure => "StorageFailure",
            ErrorClass::Internal => "Internal",
        };
        f.write_str(s)
    }
}

/// All fatal errors returned for a single document.
///
/// Page-level failures use [`PageError`] and are stored in
/// [`crate::output::PipelineResult::warnings`] rather than propagated here.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The payload had zero bytes.
    #[error("Document payload is empty (0 bytes)")]
    EmptyPayload,

    /// The payload does not start with the `%PDF` signature.
    #[error("Payload is not a PDF; first bytes: {magic:?}")]
    NotAPdf { magic: Vec<u8> },

    /// The payload looked like a PDF but pdfium could not parse it.
    #[error("PDF could not be parsed: {detail}")]
    InvalidDocument { detail: String },

    /// The PDF parsed but has no pages.
    #[error("PDF contains zero pages")]
    EmptyDocument,

    /// Local input file could not be found or read.
    #[error("Input file not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    // ── Stage errors ──────────────────────────────────────────────────────
    /// A page image could not be restored at all (zero dimension, bad buffer).
    #[error("Preprocessing failed for page {page}: {detail}")]
    Preprocessing { page: usize, detail: String },

    /// Every page failed extraction; the document has nothing to store.
    #[error("All {total} pages failed extraction. First error: {first_error}")]
    AllPagesFailed {
        total: usize,
        transient: bool,
        first_error: String,
    },

    /// One or more chunks could not be embedded.
    #[error("Embedding failed for {} chunk(s) [{}]: {detail}", chunk_ids.len(), chunk_ids.join(", "))]
    Embedding {
        chunk_ids: Vec<String>,
        transient: bool,
        detail: String,
    },

    /// The embedding capability returned a vector of the wrong length.
    #[error("Embedding for chunk '{chunk_id}' has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        chunk_id: String,
        expected: usize,
        actual: usize,
    },

    /// The vector store rejected or lost the document transaction.
    #[error("Vector store error: {0}")]
    Storage(#[from] StoreError),

    // ── Setup errors ──────────────────────────────────────────────────────
    /// No LLM or embedding provider could be constructed.
    #[error("Provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH to a directory containing libpdfium, or install it system-wide."
    )]
    PdfiumBindingFailed(String),

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Classify this error for the retry decision and the status summary.
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::EmptyPayload
            | PipelineError::NotAPdf { .. }
            | PipelineError::InvalidDocument { .. }
            | PipelineError::EmptyDocument
            | PipelineError::FileNotFound { .. }
            | PipelineError::Preprocessing { .. } => ErrorClass::InvalidInput,
            PipelineError::DownloadFailed { .. } => ErrorClass::TransientExternal,
            PipelineError::AllPagesFailed { transient, .. }
            | PipelineError::Embedding { transient, .. } => {
                if *transient {
                    ErrorClass::TransientExternal
                } else {
                    ErrorClass::PermanentExternal
                }
            }
            PipelineError::DimensionMismatch { .. }
            | PipelineError::ProviderNotConfigured { .. } => ErrorClass::PermanentExternal,
            PipelineError::Storage(_) => ErrorClass::StorageFailure,
            PipelineError::PdfiumBindingFailed(_)
            | PipelineError::InvalidConfig(_)
            | PipelineError::Internal(_) => ErrorClass::Internal,
        }
    }
}

/// Errors raised by a [`crate::store::VectorStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Could not acquire a connection from the pool.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The document transaction failed and was rolled back.
    #[error("transaction rolled back: {0}")]
    Transaction(String),

    /// A vector does not match the column dimension.
    #[error("vector for '{chunk_id}' has {actual} dimensions, column expects {expected}")]
    Dimension {
        chunk_id: String,
        expected: usize,
        actual: usize,
    },

    /// Schema setup failed.
    #[error("schema setup failed: {0}")]
    Schema(String),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Connection(e.to_string())
            }
            other => StoreError::Transaction(other.to_string()),
        }
    }
}

/// Failure of one external capability call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExternalError {
    /// Rate limit, timeout, 5xx or connection reset. Eligible for retry.
    #[error("transient: {0}")]
    Transient(String),

    /// Invalid input, auth failure or unparseable response. Never retried.
    #[error("permanent: {0}")]
    Permanent(String),

    /// The call exceeded its per-attempt timeout. Eligible for retry.
    #[error("timed out after {0}s")]
    TimedOut(u64),
}

impl ExternalError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExternalError::Transient(_) | ExternalError::TimedOut(_))
    }

    /// Human-readable detail without the classification prefix.
    pub fn detail(&self) -> String {
        match self {
            ExternalError::Transient(d) | ExternalError::Permanent(d) => d.clone(),
            ExternalError::TimedOut(secs) => format!("timed out after {}s", secs),
        }
    }

    /// Classify a provider error message.
    ///
    /// Provider crates expose heterogeneous error enums, so classification
    /// works on the rendered message. Anything not recognisably transient is
    /// treated as permanent so a bad key never burns the retry budget.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        const TRANSIENT_MARKERS: &[&str] = &[
            "429",
            "rate limit",
            "rate_limit",
            "ratelimit",
            "too many requests",
            "timeout",
            "timed out",
            "500",
            "502",
            "503",
            "504",
            "overloaded",
            "unavailable",
            "connection",
            "network",
            "temporarily",
        ];
        const PERMANENT_MARKERS: &[&str] = &[
            "401",
            "403",
            "unauthorized",
            "forbidden",
            "invalid api key",
            "authentication",
        ];
        if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
            return ExternalError::Permanent(message);
        }
        if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
            ExternalError::Transient(message)
        } else {
            ExternalError::Permanent(message)
        }
    }
}

/// Errors raised by the task queue itself (not by the document it runs).
#[derive(Debug, Error, PartialEq)]
pub enum QueueError {
    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    /// The requested status change is not allowed from the current state.
    #[error("Task '{task_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },
}

/// A non-fatal error for a single page.
///
/// Stored alongside the [`crate::output::PipelineResult`] when a page fails.
/// The document continues unless every page fails.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageError {
    /// Text recognition failed after retries (or permanently).
    #[error("Page {page}: text extraction failed after {retries} retries: {detail}")]
    ExtractionFailed {
        page: usize,
        retries: u32,
        transient: bool,
        detail: String,
    },

    /// Field extraction failed; the page is still chunked without fields.
    #[error("Page {page}: field parsing failed: {detail}")]
    ParsingFailed {
        page: usize,
        transient: bool,
        detail: String,
    },

    /// Restoration filter chain could not run on this page.
    #[error("Page {page}: preprocessing failed: {detail}")]
    PreprocessingFailed { page: usize, detail: String },

    /// Text recognition exceeded the per-call timeout on every attempt.
    #[error("Page {page}: extraction timed out after {secs}s")]
    Timeout { page: usize, secs: u64 },
}

impl PageError {
    /// 0-based page index the error refers to.
    pub fn page(&self) -> usize {
        match self {
            PageError::ExtractionFailed { page, .. }
            | PageError::ParsingFailed { page, .. }
            | PageError::PreprocessingFailed { page, .. }
            | PageError::Timeout { page, .. } => *page,
        }
    }

    /// Whether this page lost its text (as opposed to only its fields).
    pub fn drops_text(&self) -> bool {
        !matches!(self, PageError::ParsingFailed { .. })
    }

    pub fn is_transient(&self) -> bool {
        match self {
            PageError::ExtractionFailed { transient, .. }
            | PageError::ParsingFailed { transient, .. } => *transient,
            PageError::Timeout { .. } => true,
            PageError::PreprocessingFailed { .. } => false,
        }
    }
}
