//! Pipeline stages for handwritten-PDF ingestion.
//!
//! Each submodule implements one transformation step. The external ones
//! (splitter, extractor, parser, embedder) sit behind traits the
//! orchestrator holds as trait objects.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ split ──▶ preprocess ──▶ extract ──▶ postprocess ──▶ parse ──▶ chunk ──▶ embed
//! (bytes)   (pdfium)  (restore)      (VLM+encode) (cleanup)      (fields)  (split)   (vectors)
//! ```
//!
//! 1. [`input`]: load a local path or URL and check the `%PDF` signature
//! 2. [`split`]: rasterise every page; runs in `spawn_blocking` because
//!    pdfium is not async-safe
//! 3. [`preprocess`]: grayscale, median, CLAHE, Sauvola; CPU-bound, also
//!    in `spawn_blocking`
//! 4. [`extract`]: one vision call per page, image built by [`encode`]
//! 5. [`postprocess`]: deterministic cleanup of the model's transcription
//! 6. [`parse`]: structured fields from the page text
//! 7. [`chunk`]: overlapping, deterministically identified chunks
//! 8. [`embed`]: batched embedding with per-chunk failure attribution

pub mod chunk;
pub mod embed;
pub mod encode;
pub mod extract;
pub mod input;
pub mod parse;
pub mod postprocess;
pub mod preprocess;
pub mod split;
