//! Chunk formatting: split one page's cleaned text into retrieval units.
//!
//! ## Boundaries
//!
//! A chunk holds at most [`ChunkConfig::max_chars`] characters. When the
//! text is longer, the cut is placed at the last paragraph break (`\n\n`)
//! inside the second half of the window, else the last line break, else the
//! last whitespace, else a hard cut. The next chunk starts
//! [`ChunkConfig::overlap_chars`] characters before the cut, moved forward to
//! a word start, so a sentence split across a boundary appears whole in at
//! least one chunk.
//!
//! ## Identity
//!
//! Offsets are counted in `char`s of the cleaned page text and strictly
//! increase along a page. The chunk id is derived from
//! `(file_id, page_index, chunk_index)` only, so a page split into `n`
//! chunks always maps to the same `n` ids, even when a new transcription of
//! it differs slightly.

use crate::config::ChunkConfig;
use crate::model::{chunk_id, Chunk, ParsedInfo};
use serde_json::{json, Value};

/// Identity of the document a page belongs to.
#[derive(Debug, Clone, Copy)]
pub struct DocumentRef<'a> {
    pub file_id: &'a str,
    pub source_file: Option<&'a str>,
}

/// Builds [`Chunk`]s for one page at a time.
#[derive(Debug, Clone)]
pub struct ChunkFormatter {
    config: ChunkConfig,
}

impl ChunkFormatter {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    /// Chunk one page. Empty text yields an empty vector.
    ///
    /// `info` is `None` when field parsing failed for the page; the metadata
    /// then records `fields_parsed: false` and every field as absent.
    pub fn format_page(
        &self,
        doc: DocumentRef<'_>,
        page_index: usize,
        text: &str,
        info: Option<&ParsedInfo>,
    ) -> Vec<Chunk> {
        let fallback = ParsedInfo::default();
        let fields = info.unwrap_or(&fallback);

        split_text(text, &self.config)
            .into_iter()
            .enumerate()
            .map(|(chunk_index, (char_offset, text))| Chunk {
                chunk_id: chunk_id(doc.file_id, page_index, chunk_index),
                file_id: doc.file_id.to_string(),
                page_index,
                chunk_index,
                char_offset,
                metadata: json!({
                    "source_file": doc.source_file,
                    "file_id": doc.file_id,
                    "page_index": page_index,
                    "page_number": page_index + 1,
                    "chunk_index_on_page": chunk_index,
                    "char_offset": char_offset,
                    "fields_parsed": info.is_some(),
                    "client_name": fields.client_name,
                    "document_date": fields.document_date,
                    "signature_found": fields.signature_found,
                    "relevant_illness_mentions": fields.relevant_illness_mentions,
                }),
                text,
            })
            .collect()
    }
}

/// Split `text` into `(char_offset, chunk_text)` pairs.
///
/// Chunk text is trimmed and the offset points at its first non-blank
/// character. Fragments shorter than `min_chunk_chars` are dropped unless
/// they are the only content of the page.
pub fn split_text(text: &str, config: &ChunkConfig) -> Vec<(usize, String)> {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let max = config.max_chars.max(1);
    let mut out: Vec<(usize, String)> = Vec::new();
    let mut start = 0;
    // Lowest start allowed for the next window: one past the last emitted
    // offset, so two chunks never share an offset.
    let mut floor = 0;

    while start < len {
        let hard_end = (start + max).min(len);
        let end = if hard_end == len {
            len
        } else {
            find_break(&chars, start, hard_end)
        };

        let lead = chars[start..end]
            .iter()
            .take_while(|c| c.is_whitespace())
            .count();
        let piece: String = chars[start + lead..end].iter().collect();
        let piece = piece.trim_end();
        if !piece.is_empty() && (piece.chars().count() >= config.min_chunk_chars || out.is_empty()) {
            out.push((start + lead, piece.to_string()));
            floor = start + lead + 1;
        }

        if end >= len {
            break;
        }
        start = next_start(&chars, start, end, config.overlap_chars).max(floor);
    }

    // A lone short fragment is kept only when nothing else survived.
    if out.len() > 1 {
        if let Some(first) = out.first() {
            if first.1.chars().count() < config.min_chunk_chars {
                out.remove(0);
            }
        }
    }
    out
}

/// Position (exclusive) at which to cut the window `start..hard_end`.
fn find_break(chars: &[char], start: usize, hard_end: usize) -> usize {
    let floor = start + ((hard_end - start) / 2).max(1);

    let paragraph = (floor + 1..=hard_end)
        .rev()
        .find(|&p| p >= start + 2 && chars[p - 1] == '\n' && chars[p - 2] == '\n');
    if let Some(p) = paragraph {
        return p;
    }
    let line = (floor + 1..=hard_end).rev().find(|&p| chars[p - 1] == '\n');
    if let Some(p) = line {
        return p;
    }
    let space = (floor + 1..=hard_end)
        .rev()
        .find(|&p| chars[p - 1].is_whitespace());
    space.unwrap_or(hard_end)
}

/// Start of the chunk following a cut at `end`.
fn next_start(chars: &[char], start: usize, end: usize, overlap: usize) -> usize {
    let base = end.saturating_sub(overlap).max(start + 1);
    if overlap == 0 {
        return base;
    }
    let mut next = base;
    while next < end && !chars[next - 1].is_whitespace() {
        next += 1;
    }
    if next >= end {
        base
    } else {
        next
    }
}

/// Value of a metadata key as `usize`, for readers of stored chunks.
pub fn metadata_page_index(metadata: &Value) -> Option<usize> {
    metadata
        .get("page_index")
        .and_then(Value::as_u64)
        .map(|v| v as usize)
}
