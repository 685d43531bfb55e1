//! Post-processing: deterministic cleanup of model transcriptions.
//!
//! Even a well-prompted vision model occasionally wraps its answer in a code
//! fence, prefixes it with "Here is the transcription:", or leaks zero-width
//! characters. The chunk formatter measures offsets in characters and splits
//! on blank lines, so these artefacts must be gone before chunking or the
//! same page would yield different chunk boundaries from run to run.
//!
//! ## Rule Order
//!
//! Line endings are normalised first so every later rule only has to handle
//! `\n`; fences and preambles are stripped before whitespace trimming so a
//! stripped wrapper cannot leave a dangling blank line behind.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules to a raw transcription.
///
/// Rules (applied in order):
/// 1. Normalise line endings (CRLF / CR → LF)
/// 2. Strip an outer code fence (with or without a language tag)
/// 3. Strip a leading "here is the transcription" style preamble
/// 4. Replace non-breaking and exotic spaces with a plain space
/// 5. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 6. Trim trailing whitespace per line
/// 7. Collapse runs of blank lines to a single blank line
/// 8. Trim the whole text
///
/// Returns an empty string when nothing but whitespace remains.
pub fn clean_transcription(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = strip_outer_fence(&s);
    let s = strip_preamble(&s);
    let s = normalise_spaces(&s);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    s.trim().to_string()
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2: Strip outer fence ────────────────────────────────────────────────

static RE_OUTER_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[A-Za-z0-9_-]*[ \t]*\n(.*?)\n?```\s*$").expect("valid fence regex")
});

fn strip_outer_fence(input: &str) -> String {
    match RE_OUTER_FENCE.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rule 3: Strip preamble ───────────────────────────────────────────────────

static RE_PREAMBLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(here is|here's|below is) (the |a )?(full |complete )?transcription[^\n]*:\s*\n")
        .expect("valid preamble regex")
});

fn strip_preamble(input: &str) -> String {
    RE_PREAMBLE.replace(input, "").to_string()
}

// ── Rule 4: Normalise spaces ─────────────────────────────────────────────────

fn normalise_spaces(input: &str) -> String {
    input.replace(['\u{00A0}', '\u{2007}', '\u{202F}', '\t'], " ")
}

// ── Rule 5: Remove invisible Unicode characters ──────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 6: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 7: Collapse blank lines ─────────────────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("valid blank-line regex"));

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}
