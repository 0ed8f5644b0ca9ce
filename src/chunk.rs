//! Boundary-aware overlapping text chunker.
//!
//! Splits extracted document text into [`TextChunk`]s sized for the
//! embedding model's context window. Chunk ends prefer linguistic
//! boundaries searched inside a window at the tail of each chunk, in
//! order: paragraph break, line break, sentence end, period + space,
//! word boundary, hard cut. Consecutive chunks overlap by a configurable
//! width so local context survives the split, and the cursor snaps
//! forward to the nearest sentence/paragraph/line start after each
//! advance.
//!
//! All sizes are measured in characters, not bytes, so multi-byte text
//! chunks the same as ASCII.

use crate::models::TextChunk;

/// Fraction of the chunk size searched backwards for a break point.
const BREAK_WINDOW_FRACTION: f64 = 0.3;

/// How far the cursor may snap forward to a boundary after an advance.
const SNAP_LOOKAHEAD: usize = 100;

/// Approximate chars-per-token ratio for the embedding model.
const CHARS_PER_TOKEN: usize = 4;

/// Chunking parameters.
#[derive(Debug, Clone, Copy)]
pub struct ChunkOptions {
    /// Target chunk length in characters.
    pub chunk_size: usize,
    /// Overlap between consecutive chunks in characters.
    pub chunk_overlap: usize,
    /// Chunks whose trimmed length falls below this are not emitted.
    pub min_chunk_size: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1500,
            chunk_overlap: 200,
            min_chunk_size: 100,
        }
    }
}

/// Rough token estimate for logging and metrics: `ceil(len / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Split `text` into overlapping, boundary-aware chunks.
///
/// Returns no chunks for empty or whitespace-only input. Input that is
/// non-empty but shorter than `min_chunk_size` yields a single chunk
/// containing the trimmed text. Otherwise chunks tile the input from
/// position 0 to the end with `chunk_overlap` characters shared between
/// neighbors; a tail shorter than the break-search window is absorbed
/// into the final chunk rather than emitted as a runt.
pub fn chunk_text(text: &str, opts: &ChunkOptions) -> Vec<TextChunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();

    if len < opts.min_chunk_size {
        return vec![TextChunk {
            index: 0,
            text: text.trim().to_string(),
            start_offset: 0,
            end_offset: len,
        }];
    }

    let window = (opts.chunk_size as f64 * BREAK_WINDOW_FRACTION) as usize;
    let mut chunks = Vec::new();
    let mut cursor = 0usize;

    while cursor < len {
        let tentative = (cursor + opts.chunk_size).min(len);

        let end = if tentative >= len {
            len
        } else if len - tentative < window {
            // The leftover past this chunk is smaller than the break
            // window; run to the end instead of emitting a runt.
            len
        } else {
            find_break(&chars, cursor, tentative, window)
        };

        let slice: String = chars[cursor..end].iter().collect();
        let trimmed = slice.trim();
        if trimmed.chars().count() >= opts.min_chunk_size {
            chunks.push(TextChunk {
                index: chunks.len(),
                text: trimmed.to_string(),
                start_offset: cursor,
                end_offset: end,
            });
        }

        if end >= len {
            break;
        }

        let advanced = end
            .saturating_sub(opts.chunk_overlap)
            .max(cursor + 1);
        cursor = snap_forward(&chars, advanced, end);
    }

    chunks
}

/// Find the best break point in `[max(cursor, tentative - window), tentative]`.
///
/// Preference order: paragraph break (`\n\n`), line break (`\n`),
/// sentence end (`[.!?]` + whitespace + uppercase), period + space,
/// word boundary (space). Falls back to a hard cut at `tentative`.
/// The returned position is the exclusive end of the chunk, placed just
/// after the matched boundary.
fn find_break(chars: &[char], cursor: usize, tentative: usize, window: usize) -> usize {
    let window_start = tentative.saturating_sub(window).max(cursor);

    // Paragraph break
    if let Some(i) = rfind_seq(chars, window_start, tentative, &['\n', '\n']) {
        return i + 2;
    }
    // Line break
    if let Some(i) = rfind_char(chars, window_start, tentative, '\n') {
        return i + 1;
    }
    // Sentence end: terminal punctuation, whitespace run, then an
    // uppercase letter opening the next sentence.
    if let Some(end) = rfind_sentence_end(chars, window_start, tentative) {
        return end;
    }
    // Period + space (covers sentences not followed by an uppercase start)
    if let Some(i) = rfind_seq(chars, window_start, tentative, &['.', ' ']) {
        return i + 2;
    }
    // Word boundary
    if let Some(i) = rfind_char(chars, window_start, tentative, ' ') {
        return i + 1;
    }

    tentative
}

/// Last occurrence of `needle` fully inside `[start, end)`, scanning backwards.
fn rfind_seq(chars: &[char], start: usize, end: usize, needle: &[char]) -> Option<usize> {
    if end < needle.len() || end - needle.len() < start {
        return None;
    }
    let mut i = end - needle.len();
    loop {
        if chars[i..i + needle.len()] == *needle {
            return Some(i);
        }
        if i == start {
            return None;
        }
        i -= 1;
    }
}

/// Last occurrence of `needle` inside `[start, end)`, scanning backwards.
fn rfind_char(chars: &[char], start: usize, end: usize, needle: char) -> Option<usize> {
    (start..end).rev().find(|&i| chars[i] == needle)
}

/// Last sentence end whose punctuation sits inside `[start, end)`.
///
/// Matches `[.!?]` followed by at least one whitespace character and an
/// uppercase letter; returns the position just after the whitespace run
/// (the start of the next sentence).
fn rfind_sentence_end(chars: &[char], start: usize, end: usize) -> Option<usize> {
    for i in (start..end).rev() {
        if !matches!(chars[i], '.' | '!' | '?') {
            continue;
        }
        let mut j = i + 1;
        while j < chars.len() && chars[j].is_whitespace() {
            j += 1;
        }
        if j > i + 1 && j < chars.len() && chars[j].is_uppercase() {
            return Some(j);
        }
    }
    None
}

/// Snap `from` forward (at most [`SNAP_LOOKAHEAD`] characters) to the
/// nearest sentence, paragraph, or line start, staying strictly before
/// `limit` so the overlap with the previous chunk is preserved.
fn snap_forward(chars: &[char], from: usize, limit: usize) -> usize {
    let stop = (from + SNAP_LOOKAHEAD).min(chars.len()).min(limit);
    for i in from..stop {
        let after_newline = i > 0 && chars[i - 1] == '\n' && chars[i] != '\n';
        let sentence_start = i >= 2
            && chars[i].is_uppercase()
            && chars[i - 1].is_whitespace()
            && matches!(chars[i - 2], '.' | '!' | '?');
        if after_newline || sentence_start {
            return i;
        }
    }
    from
}
