//! Recursive boundary-aware text splitter.
//!
//! Splits text into overlapping windows of at most `chunk_size` characters,
//! preferring to break at paragraph boundaries, then line boundaries, then
//! word boundaries, and only splitting inside a word as a last resort.
//!
//! # Algorithm
//!
//! 1. Pick the first separator from `["\n\n", "\n", " ", ""]` that occurs
//!    in the text (the empty separator splits into characters).
//! 2. Split on it. Pieces shorter than `chunk_size` are queued for merging;
//!    longer pieces are split recursively with the remaining separators.
//! 3. Queued pieces are greedily re-joined with the separator into windows
//!    of at most `chunk_size` characters. When a window is flushed, pieces
//!    are dropped from its front until at most `chunk_overlap` characters
//!    remain, and those carry over into the next window.
//!
//! Lengths are measured in characters, not bytes, so multi-byte text never
//! splits inside a code point.
//!
//! # Example
//!
//! ```rust
//! use llm_relay_core::chunk::{split_text, SplitParams};
//!
//! let params = SplitParams { chunk_size: 12, chunk_overlap: 0 };
//! let pieces = split_text("First part.\n\nSecond part.", &params);
//! assert_eq!(pieces, vec!["First part.", "Second part."]);
//! ```

use std::collections::VecDeque;

/// Separators in priority order: paragraph, line, word, character.
pub const DEFAULT_SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Window size and overlap for [`split_text`], both in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitParams {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for SplitParams {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

/// Split `text` into trimmed, non-empty windows.
///
/// Returns an empty vector for empty or whitespace-only text.
pub fn split_text(text: &str, params: &SplitParams) -> Vec<String> {
    if text.trim().is_empty() || params.chunk_size == 0 {
        return Vec::new();
    }
    split_recursive(text, &DEFAULT_SEPARATORS, params)
}

fn split_recursive(text: &str, separators: &[&str], params: &SplitParams) -> Vec<String> {
    let (position, separator) = separators
        .iter()
        .enumerate()
        .find(|(_, sep)| sep.is_empty() || text.contains(**sep))
        .map(|(i, sep)| (i, *sep))
        .unwrap_or((separators.len(), ""));
    let remaining = separators.get(position + 1..).unwrap_or(&[]);

    let pieces: Vec<&str> = if separator.is_empty() {
        text.char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect()
    } else {
        text.split(separator).filter(|p| !p.is_empty()).collect()
    };

    let mut out = Vec::new();
    let mut pending: Vec<&str> = Vec::new();

    for piece in pieces {
        if char_len(piece) < params.chunk_size {
            pending.push(piece);
            continue;
        }
        if !pending.is_empty() {
            out.extend(merge_splits(&pending, separator, params));
            pending.clear();
        }
        if remaining.is_empty() {
            let trimmed = piece.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_string());
            }
        } else {
            out.extend(split_recursive(piece, remaining, params));
        }
    }

    if !pending.is_empty() {
        out.extend(merge_splits(&pending, separator, params));
    }

    out
}

/// Greedily join pieces into windows, carrying `chunk_overlap` characters
/// of trailing context into each following window.
fn merge_splits(splits: &[&str], separator: &str, params: &SplitParams) -> Vec<String> {
    let sep_len = char_len(separator);
    let mut windows = Vec::new();
    let mut current: VecDeque<&str> = VecDeque::new();
    let mut total = 0usize;

    for &piece in splits {
        let len = char_len(piece);
        let joiner = |current: &VecDeque<&str>| if current.is_empty() { 0 } else { sep_len };

        if total + len + joiner(&current) > params.chunk_size && !current.is_empty() {
            push_window(&mut windows, &current, separator);

            while total > params.chunk_overlap
                || (total > 0 && total + len + joiner(&current) > params.chunk_size)
            {
                let Some(front) = current.pop_front() else {
                    break;
                };
                total -= char_len(front) + joiner(&current);
            }
        }

        total += len + joiner(&current);
        current.push_back(piece);
    }

    push_window(&mut windows, &current, separator);
    windows
}

fn push_window(windows: &mut Vec<String>, pieces: &VecDeque<&str>, separator: &str) {
    let joined = pieces
        .iter()
        .copied()
        .collect::<Vec<_>>()
        .join(separator);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        windows.push(trimmed.to_string());
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}
