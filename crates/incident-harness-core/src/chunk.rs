//! Line-boundary chunker for extracted log content.
//!
//! Splits extracted content into [`Chunk`]s that respect a configurable
//! `max_tokens` limit. Splitting happens on line boundaries so every chunk
//! can be cited by an inclusive, 1-based [`LineRange`].
//!
//! Each chunk receives a deterministic UUID (v5) derived from its session ID
//! and index, plus a SHA-256 hash of its text. The hash is also the content
//! key for the embedding cache, so identical log fragments across uploads
//! share one embedding per tenant and model.
//!
//! # Algorithm
//!
//! 1. Convert `max_tokens` to `max_chars` using a 4 chars/token ratio.
//! 2. Accumulate lines into a buffer until the next line would exceed
//!    `max_chars`, then flush the buffer as a chunk.
//! 3. A single line longer than `max_chars` is hard-split on char
//!    boundaries; every piece keeps that line's number as its range.
//! 4. Blank-only content produces no chunks.
//!
//! # Example
//!
//! ```rust
//! use incident_harness_core::chunk::chunk_lines;
//!
//! let chunks = chunk_lines("job-1", "INFO start\nERROR boom\n", 700);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].lines.start, 1);
//! assert_eq!(chunks[0].lines.end, 2);
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Chunk, LineRange};

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Namespace for deterministic chunk ids.
const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x6a0b_51f2_93c4_4d7e_8f10_2b3c_4d5e_6f70);

/// Split `text` into line-aligned chunks of at most `max_tokens`.
pub fn chunk_lines(session_id: &str, text: &str, max_tokens: usize) -> Vec<Chunk> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);

    let mut chunks = Vec::new();
    let mut buf = String::new();
    let mut buf_start = 0usize;
    let mut buf_end = 0usize;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;

        if line.len() > max_chars {
            flush(session_id, &mut chunks, &mut buf, buf_start, buf_end);
            let mut remaining = line;
            while !remaining.is_empty() {
                let split_at = snap_to_char_boundary(remaining, max_chars);
                let split_at = if split_at == 0 {
                    remaining
                        .char_indices()
                        .nth(1)
                        .map(|(i, _)| i)
                        .unwrap_or(remaining.len())
                } else {
                    split_at
                };
                let piece = &remaining[..split_at];
                if !piece.trim().is_empty() {
                    let index = chunks.len() as i64;
                    chunks.push(make_chunk(
                        session_id,
                        index,
                        piece,
                        LineRange {
                            start: line_no,
                            end: line_no,
                        },
                    ));
                }
                remaining = &remaining[split_at..];
            }
            continue;
        }

        let would_be = if buf.is_empty() {
            line.len()
        } else {
            buf.len() + 1 + line.len()
        };
        if would_be > max_chars {
            flush(session_id, &mut chunks, &mut buf, buf_start, buf_end);
        }

        if buf.is_empty() {
            buf_start = line_no;
        } else {
            buf.push('\n');
        }
        buf.push_str(line);
        buf_end = line_no;
    }

    flush(session_id, &mut chunks, &mut buf, buf_start, buf_end);
    chunks
}

fn flush(session_id: &str, chunks: &mut Vec<Chunk>, buf: &mut String, start: usize, end: usize) {
    if buf.trim().is_empty() {
        buf.clear();
        return;
    }
    let index = chunks.len() as i64;
    chunks.push(make_chunk(session_id, index, buf, LineRange { start, end }));
    buf.clear();
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// SHA-256 of `text` as lowercase hex.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(session_id: &str, index: i64, text: &str, lines: LineRange) -> Chunk {
    let id = Uuid::new_v5(
        &CHUNK_NAMESPACE,
        format!("{}:{}", session_id, index).as_bytes(),
    );
    Chunk {
        id: id.to_string(),
        session_id: session_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        lines,
        hash: content_hash(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_lines("s1", "one\ntwo\nthree", 700);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "one\ntwo\nthree");
        assert_eq!(chunks[0].lines, LineRange { start: 1, end: 3 });
    }

    #[test]
    fn test_blank_text_has_no_chunks() {
        assert!(chunk_lines("s1", "", 700).is_empty());
        assert!(chunk_lines("s1", "\n  \n", 700).is_empty());
    }

    #[test]
    fn test_line_ranges_are_contiguous() {
        let text = (1..=40)
            .map(|i| format!("2024-05-01 10:00:{:02} INFO step {}", i, i))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk_lines("s1", &text, 20);
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].lines.start, 1);
        assert_eq!(chunks.last().unwrap().lines.end, 40);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].lines.end + 1, pair[1].lines.start);
        }
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
    }

    #[test]
    fn test_oversized_line_is_split_on_char_boundary() {
        let line = "é".repeat(50);
        let chunks = chunk_lines("s1", &format!("short\n{}", line), 3);
        assert!(chunks.len() > 2);
        for c in &chunks[1..] {
            assert_eq!(c.lines, LineRange { start: 2, end: 2 });
        }
    }

    #[test]
    fn test_ids_and_hashes_are_deterministic() {
        let text = "alpha\nbeta\ngamma\ndelta";
        let a = chunk_lines("s1", text, 2);
        let b = chunk_lines("s1", text, 2);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.id, y.id);
            assert_eq!(x.hash, y.hash);
        }
        let other = chunk_lines("s2", text, 2);
        assert_ne!(a[0].id, other[0].id);
        assert_eq!(a[0].hash, other[0].hash);
    }
}
