//! Boundary-aware overlapping text chunker.
//!
//! Splits a document's normalized text into [`Chunk`]s of at most
//! `max_chars` characters. Consecutive chunks share up to `overlap_chars`
//! characters so that context spanning a boundary is not lost.
//!
//! Each chunk receives a deterministic id derived from its document id and
//! sequence index, plus a SHA-256 hash of its text.
//!
//! # Algorithm
//!
//! 1. If the remaining text fits in one window, emit it and stop.
//! 2. Otherwise look for a split point inside the window, preferring (in
//!    order) a paragraph break, a line break, a sentence end, then any
//!    whitespace. Structural breaks are only taken past a quarter of the
//!    window so chunks do not degenerate into fragments.
//! 3. With no whitespace at all in the window, hard split at the limit.
//! 4. The next chunk starts `overlap_chars` before the previous end,
//!    snapped forward to the start of a word.
//!
//! Offsets are character offsets (not bytes), so multi-byte text is safe.
//!
//! # Example
//!
//! ```rust
//! use docqa_core::chunk::Chunker;
//! use docqa_core::models::{ChunkMetadata, DocumentFormat};
//!
//! let meta = ChunkMetadata {
//!     format: DocumentFormat::PlainText,
//!     source: "notes.txt".into(),
//!     created_at: chrono::Utc::now(),
//! };
//! let chunks = Chunker::new(1000, 200).chunk("doc-1", "Hello world.", &meta);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].id, "doc-1:0");
//! ```

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::models::{CharRange, Chunk, ChunkMetadata};

/// Chunk size and overlap, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ChunkerConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chars: 1000,
            overlap_chars: 200,
        }
    }
}

/// Split-point categories, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Paragraph,
    Line,
    Sentence,
    Whitespace,
}

const STRUCTURAL: [Boundary; 3] = [Boundary::Paragraph, Boundary::Line, Boundary::Sentence];

#[derive(Debug, Clone)]
pub struct Chunker {
    max_chars: usize,
    overlap_chars: usize,
}

impl Chunker {
    /// Overlap is clamped below `max_chars` so every chunk makes progress.
    pub fn new(max_chars: usize, overlap_chars: usize) -> Self {
        let max_chars = max_chars.max(1);
        Self {
            max_chars,
            overlap_chars: overlap_chars.min(max_chars - 1),
        }
    }

    pub fn from_config(config: &ChunkerConfig) -> Self {
        Self::new(config.max_chars, config.overlap_chars)
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn overlap_chars(&self) -> usize {
        self.overlap_chars
    }

    /// Split `text` into chunks with contiguous sequence indices from 0.
    ///
    /// # Guarantees
    ///
    /// - At least one chunk is always returned (even for empty text).
    /// - The first chunk starts at 0, the last ends at the text length.
    /// - Each chunk starts at or before the previous chunk's end, and
    ///   re-covers at most `overlap_chars` of it.
    /// - `chunk.text` is exactly the text at `chunk.char_range`.
    pub fn chunk(&self, document_id: &str, text: &str, meta: &ChunkMetadata) -> Vec<Chunk> {
        let chars: Vec<char> = text.chars().collect();
        let byte_offsets: Vec<usize> = text
            .char_indices()
            .map(|(b, _)| b)
            .chain(std::iter::once(text.len()))
            .collect();
        let n = chars.len();

        let mut chunks = Vec::new();
        let mut start = 0usize;

        loop {
            let end = if n - start <= self.max_chars {
                n
            } else {
                self.find_split(&chars, start, start + self.max_chars)
            };

            let slice = &text[byte_offsets[start]..byte_offsets[end]];
            chunks.push(make_chunk(
                document_id,
                chunks.len() as u32,
                slice,
                CharRange::new(start, end),
                meta,
            ));

            if end >= n {
                break;
            }
            start = self.next_start(&chars, start, end);
        }

        chunks
    }

    /// Pick the exclusive end of the chunk that starts at `start`.
    fn find_split(&self, chars: &[char], start: usize, limit: usize) -> usize {
        let min_structural = start + self.max_chars / 4;
        for kind in STRUCTURAL {
            if let Some(pos) = last_boundary(chars, start, limit, kind) {
                if pos > min_structural {
                    return pos;
                }
            }
        }
        last_boundary(chars, start, limit, Boundary::Whitespace).unwrap_or(limit)
    }

    /// Start of the chunk following `[start, end)`.
    fn next_start(&self, chars: &[char], start: usize, end: usize) -> usize {
        if self.overlap_chars == 0 {
            return end;
        }
        let floor = end.saturating_sub(self.overlap_chars);
        let mut next = floor;
        while next < end && next > 0 && !chars[next - 1].is_whitespace() {
            next += 1;
        }
        if next >= end {
            // No word boundary inside the overlap window.
            next = floor;
        }
        next.max(start + 1)
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::from_config(&ChunkerConfig::default())
    }
}

/// Last split position `p` in `(start, limit]` whose preceding characters
/// form a boundary of `kind`.
fn last_boundary(chars: &[char], start: usize, limit: usize, kind: Boundary) -> Option<usize> {
    (start + 1..=limit).rev().find(|&p| is_boundary(chars, p, kind))
}

fn is_boundary(chars: &[char], p: usize, kind: Boundary) -> bool {
    let prev = chars[p - 1];
    match kind {
        Boundary::Paragraph => prev == '\n' && p >= 2 && chars[p - 2] == '\n',
        Boundary::Line => prev == '\n',
        Boundary::Sentence => {
            prev.is_whitespace() && p >= 2 && matches!(chars[p - 2], '.' | '!' | '?')
        }
        Boundary::Whitespace => prev.is_whitespace(),
    }
}

fn make_chunk(
    document_id: &str,
    index: u32,
    text: &str,
    range: CharRange,
    meta: &ChunkMetadata,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Chunk::make_id(document_id, index),
        document_id: document_id.to_string(),
        sequence_index: index,
        text: text.to_string(),
        char_range: range,
        hash,
        metadata: meta.clone(),
        embedding: None,
    }
}
