//! Storage abstraction for chunks and their embeddings.
//!
//! The [`Store`] trait is the only shared mutable state in the system.
//! Implementations must allow concurrent readers while serializing writes
//! per document (see [`DocumentLocks`]), and must be `Send + Sync` to work
//! with async runtimes.
//!
//! Ranking helpers shared by every backend live here so that the in-memory
//! and SQLite stores order results identically:
//!
//! ```text
//! score desc → sequence_index asc → document_id asc → chunk_id asc
//! ```

pub mod locks;
pub mod memory;

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{Chunk, ChunkFilter, StoreStats};

pub use locks::DocumentLocks;
pub use memory::InMemoryStore;

/// A chunk returned from keyword or vector search with its raw score.
///
/// Carries enough information for normalization and hybrid merging
/// without further store round-trips.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    pub document_id: String,
    pub sequence_index: u32,
    pub text: String,
    /// Cosine similarity (vector) or term-frequency score (keyword).
    pub raw_score: f64,
}

impl ChunkCandidate {
    pub fn from_chunk(chunk: &Chunk, raw_score: f64) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            sequence_index: chunk.sequence_index,
            text: chunk.text.clone(),
            raw_score,
        }
    }
}

/// Abstract chunk store.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`put`](Store::put) | Upsert one chunk, optionally with its vector |
/// | [`put_document`](Store::put_document) | Replace a document's full chunk set |
/// | [`nearest`](Store::nearest) | Cosine-similarity search |
/// | [`keyword_search`](Store::keyword_search) | Term-frequency search |
/// | [`chunks`](Store::chunks) | Filtered read-only scan |
/// | [`delete_document`](Store::delete_document) | Remove a document's chunks |
/// | [`set_embedding`](Store::set_embedding) | Attach a vector to a stored chunk |
#[async_trait]
pub trait Store: Send + Sync {
    /// Vector dimensionality this store accepts.
    fn dims(&self) -> usize;

    /// Idempotent upsert keyed by chunk id.
    ///
    /// Fails with [`StoreError::Write`] when `embedding` has the wrong
    /// length. `None` stores the chunk for keyword and fuzzy search only.
    async fn put(&self, chunk: &Chunk, embedding: Option<&[f32]>) -> Result<(), StoreError>;

    /// Replace every chunk of `document_id` with `chunks`.
    ///
    /// `embeddings`, when given, must be parallel to `chunks`. Runs under
    /// the document's write lock so concurrent writers cannot interleave.
    async fn put_document(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        embeddings: Option<&[Vec<f32>]>,
    ) -> Result<(), StoreError>;

    /// Up to `k` chunks by descending cosine similarity to `query`.
    async fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<ChunkCandidate>, StoreError>;

    /// Up to `k` chunks by descending [`keyword_score`].
    async fn keyword_search(
        &self,
        terms: &[String],
        k: usize,
    ) -> Result<Vec<ChunkCandidate>, StoreError>;

    /// Chunks matching `filter`, ordered by `(document_id, sequence_index)`,
    /// then paginated by the filter's offset and limit.
    async fn chunks(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>, StoreError>;

    /// Remove all chunks of a document. Returns how many were removed;
    /// `0` when the document is unknown.
    async fn delete_document(&self, document_id: &str) -> Result<usize, StoreError>;

    /// Ids of stored documents whose chunks came from `source`.
    async fn documents_for_source(&self, source: &str) -> Result<Vec<String>, StoreError>;

    /// Whether any chunk currently has a vector.
    async fn has_embeddings(&self) -> Result<bool, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;

    /// Attach a vector to a chunk stored without one.
    async fn set_embedding(&self, chunk_id: &str, vector: &[f32]) -> Result<(), StoreError>;

    /// Up to `limit` chunks that have no vector, in `(document_id,
    /// sequence_index)` order.
    async fn chunks_without_embeddings(&self, limit: usize) -> Result<Vec<Chunk>, StoreError>;
}

/// Reject vectors whose length differs from the store's dimension.
pub fn check_dims(expected: usize, vector: &[f32]) -> Result<(), StoreError> {
    if vector.len() != expected {
        return Err(StoreError::dimension_mismatch(expected, vector.len()));
    }
    Ok(())
}

/// Lowercased alphanumeric tokens of `text`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Distinct query terms, lowercased, in first-seen order.
pub fn query_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for t in tokenize(text) {
        if !terms.contains(&t) {
            terms.push(t);
        }
    }
    terms
}

/// Term-frequency overlap: `Σ (1 + ln tf)` over distinct terms present in
/// `text`. Zero when no term occurs.
pub fn keyword_score(terms: &[String], text: &str) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let mut tf: HashMap<String, u32> = HashMap::new();
    for token in tokenize(text) {
        *tf.entry(token).or_insert(0) += 1;
    }

    let mut seen: Vec<&str> = Vec::new();
    let mut score = 0.0;
    for term in terms {
        let term = term.as_str();
        if seen.contains(&term) {
            continue;
        }
        seen.push(term);
        if let Some(&count) = tf.get(&term.to_lowercase()) {
            score += 1.0 + (count as f64).ln();
        }
    }
    score
}

/// Deterministic candidate ordering shared by all backends.
pub fn compare_candidates(a: &ChunkCandidate, b: &ChunkCandidate) -> Ordering {
    b.raw_score
        .partial_cmp(&a.raw_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.sequence_index.cmp(&b.sequence_index))
        .then_with(|| a.document_id.cmp(&b.document_id))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

/// Sort with [`compare_candidates`] and keep the first `k`.
pub fn rank(mut candidates: Vec<ChunkCandidate>, k: usize) -> Vec<ChunkCandidate> {
    candidates.sort_by(compare_candidates);
    candidates.truncate(k);
    candidates
}

/// Apply a filter's offset and limit to an already ordered list.
pub fn paginate<T>(items: Vec<T>, filter: &ChunkFilter) -> Vec<T> {
    let iter = items.into_iter().skip(filter.offset);
    match filter.limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    }
}
