//! Hybrid retrieval: vector + keyword, with fuzzy fallback.
//!
//! The retriever operates entirely through the [`Store`] and [`Embedder`]
//! traits. Any collaborator failure degrades the result instead of
//! failing the query.
//!
//! # Algorithm
//!
//! 1. Embed the query (under a timeout) and run [`Store::nearest`]
//!    concurrently with [`Store::keyword_search`].
//! 2. Normalize both candidate sets to `[0, 1]` using min-max
//!    normalization.
//! 3. Merge: `score = w_v × vector + w_k × keyword`, one entry per chunk.
//! 4. Sort by score (desc), then `sequence_index`, `document_id`, chunk id.
//! 5. Truncate to `k`.
//! 6. If both lists came back empty, scan stored chunks with
//!    edit-distance-tolerant matching ([`crate::fuzzy`]).
//!
//! ```text
//!             ┌──────────── embed ─► nearest ───┐
//! query ──────┤                                 ├─► normalize ─► merge ─► hits
//!             └──────── keyword_search ─────────┘        │
//!                                                        └─ (both empty) ─► fuzzy scan
//! ```
//!
//! `degraded` is set when a collaborator the vector half depends on failed:
//! embedding failed or timed out, or the store errored. Running
//! keyword-only because no embedder is configured, or because the store
//! holds no vectors yet, is not degraded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::embedding::Embedder;
use crate::fuzzy::fuzzy_score;
use crate::models::{ChunkFilter, MatchKind, RetrievalHit, RetrievalResult};
use crate::store::{compare_candidates, query_terms, ChunkCandidate, Store};

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrieverConfig {
    pub vector_weight: f64,
    pub keyword_weight: f64,
    /// Candidates fetched from each search mode before merging.
    pub candidate_k: usize,
    /// Upper bound on chunks scanned by the fuzzy fallback.
    pub fuzzy_scan_limit: usize,
    /// Timeout for embedding the query, in milliseconds.
    pub embed_timeout_ms: u64,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            vector_weight: 0.5,
            keyword_weight: 0.5,
            candidate_k: 20,
            fuzzy_scan_limit: 5000,
            embed_timeout_ms: 10_000,
        }
    }
}

pub struct HybridRetriever {
    store: Arc<dyn Store>,
    embedder: Option<Arc<dyn Embedder>>,
    config: RetrieverConfig,
}

/// Outcome of the vector half of a retrieval.
struct VectorOutcome {
    candidates: Vec<ChunkCandidate>,
    degraded: bool,
}

impl HybridRetriever {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Option<Arc<dyn Embedder>>,
        config: RetrieverConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    pub fn config(&self) -> &RetrieverConfig {
        &self.config
    }

    /// Retrieve up to `k` ranked hits for `query_text`. Never fails.
    pub async fn retrieve(&self, query_text: &str, k: usize) -> RetrievalResult {
        let terms = query_terms(query_text);
        if terms.is_empty() || k == 0 {
            return RetrievalResult::empty(false);
        }
        let candidate_k = self.config.candidate_k.max(k);

        let (vector, keyword) = tokio::join!(
            self.vector_candidates(query_text, candidate_k),
            self.keyword_candidates(&terms, candidate_k),
        );
        let (keyword, keyword_failed) = keyword;
        let degraded = vector.degraded || keyword_failed;

        if vector.candidates.is_empty() && keyword.is_empty() {
            let hits = self.fuzzy_candidates(&terms, k).await;
            debug!(hits = hits.len(), "keyword search empty, used fuzzy fallback");
            return RetrievalResult {
                hits,
                degraded,
                fuzzy_fallback: true,
            };
        }

        let hits = merge(
            &vector.candidates,
            &keyword,
            self.config.vector_weight,
            self.config.keyword_weight,
            k,
        );
        RetrievalResult {
            hits,
            degraded,
            fuzzy_fallback: false,
        }
    }

    async fn vector_candidates(&self, query_text: &str, k: usize) -> VectorOutcome {
        let degraded = |candidates| VectorOutcome {
            candidates,
            degraded: true,
        };
        let keyword_only = || VectorOutcome {
            candidates: Vec::new(),
            degraded: false,
        };

        let embedder = match &self.embedder {
            Some(e) => e,
            None => return keyword_only(),
        };

        match self.store.has_embeddings().await {
            Ok(true) => {}
            Ok(false) => return keyword_only(),
            Err(e) => {
                warn!(error = %e, "store unavailable for vector search");
                return degraded(Vec::new());
            }
        }

        let timeout = Duration::from_millis(self.config.embed_timeout_ms);
        let query_vec = match tokio::time::timeout(timeout, embedder.embed(query_text)).await {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                warn!(model = embedder.model_name(), error = %e, "query embedding failed");
                return degraded(Vec::new());
            }
            Err(_) => {
                warn!(model = embedder.model_name(), ?timeout, "query embedding timed out");
                return degraded(Vec::new());
            }
        };

        match self.store.nearest(&query_vec, k).await {
            Ok(candidates) => VectorOutcome {
                candidates,
                degraded: false,
            },
            Err(e) => {
                warn!(error = %e, "vector search failed");
                degraded(Vec::new())
            }
        }
    }

    /// Keyword candidates and whether the store failed.
    async fn keyword_candidates(&self, terms: &[String], k: usize) -> (Vec<ChunkCandidate>, bool) {
        match self.store.keyword_search(terms, k).await {
            Ok(c) => (c, false),
            Err(e) => {
                warn!(error = %e, "keyword search failed");
                (Vec::new(), true)
            }
        }
    }

    async fn fuzzy_candidates(&self, terms: &[String], k: usize) -> Vec<RetrievalHit> {
        let filter = ChunkFilter {
            limit: Some(self.config.fuzzy_scan_limit),
            ..Default::default()
        };
        let chunks = match self.store.chunks(&filter).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "chunk scan failed during fuzzy fallback");
                return Vec::new();
            }
        };

        let candidates: Vec<ChunkCandidate> = chunks
            .iter()
            .filter_map(|c| {
                let s = fuzzy_score(terms, &c.text);
                (s > 0.0).then(|| ChunkCandidate::from_chunk(c, s))
            })
            .collect();

        let mut ranked: Vec<ChunkCandidate> = normalize_scores(&candidates)
            .into_iter()
            .map(|(c, s)| ChunkCandidate {
                raw_score: s,
                ..c.clone()
            })
            .collect();
        ranked.sort_by(compare_candidates);
        ranked.truncate(k);
        ranked
            .into_iter()
            .map(|c| to_hit(c, MatchKind::Fuzzy))
            .collect()
    }
}

/// Combine vector and keyword candidates into ranked hits.
///
/// Pure function of its inputs: the order in which the two searches
/// completed cannot affect the output. A hit's `match_kind` is the mode
/// with the larger weighted contribution (keyword on a tie).
pub fn merge(
    vector: &[ChunkCandidate],
    keyword: &[ChunkCandidate],
    vector_weight: f64,
    keyword_weight: f64,
    k: usize,
) -> Vec<RetrievalHit> {
    let vec_map: HashMap<&str, f64> = normalize_scores(vector)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();
    let kw_map: HashMap<&str, f64> = normalize_scores(keyword)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();

    let mut all: HashMap<&str, &ChunkCandidate> = HashMap::new();
    for c in keyword.iter().chain(vector.iter()) {
        all.entry(c.chunk_id.as_str()).or_insert(c);
    }

    let mut scored: Vec<(ChunkCandidate, MatchKind)> = all
        .into_iter()
        .map(|(id, cand)| {
            let v = vector_weight * vec_map.get(id).copied().unwrap_or(0.0);
            let kw = keyword_weight * kw_map.get(id).copied().unwrap_or(0.0);
            let kind = if v > kw {
                MatchKind::Vector
            } else {
                MatchKind::Keyword
            };
            (
                ChunkCandidate {
                    raw_score: v + kw,
                    ..cand.clone()
                },
                kind,
            )
        })
        .collect();

    scored.sort_by(|a, b| compare_candidates(&a.0, &b.0));
    scored.truncate(k);
    scored.into_iter().map(|(c, kind)| to_hit(c, kind)).collect()
}

fn to_hit(c: ChunkCandidate, match_kind: MatchKind) -> RetrievalHit {
    RetrievalHit {
        chunk_id: c.chunk_id,
        document_id: c.document_id,
        sequence_index: c.sequence_index,
        text: c.text,
        score: c.raw_score,
        match_kind,
    }
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_scores(candidates: &[ChunkCandidate]) -> Vec<(&ChunkCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CollaboratorError, StoreError};
    use crate::models::{CharRange, Chunk, ChunkMetadata, DocumentFormat};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;

    fn cand(id: &str, seq: u32, score: f64) -> ChunkCandidate {
        ChunkCandidate {
            chunk_id: id.into(),
            document_id: "d".into(),
            sequence_index: seq,
            text: String::new(),
            raw_score: score,
        }
    }

    fn chunk(seq: u32, text: &str) -> Chunk {
        Chunk {
            id: Chunk::make_id("d", seq),
            document_id: "d".into(),
            sequence_index: seq,
            text: text.into(),
            char_range: CharRange::new(0, text.len()),
            hash: String::new(),
            metadata: ChunkMetadata {
                format: DocumentFormat::PlainText,
                source: "d.txt".into(),
                created_at: chrono::Utc::now(),
            },
            embedding: None,
        }
    }

    /// Embeds by counting a few fixed words.
    struct WordEmbedder;

    #[async_trait]
    impl Embedder for WordEmbedder {
        fn model_name(&self) -> &str {
            "words"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CollaboratorError> {
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    vec![
                        t.matches("knee").count() as f32 + 0.01,
                        t.matches("dental").count() as f32 + 0.01,
                    ]
                })
                .collect())
        }
    }

    struct DownEmbedder;

    #[async_trait]
    impl Embedder for DownEmbedder {
        fn model_name(&self) -> &str {
            "down"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, _: &[String]) -> Result<Vec<Vec<f32>>, CollaboratorError> {
            Err(CollaboratorError::Unavailable("embedder".into()))
        }
    }

    async fn seeded_store() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new(2));
        let texts = ["knee surgery is covered", "dental care is excluded", "general terms"];
        let vectors = WordEmbedder
            .embed_batch(&texts.iter().map(|t| t.to_string()).collect::<Vec<_>>())
            .await
            .unwrap();
        for (i, (t, v)) in texts.iter().zip(vectors.iter()).enumerate() {
            store.put(&chunk(i as u32, t), Some(v)).await.unwrap();
        }
        store
    }

    #[test]
    fn test_normalize_range() {
        let cands = vec![cand("a", 0, 2.0), cand("b", 1, 4.0), cand("c", 2, 3.0)];
        let n: Vec<f64> = normalize_scores(&cands).iter().map(|(_, s)| *s).collect();
        assert_eq!(n, vec![0.0, 1.0, 0.5]);
    }

    #[test]
    fn test_normalize_all_equal() {
        let cands = vec![cand("a", 0, 0.3), cand("b", 1, 0.3)];
        assert!(normalize_scores(&cands).iter().all(|(_, s)| *s == 1.0));
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_merge_dedupes_and_weights() {
        let vector = vec![cand("a", 0, 0.9), cand("b", 1, 0.1)];
        let keyword = vec![cand("b", 1, 3.0), cand("c", 2, 1.0)];
        let hits = merge(&vector, &keyword, 0.5, 0.5, 10);

        let ids: Vec<_> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(hits[0].score, 0.5);
        assert_eq!(hits[0].match_kind, MatchKind::Vector);
        assert_eq!(hits[1].match_kind, MatchKind::Keyword);
        assert_eq!(hits[2].score, 0.0);
    }

    #[test]
    fn test_merge_input_order_irrelevant() {
        let vector = vec![cand("a", 0, 0.9), cand("b", 1, 0.4), cand("c", 2, 0.4)];
        let keyword = vec![cand("c", 2, 2.0), cand("d", 3, 1.0)];
        let mut vector_rev = vector.clone();
        vector_rev.reverse();
        let mut keyword_rev = keyword.clone();
        keyword_rev.reverse();
        assert_eq!(
            merge(&vector, &keyword, 0.5, 0.5, 10),
            merge(&vector_rev, &keyword_rev, 0.5, 0.5, 10)
        );
    }

    #[tokio::test]
    async fn test_retrieve_empty_store() {
        let store = Arc::new(InMemoryStore::new(2));
        let r = HybridRetriever::new(store, Some(Arc::new(WordEmbedder)), Default::default());
        let result = r.retrieve("knee surgery", 5).await;
        assert!(result.is_empty());
        assert!(!result.degraded);
    }

    #[tokio::test]
    async fn test_retrieve_hybrid() {
        let store = seeded_store().await;
        let r = HybridRetriever::new(store, Some(Arc::new(WordEmbedder)), Default::default());
        let result = r.retrieve("knee surgery", 2).await;
        assert!(!result.degraded);
        assert_eq!(result.hits[0].chunk_id, "d:0");
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn test_retrieve_degrades_when_embedder_fails() {
        let store = seeded_store().await;
        let r = HybridRetriever::new(store, Some(Arc::new(DownEmbedder)), Default::default());
        let result = r.retrieve("dental", 5).await;
        assert!(result.degraded);
        assert_eq!(result.chunk_ids(), vec!["d:1"]);
        assert_eq!(result.hits[0].match_kind, MatchKind::Keyword);
    }

    #[tokio::test]
    async fn test_keyword_only_modes_are_not_degraded() {
        // No embedder configured.
        let store = seeded_store().await;
        let r = HybridRetriever::new(store, None, Default::default());
        let result = r.retrieve("dental", 5).await;
        assert!(!result.degraded);
        assert_eq!(result.chunk_ids(), vec!["d:1"]);

        // Embedder configured, but no chunk has a vector yet.
        let store = Arc::new(InMemoryStore::new(2));
        store.put(&chunk(0, "dental care is excluded"), None).await.unwrap();
        let r = HybridRetriever::new(store, Some(Arc::new(WordEmbedder)), Default::default());
        let result = r.retrieve("dental", 5).await;
        assert!(!result.degraded);
        assert_eq!(result.chunk_ids(), vec!["d:0"]);
    }

    #[tokio::test]
    async fn test_fuzzy_fallback() {
        let store = Arc::new(InMemoryStore::new(2));
        store.put(&chunk(0, "knee surgery is covered"), None).await.unwrap();
        store.put(&chunk(1, "dental care is excluded"), None).await.unwrap();
        let r = HybridRetriever::new(store, None, Default::default());

        let result = r.retrieve("surgury", 5).await;
        assert!(result.fuzzy_fallback);
        assert_eq!(result.chunk_ids(), vec!["d:0"]);
        assert_eq!(result.hits[0].match_kind, MatchKind::Fuzzy);
    }

    #[tokio::test]
    async fn test_deterministic() {
        let store = seeded_store().await;
        let r = HybridRetriever::new(store, Some(Arc::new(WordEmbedder)), Default::default());
        let a = r.retrieve("knee dental terms", 3).await;
        let b = r.retrieve("knee dental terms", 3).await;
        assert_eq!(a, b);
    }

    struct BrokenStore;

    #[async_trait]
    impl Store for BrokenStore {
        fn dims(&self) -> usize {
            2
        }
        async fn put(&self, _: &Chunk, _: Option<&[f32]>) -> Result<(), StoreError> {
            Err(StoreError::Write("down".into()))
        }
        async fn put_document(
            &self,
            _: &str,
            _: &[Chunk],
            _: Option<&[Vec<f32>]>,
        ) -> Result<(), StoreError> {
            Err(StoreError::Write("down".into()))
        }
        async fn nearest(&self, _: &[f32], _: usize) -> Result<Vec<ChunkCandidate>, StoreError> {
            Err(StoreError::Read("down".into()))
        }
        async fn keyword_search(
            &self,
            _: &[String],
            _: usize,
        ) -> Result<Vec<ChunkCandidate>, StoreError> {
            Err(StoreError::Read("down".into()))
        }
        async fn chunks(&self, _: &ChunkFilter) -> Result<Vec<Chunk>, StoreError> {
            Err(StoreError::Read("down".into()))
        }
        async fn delete_document(&self, _: &str) -> Result<usize, StoreError> {
            Err(StoreError::Write("down".into()))
        }
        async fn documents_for_source(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Read("down".into()))
        }
        async fn has_embeddings(&self) -> Result<bool, StoreError> {
            Err(StoreError::Read("down".into()))
        }
        async fn stats(&self) -> Result<crate::models::StoreStats, StoreError> {
            Err(StoreError::Read("down".into()))
        }
        async fn set_embedding(&self, _: &str, _: &[f32]) -> Result<(), StoreError> {
            Err(StoreError::Write("down".into()))
        }
        async fn chunks_without_embeddings(&self, _: usize) -> Result<Vec<Chunk>, StoreError> {
            Err(StoreError::Read("down".into()))
        }
    }

    #[tokio::test]
    async fn test_store_errors_degrade() {
        let r = HybridRetriever::new(
            Arc::new(BrokenStore),
            Some(Arc::new(WordEmbedder)),
            Default::default(),
        );
        let result = r.retrieve("knee", 5).await;
        assert!(result.degraded);
        assert!(result.is_empty());
    }
}
