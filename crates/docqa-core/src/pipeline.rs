//! Pipeline coordinator: wires extraction, chunking, embedding, storage,
//! retrieval, entity extraction and answer generation into the two
//! top-level operations, `ingest` and `query`.
//!
//! # Ingest
//!
//! ```text
//! Document ─► FormatExtractor ─► Chunker ─► Embedder (batched, timeout)
//!                                               │ failure: store without vectors
//!                                               ▼
//!                          Store::put_document ─► delete superseded documents
//! ```
//!
//! # Query
//!
//! ```text
//!        ┌─► EntityExtractor ──┐
//! text ──┤                     ├─► GeneratorChain ─► Answer
//!        └─► HybridRetriever ──┘
//! ```
//!
//! Store errors during ingest surface to the caller; during query they
//! only degrade retrieval. Collaborator failures never escape as errors.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::chunk::{Chunker, ChunkerConfig};
use crate::embedding::Embedder;
use crate::entities::EntityExtractor;
use crate::error::{PipelineError, StoreError};
use crate::extract::{FormatExtractor, PlainTextExtractor};
use crate::generate::rule_based::RULE_BASED_TIER;
use crate::generate::{GenerationContext, GeneratorChain, GeneratorTier, RuleBasedTier};
use crate::health::ProviderHealth;
use crate::models::{
    Answer, Chunk, ChunkFilter, ChunkMetadata, Document, IngestReport, Query, StoreStats,
};
use crate::retrieve::{HybridRetriever, RetrieverConfig};
use crate::store::{DocumentLocks, Store};

/// Tuning knobs for the coordinator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub chunking: ChunkerConfig,
    pub retrieval: RetrieverConfig,
    /// Hits passed to the generator chain.
    pub top_k: usize,
    pub embed_batch_size: usize,
    /// Per-batch timeout for ingest-time embedding.
    pub embed_timeout: Duration,
    /// Per-tier timeout for answer generation.
    pub generation_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkerConfig::default(),
            retrieval: RetrieverConfig::default(),
            top_k: 5,
            embed_batch_size: 32,
            embed_timeout: Duration::from_secs(30),
            generation_timeout: Duration::from_secs(30),
        }
    }
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    embedder: Option<Arc<dyn Embedder>>,
    extractor: Arc<dyn FormatExtractor>,
    entities: EntityExtractor,
    chunker: Chunker,
    retriever: HybridRetriever,
    chain: GeneratorChain,
    source_locks: DocumentLocks,
    config: PipelineConfig,
}

pub struct PipelineBuilder {
    store: Arc<dyn Store>,
    embedder: Option<Arc<dyn Embedder>>,
    extractor: Option<Arc<dyn FormatExtractor>>,
    entities: Option<EntityExtractor>,
    tiers: Vec<Arc<dyn GeneratorTier>>,
    health: Option<Arc<ProviderHealth>>,
    config: PipelineConfig,
}

impl PipelineBuilder {
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn FormatExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn entity_extractor(mut self, entities: EntityExtractor) -> Self {
        self.entities = Some(entities);
        self
    }

    /// Append a generator tier. Tiers run in the order they are added.
    pub fn tier(mut self, tier: Arc<dyn GeneratorTier>) -> Self {
        self.tiers.push(tier);
        self
    }

    /// Share a health cache with tiers built outside the pipeline.
    pub fn health(mut self, health: Arc<ProviderHealth>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the pipeline.
    ///
    /// The chain always ends with exactly one terminal tier. A non-terminal
    /// tier that claims the reserved `rule-based` name is dropped, as are
    /// tiers added after a terminal tier, since they could never run. When
    /// no terminal tier was added a [`RuleBasedTier`] is appended.
    pub fn build(mut self) -> Pipeline {
        self.tiers.retain(|t| {
            let impostor = !t.is_terminal() && t.name() == RULE_BASED_TIER;
            if impostor {
                warn!(tier = t.name(), "non-terminal tier uses the reserved rule-based name, dropping it");
            }
            !impostor
        });
        match self.tiers.iter().position(|t| t.is_terminal()) {
            Some(last) => {
                for dropped in self.tiers.drain(last + 1..) {
                    warn!(tier = dropped.name(), "tier follows the terminal tier and can never run, dropping it");
                }
            }
            None => self.tiers.push(Arc::new(RuleBasedTier::new())),
        }
        let health = self.health.unwrap_or_default();
        let retriever = HybridRetriever::new(
            self.store.clone(),
            self.embedder.clone(),
            self.config.retrieval.clone(),
        );
        Pipeline {
            chain: GeneratorChain::new(self.tiers, self.config.generation_timeout, health),
            chunker: Chunker::from_config(&self.config.chunking),
            extractor: self
                .extractor
                .unwrap_or_else(|| Arc::new(PlainTextExtractor)),
            entities: self.entities.unwrap_or_default(),
            store: self.store,
            embedder: self.embedder,
            retriever,
            source_locks: DocumentLocks::new(),
            config: self.config,
        }
    }
}

impl Pipeline {
    pub fn builder(store: Arc<dyn Store>) -> PipelineBuilder {
        PipelineBuilder {
            store,
            embedder: None,
            extractor: None,
            entities: None,
            tiers: Vec::new(),
            health: None,
            config: PipelineConfig::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn chain(&self) -> &GeneratorChain {
        &self.chain
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Extract, chunk, embed and store a document.
    ///
    /// Earlier documents from the same `source` are removed after the new
    /// chunks are written. Concurrent ingests of one source serialize on
    /// that step, so only the last writer's document survives. If the
    /// embedder is missing or fails, chunks are stored without vectors and
    /// remain keyword-searchable.
    pub async fn ingest(&self, document: Document) -> Result<IngestReport, PipelineError> {
        let text = self
            .extractor
            .extract_text(&document.bytes, document.format)?;

        let meta = ChunkMetadata {
            format: document.format,
            source: document.source.clone(),
            created_at: Utc::now(),
        };
        let chunks = self.chunker.chunk(&document.id, &text, &meta);
        let embeddings = self.embed_chunks(&chunks).await;
        let embedded_count = embeddings.as_ref().map(|v| v.len()).unwrap_or(0);

        let _source_guard = self.source_locks.lock(&document.source).await;
        let prior: Vec<String> = self
            .store
            .documents_for_source(&document.source)
            .await?
            .into_iter()
            .filter(|id| id != &document.id)
            .collect();

        self.store
            .put_document(&document.id, &chunks, embeddings.as_deref())
            .await?;

        for old in &prior {
            let removed = self.store.delete_document(old).await?;
            info!(document_id = %old, removed, "superseded document removed");
        }

        info!(
            document_id = %document.id,
            source = %document.source,
            format = %document.format,
            chunks = chunks.len(),
            embedded = embedded_count,
            "document ingested"
        );

        Ok(IngestReport {
            document_id: document.id,
            chunk_count: chunks.len(),
            embedded_count,
            superseded: prior,
        })
    }

    /// Embed all chunk texts in batches. `None` when any batch fails.
    async fn embed_chunks(&self, chunks: &[Chunk]) -> Option<Vec<Vec<f32>>> {
        let embedder = self.embedder.as_ref()?;
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        self.embed_texts(embedder.as_ref(), &texts).await
    }

    async fn embed_texts(&self, embedder: &dyn Embedder, texts: &[String]) -> Option<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.embed_batch_size.max(1)) {
            match tokio::time::timeout(self.config.embed_timeout, embedder.embed_batch(batch)).await {
                Ok(Ok(v)) if v.len() == batch.len() => vectors.extend(v),
                Ok(Ok(v)) => {
                    warn!(
                        expected = batch.len(),
                        got = v.len(),
                        "embedder returned wrong number of vectors, storing without vectors"
                    );
                    return None;
                }
                Ok(Err(e)) => {
                    warn!(model = embedder.model_name(), error = %e, "embedding failed, storing without vectors");
                    return None;
                }
                Err(_) => {
                    warn!(
                        model = embedder.model_name(),
                        timeout = ?self.config.embed_timeout,
                        "embedding timed out, storing without vectors"
                    );
                    return None;
                }
            }
        }
        Some(vectors)
    }

    /// Answer a natural-language query.
    pub async fn query(&self, text: &str) -> Result<Answer, PipelineError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PipelineError::InvalidQuery("query text is empty".into()));
        }

        let analyze = async {
            let entities = self.entities.extract(text);
            let class = self.entities.classify(text);
            (entities, class)
        };
        let ((entities, class), retrieval) =
            tokio::join!(analyze, self.retriever.retrieve(text, self.config.top_k));

        info!(
            query_type = class.query_type.as_str(),
            entities = entities.len(),
            hits = retrieval.len(),
            degraded = retrieval.degraded,
            fuzzy = retrieval.fuzzy_fallback,
            "query analyzed"
        );

        let ctx = GenerationContext {
            query: Query {
                raw_text: text.to_string(),
                entities,
                query_type: class.query_type,
                timestamp: Utc::now(),
            },
            retrieval,
        };
        self.chain.run(&ctx).await
    }

    /// [`query`](Self::query) that stops early when `cancel` resolves.
    ///
    /// In-flight collaborator calls are dropped, releasing any held locks,
    /// and partial results are discarded.
    pub async fn query_with_cancel<F>(&self, text: &str, cancel: F) -> Result<Answer, PipelineError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = cancel => {
                info!("query cancelled by caller");
                Err(PipelineError::Cancelled)
            }
            result = self.query(text) => result,
        }
    }

    /// Read-only chunk inspection.
    pub async fn search_chunks(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>, PipelineError> {
        Ok(self.store.chunks(filter).await?)
    }

    /// Remove a document's chunks. Returns how many were removed.
    pub async fn delete(&self, document_id: &str) -> Result<usize, PipelineError> {
        let removed = self.store.delete_document(document_id).await?;
        info!(document_id, removed, "document deleted");
        Ok(removed)
    }

    /// Last known availability of each tier. Runs no capability check.
    pub fn health(&self) -> BTreeMap<String, bool> {
        self.chain.last_checks()
    }

    /// Run each tier's capability check now and report the results.
    pub async fn check_health(&self) -> BTreeMap<String, bool> {
        self.chain.check_all().await
    }

    pub async fn stats(&self) -> Result<StoreStats, PipelineError> {
        Ok(self.store.stats().await?)
    }

    /// Embed up to `limit` chunks that were stored without vectors.
    ///
    /// Stops at the first failed batch; returns how many chunks gained a
    /// vector.
    pub async fn backfill_embeddings(&self, limit: usize) -> Result<usize, PipelineError> {
        let embedder = match &self.embedder {
            Some(e) => e.clone(),
            None => return Ok(0),
        };

        let pending = self.store.chunks_without_embeddings(limit).await?;
        let mut embedded = 0usize;
        for batch in pending.chunks(self.config.embed_batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = match self.embed_texts(embedder.as_ref(), &texts).await {
                Some(v) => v,
                None => break,
            };
            for (chunk, vector) in batch.iter().zip(vectors.iter()) {
                match self.store.set_embedding(&chunk.id, vector).await {
                    Ok(()) => embedded += 1,
                    Err(e @ StoreError::Write(_)) => {
                        warn!(chunk_id = %chunk.id, error = %e, "could not store backfilled vector");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        info!(embedded, pending = pending.len(), "embedding backfill finished");
        Ok(embedded)
    }
}
