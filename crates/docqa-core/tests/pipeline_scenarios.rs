//! End-to-end pipeline scenarios against the in-memory store with fake
//! collaborators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docqa_core::chunk::ChunkerConfig;
use docqa_core::embedding::Embedder;
use docqa_core::generate::{GeneratorTier, LlmProvider, LlmTier, RuleBasedTier};
use docqa_core::health::ProviderHealth;
use docqa_core::models::{ChunkFilter, Decision, Document};
use docqa_core::store::{InMemoryStore, Store};
use docqa_core::{CollaboratorError, Pipeline, PipelineConfig};

const POLICY: &str = "Section 1. Definitions: the insured person means the policyholder named in the schedule.\n\n\
Section 2. Knee surgery is covered for insured persons aged 18-65 years up to ₹2,00,000.\n\n\
Section 3. Cosmetic procedures and dental care are excluded from this policy.";

const CLAIM: &str = "46-year-old male, knee surgery: is it covered?";

// ─── Fakes ───

/// Provider that is configured but whose every call fails.
struct DownProvider {
    configured: bool,
}

#[async_trait]
impl LlmProvider for DownProvider {
    fn kind(&self) -> &str {
        "down"
    }
    fn model(&self) -> &str {
        "down-1"
    }
    fn is_configured(&self) -> bool {
        self.configured
    }
    async fn probe(&self) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::Unavailable("down".into()))
    }
    async fn generate(&self, _: &str, _: &str) -> Result<String, CollaboratorError> {
        Err(CollaboratorError::Unavailable("down".into()))
    }
}

/// Reachable provider that always answers with a fixed JSON decision.
struct JsonProvider;

#[async_trait]
impl LlmProvider for JsonProvider {
    fn kind(&self) -> &str {
        "json"
    }
    fn model(&self) -> &str {
        "json-1"
    }
    fn is_configured(&self) -> bool {
        true
    }
    async fn probe(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }
    async fn generate(&self, _: &str, _: &str) -> Result<String, CollaboratorError> {
        Ok(r#"{"decision":"approved","amount":200000,"justification":"Clause 2 covers knee surgery.","confidence":0.9,"applicable_clauses":["Clause 1"]}"#.into())
    }
}

struct KeywordEmbedder;

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword"
    }
    fn dims(&self) -> usize {
        3
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        Ok(texts
            .iter()
            .map(|t| {
                let t = t.to_lowercase();
                vec![
                    t.matches("knee").count() as f32 + 0.1,
                    t.matches("dental").count() as f32 + 0.1,
                    t.matches("insured").count() as f32 + 0.1,
                ]
            })
            .collect())
    }
}

// ─── Helpers ───

fn config() -> PipelineConfig {
    PipelineConfig {
        chunking: ChunkerConfig {
            max_chars: 120,
            overlap_chars: 0,
        },
        generation_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn llm_tier(name: &str, provider: Arc<dyn LlmProvider>, health: &Arc<ProviderHealth>) -> Arc<dyn GeneratorTier> {
    Arc::new(LlmTier::new(
        name,
        provider,
        health.clone(),
        Duration::from_millis(200),
    ))
}

fn pipeline_with_llms_down(store: Arc<InMemoryStore>) -> Pipeline {
    let health = Arc::new(ProviderHealth::new(Duration::from_secs(60)));
    Pipeline::builder(store)
        .config(config())
        .health(health.clone())
        .tier(llm_tier("primary", Arc::new(DownProvider { configured: false }), &health))
        .tier(llm_tier("secondary", Arc::new(DownProvider { configured: true }), &health))
        .build()
}

// ─── Tests ───

#[tokio::test]
async fn three_chunk_document_answered_by_rule_tier_when_llms_down() {
    let store = Arc::new(InMemoryStore::new(3));
    let pipeline = pipeline_with_llms_down(store.clone());

    let report = pipeline
        .ingest(Document::from_text("policy.txt", POLICY))
        .await
        .unwrap();
    assert_eq!(report.chunk_count, 3);

    let chunks = pipeline
        .search_chunks(&ChunkFilter::for_document(&report.document_id))
        .await
        .unwrap();
    let chunk_2_id = chunks[1].id.clone();
    assert!(chunks[1].text.contains("Knee surgery is covered"));

    let answer = pipeline.query(CLAIM).await.unwrap();
    assert_eq!(answer.generator_used, "rule-based");
    assert!(answer.source_chunk_ids.contains(&chunk_2_id));
    assert!(!answer.retrieval_degraded);

    let fields = answer.structured_fields.unwrap();
    assert_eq!(fields.decision, Decision::Approved);
    assert_eq!(fields.amount, Some(200000.0));

    let health = pipeline.health();
    assert_eq!(health.get("primary"), Some(&false));
    assert_eq!(health.get("secondary"), Some(&false));
    assert_eq!(health.get("rule-based"), Some(&true));
}

#[tokio::test]
async fn empty_store_yields_no_context_answer() {
    let pipeline = pipeline_with_llms_down(Arc::new(InMemoryStore::new(3)));
    let answer = pipeline.query(CLAIM).await.unwrap();
    assert_eq!(answer.generator_used, "rule-based");
    assert!(answer.text.contains("no relevant context"));
    assert!(answer.source_chunk_ids.is_empty());
    assert_eq!(
        answer.structured_fields.unwrap().decision,
        Decision::Rejected
    );
}

#[tokio::test]
async fn reachable_llm_tier_answers_first() {
    let store = Arc::new(InMemoryStore::new(3));
    let health = Arc::new(ProviderHealth::default());
    let pipeline = Pipeline::builder(store)
        .config(config())
        .embedder(Arc::new(KeywordEmbedder))
        .health(health.clone())
        .tier(llm_tier("primary", Arc::new(JsonProvider), &health))
        .build();

    pipeline
        .ingest(Document::from_text("policy.txt", POLICY))
        .await
        .unwrap();
    let answer = pipeline.query(CLAIM).await.unwrap();

    assert_eq!(answer.generator_used, "primary");
    assert!(!answer.retrieval_degraded);
    assert_eq!(answer.source_chunk_ids.len(), 1);
    assert!(answer.source_chunk_ids[0].ends_with(":1"));
    assert!((answer.confidence - 0.9).abs() < 1e-9);
}

#[tokio::test]
async fn delete_then_search_is_empty() {
    let store = Arc::new(InMemoryStore::new(3));
    let pipeline = pipeline_with_llms_down(store.clone());
    let report = pipeline
        .ingest(Document::from_text("policy.txt", POLICY))
        .await
        .unwrap();

    assert_eq!(pipeline.delete(&report.document_id).await.unwrap(), 3);
    assert!(pipeline
        .search_chunks(&ChunkFilter::for_document(&report.document_id))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(pipeline.delete(&report.document_id).await.unwrap(), 0);
    assert_eq!(store.stats().await.unwrap().chunks, 0);
}

#[tokio::test]
async fn repeated_queries_are_deterministic() {
    let store = Arc::new(InMemoryStore::new(3));
    let pipeline = Pipeline::builder(store)
        .config(config())
        .embedder(Arc::new(KeywordEmbedder))
        .build();
    pipeline
        .ingest(Document::from_text("policy.txt", POLICY))
        .await
        .unwrap();

    let a = pipeline.query(CLAIM).await.unwrap();
    let b = pipeline.query(CLAIM).await.unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn concurrent_ingest_and_query() {
    let store = Arc::new(InMemoryStore::new(3));
    let pipeline = Arc::new(
        Pipeline::builder(store.clone())
            .config(config())
            .embedder(Arc::new(KeywordEmbedder))
            .build(),
    );

    let mut handles = Vec::new();
    for i in 0..8 {
        let p = pipeline.clone();
        handles.push(tokio::spawn(async move {
            p.ingest(Document::from_text(format!("policy-{}.txt", i), POLICY))
                .await
                .map(|_| ())
        }));
    }
    for _ in 0..8 {
        let p = pipeline.clone();
        handles.push(tokio::spawn(async move { p.query(CLAIM).await.map(|_| ()) }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.documents, 8);
    assert_eq!(stats.chunks, 24);
    assert_eq!(stats.embedded_chunks, 24);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reingest_of_one_source_keeps_one_document() {
    let store = Arc::new(InMemoryStore::new(3));
    let pipeline = Arc::new(
        Pipeline::builder(store.clone())
            .config(config())
            .embedder(Arc::new(KeywordEmbedder))
            .build(),
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let p = pipeline.clone();
        handles.push(tokio::spawn(async move {
            p.ingest(Document::from_text("policy.txt", POLICY)).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert_eq!(store.documents_for_source("policy.txt").await.unwrap().len(), 1);
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.documents, 1);
    assert_eq!(stats.chunks, 3);
}

#[tokio::test]
async fn llm_tier_named_rule_based_does_not_replace_the_rule_tier() {
    let store = Arc::new(InMemoryStore::new(3));
    let health = Arc::new(ProviderHealth::default());
    let pipeline = Pipeline::builder(store)
        .config(config())
        .health(health.clone())
        .tier(llm_tier("rule-based", Arc::new(DownProvider { configured: true }), &health))
        .build();
    assert_eq!(pipeline.chain().tier_names(), ["rule-based"]);

    pipeline
        .ingest(Document::from_text("policy.txt", POLICY))
        .await
        .unwrap();
    let answer = pipeline.query(CLAIM).await.unwrap();
    assert_eq!(answer.generator_used, "rule-based");
    assert_eq!(
        answer.structured_fields.unwrap().decision,
        Decision::Approved
    );
}

#[tokio::test]
async fn tiers_after_rule_tier_are_dropped() {
    let health = Arc::new(ProviderHealth::default());
    let pipeline = Pipeline::builder(Arc::new(InMemoryStore::new(3)))
        .config(config())
        .health(health.clone())
        .tier(Arc::new(RuleBasedTier::new()))
        .tier(llm_tier("primary", Arc::new(JsonProvider), &health))
        .build();
    assert_eq!(pipeline.chain().tier_names(), ["rule-based"]);
    let answer = pipeline.query(CLAIM).await.unwrap();
    assert_eq!(answer.generator_used, "rule-based");
}

#[tokio::test]
async fn rule_tier_is_appended_when_missing() {
    let pipeline = pipeline_with_llms_down(Arc::new(InMemoryStore::new(3)));
    assert_eq!(
        pipeline.chain().tier_names(),
        ["primary", "secondary", "rule-based"]
    );
    assert!(pipeline.query(CLAIM).await.is_ok());
}
