//! LLM-backed generator tier.
//!
//! [`LlmTier`] wraps one [`LlmProvider`] (OpenAI, Gemini, Ollama, ...) and
//! turns retrieved clauses plus extracted entities into a decision prompt.
//! The provider is asked for JSON:
//!
//! ```json
//! {
//!   "decision": "approved|rejected|pending|partial",
//!   "amount": null,
//!   "justification": "...",
//!   "confidence": 0.0,
//!   "applicable_clauses": ["Clause 1"]
//! }
//! ```
//!
//! The first `{` .. last `}` span of the response is parsed; if that fails
//! the text is classified by keywords with a fixed confidence of 0.5.
//!
//! Capability is "provider configured AND reachable", where reachability
//! comes from the shared [`ProviderHealth`] cache and is re-probed only
//! after the TTL lapses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{GenerationContext, GeneratorTier};
use crate::entities::parse_amount;
use crate::error::{CollaboratorError, TierFailure};
use crate::health::ProviderHealth;
use crate::models::{Answer, Decision, RetrievalHit, StructuredFields};

pub const SYSTEM_PROMPT: &str = "You are an expert decision-making assistant for document \
analysis. Analyze the provided context and make accurate decisions based only on the relevant \
clauses.";

const FALLBACK_CONFIDENCE: f64 = 0.5;
const FALLBACK_TEXT_CHARS: usize = 500;

/// A text-generation backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider kind, e.g. `"openai"`.
    fn kind(&self) -> &str;

    fn model(&self) -> &str;

    /// Whether credentials and endpoint are present. No network access.
    fn is_configured(&self) -> bool;

    /// Lightweight reachability check.
    async fn probe(&self) -> Result<(), CollaboratorError>;

    async fn generate(&self, prompt: &str, system: &str) -> Result<String, CollaboratorError>;
}

pub struct LlmTier {
    name: String,
    provider: Arc<dyn LlmProvider>,
    health: Arc<ProviderHealth>,
    probe_timeout: Duration,
}

impl LlmTier {
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn LlmProvider>,
        health: Arc<ProviderHealth>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            health,
            probe_timeout,
        }
    }
}

#[async_trait]
impl GeneratorTier for LlmTier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn capability_check(&self) -> bool {
        if !self.provider.is_configured() {
            self.health.record(&self.name, false);
            return false;
        }
        if let Some(reachable) = self.health.cached(&self.name) {
            return reachable;
        }

        let reachable = match tokio::time::timeout(self.probe_timeout, self.provider.probe()).await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(tier = %self.name, provider = self.provider.kind(), error = %e, "probe failed");
                false
            }
            Err(_) => {
                warn!(tier = %self.name, provider = self.provider.kind(), "probe timed out");
                false
            }
        };
        self.health.record(&self.name, reachable);
        reachable
    }

    async fn invoke(&self, ctx: &GenerationContext) -> Result<Answer, TierFailure> {
        let prompt = build_prompt(ctx);
        debug!(
            tier = %self.name,
            model = self.provider.model(),
            prompt_chars = prompt.len(),
            "invoking provider"
        );
        let raw = self.provider.generate(&prompt, SYSTEM_PROMPT).await?;
        if raw.trim().is_empty() {
            return Err(CollaboratorError::Malformed("empty response".into()).into());
        }
        Ok(parse_response(&raw, &ctx.retrieval.hits))
    }
}

/// Render the decision prompt for one query.
pub fn build_prompt(ctx: &GenerationContext) -> String {
    let query = &ctx.query;
    let mut prompt = String::new();

    prompt.push_str("Analyze the following query and relevant document clauses to make a decision.\n\n");
    prompt.push_str("QUERY INFORMATION:\n");
    prompt.push_str(&format!("- Original query: \"{}\"\n", query.raw_text));
    prompt.push_str(&format!("- Query type: {}\n", query.query_type.as_str()));
    let entities = serde_json::to_string(&query.entities).unwrap_or_else(|_| "{}".into());
    prompt.push_str(&format!("- Extracted entities: {}\n\n", entities));

    prompt.push_str("RELEVANT CLAUSES:\n");
    if ctx.retrieval.hits.is_empty() {
        prompt.push_str("(no relevant clauses were found)\n");
    }
    for (i, hit) in ctx.retrieval.hits.iter().enumerate() {
        prompt.push_str(&format!(
            "Clause {} (id: {}, relevance: {:.2}):\n{}\n---\n",
            i + 1,
            hit.chunk_id,
            hit.score,
            hit.text.trim()
        ));
    }
    if ctx.retrieval.degraded {
        prompt.push_str("Note: retrieval ran in degraded mode; clauses may be incomplete.\n");
    }

    prompt.push_str(
        r#"
Respond with valid JSON only, in this format:
{
  "decision": "approved|rejected|pending|partial",
  "amount": null or a number,
  "justification": "explanation of the decision",
  "confidence": 0.0-1.0,
  "applicable_clauses": ["Clause 1", "Clause 2"]
}

Guidelines:
- "approved": all requirements are met according to the clauses
- "rejected": requirements are not met or the case is explicitly excluded
- "pending": insufficient information or additional verification needed
- "partial": some requirements are met, but not all
For insurance claims check eligibility, waiting periods, exclusions and limits.
"#,
    );
    prompt
}

#[derive(Debug, Deserialize)]
struct LlmDecision {
    decision: Option<String>,
    amount: Option<serde_json::Value>,
    justification: Option<String>,
    confidence: Option<f64>,
    #[serde(default)]
    applicable_clauses: Vec<serde_json::Value>,
}

/// Turn a provider response into an answer (JSON first, keywords second).
pub fn parse_response(raw: &str, hits: &[RetrievalHit]) -> Answer {
    if let Some(parsed) = extract_json(raw) {
        let decision = parsed
            .decision
            .as_deref()
            .and_then(|d| d.parse::<Decision>().ok())
            .unwrap_or(Decision::Pending);
        let amount = parsed.amount.as_ref().and_then(json_amount);
        let sources = resolve_clauses(&parsed.applicable_clauses, hits);
        return Answer {
            text: parsed
                .justification
                .unwrap_or_else(|| "No justification provided".into()),
            confidence: parsed.confidence.unwrap_or(FALLBACK_CONFIDENCE).clamp(0.0, 1.0),
            source_chunk_ids: sources.clone(),
            generator_used: String::new(),
            retrieval_degraded: false,
            structured_fields: Some(StructuredFields {
                decision,
                amount,
                referenced_clauses: sources,
            }),
        };
    }

    let sources: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();
    Answer {
        text: raw.trim().chars().take(FALLBACK_TEXT_CHARS).collect(),
        confidence: FALLBACK_CONFIDENCE,
        source_chunk_ids: sources.clone(),
        generator_used: String::new(),
        retrieval_degraded: false,
        structured_fields: Some(StructuredFields {
            decision: keyword_decision(raw),
            amount: None,
            referenced_clauses: sources,
        }),
    }
}

fn extract_json(raw: &str) -> Option<LlmDecision> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str(&raw[start..=end]) {
        Ok(d) => Some(d),
        Err(e) => {
            debug!(error = %e, "provider response is not valid JSON, using keyword parse");
            None
        }
    }
}

fn json_amount(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => parse_amount(s),
        _ => None,
    }
}

/// Map `applicable_clauses` entries to chunk ids.
///
/// Accepts chunk ids verbatim, clause numbers (`2`, `"2"`) and labels
/// (`"Clause 2"`). Falls back to every retrieved chunk when nothing
/// resolves.
fn resolve_clauses(refs: &[serde_json::Value], hits: &[RetrievalHit]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for r in refs {
        let resolved = match r {
            serde_json::Value::Number(n) => n.as_u64().and_then(|i| by_number(i as usize, hits)),
            serde_json::Value::String(s) => hits
                .iter()
                .find(|h| h.chunk_id == *s)
                .map(|h| h.chunk_id.clone())
                .or_else(|| {
                    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
                    digits.parse().ok().and_then(|i| by_number(i, hits))
                }),
            _ => None,
        };
        if let Some(id) = resolved {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    if ids.is_empty() {
        return hits.iter().map(|h| h.chunk_id.clone()).collect();
    }
    ids
}

fn by_number(n: usize, hits: &[RetrievalHit]) -> Option<String> {
    n.checked_sub(1)
        .and_then(|i| hits.get(i))
        .map(|h| h.chunk_id.clone())
}

/// Keyword classification of free-text output. Negative phrases are
/// checked first so "not covered" does not read as approval.
fn keyword_decision(raw: &str) -> Decision {
    let lower = raw.to_lowercase();
    let any = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    if any(&["rejected", "denied", "not covered", "excluded"]) {
        Decision::Rejected
    } else if any(&["partial", "partially"]) {
        Decision::Partial
    } else if any(&["approved", "accept", "covered", "eligible"]) {
        Decision::Approved
    } else {
        Decision::Pending
    }
}
