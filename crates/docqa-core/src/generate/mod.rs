//! Answer generation as an ordered chain of tiers.
//!
//! Each [`GeneratorTier`] exposes a capability check and an `invoke`
//! operation. The [`GeneratorChain`] walks its tiers in configured order
//! and returns the first answer produced:
//!
//! ```text
//!  tier[i] ──capability_check──► false ──► record Skipped, i += 1
//!     │
//!     └──► true ──invoke (timeout)──► Ok(answer) ──► stamp + return
//!                         │
//!                         └──► Err / timeout ──► log, mark unhealthy, i += 1
//!
//!  i == len ──► NoAnswerAvailable { attempts }
//! ```
//!
//! With a [`RuleBasedTier`] last (it is always capable and cannot fail on
//! valid input) the chain always terminates with an answer. The order is
//! fixed at construction and never changes at runtime.

pub mod llm;
pub mod rule_based;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{AttemptOutcome, PipelineError, TierAttempt, TierFailure};
use crate::health::ProviderHealth;
use crate::models::{Answer, Query, RetrievalResult};

pub use llm::{LlmProvider, LlmTier};
pub use rule_based::RuleBasedTier;

/// Everything a tier sees for one query.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub query: Query,
    pub retrieval: RetrievalResult,
}

/// One answer-producing strategy.
#[async_trait]
pub trait GeneratorTier: Send + Sync {
    /// Stable name, reported as `Answer::generator_used`.
    fn name(&self) -> &str;

    /// Cheap check whether this tier is currently usable.
    async fn capability_check(&self) -> bool;

    async fn invoke(&self, ctx: &GenerationContext) -> Result<Answer, TierFailure>;

    /// True for a tier that is always capable and cannot fail, so the chain
    /// ends with an answer when it is last.
    fn is_terminal(&self) -> bool {
        false
    }
}

pub struct GeneratorChain {
    tiers: Vec<Arc<dyn GeneratorTier>>,
    timeout: Duration,
    health: Arc<ProviderHealth>,
    last_checks: Mutex<BTreeMap<String, bool>>,
}

impl GeneratorChain {
    pub fn new(
        tiers: Vec<Arc<dyn GeneratorTier>>,
        timeout: Duration,
        health: Arc<ProviderHealth>,
    ) -> Self {
        // Until a tier is checked only a terminal tier is known to be usable.
        let seeded: BTreeMap<String, bool> = tiers
            .iter()
            .map(|t| (t.name().to_string(), t.is_terminal()))
            .collect();
        Self {
            tiers,
            timeout,
            health,
            last_checks: Mutex::new(seeded),
        }
    }

    pub fn tier_names(&self) -> Vec<String> {
        self.tiers.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn health(&self) -> &Arc<ProviderHealth> {
        &self.health
    }

    /// Run the chain for one query.
    pub async fn run(&self, ctx: &GenerationContext) -> Result<Answer, PipelineError> {
        let mut attempts = Vec::new();

        for tier in &self.tiers {
            let name = tier.name();

            let capable = tier.capability_check().await;
            self.remember(name, capable);
            if !capable {
                debug!(tier = name, "tier not capable, skipping");
                attempts.push(TierAttempt {
                    tier: name.to_string(),
                    outcome: AttemptOutcome::Skipped,
                });
                continue;
            }

            let failure = match tokio::time::timeout(self.timeout, tier.invoke(ctx)).await {
                Ok(Ok(mut answer)) => {
                    answer.generator_used = name.to_string();
                    answer.retrieval_degraded = ctx.retrieval.degraded;
                    answer.confidence = answer.confidence.clamp(0.0, 1.0);
                    info!(
                        tier = name,
                        confidence = answer.confidence,
                        sources = answer.source_chunk_ids.len(),
                        degraded = answer.retrieval_degraded,
                        "answer generated"
                    );
                    return Ok(answer);
                }
                Ok(Err(failure)) => failure,
                Err(_) => TierFailure::Timeout(self.timeout),
            };

            warn!(tier = name, error = %failure, "tier failed, falling back");
            self.health.mark_unhealthy(name);
            self.remember(name, false);
            attempts.push(TierAttempt {
                tier: name.to_string(),
                outcome: AttemptOutcome::Failed(failure),
            });
        }

        warn!(attempts = attempts.len(), "generator chain exhausted");
        Err(PipelineError::NoAnswerAvailable { attempts })
    }

    /// Run every tier's capability check and return the results.
    pub async fn check_all(&self) -> BTreeMap<String, bool> {
        for tier in &self.tiers {
            let capable = tier.capability_check().await;
            self.remember(tier.name(), capable);
        }
        self.last_checks()
    }

    /// Result of the most recent capability check per tier, without
    /// running any check.
    pub fn last_checks(&self) -> BTreeMap<String, bool> {
        self.last_checks
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    fn remember(&self, tier: &str, capable: bool) {
        if let Ok(mut m) = self.last_checks.lock() {
            m.insert(tier.to_string(), capable);
        }
    }
}
