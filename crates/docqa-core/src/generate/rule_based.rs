//! Deterministic keyword/threshold decisions over retrieved clauses.
//!
//! The terminal tier of every chain. It is always capable and never calls
//! out of process, so the chain cannot run out of tiers on valid input.
//!
//! Each retrieved clause is classified on four signals:
//!
//! | Signal | Detected by |
//! |--------|-------------|
//! | coverage | `covered`, `coverage`, `eligible` (not negated) |
//! | exclusion | `excluded`, `exclusion`, `not covered`, `not eligible` |
//! | procedure match | every word of an extracted procedure appears in the clause |
//! | age fit | query age against an `N-M years` / `between N and M` range |
//!
//! Decision rules, in order:
//!
//! 1. A clause with a procedure match and an exclusion → **rejected**.
//! 2. A clause with coverage, a procedure match, no exclusion and an age
//!    that is not out of range → **approved**.
//! 3. Anything else → **pending** (refer for manual review).

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{GenerationContext, GeneratorTier};
use crate::entities::find_currency_amount;
use crate::error::TierFailure;
use crate::models::{Answer, Decision, EntityKind, Entities, RetrievalHit, StructuredFields};
use crate::store::tokenize;

pub const RULE_BASED_TIER: &str = "rule-based";

const NO_CONTEXT_TEXT: &str = "No relevant policy clauses found to support this request: \
     no relevant context was found in the indexed documents.";

const COVERAGE_TERMS: &[&str] = &["covered", "coverage", "eligible"];
const NEGATED_COVERAGE: &[&str] = &["not covered", "not eligible", "no coverage"];
const EXCLUSION_TERMS: &[&str] = &["excluded", "exclusion", "not covered", "not eligible"];

static AGE_RANGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\d{1,3})\s*(?:-|–|to)\s*(\d{1,3})\s*(?:years?|yrs?)\b")
        .expect("Invalid age range pattern")
});

static AGE_BETWEEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bbetween\s+(\d{1,3})\s+and\s+(\d{1,3})\b").expect("Invalid age between pattern")
});

const CONFIDENCE_DECIDED: f64 = 0.7;
const CONFIDENCE_PENDING: f64 = 0.5;
const CONFIDENCE_NO_CONTEXT: f64 = 0.2;
const DEGRADED_FACTOR: f64 = 0.8;
const EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgeFit {
    InRange,
    OutOfRange,
    Unknown,
}

#[derive(Debug)]
struct ClauseFacts {
    coverage: bool,
    exclusion: bool,
    procedure_match: bool,
    age: AgeFit,
}

impl ClauseFacts {
    fn supports(&self) -> bool {
        self.coverage && self.procedure_match && !self.exclusion && self.age != AgeFit::OutOfRange
    }

    fn excludes(&self) -> bool {
        self.procedure_match && self.exclusion
    }
}

#[derive(Debug, Clone)]
pub struct RuleBasedTier {
    name: String,
}

impl RuleBasedTier {
    pub fn new() -> Self {
        Self {
            name: RULE_BASED_TIER.to_string(),
        }
    }
}

impl Default for RuleBasedTier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GeneratorTier for RuleBasedTier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn capability_check(&self) -> bool {
        true
    }

    fn is_terminal(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: &GenerationContext) -> Result<Answer, TierFailure> {
        Ok(decide(ctx))
    }
}

/// Apply the decision rules to one query context.
pub fn decide(ctx: &GenerationContext) -> Answer {
    let hits = &ctx.retrieval.hits;
    let degraded = ctx.retrieval.degraded;

    if hits.is_empty() {
        return Answer {
            text: NO_CONTEXT_TEXT.to_string(),
            confidence: scale(CONFIDENCE_NO_CONTEXT, degraded),
            source_chunk_ids: Vec::new(),
            generator_used: RULE_BASED_TIER.to_string(),
            retrieval_degraded: degraded,
            structured_fields: Some(StructuredFields {
                decision: Decision::Rejected,
                amount: None,
                referenced_clauses: Vec::new(),
            }),
        };
    }

    let procedures = specific_procedures(&ctx.query.entities);
    let age: Option<u32> = ctx
        .query
        .entities
        .first(EntityKind::Age)
        .and_then(|a| a.parse().ok());

    let facts: Vec<ClauseFacts> = hits.iter().map(|h| analyze(h, &procedures, age)).collect();
    let excluding = select(hits, &facts, ClauseFacts::excludes);
    let supporting = select(hits, &facts, ClauseFacts::supports);
    let procedure_label = procedures
        .first()
        .cloned()
        .unwrap_or_else(|| "the requested procedure".to_string());

    let (decision, sources, amount, text) = if !excluding.is_empty() {
        let ids = ids_of(&excluding);
        let text = format!(
            "Rejected: {} appears to be excluded from coverage under the policy terms. \
             Referenced {} clause(s): {}.",
            procedure_label,
            ids.len(),
            ids.join(", ")
        );
        (Decision::Rejected, ids, None, text)
    } else if !supporting.is_empty() {
        let ids = ids_of(&supporting);
        let amount = supporting.iter().find_map(|h| find_currency_amount(&h.text));
        let mut text = format!(
            "Approved: {} appears to be covered under the policy terms. \
             Referenced {} clause(s): {}.",
            procedure_label,
            ids.len(),
            ids.join(", ")
        );
        if let Some(a) = amount {
            text.push_str(&format!(" Amount stated in policy: ₹{:.0}.", a));
        }
        (Decision::Approved, ids, amount, text)
    } else {
        let ids: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();
        let text = format!(
            "Pending manual review: coverage status is unclear from {} retrieved clause(s). \
             Most relevant clause: \"{}\"",
            ids.len(),
            excerpt(&hits[0].text)
        );
        (Decision::Pending, ids, None, text)
    };

    let base = if decision == Decision::Pending {
        CONFIDENCE_PENDING
    } else {
        CONFIDENCE_DECIDED
    };

    Answer {
        text,
        confidence: scale(base, degraded),
        source_chunk_ids: sources.clone(),
        generator_used: RULE_BASED_TIER.to_string(),
        retrieval_degraded: degraded,
        structured_fields: Some(StructuredFields {
            decision,
            amount,
            referenced_clauses: sources,
        }),
    }
}

fn scale(confidence: f64, degraded: bool) -> f64 {
    if degraded {
        confidence * DEGRADED_FACTOR
    } else {
        confidence
    }
}

fn select<'a>(
    hits: &'a [RetrievalHit],
    facts: &[ClauseFacts],
    pred: fn(&ClauseFacts) -> bool,
) -> Vec<&'a RetrievalHit> {
    hits.iter()
        .zip(facts.iter())
        .filter(|(_, f)| pred(f))
        .map(|(h, _)| h)
        .collect()
}

fn ids_of(hits: &[&RetrievalHit]) -> Vec<String> {
    hits.iter().map(|h| h.chunk_id.clone()).collect()
}

fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= EXCERPT_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(EXCERPT_CHARS).collect();
    format!("{}…", cut.trim_end())
}

/// Extracted procedures minus any that are a substring of a more specific
/// one (`"surgery"` is dropped when `"knee surgery"` is present).
fn specific_procedures(entities: &Entities) -> Vec<String> {
    let all = entities.get(EntityKind::Procedure);
    all.iter()
        .filter(|p| !all.iter().any(|other| other != *p && other.contains(p.as_str())))
        .cloned()
        .collect()
}

fn analyze(hit: &RetrievalHit, procedures: &[String], age: Option<u32>) -> ClauseFacts {
    let lower = hit.text.to_lowercase();

    let mut un_negated = lower.clone();
    for neg in NEGATED_COVERAGE {
        un_negated = un_negated.replace(neg, " ");
    }
    let coverage = COVERAGE_TERMS.iter().any(|t| un_negated.contains(t));
    let exclusion = EXCLUSION_TERMS.iter().any(|t| lower.contains(t));

    let tokens = tokenize(&hit.text);
    let procedure_match = procedures.iter().any(|p| {
        let words = tokenize(p);
        !words.is_empty() && words.iter().all(|w| tokens.contains(w))
    });

    ClauseFacts {
        coverage,
        exclusion,
        procedure_match,
        age: age_fit(&hit.text, age),
    }
}

fn age_fit(text: &str, age: Option<u32>) -> AgeFit {
    let age = match age {
        Some(a) => a,
        None => return AgeFit::Unknown,
    };
    let ranges: Vec<(u32, u32)> = AGE_RANGE
        .captures_iter(text)
        .chain(AGE_BETWEEN.captures_iter(text))
        .filter_map(|c| {
            let lo: u32 = c.get(1)?.as_str().parse().ok()?;
            let hi: u32 = c.get(2)?.as_str().parse().ok()?;
            Some((lo.min(hi), lo.max(hi)))
        })
        .collect();

    if ranges.is_empty() {
        AgeFit::Unknown
    } else if ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&age)) {
        AgeFit::InRange
    } else {
        AgeFit::OutOfRange
    }
}
