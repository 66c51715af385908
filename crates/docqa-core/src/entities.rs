//! Query entity extraction and classification.
//!
//! [`EntityExtractor`] runs an ordered set of [`ExtractionRule`] trait
//! objects over the raw query text and collects what they find into an
//! [`Entities`] map. Extraction never fails: fields nobody matched are
//! simply absent.
//!
//! The default rule set targets claim-style queries such as
//! `"46M, knee surgery in Pune, 3-month-old policy"`:
//!
//! | Kind | Example match | Stored value |
//! |------|---------------|--------------|
//! | age | `46-year-old`, `46M` | `46` |
//! | gender | `male`, `46M` | `male` |
//! | procedure | `knee surgery` | `knee surgery` |
//! | location | `in Pune` | `pune` |
//! | policy_duration | `3-month-old policy` | `3 months` |
//! | amount | `₹50,000`, `2 lakh` | `50000`, `200000` |
//! | date | `12/03/2024` | `12/03/2024` |

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::models::{Entities, EntityKind, QueryType};

/// One extraction strategy. Rules append to `out`; they never remove.
pub trait ExtractionRule: Send + Sync {
    fn kind(&self) -> EntityKind;
    fn apply(&self, text: &str, out: &mut Entities);
}

type ValueFn = fn(&Captures<'_>) -> Option<String>;

/// A regex with a function that turns each match into a stored value.
pub struct RegexRule {
    kind: EntityKind,
    regex: Regex,
    value: ValueFn,
}

impl RegexRule {
    /// Store capture group 1 if the pattern has one, else the whole match,
    /// lowercased and trimmed.
    pub fn new(kind: EntityKind, pattern: &str) -> Result<Self, regex::Error> {
        Self::with_value(kind, pattern, first_group)
    }

    pub fn with_value(
        kind: EntityKind,
        pattern: &str,
        value: ValueFn,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            kind,
            regex: Regex::new(pattern)?,
            value,
        })
    }
}

impl ExtractionRule for RegexRule {
    fn kind(&self) -> EntityKind {
        self.kind
    }

    fn apply(&self, text: &str, out: &mut Entities) {
        for caps in self.regex.captures_iter(text) {
            if let Some(v) = (self.value)(&caps) {
                out.insert(self.kind, v);
            }
        }
    }
}

fn first_group(caps: &Captures<'_>) -> Option<String> {
    caps.get(1)
        .or_else(|| caps.get(0))
        .map(|m| m.as_str().trim().to_lowercase())
}

fn whole_match(caps: &Captures<'_>) -> Option<String> {
    caps.get(0).map(|m| m.as_str().trim().to_lowercase())
}

fn gender_value(caps: &Captures<'_>) -> Option<String> {
    let raw = caps.get(1)?.as_str().to_lowercase();
    match raw.as_str() {
        "m" | "male" | "man" => Some("male".into()),
        "f" | "female" | "woman" => Some("female".into()),
        _ => None,
    }
}

fn duration_value(caps: &Captures<'_>) -> Option<String> {
    let n: u32 = caps.get(1)?.as_str().parse().ok()?;
    let unit = match caps.get(2)?.as_str().to_lowercase().as_str() {
        "month" => "month",
        _ => "year",
    };
    Some(if n == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", n, unit)
    })
}

fn amount_value(caps: &Captures<'_>) -> Option<String> {
    parse_amount(caps.get(0)?.as_str()).map(format_amount)
}

fn format_amount(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{:.2}", v)
    }
}

static AMOUNT_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+(?:,\d+)*(?:\.\d+)?)").expect("Invalid amount number pattern")
});

static CURRENCY_AMOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:₹|\brs\.?|\binr)\s*(\d+(?:,\d+)*(?:\.\d+)?)")
        .expect("Invalid currency amount pattern")
});

/// Parse a monetary expression (`"₹1,50,000"`, `"Rs. 5000.50"`,
/// `"2 lakh"`, `"1.5 crore"`) into rupees.
pub fn parse_amount(text: &str) -> Option<f64> {
    let lower = text.to_lowercase();
    let number = AMOUNT_NUMBER.captures(&lower)?.get(1)?.as_str().replace(',', "");
    let base: f64 = number.parse().ok()?;
    let multiplier = if lower.contains("crore") {
        10_000_000.0
    } else if lower.contains("lakh") {
        100_000.0
    } else {
        1.0
    };
    Some(base * multiplier)
}

/// First currency-marked amount (`₹`, `Rs.`, `INR`) in `text`.
pub fn find_currency_amount(text: &str) -> Option<f64> {
    let caps = CURRENCY_AMOUNT.captures(text)?;
    caps.get(1)?.as_str().replace(',', "").parse().ok()
}

const DEFAULT_PATTERNS: &[(EntityKind, &str, ValueFn)] = &[
    // age
    (EntityKind::Age, r"(?i)\b(\d{1,3})[\s-]*(?:years?|yrs?)[\s-]*old\b", first_group),
    (EntityKind::Age, r"(?i)\b(\d{1,3})\s*(?:years?|yrs?)\b(?:\s*,|\s+(?:male|female|man|woman)\b)", first_group),
    (EntityKind::Age, r"(?i)\b(\d{1,3})\s*(?:m|f|male|female)\b", first_group),
    (EntityKind::Age, r"(?i)\bage[d]?\s*(?:of\s*)?(\d{1,3})\b", first_group),
    // gender
    (EntityKind::Gender, r"(?i)\b(male|female|man|woman)\b", gender_value),
    (EntityKind::Gender, r"(?i)\b\d{1,3}\s*(m|f)\b", gender_value),
    // procedure
    (EntityKind::Procedure, r"(?i)\b(?:knee|hip|heart|cardiac|brain|liver|kidney|dental|eye|spine|orthopedic|cataract)\s+(?:surgery|operation|procedure|treatment|replacement|transplant)\b", whole_match),
    (EntityKind::Procedure, r"(?i)\b(?:surgery|operation|procedure|treatment)\b", whole_match),
    (EntityKind::Procedure, r"(?i)\b(?:chemotherapy|radiation|dialysis|physiotherapy|bypass|angioplasty|transplant|replacement|maternity)\b", whole_match),
    // location
    (EntityKind::Location, r"(?i)\b(mumbai|delhi|bangalore|bengaluru|chennai|pune|hyderabad|kolkata|ahmedabad|jaipur|lucknow)\b", first_group),
    (EntityKind::Location, r"\b(?:in|at)\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)*)", first_group),
    (EntityKind::Location, r"\b([A-Z][a-z]+)\s+(?:[Cc]ity|[Hh]ospital|[Cc]linic)\b", first_group),
    // policy duration
    (EntityKind::PolicyDuration, r"(?i)\b(\d+)[\s-]*(month|year|yr)s?[\s-]*(?:old[\s-]*)?(?:insurance[\s-]*)?policy", duration_value),
    (EntityKind::PolicyDuration, r"(?i)\bpolicy\s*(?:of\s*|for\s*)?(\d+)[\s-]*(month|year|yr)s?\b", duration_value),
    (EntityKind::PolicyDuration, r"(?i)\b(\d+)[\s-]*(month|year|yr)s?[\s-]*(?:old\s*)?insurance\b", duration_value),
    // amount
    (EntityKind::Amount, r"(?i)(?:₹|\brs\.?|\binr)\s*\d+(?:,\d+)*(?:\.\d+)?", amount_value),
    (EntityKind::Amount, r"(?i)\b\d+(?:,\d+)*(?:\.\d+)?\s*(?:₹|rs\b\.?|inr\b|rupees\b)", amount_value),
    (EntityKind::Amount, r"(?i)\b\d+(?:\.\d+)?\s*(?:lakh|lac|crore)s?\b", amount_value),
    // date
    (EntityKind::Date, r"\b(\d{4}-\d{2}-\d{2})\b", first_group),
    (EntityKind::Date, r"\b(\d{1,2}[/-]\d{1,2}[/-]\d{2,4})\b", first_group),
    (EntityKind::Date, r"(?i)\b(\d{1,2}\s+(?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?,?\s+\d{4})\b", first_group),
    (EntityKind::Date, r"(?i)\b((?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+\d{1,2},?\s+\d{4})\b", first_group),
];

static DEFAULT_RULES: Lazy<Vec<RegexRule>> = Lazy::new(|| {
    DEFAULT_PATTERNS
        .iter()
        .map(|(kind, pattern, value)| {
            RegexRule::with_value(*kind, pattern, *value).expect("Invalid default entity pattern")
        })
        .collect()
});

/// Runs extraction rules over query text.
pub struct EntityExtractor {
    extra: Vec<Box<dyn ExtractionRule>>,
    use_defaults: bool,
}

impl EntityExtractor {
    /// Extractor with the built-in claim-oriented rules.
    pub fn new() -> Self {
        Self {
            extra: Vec::new(),
            use_defaults: true,
        }
    }

    /// Extractor with no rules at all; add your own with [`with_rule`](Self::with_rule).
    pub fn empty() -> Self {
        Self {
            extra: Vec::new(),
            use_defaults: false,
        }
    }

    /// Append a rule. Custom rules run after the defaults.
    pub fn with_rule(mut self, rule: Box<dyn ExtractionRule>) -> Self {
        self.extra.push(rule);
        self
    }

    pub fn extract(&self, text: &str) -> Entities {
        let mut out = Entities::new();
        if self.use_defaults {
            for rule in DEFAULT_RULES.iter() {
                rule.apply(text, &mut out);
            }
        }
        for rule in &self.extra {
            rule.apply(text, &mut out);
        }
        out
    }

    /// Coarse keyword classification of a query.
    pub fn classify(&self, text: &str) -> Classification {
        classify(text)
    }
}

impl Default for EntityExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Output of [`classify`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub query_type: QueryType,
    pub confidence: f64,
}

const INSURANCE_KEYWORDS: &[&str] = &[
    "surgery", "claim", "coverage", "policy", "insurance", "medical", "treatment", "hospital",
    "procedure", "knee", "hip", "heart",
];

const HR_KEYWORDS: &[&str] = &[
    "leave", "maternity", "paternity", "salary", "employee", "working hours", "notice period",
    "resignation", "bonus", "benefits", "vacation",
];

const LEGAL_KEYWORDS: &[&str] = &[
    "contract", "legal", "compliance", "regulation", "law", "agreement", "terms", "conditions",
    "violation", "breach",
];

/// Classify by counting category keywords (substring match).
///
/// The highest count wins with insurance > hr > legal on ties. Confidence
/// is `min(0.8, 0.4 + 0.1 * count)`, or `0.3` for [`QueryType::General`].
pub fn classify(text: &str) -> Classification {
    let lower = text.to_lowercase();
    let count = |words: &[&str]| words.iter().filter(|w| lower.contains(*w)).count();

    let scores = [
        (QueryType::InsuranceClaim, count(INSURANCE_KEYWORDS)),
        (QueryType::HrPolicy, count(HR_KEYWORDS)),
        (QueryType::LegalCompliance, count(LEGAL_KEYWORDS)),
    ];
    let max = scores.iter().map(|(_, s)| *s).max().unwrap_or(0);
    if max == 0 {
        return Classification {
            query_type: QueryType::General,
            confidence: 0.3,
        };
    }

    let query_type = scores
        .iter()
        .find(|(_, s)| *s == max)
        .map(|(t, _)| *t)
        .unwrap_or(QueryType::General);
    Classification {
        query_type,
        confidence: (0.4 + 0.1 * max as f64).min(0.8),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_query() {
        let e = EntityExtractor::new()
            .extract("46-year-old male, knee surgery in Pune, 3-month-old insurance policy");
        assert_eq!(e.first(EntityKind::Age), Some("46"));
        assert_eq!(e.first(EntityKind::Gender), Some("male"));
        assert!(e.get(EntityKind::Procedure).contains(&"knee surgery".to_string()));
        assert_eq!(e.first(EntityKind::Location), Some("pune"));
        assert_eq!(e.first(EntityKind::PolicyDuration), Some("3 months"));
    }

    #[test]
    fn test_compact_age_gender() {
        let e = EntityExtractor::new().extract("46M, hip replacement, Mumbai");
        assert_eq!(e.first(EntityKind::Age), Some("46"));
        assert_eq!(e.first(EntityKind::Gender), Some("male"));
        assert_eq!(e.first(EntityKind::Location), Some("mumbai"));
        assert!(e.get(EntityKind::Procedure).contains(&"hip replacement".to_string()));
    }

    #[test]
    fn test_amounts() {
        let e = EntityExtractor::new().extract("claim of ₹1,50,000 or Rs. 2000 up to 2 lakh");
        let amounts = e.get(EntityKind::Amount);
        assert!(amounts.contains(&"150000".to_string()));
        assert!(amounts.contains(&"2000".to_string()));
        assert!(amounts.contains(&"200000".to_string()));
    }

    #[test]
    fn test_dates() {
        let e = EntityExtractor::new().extract("admitted on 2024-03-12, discharged 15 March 2024");
        assert_eq!(e.get(EntityKind::Date), ["2024-03-12", "15 march 2024"]);
    }

    #[test]
    fn test_no_matches_is_empty() {
        let e = EntityExtractor::new().extract("hello there");
        assert!(e.is_empty());
        assert!(EntityExtractor::empty().extract("46M knee surgery").is_empty());
    }

    #[test]
    fn test_custom_rule() {
        let rule = RegexRule::new(EntityKind::Procedure, r"(?i)\b(cataract)\b").unwrap();
        let e = EntityExtractor::empty()
            .with_rule(Box::new(rule))
            .extract("Cataract op");
        assert_eq!(e.first(EntityKind::Procedure), Some("cataract"));
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("₹1,50,000"), Some(150000.0));
        assert_eq!(parse_amount("1.5 crore"), Some(15_000_000.0));
        assert_eq!(parse_amount("no digits"), None);
        assert_eq!(find_currency_amount("limit Rs. 25,000 per year"), Some(25000.0));
    }

    #[test]
    fn test_classify() {
        let c = classify("Is knee surgery covered under my insurance policy?");
        assert_eq!(c.query_type, QueryType::InsuranceClaim);
        assert!((c.confidence - 0.8).abs() < 1e-9);

        let c = classify("How many days of maternity leave?");
        assert_eq!(c.query_type, QueryType::HrPolicy);
        assert!((c.confidence - 0.6).abs() < 1e-9);

        let c = classify("hello");
        assert_eq!(c.query_type, QueryType::General);
        assert!((c.confidence - 0.3).abs() < 1e-9);
    }
}
