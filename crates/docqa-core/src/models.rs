//! Core data models that flow through ingestion and query.
//!
//! Documents are immutable once ingested; re-uploading the same `source`
//! produces a new [`Document`] that supersedes the old one. Chunks are
//! created by the chunker and never mutated afterwards. Queries, retrieval
//! results, and answers are produced fresh for each `query()` call.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════
// Documents
// ═══════════════════════════════════════════════════════════════════════

/// Declared format of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    PlainText,
    Markdown,
    Html,
    Json,
    Csv,
    Pdf,
    Docx,
    Pptx,
    Xlsx,
}

impl DocumentFormat {
    pub const ALL: [DocumentFormat; 9] = [
        DocumentFormat::PlainText,
        DocumentFormat::Markdown,
        DocumentFormat::Html,
        DocumentFormat::Json,
        DocumentFormat::Csv,
        DocumentFormat::Pdf,
        DocumentFormat::Docx,
        DocumentFormat::Pptx,
        DocumentFormat::Xlsx,
    ];

    /// Canonical MIME type for the format.
    pub fn mime(&self) -> &'static str {
        match self {
            DocumentFormat::PlainText => "text/plain",
            DocumentFormat::Markdown => "text/markdown",
            DocumentFormat::Html => "text/html",
            DocumentFormat::Json => "application/json",
            DocumentFormat::Csv => "text/csv",
            DocumentFormat::Pdf => "application/pdf",
            DocumentFormat::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            DocumentFormat::Pptx => {
                "application/vnd.openxmlformats-officedocument.presentationml.presentation"
            }
            DocumentFormat::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
        }
    }

    /// Short identifier used in metadata and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::PlainText => "plain_text",
            DocumentFormat::Markdown => "markdown",
            DocumentFormat::Html => "html",
            DocumentFormat::Json => "json",
            DocumentFormat::Csv => "csv",
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Docx => "docx",
            DocumentFormat::Pptx => "pptx",
            DocumentFormat::Xlsx => "xlsx",
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        let base = mime.split(';').next().unwrap_or("").trim();
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.mime().eq_ignore_ascii_case(base))
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "txt" | "text" | "log" => Some(DocumentFormat::PlainText),
            "md" | "markdown" => Some(DocumentFormat::Markdown),
            "html" | "htm" => Some(DocumentFormat::Html),
            "json" => Some(DocumentFormat::Json),
            "csv" => Some(DocumentFormat::Csv),
            "pdf" => Some(DocumentFormat::Pdf),
            "docx" => Some(DocumentFormat::Docx),
            "pptx" => Some(DocumentFormat::Pptx),
            "xlsx" => Some(DocumentFormat::Xlsx),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentFormat {
    type Err = String;

    /// Accepts a MIME type, a short name (`"markdown"`), or an extension.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(f) = Self::from_mime(s) {
            return Ok(f);
        }
        if let Some(f) = Self::ALL.iter().copied().find(|f| f.as_str() == s) {
            return Ok(f);
        }
        Self::from_extension(s).ok_or_else(|| format!("unknown document format: {}", s))
    }
}

/// An uploaded document: raw bytes, declared format, and source identifier.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    /// Caller-supplied identifier (file name, URL). Re-ingesting the same
    /// source supersedes the earlier document.
    pub source: String,
    pub format: DocumentFormat,
    pub bytes: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl Document {
    pub fn new(source: impl Into<String>, format: DocumentFormat, bytes: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            format,
            bytes,
            received_at: Utc::now(),
        }
    }

    /// Convenience constructor for already-plain text.
    pub fn from_text(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(source, DocumentFormat::PlainText, text.into().into_bytes())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Chunks
// ═══════════════════════════════════════════════════════════════════════

/// Half-open character range `[start, end)` into a document's normalized text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharRange {
    pub start: usize,
    pub end: usize,
}

impl CharRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Provenance recorded on every chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub format: DocumentFormat,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// A bounded contiguous slice of a document's text; the unit of retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic id: `"{document_id}:{sequence_index}"`.
    pub id: String,
    pub document_id: String,
    /// Reading order within the document, unique per document.
    pub sequence_index: u32,
    pub text: String,
    pub char_range: CharRange,
    /// SHA-256 of `text`.
    pub hash: String,
    pub metadata: ChunkMetadata,
    /// Vector embedding; `None` until computed or when the embedder was down.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    pub fn make_id(document_id: &str, sequence_index: u32) -> String {
        format!("{}:{}", document_id, sequence_index)
    }

    pub fn has_embedding(&self) -> bool {
        self.embedding.is_some()
    }
}

/// Read-only chunk inspection filter (`search_chunks`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkFilter {
    pub document_id: Option<String>,
    pub source: Option<String>,
    /// Case-insensitive substring match on chunk text.
    pub text_contains: Option<String>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

impl ChunkFilter {
    pub fn for_document(document_id: impl Into<String>) -> Self {
        Self {
            document_id: Some(document_id.into()),
            ..Default::default()
        }
    }

    /// Whether a chunk passes the document, source, and text predicates.
    /// Pagination is applied by the caller after ordering.
    pub fn matches(&self, chunk: &Chunk) -> bool {
        if let Some(ref id) = self.document_id {
            if &chunk.document_id != id {
                return false;
            }
        }
        if let Some(ref src) = self.source {
            if &chunk.metadata.source != src {
                return false;
            }
        }
        if let Some(ref needle) = self.text_contains {
            if !chunk.text.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

/// Counts reported by `stats()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub documents: usize,
    pub chunks: usize,
    pub embedded_chunks: usize,
}

// ═══════════════════════════════════════════════════════════════════════
// Queries and entities
// ═══════════════════════════════════════════════════════════════════════

/// Structured fields the entity extractor can pull from a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Age,
    Gender,
    Procedure,
    Location,
    PolicyDuration,
    Amount,
    Date,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Age => "age",
            EntityKind::Gender => "gender",
            EntityKind::Procedure => "procedure",
            EntityKind::Location => "location",
            EntityKind::PolicyDuration => "policy_duration",
            EntityKind::Amount => "amount",
            EntityKind::Date => "date",
        }
    }
}

/// Extracted entities, keyed by kind. Unmatched kinds are simply absent.
///
/// Values keep first-seen order and are deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entities(BTreeMap<EntityKind, Vec<String>>);

impl Entities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: EntityKind, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            return;
        }
        let values = self.0.entry(kind).or_default();
        if !values.contains(&value) {
            values.push(value);
        }
    }

    pub fn get(&self, kind: EntityKind) -> &[String] {
        self.0.get(&kind).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn first(&self, kind: EntityKind) -> Option<&str> {
        self.get(kind).first().map(|s| s.as_str())
    }

    pub fn contains_kind(&self, kind: EntityKind) -> bool {
        self.0.contains_key(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.values().map(|v| v.len()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityKind, &[String])> {
        self.0.iter().map(|(k, v)| (*k, v.as_slice()))
    }
}

/// Coarse query category, used by the rule-based tier and in prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    InsuranceClaim,
    HrPolicy,
    LegalCompliance,
    General,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::InsuranceClaim => "insurance_claim",
            QueryType::HrPolicy => "hr_policy",
            QueryType::LegalCompliance => "legal_compliance",
            QueryType::General => "general",
        }
    }
}

/// A query for the duration of one `query()` call. Never persisted.
#[derive(Debug, Clone)]
pub struct Query {
    pub raw_text: String,
    pub entities: Entities,
    pub query_type: QueryType,
    pub timestamp: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════
// Retrieval
// ═══════════════════════════════════════════════════════════════════════

/// Which search mode produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Vector,
    Keyword,
    Fuzzy,
}

/// One ranked chunk in a [`RetrievalResult`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalHit {
    pub chunk_id: String,
    pub document_id: String,
    pub sequence_index: u32,
    pub text: String,
    /// Combined score in `[0.0, 1.0]`.
    pub score: f64,
    pub match_kind: MatchKind,
}

/// Ranked, chunk-deduplicated hits for one query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub hits: Vec<RetrievalHit>,
    /// Set when a failing embedder or store kept vector search from running.
    pub degraded: bool,
    /// Set when keyword search found nothing and fuzzy matching was used.
    pub fuzzy_fallback: bool,
}

impl RetrievalResult {
    pub fn empty(degraded: bool) -> Self {
        Self {
            hits: Vec::new(),
            degraded,
            fuzzy_fallback: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn chunk_ids(&self) -> Vec<String> {
        self.hits.iter().map(|h| h.chunk_id.clone()).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Answers
// ═══════════════════════════════════════════════════════════════════════

/// Claim-style decision outcome. `Pending` means "refer for manual review".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approved,
    Rejected,
    Pending,
    Partial,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approved => "approved",
            Decision::Rejected => "rejected",
            Decision::Pending => "pending",
            Decision::Partial => "partial",
        }
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approved" => Ok(Decision::Approved),
            "rejected" => Ok(Decision::Rejected),
            "pending" => Ok(Decision::Pending),
            "partial" => Ok(Decision::Partial),
            other => Err(format!("unknown decision: {}", other)),
        }
    }
}

/// Decision-oriented fields attached to an answer (claims use case).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredFields {
    pub decision: Decision,
    pub amount: Option<f64>,
    /// Chunk ids of the clauses the decision rests on.
    pub referenced_clauses: Vec<String>,
}

/// The response to one query. Immutable after return.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    /// Confidence in `[0.0, 1.0]`.
    pub confidence: f64,
    pub source_chunk_ids: Vec<String>,
    /// Name of the generator tier that produced this answer.
    pub generator_used: String,
    pub retrieval_degraded: bool,
    pub structured_fields: Option<StructuredFields>,
}

/// Result of `ingest()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub chunk_count: usize,
    pub embedded_count: usize,
    /// Ids of earlier documents from the same source that were removed.
    pub superseded: Vec<String>,
}
