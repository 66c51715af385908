//! Error taxonomy for docqa-core.
//!
//! Collaborator failures (embedding model, LLM providers) never escape as
//! process-level faults: the retriever turns them into degraded retrieval
//! and the generator chain turns them into tier failures. Store failures
//! during ingest surface to the caller; during query they degrade
//! retrieval instead.

use std::time::Duration;

use thiserror::Error;

use crate::models::DocumentFormat;

/// Failure turning a document's bytes into plain text.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractionError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("{format} extraction failed: {message}")]
    Extraction {
        format: DocumentFormat,
        message: String,
    },
}

/// Persistence-layer failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("store write failed: {0}")]
    Write(String),
    #[error("store read failed: {0}")]
    Read(String),
}

impl StoreError {
    pub fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        StoreError::Write(format!(
            "embedding dimension mismatch: store expects {}, got {}",
            expected, actual
        ))
    }
}

/// Failure of an external collaborator call (embedding model, LLM provider).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollaboratorError {
    #[error("{0} is not configured or unreachable")]
    Unavailable(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("{0}")]
    Other(String),
}

impl CollaboratorError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CollaboratorError::RateLimited(_)
                | CollaboratorError::Timeout(_)
                | CollaboratorError::Other(_)
        )
    }
}

/// Why a single generator tier did not produce an answer.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TierFailure {
    #[error("collaborator failure: {0}")]
    Collaborator(#[from] CollaboratorError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid output: {0}")]
    Invalid(String),
}

/// Record of one tier's outcome within a chain run.
#[derive(Debug, Clone, PartialEq)]
pub struct TierAttempt {
    pub tier: String,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// `capability_check()` returned false; the tier was not invoked.
    Skipped,
    Failed(TierFailure),
}

/// Errors returned by the pipeline coordinator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("no answer available after {} generator tier(s)", attempts.len())]
    NoAnswerAvailable { attempts: Vec<TierAttempt> },
    #[error("request cancelled")]
    Cancelled,
}
