//! # docqa core
//!
//! Storage-agnostic logic for docqa: data models, chunking, the store
//! abstraction, hybrid retrieval, entity extraction, and the tiered answer
//! generator chain, tied together by [`pipeline::Pipeline`].
//!
//! This crate performs no network or filesystem I/O of its own. Embedding
//! models, LLM providers, format extractors and persistent stores are
//! supplied by the application through the traits defined here:
//!
//! | Trait | Module |
//! |-------|--------|
//! | [`Store`](store::Store) | [`store`] |
//! | [`Embedder`](embedding::Embedder) | [`embedding`] |
//! | [`LlmProvider`](generate::LlmProvider) | [`generate::llm`] |
//! | [`GeneratorTier`](generate::GeneratorTier) | [`generate`] |
//! | [`FormatExtractor`](extract::FormatExtractor) | [`extract`] |

pub mod chunk;
pub mod embedding;
pub mod entities;
pub mod error;
pub mod extract;
pub mod fuzzy;
pub mod generate;
pub mod health;
pub mod models;
pub mod pipeline;
pub mod retrieve;
pub mod store;

pub use error::{CollaboratorError, ExtractionError, PipelineError, StoreError, TierFailure};
pub use pipeline::{Pipeline, PipelineConfig};
