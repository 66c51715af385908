//! # docqa
//!
//! Question answering over a private document collection.
//!
//! Documents are extracted to text, chunked, embedded, and stored in
//! SQLite. A query runs hybrid retrieval (vector + keyword, fuzzy fallback),
//! pulls structured entities out of the question, and walks an ordered chain
//! of answer generators: configured LLM providers first, a deterministic
//! rule-based generator last. Every query gets an answer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────┐
//! │  Extractor  │──▶│  Pipeline   │──▶│  SQLite  │
//! │ PDF/Office  │   │ Chunk+Embed │   │ text+vec │
//! └─────────────┘   └──────┬──────┘   └──────────┘
//!                          │
//!              ┌───────────┴───────────┐
//!              ▼                       ▼
//!         ┌──────────┐           ┌──────────┐
//!         │   CLI    │           │   HTTP   │
//!         │ (docqa)  │           │  (axum)  │
//!         └──────────┘           └──────────┘
//! ```
//!
//! The storage-agnostic logic lives in `docqa-core`; this crate supplies
//! the concrete collaborators and the outer surfaces.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the chunk store |
//! | [`extract`] | PDF, Office, HTML, and text extraction |
//! | [`embedding`] | HTTP and local embedding providers |
//! | [`llm`] | HTTP LLM providers and tier construction |
//! | [`server`] | HTTP API |

pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod http;
pub mod llm;
pub mod migrate;
pub mod server;
pub mod sqlite_store;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use docqa_core::health::ProviderHealth;
use docqa_core::Pipeline;
use tracing::{info, warn};

use crate::config::Config;
use crate::extract::DefaultExtractor;
use crate::sqlite_store::SqliteStore;

/// Wire a [`Pipeline`] from configuration: SQLite store, embedder (if any),
/// generator tiers, and the default extractor.
///
/// An embedder that cannot be constructed (missing API key, unknown local
/// model) is logged and skipped; the pipeline then runs keyword-only.
pub async fn build_pipeline(config: &Config) -> Result<Pipeline> {
    let embedder = match embedding::create_embedder(&config.embedding) {
        Ok(embedder) => embedder,
        Err(e) => {
            warn!(error = %e, provider = %config.embedding.provider, "embedding provider unavailable; continuing without vectors");
            None
        }
    };

    let dims = embedder
        .as_ref()
        .map(|e| e.dims())
        .or(config.embedding.dims)
        .unwrap_or(0);
    let store = SqliteStore::open(&config.db.path, dims).await?;

    let health = Arc::new(ProviderHealth::new(Duration::from_secs(
        config.generation.health_ttl_secs,
    )));

    let mut builder = Pipeline::builder(Arc::new(store))
        .extractor(Arc::new(DefaultExtractor))
        .health(health.clone())
        .config(config.pipeline_config());

    if let Some(embedder) = embedder {
        info!(model = embedder.model_name(), dims, "embedding provider ready");
        builder = builder.embedder(embedder);
    }
    for tier in llm::build_tiers(&config.generation, &health)? {
        builder = builder.tier(tier);
    }

    Ok(builder.build())
}
