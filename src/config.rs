//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/docqa.sqlite"
//!
//! [chunking]
//! max_chars = 1000
//! overlap_chars = 200
//!
//! [retrieval]
//! vector_weight = 0.5
//! keyword_weight = 0.5
//! final_limit = 5
//!
//! [embedding]
//! provider = "openai"          # disabled | openai | ollama | gemini | local
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [[generation.tiers]]
//! name = "gemini"
//! provider = "gemini"
//! model = "gemini-1.5-flash"
//!
//! [[generation.tiers]]
//! name = "openai"
//! provider = "openai"
//! model = "gpt-4o-mini"
//!
//! [server]
//! bind = "127.0.0.1:8000"
//! ```
//!
//! API keys are never read from the file; each provider looks up an
//! environment variable (overridable per tier with `api_key_env`).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use docqa_core::chunk::ChunkerConfig;
use docqa_core::generate::rule_based::RULE_BASED_TIER;
use docqa_core::retrieve::RetrieverConfig;
use docqa_core::PipelineConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_fuzzy_scan_limit")]
    pub fuzzy_scan_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_weight: default_weight(),
            keyword_weight: default_weight(),
            candidate_k: default_candidate_k(),
            final_limit: default_final_limit(),
            fuzzy_scan_limit: default_fuzzy_scan_limit(),
        }
    }
}

fn default_weight() -> f64 {
    0.5
}
fn default_candidate_k() -> usize {
    20
}
fn default_final_limit() -> usize {
    5
}
fn default_fuzzy_scan_limit() -> usize {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama, or an OpenAI-compatible endpoint).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// Per-tier timeout for one answer attempt.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// How long a provider reachability probe stays valid.
    #[serde(default = "default_health_ttl_secs")]
    pub health_ttl_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Tiers in fallback order. A rule-based tier is always appended
    /// unless one is listed explicitly.
    #[serde(default)]
    pub tiers: Vec<TierConfig>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            health_ttl_secs: default_health_ttl_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            tiers: Vec::new(),
        }
    }
}

fn default_health_ttl_secs() -> u64 {
    60
}
fn default_probe_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct TierConfig {
    pub name: String,
    /// `openai`, `gemini`, `ollama`, or `rule-based`.
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_tokens() -> u32 {
    1000
}
fn default_temperature() -> f32 {
    0.1
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

impl Config {
    /// Coordinator settings derived from the file.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            chunking: ChunkerConfig {
                max_chars: self.chunking.max_chars,
                overlap_chars: self.chunking.overlap_chars,
            },
            retrieval: RetrieverConfig {
                vector_weight: self.retrieval.vector_weight,
                keyword_weight: self.retrieval.keyword_weight,
                candidate_k: self.retrieval.candidate_k,
                fuzzy_scan_limit: self.retrieval.fuzzy_scan_limit,
                embed_timeout_ms: self.embedding.timeout_secs * 1000,
            },
            top_k: self.retrieval.final_limit,
            embed_batch_size: self.embedding.batch_size,
            embed_timeout: Duration::from_secs(self.embedding.timeout_secs),
            generation_timeout: Duration::from_secs(self.generation.timeout_secs),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a config document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.max_chars {
        anyhow::bail!("chunking.overlap_chars must be < chunking.max_chars");
    }

    if config.retrieval.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }
    for (name, w) in [
        ("vector_weight", config.retrieval.vector_weight),
        ("keyword_weight", config.retrieval.keyword_weight),
    ] {
        if !(0.0..=1.0).contains(&w) {
            anyhow::bail!("retrieval.{} must be in [0.0, 1.0]", name);
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "gemini" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, gemini, or local.",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.provider != "local" {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    let mut names = HashSet::new();
    let last = config.generation.tiers.len().saturating_sub(1);
    for (i, tier) in config.generation.tiers.iter().enumerate() {
        if !names.insert(tier.name.as_str()) {
            anyhow::bail!("duplicate generation tier name: '{}'", tier.name);
        }
        match tier.provider.as_str() {
            "openai" | "gemini" | "ollama" => {
                if tier.name == RULE_BASED_TIER {
                    anyhow::bail!(
                        "tier name '{}' is reserved for the rule-based provider, not '{}'",
                        RULE_BASED_TIER,
                        tier.provider
                    );
                }
            }
            p if p == RULE_BASED_TIER => {
                if tier.name != RULE_BASED_TIER {
                    anyhow::bail!("the rule-based tier must be named '{}'", RULE_BASED_TIER);
                }
                if i != last {
                    anyhow::bail!("the rule-based tier must be the last generation tier");
                }
            }
            other => anyhow::bail!(
                "Unknown generation provider for tier '{}': '{}'. Must be openai, gemini, ollama, or rule-based.",
                tier.name,
                other
            ),
        }
    }
    if config.generation.timeout_secs == 0 {
        anyhow::bail!("generation.timeout_secs must be > 0");
    }

    Ok(config)
}
