//! HTTP and local [`Embedder`] implementations.
//!
//! | Config value | Embedder | Endpoint |
//! |--------------|----------|----------|
//! | `"openai"` | [`OpenAiEmbedder`] | `POST {url}/v1/embeddings` |
//! | `"ollama"` | [`OllamaEmbedder`] | `POST {url}/api/embed` |
//! | `"gemini"` | [`GeminiEmbedder`] | `POST {url}/v1beta/models/{model}:batchEmbedContents` |
//! | `"local"` | `LocalEmbedder` | in-process fastembed (feature `local-embeddings-fastembed`) |
//!
//! Use [`create_embedder`] to build the configured one. All network
//! embedders retry transient failures (see [`crate::http`]).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use docqa_core::embedding::Embedder;
use docqa_core::CollaboratorError;

use crate::config::EmbeddingConfig;
use crate::http;

const OPENAI_URL: &str = "https://api.openai.com";
const OLLAMA_URL: &str = "http://localhost:11434";
const GEMINI_URL: &str = "https://generativelanguage.googleapis.com";

fn required_model(config: &EmbeddingConfig) -> Result<String> {
    config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required for {} provider", config.provider))
}

fn required_dims(config: &EmbeddingConfig) -> Result<usize> {
    config
        .dims
        .ok_or_else(|| anyhow::anyhow!("embedding.dims required for {} provider", config.provider))
}

fn env_key(var: &str) -> Result<String> {
    std::env::var(var).map_err(|_| anyhow::anyhow!("{} environment variable not set", var))
}

/// Reject responses that do not line up with the request.
fn check_shape(
    label: &str,
    vectors: Vec<Vec<f32>>,
    expected: usize,
    dims: usize,
) -> Result<Vec<Vec<f32>>, CollaboratorError> {
    if vectors.len() != expected {
        return Err(CollaboratorError::Malformed(format!(
            "{} returned {} embeddings for {} inputs",
            label,
            vectors.len(),
            expected
        )));
    }
    if let Some(v) = vectors.iter().find(|v| v.len() != dims) {
        return Err(CollaboratorError::Malformed(format!(
            "{} returned a {}-dimensional embedding, expected {}",
            label,
            v.len(),
            dims
        )));
    }
    Ok(vectors)
}

// ============ OpenAI ============

/// Calls the OpenAI embeddings API. Requires `OPENAI_API_KEY`.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
    max_retries: u32,
    timeout: Duration,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        Ok(Self {
            client: http::client(timeout)?,
            url: config.url.clone().unwrap_or_else(|| OPENAI_URL.to_string()),
            api_key: env_key("OPENAI_API_KEY")?,
            model: required_model(config)?,
            dims: required_dims(config)?,
            max_retries: config.max_retries,
            timeout,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let url = format!("{}/v1/embeddings", self.url.trim_end_matches('/'));
        let json = http::send_json("OpenAI", self.max_retries, self.timeout, || {
            self.client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
        })
        .await?;
        check_shape("OpenAI", parse_openai_response(&json)?, texts.len(), self.dims)
    }
}

/// `data[].embedding`, reordered by `data[].index`.
pub fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, CollaboratorError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| CollaboratorError::Malformed("OpenAI response missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| CollaboratorError::Malformed("OpenAI response missing embedding".into()))?;
        indexed.push((index, http::float_array(embedding, "embedding")?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// Calls a local Ollama instance (`ollama pull nomic-embed-text` first).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    max_retries: u32,
    timeout: Duration,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        Ok(Self {
            client: http::client(timeout)?,
            url: config.url.clone().unwrap_or_else(|| OLLAMA_URL.to_string()),
            model: required_model(config)?,
            dims: required_dims(config)?,
            max_retries: config.max_retries,
            timeout,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let url = format!("{}/api/embed", self.url.trim_end_matches('/'));
        let json = http::send_json("Ollama", self.max_retries, self.timeout, || {
            self.client.post(&url).json(&body)
        })
        .await?;
        check_shape("Ollama", parse_ollama_response(&json)?, texts.len(), self.dims)
    }
}

pub fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, CollaboratorError> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| CollaboratorError::Malformed("Ollama response missing embeddings array".into()))?
        .iter()
        .map(|e| http::float_array(e, "embedding"))
        .collect()
}

// ============ Gemini ============

/// Calls the Gemini batch embedding endpoint. Requires `GEMINI_API_KEY`.
pub struct GeminiEmbedder {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
    max_retries: u32,
    timeout: Duration,
}

impl GeminiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let model = required_model(config)?;
        Ok(Self {
            client: http::client(timeout)?,
            url: config.url.clone().unwrap_or_else(|| GEMINI_URL.to_string()),
            api_key: env_key("GEMINI_API_KEY")?,
            model: model.trim_start_matches("models/").to_string(),
            dims: required_dims(config)?,
            max_retries: config.max_retries,
            timeout,
        })
    }
}

#[async_trait]
impl Embedder for GeminiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        let model_path = format!("models/{}", self.model);
        let requests: Vec<serde_json::Value> = texts
            .iter()
            .map(|t| {
                serde_json::json!({
                    "model": model_path,
                    "content": { "parts": [{ "text": t }] },
                    "taskType": "RETRIEVAL_DOCUMENT",
                })
            })
            .collect();
        let body = serde_json::json!({ "requests": requests });
        let url = format!(
            "{}/v1beta/{}:batchEmbedContents",
            self.url.trim_end_matches('/'),
            model_path
        );
        let json = http::send_json("Gemini", self.max_retries, self.timeout, || {
            self.client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&body)
        })
        .await?;
        check_shape("Gemini", parse_gemini_response(&json)?, texts.len(), self.dims)
    }
}

pub fn parse_gemini_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, CollaboratorError> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| CollaboratorError::Malformed("Gemini response missing embeddings array".into()))?
        .iter()
        .map(|e| {
            let values = e
                .get("values")
                .ok_or_else(|| CollaboratorError::Malformed("Gemini embedding missing values".into()))?;
            http::float_array(values, "embedding")
        })
        .collect()
}

// ============ Local (fastembed) ============

/// In-process embeddings. The model is downloaded from Hugging Face on
/// first use and cached; later runs need no network.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let (kind, default_dims) = match model_name.as_str() {
            "all-minilm-l6-v2" => (fastembed::EmbeddingModel::AllMiniLML6V2, 384),
            "bge-small-en-v1.5" => (fastembed::EmbeddingModel::BGESmallENV15, 384),
            "bge-base-en-v1.5" => (fastembed::EmbeddingModel::BGEBaseENV15, 768),
            "nomic-embed-text-v1.5" => (fastembed::EmbeddingModel::NomicEmbedTextV15, 768),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported models: \
                 all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, nomic-embed-text-v1.5",
                other
            ),
        };
        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(kind).with_show_download_progress(false),
        )
        .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;

        Ok(Self {
            model_name,
            dims: config.dims.unwrap_or(default_dims),
            model: Arc::new(std::sync::Mutex::new(model)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        let model = self.model.clone();
        let texts = texts.to_vec();
        let expected = texts.len();
        let vectors = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| CollaboratorError::Other("local model lock poisoned".into()))?;
            model
                .embed(texts, None)
                .map_err(|e| CollaboratorError::Other(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| CollaboratorError::Other(format!("embedding task failed: {}", e)))??;
        check_shape("local", vectors, expected, self.dims)
    }
}

/// Build the configured embedder; `None` when embeddings are disabled.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Option<Arc<dyn Embedder>>> {
    let embedder: Arc<dyn Embedder> = match config.provider.as_str() {
        "disabled" => return Ok(None),
        "openai" => Arc::new(OpenAiEmbedder::new(config)?),
        "ollama" => Arc::new(OllamaEmbedder::new(config)?),
        "gemini" => Arc::new(GeminiEmbedder::new(config)?),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Arc::new(LocalEmbedder::new(config)?),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    };
    Ok(Some(embedder))
}
