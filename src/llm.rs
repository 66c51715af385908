//! HTTP [`LlmProvider`] implementations and tier construction.
//!
//! | Provider | Generate | Probe | Key (default env var) |
//! |----------|----------|-------|------------------------|
//! | `openai` | `POST /v1/chat/completions` | `GET /v1/models` | `OPENAI_API_KEY` |
//! | `gemini` | `POST /v1beta/models/{model}:generateContent` | `GET /v1beta/models/{model}` | `GEMINI_API_KEY` |
//! | `ollama` | `POST /api/chat` | `GET /api/tags` | none |
//!
//! Generation is not retried here: a failing tier hands over to the next
//! one in the chain instead.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use docqa_core::generate::rule_based::RULE_BASED_TIER;
use docqa_core::generate::{GeneratorTier, LlmProvider, LlmTier, RuleBasedTier};
use docqa_core::health::ProviderHealth;
use docqa_core::CollaboratorError;

use crate::config::{GenerationConfig, TierConfig};
use crate::http;

const OPENAI_URL: &str = "https://api.openai.com";
const GEMINI_URL: &str = "https://generativelanguage.googleapis.com";
const OLLAMA_URL: &str = "http://localhost:11434";

/// Settings shared by every HTTP provider.
struct Endpoint {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
}

impl Endpoint {
    fn new(tier: &TierConfig, default_url: &str, default_model: &str, key_var: Option<&str>, timeout: Duration) -> Result<Self> {
        let key_var = tier.api_key_env.as_deref().or(key_var);
        Ok(Self {
            client: http::client(timeout)?,
            url: tier
                .url
                .clone()
                .unwrap_or_else(|| default_url.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: tier.model.clone().unwrap_or_else(|| default_model.to_string()),
            api_key: key_var
                .and_then(|v| std::env::var(v).ok())
                .filter(|k| !k.trim().is_empty()),
            max_tokens: tier.max_tokens,
            temperature: tier.temperature,
            timeout,
        })
    }

    fn key(&self, label: &str) -> Result<&str, CollaboratorError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| CollaboratorError::Unavailable(format!("{} API key not set", label)))
    }
}

fn malformed(label: &str, what: &str) -> CollaboratorError {
    CollaboratorError::Malformed(format!("{} response missing {}", label, what))
}

// ============ OpenAI ============

pub struct OpenAiChat {
    endpoint: Endpoint,
}

impl OpenAiChat {
    pub fn new(tier: &TierConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint: Endpoint::new(tier, OPENAI_URL, "gpt-3.5-turbo", Some("OPENAI_API_KEY"), timeout)?,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiChat {
    fn kind(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.endpoint.model
    }

    fn is_configured(&self) -> bool {
        self.endpoint.api_key.is_some()
    }

    async fn probe(&self) -> Result<(), CollaboratorError> {
        let e = &self.endpoint;
        let request = e
            .client
            .get(format!("{}/v1/models", e.url))
            .bearer_auth(e.key("OpenAI")?);
        http::probe("OpenAI", e.timeout, request).await
    }

    async fn generate(&self, prompt: &str, system: &str) -> Result<String, CollaboratorError> {
        let e = &self.endpoint;
        let key = e.key("OpenAI")?;
        let body = serde_json::json!({
            "model": e.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt },
            ],
            "max_tokens": e.max_tokens,
            "temperature": e.temperature,
        });
        let url = format!("{}/v1/chat/completions", e.url);
        let json = http::send_json("OpenAI", 0, e.timeout, || {
            e.client.post(&url).bearer_auth(key).json(&body)
        })
        .await?;
        parse_openai_chat(&json)
    }
}

pub fn parse_openai_chat(json: &serde_json::Value) -> Result<String, CollaboratorError> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| malformed("OpenAI", "choices[0].message.content"))
}

// ============ Gemini ============

pub struct GeminiChat {
    endpoint: Endpoint,
}

impl GeminiChat {
    pub fn new(tier: &TierConfig, timeout: Duration) -> Result<Self> {
        let mut endpoint = Endpoint::new(tier, GEMINI_URL, "gemini-1.5-flash", Some("GEMINI_API_KEY"), timeout)?;
        endpoint.model = endpoint.model.trim_start_matches("models/").to_string();
        Ok(Self { endpoint })
    }
}

#[async_trait]
impl LlmProvider for GeminiChat {
    fn kind(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.endpoint.model
    }

    fn is_configured(&self) -> bool {
        self.endpoint.api_key.is_some()
    }

    async fn probe(&self) -> Result<(), CollaboratorError> {
        let e = &self.endpoint;
        let request = e
            .client
            .get(format!("{}/v1beta/models/{}", e.url, e.model))
            .header("x-goog-api-key", e.key("Gemini")?);
        http::probe("Gemini", e.timeout, request).await
    }

    async fn generate(&self, prompt: &str, system: &str) -> Result<String, CollaboratorError> {
        let e = &self.endpoint;
        let key = e.key("Gemini")?;
        let body = serde_json::json!({
            "systemInstruction": { "parts": [{ "text": system }] },
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "maxOutputTokens": e.max_tokens,
                "temperature": e.temperature,
            },
        });
        let url = format!("{}/v1beta/models/{}:generateContent", e.url, e.model);
        let json = http::send_json("Gemini", 0, e.timeout, || {
            e.client.post(&url).header("x-goog-api-key", key).json(&body)
        })
        .await?;
        parse_gemini_chat(&json)
    }
}

pub fn parse_gemini_chat(json: &serde_json::Value) -> Result<String, CollaboratorError> {
    let parts = json
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .ok_or_else(|| malformed("Gemini", "candidates[0].content.parts"))?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();
    Ok(text.trim().to_string())
}

// ============ Ollama ============

pub struct OllamaChat {
    endpoint: Endpoint,
}

impl OllamaChat {
    pub fn new(tier: &TierConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint: Endpoint::new(tier, OLLAMA_URL, "llama3", None, timeout)?,
        })
    }
}

#[async_trait]
impl LlmProvider for OllamaChat {
    fn kind(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.endpoint.model
    }

    fn is_configured(&self) -> bool {
        !self.endpoint.url.is_empty()
    }

    async fn probe(&self) -> Result<(), CollaboratorError> {
        let e = &self.endpoint;
        http::probe("Ollama", e.timeout, e.client.get(format!("{}/api/tags", e.url))).await
    }

    async fn generate(&self, prompt: &str, system: &str) -> Result<String, CollaboratorError> {
        let e = &self.endpoint;
        let body = serde_json::json!({
            "model": e.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt },
            ],
            "stream": false,
            "options": {
                "num_predict": e.max_tokens,
                "temperature": e.temperature,
            },
        });
        let url = format!("{}/api/chat", e.url);
        let json = http::send_json("Ollama", 0, e.timeout, || e.client.post(&url).json(&body)).await?;
        parse_ollama_chat(&json)
    }
}

pub fn parse_ollama_chat(json: &serde_json::Value) -> Result<String, CollaboratorError> {
    json.pointer("/message/content")
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| malformed("Ollama", "message.content"))
}

// ============ Tiers ============

pub fn create_provider(tier: &TierConfig, timeout: Duration) -> Result<Arc<dyn LlmProvider>> {
    let provider: Arc<dyn LlmProvider> = match tier.provider.as_str() {
        "openai" => Arc::new(OpenAiChat::new(tier, timeout)?),
        "gemini" => Arc::new(GeminiChat::new(tier, timeout)?),
        "ollama" => Arc::new(OllamaChat::new(tier, timeout)?),
        other => anyhow::bail!("Unknown generation provider: {}", other),
    };
    Ok(provider)
}

/// Build the tiers in configured order. The pipeline appends the
/// rule-based tier when the list does not end with it.
pub fn build_tiers(
    config: &GenerationConfig,
    health: &Arc<ProviderHealth>,
) -> Result<Vec<Arc<dyn GeneratorTier>>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let probe_timeout = Duration::from_secs(config.probe_timeout_secs);

    let mut tiers: Vec<Arc<dyn GeneratorTier>> = Vec::with_capacity(config.tiers.len() + 1);
    for tier in &config.tiers {
        if tier.provider == RULE_BASED_TIER {
            tiers.push(Arc::new(RuleBasedTier::new()));
            continue;
        }
        let provider = create_provider(tier, timeout)?;
        tracing::debug!(
            tier = %tier.name,
            provider = provider.kind(),
            model = provider.model(),
            configured = provider.is_configured(),
            "generator tier configured"
        );
        tiers.push(Arc::new(LlmTier::new(
            tier.name.clone(),
            provider,
            health.clone(),
            probe_timeout,
        )));
    }
    Ok(tiers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tier(provider: &str) -> TierConfig {
        TierConfig {
            name: provider.to_string(),
            provider: provider.to_string(),
            model: None,
            url: Some("http://127.0.0.1:9".into()),
            api_key_env: Some("DOCQA_TEST_KEY_THAT_IS_NEVER_SET".into()),
            max_tokens: 100,
            temperature: 0.0,
        }
    }

    #[test]
    fn test_parse_openai_chat() {
        let json = json!({ "choices": [{ "message": { "content": "  {\"decision\": \"approved\"} " } }] });
        assert_eq!(parse_openai_chat(&json).unwrap(), "{\"decision\": \"approved\"}");
        assert!(matches!(
            parse_openai_chat(&json!({ "choices": [] })),
            Err(CollaboratorError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_gemini_chat_joins_parts() {
        let json = json!({
            "candidates": [{ "content": { "parts": [{ "text": "Approved" }, { "text": " per clause 2." }] } }]
        });
        assert_eq!(parse_gemini_chat(&json).unwrap(), "Approved per clause 2.");
    }

    #[test]
    fn test_parse_ollama_chat() {
        let json = json!({ "message": { "role": "assistant", "content": "Pending review." } });
        assert_eq!(parse_ollama_chat(&json).unwrap(), "Pending review.");
    }

    #[test]
    fn test_missing_key_means_not_configured() {
        let p = OpenAiChat::new(&tier("openai"), Duration::from_secs(1)).unwrap();
        assert!(!p.is_configured());
        assert_eq!(p.model(), "gpt-3.5-turbo");
        let g = GeminiChat::new(&tier("gemini"), Duration::from_secs(1)).unwrap();
        assert!(!g.is_configured());
        let o = OllamaChat::new(&tier("ollama"), Duration::from_secs(1)).unwrap();
        assert!(o.is_configured());
    }

    #[tokio::test]
    async fn test_unconfigured_generate_is_unavailable() {
        let p = OpenAiChat::new(&tier("openai"), Duration::from_secs(1)).unwrap();
        let err = p.generate("q", "s").await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Unavailable(_)));
    }

    #[test]
    fn test_build_tiers_keeps_order() {
        let config = GenerationConfig {
            tiers: vec![tier("gemini"), tier("openai")],
            ..Default::default()
        };
        let health = Arc::new(ProviderHealth::default());
        let tiers = build_tiers(&config, &health).unwrap();
        let names: Vec<&str> = tiers.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["gemini", "openai"]);
        assert!(tiers.iter().all(|t| !t.is_terminal()));
    }

    #[test]
    fn test_only_rule_based_provider_builds_terminal_tier() {
        let config = GenerationConfig {
            tiers: vec![tier("ollama"), tier(RULE_BASED_TIER)],
            ..Default::default()
        };
        let health = Arc::new(ProviderHealth::default());
        let tiers = build_tiers(&config, &health).unwrap();
        let terminal: Vec<bool> = tiers.iter().map(|t| t.is_terminal()).collect();
        assert_eq!(terminal, vec![false, true]);
    }
}
