//! LLM provider abstraction.
//!
//! One trait, five backends (Ollama, OpenAI, DeepSeek, Gemini, Claude).
//! Which backend serves embeddings and which serves suggestions is decided
//! by Config — the two may differ, and the suggestion side can be swapped
//! at runtime through `switch_suggestion_model`, after which the factory
//! cache is cleared wholesale.
//!
//! Providers never apply their own business timeouts; callers wrap each
//! request in a `tokio::time::timeout` deadline.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};
use std::time::Duration;

use crate::config::{self, Provider};

/// Generous transport ceiling; real deadlines are enforced by callers.
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("{provider} unreachable: {source}")]
    Transport {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} returned {status}: {body}")]
    Api {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("{provider} response missing expected field '{field}'")]
    Malformed {
        provider: &'static str,
        field: &'static str,
    },
    #[error("{provider} does not support {capability}")]
    Unsupported {
        provider: &'static str,
        capability: &'static str,
    },
    #[error("embedding dimension mismatch: provider returned {actual}, collection expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("provider '{provider}' requires {env_var} to be set")]
    MissingApiKey {
        provider: &'static str,
        env_var: &'static str,
    },
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, LlmError>;

    async fn generate_text(&self, prompt: &str) -> Result<String, LlmError>;

    /// Cheap liveness probe; used at startup and after a model switch.
    async fn check_connection(&self) -> bool;

    /// Fold user feedback on a previous suggestion into an improved one.
    async fn process_feedback(
        &self,
        query: &str,
        suggestion: &str,
        feedback: &str,
        score: f32,
    ) -> Result<String, LlmError> {
        let prompt = format!(
            "A user asked:\n{query}\n\nYou previously suggested:\n{suggestion}\n\n\
             The user rated it {score:.1}/10 and said:\n{feedback}\n\n\
             Produce an improved suggestion that addresses the feedback."
        );
        self.generate_text(&prompt).await
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_default()
}

async fn read_error_body(provider: &'static str, resp: reqwest::Response) -> LlmError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    LlmError::Api {
        provider,
        status,
        body,
    }
}

fn check_dimension(vector: Vec<f32>, expected: usize) -> Result<Vec<f32>, LlmError> {
    if vector.len() != expected {
        return Err(LlmError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(vector)
}

// ── Response extraction (pure, unit-tested) ──────────────────────────────

fn extract_f32_array(value: &Value, pointer: &str) -> Option<Vec<f32>> {
    value
        .pointer(pointer)?
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

fn extract_ollama_embedding(value: &Value) -> Option<Vec<f32>> {
    extract_f32_array(value, "/embedding")
}

fn extract_ollama_text(value: &Value) -> Option<String> {
    value.get("response").and_then(Value::as_str).map(str::to_string)
}

fn extract_openai_embedding(value: &Value) -> Option<Vec<f32>> {
    extract_f32_array(value, "/data/0/embedding")
}

fn extract_openai_text(value: &Value) -> Option<String> {
    value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn extract_gemini_embedding(value: &Value) -> Option<Vec<f32>> {
    extract_f32_array(value, "/embedding/values")
}

fn extract_gemini_text(value: &Value) -> Option<String> {
    value
        .pointer("/candidates/0/content/parts/0/text")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn extract_claude_text(value: &Value) -> Option<String> {
    value
        .pointer("/content/0/text")
        .and_then(Value::as_str)
        .map(str::to_string)
}

// ── Ollama ───────────────────────────────────────────────────────────────

pub struct OllamaProvider {
    http: reqwest::Client,
    host: String,
    model: String,
    dimension: usize,
}

impl OllamaProvider {
    pub fn new(host: &str, model: &str, dimension: usize) -> Self {
        Self {
            http: http_client(),
            host: host.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimension,
        }
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let resp = self
            .http
            .post(format!("{}/api/embeddings", self.host))
            .json(&json!({ "model": self.model, "prompt": text }))
            .send()
            .await
            .map_err(|source| LlmError::Transport {
                provider: "ollama",
                source,
            })?;
        if !resp.status().is_success() {
            return Err(read_error_body("ollama", resp).await);
        }
        let body: Value = resp.json().await.map_err(|source| LlmError::Transport {
            provider: "ollama",
            source,
        })?;
        let vector = extract_ollama_embedding(&body).ok_or(LlmError::Malformed {
            provider: "ollama",
            field: "embedding",
        })?;
        check_dimension(vector, self.dimension)
    }

    async fn generate_text(&self, prompt: &str) -> Result<String, LlmError> {
        let resp = self
            .http
            .post(format!("{}/api/generate", self.host))
            .json(&json!({ "model": self.model, "prompt": prompt, "stream": false }))
            .send()
            .await
            .map_err(|source| LlmError::Transport {
                provider: "ollama",
                source,
            })?;
        if !resp.status().is_success() {
            return Err(read_error_body("ollama", resp).await);
        }
        let body: Value = resp.json().await.map_err(|source| LlmError::Transport {
            provider: "ollama",
            source,
        })?;
        extract_ollama_text(&body).ok_or(LlmError::Malformed {
            provider: "ollama",
            field: "response",
        })
    }

    async fn check_connection(&self) -> bool {
        self.http
            .get(format!("{}/api/tags", self.host))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

// ── OpenAI-compatible (OpenAI, DeepSeek) ─────────────────────────────────

pub struct OpenAiCompatProvider {
    http: reqwest::Client,
    name: &'static str,
    base_url: String,
    api_key: String,
    model: String,
    dimension: usize,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: &'static str,
        base_url: &str,
        api_key: &str,
        model: &str,
        dimension: usize,
    ) -> Self {
        Self {
            http: http_client(),
            name,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            dimension,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let resp = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": text }))
            .send()
            .await
            .map_err(|source| LlmError::Transport {
                provider: self.name,
                source,
            })?;
        if !resp.status().is_success() {
            return Err(read_error_body(self.name, resp).await);
        }
        let body: Value = resp.json().await.map_err(|source| LlmError::Transport {
            provider: self.name,
            source,
        })?;
        let vector = extract_openai_embedding(&body).ok_or(LlmError::Malformed {
            provider: self.name,
            field: "data[0].embedding",
        })?;
        check_dimension(vector, self.dimension)
    }

    async fn generate_text(&self, prompt: &str) -> Result<String, LlmError> {
        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [ { "role": "user", "content": prompt } ],
            }))
            .send()
            .await
            .map_err(|source| LlmError::Transport {
                provider: self.name,
                source,
            })?;
        if !resp.status().is_success() {
            return Err(read_error_body(self.name, resp).await);
        }
        let body: Value = resp.json().await.map_err(|source| LlmError::Transport {
            provider: self.name,
            source,
        })?;
        extract_openai_text(&body).ok_or(LlmError::Malformed {
            provider: self.name,
            field: "choices[0].message.content",
        })
    }

    async fn check_connection(&self) -> bool {
        self.http
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

// ── Gemini ───────────────────────────────────────────────────────────────

pub struct GeminiProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimension: usize,
}

impl GeminiProvider {
    pub fn new(base_url: &str, api_key: &str, model: &str, dimension: usize) -> Self {
        Self {
            http: http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            dimension,
        }
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let url = format!(
            "{}/models/{}:embedContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let resp = self
            .http
            .post(url)
            .json(&json!({ "content": { "parts": [ { "text": text } ] } }))
            .send()
            .await
            .map_err(|source| LlmError::Transport {
                provider: "gemini",
                source,
            })?;
        if !resp.status().is_success() {
            return Err(read_error_body("gemini", resp).await);
        }
        let body: Value = resp.json().await.map_err(|source| LlmError::Transport {
            provider: "gemini",
            source,
        })?;
        let vector = extract_gemini_embedding(&body).ok_or(LlmError::Malformed {
            provider: "gemini",
            field: "embedding.values",
        })?;
        check_dimension(vector, self.dimension)
    }

    async fn generate_text(&self, prompt: &str) -> Result<String, LlmError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let resp = self
            .http
            .post(url)
            .json(&json!({ "contents": [ { "parts": [ { "text": prompt } ] } ] }))
            .send()
            .await
            .map_err(|source| LlmError::Transport {
                provider: "gemini",
                source,
            })?;
        if !resp.status().is_success() {
            return Err(read_error_body("gemini", resp).await);
        }
        let body: Value = resp.json().await.map_err(|source| LlmError::Transport {
            provider: "gemini",
            source,
        })?;
        extract_gemini_text(&body).ok_or(LlmError::Malformed {
            provider: "gemini",
            field: "candidates[0].content.parts[0].text",
        })
    }

    async fn check_connection(&self) -> bool {
        self.http
            .get(format!("{}/models?key={}", self.base_url, self.api_key))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

// ── Claude ───────────────────────────────────────────────────────────────

pub struct ClaudeProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl ClaudeProvider {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            http: http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl LlmProvider for ClaudeProvider {
    fn name(&self) -> &'static str {
        "claude"
    }

    async fn generate_embedding(&self, _text: &str) -> Result<Vec<f32>, LlmError> {
        // No embeddings endpoint; pair Claude suggestions with an
        // Ollama/OpenAI/Gemini embedding provider instead.
        Err(LlmError::Unsupported {
            provider: "claude",
            capability: "embeddings",
        })
    }

    async fn generate_text(&self, prompt: &str) -> Result<String, LlmError> {
        let resp = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&json!({
                "model": self.model,
                "max_tokens": 2048,
                "messages": [ { "role": "user", "content": prompt } ],
            }))
            .send()
            .await
            .map_err(|source| LlmError::Transport {
                provider: "claude",
                source,
            })?;
        if !resp.status().is_success() {
            return Err(read_error_body("claude", resp).await);
        }
        let body: Value = resp.json().await.map_err(|source| LlmError::Transport {
            provider: "claude",
            source,
        })?;
        extract_claude_text(&body).ok_or(LlmError::Malformed {
            provider: "claude",
            field: "content[0].text",
        })
    }

    async fn check_connection(&self) -> bool {
        self.http
            .get(format!("{}/models", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

// ── Factory + cache ──────────────────────────────────────────────────────
//
// No ambient provider singletons: callers ask the factory, the factory
// consults Config. `switch_suggestion_model` clears the cache wholesale so
// the next request observes the new configuration.

type CacheKey = (Provider, String);

static PROVIDER_CACHE: LazyLock<RwLock<HashMap<CacheKey, Arc<dyn LlmProvider>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

fn build(provider: Provider, model: &str, cfg: &config::Config) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let dim = cfg.embedding_dimension;
    let key = cfg.api_key_for(provider);
    let need_key = |env_var: &'static str, name: &'static str| {
        key.clone().ok_or(LlmError::MissingApiKey {
            provider: name,
            env_var,
        })
    };

    Ok(match provider {
        Provider::Ollama => Arc::new(OllamaProvider::new(&cfg.hosts.ollama_host, model, dim)),
        Provider::OpenAI => Arc::new(OpenAiCompatProvider::new(
            "openai",
            &cfg.hosts.openai_base_url,
            &need_key("OPENAI_API_KEY", "openai")?,
            model,
            dim,
        )),
        Provider::DeepSeek => Arc::new(OpenAiCompatProvider::new(
            "deepseek",
            &cfg.hosts.deepseek_base_url,
            &need_key("DEEPSEEK_API_KEY", "deepseek")?,
            model,
            dim,
        )),
        Provider::Gemini => Arc::new(GeminiProvider::new(
            &cfg.hosts.gemini_base_url,
            &need_key("GEMINI_API_KEY", "gemini")?,
            model,
            dim,
        )),
        Provider::Claude => Arc::new(ClaudeProvider::new(
            &cfg.hosts.claude_base_url,
            &need_key("ANTHROPIC_API_KEY", "claude")?,
            model,
        )),
    })
}

fn cached(provider: Provider, model: &str) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let key = (provider, model.to_string());
    if let Some(hit) = PROVIDER_CACHE.read().expect("provider cache poisoned").get(&key) {
        return Ok(Arc::clone(hit));
    }
    let cfg = config::get();
    let built = build(provider, model, &cfg)?;
    PROVIDER_CACHE
        .write()
        .expect("provider cache poisoned")
        .insert(key, Arc::clone(&built));
    Ok(built)
}

/// Provider serving `generate_text` per the current Config.
pub fn suggestion_provider() -> Result<Arc<dyn LlmProvider>, LlmError> {
    let cfg = config::get();
    cached(cfg.suggestion_provider, &cfg.suggestion_model)
}

/// Provider serving `generate_embedding` per the current Config.
pub fn embedding_provider() -> Result<Arc<dyn LlmProvider>, LlmError> {
    let cfg = config::get();
    cached(cfg.embedding_provider, &cfg.embedding_model)
}

/// Drop every cached instance. Called after `switch_suggestion_model`.
pub fn clear_provider_cache() {
    PROVIDER_CACHE
        .write()
        .expect("provider cache poisoned")
        .clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ollama_embedding_shape() {
        let body = json!({ "embedding": [0.1, 0.2, 0.3] });
        assert_eq!(extract_ollama_embedding(&body), Some(vec![0.1, 0.2, 0.3]));
        assert_eq!(extract_ollama_embedding(&json!({})), None);
    }

    #[test]
    fn openai_shapes() {
        let emb = json!({ "data": [ { "embedding": [1.0, 2.0] } ] });
        assert_eq!(extract_openai_embedding(&emb), Some(vec![1.0, 2.0]));

        let chat = json!({ "choices": [ { "message": { "content": "hello" } } ] });
        assert_eq!(extract_openai_text(&chat), Some("hello".to_string()));
    }

    #[test]
    fn gemini_and_claude_shapes() {
        let emb = json!({ "embedding": { "values": [0.5] } });
        assert_eq!(extract_gemini_embedding(&emb), Some(vec![0.5]));

        let gen = json!({ "candidates": [ { "content": { "parts": [ { "text": "hi" } ] } } ] });
        assert_eq!(extract_gemini_text(&gen), Some("hi".to_string()));

        let msg = json!({ "content": [ { "type": "text", "text": "claude says" } ] });
        assert_eq!(extract_claude_text(&msg), Some("claude says".to_string()));
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let err = check_dimension(vec![0.0; 4], 8).unwrap_err();
        assert!(matches!(
            err,
            LlmError::DimensionMismatch { expected: 8, actual: 4 }
        ));
        assert!(check_dimension(vec![0.0; 8], 8).is_ok());
    }

    #[test]
    fn claude_has_no_embeddings() {
        let provider = ClaudeProvider::new("https://api.anthropic.com/v1", "k", "m");
        let rt = tokio::runtime::Runtime::new().unwrap();
        let err = rt.block_on(provider.generate_embedding("x")).unwrap_err();
        assert!(matches!(err, LlmError::Unsupported { .. }));
    }

    #[test]
    fn cache_cleared_wholesale() {
        config::init(config::Config::default());
        let a = cached(Provider::Ollama, "nomic-embed-text:v1.5").unwrap();
        let b = cached(Provider::Ollama, "nomic-embed-text:v1.5").unwrap();
        assert!(Arc::ptr_eq(&a, &b), "second lookup must hit the cache");

        clear_provider_cache();
        let c = cached(Provider::Ollama, "nomic-embed-text:v1.5").unwrap();
        assert!(!Arc::ptr_eq(&a, &c), "cache clear must drop instances");
    }
}
