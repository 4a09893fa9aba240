//! Embedding providers.
//!
//! The semantic cache and the embedding reranker turn text into vectors
//! through the [`Embedder`] trait. Implementations:
//!
//! - **[`DisabledEmbedder`]**: always fails; the cache treats every lookup as a miss.
//! - **[`OpenAiEmbedder`]**: OpenAI-compatible `/embeddings` API.
//! - **[`OllamaEmbedder`]**: Ollama-style `/api/embed`.
//! - **[`HashingEmbedder`]**: offline, deterministic feature hashing.
//!
//! Use [`create_embedder`] to build one from configuration.
//!
//! # Retry Strategy
//!
//! HTTP providers back off exponentially on transient errors:
//! - HTTP 429 and 5xx → retry
//! - other HTTP 4xx → fail immediately
//! - network errors → retry
//! - backoff: 1s, 2s, 4s, ... (capped at 2^5)

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use secure_rag_core::embedding::normalize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EmbeddingConfig, EmbeddingProviderConfig};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Turns text into fixed-size vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    /// Embed a batch; output order matches input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single text.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    let mut vecs = embedder.embed(&[text.to_string()]).await?;
    vecs.pop()
        .ok_or_else(|| anyhow!("embedding provider returned no vectors"))
}

/// Build the embedder selected by `config`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match &config.provider {
        EmbeddingProviderConfig::Disabled => Ok(Arc::new(DisabledEmbedder)),
        EmbeddingProviderConfig::OpenAi {
            model,
            dims,
            api_key_env,
            base_url,
        } => {
            let api_key = std::env::var(api_key_env)
                .map_err(|_| anyhow!("{} environment variable not set", api_key_env))?;
            Ok(Arc::new(OpenAiEmbedder {
                http: HttpEmbedding::new(timeout, config.max_retries)?,
                api_key,
                model: model.clone(),
                dims: *dims,
                base_url: base_url
                    .clone()
                    .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            }))
        }
        EmbeddingProviderConfig::Local { model, dims, url } => Ok(Arc::new(OllamaEmbedder {
            http: HttpEmbedding::new(timeout, config.max_retries)?,
            model: model.clone(),
            dims: *dims,
            url: url.clone(),
        })),
        EmbeddingProviderConfig::Hashing { dims } => Ok(Arc::new(HashingEmbedder::new(*dims))),
    }
}

// ============ Disabled ============

/// Placeholder used when no embedding provider is configured.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ HTTP plumbing ============

struct HttpEmbedding {
    client: reqwest::Client,
    max_retries: u32,
}

impl HttpEmbedding {
    fn new(timeout: Duration, max_retries: u32) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            max_retries,
        })
    }

    /// POST `body` with retry/backoff and return the parsed JSON response.
    async fn post_json(
        &self,
        label: &str,
        url: &str,
        bearer: Option<&str>,
        body: &Value,
    ) -> Result<Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::debug!(provider = label, attempt, ?delay, "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.post(url).json(body);
            if let Some(key) = bearer {
                request = request.bearer_auth(key);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow!("{} API error {}: {}", label, status, body_text));
                        continue;
                    }
                    bail!("{} API error {}: {}", label, status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow!("{} connection error ({}): {}", label, url, e));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("{} embedding failed after retries", label)))
    }
}

fn json_vector(value: &Value, what: &str) -> Result<Vec<f32>> {
    let array = value
        .as_array()
        .ok_or_else(|| anyhow!("Invalid {} response: embedding is not an array", what))?;
    Ok(array
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

fn check_shape(vectors: &[Vec<f32>], expected_len: usize, dims: usize) -> Result<()> {
    if vectors.len() != expected_len {
        bail!(
            "embedding provider returned {} vectors for {} inputs",
            vectors.len(),
            expected_len
        );
    }
    if let Some(v) = vectors.iter().find(|v| v.len() != dims) {
        bail!("embedding has {} dims, expected {}", v.len(), dims);
    }
    Ok(())
}

// ============ OpenAI ============

/// OpenAI-compatible embeddings API.
pub struct OpenAiEmbedder {
    http: HttpEmbedding,
    api_key: String,
    model: String,
    dims: usize,
    base_url: String,
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let json = self
            .http
            .post_json("OpenAI", &url, Some(&self.api_key), &body)
            .await?;
        let vectors = parse_openai_response(&json)?;
        check_shape(&vectors, texts.len(), self.dims)?;
        Ok(vectors)
    }
}

/// Extract `data[].embedding`, ordered by `data[].index` when present.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .map_or(pos, |i| i as usize);
        indexed.push((index, json_vector(embedding, "OpenAI")?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// Embeddings from a local Ollama instance via `POST /api/embed`.
pub struct OllamaEmbedder {
    http: HttpEmbedding,
    model: String,
    dims: usize,
    url: String,
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let url = format!("{}/api/embed", self.url.trim_end_matches('/'));
        let json = self.http.post_json("Ollama", &url, None, &body).await?;
        let vectors = parse_ollama_response(&json)?;
        check_shape(&vectors, texts.len(), self.dims)?;
        Ok(vectors)
    }
}

fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(|e| json_vector(e, "Ollama"))
        .collect()
}

// ============ Hashing ============

/// Deterministic bag-of-words embedder that needs no network.
///
/// Each lowercase alphanumeric token is hashed with SHA-256 into one of
/// `dims` buckets with a hash-derived sign, then the vector is L2
/// normalized. Texts sharing vocabulary get high cosine similarity, which
/// is enough for offline runs and tests.
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        normalize(&mut v);
        v
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        "hashing"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}
