//! Language model providers.
//!
//! Every provider implements [`LanguageModel`]: a one-shot `invoke` and a
//! token `stream`. Failures are typed as [`LlmError`] so the router can
//! decide whether a fallback attempt is worthwhile.
//!
//! | Provider | Wire format |
//! |----------|-------------|
//! | [`OpenAiChatModel`] | `/chat/completions`, SSE when streaming |
//! | [`LocalChatModel`] | Ollama `/api/chat`, newline-delimited JSON |
//! | [`EndpointModel`] | `{"inputs": ...}` → `generated_text` |

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use secure_rag_core::prompt::{Prompt, Role};
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::error::LlmError;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Error bodies are truncated to this many characters in messages.
const MAX_ERROR_BODY: usize = 512;

/// Incremental answer text.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Label used in logs and answers, e.g. `openai:gpt-4o-mini`.
    fn name(&self) -> &str;

    /// Generate the full response.
    async fn invoke(&self, prompt: &Prompt) -> Result<String, LlmError>;

    /// Open a token stream. Connection and HTTP status failures are
    /// returned here; failures mid-stream arrive as stream items.
    async fn stream(&self, prompt: &Prompt) -> Result<TokenStream, LlmError>;
}

/// Build the model described by a provider block.
pub fn create_model(config: &ProviderConfig) -> Result<Arc<dyn LanguageModel>> {
    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()?;
    let name = config.label();

    match config {
        ProviderConfig::OpenAi {
            model,
            api_key_env,
            base_url,
            temperature,
        } => {
            let api_key = std::env::var(api_key_env)
                .map_err(|_| anyhow!("{} environment variable not set", api_key_env))?;
            Ok(Arc::new(OpenAiChatModel {
                client,
                name,
                model: model.clone(),
                api_key,
                base_url: base_url
                    .clone()
                    .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
                temperature: *temperature,
            }))
        }
        ProviderConfig::Local {
            model,
            url,
            temperature,
        } => Ok(Arc::new(LocalChatModel {
            client,
            name,
            model: model.clone(),
            url: url.clone(),
            temperature: *temperature,
        })),
        ProviderConfig::Endpoint {
            url, api_key_env, ..
        } => {
            let api_key = match api_key_env {
                Some(var) => Some(
                    std::env::var(var)
                        .map_err(|_| anyhow!("{} environment variable not set", var))?,
                ),
                None => None,
            };
            Ok(Arc::new(EndpointModel {
                client,
                name,
                url: url.clone(),
                api_key,
            }))
        }
    }
}

/// Send a request and turn non-success statuses into typed errors.
async fn send_checked(request: reqwest::RequestBuilder) -> Result<reqwest::Response, LlmError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if let Some((idx, _)) = body.char_indices().nth(MAX_ERROR_BODY) {
        body.truncate(idx);
    }
    Err(LlmError::from_status(status.as_u16(), body))
}

fn chat_messages(prompt: &Prompt) -> Vec<Value> {
    let mut messages = vec![json!({"role": "system", "content": prompt.system})];
    messages.extend(prompt.messages.iter().map(|m| {
        let role = match m.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        json!({"role": role, "content": m.content})
    }));
    messages
}

fn protocol(e: impl std::fmt::Display) -> LlmError {
    LlmError::Protocol(e.to_string())
}

// ============ OpenAI ============

/// OpenAI-compatible chat completions.
pub struct OpenAiChatModel {
    client: reqwest::Client,
    name: String,
    model: String,
    api_key: String,
    base_url: String,
    temperature: Option<f32>,
}

impl OpenAiChatModel {
    fn request(&self, prompt: &Prompt, stream: bool) -> reqwest::RequestBuilder {
        let mut body = json!({
            "model": self.model,
            "messages": chat_messages(prompt),
            "stream": stream,
        });
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        self.client
            .post(format!(
                "{}/chat/completions",
                self.base_url.trim_end_matches('/')
            ))
            .bearer_auth(&self.api_key)
            .json(&body)
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, prompt: &Prompt) -> Result<String, LlmError> {
        let response = send_checked(self.request(prompt, false)).await?;
        let json: Value = response.json().await?;
        json.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| protocol("missing choices[0].message.content"))
    }

    async fn stream(&self, prompt: &Prompt) -> Result<TokenStream, LlmError> {
        let response = send_checked(self.request(prompt, true)).await?;
        let tokens = response
            .bytes_stream()
            .eventsource()
            .map_err(|e| LlmError::Transport(e.to_string()))
            .try_filter_map(|event| async move { parse_openai_chunk(&event.data) });
        Ok(Box::pin(tokens))
    }
}

/// Extract the delta text from one SSE `data:` payload.
fn parse_openai_chunk(data: &str) -> Result<Option<String>, LlmError> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }
    let chunk: Value = serde_json::from_str(data).map_err(protocol)?;
    if let Some(err) = chunk.get("error") {
        return Err(protocol(err));
    }
    Ok(chunk
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string))
}

// ============ Local (Ollama) ============

/// Locally hosted model behind an Ollama-style `/api/chat`.
pub struct LocalChatModel {
    client: reqwest::Client,
    name: String,
    model: String,
    url: String,
    temperature: Option<f32>,
}

impl LocalChatModel {
    fn request(&self, prompt: &Prompt, stream: bool) -> reqwest::RequestBuilder {
        let mut body = json!({
            "model": self.model,
            "messages": chat_messages(prompt),
            "stream": stream,
        });
        if let Some(t) = self.temperature {
            body["options"] = json!({"temperature": t});
        }
        self.client
            .post(format!("{}/api/chat", self.url.trim_end_matches('/')))
            .json(&body)
    }
}

#[async_trait]
impl LanguageModel for LocalChatModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, prompt: &Prompt) -> Result<String, LlmError> {
        let response = send_checked(self.request(prompt, false)).await?;
        let json: Value = response.json().await?;
        if let Some(err) = json.get("error") {
            return Err(protocol(err));
        }
        json.pointer("/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| protocol("missing message.content"))
    }

    async fn stream(&self, prompt: &Prompt) -> Result<TokenStream, LlmError> {
        let response = send_checked(self.request(prompt, true)).await?;
        let mut bytes = Box::pin(response.bytes_stream());

        let tokens = async_stream::stream! {
            let mut buf: Vec<u8> = Vec::new();
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => buf.extend_from_slice(&chunk),
                    Err(e) => {
                        yield Err(LlmError::from(e));
                        return;
                    }
                }
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    match parse_ndjson_line(&line) {
                        Ok(Some(token)) => yield Ok(token),
                        Ok(None) => {}
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
            match parse_ndjson_line(&buf) {
                Ok(Some(token)) => yield Ok(token),
                Ok(None) => {}
                Err(e) => yield Err(e),
            }
        };
        Ok(Box::pin(tokens))
    }
}

/// Parse one line of Ollama's streaming chat output.
fn parse_ndjson_line(line: &[u8]) -> Result<Option<String>, LlmError> {
    let text = std::str::from_utf8(line).map_err(protocol)?.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let json: Value = serde_json::from_str(text).map_err(protocol)?;
    if let Some(err) = json.get("error") {
        return Err(protocol(err));
    }
    Ok(json
        .pointer("/message/content")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string))
}

// ============ Generic endpoint ============

/// Text-generation endpoint (TGI style). Streaming yields the whole
/// response as one chunk.
pub struct EndpointModel {
    client: reqwest::Client,
    name: String,
    url: String,
    api_key: Option<String>,
}

#[async_trait]
impl LanguageModel for EndpointModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, prompt: &Prompt) -> Result<String, LlmError> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&json!({"inputs": prompt.to_plain_text()}));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let json: Value = send_checked(request).await?.json().await?;
        parse_generated_text(&json)
    }

    async fn stream(&self, prompt: &Prompt) -> Result<TokenStream, LlmError> {
        let text = self.invoke(prompt).await?;
        Ok(Box::pin(stream::once(async move { Ok(text) })))
    }
}

/// Accepts `{"generated_text": ...}` or `[{"generated_text": ...}]`.
fn parse_generated_text(json: &Value) -> Result<String, LlmError> {
    let item = match json {
        Value::Array(items) => items.first(),
        other => Some(other),
    };
    item.and_then(|v| v.get("generated_text"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| protocol("missing generated_text"))
}
