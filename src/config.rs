//! TOML configuration parsing and validation.
//!
//! The configuration is loaded once at process start, validated eagerly,
//! and passed by reference into every component constructor. Provider
//! settings are tagged unions so a malformed provider block fails at load
//! time rather than on the first request.
//!
//! See `config/srag.example.toml` for a complete example.

use anyhow::{bail, Context, Result};
use reqwest::Url;
use secure_rag_core::models::SecurityLevel;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
}

// ============ Retrieval ============

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_true")]
    pub rerank_enabled: bool,
    #[serde(default = "default_top_k")]
    pub rerank_top_k: usize,
    #[serde(default = "default_rerank_threshold")]
    pub rerank_threshold: f64,
    #[serde(default = "default_true")]
    pub concurrent_sub_queries: bool,
    /// Pass the requester's org level to the search backend on the single-query path.
    #[serde(default)]
    pub prefilter_single_query: bool,
    #[serde(default = "default_search_timeout_ms")]
    pub search_timeout_ms: u64,
    #[serde(default = "default_search_timeout_ms")]
    pub rerank_timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            rerank_enabled: true,
            rerank_top_k: default_top_k(),
            rerank_threshold: default_rerank_threshold(),
            concurrent_sub_queries: true,
            prefilter_single_query: false,
            search_timeout_ms: default_search_timeout_ms(),
            rerank_timeout_ms: default_search_timeout_ms(),
        }
    }
}

fn default_top_k() -> usize {
    8
}
fn default_true() -> bool {
    true
}
fn default_rerank_threshold() -> f64 {
    0.2
}
fn default_search_timeout_ms() -> u64 {
    10_000
}

// ============ Planner ============

#[derive(Debug, Deserialize, Clone)]
pub struct PlannerConfig {
    #[serde(default)]
    pub decomposition_enabled: bool,
    #[serde(default = "default_max_sub_queries")]
    pub max_sub_queries: usize,
    #[serde(default = "default_planner_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            decomposition_enabled: false,
            max_sub_queries: default_max_sub_queries(),
            timeout_secs: default_planner_timeout_secs(),
        }
    }
}

fn default_max_sub_queries() -> usize {
    4
}
fn default_planner_timeout_secs() -> u64 {
    15
}

// ============ Cache ============

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Environment variable holding the master secret for payload encryption.
    #[serde(default = "default_cache_key_env")]
    pub encryption_key_env: String,
    #[serde(default = "default_cache_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries_per_tier: usize,
    #[serde(default = "TierConfig::response_defaults")]
    pub response: TierConfig,
    #[serde(default = "TierConfig::context_defaults")]
    pub context: TierConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            encryption_key_env: default_cache_key_env(),
            timeout_ms: default_cache_timeout_ms(),
            max_entries_per_tier: default_max_entries(),
            response: TierConfig::response_defaults(),
            context: TierConfig::context_defaults(),
        }
    }
}

fn default_cache_key_env() -> String {
    "SRAG_CACHE_KEY".to_string()
}
fn default_cache_timeout_ms() -> u64 {
    2_000
}
fn default_max_entries() -> usize {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct TierConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub similarity_threshold: f32,
    pub ttl_secs: u64,
    #[serde(default = "default_true")]
    pub encrypt: bool,
}

impl TierConfig {
    pub fn response_defaults() -> Self {
        Self {
            enabled: true,
            similarity_threshold: 0.95,
            ttl_secs: 3_600,
            encrypt: true,
        }
    }

    pub fn context_defaults() -> Self {
        Self {
            enabled: true,
            similarity_threshold: 0.85,
            ttl_secs: 86_400,
            encrypt: true,
        }
    }
}

// ============ Embedding ============

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(flatten)]
    pub provider: EmbeddingProviderConfig,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderConfig::Disabled,
            timeout_secs: default_embedding_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        !matches!(self.provider, EmbeddingProviderConfig::Disabled)
    }
}

/// Embedding backend selection.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum EmbeddingProviderConfig {
    Disabled,
    #[serde(rename = "openai")]
    OpenAi {
        model: String,
        dims: usize,
        #[serde(default = "default_openai_key_env")]
        api_key_env: String,
        #[serde(default)]
        base_url: Option<String>,
    },
    /// Ollama-style `/api/embed` endpoint.
    Local {
        model: String,
        dims: usize,
        #[serde(default = "default_local_url")]
        url: String,
    },
    /// Offline deterministic bag-of-words hashing.
    Hashing { dims: usize },
}

fn default_embedding_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_local_url() -> String {
    "http://localhost:11434".to_string()
}

// ============ LLM ============

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// Content at or above this level is routed to the internal model.
    #[serde(default = "default_internal_threshold")]
    pub internal_threshold: SecurityLevel,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_history")]
    pub max_history_messages: usize,
    /// Highest content level the fallback model may receive.
    #[serde(default)]
    pub fallback_max_level: Option<SecurityLevel>,
    pub default: ProviderConfig,
    #[serde(default)]
    pub internal: Option<ProviderConfig>,
    #[serde(default)]
    pub fallback: Option<ProviderConfig>,
}

fn default_internal_threshold() -> SecurityLevel {
    SecurityLevel::Confidential
}
fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_max_history() -> usize {
    10
}

/// LLM provider selection.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// OpenAI or any OpenAI-compatible chat completions API.
    #[serde(rename = "openai")]
    OpenAi {
        model: String,
        #[serde(default = "default_openai_key_env")]
        api_key_env: String,
        #[serde(default)]
        base_url: Option<String>,
        #[serde(default)]
        temperature: Option<f32>,
    },
    /// Ollama-style `/api/chat`.
    Local {
        model: String,
        #[serde(default = "default_local_url")]
        url: String,
        #[serde(default)]
        temperature: Option<f32>,
    },
    /// Text-generation endpoint accepting `{"inputs": ...}`.
    Endpoint {
        url: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        api_key_env: Option<String>,
    },
}

impl ProviderConfig {
    /// Short label such as `openai:gpt-4o-mini`, used in logs and answers.
    pub fn label(&self) -> String {
        match self {
            ProviderConfig::OpenAi { model, .. } => format!("openai:{}", model),
            ProviderConfig::Local { model, .. } => format!("local:{}", model),
            ProviderConfig::Endpoint { model, url, .. } => {
                format!("endpoint:{}", model.as_deref().unwrap_or(url))
            }
        }
    }

    fn validate(&self, section: &str) -> Result<()> {
        match self {
            ProviderConfig::OpenAi {
                model,
                base_url,
                temperature,
                ..
            } => {
                check_model(section, model)?;
                if let Some(url) = base_url {
                    check_url(section, url)?;
                }
                check_temperature(section, *temperature)
            }
            ProviderConfig::Local {
                model,
                url,
                temperature,
            } => {
                check_model(section, model)?;
                check_url(section, url)?;
                check_temperature(section, *temperature)
            }
            ProviderConfig::Endpoint { url, .. } => check_url(section, url),
        }
    }
}

fn check_model(section: &str, model: &str) -> Result<()> {
    if model.trim().is_empty() {
        bail!("{}.model must not be empty", section);
    }
    Ok(())
}

fn check_url(section: &str, url: &str) -> Result<()> {
    Url::parse(url).with_context(|| format!("{} has an invalid url: '{}'", section, url))?;
    Ok(())
}

fn check_temperature(section: &str, temperature: Option<f32>) -> Result<()> {
    if let Some(t) = temperature {
        if !(0.0..=2.0).contains(&t) {
            bail!("{}.temperature must be in [0.0, 2.0]", section);
        }
    }
    Ok(())
}

// ============ Loading ============

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate retrieval
    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.rerank_top_k == 0 {
        bail!("retrieval.rerank_top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.rerank_threshold) {
        bail!("retrieval.rerank_threshold must be in [0.0, 1.0]");
    }

    // Validate planner
    if config.planner.max_sub_queries == 0 {
        bail!("planner.max_sub_queries must be >= 1");
    }

    // Validate cache tiers
    for (name, tier) in [("response", &config.cache.response), ("context", &config.cache.context)] {
        if !(0.0..=1.0).contains(&tier.similarity_threshold) {
            bail!("cache.{}.similarity_threshold must be in [0.0, 1.0]", name);
        }
        if tier.ttl_secs == 0 {
            bail!("cache.{}.ttl_secs must be > 0", name);
        }
    }

    // Validate embedding
    match &config.embedding.provider {
        EmbeddingProviderConfig::Disabled => {}
        EmbeddingProviderConfig::OpenAi {
            model,
            dims,
            base_url,
            ..
        } => {
            check_model("embedding", model)?;
            check_dims(*dims)?;
            if let Some(url) = base_url {
                check_url("embedding", url)?;
            }
        }
        EmbeddingProviderConfig::Local { model, dims, url } => {
            check_model("embedding", model)?;
            check_dims(*dims)?;
            check_url("embedding", url)?;
        }
        EmbeddingProviderConfig::Hashing { dims } => check_dims(*dims)?,
    }

    // Validate llm
    if config.llm.timeout_secs == 0 {
        bail!("llm.timeout_secs must be > 0");
    }
    config.llm.default.validate("llm.default")?;
    if let Some(internal) = &config.llm.internal {
        internal.validate("llm.internal")?;
    }
    if let Some(fallback) = &config.llm.fallback {
        fallback.validate("llm.fallback")?;
    }

    Ok(())
}

fn check_dims(dims: usize) -> Result<()> {
    if dims == 0 {
        bail!("embedding.dims must be > 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[llm.default]
provider = "openai"
model = "gpt-4o-mini"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.retrieval.top_k, 8);
        assert!(config.retrieval.rerank_enabled);
        assert!(!config.planner.decomposition_enabled);
        assert!(!config.embedding.is_enabled());
        assert_eq!(config.cache.response.similarity_threshold, 0.95);
        assert_eq!(config.cache.context.ttl_secs, 86_400);
        assert_eq!(config.llm.internal_threshold, SecurityLevel::Confidential);
        assert_eq!(config.llm.default.label(), "openai:gpt-4o-mini");
        assert!(config.llm.fallback.is_none());
    }

    #[test]
    fn test_full_config_parses_tagged_unions() {
        let config = parse_config(
            r#"
[retrieval]
top_k = 5
rerank_threshold = 0.4

[planner]
decomposition_enabled = true
max_sub_queries = 3

[cache.response]
similarity_threshold = 0.9
ttl_secs = 60
encrypt = false

[embedding]
provider = "local"
model = "nomic-embed-text"
dims = 768
timeout_secs = 5

[llm]
internal_threshold = "RESTRICTED"
fallback_max_level = "GENERAL"

[llm.default]
provider = "openai"
model = "gpt-4o-mini"
base_url = "https://api.example.com/v1"

[llm.internal]
provider = "local"
model = "llama3.1"

[llm.fallback]
provider = "endpoint"
url = "https://tgi.internal/generate"
"#,
        )
        .unwrap();
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.planner.max_sub_queries, 3);
        assert!(!config.cache.response.encrypt);
        assert_eq!(config.cache.context.similarity_threshold, 0.85);
        assert_eq!(
            config.embedding.provider,
            EmbeddingProviderConfig::Local {
                model: "nomic-embed-text".into(),
                dims: 768,
                url: "http://localhost:11434".into()
            }
        );
        assert_eq!(config.embedding.timeout_secs, 5);
        assert_eq!(config.llm.internal_threshold, SecurityLevel::Restricted);
        assert_eq!(config.llm.fallback_max_level, Some(SecurityLevel::General));
        assert_eq!(
            config.llm.internal.as_ref().map(ProviderConfig::label).as_deref(),
            Some("local:llama3.1")
        );
        assert_eq!(
            config.llm.fallback.as_ref().map(ProviderConfig::label).as_deref(),
            Some("endpoint:https://tgi.internal/generate")
        );
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let err = parse_config(
            r#"
[llm.default]
provider = "carrier-pigeon"
model = "x"
"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("carrier-pigeon"));
    }

    #[test]
    fn test_rejects_invalid_url() {
        let err = parse_config(
            r#"
[llm.default]
provider = "local"
model = "llama3"
url = "not a url"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("llm.default"));
    }

    #[test]
    fn test_rejects_zero_dims() {
        let err = parse_config(
            r#"
[embedding]
provider = "hashing"
dims = 0

[llm.default]
provider = "openai"
model = "gpt-4o-mini"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("dims"));
    }

    #[test]
    fn test_rejects_out_of_range_threshold() {
        let err = parse_config(
            r#"
[cache.context]
similarity_threshold = 1.5
ttl_secs = 10

[llm.default]
provider = "openai"
model = "gpt-4o-mini"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cache.context"));
    }

    #[test]
    fn test_rejects_empty_model() {
        let err = parse_config(
            r#"
[llm.default]
provider = "openai"
model = " "
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("model"));
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = parse_config(include_str!("../config/srag.example.toml")).unwrap();
        assert!(config.embedding.is_enabled());
        assert_eq!(config.llm.fallback_max_level, Some(SecurityLevel::Restricted));
        assert_eq!(
            config.llm.fallback.as_ref().map(ProviderConfig::label).as_deref(),
            Some("endpoint:tgi-mistral")
        );
    }
}
