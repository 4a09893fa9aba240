//! End-to-end tests for the answering pipeline.
//!
//! Every backend is in-process: an in-memory passage store, the in-memory
//! vector cache, the hashing embedder, and scripted language models that
//! record the prompts they receive.

use anyhow::Result;
use async_trait::async_trait;
use futures::{stream, StreamExt};
use secure_rag::config::{parse_config, Config};
use secure_rag::embedding::{Embedder, HashingEmbedder};
use secure_rag::error::LlmError;
use secure_rag::history::{ConversationHistory, InMemoryHistory};
use secure_rag::llm::{LanguageModel, TokenStream};
use secure_rag::pipeline::{Answer, AnswerBody, AnswerFailure, Pipeline, PipelineParts};
use secure_rag::router::LlmRouter;
use secure_rag_core::models::{Clearance, Passage, PlanStrategy, SecurityLevel};
use secure_rag_core::prompt::{ChatMessage, Prompt};
use secure_rag_core::store::memory::InMemoryPassageStore;
use secure_rag_core::store::vector_cache::InMemoryCacheBackend;
use secure_rag_core::store::{CacheBackend, Decomposer, Decomposition};
use serde_json::json;
use std::sync::{Arc, Mutex};

// ─── Test models ────────────────────────────────────────────────────

/// Answers `"answer from <name>"` or fails with a fixed HTTP status.
struct Recording {
    name: String,
    fail_status: Option<u16>,
    prompts: Mutex<Vec<Prompt>>,
}

impl Recording {
    fn ok(name: &str) -> Arc<Self> {
        Self::build(name, None)
    }

    fn failing(name: &str, status: u16) -> Arc<Self> {
        Self::build(name, Some(status))
    }

    fn build(name: &str, fail_status: Option<u16>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            fail_status,
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    fn last_prompt_text(&self) -> String {
        self.prompts
            .lock()
            .unwrap()
            .last()
            .map(Prompt::to_plain_text)
            .unwrap_or_default()
    }

    fn reply(&self, prompt: &Prompt) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(prompt.clone());
        match self.fail_status {
            Some(status) => Err(LlmError::from_status(status, "scripted failure")),
            None => Ok(format!("answer from {}", self.name)),
        }
    }
}

#[async_trait]
impl LanguageModel for Recording {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, prompt: &Prompt) -> Result<String, LlmError> {
        self.reply(prompt)
    }

    async fn stream(&self, prompt: &Prompt) -> Result<TokenStream, LlmError> {
        let text = self.reply(prompt)?;
        let tokens: Vec<Result<String, LlmError>> =
            text.split_inclusive(' ').map(|t| Ok(t.to_string())).collect();
        Ok(Box::pin(stream::iter(tokens)))
    }
}

/// Streams one token and then drops the connection.
struct Interrupted;

#[async_trait]
impl LanguageModel for Interrupted {
    fn name(&self) -> &str {
        "interrupted"
    }

    async fn invoke(&self, _prompt: &Prompt) -> Result<String, LlmError> {
        Ok("complete answer".into())
    }

    async fn stream(&self, _prompt: &Prompt) -> Result<TokenStream, LlmError> {
        Ok(Box::pin(stream::iter(vec![
            Ok("partial ".to_string()),
            Err(LlmError::Transport("connection reset".into())),
        ])))
    }
}

/// Answers with the plain text of its prompt.
struct Echo;

#[async_trait]
impl LanguageModel for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    async fn invoke(&self, prompt: &Prompt) -> Result<String, LlmError> {
        Ok(prompt.to_plain_text())
    }

    async fn stream(&self, prompt: &Prompt) -> Result<TokenStream, LlmError> {
        Ok(Box::pin(stream::iter(vec![Ok(prompt.to_plain_text())])))
    }
}

struct FixedSplit(Vec<&'static str>);

#[async_trait]
impl Decomposer for FixedSplit {
    async fn decompose(&self, _question: &str) -> Result<Decomposition> {
        Ok(Decomposition {
            queries: self.0.iter().map(|q| q.to_string()).collect(),
            decomposed: true,
        })
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

fn corpus() -> Vec<Passage> {
    let docs = [
        json!({
            "content": "Employees accrue 20 vacation days per year.",
            "metadata": {"chunk_id": "vac-1", "title": "Vacation Policy", "security_level": 1}
        }),
        json!({
            "content": "Salary bands for engineers range from L1 to L7.",
            "metadata": {"chunk_id": "comp-1", "title": "Compensation Guide", "security_level": "CONFIDENTIAL"}
        }),
        json!({
            "content": "The Q3 budget target for finance is 4 million.",
            "metadata": {
                "chunk_id": "fin-1",
                "title": "Finance Plan",
                "security_level": 2,
                "is_department_only": true,
                "department_id": 7,
                "department_name": "Finance"
            }
        }),
    ];
    docs.into_iter()
        .map(|d| serde_json::from_value(d).unwrap())
        .collect()
}

const BASE_CONFIG: &str = r#"
[retrieval]
rerank_enabled = false

[embedding]
provider = "hashing"
dims = 256

[llm]
internal_threshold = "CONFIDENTIAL"

[llm.default]
provider = "openai"
model = "unused"
"#;

fn config(extra: &str) -> Config {
    parse_config(&format!("{}\n{}", extra, BASE_CONFIG)).unwrap()
}

struct Harness {
    pipeline: Pipeline,
    cache: Arc<InMemoryCacheBackend>,
}

struct Models {
    default: Arc<dyn LanguageModel>,
    internal: Option<Arc<dyn LanguageModel>>,
    fallback: Option<Arc<dyn LanguageModel>>,
}

impl Models {
    fn default_only(default: Arc<dyn LanguageModel>) -> Self {
        Self {
            default,
            internal: None,
            fallback: None,
        }
    }
}

fn harness(config: &Config, models: Models, decomposer: Option<Arc<dyn Decomposer>>) -> Harness {
    harness_with_history(config, models, decomposer, None)
}

fn harness_with_history(
    config: &Config,
    models: Models,
    decomposer: Option<Arc<dyn Decomposer>>,
    history: Option<Arc<dyn ConversationHistory>>,
) -> Harness {
    let cache = Arc::new(InMemoryCacheBackend::new(100));
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(256));
    let router = LlmRouter::new(&config.llm, models.default, models.internal, models.fallback);
    let pipeline = Pipeline::new(
        config,
        PipelineParts {
            search: Arc::new(InMemoryPassageStore::with_passages(corpus())),
            router,
            embedder,
            cache_backend: Some(cache.clone() as Arc<dyn CacheBackend>),
            reranker: None,
            decomposer,
            history,
            cache_master_key: Some(b"integration-test-master-key".to_vec()),
        },
    );
    Harness { pipeline, cache }
}

fn text(answer: &Answer) -> &str {
    match &answer.body {
        AnswerBody::Text(t) => t,
        AnswerBody::Stream(_) => panic!("expected a text body"),
    }
}

fn general() -> Clearance {
    Clearance::new(SecurityLevel::General)
}

fn confidential() -> Clearance {
    Clearance::new(SecurityLevel::Confidential)
}

// ─── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_answers_from_accessible_passages() {
    let default = Recording::ok("default");
    let h = harness(&config(""), Models::default_only(default.clone()), None);

    let answer = h.pipeline.answer("vacation days?", &general(), None, false).await;

    assert!(answer.success, "{:?}", answer.error);
    assert_eq!(text(&answer), "answer from default");
    assert_eq!(answer.provider.as_deref(), Some("default"));
    assert_eq!(answer.strategy, Some(PlanStrategy::Preprocessed));
    assert!(!answer.from_cache);
    assert_eq!(answer.sources.len(), 1);
    assert_eq!(answer.sources[0].document, "Vacation Policy");
    assert!(answer.partial_context.is_none());

    let prompt = default.last_prompt_text();
    assert!(prompt.contains("20 vacation days"));
    assert!(!prompt.contains("Salary bands"));
}

#[tokio::test]
async fn test_sensitive_content_routes_to_internal_model() {
    let default = Recording::ok("default");
    let internal = Recording::ok("internal");
    let h = harness(
        &config(""),
        Models {
            default: default.clone(),
            internal: Some(internal.clone()),
            fallback: None,
        },
        None,
    );

    let answer = h.pipeline.answer("salary bands", &confidential(), None, false).await;

    assert!(answer.success);
    assert_eq!(answer.provider.as_deref(), Some("internal"));
    assert_eq!(internal.calls(), 1);
    assert_eq!(default.calls(), 0);
}

#[tokio::test]
async fn test_insufficient_clearance_never_reaches_model() {
    let default = Recording::ok("default");
    let h = harness(&config(""), Models::default_only(default.clone()), None);

    let answer = h.pipeline.answer("salary bands", &general(), None, false).await;

    assert!(!answer.success);
    assert_eq!(answer.error, Some(AnswerFailure::InsufficientClearance));
    assert!(answer.sources.is_empty());
    assert!(!text(&answer).contains("L7"));
    assert_eq!(default.calls(), 0);
}

#[tokio::test]
async fn test_department_only_content_names_department() {
    let default = Recording::ok("default");
    let h = harness(&config(""), Models::default_only(default.clone()), None);
    let outsider = Clearance::new(SecurityLevel::Restricted);

    let answer = h.pipeline.answer("Q3 budget target", &outsider, None, false).await;

    assert!(!answer.success);
    assert_eq!(answer.error, Some(AnswerFailure::NoClearance));
    assert_eq!(answer.blocked_departments, vec!["Finance"]);
    assert!(text(&answer).contains("Finance"));
    assert_eq!(default.calls(), 0);

    let member = Clearance::new(SecurityLevel::General).with_department(7, SecurityLevel::Restricted);
    let answer = h.pipeline.answer("Q3 budget target", &member, None, false).await;
    // Org clearance still gates department content.
    assert!(!answer.success);

    let member = Clearance::new(SecurityLevel::Restricted).with_department(7, SecurityLevel::Restricted);
    let answer = h.pipeline.answer("Q3 budget target", &member, None, false).await;
    assert!(answer.success);
    assert_eq!(answer.sources[0].document, "Finance Plan");
}

#[tokio::test]
async fn test_decomposed_department_block_names_department() {
    let default = Recording::ok("default");
    let cfg = config("[planner]\ndecomposition_enabled = true\n");
    let h = harness(
        &cfg,
        Models::default_only(default.clone()),
        Some(Arc::new(FixedSplit(vec!["Q3 budget target", "parking"]))),
    );
    let outsider = Clearance::new(SecurityLevel::Restricted);

    let answer = h
        .pipeline
        .answer("Q3 budget target and parking?", &outsider, None, false)
        .await;

    assert!(!answer.success);
    assert_eq!(answer.error, Some(AnswerFailure::NoClearance));
    assert_eq!(answer.strategy, Some(PlanStrategy::Decomposed));
    assert_eq!(answer.blocked_departments, vec!["Finance"]);
    assert!(text(&answer).contains("Finance"));
    assert!(!text(&answer).contains("4 million"));
    let partial = answer.partial_context.expect("partial context");
    assert_eq!(partial.clearance_blocked, vec!["Q3 budget target"]);
    assert_eq!(partial.unsatisfied, vec!["parking"]);
    assert_eq!(default.calls(), 0);
}

#[tokio::test]
async fn test_no_documents_is_a_polite_success() {
    let default = Recording::ok("default");
    let h = harness(&config(""), Models::default_only(default.clone()), None);

    let answer = h.pipeline.answer("parking garage", &general(), None, false).await;

    assert!(answer.success);
    assert!(answer.error.is_none());
    assert!(answer.provider.is_none());
    assert!(text(&answer).contains("couldn't find"));
    assert_eq!(default.calls(), 0);
}

#[tokio::test]
async fn test_empty_question_is_rejected() {
    let default = Recording::ok("default");
    let h = harness(&config(""), Models::default_only(default.clone()), None);

    let answer = h.pipeline.answer("   ", &general(), None, false).await;

    assert!(!answer.success);
    assert_eq!(answer.error, Some(AnswerFailure::EmptyQuestion));
    assert_eq!(default.calls(), 0);
}

#[tokio::test]
async fn test_partial_context_is_annotated_and_not_cached() {
    let default = Recording::ok("default");
    let cfg = config("[planner]\ndecomposition_enabled = true\n");
    let h = harness(
        &cfg,
        Models::default_only(default.clone()),
        Some(Arc::new(FixedSplit(vec!["vacation days", "salary bands"]))),
    );

    let answer = h
        .pipeline
        .answer("vacation days and salary bands?", &general(), None, false)
        .await;

    assert!(answer.success);
    assert_eq!(answer.strategy, Some(PlanStrategy::Decomposed));
    let partial = answer.partial_context.expect("partial context");
    assert_eq!(partial.satisfied, vec!["vacation days"]);
    assert_eq!(partial.clearance_blocked, vec!["salary bands"]);
    assert!(partial.unsatisfied.is_empty());

    let prompt = default.last_prompt_text();
    assert!(prompt.contains("requiring a higher access level: salary bands"));
    assert!(!prompt.contains("L7"));

    assert_eq!(h.cache.len("response"), 0);
    assert_eq!(h.cache.len("context"), 0);
}

#[tokio::test]
async fn test_fallback_on_provider_outage() {
    let default = Recording::failing("default", 503);
    let fallback = Recording::ok("fallback");
    let h = harness(
        &config(""),
        Models {
            default: default.clone(),
            internal: None,
            fallback: Some(fallback.clone()),
        },
        None,
    );

    let answer = h.pipeline.answer("vacation days?", &general(), None, false).await;

    assert!(answer.success);
    assert!(answer.used_fallback);
    assert_eq!(answer.provider.as_deref(), Some("fallback"));
    assert_eq!(text(&answer), "answer from fallback");
    assert_eq!(default.calls(), 1);
    assert_eq!(fallback.calls(), 1);
}

#[tokio::test]
async fn test_auth_failure_does_not_fall_back() {
    let default = Recording::failing("default", 401);
    let fallback = Recording::ok("fallback");
    let h = harness(
        &config(""),
        Models {
            default: default.clone(),
            internal: None,
            fallback: Some(fallback.clone()),
        },
        None,
    );

    let answer = h.pipeline.answer("vacation days?", &general(), None, false).await;

    assert!(!answer.success);
    assert_eq!(answer.error, Some(AnswerFailure::GenerationFailed));
    assert_eq!(fallback.calls(), 0);
    assert_eq!(h.cache.len("response"), 0);
}

#[tokio::test]
async fn test_fallback_respects_level_ceiling() {
    let internal = Recording::failing("internal", 503);
    let fallback = Recording::ok("fallback");
    let mut cfg = config("");
    cfg.llm.fallback_max_level = Some(SecurityLevel::Restricted);
    let h = harness(
        &cfg,
        Models {
            default: Recording::ok("default"),
            internal: Some(internal.clone()),
            fallback: Some(fallback.clone()),
        },
        None,
    );

    let answer = h.pipeline.answer("salary bands", &confidential(), None, false).await;

    assert!(!answer.success);
    assert_eq!(answer.error, Some(AnswerFailure::GenerationFailed));
    assert_eq!(internal.calls(), 1);
    assert_eq!(fallback.calls(), 0);
}

#[tokio::test]
async fn test_repeat_question_served_from_response_cache() {
    let default = Recording::ok("default");
    let h = harness(&config(""), Models::default_only(default.clone()), None);

    let first = h.pipeline.answer("vacation days?", &general(), None, false).await;
    assert!(!first.from_cache);
    assert_eq!(h.cache.len("response"), 1);

    let second = h.pipeline.answer("vacation days?", &general(), None, false).await;
    assert!(second.success);
    assert!(second.from_cache);
    assert_eq!(text(&second), "answer from default");
    assert_eq!(second.sources, first.sources);
    assert_eq!(default.calls(), 1);
}

#[tokio::test]
async fn test_cached_answer_not_served_to_lower_clearance() {
    let default = Recording::ok("default");
    let h = harness(&config(""), Models::default_only(default.clone()), None);

    let cleared = h.pipeline.answer("salary bands", &confidential(), None, false).await;
    assert!(cleared.success);
    assert_eq!(h.cache.len("response"), 1);

    let lower = h.pipeline.answer("salary bands", &general(), None, false).await;
    assert!(!lower.from_cache);
    assert!(!lower.success);
    assert_eq!(lower.error, Some(AnswerFailure::InsufficientClearance));
    assert_eq!(default.calls(), 1);
}

#[tokio::test]
async fn test_legacy_plaintext_entries_still_served() {
    let default = Recording::ok("default");
    let h = harness(&config(""), Models::default_only(default.clone()), None);

    let answer = h.pipeline.answer("vacation days?", &general(), None, false).await;
    assert!(answer.success);

    // Entries written before encryption was enabled are plain JSON.
    let plaintext = json!({
        "answer": "legacy answer",
        "sources": [],
        "provider": "legacy"
    })
    .to_string();
    h.cache.replace_payloads("response", &plaintext).unwrap();

    let again = h.pipeline.answer("vacation days?", &general(), None, false).await;
    assert!(again.from_cache);
    assert_eq!(text(&again), "legacy answer");
}

#[tokio::test]
async fn test_streaming_answer_is_cached_after_completion() {
    let default = Recording::ok("default");
    let h = harness(&config(""), Models::default_only(default.clone()), None);

    let answer = h.pipeline.answer("vacation days?", &general(), None, true).await;
    assert!(answer.success);
    assert!(matches!(answer.body, AnswerBody::Stream(_)));
    assert_eq!(h.cache.len("response"), 0);

    let AnswerBody::Stream(mut tokens) = answer.body else {
        unreachable!()
    };
    let mut collected = Vec::new();
    while let Some(token) = tokens.next().await {
        collected.push(token.unwrap());
    }
    assert!(collected.len() > 1);
    assert_eq!(collected.concat(), "answer from default");
    assert_eq!(h.cache.len("response"), 1);

    let cached = h.pipeline.answer("vacation days?", &general(), None, false).await;
    assert!(cached.from_cache);
    assert_eq!(text(&cached), "answer from default");
}

#[tokio::test]
async fn test_interrupted_stream_is_not_cached() {
    let h = harness(&config(""), Models::default_only(Arc::new(Interrupted)), None);

    let answer = h.pipeline.answer("vacation days?", &general(), None, true).await;
    let err = answer.body.collect_text().await.unwrap_err();
    assert_eq!(err.to_string(), "could not generate a response");
    assert_eq!(h.cache.len("response"), 0);

    let again = h.pipeline.answer("vacation days?", &general(), None, false).await;
    assert!(!again.from_cache);
    assert_eq!(text(&again), "complete answer");
}

#[tokio::test]
async fn test_dropped_stream_is_not_cached() {
    let default = Recording::ok("default");
    let h = harness(&config(""), Models::default_only(default.clone()), None);

    let answer = h.pipeline.answer("vacation days?", &general(), None, true).await;
    let AnswerBody::Stream(mut tokens) = answer.body else {
        panic!("expected a stream");
    };
    assert!(tokens.next().await.is_some());
    drop(tokens);

    assert_eq!(h.cache.len("response"), 0);
}

#[tokio::test]
async fn test_history_is_included_in_prompt() {
    let default = Recording::ok("default");
    let history = Arc::new(InMemoryHistory::new());
    history
        .append("conv-1", ChatMessage::user("Do interns get vacation?"))
        .unwrap();
    history
        .append("conv-1", ChatMessage::assistant("Interns follow the standard policy."))
        .unwrap();
    let h = harness_with_history(
        &config(""),
        Models::default_only(default.clone()),
        None,
        Some(history as Arc<dyn ConversationHistory>),
    );

    let answer = h
        .pipeline
        .answer("vacation days?", &general(), Some("conv-1"), false)
        .await;
    assert!(answer.success);

    let prompt = default.last_prompt_text();
    assert!(prompt.contains("Do interns get vacation?"));
    assert!(prompt.contains("Interns follow the standard policy."));
}

#[tokio::test]
async fn test_conversation_answer_is_not_shared_through_response_cache() {
    let history = Arc::new(InMemoryHistory::new());
    history
        .append("exec-conv", ChatMessage::user("What are the engineering salary bands?"))
        .unwrap();
    history
        .append(
            "exec-conv",
            ChatMessage::assistant("CONFIDENTIAL: engineers range from L1 to L7."),
        )
        .unwrap();
    let h = harness_with_history(
        &config(""),
        Models::default_only(Arc::new(Echo)),
        None,
        Some(history as Arc<dyn ConversationHistory>),
    );

    let exec = h
        .pipeline
        .answer("vacation days?", &confidential(), Some("exec-conv"), false)
        .await;
    assert!(exec.success);
    assert!(text(&exec).contains("L1 to L7"));
    assert_eq!(h.cache.len("response"), 0);

    let intern = h.pipeline.answer("vacation days?", &general(), None, false).await;
    assert!(intern.success);
    assert!(!intern.from_cache);
    assert!(!text(&intern).contains("L1 to L7"));
    assert!(text(&intern).contains("20 vacation days"));
    assert_eq!(h.cache.len("response"), 1);
}

#[tokio::test]
async fn test_conversation_question_skips_cached_answer() {
    let default = Recording::ok("default");
    let history = Arc::new(InMemoryHistory::new());
    history
        .append("conv-1", ChatMessage::user("Do interns get vacation?"))
        .unwrap();
    let h = harness_with_history(
        &config(""),
        Models::default_only(default.clone()),
        None,
        Some(history as Arc<dyn ConversationHistory>),
    );

    let first = h.pipeline.answer("vacation days?", &general(), None, false).await;
    assert!(!first.from_cache);
    assert_eq!(h.cache.len("response"), 1);

    let follow_up = h
        .pipeline
        .answer("vacation days?", &general(), Some("conv-1"), false)
        .await;
    assert!(follow_up.success);
    assert!(!follow_up.from_cache);
    assert_eq!(default.calls(), 2);
    assert!(default.last_prompt_text().contains("Do interns get vacation?"));
}
