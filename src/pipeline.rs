//! End-to-end question answering.
//!
//! [`Pipeline::answer`] runs one request through every stage:
//!
//! ```text
//! question ─▶ response cache ─hit─▶ answer
//!               │ miss
//!               ▼
//!          query planner ─▶ context cache ─hit─▶ re-filter ─┐
//!               │ miss                                      │
//!               ▼                                           │
//!       retrieval coordinator ─▶ context cache write        │
//!               │◀──────────────────────────────────────────┘
//!               ▼
//!        prompt assembly ─▶ LLM router ─▶ answer (text or token stream)
//!                                             └─▶ response cache write
//! ```
//!
//! The pipeline holds no mutable state; concurrent requests share only the
//! injected backends. Cache writes only happen for complete answers built
//! from a complete context: a partial context, an interrupted stream, or a
//! dropped stream never reaches the cache. Requests that carry conversation
//! history neither read nor write the response tier.

use futures::stream::{self, Stream, StreamExt};
use secure_rag_core::models::{
    Clearance, PartialContext, PlanStrategy, RetrievalFailure, RetrievalResult,
};
use secure_rag_core::prompt::{build_prompt, ChatMessage};
use secure_rag_core::security::{filter_passages, SecurityScope};
use secure_rag_core::sources::{extract_sources, Source};
use secure_rag_core::store::{CacheBackend, Decomposer, Reranker, Search};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use crate::cache::{CacheKey, CacheTier, ContextPayload, ResponsePayload, SemanticCache};
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::error::{AnswerError, RouterError};
use crate::history::ConversationHistory;
use crate::llm::create_model;
use crate::planner::{LlmDecomposer, QueryPlanner};
use crate::rerank::EmbeddingReranker;
use crate::retrieval::RetrievalCoordinator;
use crate::router::LlmRouter;

const NO_DOCUMENTS_MESSAGE: &str = "I couldn't find any information about that in the knowledge base. \
Try rephrasing your question or asking about a related topic.";
const INSUFFICIENT_CLEARANCE_MESSAGE: &str = "The documents relevant to this question require a higher access level than yours. \
If you believe you need access, contact your administrator.";
const RETRIEVAL_ERROR_MESSAGE: &str = "I couldn't search the knowledge base right now. Please try again shortly.";
const EMPTY_QUESTION_MESSAGE: &str = "Please ask a question.";

/// Tokens of a streamed answer.
pub type AnswerStream = Pin<Box<dyn Stream<Item = Result<String, AnswerError>> + Send>>;

pub enum AnswerBody {
    Text(String),
    Stream(AnswerStream),
}

impl AnswerBody {
    /// Drain the body into a string.
    pub async fn collect_text(self) -> Result<String, AnswerError> {
        match self {
            AnswerBody::Text(text) => Ok(text),
            AnswerBody::Stream(mut tokens) => {
                let mut out = String::new();
                while let Some(token) = tokens.next().await {
                    out.push_str(&token?);
                }
                Ok(out)
            }
        }
    }
}

impl fmt::Debug for AnswerBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnswerBody::Text(text) => f.debug_tuple("Text").field(text).finish(),
            AnswerBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Why an answer could not be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerFailure {
    EmptyQuestion,
    InsufficientClearance,
    NoClearance,
    RetrievalError,
    GenerationFailed,
}

impl fmt::Display for AnswerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::EmptyQuestion => "empty_question",
            Self::InsufficientClearance => "insufficient_clearance",
            Self::NoClearance => "no_clearance",
            Self::RetrievalError => "retrieval_error",
            Self::GenerationFailed => "generation_failed",
        })
    }
}

#[derive(Debug)]
pub struct Answer {
    pub request_id: String,
    pub success: bool,
    pub error: Option<AnswerFailure>,
    pub body: AnswerBody,
    pub sources: Vec<Source>,
    pub partial_context: Option<PartialContext>,
    pub blocked_departments: Vec<String>,
    pub provider: Option<String>,
    pub used_fallback: bool,
    pub from_cache: bool,
    pub strategy: Option<PlanStrategy>,
}

impl Answer {
    fn message(request_id: &str, text: impl Into<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            success: true,
            error: None,
            body: AnswerBody::Text(text.into()),
            sources: Vec::new(),
            partial_context: None,
            blocked_departments: Vec::new(),
            provider: None,
            used_fallback: false,
            from_cache: false,
            strategy: None,
        }
    }

    fn failure(request_id: &str, error: AnswerFailure, text: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Self::message(request_id, text)
        }
    }
}

/// Backends injected into a [`Pipeline`].
pub struct PipelineParts {
    pub search: Arc<dyn Search>,
    pub router: LlmRouter,
    pub embedder: Arc<dyn Embedder>,
    pub cache_backend: Option<Arc<dyn CacheBackend>>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub decomposer: Option<Arc<dyn Decomposer>>,
    pub history: Option<Arc<dyn ConversationHistory>>,
    /// Cache master secret. `None` reads it from the configured env var.
    pub cache_master_key: Option<Vec<u8>>,
}

pub struct Pipeline {
    planner: QueryPlanner,
    retrieval: RetrievalCoordinator,
    cache: Option<Arc<SemanticCache>>,
    router: LlmRouter,
    history: Option<Arc<dyn ConversationHistory>>,
    max_history: usize,
}

impl Pipeline {
    pub fn new(config: &Config, parts: PipelineParts) -> Self {
        let cache = parts.cache_backend.map(|backend| {
            let cache = match &parts.cache_master_key {
                Some(key) => SemanticCache::with_master_key(
                    &config.cache,
                    backend,
                    parts.embedder.clone(),
                    Some(key.as_slice()),
                ),
                None => SemanticCache::new(&config.cache, backend, parts.embedder.clone()),
            };
            Arc::new(cache)
        });

        Self {
            planner: QueryPlanner::new(&config.planner, parts.decomposer),
            retrieval: RetrievalCoordinator::new(&config.retrieval, parts.search, parts.reranker),
            cache: cache.filter(|c| c.is_enabled()),
            router: parts.router,
            history: parts.history,
            max_history: config.llm.max_history_messages,
        }
    }

    /// Wire up providers from configuration around the given backends.
    ///
    /// The embedding reranker is used when an embedding provider is
    /// configured, and the default LLM doubles as the decomposer.
    pub fn from_config(
        config: &Config,
        search: Arc<dyn Search>,
        cache_backend: Option<Arc<dyn CacheBackend>>,
        history: Option<Arc<dyn ConversationHistory>>,
    ) -> anyhow::Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let reranker: Option<Arc<dyn Reranker>> = config
            .embedding
            .is_enabled()
            .then(|| Arc::new(EmbeddingReranker::new(embedder.clone())) as Arc<dyn Reranker>);
        let decomposer: Option<Arc<dyn Decomposer>> = if config.planner.decomposition_enabled {
            let model = create_model(&config.llm.default)?;
            Some(Arc::new(LlmDecomposer::new(model, config.planner.max_sub_queries)))
        } else {
            None
        };

        Ok(Self::new(
            config,
            PipelineParts {
                search,
                router: LlmRouter::from_config(&config.llm)?,
                embedder,
                cache_backend: cache_backend.filter(|_| config.embedding.is_enabled()),
                reranker,
                decomposer,
                history,
                cache_master_key: None,
            },
        ))
    }

    /// Answer one question for a requester.
    pub async fn answer(
        &self,
        question: &str,
        clearance: &Clearance,
        conversation_id: Option<&str>,
        streaming: bool,
    ) -> Answer {
        let request_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("answer", request_id = %request_id);
        self.answer_inner(request_id.clone(), question, clearance, conversation_id, streaming)
            .instrument(span)
            .await
    }

    async fn answer_inner(
        &self,
        request_id: String,
        question: &str,
        clearance: &Clearance,
        conversation_id: Option<&str>,
        streaming: bool,
    ) -> Answer {
        let question = question.trim();
        if question.is_empty() {
            return Answer::failure(&request_id, AnswerFailure::EmptyQuestion, EMPTY_QUESTION_MESSAGE);
        }

        let cache_key = match &self.cache {
            Some(cache) => cache.key_for(question).await,
            None => None,
        };

        // Answers shaped by a conversation are never shared through the response tier.
        let history = self.recent_history(conversation_id).await;
        let response_key = cache_key.clone().filter(|_| history.is_empty());

        if let (Some(cache), Some(key)) = (&self.cache, &response_key) {
            if let Some(hit) = cache
                .get::<ResponsePayload>(CacheTier::Response, key, clearance)
                .await
            {
                tracing::info!(provider = %hit.provider, "answered from response cache");
                let body = if streaming {
                    AnswerBody::Stream(Box::pin(stream::once(async move { Ok(hit.answer) })))
                } else {
                    AnswerBody::Text(hit.answer)
                };
                return Answer {
                    body,
                    sources: hit.sources,
                    provider: Some(hit.provider),
                    from_cache: true,
                    ..Answer::message(&request_id, String::new())
                };
            }
        }

        let plan = self.planner.plan(question).await;
        let retrieval = self
            .retrieve_with_cache(&plan.all, clearance, question, cache_key.as_ref())
            .await;

        if !retrieval.success {
            let mut answer = retrieval_failure_answer(&request_id, &retrieval);
            answer.strategy = Some(plan.strategy);
            return answer;
        }

        let passages = retrieval.passages;
        let partial = retrieval.partial_context;
        let max_level = retrieval.max_security_level;
        let prompt = build_prompt(question, &passages, partial.as_ref(), &history, self.max_history);
        let sources = extract_sources(&passages);
        let scope = SecurityScope::of(&passages);
        let cacheable = partial.is_none();
        let handle = self.router.select_model(max_level);

        let mut answer = Answer {
            sources: sources.clone(),
            partial_context: partial,
            blocked_departments: retrieval.blocked_departments,
            strategy: Some(plan.strategy),
            ..Answer::message(&request_id, String::new())
        };

        if !streaming {
            match self.router.generate(&handle, &prompt, max_level).await {
                Ok(generation) => {
                    if cacheable {
                        if let (Some(cache), Some(key)) = (&self.cache, &response_key) {
                            let payload = ResponsePayload {
                                answer: generation.text.clone(),
                                sources,
                                provider: generation.provider.clone(),
                            };
                            cache.set(CacheTier::Response, key, &payload, scope).await;
                        }
                    }
                    answer.body = AnswerBody::Text(generation.text);
                    answer.provider = Some(generation.provider);
                    answer.used_fallback = generation.used_fallback;
                }
                Err(e) => return generation_failure(answer, e),
            }
            return answer;
        }

        let generation = match self.router.stream(&handle, &prompt, max_level).await {
            Ok(g) => g,
            Err(e) => return generation_failure(answer, e),
        };
        answer.provider = Some(generation.provider.clone());
        answer.used_fallback = generation.used_fallback;

        let cache = self.cache.clone().filter(|_| cacheable);
        let provider = generation.provider;
        let mut tokens = generation.tokens;
        let body = async_stream::stream! {
            let mut full = String::new();
            while let Some(item) = tokens.next().await {
                match item {
                    Ok(token) => {
                        full.push_str(&token);
                        yield Ok(token);
                    }
                    Err(e) => {
                        tracing::error!(request_id = %request_id, error = %e, "answer stream interrupted");
                        yield Err(AnswerError::Interrupted(e));
                        return;
                    }
                }
            }
            if let (Some(cache), Some(key)) = (cache, response_key) {
                let payload = ResponsePayload { answer: full, sources, provider };
                cache.set(CacheTier::Response, &key, &payload, scope).await;
            }
        };
        answer.body = AnswerBody::Stream(Box::pin(body));
        answer
    }

    async fn retrieve_with_cache(
        &self,
        queries: &[String],
        clearance: &Clearance,
        question: &str,
        cache_key: Option<&CacheKey>,
    ) -> RetrievalResult {
        let cache = self.cache.as_ref().zip(cache_key);

        if let Some((cache, key)) = cache {
            if let Some(hit) = cache
                .get::<ContextPayload>(CacheTier::Context, key, clearance)
                .await
            {
                let outcome = filter_passages(hit.passages, clearance);
                if !outcome.accessible.is_empty() {
                    tracing::info!(passages = outcome.accessible.len(), "context from cache");
                    return RetrievalResult::found(outcome.accessible, None);
                }
            }
        }

        let result = self.retrieval.retrieve(queries, clearance, question).await;

        if let Some((cache, key)) = cache {
            if result.success && result.partial_context.is_none() {
                let payload = ContextPayload {
                    passages: result.passages.clone(),
                    max_security_level: result.max_security_level,
                };
                let scope = SecurityScope::of(&result.passages);
                cache.set(CacheTier::Context, key, &payload, scope).await;
            }
        }
        result
    }

    async fn recent_history(&self, conversation_id: Option<&str>) -> Vec<ChatMessage> {
        let (Some(history), Some(id)) = (&self.history, conversation_id) else {
            return Vec::new();
        };
        match history.recent(id, self.max_history).await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(conversation = id, error = %e, "history unavailable");
                Vec::new()
            }
        }
    }
}

fn retrieval_failure_answer(request_id: &str, retrieval: &RetrievalResult) -> Answer {
    let mut answer = match retrieval.error {
        Some(RetrievalFailure::NoDocuments) | None => Answer::message(request_id, NO_DOCUMENTS_MESSAGE),
        Some(RetrievalFailure::NoClearance) => Answer::failure(
            request_id,
            AnswerFailure::NoClearance,
            no_clearance_message(&retrieval.blocked_departments),
        ),
        Some(RetrievalFailure::InsufficientClearance) => Answer::failure(
            request_id,
            AnswerFailure::InsufficientClearance,
            INSUFFICIENT_CLEARANCE_MESSAGE,
        ),
        Some(RetrievalFailure::RetrievalError) => {
            Answer::failure(request_id, AnswerFailure::RetrievalError, RETRIEVAL_ERROR_MESSAGE)
        }
    };
    answer.partial_context = retrieval.partial_context.clone();
    answer.blocked_departments = retrieval.blocked_departments.clone();
    answer
}

fn no_clearance_message(departments: &[String]) -> String {
    if departments.is_empty() {
        return INSUFFICIENT_CLEARANCE_MESSAGE.to_string();
    }
    format!(
        "The documents relevant to this question are restricted to the following department(s): {}. \
Contact that department or your administrator to request access.",
        departments.join(", ")
    )
}

fn generation_failure(mut answer: Answer, err: RouterError) -> Answer {
    let RouterError::Exhausted { attempts, .. } = &err;
    tracing::error!(
        request_id = %answer.request_id,
        attempts = *attempts,
        last_error = %err.last_error(),
        "generation failed"
    );
    answer.success = false;
    answer.error = Some(AnswerFailure::GenerationFailed);
    answer.body = AnswerBody::Text(err.to_string());
    answer
}
