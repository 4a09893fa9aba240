//! LLM routing and fallback.
//!
//! [`LlmRouter::select_model`] picks a provider tier from the highest
//! security level among the passages going into the prompt. Generation runs
//! through a small state machine:
//!
//! ```text
//! Primary ──ok──▶ Success
//!    │
//!    └─err──▶ PrimaryFailed ──ineligible──▶ Error
//!                  │
//!                  └─eligible──▶ FallbackAttempted ──ok──▶ Success
//!                                        │
//!                                        └─err──▶ FallbackFailed ──▶ Error
//! ```
//!
//! A fallback is eligible when the primary error is retryable, a distinct
//! fallback model is configured, and the content does not exceed
//! `fallback_max_level`. Callers only ever see one synthesized
//! [`RouterError`].

use futures::future::BoxFuture;
use futures::StreamExt;
use secure_rag_core::models::SecurityLevel;
use secure_rag_core::prompt::Prompt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::{LlmError, RouterError};
use crate::llm::{create_model, LanguageModel, TokenStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Default,
    Internal,
    Fallback,
}

impl ModelTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelTier::Default => "default",
            ModelTier::Internal => "internal",
            ModelTier::Fallback => "fallback",
        }
    }
}

/// A selected model and the tier it came from.
#[derive(Clone)]
pub struct ModelHandle {
    pub model: Arc<dyn LanguageModel>,
    pub tier: ModelTier,
}

impl ModelHandle {
    pub fn provider_name(&self) -> &str {
        self.model.name()
    }
}

/// A completed non-streaming generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub provider: String,
    pub used_fallback: bool,
}

/// A primed token stream: the first token already arrived successfully.
pub struct GenerationStream {
    pub tokens: TokenStream,
    pub provider: String,
    pub used_fallback: bool,
}

struct Outcome<T> {
    value: T,
    provider: String,
    used_fallback: bool,
}

enum FallbackState {
    Primary,
    PrimaryFailed(LlmError),
    FallbackAttempted(Arc<dyn LanguageModel>),
    FallbackFailed(LlmError),
}

pub struct LlmRouter {
    default: Arc<dyn LanguageModel>,
    internal: Option<Arc<dyn LanguageModel>>,
    fallback: Option<Arc<dyn LanguageModel>>,
    internal_threshold: SecurityLevel,
    fallback_max_level: Option<SecurityLevel>,
    timeout: Duration,
}

impl LlmRouter {
    pub fn new(
        config: &LlmConfig,
        default: Arc<dyn LanguageModel>,
        internal: Option<Arc<dyn LanguageModel>>,
        fallback: Option<Arc<dyn LanguageModel>>,
    ) -> Self {
        Self {
            default,
            internal,
            fallback,
            internal_threshold: config.internal_threshold,
            fallback_max_level: config.fallback_max_level,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Build every configured provider.
    pub fn from_config(config: &LlmConfig) -> anyhow::Result<Self> {
        let default = create_model(&config.default)?;
        let internal = config.internal.as_ref().map(create_model).transpose()?;
        let fallback = config.fallback.as_ref().map(create_model).transpose()?;
        let router = Self::new(config, default, internal, fallback);
        for (tier, provider) in router.providers() {
            tracing::info!(tier = tier.as_str(), provider = %provider, "llm provider ready");
        }
        Ok(router)
    }

    /// `(tier, provider)` pairs for every configured model.
    pub fn providers(&self) -> Vec<(ModelTier, String)> {
        let mut out = vec![(ModelTier::Default, self.default.name().to_string())];
        if let Some(m) = &self.internal {
            out.push((ModelTier::Internal, m.name().to_string()));
        }
        if let Some(m) = &self.fallback {
            out.push((ModelTier::Fallback, m.name().to_string()));
        }
        out
    }

    /// Pick a model for content whose highest level is `max_level`.
    ///
    /// No passages selects the default model. Content at or above the
    /// internal threshold goes to the internal model when one is configured.
    pub fn select_model(&self, max_level: Option<SecurityLevel>) -> ModelHandle {
        let sensitive = max_level.is_some_and(|l| l >= self.internal_threshold);
        let handle = match (&self.internal, sensitive) {
            (Some(internal), true) => ModelHandle {
                model: internal.clone(),
                tier: ModelTier::Internal,
            },
            (None, true) => {
                tracing::warn!(
                    level = ?max_level,
                    "sensitive content but no internal model configured; using default"
                );
                ModelHandle {
                    model: self.default.clone(),
                    tier: ModelTier::Default,
                }
            }
            (_, false) => ModelHandle {
                model: self.default.clone(),
                tier: ModelTier::Default,
            },
        };
        tracing::info!(
            tier = handle.tier.as_str(),
            provider = handle.provider_name(),
            level = ?max_level,
            "model selected"
        );
        handle
    }

    /// Generate a complete response, falling back once if eligible.
    pub async fn generate(
        &self,
        handle: &ModelHandle,
        prompt: &Prompt,
        max_level: Option<SecurityLevel>,
    ) -> Result<Generation, RouterError> {
        let outcome = self
            .run_with_fallback(handle, max_level, |model| {
                Box::pin(async move { model.invoke(prompt).await })
            })
            .await?;
        Ok(Generation {
            text: outcome.value,
            provider: outcome.provider,
            used_fallback: outcome.used_fallback,
        })
    }

    /// Open a token stream, falling back once if the primary fails before
    /// its first token.
    pub async fn stream(
        &self,
        handle: &ModelHandle,
        prompt: &Prompt,
        max_level: Option<SecurityLevel>,
    ) -> Result<GenerationStream, RouterError> {
        let outcome = self
            .run_with_fallback(handle, max_level, |model| {
                Box::pin(async move {
                    let mut tokens = model.stream(prompt).await?;
                    let first = tokens.next().await.transpose()?;
                    Ok((first, tokens))
                })
            })
            .await?;

        let (first, rest) = outcome.value;
        let idle = self.timeout;
        let tokens = async_stream::stream! {
            if let Some(first) = first {
                yield Ok(first);
            }
            let mut rest = rest;
            loop {
                match tokio::time::timeout(idle, rest.next()).await {
                    Ok(Some(item)) => yield item,
                    Ok(None) => break,
                    Err(_) => {
                        yield Err(LlmError::Timeout);
                        break;
                    }
                }
            }
        };

        Ok(GenerationStream {
            tokens: Box::pin(tokens),
            provider: outcome.provider,
            used_fallback: outcome.used_fallback,
        })
    }

    async fn run_with_fallback<'a, T>(
        &self,
        handle: &ModelHandle,
        max_level: Option<SecurityLevel>,
        attempt: impl Fn(Arc<dyn LanguageModel>) -> BoxFuture<'a, Result<T, LlmError>>,
    ) -> Result<Outcome<T>, RouterError> {
        let primary = handle.model.clone();
        let mut attempts = 0;
        let mut state = FallbackState::Primary;

        loop {
            state = match state {
                FallbackState::Primary => {
                    attempts += 1;
                    match self.timed(attempt(primary.clone())).await {
                        Ok(value) => {
                            return Ok(Outcome {
                                value,
                                provider: primary.name().to_string(),
                                used_fallback: false,
                            })
                        }
                        Err(e) => FallbackState::PrimaryFailed(e),
                    }
                }
                FallbackState::PrimaryFailed(err) => {
                    match self.eligible_fallback(primary.as_ref(), max_level, &err) {
                        Some(fallback) => {
                            tracing::warn!(
                                primary = primary.name(),
                                fallback = fallback.name(),
                                error = %err,
                                "primary model failed; trying fallback"
                            );
                            FallbackState::FallbackAttempted(fallback)
                        }
                        None => {
                            tracing::error!(provider = primary.name(), error = %err, "generation failed");
                            return Err(RouterError::Exhausted { attempts, last: err });
                        }
                    }
                }
                FallbackState::FallbackAttempted(fallback) => {
                    attempts += 1;
                    match self.timed(attempt(fallback.clone())).await {
                        Ok(value) => {
                            return Ok(Outcome {
                                value,
                                provider: fallback.name().to_string(),
                                used_fallback: true,
                            })
                        }
                        Err(e) => {
                            tracing::error!(provider = fallback.name(), error = %e, "fallback model failed");
                            FallbackState::FallbackFailed(e)
                        }
                    }
                }
                FallbackState::FallbackFailed(err) => {
                    return Err(RouterError::Exhausted { attempts, last: err });
                }
            };
        }
    }

    fn eligible_fallback(
        &self,
        primary: &dyn LanguageModel,
        max_level: Option<SecurityLevel>,
        err: &LlmError,
    ) -> Option<Arc<dyn LanguageModel>> {
        if !err.is_retryable() {
            tracing::debug!(error = %err, "error not eligible for fallback");
            return None;
        }
        let fallback = self.fallback.as_ref()?;
        if fallback.name() == primary.name() {
            return None;
        }
        if let (Some(cap), Some(level)) = (self.fallback_max_level, max_level) {
            if level > cap {
                tracing::warn!(%level, %cap, "content too sensitive for fallback model");
                return None;
            }
        }
        Some(fallback.clone())
    }

    async fn timed<T>(&self, fut: impl Future<Output = Result<T, LlmError>>) -> Result<T, LlmError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout),
        }
    }
}
