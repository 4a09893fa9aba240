//! Query planning.
//!
//! Turns a question into one or more search queries. With decomposition
//! disabled (or failing, timing out, or returning nothing) the planner
//! falls back to deterministic normalization, so planning never fails.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use secure_rag_core::models::{PlanStrategy, QueryPlan};
use secure_rag_core::prompt::Prompt;
use secure_rag_core::query::normalize_query;
use secure_rag_core::store::{Decomposer, Decomposition};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::PlannerConfig;
use crate::llm::LanguageModel;

pub struct QueryPlanner {
    decomposer: Option<Arc<dyn Decomposer>>,
    max_sub_queries: usize,
    timeout: Duration,
}

impl QueryPlanner {
    /// `decomposer` is ignored unless decomposition is enabled in `config`.
    pub fn new(config: &PlannerConfig, decomposer: Option<Arc<dyn Decomposer>>) -> Self {
        Self {
            decomposer: decomposer.filter(|_| config.decomposition_enabled),
            max_sub_queries: config.max_sub_queries.max(1),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub async fn plan(&self, question: &str) -> QueryPlan {
        let Some(decomposer) = &self.decomposer else {
            return preprocessed(question);
        };

        let result = tokio::time::timeout(self.timeout, decomposer.decompose(question)).await;
        let decomposition = match result {
            Ok(Ok(d)) => d,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "decomposition failed; using normalized query");
                return preprocessed(question);
            }
            Err(_) => {
                tracing::warn!("decomposition timed out; using normalized query");
                return preprocessed(question);
            }
        };

        let queries = clean_sub_queries(decomposition.queries, self.max_sub_queries);
        let strategy = if decomposition.decomposed && queries.len() > 1 {
            PlanStrategy::Decomposed
        } else {
            PlanStrategy::LlmOptimized
        };
        let queries = match strategy {
            PlanStrategy::Decomposed => queries,
            _ => queries.into_iter().take(1).collect(),
        };

        match QueryPlan::new(queries, strategy) {
            Some(plan) => {
                tracing::info!(strategy = ?plan.strategy, queries = plan.all.len(), "query planned");
                plan
            }
            None => {
                tracing::warn!("decomposer returned no queries; using normalized query");
                preprocessed(question)
            }
        }
    }
}

fn preprocessed(question: &str) -> QueryPlan {
    let query = normalize_query(question);
    tracing::info!(strategy = "preprocessed", queries = 1, "query planned");
    QueryPlan {
        primary: query.clone(),
        all: vec![query],
        strategy: PlanStrategy::Preprocessed,
    }
}

/// Trim, drop empties, de-duplicate case-insensitively (first wins), and cap.
pub fn clean_sub_queries(queries: Vec<String>, max: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    queries
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .filter(|q| seen.insert(q.to_lowercase()))
        .take(max)
        .collect()
}

// ============ LLM decomposer ============

const DECOMPOSE_INSTRUCTION: &str = "You rewrite questions for a document search engine. \
If the question asks about several independent topics, split it into standalone search queries, one per topic. \
Otherwise rewrite it as a single concise search query. \
Reply with JSON only: {\"queries\": [\"...\"], \"decomposed\": true|false}.";

#[derive(Deserialize)]
struct DecomposerReply {
    queries: Vec<String>,
    #[serde(default)]
    decomposed: Option<bool>,
}

/// A [`Decomposer`] that asks a language model for sub-queries.
pub struct LlmDecomposer {
    model: Arc<dyn LanguageModel>,
    max_sub_queries: usize,
}

impl LlmDecomposer {
    pub fn new(model: Arc<dyn LanguageModel>, max_sub_queries: usize) -> Self {
        Self {
            model,
            max_sub_queries: max_sub_queries.max(1),
        }
    }
}

#[async_trait]
impl Decomposer for LlmDecomposer {
    async fn decompose(&self, question: &str) -> Result<Decomposition> {
        let prompt = Prompt::simple(DECOMPOSE_INSTRUCTION, question);
        let reply = self.model.invoke(&prompt).await?;
        let mut decomposition = parse_decomposition(&reply)?;
        decomposition.queries = clean_sub_queries(decomposition.queries, self.max_sub_queries);
        Ok(decomposition)
    }
}

/// Parse the model's JSON reply, tolerating code fences and surrounding prose.
fn parse_decomposition(reply: &str) -> Result<Decomposition> {
    let start = reply
        .find('{')
        .ok_or_else(|| anyhow!("decomposer reply contains no JSON object"))?;
    let end = reply
        .rfind('}')
        .filter(|&end| end > start)
        .ok_or_else(|| anyhow!("decomposer reply contains no JSON object"))?;
    let parsed: DecomposerReply = serde_json::from_str(&reply[start..=end])?;
    let decomposed = parsed.decomposed.unwrap_or(parsed.queries.len() > 1);
    Ok(Decomposition {
        queries: parsed.queries,
        decomposed,
    })
}
