//! Retrieval coordination.
//!
//! # Single-query path
//!
//! One search, then the security classifier. With
//! `prefilter_single_query` the requester's org level is also passed to the
//! search backend as a filter.
//!
//! # Multi-query path
//!
//! 1. Search every sub-query without security filtering (concurrently by
//!    default), each under its own timeout.
//! 2. Merge and deduplicate deterministically (sub-query index, then rank).
//! 3. Rerank the merged set against the original question and drop results
//!    below the score threshold.
//! 4. Apply the security classifier exactly once.
//! 5. Classify each sub-query as satisfied, clearance-blocked or unsatisfied.
//!
//! Search failures and timeouts degrade one sub-query to "no passages";
//! only when every sub-query errors is the whole retrieval an error.
//! Reranker failures keep the merged order.

use futures::future::join_all;
use secure_rag_core::merge::{classify_sub_queries, key_set, merge_tagged, tag_results};
use secure_rag_core::models::{Clearance, PartialContext, Passage, RetrievalFailure, RetrievalResult};
use secure_rag_core::security::filter_passages;
use secure_rag_core::store::{Reranker, Search, SearchFilter};
use std::sync::Arc;
use std::time::Duration;

use crate::config::RetrievalConfig;

enum SearchOutcome {
    Found(Vec<Passage>),
    Failed,
    TimedOut,
}

impl SearchOutcome {
    fn into_passages(self) -> Vec<Passage> {
        match self {
            SearchOutcome::Found(p) => p,
            SearchOutcome::Failed | SearchOutcome::TimedOut => Vec::new(),
        }
    }
}

pub struct RetrievalCoordinator {
    search: Arc<dyn Search>,
    reranker: Option<Arc<dyn Reranker>>,
    settings: RetrievalConfig,
}

impl RetrievalCoordinator {
    pub fn new(
        settings: &RetrievalConfig,
        search: Arc<dyn Search>,
        reranker: Option<Arc<dyn Reranker>>,
    ) -> Self {
        Self {
            search,
            reranker: reranker.filter(|_| settings.rerank_enabled),
            settings: settings.clone(),
        }
    }

    pub async fn retrieve(
        &self,
        queries: &[String],
        clearance: &Clearance,
        original_question: &str,
    ) -> RetrievalResult {
        if queries.len() <= 1 {
            self.retrieve_single(queries.first(), clearance).await
        } else {
            self.retrieve_multi(queries, clearance, original_question)
                .await
        }
    }

    async fn retrieve_single(&self, query: Option<&String>, clearance: &Clearance) -> RetrievalResult {
        let Some(query) = query else {
            return RetrievalResult::failed(RetrievalFailure::NoDocuments);
        };
        let filter = self
            .settings
            .prefilter_single_query
            .then(|| SearchFilter::max_level(clearance.org_level));

        let passages = match self.search_one(query, filter.as_ref()).await {
            SearchOutcome::Found(p) => p,
            SearchOutcome::Failed => return RetrievalResult::failed(RetrievalFailure::RetrievalError),
            SearchOutcome::TimedOut => Vec::new(),
        };
        if passages.is_empty() {
            tracing::info!(result = "no_documents", "retrieval finished");
            return RetrievalResult::failed(RetrievalFailure::NoDocuments);
        }

        let outcome = filter_passages(passages, clearance);
        log_skipped(&outcome.skipped);
        let blocked: Vec<String> = outcome.blocked_departments.into_iter().collect();
        if outcome.accessible.is_empty() {
            return clearance_failure(blocked, None);
        }
        tracing::info!(
            accessible = outcome.accessible.len(),
            denied = outcome.denied,
            "retrieval finished"
        );
        RetrievalResult::found(outcome.accessible, None).with_blocked_departments(blocked)
    }

    async fn retrieve_multi(
        &self,
        queries: &[String],
        clearance: &Clearance,
        original_question: &str,
    ) -> RetrievalResult {
        let outcomes: Vec<SearchOutcome> = if self.settings.concurrent_sub_queries {
            join_all(queries.iter().map(|q| self.search_one(q, None))).await
        } else {
            let mut out = Vec::with_capacity(queries.len());
            for q in queries {
                out.push(self.search_one(q, None).await);
            }
            out
        };

        if outcomes.iter().all(|o| matches!(o, SearchOutcome::Failed)) {
            tracing::error!(queries = queries.len(), "every sub-query search failed");
            return RetrievalResult::failed(RetrievalFailure::RetrievalError);
        }

        let per_query: Vec<Vec<Passage>> = outcomes
            .into_iter()
            .map(SearchOutcome::into_passages)
            .collect();
        let retrieved: usize = per_query.iter().map(Vec::len).sum();
        let merged = merge_tagged(tag_results(per_query), queries.len());
        tracing::debug!(
            retrieved,
            unique = merged.passages.len(),
            "merged sub-query results"
        );

        if merged.is_empty() {
            tracing::info!(result = "no_documents", "retrieval finished");
            return RetrievalResult::failed(RetrievalFailure::NoDocuments)
                .with_partial_context(all_unsatisfied(queries));
        }

        let candidates = self.rerank(original_question, merged.passages).await;
        if candidates.is_empty() {
            tracing::info!(result = "no_documents", "all passages fell below the rerank threshold");
            return RetrievalResult::failed(RetrievalFailure::NoDocuments)
                .with_partial_context(all_unsatisfied(queries));
        }

        let filtered_keys = key_set(&candidates);
        let outcome = filter_passages(candidates, clearance);
        log_skipped(&outcome.skipped);
        let accessible_keys = key_set(&outcome.accessible);
        let partial = classify_sub_queries(
            queries,
            &merged.contributions,
            &filtered_keys,
            &accessible_keys,
        );
        tracing::info!(
            satisfied = partial.satisfied.len(),
            clearance_blocked = partial.clearance_blocked.len(),
            unsatisfied = partial.unsatisfied.len(),
            "sub-queries classified"
        );

        let blocked: Vec<String> = outcome.blocked_departments.into_iter().collect();
        if outcome.accessible.is_empty() {
            return clearance_failure(blocked, Some(partial));
        }

        tracing::info!(
            accessible = outcome.accessible.len(),
            denied = outcome.denied,
            "retrieval finished"
        );
        let partial = (!partial.is_complete()).then_some(partial);
        RetrievalResult::found(outcome.accessible, partial).with_blocked_departments(blocked)
    }

    async fn search_one(&self, query: &str, filter: Option<&SearchFilter>) -> SearchOutcome {
        let timeout = Duration::from_millis(self.settings.search_timeout_ms);
        match tokio::time::timeout(timeout, self.search.search(query, self.settings.top_k, filter)).await {
            Ok(Ok(passages)) => SearchOutcome::Found(passages),
            Ok(Err(e)) => {
                tracing::warn!(query, error = %e, "search failed");
                SearchOutcome::Failed
            }
            Err(_) => {
                tracing::warn!(query, ?timeout, "search timed out");
                SearchOutcome::TimedOut
            }
        }
    }

    /// Rerank against the original question, keeping scores at or above the
    /// threshold. Without a reranker, or if it fails, the input is returned.
    async fn rerank(&self, question: &str, passages: Vec<Passage>) -> Vec<Passage> {
        let Some(reranker) = &self.reranker else {
            return passages;
        };
        let timeout = Duration::from_millis(self.settings.rerank_timeout_ms);
        let before = passages.len();
        let result = tokio::time::timeout(
            timeout,
            reranker.rerank(question, passages.clone(), self.settings.rerank_top_k),
        )
        .await;

        match result {
            Ok(Ok(scored)) => {
                let kept: Vec<Passage> = scored
                    .into_iter()
                    .filter(|(_, score)| *score >= self.settings.rerank_threshold)
                    .map(|(p, _)| p)
                    .collect();
                tracing::debug!(before, after = kept.len(), "reranked");
                kept
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "rerank failed; keeping merged order");
                passages
            }
            Err(_) => {
                tracing::warn!(?timeout, "rerank timed out; keeping merged order");
                passages
            }
        }
    }
}

fn all_unsatisfied(queries: &[String]) -> PartialContext {
    let mut unsatisfied: Vec<String> = Vec::with_capacity(queries.len());
    for q in queries {
        if !unsatisfied.contains(q) {
            unsatisfied.push(q.clone());
        }
    }
    PartialContext {
        unsatisfied,
        ..PartialContext::default()
    }
}

fn clearance_failure(blocked: Vec<String>, partial: Option<PartialContext>) -> RetrievalResult {
    let kind = if blocked.is_empty() {
        RetrievalFailure::InsufficientClearance
    } else {
        RetrievalFailure::NoClearance
    };
    tracing::info!(result = %kind, blocked_departments = ?blocked, "retrieval finished");
    let result = RetrievalResult::failed(kind).with_blocked_departments(blocked);
    match partial {
        Some(p) => result.with_partial_context(p),
        None => result,
    }
}

fn log_skipped(skipped: &[(String, Option<String>)]) {
    for (key, raw) in skipped {
        tracing::warn!(
            passage = %key,
            level = raw.as_deref().unwrap_or("<missing>"),
            "skipping passage with unrecognized security level"
        );
    }
}
