//! Capability traits consumed by the pipeline.
//!
//! The pipeline never implements search, decomposition, reranking, or
//! cache storage itself. It depends on these traits so backends can be
//! swapped (vector databases, LLM-based decomposers, cross-encoders,
//! Redis-style vector caches, or the in-memory implementations in this
//! module for tests and the CLI).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`Search`] | Similarity search returning passages |
//! | [`Decomposer`] | Split a question into sub-queries |
//! | [`Reranker`] | Re-score passages against a query |
//! | [`CacheBackend`] | Embedding-indexed key/value store with TTL |

pub mod memory;
pub mod vector_cache;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::models::{Passage, SecurityLevel};
use crate::security::SecurityScope;

/// Optional search-time filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    /// Only return passages at or below this level.
    pub max_security_level: Option<SecurityLevel>,
    /// Exact-match constraints on metadata keys.
    pub metadata: Map<String, Value>,
}

impl SearchFilter {
    pub fn max_level(level: SecurityLevel) -> Self {
        Self {
            max_security_level: Some(level),
            metadata: Map::new(),
        }
    }

    /// Whether a passage satisfies the filter.
    ///
    /// Passages without a resolvable level never pass a level constraint.
    pub fn matches(&self, passage: &Passage) -> bool {
        if let Some(max) = self.max_security_level {
            match passage.security_level() {
                Some(level) if level <= max => {}
                _ => return false,
            }
        }
        if self.metadata.is_empty() {
            return true;
        }
        let map = passage.metadata.to_map();
        self.metadata.iter().all(|(k, v)| map.get(k) == Some(v))
    }
}

/// Similarity search over indexed passages.
#[async_trait]
pub trait Search: Send + Sync {
    /// Return up to `k` passages for `query`, best first.
    async fn search(&self, query: &str, k: usize, filter: Option<&SearchFilter>)
        -> Result<Vec<Passage>>;

    /// Like [`search`](Search::search) but with explicit scores.
    ///
    /// The default implementation reads the `score` metadata field.
    async fn search_with_scores(
        &self,
        query: &str,
        k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<(Passage, f64)>> {
        let passages = self.search(query, k, filter).await?;
        Ok(passages
            .into_iter()
            .map(|p| {
                let score = p.metadata.score.unwrap_or(0.0);
                (p, score)
            })
            .collect())
    }
}

/// Result of decomposing a question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decomposition {
    /// Sub-queries in the decomposer's declared order.
    pub queries: Vec<String>,
    /// `false` when the decomposer only rewrote the question.
    pub decomposed: bool,
}

/// Splits a complex question into independent sub-queries.
#[async_trait]
pub trait Decomposer: Send + Sync {
    async fn decompose(&self, question: &str) -> Result<Decomposition>;
}

/// Re-scores passages against a query.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Return at most `top_k` passages, best first, with their scores.
    async fn rerank(
        &self,
        query: &str,
        passages: Vec<Passage>,
        top_k: usize,
    ) -> Result<Vec<(Passage, f64)>>;
}

/// A cache entry found by similarity lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    /// Opaque payload: JSON text or versioned ciphertext.
    pub payload: String,
    pub scope: SecurityScope,
    pub similarity: f32,
}

/// Embedding-indexed key/value store with TTL and similarity-threshold lookup.
///
/// Namespaces keep cache tiers apart inside one backend.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Return the nearest live entry whose similarity is at least `threshold`.
    async fn lookup(
        &self,
        namespace: &str,
        embedding: &[f32],
        threshold: f32,
    ) -> Result<Option<CacheHit>>;

    /// Store a new entry.
    async fn insert(
        &self,
        namespace: &str,
        embedding: Vec<f32>,
        payload: String,
        scope: SecurityScope,
        ttl: Duration,
    ) -> Result<()>;
}
