//! Embedding-based reranker.

use anyhow::{bail, Result};
use async_trait::async_trait;
use secure_rag_core::embedding::cosine_similarity;
use secure_rag_core::models::Passage;
use secure_rag_core::store::Reranker;
use std::sync::Arc;

use crate::embedding::Embedder;

/// Scores passages by cosine similarity between the query embedding and
/// each passage's embedding. Ties keep the input order.
///
/// Scores are returned beside the passages; passage metadata keeps the
/// score its search source reported.
pub struct EmbeddingReranker {
    embedder: Arc<dyn Embedder>,
}

impl EmbeddingReranker {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl Reranker for EmbeddingReranker {
    async fn rerank(
        &self,
        query: &str,
        passages: Vec<Passage>,
        top_k: usize,
    ) -> Result<Vec<(Passage, f64)>> {
        if passages.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let mut texts = Vec::with_capacity(passages.len() + 1);
        texts.push(query.to_string());
        texts.extend(passages.iter().map(|p| p.content.clone()));
        let mut vectors = self.embedder.embed(&texts).await?;
        if vectors.len() != texts.len() {
            bail!(
                "reranker expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            );
        }
        let query_vec = vectors.remove(0);

        let mut scored: Vec<(Passage, f64)> = passages
            .into_iter()
            .zip(vectors)
            .map(|(p, v)| {
                let score = f64::from(cosine_similarity(&query_vec, &v)).clamp(0.0, 1.0);
                (p, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }
}
