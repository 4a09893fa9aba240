//! In-memory [`Search`] implementation for tests and the CLI.
//!
//! The passage set is fixed at construction. Search is brute-force term
//! matching: a passage scores the fraction of query terms it contains, so
//! scores already lie in `[0.0, 1.0]`.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::Passage;

use super::{Search, SearchFilter};

/// Terms shorter than this are ignored when scoring.
const MIN_TERM_LEN: usize = 2;

/// In-memory passage store.
pub struct InMemoryPassageStore {
    passages: Vec<Passage>,
}

impl InMemoryPassageStore {
    pub fn with_passages(passages: Vec<Passage>) -> Self {
        Self { passages }
    }
}

fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= MIN_TERM_LEN)
        .map(str::to_lowercase)
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

#[async_trait]
impl Search for InMemoryPassageStore {
    async fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<Passage>> {
        let terms = query_terms(query);
        if terms.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, f64)> = self
            .passages
            .iter()
            .enumerate()
            .filter(|(_, p)| filter.map_or(true, |f| f.matches(p)))
            .filter_map(|(i, p)| {
                let haystack = format!(
                    "{} {}",
                    p.metadata.title.as_deref().unwrap_or_default(),
                    p.content
                )
                .to_lowercase();
                let matches = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                if matches > 0 {
                    Some((i, matches as f64 / terms.len() as f64))
                } else {
                    None
                }
            })
            .collect();

        // Stable sort keeps insertion order among equal scores.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(i, score)| {
                let mut p = self.passages[i].clone();
                p.metadata.score = Some(score);
                p
            })
            .collect())
    }
}
