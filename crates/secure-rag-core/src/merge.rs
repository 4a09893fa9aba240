//! Merge, deduplication, and sub-query classification for multi-query retrieval.
//!
//! # Merge Algorithm
//!
//! 1. Tag each passage with `(sub-query index, rank)`.
//! 2. Stable-sort by sub-query index, then rank, so the output does not
//!    depend on the order in which concurrent searches completed.
//! 3. Keep the first occurrence of each dedup key.
//!
//! Every sub-query remembers the full set of keys it retrieved, including
//! keys that lost the dedup race to an earlier sub-query.

use std::collections::HashSet;

use crate::models::{PartialContext, Passage};

/// A passage tagged with the sub-query that produced it.
#[derive(Debug, Clone)]
pub struct TaggedPassage {
    pub passage: Passage,
    pub query_index: usize,
    pub rank: usize,
}

/// Merged, deduplicated passages plus per-sub-query contributions.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub passages: Vec<Passage>,
    /// `contributions[i]` holds the dedup keys retrieved by sub-query `i`.
    pub contributions: Vec<HashSet<String>>,
}

impl MergeOutcome {
    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }
}

/// Tag per-query result lists with their origin.
pub fn tag_results(per_query: Vec<Vec<Passage>>) -> Vec<TaggedPassage> {
    per_query
        .into_iter()
        .enumerate()
        .flat_map(|(query_index, passages)| {
            passages
                .into_iter()
                .enumerate()
                .map(move |(rank, passage)| TaggedPassage {
                    passage,
                    query_index,
                    rank,
                })
        })
        .collect()
}

/// Merge tagged passages from `query_count` sub-queries.
pub fn merge_tagged(mut tagged: Vec<TaggedPassage>, query_count: usize) -> MergeOutcome {
    tagged.sort_by_key(|t| (t.query_index, t.rank));

    let mut contributions = vec![HashSet::new(); query_count];
    let mut seen = HashSet::new();
    let mut passages = Vec::new();

    for t in tagged {
        let key = t.passage.dedup_key();
        if let Some(set) = contributions.get_mut(t.query_index) {
            set.insert(key.clone());
        }
        if seen.insert(key) {
            passages.push(t.passage);
        }
    }

    MergeOutcome {
        passages,
        contributions,
    }
}

/// Classify each sub-query by what happened to the passages it retrieved.
///
/// - `unsatisfied`: none of its passages reached the security filter.
/// - `clearance_blocked`: some reached the filter, none survived it.
/// - `satisfied`: at least one of its passages is in the final list.
///
/// `queries` must not contain duplicates; a repeated query is classified
/// once, at its first position.
pub fn classify_sub_queries(
    queries: &[String],
    contributions: &[HashSet<String>],
    filtered_keys: &HashSet<String>,
    accessible_keys: &HashSet<String>,
) -> PartialContext {
    let empty = HashSet::new();
    let mut seen = HashSet::new();
    let mut partial = PartialContext::default();

    for (i, query) in queries.iter().enumerate() {
        if !seen.insert(query.as_str()) {
            continue;
        }
        let keys = contributions.get(i).unwrap_or(&empty);
        if !keys.iter().any(|k| filtered_keys.contains(k)) {
            partial.unsatisfied.push(query.clone());
        } else if keys.iter().any(|k| accessible_keys.contains(k)) {
            partial.satisfied.push(query.clone());
        } else {
            partial.clearance_blocked.push(query.clone());
        }
    }

    partial
}

/// Collect the dedup keys of a passage list.
pub fn key_set(passages: &[Passage]) -> HashSet<String> {
    passages.iter().map(Passage::dedup_key).collect()
}
