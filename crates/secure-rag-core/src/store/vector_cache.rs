//! In-memory [`CacheBackend`] with brute-force cosine lookup.
//!
//! Entries live per namespace in insertion order. Expired entries are
//! ignored on lookup and purged on insert; when a namespace exceeds its
//! capacity the oldest entries are evicted first.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::embedding::cosine_similarity;
use crate::security::SecurityScope;

use super::{CacheBackend, CacheHit};

struct StoredEntry {
    embedding: Vec<f32>,
    payload: String,
    scope: SecurityScope,
    expires_at_ms: i64,
}

/// In-memory semantic cache backend.
pub struct InMemoryCacheBackend {
    namespaces: RwLock<HashMap<String, Vec<StoredEntry>>>,
    max_entries: usize,
}

impl InMemoryCacheBackend {
    pub fn new(max_entries: usize) -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Number of stored entries in a namespace, expired ones included.
    pub fn len(&self, namespace: &str) -> usize {
        self.namespaces
            .read()
            .map(|ns| ns.get(namespace).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Overwrite the payload of every entry in a namespace.
    ///
    /// Lets tests plant legacy or corrupted payloads.
    #[cfg(any(test, feature = "test-util"))]
    pub fn replace_payloads(&self, namespace: &str, payload: &str) -> Result<()> {
        let mut ns = self
            .namespaces
            .write()
            .map_err(|_| anyhow!("cache lock poisoned"))?;
        if let Some(entries) = ns.get_mut(namespace) {
            for e in entries.iter_mut() {
                e.payload = payload.to_string();
            }
        }
        Ok(())
    }
}

impl Default for InMemoryCacheBackend {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn lookup(
        &self,
        namespace: &str,
        embedding: &[f32],
        threshold: f32,
    ) -> Result<Option<CacheHit>> {
        let now = Utc::now().timestamp_millis();
        let ns = self
            .namespaces
            .read()
            .map_err(|_| anyhow!("cache lock poisoned"))?;
        let Some(entries) = ns.get(namespace) else {
            return Ok(None);
        };

        let best = entries
            .iter()
            .filter(|e| e.expires_at_ms > now)
            .map(|e| (e, cosine_similarity(embedding, &e.embedding)))
            .filter(|(_, sim)| *sim >= threshold)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        Ok(best.map(|(e, similarity)| CacheHit {
            payload: e.payload.clone(),
            scope: e.scope.clone(),
            similarity,
        }))
    }

    async fn insert(
        &self,
        namespace: &str,
        embedding: Vec<f32>,
        payload: String,
        scope: SecurityScope,
        ttl: Duration,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let mut ns = self
            .namespaces
            .write()
            .map_err(|_| anyhow!("cache lock poisoned"))?;
        let entries = ns.entry(namespace.to_string()).or_default();
        entries.retain(|e| e.expires_at_ms > now);
        entries.push(StoredEntry {
            embedding,
            payload,
            scope,
            expires_at_ms: now.saturating_add(ttl_ms),
        });
        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(..excess);
        }
        Ok(())
    }
}
