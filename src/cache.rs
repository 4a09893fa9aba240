//! Two-tier semantic cache.
//!
//! Entries are keyed by the question's embedding, so paraphrases within a
//! tier's similarity threshold hit. Every entry stores the [`SecurityScope`]
//! of the passages it was built from, and a lookup by a requester whose
//! clearance does not satisfy that scope is a miss.
//!
//! The cache never fails a request: embedding, backend, crypto and
//! serialization errors are logged and turned into misses (reads) or
//! skipped/unencrypted writes.

use secure_rag_core::models::{Clearance, Passage, SecurityLevel};
use secure_rag_core::security::SecurityScope;
use secure_rag_core::sources::Source;
use secure_rag_core::store::CacheBackend;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CacheConfig, TierConfig};
use crate::crypto::{is_sealed, PayloadCipher};
use crate::embedding::{embed_query, Embedder};
use crate::error::CacheError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// Final answers. Short TTL, tight threshold.
    Response,
    /// Filtered retrieval results. Longer TTL, looser threshold.
    Context,
}

impl CacheTier {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheTier::Response => "response",
            CacheTier::Context => "context",
        }
    }
}

/// Cached answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub answer: String,
    pub sources: Vec<Source>,
    pub provider: String,
}

/// Cached retrieval output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPayload {
    pub passages: Vec<Passage>,
    pub max_security_level: Option<SecurityLevel>,
}

/// Embedding of one question, computed once and reused across tiers.
#[derive(Debug, Clone)]
pub struct CacheKey {
    embedding: Vec<f32>,
}

impl CacheKey {
    pub fn from_embedding(embedding: Vec<f32>) -> Self {
        Self { embedding }
    }
}

struct Tier {
    settings: TierConfig,
    cipher: Option<PayloadCipher>,
}

impl Tier {
    fn new(tier: CacheTier, settings: &TierConfig, master: Option<&[u8]>) -> Self {
        let cipher = match (settings.encrypt, master) {
            (false, _) => None,
            (true, Some(master)) => match PayloadCipher::derive(master, tier.as_str()) {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!(tier = tier.as_str(), error = %e, "cache encryption unavailable");
                    None
                }
            },
            (true, None) => {
                tracing::warn!(
                    tier = tier.as_str(),
                    "cache encryption requested but no master key is set; storing plaintext"
                );
                None
            }
        };
        Self {
            settings: settings.clone(),
            cipher,
        }
    }
}

pub struct SemanticCache {
    backend: Arc<dyn CacheBackend>,
    embedder: Arc<dyn Embedder>,
    response: Tier,
    context: Tier,
    timeout: Duration,
    enabled: bool,
}

impl SemanticCache {
    /// Build the cache, reading the master secret from `config.encryption_key_env`.
    pub fn new(
        config: &CacheConfig,
        backend: Arc<dyn CacheBackend>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let master = std::env::var(&config.encryption_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        Self::with_master_key(config, backend, embedder, master.as_deref().map(str::as_bytes))
    }

    pub fn with_master_key(
        config: &CacheConfig,
        backend: Arc<dyn CacheBackend>,
        embedder: Arc<dyn Embedder>,
        master: Option<&[u8]>,
    ) -> Self {
        Self {
            response: Tier::new(CacheTier::Response, &config.response, master),
            context: Tier::new(CacheTier::Context, &config.context, master),
            backend,
            embedder,
            timeout: Duration::from_millis(config.timeout_ms),
            enabled: config.enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && (self.response.settings.enabled || self.context.settings.enabled)
    }

    pub fn tier_enabled(&self, tier: CacheTier) -> bool {
        self.enabled && self.tier(tier).settings.enabled
    }

    fn tier(&self, tier: CacheTier) -> &Tier {
        match tier {
            CacheTier::Response => &self.response,
            CacheTier::Context => &self.context,
        }
    }

    /// Embed a question for lookups. `None` when the cache is off or embedding fails.
    pub async fn key_for(&self, question: &str) -> Option<CacheKey> {
        if !self.is_enabled() {
            return None;
        }
        let result = self
            .bounded(async {
                embed_query(self.embedder.as_ref(), question)
                    .await
                    .map_err(|e| CacheError::Embedding(e.to_string()))
            })
            .await;
        match result {
            Ok(embedding) => Some(CacheKey::from_embedding(embedding)),
            Err(e) => {
                tracing::warn!(error = %e, "cache key unavailable; skipping cache");
                None
            }
        }
    }

    /// Nearest entry the requester may see, or `None`.
    pub async fn get<T: DeserializeOwned>(
        &self,
        tier: CacheTier,
        key: &CacheKey,
        clearance: &Clearance,
    ) -> Option<T> {
        if !self.tier_enabled(tier) {
            return None;
        }
        match self.try_get(tier, key, clearance).await {
            Ok(Some(value)) => {
                tracing::debug!(tier = tier.as_str(), "cache hit");
                Some(value)
            }
            Ok(None) => {
                tracing::debug!(tier = tier.as_str(), "cache miss");
                None
            }
            Err(e) => {
                tracing::warn!(tier = tier.as_str(), error = %e, "cache read failed; treating as miss");
                None
            }
        }
    }

    async fn try_get<T: DeserializeOwned>(
        &self,
        tier: CacheTier,
        key: &CacheKey,
        clearance: &Clearance,
    ) -> Result<Option<T>, CacheError> {
        let t = self.tier(tier);
        let hit = self
            .bounded(async {
                self.backend
                    .lookup(tier.as_str(), &key.embedding, t.settings.similarity_threshold)
                    .await
                    .map_err(|e| CacheError::Backend(e.to_string()))
            })
            .await?;
        let Some(hit) = hit else {
            return Ok(None);
        };

        if !hit.scope.allows(clearance) {
            tracing::debug!(
                tier = tier.as_str(),
                min_level = %hit.scope.min_security_level,
                departmental = hit.scope.is_departmental,
                "cache entry outside requester clearance"
            );
            return Ok(None);
        }

        let text = match (&t.cipher, is_sealed(&hit.payload)) {
            (Some(cipher), _) => cipher.open(&hit.payload)?,
            (None, true) => {
                return Err(CacheError::Crypto(
                    "sealed payload but no key configured".into(),
                ))
            }
            (None, false) => hit.payload,
        };
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Store a value with the scope of the passages it was derived from.
    pub async fn set<T: Serialize>(
        &self,
        tier: CacheTier,
        key: &CacheKey,
        value: &T,
        scope: SecurityScope,
    ) {
        if !self.tier_enabled(tier) {
            return;
        }
        if let Err(e) = self.try_set(tier, key, value, scope).await {
            tracing::warn!(tier = tier.as_str(), error = %e, "cache write failed");
        } else {
            tracing::debug!(tier = tier.as_str(), "cache write");
        }
    }

    async fn try_set<T: Serialize>(
        &self,
        tier: CacheTier,
        key: &CacheKey,
        value: &T,
        scope: SecurityScope,
    ) -> Result<(), CacheError> {
        let t = self.tier(tier);
        let json = serde_json::to_string(value)?;
        let payload = match &t.cipher {
            Some(cipher) => match cipher.seal(&json) {
                Ok(sealed) => sealed,
                Err(e) => {
                    tracing::warn!(tier = tier.as_str(), error = %e, "encryption failed; storing plaintext");
                    json
                }
            },
            None => json,
        };
        let ttl = Duration::from_secs(t.settings.ttl_secs);
        self.bounded(async {
            self.backend
                .insert(tier.as_str(), key.embedding.clone(), payload, scope, ttl)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))
        })
        .await
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| CacheError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use anyhow::Result;
    use async_trait::async_trait;
    use secure_rag_core::store::vector_cache::InMemoryCacheBackend;
    use secure_rag_core::store::CacheHit;
    use serde_json::json;

    const KEY: &[u8] = b"test-master-secret";

    fn setup(master: Option<&[u8]>) -> (SemanticCache, Arc<InMemoryCacheBackend>) {
        let backend = Arc::new(InMemoryCacheBackend::new(100));
        let cache = SemanticCache::with_master_key(
            &CacheConfig::default(),
            backend.clone(),
            Arc::new(HashingEmbedder::new(128)),
            master,
        );
        (cache, backend)
    }

    fn passage(level: i64, dept: Option<i64>) -> Passage {
        let mut m = json!({"chunk_id": "c", "security_level": level});
        if let Some(d) = dept {
            m["is_department_only"] = json!(true);
            m["department_id"] = json!(d);
        }
        Passage::new("text", m.as_object().cloned().unwrap())
    }

    fn answer(text: &str) -> ResponsePayload {
        ResponsePayload {
            answer: text.into(),
            sources: vec![],
            provider: "openai:gpt-4o-mini".into(),
        }
    }

    #[tokio::test]
    async fn test_set_then_get_with_encryption() {
        let (cache, backend) = setup(Some(KEY));
        let key = cache.key_for("What is the vacation policy?").await.unwrap();
        let scope = SecurityScope::of(&[passage(1, None)]);
        cache.set(CacheTier::Response, &key, &answer("25 days"), scope).await;

        let hit = backend
            .lookup("response", &key.embedding, 0.99)
            .await
            .unwrap()
            .unwrap();
        assert!(is_sealed(&hit.payload));

        let clearance = Clearance::new(SecurityLevel::General);
        let got: ResponsePayload = cache.get(CacheTier::Response, &key, &clearance).await.unwrap();
        assert_eq!(got.answer, "25 days");
    }

    #[tokio::test]
    async fn test_paraphrase_hits_context_tier() {
        let (cache, _) = setup(Some(KEY));
        let key = cache.key_for("what is the vacation policy").await.unwrap();
        let payload = ContextPayload {
            passages: vec![passage(1, None)],
            max_security_level: Some(SecurityLevel::General),
        };
        cache
            .set(CacheTier::Context, &key, &payload, SecurityScope::public())
            .await;

        let other = cache.key_for("What is the vacation policy, exactly?").await.unwrap();
        let clearance = Clearance::new(SecurityLevel::General);
        let got: Option<ContextPayload> = cache.get(CacheTier::Context, &other, &clearance).await;
        assert_eq!(got, Some(payload));
    }

    #[tokio::test]
    async fn test_clearance_mismatch_is_a_miss() {
        let (cache, _) = setup(Some(KEY));
        let key = cache.key_for("salary bands").await.unwrap();
        let scope = SecurityScope::of(&[passage(3, None)]);
        cache.set(CacheTier::Response, &key, &answer("secret"), scope).await;

        let low = Clearance::new(SecurityLevel::Restricted);
        assert!(cache
            .get::<ResponsePayload>(CacheTier::Response, &key, &low)
            .await
            .is_none());
        let high = Clearance::new(SecurityLevel::Confidential);
        assert!(cache
            .get::<ResponsePayload>(CacheTier::Response, &key, &high)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_departmental_entry_requires_same_department() {
        let (cache, _) = setup(Some(KEY));
        let key = cache.key_for("budget forecast").await.unwrap();
        let scope = SecurityScope::of(&[passage(2, Some(7))]);
        cache.set(CacheTier::Response, &key, &answer("budget"), scope).await;

        let other_dept = Clearance::new(SecurityLevel::HighlyConfidential)
            .with_department(8, SecurityLevel::HighlyConfidential);
        assert!(cache
            .get::<ResponsePayload>(CacheTier::Response, &key, &other_dept)
            .await
            .is_none());
        let same_dept = Clearance::new(SecurityLevel::Restricted)
            .with_department(7, SecurityLevel::Restricted);
        assert!(cache
            .get::<ResponsePayload>(CacheTier::Response, &key, &same_dept)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_legacy_plaintext_entry_is_readable() {
        let (cache, backend) = setup(Some(KEY));
        let key = cache.key_for("holiday calendar").await.unwrap();
        cache
            .set(CacheTier::Response, &key, &answer("new"), SecurityScope::public())
            .await;
        let legacy = serde_json::to_string(&answer("legacy")).unwrap();
        backend.replace_payloads("response", &legacy).unwrap();

        let clearance = Clearance::new(SecurityLevel::General);
        let got: ResponsePayload = cache.get(CacheTier::Response, &key, &clearance).await.unwrap();
        assert_eq!(got.answer, "legacy");
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_a_miss() {
        let (cache, backend) = setup(Some(KEY));
        let key = cache.key_for("holiday calendar").await.unwrap();
        cache
            .set(CacheTier::Response, &key, &answer("x"), SecurityScope::public())
            .await;
        backend.replace_payloads("response", "enc:v1:garbage").unwrap();
        let clearance = Clearance::new(SecurityLevel::General);
        assert!(cache
            .get::<ResponsePayload>(CacheTier::Response, &key, &clearance)
            .await
            .is_none());

        backend.replace_payloads("response", "{not json").unwrap();
        assert!(cache
            .get::<ResponsePayload>(CacheTier::Response, &key, &clearance)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_no_master_key_stores_plaintext() {
        let (cache, backend) = setup(None);
        let key = cache.key_for("office hours").await.unwrap();
        cache
            .set(CacheTier::Response, &key, &answer("9-5"), SecurityScope::public())
            .await;
        let hit = backend
            .lookup("response", &key.embedding, 0.99)
            .await
            .unwrap()
            .unwrap();
        assert!(!is_sealed(&hit.payload));
    }

    #[tokio::test]
    async fn test_disabled_embedder_disables_cache() {
        let cache = SemanticCache::with_master_key(
            &CacheConfig::default(),
            Arc::new(InMemoryCacheBackend::default()),
            Arc::new(crate::embedding::DisabledEmbedder),
            Some(KEY),
        );
        assert!(cache.key_for("anything").await.is_none());
    }

    struct FailingBackend;

    #[async_trait]
    impl CacheBackend for FailingBackend {
        async fn lookup(&self, _: &str, _: &[f32], _: f32) -> Result<Option<CacheHit>> {
            anyhow::bail!("connection refused")
        }
        async fn insert(
            &self,
            _: &str,
            _: Vec<f32>,
            _: String,
            _: SecurityScope,
            _: Duration,
        ) -> Result<()> {
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn test_backend_errors_are_swallowed() {
        let cache = SemanticCache::with_master_key(
            &CacheConfig::default(),
            Arc::new(FailingBackend),
            Arc::new(HashingEmbedder::new(16)),
            Some(KEY),
        );
        let key = cache.key_for("q").await.unwrap();
        cache
            .set(CacheTier::Response, &key, &answer("a"), SecurityScope::public())
            .await;
        let clearance = Clearance::new(SecurityLevel::General);
        assert!(cache
            .get::<ResponsePayload>(CacheTier::Response, &key, &clearance)
            .await
            .is_none());
    }
}
