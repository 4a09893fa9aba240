//! Cache payload encryption.
//!
//! Each cache tier gets its own AES-256-GCM key, derived from one master
//! secret with HKDF-SHA256 and a tier-specific info string. Sealed payloads
//! are `enc:v1:` followed by base64 of `nonce || ciphertext`. Payloads
//! without the prefix are legacy plaintext entries written before
//! encryption was enabled and are returned unchanged.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::CacheError;

/// Marks a sealed payload and its format version.
pub const SEALED_PREFIX: &str = "enc:v1:";
const NONCE_LEN: usize = 12;

/// Per-tier authenticated cipher for cache payloads.
pub struct PayloadCipher {
    cipher: Aes256Gcm,
}

impl PayloadCipher {
    /// Derive the key for `tier` from the master secret.
    pub fn derive(master: &[u8], tier: &str) -> Result<Self, CacheError> {
        if master.is_empty() {
            return Err(CacheError::Crypto("empty master secret".into()));
        }
        let info = format!("secure-rag/cache/{}/payload", tier);
        let hk = Hkdf::<Sha256>::new(None, master);
        let mut okm = [0u8; 32];
        hk.expand(info.as_bytes(), &mut okm)
            .map_err(|e| CacheError::Crypto(e.to_string()))?;
        let key = Key::<Aes256Gcm>::from_slice(&okm);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, CacheError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CacheError::Crypto(e.to_string()))?;
        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(format!("{}{}", SEALED_PREFIX, BASE64.encode(blob)))
    }

    pub fn open(&self, payload: &str) -> Result<String, CacheError> {
        let Some(encoded) = payload.strip_prefix(SEALED_PREFIX) else {
            return Ok(payload.to_string());
        };
        let blob = BASE64
            .decode(encoded)
            .map_err(|e| CacheError::Crypto(e.to_string()))?;
        if blob.len() <= NONCE_LEN {
            return Err(CacheError::Crypto("sealed payload too short".into()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CacheError::Crypto("payload authentication failed".into()))?;
        String::from_utf8(plaintext).map_err(|e| CacheError::Crypto(e.to_string()))
    }
}

pub fn is_sealed(payload: &str) -> bool {
    payload.starts_with(SEALED_PREFIX)
}
