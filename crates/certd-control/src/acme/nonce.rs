//! Stateless replay nonces.
//!
//! A nonce is `random(16) || issued_at(8, big-endian) || HMAC-SHA256` under a
//! key derived from the shared secret, so any replica can check it. Single
//! use is enforced on a best-effort basis by claiming it in the cache.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::debug;

use super::error::AcmeError;
use crate::cache::StatusCache;
use crate::secret::SharedSecret;

const RANDOM_LEN: usize = 16;
const BODY_LEN: usize = RANDOM_LEN + 8;
const TAG_LEN: usize = 32;
/// Tolerated clock skew between replicas
const MAX_SKEW_SECS: i64 = 60;

pub struct NonceManager {
    key: hmac::Key,
    ttl_secs: i64,
    cache: Arc<dyn StatusCache>,
    rng: SystemRandom,
}

impl NonceManager {
    pub fn new(secret: &SharedSecret, ttl_secs: i64, cache: Arc<dyn StatusCache>) -> Self {
        Self {
            key: secret.nonce_key(),
            ttl_secs,
            cache,
            rng: SystemRandom::new(),
        }
    }

    pub fn issue(&self, now: i64) -> Result<String, AcmeError> {
        let mut body = [0u8; BODY_LEN];
        self.rng
            .fill(&mut body[..RANDOM_LEN])
            .map_err(|_| AcmeError::ServerInternal("random source failed".to_string()))?;
        body[RANDOM_LEN..].copy_from_slice(&now.to_be_bytes());

        let tag = hmac::sign(&self.key, &body);
        let mut token = Vec::with_capacity(BODY_LEN + TAG_LEN);
        token.extend_from_slice(&body);
        token.extend_from_slice(tag.as_ref());
        Ok(URL_SAFE_NO_PAD.encode(token))
    }

    /// Check authenticity and age without consuming.
    pub fn check(&self, nonce: &str, now: i64) -> Result<(), AcmeError> {
        let raw = URL_SAFE_NO_PAD
            .decode(nonce)
            .map_err(|_| AcmeError::BadNonce)?;
        if raw.len() != BODY_LEN + TAG_LEN {
            return Err(AcmeError::BadNonce);
        }
        let (body, tag) = raw.split_at(BODY_LEN);
        hmac::verify(&self.key, body, tag).map_err(|_| AcmeError::BadNonce)?;

        let mut issued = [0u8; 8];
        issued.copy_from_slice(&body[RANDOM_LEN..]);
        let issued_at = i64::from_be_bytes(issued);
        if issued_at > now + MAX_SKEW_SECS || now - issued_at > self.ttl_secs {
            return Err(AcmeError::BadNonce);
        }
        Ok(())
    }

    /// Check and consume a nonce.
    pub async fn consume(&self, nonce: &str, now: i64) -> Result<(), AcmeError> {
        self.check(nonce, now)?;
        let ttl = Duration::from_secs((self.ttl_secs + MAX_SKEW_SECS).max(1) as u64);
        match self.cache.claim_once(nonce, ttl).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(AcmeError::BadNonce),
            Err(e) => {
                debug!("Nonce claim unavailable, accepting: {}", e);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStatusCache;

    fn manager(secret: &[u8]) -> NonceManager {
        NonceManager::new(
            &SharedSecret::from_bytes(secret),
            300,
            Arc::new(MemoryStatusCache::new()),
        )
    }

    #[tokio::test]
    async fn test_nonce_single_use() {
        let nonces = manager(b"secret");
        let nonce = nonces.issue(1_000).unwrap();
        nonces.consume(&nonce, 1_010).await.unwrap();
        assert_eq!(nonces.consume(&nonce, 1_020).await, Err(AcmeError::BadNonce));
    }

    #[tokio::test]
    async fn test_nonce_valid_across_replicas() {
        let a = manager(b"shared");
        let b = manager(b"shared");
        let nonce = a.issue(1_000).unwrap();
        b.consume(&nonce, 1_001).await.unwrap();

        let other = manager(b"different");
        assert_eq!(other.check(&a.issue(1_000).unwrap(), 1_001), Err(AcmeError::BadNonce));
    }

    #[test]
    fn test_nonce_expiry() {
        let nonces = manager(b"secret");
        let nonce = nonces.issue(1_000).unwrap();
        assert!(nonces.check(&nonce, 1_300).is_ok());
        assert_eq!(nonces.check(&nonce, 1_301), Err(AcmeError::BadNonce));
        assert_eq!(nonces.check("garbage", 1_000), Err(AcmeError::BadNonce));
    }
}
