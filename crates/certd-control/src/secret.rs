//! Shared secret materialized once and read by every replica.

use std::path::Path;
use std::sync::Arc;

use ring::hmac;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Shared secret file {0} is missing")]
    Missing(String),

    #[error("Shared secret file {0} is empty")]
    Empty(String),

    #[error("Failed to read shared secret {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// Read-only shared secret.
///
/// Purpose-specific keys are derived with HMAC so the raw secret is never
/// used directly for more than one thing.
#[derive(Clone)]
pub struct SharedSecret {
    bytes: Arc<Vec<u8>>,
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret")
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl SharedSecret {
    /// Load the secret file. Absence is fatal for the caller.
    pub fn load(path: &Path) -> Result<Self, SecretError> {
        let display = path.display().to_string();
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SecretError::Missing(display))
            }
            Err(source) => {
                return Err(SecretError::Io {
                    path: display,
                    source,
                })
            }
        };
        let trimmed = raw.trim_ascii();
        if trimmed.is_empty() {
            return Err(SecretError::Empty(display));
        }
        Ok(Self::from_bytes(trimmed))
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: Arc::new(bytes.to_vec()),
        }
    }

    /// Derive a 32 byte key for one purpose.
    pub fn derive(&self, purpose: &str) -> Vec<u8> {
        let key = hmac::Key::new(hmac::HMAC_SHA256, &self.bytes);
        hmac::sign(&key, purpose.as_bytes()).as_ref().to_vec()
    }

    /// Secret for management API tokens
    pub fn jwt_secret(&self) -> Vec<u8> {
        self.derive("certd/management-jwt")
    }

    /// HMAC key for ACME nonces
    pub fn nonce_key(&self) -> hmac::Key {
        hmac::Key::new(hmac::HMAC_SHA256, &self.derive("certd/acme-nonce"))
    }
}
