//! Key Store: exclusive, lease-based access to signing keys.
//!
//! Private keys never leave this crate. Callers acquire a [`SigningLease`]
//! for a key reference and sign through it; the lease holds a per-key
//! async mutex, so two tasks in one process can never sign with the same
//! key concurrently. Cross-process exclusivity is layered on top by the
//! store's CA lease row.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rcgen::KeyPair;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::KeyError;

/// Source of signing handles
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Acquire exclusive signing access to `key_ref`, waiting for any
    /// current holder in this process to release it.
    async fn acquire(&self, key_ref: &str) -> Result<SigningLease, KeyError>;

    /// Generate and persist a fresh P-256 key under `key_ref`.
    async fn generate(&self, key_ref: &str) -> Result<(), KeyError>;

    /// Whether a key is present without taking the lease.
    async fn contains(&self, key_ref: &str) -> bool;
}

/// Per-key locks shared by every store implementation
#[derive(Default)]
struct KeyLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyLocks {
    async fn lock(&self, key_ref: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key_ref.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

/// Exclusive signing handle for one key.
///
/// Dropping the lease releases the key.
pub struct SigningLease {
    key_ref: String,
    key_pair: KeyPair,
    signer: EcdsaKeyPair,
    _guard: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for SigningLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningLease")
            .field("key_ref", &self.key_ref)
            .finish_non_exhaustive()
    }
}

impl SigningLease {
    fn new(key_ref: &str, pem: &str, guard: OwnedMutexGuard<()>) -> Result<Self, KeyError> {
        let key_pair = KeyPair::from_pem(pem)
            .map_err(|e| KeyError::Corrupt(format!("{}: {}", key_ref, e)))?;
        let signer = EcdsaKeyPair::from_pkcs8(
            &ECDSA_P256_SHA256_ASN1_SIGNING,
            &key_pair.serialize_der(),
            &SystemRandom::new(),
        )
        .map_err(|e| KeyError::Corrupt(format!("{}: not an ECDSA P-256 key ({})", key_ref, e)))?;

        Ok(Self {
            key_ref: key_ref.to_string(),
            key_pair,
            signer,
            _guard: guard,
        })
    }

    pub fn key_ref(&self) -> &str {
        &self.key_ref
    }

    /// ECDSA P-256 / SHA-256 signature in DER form.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyError> {
        self.signer
            .sign(&SystemRandom::new(), message)
            .map(|sig| sig.as_ref().to_vec())
            .map_err(|e| KeyError::Signing(e.to_string()))
    }

    /// Uncompressed public point
    pub fn public_key_raw(&self) -> &[u8] {
        self.key_pair.public_key_raw()
    }

    pub(crate) fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }
}

impl certd_ocsp::ResponseSigner for SigningLease {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, certd_ocsp::OcspError> {
        SigningLease::sign(self, message).map_err(|e| certd_ocsp::OcspError::Signing(e.to_string()))
    }
}

fn validate_key_ref(key_ref: &str) -> Result<(), KeyError> {
    let ok = !key_ref.is_empty()
        && key_ref.len() <= 128
        && !key_ref.starts_with('.')
        && key_ref
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(KeyError::InvalidReference(key_ref.to_string()))
    }
}

fn generate_pem() -> Result<String, KeyError> {
    let key = KeyPair::generate().map_err(|e| KeyError::Corrupt(e.to_string()))?;
    Ok(key.serialize_pem())
}

/// Keys stored as `<dir>/<key_ref>.pem` (PKCS#8) on a shared volume.
pub struct FileKeyStore {
    dir: PathBuf,
    read_only: bool,
    locks: KeyLocks,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            read_only: false,
            locks: KeyLocks::default(),
        }
    }

    /// A store that can sign but never writes keys (gateway mode).
    pub fn read_only(dir: impl Into<PathBuf>) -> Self {
        Self {
            read_only: true,
            ..Self::new(dir)
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key_ref: &str) -> Result<PathBuf, KeyError> {
        validate_key_ref(key_ref)?;
        Ok(self.dir.join(format!("{}.pem", key_ref)))
    }
}

#[async_trait]
impl KeyStore for FileKeyStore {
    async fn acquire(&self, key_ref: &str) -> Result<SigningLease, KeyError> {
        let path = self.path_for(key_ref)?;
        let guard = self.locks.lock(key_ref).await;

        let pem = match tokio::fs::read_to_string(&path).await {
            Ok(pem) => pem,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeyError::NotFound(key_ref.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        debug!(key_ref, "Signing lease acquired");
        SigningLease::new(key_ref, &pem, guard)
    }

    async fn generate(&self, key_ref: &str) -> Result<(), KeyError> {
        if self.read_only {
            return Err(KeyError::ReadOnly);
        }
        let path = self.path_for(key_ref)?;
        let _guard = self.locks.lock(key_ref).await;

        if tokio::fs::try_exists(&path).await? {
            return Err(KeyError::AlreadyExists(key_ref.to_string()));
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let pem = generate_pem()?;
        let tmp = path.with_extension("pem.tmp");
        tokio::fs::write(&tmp, pem.as_bytes()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }

        tokio::fs::rename(&tmp, &path).await?;
        info!(key_ref, path = %path.display(), "Generated signing key");
        Ok(())
    }

    async fn contains(&self, key_ref: &str) -> bool {
        match self.path_for(key_ref) {
            Ok(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// In-process key store for tests and single-binary setups.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: DashMap<String, String>,
    locks: KeyLocks,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a key, simulating an unmounted or deleted key file.
    pub fn remove(&self, key_ref: &str) {
        self.keys.remove(key_ref);
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn acquire(&self, key_ref: &str) -> Result<SigningLease, KeyError> {
        validate_key_ref(key_ref)?;
        let guard = self.locks.lock(key_ref).await;
        let pem = self
            .keys
            .get(key_ref)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| KeyError::NotFound(key_ref.to_string()))?;
        SigningLease::new(key_ref, &pem, guard)
    }

    async fn generate(&self, key_ref: &str) -> Result<(), KeyError> {
        validate_key_ref(key_ref)?;
        if self.keys.contains_key(key_ref) {
            return Err(KeyError::AlreadyExists(key_ref.to_string()));
        }
        self.keys.insert(key_ref.to_string(), generate_pem()?);
        Ok(())
    }

    async fn contains(&self, key_ref: &str) -> bool {
        self.keys.contains_key(key_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_validate_key_ref() {
        assert!(validate_key_ref("root-ca.key_1").is_ok());
        assert!(validate_key_ref("").is_err());
        assert!(validate_key_ref("../etc/passwd").is_err());
        assert!(validate_key_ref(".hidden").is_err());
        assert!(validate_key_ref("a/b").is_err());
    }

    #[tokio::test]
    async fn test_memory_store_sign() {
        let store = MemoryKeyStore::new();
        store.generate("ca").await.unwrap();
        assert!(store.contains("ca").await);
        assert!(matches!(
            store.generate("ca").await,
            Err(KeyError::AlreadyExists(_))
        ));

        let lease = store.acquire("ca").await.unwrap();
        let sig = lease.sign(b"hello").unwrap();
        let public = ring::signature::UnparsedPublicKey::new(
            &ring::signature::ECDSA_P256_SHA256_ASN1,
            lease.public_key_raw(),
        );
        assert!(public.verify(b"hello", &sig).is_ok());
    }

    #[tokio::test]
    async fn test_missing_key() {
        let store = MemoryKeyStore::new();
        assert!(matches!(
            store.acquire("nope").await,
            Err(KeyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let store = Arc::new(MemoryKeyStore::new());
        store.generate("ca").await.unwrap();

        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let store = store.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _lease = store.acquire("ca").await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_independent_keys_do_not_block() {
        let store = MemoryKeyStore::new();
        store.generate("a").await.unwrap();
        store.generate("b").await.unwrap();

        let _a = store.acquire("a").await.unwrap();
        let b = tokio::time::timeout(Duration::from_millis(200), store.acquire("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path());
        store.generate("root").await.unwrap();
        assert!(dir.path().join("root.pem").exists());

        let lease = store.acquire("root").await.unwrap();
        assert_eq!(lease.key_ref(), "root");
        drop(lease);

        let read_only = FileKeyStore::read_only(dir.path());
        assert!(matches!(
            read_only.generate("other").await,
            Err(KeyError::ReadOnly)
        ));
        assert!(read_only.acquire("root").await.is_ok());
        assert!(matches!(
            read_only.acquire("other").await,
            Err(KeyError::NotFound(_))
        ));
    }
}
