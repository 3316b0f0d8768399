//! OCSP status serving: response signing from the store and the
//! Gateway-side responder that prefers the cache.

use std::sync::Arc;

use certd_cert::KeyStore;
use certd_db::entities::{certificate::CertificateStatus, certificate_authority};
use certd_ocsp::{
    CertId, HashAlgorithm, IssuerHashes, ParsedRequest, ResponderIdentity, ResponseBuilder,
    SerialStatus, StatusQuery,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::cache::{CachedResponse, StatusCache};
use crate::config::OcspConfig;
use crate::error::IssuanceError;
use crate::jobs::Job;
use crate::queue::JobQueue;
use crate::store::CaStore;

/// Whether a cached response may be served at `now`.
pub fn is_servable(
    entry: &CachedResponse,
    now: i64,
    staleness_window_secs: i64,
    key_generation: i32,
) -> bool {
    entry.this_update <= now
        && now < entry.next_update
        && now - entry.this_update <= staleness_window_secs
        && entry.key_generation == key_generation
}

/// Whether a servable response is close enough to its limits to re-sign.
pub fn needs_refresh(entry: &CachedResponse, now: i64, config: &OcspConfig) -> bool {
    let expires = entry
        .next_update
        .min(entry.this_update + config.staleness_window_secs);
    now >= expires - config.refresh_margin_secs
}

/// Status and version of one serial as the store knows it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredStatus {
    pub status: SerialStatus,
    pub status_version: i64,
}

/// Signs responses with a CA's delegated responder key.
#[derive(Clone)]
pub struct OcspSigner {
    store: CaStore,
    keys: Arc<dyn KeyStore>,
    validity_secs: i64,
}

impl OcspSigner {
    pub fn new(store: CaStore, keys: Arc<dyn KeyStore>, config: &OcspConfig) -> Self {
        Self {
            store,
            keys,
            validity_secs: config.validity_secs,
        }
    }

    /// Current status of a serial. Expired certificates still answer
    /// `good`; only revocation changes the OCSP answer.
    pub async fn stored_status(
        &self,
        ca_id: &str,
        serial: i64,
    ) -> Result<StoredStatus, IssuanceError> {
        let Some(record) = self.store.serial_record(ca_id, serial).await? else {
            return Ok(StoredStatus {
                status: SerialStatus::Unknown,
                status_version: 0,
            });
        };
        let status = match (record.certificate.status, &record.revocation) {
            (CertificateStatus::Revoked, Some(revocation)) => SerialStatus::Revoked {
                revoked_at: revocation.revoked_at.timestamp(),
                reason: Some(revocation.reason.code()),
            },
            _ => SerialStatus::Good,
        };
        Ok(StoredStatus {
            status,
            status_version: record.certificate.status_version,
        })
    }

    /// Sign one response covering `entries`, echoing `nonce`.
    pub async fn sign(
        &self,
        ca: &certificate_authority::Model,
        entries: Vec<(CertId, SerialStatus)>,
        nonce: Option<Vec<u8>>,
        now: DateTime<Utc>,
    ) -> Result<(Vec<u8>, i64, i64), IssuanceError> {
        let responder = IssuerHashes::from_certificate_pem(&ca.ocsp_cert_pem)?;
        let identity = ResponderIdentity {
            key_hash: responder.sha1_key_hash(),
            certificate_der: certd_ocsp::pem_to_der(&ca.ocsp_cert_pem)?,
        };
        let this_update = now.timestamp();
        let next_update = this_update + self.validity_secs;

        let mut builder = ResponseBuilder::new(identity, this_update).with_nonce(nonce);
        for (cert_id, status) in entries {
            builder = builder.add_response(cert_id, status, this_update, next_update)?;
        }

        let lease = self.keys.acquire(&ca.ocsp_key_ref).await?;
        let der = builder.sign(&lease)?;
        Ok((der, this_update, next_update))
    }

    /// Sign the cacheable response for a serial: SHA-1 CertID, no nonce.
    pub async fn sign_cacheable(
        &self,
        ca: &certificate_authority::Model,
        serial: i64,
        now: DateTime<Utc>,
    ) -> Result<CachedResponse, IssuanceError> {
        let stored = self.stored_status(&ca.id, serial).await?;
        self.sign_known(ca, serial, stored, now).await
    }

    /// Like [`sign_cacheable`](Self::sign_cacheable) with the status already read.
    pub async fn sign_known(
        &self,
        ca: &certificate_authority::Model,
        serial: i64,
        stored: StoredStatus,
        now: DateTime<Utc>,
    ) -> Result<CachedResponse, IssuanceError> {
        let issuer = IssuerHashes::from_certificate_pem(&ca.cert_pem)?;
        let cert_id = certd_ocsp::cert_id(&issuer, HashAlgorithm::Sha1, serial)?;
        let (der, this_update, next_update) = self
            .sign(ca, vec![(cert_id, stored.status)], None, now)
            .await?;
        Ok(CachedResponse {
            der,
            status: stored.status.label().to_string(),
            this_update,
            next_update,
            status_version: stored.status_version,
            key_generation: ca.key_generation,
        })
    }
}

/// Gateway-side OCSP responder.
pub struct OcspResponder {
    store: CaStore,
    cache: Arc<dyn StatusCache>,
    queue: Arc<dyn JobQueue>,
    signer: Option<OcspSigner>,
    config: OcspConfig,
    issuers: DashMap<String, Arc<IssuerHashes>>,
}

impl OcspResponder {
    /// `signer` is the Gateway's read-only signing capability, if configured.
    pub fn new(
        store: CaStore,
        cache: Arc<dyn StatusCache>,
        queue: Arc<dyn JobQueue>,
        signer: Option<OcspSigner>,
        config: OcspConfig,
    ) -> Self {
        Self {
            store,
            cache,
            queue,
            signer,
            config,
            issuers: DashMap::new(),
        }
    }

    /// Answer a DER request. Always returns a DER `OCSPResponse`.
    pub async fn respond_der(&self, request: &[u8]) -> Vec<u8> {
        match ParsedRequest::from_der(request) {
            Ok(parsed) => self.respond(parsed, Utc::now()).await,
            Err(e) => {
                debug!("Malformed OCSP request: {}", e);
                certd_ocsp::malformed_request()
            }
        }
    }

    /// Answer the GET binding's path segment.
    pub async fn respond_get(&self, segment: &str) -> Vec<u8> {
        match ParsedRequest::from_get_path(segment) {
            Ok(parsed) => self.respond(parsed, Utc::now()).await,
            Err(e) => {
                debug!("Malformed OCSP request: {}", e);
                certd_ocsp::malformed_request()
            }
        }
    }

    pub async fn respond(&self, request: ParsedRequest, now: DateTime<Utc>) -> Vec<u8> {
        let cas = match self.store.list_cas().await {
            Ok(cas) => cas,
            Err(e) => {
                warn!("OCSP store lookup failed: {}", e);
                return certd_ocsp::try_later();
            }
        };

        let mut targets = Vec::with_capacity(request.queries.len());
        for query in &request.queries {
            match self.issuer_of(&cas, query) {
                Some(ca) => targets.push((ca, query)),
                None => {
                    debug!("OCSP request for an unknown issuer");
                    return certd_ocsp::unauthorized();
                }
            }
        }

        let cacheable = targets.len() == 1
            && targets[0].1.hash_algorithm == HashAlgorithm::Sha1
            && (request.nonce.is_none() || self.signer.is_none());

        if cacheable {
            let (ca, query) = targets[0];
            match query.serial() {
                Some(serial) => {
                    if let Some(der) = self.from_cache(ca, serial, now.timestamp()).await {
                        return der;
                    }
                }
                None if self.signer.is_none() => return certd_ocsp::try_later(),
                None => {}
            }
        } else if self.signer.is_none() {
            // Only cached SHA-1 single responses can be served without a key
            return certd_ocsp::unauthorized();
        }

        let Some(signer) = &self.signer else {
            return certd_ocsp::try_later();
        };
        match self.sign_now(signer, &targets, request.nonce, cacheable, now).await {
            Ok(der) => der,
            Err(e) => {
                warn!(kind = e.kind().as_str(), "Synchronous OCSP signing failed: {}", e);
                certd_ocsp::try_later()
            }
        }
    }

    fn issuer_of<'a>(
        &self,
        cas: &'a [certificate_authority::Model],
        query: &StatusQuery,
    ) -> Option<&'a certificate_authority::Model> {
        cas.iter().find(|ca| {
            let hashes = match self.issuers.get(&ca.id) {
                Some(hashes) => hashes.clone(),
                None => match IssuerHashes::from_certificate_pem(&ca.cert_pem) {
                    Ok(hashes) => {
                        let hashes = Arc::new(hashes);
                        self.issuers.insert(ca.id.clone(), hashes.clone());
                        hashes
                    }
                    Err(e) => {
                        warn!(ca_id = %ca.id, "Unreadable CA certificate: {}", e);
                        return false;
                    }
                },
            };
            hashes.matches(
                query.hash_algorithm,
                query.issuer_name_hash(),
                query.issuer_key_hash(),
            )
        })
    }

    /// Serve from the cache, enqueueing a refresh for anything not fresh.
    async fn from_cache(
        &self,
        ca: &certificate_authority::Model,
        serial: i64,
        now: i64,
    ) -> Option<Vec<u8>> {
        let slot = match self.cache.get(&ca.id, serial).await {
            Ok(slot) => slot,
            Err(e) => {
                debug!("Cache read failed, treating as miss: {}", e);
                None
            }
        };

        if let Some(entry) = slot.as_ref().and_then(|slot| slot.entry()) {
            if is_servable(entry, now, self.config.staleness_window_secs, ca.key_generation) {
                if needs_refresh(entry, now, &self.config) {
                    self.request_refresh(ca, serial).await;
                }
                return Some(entry.der.clone());
            }
        }

        if self.signer.is_none() {
            self.request_refresh(ca, serial).await;
            return Some(certd_ocsp::try_later());
        }
        None
    }

    async fn request_refresh(&self, ca: &certificate_authority::Model, serial: i64) {
        let status_version = match self.store.get_certificate(&ca.id, serial).await {
            Ok(Some(cert)) => cert.status_version,
            Ok(None) => 0,
            Err(e) => {
                debug!("Cannot read status version for refresh: {}", e);
                return;
            }
        };
        let job = Job::RefreshOcsp {
            ca_id: ca.id.clone(),
            serial,
            status_version,
            key_generation: ca.key_generation,
        };
        if let Err(e) = self.queue.enqueue(&job).await {
            warn!(ca_id = %ca.id, serial, "Failed to enqueue OCSP refresh: {}", e);
        }
    }

    async fn sign_now(
        &self,
        signer: &OcspSigner,
        targets: &[(&certificate_authority::Model, &StatusQuery)],
        nonce: Option<Vec<u8>>,
        cacheable: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<u8>, IssuanceError> {
        let (ca, first) = targets[0];
        if targets.iter().any(|(other, _)| other.id != ca.id) {
            return Err(IssuanceError::Internal(
                "requests spanning several issuers are not supported".to_string(),
            ));
        }

        if cacheable && nonce.is_none() {
            if let Some(serial) = first.serial() {
                let entry = signer.sign_cacheable(ca, serial, now).await?;
                let der = entry.der.clone();
                if let Err(e) = self.cache.put(&ca.id, serial, entry).await {
                    debug!("Cache write failed: {}", e);
                }
                info!(ca_id = %ca.id, serial, "Signed OCSP response on demand");
                return Ok(der);
            }
        }

        let mut entries = Vec::with_capacity(targets.len());
        for (_, query) in targets {
            let status = match query.serial() {
                Some(serial) => signer.stored_status(&ca.id, serial).await?.status,
                None => SerialStatus::Unknown,
            };
            entries.push((query.cert_id.clone(), status));
        }
        let (der, _, _) = signer.sign(ca, entries, nonce, now).await?;
        Ok(der)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(this_update: i64, next_update: i64, generation: i32) -> CachedResponse {
        CachedResponse {
            der: vec![],
            status: "good".into(),
            this_update,
            next_update,
            status_version: 1,
            key_generation: generation,
        }
    }

    #[test]
    fn test_servability_window() {
        let e = entry(1_000, 2_000, 1);
        assert!(is_servable(&e, 1_000, 500, 1));
        assert!(is_servable(&e, 1_500, 500, 1));
        // Past the staleness window
        assert!(!is_servable(&e, 1_501, 500, 1));
        // thisUpdate in the future
        assert!(!is_servable(&e, 999, 500, 1));
        // At nextUpdate
        assert!(!is_servable(&e, 2_000, 5_000, 1));
        // Key rotated
        assert!(!is_servable(&e, 1_100, 500, 2));
    }

    #[test]
    fn test_refresh_margin() {
        let config = OcspConfig {
            validity_secs: 1_000,
            staleness_window_secs: 600,
            refresh_margin_secs: 100,
            ..OcspConfig::default()
        };
        let e = entry(0, 1_000, 1);
        assert!(!needs_refresh(&e, 400, &config));
        assert!(needs_refresh(&e, 500, &config));
    }
}
