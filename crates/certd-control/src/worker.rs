//! Issuance Worker: claims jobs from the queue and runs them.
//!
//! Every signing path acquires the CA's cross-process lease row first and
//! the in-process key lease second, and only then opens a store
//! transaction. A worker that loses access to its keys stops claiming
//! signing work and reports unhealthy; non-signing work keeps flowing.
//! Revocation lists are signed the same way, with the CA key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use certd_cert::{
    issue_leaf, ApprovedProfile, CaWindow, KeyStore, ParsedCsr, PolicyViolation, ProfileRequest,
};
use certd_db::entities::{
    certificate,
    certificate_authority::{self, CaStatus},
    crl,
    revocation::{self, RevocationReason},
};
use certd_ocsp::{CrlBuilder, CrlIssuer, CrlScope, RevokedEntry};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::acme::OrderMachine;
use crate::cache::StatusCache;
use crate::config::CertdConfig;
use crate::error::{ErrorKind, IssuanceError};
use crate::jobs::Job;
use crate::ocsp::{is_servable, needs_refresh, OcspSigner};
use crate::queue::{ClaimedJob, FailOutcome, JobQueue, QueueError};
use crate::readiness::WorkerHealth;
use crate::store::CaStore;
use crate::validator::ChallengeValidator;

const ALL_KINDS: &[&str] = &[
    Job::ISSUE,
    Job::REVOKE,
    Job::REFRESH_OCSP,
    Job::PUBLISH_CRL,
    Job::REFRESH_ALL,
    Job::EXPIRY_SWEEP,
    Job::VALIDATE_CHALLENGE,
];

const UNSIGNED_KINDS: &[&str] = &[Job::REFRESH_ALL, Job::EXPIRY_SWEEP, Job::VALIDATE_CHALLENGE];

pub struct IssuanceWorker {
    id: String,
    store: CaStore,
    queue: Arc<dyn JobQueue>,
    cache: Arc<dyn StatusCache>,
    keys: Arc<dyn KeyStore>,
    signer: OcspSigner,
    orders: OrderMachine,
    validator: Arc<dyn ChallengeValidator>,
    config: Arc<CertdConfig>,
    health: WorkerHealth,
}

impl IssuanceWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: CaStore,
        queue: Arc<dyn JobQueue>,
        cache: Arc<dyn StatusCache>,
        keys: Arc<dyn KeyStore>,
        orders: OrderMachine,
        validator: Arc<dyn ChallengeValidator>,
        config: Arc<CertdConfig>,
        health: WorkerHealth,
    ) -> Self {
        let signer = OcspSigner::new(store.clone(), keys.clone(), &config.ocsp);
        Self {
            id: format!("worker-{}", uuid::Uuid::new_v4()),
            store,
            queue,
            cache,
            keys,
            signer,
            orders,
            validator,
            config,
            health,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn health(&self) -> &WorkerHealth {
        &self.health
    }

    fn claimable_kinds(&self) -> &'static [&'static str] {
        if self.health.is_healthy() {
            ALL_KINDS
        } else {
            UNSIGNED_KINDS
        }
    }

    /// Run until `shutdown` fires, then wait for in-flight jobs.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let concurrency = self.config.worker.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let poll = self.config.worker.poll_interval();

        info!(worker_id = %self.id, concurrency, "Issuance worker started");
        let scheduler = tokio::spawn(self.clone().schedule(shutdown.clone()));

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self
                .queue
                .claim(self.claimable_kinds(), self.config.worker.job_lease(), &self.id)
                .await
            {
                Ok(Some(claimed)) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.execute(claimed).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!("Job claim failed: {}", e),
            }
            drop(permit);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }
        }

        info!(worker_id = %self.id, "Draining in-flight jobs");
        let _ = semaphore.acquire_many(concurrency as u32).await;
        let _ = scheduler.await;
        info!(worker_id = %self.id, "Issuance worker stopped");
    }

    /// Claim and run one job inline. Returns false when nothing was claimable.
    pub async fn process_next(&self) -> Result<bool, QueueError> {
        match self
            .queue
            .claim(self.claimable_kinds(), self.config.worker.job_lease(), &self.id)
            .await?
        {
            Some(claimed) => {
                self.execute(claimed).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run jobs until the queue has nothing claimable left.
    pub async fn drain(&self) -> Result<usize, QueueError> {
        let mut processed = 0;
        while self.process_next().await? {
            processed += 1;
        }
        Ok(processed)
    }

    async fn schedule(self: Arc<Self>, shutdown: CancellationToken) {
        let refresh_secs = self.config.worker.ocsp_refresh_interval_secs.max(1);
        let sweep_secs = self.config.worker.expiry_sweep_interval_secs.max(1);

        let mut refresh = tokio::time::interval(Duration::from_secs(refresh_secs));
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut sweep = tokio::time::interval(Duration::from_secs(sweep_secs));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = refresh.tick() => {
                    let bucket = Utc::now().timestamp() / refresh_secs as i64;
                    self.enqueue_periodic(Job::RefreshAll { bucket }).await;
                }
                _ = sweep.tick() => {
                    let bucket = Utc::now().timestamp() / sweep_secs as i64;
                    self.enqueue_periodic(Job::ExpirySweep { bucket }).await;
                }
            }
        }
    }

    async fn enqueue_periodic(&self, job: Job) {
        match self.queue.enqueue(&job).await {
            Ok(enqueued) if enqueued.created => {
                debug!(job_id = %enqueued.job_id, kind = job.kind(), "Periodic job enqueued")
            }
            Ok(_) => {}
            Err(e) => warn!(kind = job.kind(), "Failed to enqueue periodic job: {}", e),
        }
    }

    async fn execute(&self, claimed: ClaimedJob) {
        let span = info_span!(
            "job",
            job_id = %claimed.id,
            kind = claimed.job.kind(),
            attempt = claimed.attempts
        );
        self.execute_inner(claimed).instrument(span).await
    }

    async fn execute_inner(&self, claimed: ClaimedJob) {
        match self.handle(&claimed).await {
            Ok(result) => {
                if let Err(e) = self.queue.complete(&claimed, result).await {
                    error!("Failed to acknowledge job: {}", e);
                }
            }
            Err(err) if err.kind() == ErrorKind::KeyUnavailable => {
                // Hand the job to a worker that still holds the key
                self.health.mark_unhealthy(&err.to_string());
                if let Err(e) = self.queue.release(&claimed, &err).await {
                    error!("Failed to release job ({}): {}", err, e);
                }
            }
            Err(err) => {
                match self.queue.fail(&claimed, &err).await {
                    Ok(FailOutcome::Retrying { available_at }) => {
                        warn!(kind = err.kind().as_str(), %available_at, "Job failed, will retry: {}", err)
                    }
                    Ok(FailOutcome::Failed) => {
                        warn!(kind = err.kind().as_str(), "Job failed: {}", err)
                    }
                    Ok(FailOutcome::Dead) => {
                        error!(kind = err.kind().as_str(), "Job dead-lettered: {}", err)
                    }
                    Err(e) => error!("Failed to record job failure ({}): {}", err, e),
                }
            }
        }
    }

    async fn handle(&self, claimed: &ClaimedJob) -> Result<Value, IssuanceError> {
        let now = Utc::now();
        if let Some(subject) = &claimed.subject {
            if self.queue.is_superseded(subject, claimed.version).await? {
                debug!(subject, "Job superseded by a newer one");
                return Ok(json!({ "skipped": "superseded" }));
            }
        }
        match &claimed.job {
            Job::Issue {
                ca_id,
                csr_pem,
                profile,
                order_id,
                request_id,
            } => {
                self.issue(ca_id, csr_pem, profile, order_id.as_deref(), request_id, now)
                    .await
            }
            Job::Revoke {
                ca_id,
                serial,
                reason,
            } => self.revoke(ca_id, *serial, *reason, now).await,
            Job::RefreshOcsp {
                ca_id,
                serial,
                status_version,
                key_generation,
            } => {
                self.refresh(ca_id, *serial, *status_version, *key_generation, now)
                    .await
            }
            Job::PublishCrl { ca_id, .. } => self.publish_crl(ca_id, now).await,
            Job::RefreshAll { .. } => self.refresh_all(now).await,
            Job::ExpirySweep { .. } => self.expiry_sweep(now).await,
            Job::ValidateChallenge { challenge_id } => {
                self.orders
                    .validate_challenge(challenge_id, self.validator.as_ref(), now)
                    .await?;
                Ok(json!({ "challenge_id": challenge_id }))
            }
        }
    }

    async fn issue(
        &self,
        ca_id: &str,
        csr_pem: &str,
        profile: &ProfileRequest,
        order_id: Option<&str>,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Value, IssuanceError> {
        if let Some(existing) = self.store.find_by_idempotency_key(request_id).await? {
            debug!(request_id, serial = existing.serial, "Issue replayed");
            if let Some(order_id) = order_id {
                self.orders.order_issued(order_id, &existing.id).await?;
            }
            return Ok(issued_result(ca_id, &existing.id, existing.serial));
        }

        if let Some(order_id) = order_id {
            if !self.orders.all_authorizations_valid(order_id).await? {
                let detail = "Order has authorizations that are not valid.";
                self.orders.order_rejected(order_id, detail).await?;
                return Err(IssuanceError::PolicyViolation(PolicyViolation::BadCsr(
                    detail.to_string(),
                )));
            }
        }

        let result = self.sign_and_store(ca_id, csr_pem, profile, order_id, request_id, now).await;
        match result {
            Ok((cert_id, serial)) => {
                if let Some(order_id) = order_id {
                    self.orders.order_issued(order_id, &cert_id).await?;
                }
                Ok(issued_result(ca_id, &cert_id, serial))
            }
            Err(IssuanceError::PolicyViolation(violation)) => {
                if let Some(order_id) = order_id {
                    self.orders.order_rejected(order_id, &violation.to_string()).await?;
                }
                Err(IssuanceError::PolicyViolation(violation))
            }
            Err(e) => Err(e),
        }
    }

    async fn sign_and_store(
        &self,
        ca_id: &str,
        csr_pem: &str,
        profile: &ProfileRequest,
        order_id: Option<&str>,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(String, i64), IssuanceError> {
        let ca = self.store.get_ca(ca_id).await?;
        let csr = ParsedCsr::parse(csr_pem.as_bytes())?;
        let approved = self.config.policy.evaluate(
            &CaWindow {
                active: ca.status == CaStatus::Active,
                not_before: ca.not_before,
                not_after: ca.not_after,
            },
            csr.common_name.as_deref(),
            &csr.dns_names,
            profile,
            now,
        )?;

        if !self
            .store
            .acquire_ca_lease(&ca.id, &self.id, self.config.worker.ca_lease())
            .await?
        {
            return Err(IssuanceError::TransientDependency(format!(
                "{}: CA lease is held by another worker",
                ca.name
            )));
        }

        let result = self
            .sign_under_lease(&ca, &csr, &approved, order_id, request_id)
            .await;

        if let Err(e) = self.store.release_ca_lease(&ca.id, &self.id).await {
            warn!(ca_id = %ca.id, "Failed to release CA lease: {}", e);
        }
        let (cert, created) = result?;

        if created {
            info!(ca_id = %ca.id, serial = cert.serial, request_id, "Certificate issued");
            self.publish_change(&ca, cert.serial, cert.status_version).await;
        }
        Ok((cert.id, cert.serial))
    }

    async fn sign_under_lease(
        &self,
        ca: &certificate_authority::Model,
        csr: &ParsedCsr,
        approved: &ApprovedProfile,
        order_id: Option<&str>,
        request_id: &str,
    ) -> Result<(certificate::Model, bool), IssuanceError> {
        let lease = self.keys.acquire(&ca.key_ref).await?;
        let ocsp_url = self.ocsp_url();
        self.store
            .issue(&ca.id, request_id, order_id, |serial| {
                Ok(issue_leaf(
                    &lease,
                    &ca.cert_pem,
                    csr,
                    approved,
                    serial,
                    Some(ocsp_url.as_str()),
                )?)
            })
            .await
    }

    fn ocsp_url(&self) -> String {
        match &self.config.ocsp.base_url {
            Some(url) => url.clone(),
            None => format!("{}/ocsp", self.config.base_url()),
        }
    }

    /// Tombstone the cached response of a changed serial and schedule a re-sign.
    async fn publish_change(
        &self,
        ca: &certificate_authority::Model,
        serial: i64,
        status_version: i64,
    ) {
        if let Err(e) = self
            .cache
            .invalidate(&ca.id, serial, status_version, ca.key_generation)
            .await
        {
            warn!(ca_id = %ca.id, serial, "Cache invalidation failed: {}", e);
        }
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

    async fn revoke(
        &self,
        ca_id: &str,
        serial: i64,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<Value, IssuanceError> {
        let record = match self.store.revoke(ca_id, serial, reason, now).await {
            Ok(record) => record,
            Err(IssuanceError::AlreadyRevoked(_)) => {
                debug!(ca_id, serial, "Revocation replayed");
                self.store.serial_record(ca_id, serial).await?.ok_or_else(|| {
                    IssuanceError::DataConsistency("revoked certificate vanished".to_string())
                })?
            }
            Err(e) => return Err(e),
        };

        let ca = self.store.get_ca(ca_id).await?;
        let version = record.certificate.status_version;
        if let Err(e) = self
            .cache
            .invalidate(ca_id, serial, version, ca.key_generation)
            .await
        {
            warn!(ca_id, serial, "Cache invalidation failed: {}", e);
        }

        // The revoked response is published before the job is acknowledged.
        let entry = self.signer.sign_cacheable(&ca, serial, now).await?;
        self.cache.put(ca_id, serial, entry).await?;
        self.request_crl(ca_id, now).await;

        let revoked_at = record
            .revocation
            .as_ref()
            .map(|r| r.revoked_at)
            .unwrap_or(now);
        Ok(json!({
            "ca_id": ca_id,
            "serial": certd_cert::format_serial(serial),
            "revoked_at": revoked_at,
            "status_version": version,
        }))
    }

    async fn refresh(
        &self,
        ca_id: &str,
        serial: i64,
        status_version: i64,
        key_generation: i32,
        now: DateTime<Utc>,
    ) -> Result<Value, IssuanceError> {
        let ca = self.store.get_ca(ca_id).await?;
        if ca.key_generation > key_generation {
            debug!(ca_id, serial, "Refresh for a retired responder key");
            return Ok(json!({ "skipped": "key_generation" }));
        }

        let stored = self.signer.stored_status(ca_id, serial).await?;
        if stored.status_version > status_version {
            debug!(ca_id, serial, "Refresh for an outdated status");
            return Ok(json!({ "skipped": "status_version" }));
        }

        let entry = self.signer.sign_known(&ca, serial, stored, now).await?;
        let status = entry.status.clone();
        let stored_entry = self.cache.put(ca_id, serial, entry).await?;
        Ok(json!({
            "ca_id": ca_id,
            "serial": certd_cert::format_serial(serial),
            "status": status,
            "cached": stored_entry,
        }))
    }

    async fn refresh_all(&self, now: DateTime<Utc>) -> Result<Value, IssuanceError> {
        let cas: HashMap<String, certificate_authority::Model> = self
            .store
            .list_cas()
            .await?
            .into_iter()
            .filter(|ca| ca.status == CaStatus::Active)
            .map(|ca| (ca.id.clone(), ca))
            .collect();

        let mut enqueued = 0usize;
        for cert in self.store.live_certificates(now).await? {
            let Some(ca) = cas.get(&cert.ca_id) else {
                continue;
            };
            if self.is_fresh(ca, cert.serial, now.timestamp()).await {
                continue;
            }
            let job = Job::RefreshOcsp {
                ca_id: ca.id.clone(),
                serial: cert.serial,
                status_version: cert.status_version,
                key_generation: ca.key_generation,
            };
            if self.queue.enqueue(&job).await?.created {
                enqueued += 1;
            }
        }

        let mut crls = 0usize;
        for ca in cas.values() {
            if self.crl_is_fresh(ca, now).await? {
                continue;
            }
            let job = Job::PublishCrl {
                ca_id: ca.id.clone(),
                bucket: now.timestamp_millis(),
            };
            if self.queue.enqueue(&job).await?.created {
                crls += 1;
            }
        }

        info!(enqueued, crls, "OCSP and CRL refresh pass scheduled");
        Ok(json!({ "enqueued": enqueued, "crls": crls }))
    }

    /// Every scope is published and not within the refresh margin.
    async fn crl_is_fresh(
        &self,
        ca: &certificate_authority::Model,
        now: DateTime<Utc>,
    ) -> Result<bool, IssuanceError> {
        let margin = chrono::Duration::seconds(self.config.crl.refresh_margin_secs);
        for scope in CrlScope::ALL {
            match self.store.get_crl(&ca.id, scope.as_str()).await? {
                Some(list) if now < list.next_update - margin => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn request_crl(&self, ca_id: &str, now: DateTime<Utc>) {
        let job = Job::PublishCrl {
            ca_id: ca_id.to_string(),
            bucket: now.timestamp_millis(),
        };
        if let Err(e) = self.queue.enqueue(&job).await {
            warn!(ca_id, "Failed to enqueue CRL publication: {}", e);
        }
    }

    async fn publish_crl(&self, ca_id: &str, now: DateTime<Utc>) -> Result<Value, IssuanceError> {
        let ca = self.store.get_ca(ca_id).await?;
        if !self
            .store
            .acquire_ca_lease(&ca.id, &self.id, self.config.worker.ca_lease())
            .await?
        {
            return Err(IssuanceError::TransientDependency(format!(
                "{}: CA lease is held by another worker",
                ca.name
            )));
        }

        let result = self.sign_crls(&ca, now).await;

        if let Err(e) = self.store.release_ca_lease(&ca.id, &self.id).await {
            warn!(ca_id = %ca.id, "Failed to release CA lease: {}", e);
        }
        let published = result?;

        info!(ca_id = %ca.id, lists = published.len(), "Revocation lists published");
        Ok(json!({
            "ca_id": ca.id,
            "lists": published
                .iter()
                .map(|list| json!({
                    "scope": list.scope,
                    "number": list.number,
                    "entries": list.entries,
                    "next_update": list.next_update,
                }))
                .collect::<Vec<_>>(),
        }))
    }

    async fn sign_crls(
        &self,
        ca: &certificate_authority::Model,
        now: DateTime<Utc>,
    ) -> Result<Vec<crl::Model>, IssuanceError> {
        let revocations = self.store.crl_revocations(&ca.id, now).await?;
        let issuer = CrlIssuer::from_certificate_pem(&ca.cert_pem)?;
        let next_update = now + chrono::Duration::seconds(self.config.crl.validity_secs);
        let lease = self.keys.acquire(&ca.key_ref).await?;

        let mut published = Vec::with_capacity(CrlScope::ALL.len());
        for scope in CrlScope::ALL {
            // Issued certificates are end-entity; the CA-only list stays empty
            let listed: &[revocation::Model] = match scope {
                CrlScope::Ca => &[],
                CrlScope::Full | CrlScope::User => &revocations,
            };

            let previous = self.store.get_crl(&ca.id, scope.as_str()).await?;
            let number = previous.as_ref().map_or(1, |list| list.number + 1);
            let mut builder = CrlBuilder::new(
                issuer.clone(),
                scope,
                number,
                now.timestamp(),
                next_update.timestamp(),
            )?;
            for revoked in listed {
                builder = builder.add_revoked(RevokedEntry {
                    serial: revoked.serial,
                    revoked_at: revoked.revoked_at.timestamp(),
                    reason: Some(revoked.reason.code()),
                })?;
            }

            let list = crl::Model {
                id: crl::Model::key(&ca.id, scope.as_str()),
                ca_id: ca.id.clone(),
                scope: scope.as_str().to_string(),
                number,
                der: builder.sign(&lease)?,
                entries: listed.len() as i32,
                this_update: now,
                next_update,
            };
            if !self
                .store
                .publish_crl(list.clone(), previous.map(|list| list.number))
                .await?
            {
                return Err(IssuanceError::DataConsistency(format!(
                    "{}: {} CRL was replaced during publication",
                    ca.name,
                    scope.as_str()
                )));
            }
            published.push(list);
        }
        Ok(published)
    }

    async fn is_fresh(&self, ca: &certificate_authority::Model, serial: i64, now: i64) -> bool {
        match self.cache.get(&ca.id, serial).await {
            Ok(Some(slot)) => slot.entry().is_some_and(|entry| {
                is_servable(
                    entry,
                    now,
                    self.config.ocsp.staleness_window_secs,
                    ca.key_generation,
                ) && !needs_refresh(entry, now, &self.config.ocsp)
            }),
            _ => false,
        }
    }

    async fn expiry_sweep(&self, now: DateTime<Utc>) -> Result<Value, IssuanceError> {
        let expired = self.store.expire_due(now).await?;
        for cert in &expired {
            let ca = self.store.get_ca(&cert.ca_id).await?;
            self.publish_change(&ca, cert.serial, cert.status_version).await;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Certificates expired");
        }
        Ok(json!({ "expired": expired.len() }))
    }
}

fn issued_result(ca_id: &str, certificate_id: &str, serial: i64) -> Value {
    json!({
        "ca_id": ca_id,
        "certificate_id": certificate_id,
        "serial": certd_cert::format_serial(serial),
    })
}
