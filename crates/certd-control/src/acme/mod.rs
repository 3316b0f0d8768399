//! ACME (RFC 8555) server core.
//!
//! HTTP framing lives in the gateway; this module authenticates JWS
//! requests, drives the order state machine and produces response bodies.

pub mod error;
pub mod jws;
pub mod nonce;
pub mod state;
pub mod store;

use std::sync::Arc;

use certd_cert::ParsedCsr;
use certd_db::entities::{
    acme_account::{self, AccountStatus},
    acme_authorization::{self, AuthorizationStatus},
    acme_challenge::{self, ChallengeStatus},
    acme_order::{self, OrderStatus},
    certificate::CertificateStatus,
    certificate_authority::{self, CaStatus},
    revocation::RevocationReason,
};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::cache::StatusCache;
use crate::config::CertdConfig;
use crate::jobs::Job;
use crate::queue::JobQueue;
use crate::secret::SharedSecret;
use crate::store::CaStore;

pub use error::{AcmeError, Problem};
pub use jws::{DecodedJws, Jwk};
pub use nonce::NonceManager;
pub use state::OrderMachine;
pub use store::{AcmeStore, NewOrder};

/// Response body variants
#[derive(Debug, Clone, PartialEq)]
pub enum AcmeBody {
    Json(Value),
    /// `application/pem-certificate-chain`
    PemChain(String),
    Empty,
}

/// A successful ACME response, minus the nonce header
#[derive(Debug, Clone, PartialEq)]
pub struct AcmeResponse {
    pub status: u16,
    pub location: Option<String>,
    /// `Link` header values
    pub links: Vec<String>,
    pub body: AcmeBody,
}

impl AcmeResponse {
    fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            location: None,
            links: Vec::new(),
            body: AcmeBody::Json(body),
        }
    }

    fn with_location(mut self, location: String) -> Self {
        self.location = Some(location);
        self
    }

    fn with_link(mut self, url: &str, rel: &str) -> Self {
        self.links.push(format!("<{}>;rel=\"{}\"", url, rel));
        self
    }
}

/// Which key reference a request must carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyMode {
    Jwk,
    Kid,
    Either,
}

struct Authenticated {
    jws: DecodedJws,
    key: Jwk,
    account: Option<acme_account::Model>,
}

impl Authenticated {
    fn account(&self) -> Result<&acme_account::Model, AcmeError> {
        self.account.as_ref().ok_or(AcmeError::AccountDoesNotExist)
    }
}

/// URL layout of one CA's ACME endpoints
struct Urls {
    prefix: String,
}

impl Urls {
    fn new(base: &str, ca: &certificate_authority::Model) -> Self {
        Self {
            prefix: format!("{}/acme/{}", base, ca.name),
        }
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    fn account(&self, id: &str) -> String {
        format!("{}/acct/{}", self.prefix, id)
    }

    fn order(&self, id: &str) -> String {
        format!("{}/order/{}", self.prefix, id)
    }

    fn authz(&self, id: &str) -> String {
        format!("{}/authz/{}", self.prefix, id)
    }

    fn challenge(&self, id: &str) -> String {
        format!("{}/chall/{}", self.prefix, id)
    }

    fn certificate(&self, id: &str) -> String {
        format!("{}/cert/{}", self.prefix, id)
    }
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn stored_problem(raw: &Option<String>) -> Option<Value> {
    raw.as_deref().and_then(|raw| serde_json::from_str(raw).ok())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewAccountPayload {
    #[serde(default)]
    contact: Vec<String>,
    #[serde(default)]
    terms_of_service_agreed: bool,
    #[serde(default)]
    only_return_existing: bool,
}

#[derive(Debug, Default, Deserialize)]
struct AccountUpdatePayload {
    contact: Option<Vec<String>>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Identifier {
    #[serde(rename = "type")]
    identifier_type: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct NewOrderPayload {
    identifiers: Vec<Identifier>,
}

#[derive(Debug, Deserialize)]
struct FinalizePayload {
    csr: String,
}

#[derive(Debug, Deserialize)]
struct RevokePayload {
    certificate: String,
    reason: Option<u8>,
}

pub struct AcmeService {
    store: CaStore,
    machine: OrderMachine,
    queue: Arc<dyn JobQueue>,
    nonces: NonceManager,
    config: Arc<CertdConfig>,
}

impl AcmeService {
    pub fn new(
        store: CaStore,
        acme: AcmeStore,
        queue: Arc<dyn JobQueue>,
        cache: Arc<dyn StatusCache>,
        secret: &SharedSecret,
        config: Arc<CertdConfig>,
    ) -> Self {
        Self {
            store,
            machine: OrderMachine::new(acme),
            queue,
            nonces: NonceManager::new(secret, config.acme.nonce_ttl_secs, cache),
            config,
        }
    }

    fn acme(&self) -> &AcmeStore {
        self.machine.store()
    }

    fn urls(&self, ca: &certificate_authority::Model) -> Urls {
        Urls::new(self.config.base_url(), ca)
    }

    pub fn new_nonce(&self) -> Result<String, AcmeError> {
        self.nonces.issue(Utc::now().timestamp())
    }

    /// Resolve the CA named in the URL, or the default CA.
    pub async fn resolve_ca(
        &self,
        name: Option<&str>,
    ) -> Result<certificate_authority::Model, AcmeError> {
        if !self.config.acme.enabled {
            return Err(AcmeError::NotFound("ACME is not enabled.".to_string()));
        }
        let now = Utc::now();
        let usable = |ca: &certificate_authority::Model| {
            ca.acme_enabled
                && ca.status == CaStatus::Active
                && ca.not_before <= now
                && now < ca.not_after
        };

        let explicit = name.or(self.config.acme.default_ca.as_deref());
        match explicit {
            Some(name) => {
                let ca = self.store.find_ca(name).await?;
                match ca {
                    Some(ca) if usable(&ca) => Ok(ca),
                    _ if name_is_default(name, &self.config) => Err(AcmeError::NotFound(
                        "No (usable) default CA configured.".to_string(),
                    )),
                    _ => Err(AcmeError::NotFound(format!("{}: CA not found.", name))),
                }
            }
            None => self
                .store
                .usable_cas(now)
                .await?
                .into_iter()
                .find(|ca| ca.acme_enabled)
                .ok_or_else(|| {
                    AcmeError::NotFound("No (usable) default CA configured.".to_string())
                }),
        }
    }

    pub fn directory(&self, ca: &certificate_authority::Model) -> Value {
        let urls = self.urls(ca);
        let mut meta = serde_json::Map::new();
        if let Some(tos) = &self.config.acme.terms_of_service {
            meta.insert("termsOfService".to_string(), json!(tos));
        }
        if let Some(website) = &self.config.acme.website {
            meta.insert("website".to_string(), json!(website));
        }
        json!({
            "newNonce": urls.endpoint("new-nonce"),
            "newAccount": urls.endpoint("new-account"),
            "newOrder": urls.endpoint("new-order"),
            "revokeCert": urls.endpoint("revoke-cert"),
            "meta": meta,
        })
    }

    async fn authenticate(
        &self,
        ca: &certificate_authority::Model,
        url: &str,
        body: &[u8],
        mode: KeyMode,
    ) -> Result<Authenticated, AcmeError> {
        let jws = DecodedJws::parse(body)?;
        if jws.header.url != url {
            return Err(AcmeError::Unauthorized(
                "The URL in the JWS header does not match the request URL.".to_string(),
            ));
        }
        let nonce = jws.header.nonce.as_deref().ok_or(AcmeError::BadNonce)?;
        self.nonces.consume(nonce, Utc::now().timestamp()).await?;

        let (key, account) = match (&jws.header.jwk, &jws.header.kid) {
            (Some(jwk), None) => {
                if mode == KeyMode::Kid {
                    return Err(AcmeError::Malformed(
                        "Request must identify the account with kid.".to_string(),
                    ));
                }
                let key = Jwk::from_value(jwk)?;
                let account = self.acme().account_by_thumbprint(&key.thumbprint()).await?;
                (key, account)
            }
            (None, Some(kid)) => {
                if mode == KeyMode::Jwk {
                    return Err(AcmeError::Malformed(
                        "Request must carry the account key as jwk.".to_string(),
                    ));
                }
                let prefix = self.urls(ca).account("");
                let id = kid.strip_prefix(&prefix).ok_or(AcmeError::AccountDoesNotExist)?;
                let account = self
                    .acme()
                    .account(id)
                    .await?
                    .ok_or(AcmeError::AccountDoesNotExist)?;
                let stored: Value = serde_json::from_str(&account.jwk)
                    .map_err(|e| AcmeError::ServerInternal(format!("stored JWK: {}", e)))?;
                (Jwk::from_value(&stored)?, Some(account))
            }
            _ => {
                return Err(AcmeError::Malformed(
                    "Exactly one of jwk and kid must be present".to_string(),
                ))
            }
        };

        jws.verify_with(&key)?;

        if let Some(account) = &account {
            if account.ca_id != ca.id {
                return Err(AcmeError::Unauthorized(
                    "Account is registered with a different CA.".to_string(),
                ));
            }
            if account.status != AccountStatus::Valid && jws.header.kid.is_some() {
                return Err(AcmeError::Unauthorized("Account is not valid.".to_string()));
            }
        }
        Ok(Authenticated { jws, key, account })
    }

    fn account_view(&self, urls: &Urls, account: &acme_account::Model) -> Value {
        let contact: Vec<String> = serde_json::from_str(&account.contact).unwrap_or_default();
        json!({
            "status": account.status,
            "contact": contact,
            "orders": format!("{}/orders", urls.account(&account.id)),
        })
    }

    pub async fn new_account(
        &self,
        ca: &certificate_authority::Model,
        url: &str,
        body: &[u8],
    ) -> Result<AcmeResponse, AcmeError> {
        let auth = self.authenticate(ca, url, body, KeyMode::Jwk).await?;
        let payload: NewAccountPayload = if auth.jws.is_post_as_get() {
            NewAccountPayload::default()
        } else {
            auth.jws.payload_json()?
        };
        let urls = self.urls(ca);

        if let Some(account) = &auth.account {
            return Ok(AcmeResponse::json(200, self.account_view(&urls, account))
                .with_location(urls.account(&account.id)));
        }
        if payload.only_return_existing {
            return Err(AcmeError::AccountDoesNotExist);
        }
        if self.config.acme.terms_of_service.is_some() && !payload.terms_of_service_agreed {
            return Err(AcmeError::Malformed(
                "Terms of service must be accepted.".to_string(),
            ));
        }
        validate_contacts(&payload.contact)?;

        let account = self
            .acme()
            .create_account(
                &ca.id,
                &auth.key.thumbprint(),
                &auth.key.to_value(),
                &payload.contact,
                Utc::now(),
            )
            .await?;
        info!(account_id = %account.id, ca = %ca.name, "ACME account created");

        Ok(AcmeResponse::json(201, self.account_view(&urls, &account))
            .with_location(urls.account(&account.id)))
    }

    /// POST to an account URL: fetch, update contacts, or deactivate.
    pub async fn account(
        &self,
        ca: &certificate_authority::Model,
        url: &str,
        body: &[u8],
        id: &str,
    ) -> Result<AcmeResponse, AcmeError> {
        let auth = self.authenticate(ca, url, body, KeyMode::Kid).await?;
        let account = auth.account()?.clone();
        if account.id != id {
            return Err(AcmeError::Unauthorized(
                "Request signed by a different account.".to_string(),
            ));
        }

        let account = if auth.jws.is_post_as_get() {
            account
        } else {
            let update: AccountUpdatePayload = auth.jws.payload_json()?;
            let status = match update.status.as_deref() {
                None => None,
                Some("deactivated") => Some(AccountStatus::Deactivated),
                Some(other) => {
                    return Err(AcmeError::Malformed(format!(
                        "Cannot change account status to {}.",
                        other
                    )))
                }
            };
            if let Some(contact) = &update.contact {
                validate_contacts(contact)?;
            }
            self.acme()
                .update_account(account, update.contact.as_deref(), status)
                .await?
        };

        let urls = self.urls(ca);
        Ok(AcmeResponse::json(200, self.account_view(&urls, &account)))
    }

    pub async fn new_order(
        &self,
        ca: &certificate_authority::Model,
        url: &str,
        body: &[u8],
    ) -> Result<AcmeResponse, AcmeError> {
        let auth = self.authenticate(ca, url, body, KeyMode::Kid).await?;
        let account = auth.account()?;
        let payload: NewOrderPayload = auth.jws.payload_json()?;

        if payload.identifiers.is_empty() {
            return Err(AcmeError::Malformed("Order has no identifiers.".to_string()));
        }
        let mut identifiers = Vec::with_capacity(payload.identifiers.len());
        for identifier in &payload.identifiers {
            if identifier.identifier_type != "dns" {
                return Err(AcmeError::RejectedIdentifier(format!(
                    "Unsupported identifier type {}.",
                    identifier.identifier_type
                )));
            }
            let value = identifier.value.trim().to_ascii_lowercase();
            self.config
                .policy
                .check_dns_name(&value)
                .map_err(|v| AcmeError::RejectedIdentifier(v.to_string()))?;
            if !identifiers.contains(&value) {
                identifiers.push(value);
            }
        }
        identifiers.sort();

        let now = Utc::now();
        let order = self
            .acme()
            .create_order(
                NewOrder {
                    account_id: account.id.clone(),
                    ca_id: ca.id.clone(),
                    identifiers,
                    expires_at: now + Duration::seconds(self.config.acme.order_lifetime_secs),
                    authorization_lifetime: Duration::seconds(
                        self.config.acme.authorization_lifetime_secs,
                    ),
                },
                now,
            )
            .await?;
        info!(order_id = %order.id, account_id = %account.id, "ACME order created");

        let urls = self.urls(ca);
        let view = self.order_view(&urls, &order).await?;
        Ok(AcmeResponse::json(201, view).with_location(urls.order(&order.id)))
    }

    async fn order_view(&self, urls: &Urls, order: &acme_order::Model) -> Result<Value, AcmeError> {
        let authorizations = self.acme().order_authorizations(&order.id).await?;
        let identifiers: Vec<Value> = order
            .identifier_list()
            .into_iter()
            .map(|value| json!({"type": "dns", "value": value}))
            .collect();

        let mut view = json!({
            "status": order.status,
            "expires": rfc3339(order.expires_at),
            "identifiers": identifiers,
            "authorizations": authorizations.iter().map(|a| urls.authz(&a.id)).collect::<Vec<_>>(),
            "finalize": format!("{}/finalize", urls.order(&order.id)),
        });
        if let Some(certificate_id) = &order.certificate_id {
            view["certificate"] = json!(urls.certificate(certificate_id));
        }
        if let Some(problem) = stored_problem(&order.error) {
            view["error"] = problem;
        }
        Ok(view)
    }

    async fn owned_order(
        &self,
        account: &acme_account::Model,
        id: &str,
    ) -> Result<acme_order::Model, AcmeError> {
        let order = self
            .acme()
            .order(id)
            .await?
            .ok_or_else(|| AcmeError::NotFound(format!("{}: Order not found.", id)))?;
        if order.account_id != account.id {
            return Err(AcmeError::Unauthorized(
                "Order belongs to a different account.".to_string(),
            ));
        }
        Ok(order)
    }

    pub async fn order(
        &self,
        ca: &certificate_authority::Model,
        url: &str,
        body: &[u8],
        id: &str,
    ) -> Result<AcmeResponse, AcmeError> {
        let auth = self.authenticate(ca, url, body, KeyMode::Kid).await?;
        let order = self.owned_order(auth.account()?, id).await?;
        let order = self.machine.reconcile_order(order, Utc::now()).await?;
        let urls = self.urls(ca);
        Ok(AcmeResponse::json(200, self.order_view(&urls, &order).await?))
    }

    /// Orders of an account, as URLs.
    pub async fn account_orders(
        &self,
        ca: &certificate_authority::Model,
        url: &str,
        body: &[u8],
        id: &str,
    ) -> Result<AcmeResponse, AcmeError> {
        let auth = self.authenticate(ca, url, body, KeyMode::Kid).await?;
        let account = auth.account()?;
        if account.id != id {
            return Err(AcmeError::Unauthorized(
                "Request signed by a different account.".to_string(),
            ));
        }
        let urls = self.urls(ca);
        let orders: Vec<String> = self
            .acme()
            .account_orders(&account.id)
            .await?
            .iter()
            .map(|o| urls.order(&o.id))
            .collect();
        Ok(AcmeResponse::json(200, json!({ "orders": orders })))
    }

    async fn authorization_view(
        &self,
        urls: &Urls,
        authz: &acme_authorization::Model,
    ) -> Result<Value, AcmeError> {
        let challenges = self.acme().authorization_challenges(&authz.id).await?;
        let challenges: Vec<Value> = challenges
            .iter()
            .map(|c| challenge_view(urls, c))
            .collect();
        let mut view = json!({
            "status": authz.status,
            "expires": rfc3339(authz.expires_at),
            "identifier": {"type": "dns", "value": authz.identifier},
            "challenges": challenges,
        });
        if authz.wildcard {
            view["wildcard"] = json!(true);
        }
        Ok(view)
    }

    /// Load an authorization the account owns, applying expiry first.
    async fn owned_authorization(
        &self,
        account: &acme_account::Model,
        id: &str,
    ) -> Result<(acme_authorization::Model, acme_order::Model), AcmeError> {
        let not_found = || AcmeError::NotFound(format!("{}: Authorization not found.", id));
        let authz = self.acme().authorization(id).await?.ok_or_else(not_found)?;
        let order = self.owned_order(account, &authz.order_id).await?;
        let order = self.machine.reconcile_order(order, Utc::now()).await?;
        let authz = self.acme().authorization(id).await?.ok_or_else(not_found)?;
        Ok((authz, order))
    }

    pub async fn authorization(
        &self,
        ca: &certificate_authority::Model,
        url: &str,
        body: &[u8],
        id: &str,
    ) -> Result<AcmeResponse, AcmeError> {
        let auth = self.authenticate(ca, url, body, KeyMode::Kid).await?;
        let (authz, _) = self.owned_authorization(auth.account()?, id).await?;
        let urls = self.urls(ca);
        Ok(AcmeResponse::json(200, self.authorization_view(&urls, &authz).await?))
    }

    /// POST-as-GET returns the challenge; a `{}` payload requests validation.
    pub async fn challenge(
        &self,
        ca: &certificate_authority::Model,
        url: &str,
        body: &[u8],
        id: &str,
    ) -> Result<AcmeResponse, AcmeError> {
        let auth = self.authenticate(ca, url, body, KeyMode::Kid).await?;
        let not_found = || AcmeError::NotFound(format!("{}: Challenge not found.", id));
        let challenge = self.acme().challenge(id).await?.ok_or_else(not_found)?;
        let (authz, _) = self
            .owned_authorization(auth.account()?, &challenge.authorization_id)
            .await?;

        if !auth.jws.is_post_as_get()
            && challenge.status == ChallengeStatus::Pending
            && authz.status == AuthorizationStatus::Pending
            && self.acme().start_validation(&challenge.id).await?
        {
            let job = Job::ValidateChallenge {
                challenge_id: challenge.id.clone(),
            };
            let enqueued = match self.queue.enqueue(&job).await {
                Ok(enqueued) => enqueued,
                Err(err) => {
                    // Back to pending so the client can ask again
                    if let Err(e) = self.acme().abandon_validation(&challenge.id).await {
                        warn!(challenge_id = %challenge.id, "Failed to reset challenge: {}", e);
                    }
                    return Err(err.into());
                }
            };
            debug!(challenge_id = %challenge.id, job_id = %enqueued.job_id, "Challenge validation requested");
        }

        let challenge = self.acme().challenge(id).await?.ok_or_else(not_found)?;
        let urls = self.urls(ca);
        Ok(AcmeResponse::json(200, challenge_view(&urls, &challenge))
            .with_link(&urls.authz(&authz.id), "up"))
    }

    pub async fn finalize(
        &self,
        ca: &certificate_authority::Model,
        url: &str,
        body: &[u8],
        id: &str,
    ) -> Result<AcmeResponse, AcmeError> {
        let auth = self.authenticate(ca, url, body, KeyMode::Kid).await?;
        let order = self.owned_order(auth.account()?, id).await?;
        let order = self.machine.reconcile_order(order, Utc::now()).await?;

        if order.status != OrderStatus::Ready {
            return Err(AcmeError::OrderNotReady(format!(
                "Order is not ready (status: {}).",
                serde_json::to_value(order.status)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default()
            )));
        }

        let payload: FinalizePayload = auth.jws.payload_json()?;
        let der = jws::b64(&payload.csr).map_err(|_| AcmeError::BadCsr("CSR is not base64url.".to_string()))?;
        let csr = ParsedCsr::from_der(der).map_err(|e| AcmeError::BadCsr(e.to_string()))?;

        let mut expected = order.identifier_list();
        expected.sort();
        if csr.requested_names() != expected {
            return Err(AcmeError::BadCsr(
                "CSR does not request exactly the identifiers of the order.".to_string(),
            ));
        }

        let csr_pem = csr.to_pem();
        if !self.acme().begin_processing(&order.id, &csr_pem).await? {
            return Err(AcmeError::OrderNotReady("Order is not ready.".to_string()));
        }
        let job = Job::Issue {
            ca_id: ca.id.clone(),
            csr_pem,
            profile: Default::default(),
            order_id: Some(order.id.clone()),
            request_id: format!("acme-order:{}", order.id),
        };
        if let Err(err) = self.queue.enqueue(&job).await {
            // Back to ready so the client can finalize again
            if let Err(e) = self.acme().abandon_processing(&order.id).await {
                warn!(order_id = %order.id, "Failed to reset order: {}", e);
            }
            return Err(err.into());
        }
        info!(order_id = %order.id, "Order finalized, issuance queued");

        let order = self
            .acme()
            .order(&order.id)
            .await?
            .ok_or_else(|| AcmeError::NotFound(format!("{}: Order not found.", id)))?;
        let urls = self.urls(ca);
        Ok(AcmeResponse::json(200, self.order_view(&urls, &order).await?)
            .with_location(urls.order(&order.id)))
    }

    pub async fn certificate(
        &self,
        ca: &certificate_authority::Model,
        url: &str,
        body: &[u8],
        id: &str,
    ) -> Result<AcmeResponse, AcmeError> {
        let auth = self.authenticate(ca, url, body, KeyMode::Kid).await?;
        let account = auth.account()?;
        let not_found = || AcmeError::NotFound(format!("{}: Certificate not found.", id));

        let cert = self
            .store
            .get_certificate_by_id(id)
            .await?
            .filter(|c| c.ca_id == ca.id)
            .ok_or_else(not_found)?;
        let order_id = cert.order_id.as_deref().ok_or_else(not_found)?;
        self.owned_order(account, order_id).await?;

        let mut chain = cert.cert_pem.trim_end().to_string();
        chain.push('\n');
        chain.push_str(ca.cert_pem.trim_end());
        chain.push('\n');
        Ok(AcmeResponse {
            status: 200,
            location: None,
            links: Vec::new(),
            body: AcmeBody::PemChain(chain),
        })
    }

    pub async fn revoke_cert(
        &self,
        ca: &certificate_authority::Model,
        url: &str,
        body: &[u8],
    ) -> Result<AcmeResponse, AcmeError> {
        let auth = self.authenticate(ca, url, body, KeyMode::Either).await?;
        let account = auth
            .account
            .as_ref()
            .ok_or_else(|| AcmeError::Unauthorized("Unknown account key.".to_string()))?;
        let payload: RevokePayload = auth.jws.payload_json()?;

        let reason = match payload.reason {
            None => RevocationReason::Unspecified,
            Some(code) => RevocationReason::from_code(code).ok_or_else(|| {
                AcmeError::BadRevocationReason(format!("Invalid revocation reason {}.", code))
            })?,
        };

        let der = jws::b64(&payload.certificate)?;
        let serial = certificate_serial(&der)?;
        let not_found = || AcmeError::NotFound("Certificate not found.".to_string());
        let cert = self
            .store
            .get_certificate(&ca.id, serial)
            .await?
            .ok_or_else(not_found)?;
        let stored = certd_ocsp::pem_to_der(&cert.cert_pem)
            .map_err(|e| AcmeError::ServerInternal(e.to_string()))?;
        if stored != der {
            return Err(not_found());
        }

        let owner = match cert.order_id.as_deref() {
            Some(order_id) => self.acme().order(order_id).await?.map(|o| o.account_id),
            None => None,
        };
        if owner.as_deref() != Some(account.id.as_str()) {
            return Err(AcmeError::Unauthorized(
                "Account is not authorized to revoke this certificate.".to_string(),
            ));
        }
        match cert.status {
            CertificateStatus::Valid => {}
            CertificateStatus::Revoked => {
                return Err(AcmeError::AlreadyRevoked(format!(
                    "{}: Certificate is already revoked.",
                    certd_cert::format_serial(serial)
                )))
            }
            CertificateStatus::Expired => {
                return Err(AcmeError::Malformed(format!(
                    "{}: Certificate has expired.",
                    certd_cert::format_serial(serial)
                )))
            }
        }

        self.queue
            .enqueue(&Job::Revoke {
                ca_id: ca.id.clone(),
                serial,
                reason,
            })
            .await?;
        info!(ca = %ca.name, serial, reason = ?reason, "ACME revocation queued");

        Ok(AcmeResponse {
            status: 200,
            location: None,
            links: Vec::new(),
            body: AcmeBody::Empty,
        })
    }
}

fn name_is_default(name: &str, config: &CertdConfig) -> bool {
    config.acme.default_ca.as_deref() == Some(name)
}

fn challenge_view(urls: &Urls, challenge: &acme_challenge::Model) -> Value {
    let mut view = json!({
        "type": challenge.challenge_type.as_str(),
        "url": urls.challenge(&challenge.id),
        "status": challenge.status,
        "token": challenge.token,
    });
    if let Some(validated) = challenge.validated_at {
        view["validated"] = json!(rfc3339(validated));
    }
    if let Some(problem) = stored_problem(&challenge.error) {
        view["error"] = problem;
    }
    view
}

fn validate_contacts(contacts: &[String]) -> Result<(), AcmeError> {
    for contact in contacts {
        let Some(address) = contact.strip_prefix("mailto:") else {
            return Err(AcmeError::Malformed(format!(
                "Unsupported contact URI {}.",
                contact
            )));
        };
        if !address.contains('@') {
            return Err(AcmeError::Malformed(format!(
                "Invalid email address {}.",
                address
            )));
        }
    }
    Ok(())
}

fn certificate_serial(der: &[u8]) -> Result<i64, AcmeError> {
    use x509_parser::prelude::{FromDer, X509Certificate};
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| AcmeError::Malformed(format!("Invalid certificate: {}", e)))?;
    certd_ocsp::serial_from_bytes(cert.raw_serial())
        .ok_or_else(|| AcmeError::NotFound("Certificate not found.".to_string()))
}
