//! Integration tests of the Gateway routes
//!
//! The router is driven with `oneshot`; an in-process Issuance Worker drains
//! the queue between steps the way the Worker process would.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, Method, Request, StatusCode},
    Router,
};
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use certd_api::{middleware::issue_token, models::*, ApiServer, ApiServerConfig, AppState};
use certd_cert::{KeyStore, MemoryKeyStore};
use certd_control::{
    init_ca, AcmeStore, CaStore, CertdConfig, ChallengeRequest, ChallengeValidator, ClaimedJob,
    DbJobQueue, Enqueued, FailOutcome, InitCa, IssuanceError, IssuanceWorker, Job, JobQueue,
    MemoryStatusCache, OrderMachine, QueueError, RetryPolicy, SharedSecret, ValidationError,
    WorkerHealth,
};
use certd_db::entities::{certificate_authority, job};
use certd_ocsp::{CrlScope, DecodedCrl, DecodedResponse, HashAlgorithm, IssuerHashes, SerialStatus};
use chrono::Utc;
use rcgen::{CertificateParams, DistinguishedName, DnType};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use serde_json::{json, Value};
use tower::ServiceExt; // For `oneshot` method

const BASE: &str = "https://ca.example.com";

struct AcceptAll;

#[async_trait]
impl ChallengeValidator for AcceptAll {
    async fn validate(&self, _request: &ChallengeRequest) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Queue whose enqueue can be made to fail on demand
struct FaultyQueue {
    inner: Arc<DbJobQueue>,
    fail_enqueue: Arc<AtomicBool>,
}

#[async_trait]
impl JobQueue for FaultyQueue {
    async fn enqueue(&self, job: &Job) -> Result<Enqueued, QueueError> {
        if self.fail_enqueue.load(Ordering::SeqCst) {
            return Err(QueueError::Database(sea_orm::DbErr::Custom(
                "queue unavailable".to_string(),
            )));
        }
        self.inner.enqueue(job).await
    }

    async fn claim(
        &self,
        kinds: &[&str],
        lease: Duration,
        owner: &str,
    ) -> Result<Option<ClaimedJob>, QueueError> {
        self.inner.claim(kinds, lease, owner).await
    }

    async fn complete(&self, claimed: &ClaimedJob, result: Value) -> Result<(), QueueError> {
        self.inner.complete(claimed, result).await
    }

    async fn fail(
        &self,
        claimed: &ClaimedJob,
        error: &IssuanceError,
    ) -> Result<FailOutcome, QueueError> {
        self.inner.fail(claimed, error).await
    }

    async fn release(&self, claimed: &ClaimedJob, error: &IssuanceError) -> Result<(), QueueError> {
        self.inner.release(claimed, error).await
    }

    async fn is_superseded(&self, subject: &str, version: i64) -> Result<bool, QueueError> {
        self.inner.is_superseded(subject, version).await
    }

    async fn get(&self, job_id: &str) -> Result<Option<job::Model>, QueueError> {
        self.inner.get(job_id).await
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.inner.ping().await
    }
}

struct TestGateway {
    app: Router,
    worker: IssuanceWorker,
    store: CaStore,
    ca: certificate_authority::Model,
    jwt_secret: Vec<u8>,
    /// Makes every Gateway enqueue fail while set
    enqueue_fault: Arc<AtomicBool>,
}

impl TestGateway {
    async fn new() -> Self {
        let db = certd_db::connect("sqlite::memory:")
            .await
            .expect("Failed to connect to in-memory database");
        certd_db::migrate(&db).await.expect("Failed to run migrations");

        let mut config = CertdConfig::default();
        config.external_url = BASE.to_string();
        let config = Arc::new(config);

        let store = CaStore::new(db.clone());
        let keys = Arc::new(MemoryKeyStore::new());
        let key_store: Arc<dyn KeyStore> = keys.clone();
        let ca = init_ca(
            &store,
            &key_store,
            &config.ocsp,
            InitCa {
                name: "test-ca".to_string(),
                common_name: "Test Root CA".to_string(),
                organization: None,
                validity_days: 3650,
                acme_enabled: true,
            },
            Utc::now(),
        )
        .await
        .expect("Failed to create CA");

        let cache = Arc::new(MemoryStatusCache::new());
        let queue = Arc::new(DbJobQueue::new(
            db.clone(),
            RetryPolicy {
                max_attempts: 3,
                base: Duration::from_millis(1),
                max: Duration::from_millis(5),
            },
        ));
        let secret = SharedSecret::from_bytes(b"test-shared-secret");
        let enqueue_fault = Arc::new(AtomicBool::new(false));
        let gateway_queue = Arc::new(FaultyQueue {
            inner: queue.clone(),
            fail_enqueue: enqueue_fault.clone(),
        });

        let state = AppState::new(
            db.clone(),
            cache.clone(),
            gateway_queue,
            None,
            &secret,
            config.clone(),
        );
        let server = ApiServer::new(
            ApiServerConfig {
                bind_addr: "127.0.0.1:0".parse().unwrap(),
                enable_cors: true,
                jwt_secret: secret.jwt_secret(),
            },
            state,
        );

        let worker = IssuanceWorker::new(
            store.clone(),
            queue,
            cache,
            keys,
            OrderMachine::new(AcmeStore::new(db)),
            Arc::new(AcceptAll),
            config,
            WorkerHealth::new(),
        );

        Self {
            app: server.build_router(),
            worker,
            store,
            ca,
            jwt_secret: secret.jwt_secret(),
            enqueue_fault,
        }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, body.to_vec())
    }

    fn token(&self) -> String {
        issue_token(&self.jwt_secret, "ops", chrono::Duration::hours(1)).unwrap()
    }

    async fn get_json(&self, uri: &str) -> (StatusCode, Value) {
        let (status, _, body) = self
            .send(
                Request::builder()
                    .uri(uri)
                    .header("Authorization", format!("Bearer {}", self.token()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        let (status, _, body) = self
            .send(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("Authorization", format!("Bearer {}", self.token()))
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await;
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn ocsp_post(&self, serial: i64) -> (StatusCode, HeaderMap, Vec<u8>) {
        let issuer = IssuerHashes::from_certificate_pem(&self.ca.cert_pem).unwrap();
        let request = certd_ocsp::encode_request(&issuer, HashAlgorithm::Sha1, serial, None).unwrap();
        self.send(
            Request::builder()
                .method("POST")
                .uri("/ocsp")
                .header("content-type", "application/ocsp-request")
                .body(Body::from(request))
                .unwrap(),
        )
        .await
    }
}

/// ACME client holding an ES256 account key
struct AcmeClient {
    key: EcdsaKeyPair,
    jwk: Value,
    kid: Option<String>,
    nonce: String,
}

impl AcmeClient {
    fn new() -> Self {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng).unwrap();
        let key =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng).unwrap();
        let public = key.public_key().as_ref().to_vec();
        let jwk = json!({
            "kty": "EC",
            "crv": "P-256",
            "x": URL_SAFE_NO_PAD.encode(&public[1..33]),
            "y": URL_SAFE_NO_PAD.encode(&public[33..65]),
        });
        Self {
            key,
            jwk,
            kid: None,
            nonce: String::new(),
        }
    }

    async fn fetch_nonce(&mut self, gw: &TestGateway) {
        let (status, headers, _) = gw
            .send(
                Request::builder()
                    .method(Method::HEAD)
                    .uri("/acme/test-ca/new-nonce")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        self.nonce = headers["replay-nonce"].to_str().unwrap().to_string();
    }

    fn sign(&self, url: &str, payload: &str) -> Vec<u8> {
        let mut protected = json!({"alg": "ES256", "nonce": self.nonce, "url": url});
        match &self.kid {
            Some(kid) => protected["kid"] = json!(kid),
            None => protected["jwk"] = self.jwk.clone(),
        }
        let protected = URL_SAFE_NO_PAD.encode(protected.to_string());
        let payload = URL_SAFE_NO_PAD.encode(payload);
        let signature = self
            .key
            .sign(
                &SystemRandom::new(),
                format!("{}.{}", protected, payload).as_bytes(),
            )
            .unwrap();
        json!({
            "protected": protected,
            "payload": payload,
            "signature": URL_SAFE_NO_PAD.encode(signature.as_ref()),
        })
        .to_string()
        .into_bytes()
    }

    /// POST a signed request; an empty payload is a POST-as-GET.
    async fn post(
        &mut self,
        gw: &TestGateway,
        url: &str,
        payload: &str,
    ) -> (StatusCode, HeaderMap, Vec<u8>) {
        let path = url.strip_prefix(BASE).expect("URL under the gateway base");
        let result = gw
            .send(
                Request::builder()
                    .method("POST")
                    .uri(path)
                    .header("content-type", "application/jose+json")
                    .body(Body::from(self.sign(url, payload)))
                    .unwrap(),
            )
            .await;
        if let Some(nonce) = result.1.get("replay-nonce") {
            self.nonce = nonce.to_str().unwrap().to_string();
        }
        result
    }

    async fn post_json(&mut self, gw: &TestGateway, url: &str, payload: &str) -> (StatusCode, HeaderMap, Value) {
        let (status, headers, body) = self.post(gw, url, payload).await;
        (status, headers, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }
}

fn csr(names: &[&str]) -> rcgen::CertificateSigningRequest {
    let key = rcgen::KeyPair::generate().unwrap();
    let mut params =
        CertificateParams::new(names.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, names[0]);
    params.distinguished_name = dn;
    params.serialize_request(&key).unwrap()
}

fn csr_der(names: &[&str]) -> Vec<u8> {
    certd_ocsp::pem_to_der(&csr(names).pem().unwrap()).unwrap()
}

fn single_status(der: &[u8]) -> SerialStatus {
    let statuses = DecodedResponse::from_der(der).unwrap().statuses();
    assert_eq!(statuses.len(), 1);
    statuses[0].0
}

#[tokio::test]
async fn test_health_and_readiness() {
    let gw = TestGateway::new().await;

    let (status, _, body) = gw
        .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::OK);
    let health: HealthResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(health.status, "ok");

    let (status, _, body) = gw
        .send(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::OK);
    let ready: ReadyResponse = serde_json::from_slice(&body).unwrap();
    assert!(ready.ready && ready.database && ready.cache && ready.queue);
    assert!(ready.worker.is_none());
}

#[tokio::test]
async fn test_acme_directory() {
    let gw = TestGateway::new().await;

    let (status, headers, body) = gw
        .send(
            Request::builder()
                .uri("/acme/directory")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["cache-control"], "no-store");
    let directory: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        directory["newAccount"],
        format!("{}/acme/test-ca/new-account", BASE)
    );
    assert_eq!(directory["newNonce"], format!("{}/acme/test-ca/new-nonce", BASE));

    let (status, headers, body) = gw
        .send(
            Request::builder()
                .uri("/acme/missing/directory")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers["content-type"], "application/problem+json");
    let problem: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(problem["type"], "urn:ietf:params:acme:error:malformed");
}

#[tokio::test]
async fn test_new_nonce_get_returns_no_content() {
    let gw = TestGateway::new().await;
    let (status, headers, _) = gw
        .send(
            Request::builder()
                .uri("/acme/test-ca/new-nonce")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(headers.contains_key("replay-nonce"));
    assert_eq!(headers["cache-control"], "no-store");
}

#[tokio::test]
async fn test_acme_rejects_wrong_content_type() {
    let gw = TestGateway::new().await;
    let mut client = AcmeClient::new();
    client.fetch_nonce(&gw).await;

    let url = format!("{}/acme/test-ca/new-account", BASE);
    let (status, headers, _) = gw
        .send(
            Request::builder()
                .method("POST")
                .uri("/acme/test-ca/new-account")
                .header("content-type", "application/json")
                .body(Body::from(client.sign(&url, "{}")))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(headers["content-type"], "application/problem+json");
}

#[tokio::test]
async fn test_acme_nonce_cannot_be_replayed() {
    let gw = TestGateway::new().await;
    let mut client = AcmeClient::new();
    client.fetch_nonce(&gw).await;
    let nonce = client.nonce.clone();

    let url = format!("{}/acme/test-ca/new-account", BASE);
    let payload = r#"{"termsOfServiceAgreed":true}"#;
    let (status, _, _) = client.post(&gw, &url, payload).await;
    assert_eq!(status, StatusCode::CREATED);

    client.nonce = nonce;
    let (status, headers, body) = client.post_json(&gw, &url, payload).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "urn:ietf:params:acme:error:badNonce");
    // A fresh nonce accompanies the error so the client can retry
    assert!(headers.contains_key("replay-nonce"));
}

#[tokio::test]
async fn test_acme_issuance_and_revocation_flow() {
    let gw = TestGateway::new().await;
    let mut client = AcmeClient::new();
    client.fetch_nonce(&gw).await;

    // Account
    let (status, headers, account) = client
        .post_json(
            &gw,
            &format!("{}/acme/test-ca/new-account", BASE),
            r#"{"termsOfServiceAgreed":true,"contact":["mailto:ops@example.com"]}"#,
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(account["status"], "valid");
    let kid = headers["location"].to_str().unwrap().to_string();
    assert!(kid.starts_with(&format!("{}/acme/test-ca/acct/", BASE)));
    client.kid = Some(kid);

    // Order
    let (status, headers, order) = client
        .post_json(
            &gw,
            &format!("{}/acme/test-ca/new-order", BASE),
            r#"{"identifiers":[{"type":"dns","value":"www.example.com"}]}"#,
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(order["status"], "pending");
    let order_url = headers["location"].to_str().unwrap().to_string();
    let authz_url = order["authorizations"][0].as_str().unwrap().to_string();
    let finalize_url = order["finalize"].as_str().unwrap().to_string();

    // Finalizing before authorization is refused
    let early = json!({"csr": URL_SAFE_NO_PAD.encode(csr_der(&["www.example.com"]))}).to_string();
    let (status, _, problem) = client.post_json(&gw, &finalize_url, &early).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(problem["type"], "urn:ietf:params:acme:error:orderNotReady");

    // Challenge
    let (status, _, authz) = client.post_json(&gw, &authz_url, "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(authz["identifier"]["value"], "www.example.com");
    let challenge_url = authz["challenges"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["type"] == "http-01")
        .and_then(|c| c["url"].as_str())
        .unwrap()
        .to_string();

    let (status, headers, challenge) = client.post_json(&gw, &challenge_url, "{}").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(challenge["status"], "processing");
    let links: Vec<_> = headers
        .get_all("link")
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    assert!(links.contains(&format!("<{}>;rel=\"up\"", authz_url)));

    gw.worker.drain().await.unwrap();

    let (_, _, order) = client.post_json(&gw, &order_url, "").await;
    assert_eq!(order["status"], "ready");

    // Finalize
    let payload = json!({"csr": URL_SAFE_NO_PAD.encode(csr_der(&["www.example.com"]))}).to_string();
    let (status, _, order) = client.post_json(&gw, &finalize_url, &payload).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(order["status"], "processing");

    gw.worker.drain().await.unwrap();

    let (_, _, order) = client.post_json(&gw, &order_url, "").await;
    assert_eq!(order["status"], "valid");
    let cert_url = order["certificate"].as_str().unwrap().to_string();

    // Download
    let (status, headers, chain) = client.post(&gw, &cert_url, "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "application/pem-certificate-chain");
    let chain = String::from_utf8(chain).unwrap();
    assert_eq!(chain.matches("-----BEGIN CERTIFICATE-----").count(), 2);

    let order_id = order_url.rsplit('/').next().unwrap();
    let issued = gw
        .store
        .find_by_idempotency_key(&format!("acme-order:{}", order_id))
        .await
        .unwrap()
        .expect("certificate persisted");
    assert_eq!(issued.san_list(), vec!["www.example.com".to_string()]);

    // The worker published a signed response after issuance
    let (status, headers, der) = gw.ocsp_post(issued.serial).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "application/ocsp-response");
    assert_eq!(single_status(&der), SerialStatus::Good);

    // Revoke with the account key
    let leaf_der = certd_ocsp::pem_to_der(&chain).unwrap();
    let payload = json!({
        "certificate": URL_SAFE_NO_PAD.encode(&leaf_der),
        "reason": 1,
    })
    .to_string();
    let (status, _, _) = client
        .post(&gw, &format!("{}/acme/test-ca/revoke-cert", BASE), &payload)
        .await;
    assert_eq!(status, StatusCode::OK);

    gw.worker.drain().await.unwrap();

    let (_, _, der) = gw.ocsp_post(issued.serial).await;
    match single_status(&der) {
        SerialStatus::Revoked { reason, .. } => assert_eq!(reason, Some(1)),
        other => panic!("expected revoked, got {:?}", other),
    }

    // A second revocation is refused
    let (status, _, problem) = client
        .post_json(&gw, &format!("{}/acme/test-ca/revoke-cert", BASE), &payload)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["type"], "urn:ietf:params:acme:error:alreadyRevoked");
}

#[tokio::test]
async fn test_acme_enqueue_failure_leaves_order_retryable() {
    let gw = TestGateway::new().await;
    let mut client = AcmeClient::new();
    client.fetch_nonce(&gw).await;

    let (_, headers, _) = client
        .post_json(
            &gw,
            &format!("{}/acme/test-ca/new-account", BASE),
            r#"{"termsOfServiceAgreed":true}"#,
        )
        .await;
    client.kid = Some(headers["location"].to_str().unwrap().to_string());

    let (_, headers, order) = client
        .post_json(
            &gw,
            &format!("{}/acme/test-ca/new-order", BASE),
            r#"{"identifiers":[{"type":"dns","value":"retry.example.com"}]}"#,
        )
        .await;
    let order_url = headers["location"].to_str().unwrap().to_string();
    let authz_url = order["authorizations"][0].as_str().unwrap().to_string();
    let finalize_url = order["finalize"].as_str().unwrap().to_string();

    let (_, _, authz) = client.post_json(&gw, &authz_url, "").await;
    let challenge_url = authz["challenges"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["type"] == "http-01")
        .and_then(|c| c["url"].as_str())
        .unwrap()
        .to_string();

    // Validation request while the queue is down
    gw.enqueue_fault.store(true, Ordering::SeqCst);
    let (status, _, problem) = client.post_json(&gw, &challenge_url, "{}").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(problem["type"], "urn:ietf:params:acme:error:serverInternal");
    gw.enqueue_fault.store(false, Ordering::SeqCst);

    let (_, _, challenge) = client.post_json(&gw, &challenge_url, "").await;
    assert_eq!(challenge["status"], "pending");
    let (_, _, challenge) = client.post_json(&gw, &challenge_url, "{}").await;
    assert_eq!(challenge["status"], "processing");
    gw.worker.drain().await.unwrap();

    let (_, _, order) = client.post_json(&gw, &order_url, "").await;
    assert_eq!(order["status"], "ready");

    // Finalize while the queue is down
    let payload =
        json!({"csr": URL_SAFE_NO_PAD.encode(csr_der(&["retry.example.com"]))}).to_string();
    gw.enqueue_fault.store(true, Ordering::SeqCst);
    let (status, _, problem) = client.post_json(&gw, &finalize_url, &payload).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(problem["type"], "urn:ietf:params:acme:error:serverInternal");
    gw.enqueue_fault.store(false, Ordering::SeqCst);

    let (_, _, order) = client.post_json(&gw, &order_url, "").await;
    assert_eq!(order["status"], "ready");
    assert_eq!(gw.worker.drain().await.unwrap(), 0);

    let (status, _, order) = client.post_json(&gw, &finalize_url, &payload).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(order["status"], "processing");
    gw.worker.drain().await.unwrap();

    let (_, _, order) = client.post_json(&gw, &order_url, "").await;
    assert_eq!(order["status"], "valid");
}

#[tokio::test]
async fn test_ocsp_get_and_bad_requests() {
    let gw = TestGateway::new().await;
    let issuer = IssuerHashes::from_certificate_pem(&gw.ca.cert_pem).unwrap();
    let request = certd_ocsp::encode_request(&issuer, HashAlgorithm::Sha1, 777, None).unwrap();
    let uri = format!("/ocsp/{}", URL_SAFE.encode(&request));

    // Nothing cached yet: the gateway cannot sign and answers tryLater
    let (status, headers, der) = gw
        .send(Request::builder().uri(&uri).body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "application/ocsp-response");
    assert_eq!(der, certd_ocsp::try_later());

    gw.worker.drain().await.unwrap();

    let (_, _, der) = gw
        .send(Request::builder().uri(&uri).body(Body::empty()).unwrap())
        .await;
    assert_eq!(single_status(&der), SerialStatus::Unknown);

    let (status, _, der) = gw
        .send(
            Request::builder()
                .method("POST")
                .uri("/ocsp")
                .header("content-type", "application/ocsp-request")
                .body(Body::from(vec![0x30, 0x03, 0x02, 0x01]))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(der, certd_ocsp::malformed_request());

    let (status, _, _) = gw
        .send(
            Request::builder()
                .method("POST")
                .uri("/ocsp")
                .header("content-type", "text/plain")
                .body(Body::from(request))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn test_crl_publication_and_negotiation() {
    let gw = TestGateway::new().await;
    let crl_get = |uri: &str, accept: Option<&str>| {
        let mut request = Request::builder().uri(uri);
        if let Some(accept) = accept {
            request = request.header("accept", accept);
        }
        request.body(Body::empty()).unwrap()
    };

    // Nothing signed yet: the gateway asks a worker to publish
    let (status, headers, _) = gw.send(crl_get("/crl/test-ca", None)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(headers.get("retry-after").unwrap(), "5");
    assert!(gw.worker.drain().await.unwrap() >= 1);

    let (status, headers, body) = gw.send(crl_get("/crl/test-ca", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("content-type").unwrap(), "application/pkix-crl");
    assert_eq!(headers.get("cache-control").unwrap(), "public, max-age=600");
    assert!(headers.get("expires").is_some());
    let empty = DecodedCrl::from_der(&body).unwrap();
    assert!(empty.entries().is_empty());
    let first_number = empty.number().unwrap();

    // Issue and revoke through the management API
    let (status, _) = gw
        .post_json(
            "/api/certificates",
            json!({
                "ca": "test-ca",
                "csr_pem": csr(&["crl.example.com"]).pem().unwrap(),
                "request_id": "crl-1"
            }),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    gw.worker.drain().await.unwrap();
    let (_, list) = gw.get_json("/api/certificates?ca=test-ca").await;
    let serial = list["certificates"][0]["serial"].as_str().unwrap().to_string();
    let (status, _) = gw
        .post_json(
            &format!("/api/certificates/test-ca/{}/revoke", serial),
            json!({"reason": "keyCompromise"}),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    gw.worker.drain().await.unwrap();

    let (status, _, body) = gw.send(crl_get(&format!("/crl/{}", gw.ca.id), None)).await;
    assert_eq!(status, StatusCode::OK);
    let full = DecodedCrl::from_der(&body).unwrap();
    assert_eq!(full.number(), Some(first_number + 1));
    assert_eq!(full.scope(), Some(CrlScope::Full));
    let entries = full.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(certd_cert::format_serial(entries[0].serial), serial);
    assert_eq!(entries[0].reason, Some(1));

    let (status, headers, body) = gw
        .send(crl_get("/crl/test-ca?scope=user", Some("application/x-pem-file")))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("content-type").unwrap(), "application/x-pem-file");
    let pem = String::from_utf8(body).unwrap();
    assert!(pem.starts_with("-----BEGIN X509 CRL-----\n"));
    let der = STANDARD
        .decode(
            pem.lines()
                .filter(|line| !line.starts_with("-----"))
                .collect::<String>(),
        )
        .unwrap();
    assert_eq!(DecodedCrl::from_der(&der).unwrap().scope(), Some(CrlScope::User));

    let (status, headers, body) = gw
        .send(crl_get("/crl/test-ca?scope=CA&encoding=der", Some("application/x-pem-file")))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("content-type").unwrap(), "application/pkix-crl");
    let ca_only = DecodedCrl::from_der(&body).unwrap();
    assert_eq!(ca_only.scope(), Some(CrlScope::Ca));
    assert!(ca_only.entries().is_empty());

    let (status, _, body) = gw.send(crl_get("/crl/test-ca?scope=delta", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["code"], "INVALID_SCOPE");
    let (status, _, _) = gw.send(crl_get("/crl/test-ca?encoding=base64", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _, _) = gw.send(crl_get("/crl/missing-ca", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_management_requires_token() {
    let gw = TestGateway::new().await;

    let (status, _, body) = gw
        .send(Request::builder().uri("/api/cas").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(error.code.as_deref(), Some("MISSING_AUTH"));

    let forged = issue_token(b"not-the-cluster-secret", "ops", chrono::Duration::hours(1)).unwrap();
    let (status, _, _) = gw
        .send(
            Request::builder()
                .uri("/api/cas")
                .header("Authorization", format!("Bearer {}", forged))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, cas) = gw.get_json("/api/cas").await;
    assert_eq!(status, StatusCode::OK);
    let cas: CaList = serde_json::from_value(cas).unwrap();
    assert_eq!(cas.total, 1);
    assert_eq!(cas.cas[0].name, "test-ca");
    assert_eq!(cas.cas[0].status, "active");
}

#[tokio::test]
async fn test_management_issue_and_revoke() {
    let gw = TestGateway::new().await;
    let pem = csr(&["api.example.com"]).pem().unwrap();

    let (status, accepted) = gw
        .post_json(
            "/api/certificates",
            json!({"ca": "test-ca", "csr_pem": pem, "request_id": "deploy-1"}),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let accepted: JobAccepted = serde_json::from_value(accepted).unwrap();
    assert!(accepted.created);

    // Resubmitting the same request id is absorbed by the existing job
    let (status, replay) = gw
        .post_json(
            "/api/certificates",
            json!({"ca": "test-ca", "csr_pem": pem, "request_id": "deploy-1"}),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(replay["job_id"], accepted.job_id.as_str());
    assert_eq!(replay["created"], false);

    gw.worker.drain().await.unwrap();

    let (status, job) = gw.get_json(&format!("/api/jobs/{}", accepted.job_id)).await;
    assert_eq!(status, StatusCode::OK);
    let job: JobInfo = serde_json::from_value(job).unwrap();
    assert_eq!(job.kind, "issue");
    assert_eq!(job.status, "succeeded");

    let (status, list) = gw.get_json("/api/certificates?ca=test-ca&status=valid").await;
    assert_eq!(status, StatusCode::OK);
    let list: CertificateList = serde_json::from_value(list).unwrap();
    assert_eq!(list.total, 1);
    let serial = list.certificates[0].serial.clone();

    let (status, cert) = gw
        .get_json(&format!("/api/certificates/test-ca/{}", serial))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cert["sans"], json!(["api.example.com"]));

    let revoke_uri = format!("/api/certificates/test-ca/{}/revoke", serial);
    let (status, _) = gw
        .post_json(&revoke_uri, json!({"reason": "keyCompromise"}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    gw.worker.drain().await.unwrap();

    let (status, error) = gw
        .post_json(&revoke_uri, json!({"reason": "superseded"}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["code"], "ALREADY_REVOKED");

    let (status, list) = gw.get_json("/api/certificates?status=revoked").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["total"], 1);
}

#[tokio::test]
async fn test_management_rejects_before_queueing() {
    let gw = TestGateway::new().await;
    let pem = csr(&["api.example.com"]).pem().unwrap();

    let (status, error) = gw
        .post_json(
            "/api/certificates",
            json!({"ca": "no-such-ca", "csr_pem": pem}),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["code"], "NOT_FOUND");

    let (status, error) = gw
        .post_json(
            "/api/certificates",
            json!({"ca": "test-ca", "csr_pem": pem, "profile": {"validity_days": 5000}}),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error["code"], "POLICY_VIOLATION");
    assert_eq!(error["retryable"], false);

    let (status, _) = gw
        .post_json(
            "/api/certificates",
            json!({"ca": "test-ca", "csr_pem": "not a csr"}),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, error) = gw
        .post_json(
            "/api/certificates/test-ca/2A/revoke",
            json!({"reason": "notAReason"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["code"], "INVALID_REASON");

    let (status, _) = gw.get_json("/api/certificates/test-ca/2A").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = gw.get_json("/api/jobs/unknown").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Nothing reached the queue
    assert_eq!(gw.worker.drain().await.unwrap(), 0);
}

#[tokio::test]
async fn test_management_refuses_to_revoke_expired_certificate() {
    let gw = TestGateway::new().await;
    let pem = csr(&["old.example.com"]).pem().unwrap();

    let (status, _) = gw
        .post_json(
            "/api/certificates",
            json!({"ca": "test-ca", "csr_pem": pem, "request_id": "short-lived"}),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    gw.worker.drain().await.unwrap();

    let cert = gw
        .store
        .find_by_idempotency_key("short-lived")
        .await
        .unwrap()
        .unwrap();
    let swept = gw
        .store
        .expire_due(cert.not_after + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(swept.len(), 1);

    let (status, error) = gw
        .post_json(
            &format!(
                "/api/certificates/test-ca/{}/revoke",
                certd_cert::format_serial(cert.serial)
            ),
            json!({"reason": "keyCompromise"}),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["code"], "INVALID_TRANSITION");
    assert_eq!(error["retryable"], false);

    assert_eq!(gw.worker.drain().await.unwrap(), 0);
    let (_, list) = gw.get_json("/api/certificates?status=expired").await;
    assert_eq!(list["total"], 1);
}
