//! Gateway HTTP surface: ACME, OCSP, CRLs, management API and health checks.

pub mod handlers;
pub mod middleware;
pub mod models;

use axum::{
    http::{header, HeaderName, Method},
    middleware as axum_middleware,
    routing::{get, post},
    Json, Router,
};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

use certd_cert::KeyStore;
use certd_control::{
    AcmeService, AcmeStore, CaStore, CertdConfig, JobQueue, OcspResponder, OcspSigner, Readiness,
    SharedSecret, StatusCache,
};
use sea_orm::DatabaseConnection;

/// Application state shared across handlers
pub struct AppState {
    pub store: CaStore,
    pub queue: Arc<dyn JobQueue>,
    pub acme: AcmeService,
    pub ocsp: OcspResponder,
    pub readiness: Arc<Readiness>,
    pub config: Arc<CertdConfig>,
}

impl AppState {
    /// `signing_keys` gives the OCSP responder read-only access to the
    /// delegated responder keys; without it the gateway serves only cached
    /// responses.
    pub fn new(
        db: DatabaseConnection,
        cache: Arc<dyn StatusCache>,
        queue: Arc<dyn JobQueue>,
        signing_keys: Option<Arc<dyn KeyStore>>,
        secret: &SharedSecret,
        config: Arc<CertdConfig>,
    ) -> Self {
        let store = CaStore::new(db.clone());
        let signer = signing_keys.map(|keys| OcspSigner::new(store.clone(), keys, &config.ocsp));

        Self {
            acme: AcmeService::new(
                store.clone(),
                AcmeStore::new(db),
                queue.clone(),
                cache.clone(),
                secret,
                config.clone(),
            ),
            ocsp: OcspResponder::new(
                store.clone(),
                cache.clone(),
                queue.clone(),
                signer,
                config.ocsp.clone(),
            ),
            readiness: Arc::new(Readiness::new(store.clone(), cache, queue.clone())),
            store,
            queue,
            config,
        }
    }
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "certd API",
        version = "0.1.0",
        description = "Certificate authority gateway: ACME, OCSP, CRL and management endpoints"
    ),
    paths(
        handlers::health::health,
        handlers::health::ready,
        handlers::ocsp::ocsp_get,
        handlers::ocsp::ocsp_post,
        handlers::crl::get_crl,
        handlers::acme::default_directory,
        handlers::acme::directory,
        handlers::acme::new_nonce,
        handlers::acme::new_account,
        handlers::acme::account,
        handlers::acme::account_orders,
        handlers::acme::new_order,
        handlers::acme::order,
        handlers::acme::finalize,
        handlers::acme::authorization,
        handlers::acme::challenge,
        handlers::acme::certificate,
        handlers::acme::revoke_cert,
        handlers::management::list_cas,
        handlers::management::get_ca,
        handlers::management::issue_certificate,
        handlers::management::list_certificates,
        handlers::management::get_certificate,
        handlers::management::revoke_certificate,
        handlers::management::get_job,
    ),
    components(
        schemas(
            models::ErrorResponse,
            models::HealthResponse,
            models::ReadyResponse,
            models::CaInfo,
            models::CaList,
            models::CertificateInfo,
            models::CertificateList,
            models::IssueCertificateRequest,
            models::RevokeCertificateRequest,
            models::JobAccepted,
            models::JobInfo,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "acme", description = "ACME (RFC 8555) endpoints"),
        (name = "ocsp", description = "OCSP (RFC 6960) responder"),
        (name = "crl", description = "Certificate revocation lists (RFC 5280)"),
        (name = "authorities", description = "Certificate authority inventory"),
        (name = "certificates", description = "Certificate issuance and revocation"),
        (name = "jobs", description = "Asynchronous job status"),
        (name = "system", description = "Health and readiness checks")
    )
)]
pub struct ApiDoc;

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// API server configuration
#[derive(Clone)]
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Allow cross-origin requests from any origin
    pub enable_cors: bool,
    /// Key for management API tokens
    pub jwt_secret: Vec<u8>,
}

/// Liveness and readiness checks; served by Workers on their own port.
pub fn health_router(readiness: Arc<Readiness>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .with_state(readiness)
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let jwt_state = Arc::new(middleware::JwtState::new(&self.config.jwt_secret));

        // Unauthenticated protocol endpoints
        let public_router = Router::new()
            .route("/api/openapi.json", get(openapi_json))
            .route("/ocsp", post(handlers::ocsp::ocsp_post))
            .route("/ocsp/{*request}", get(handlers::ocsp::ocsp_get))
            .route("/crl/{ca}", get(handlers::crl::get_crl))
            .route("/acme/directory", get(handlers::acme::default_directory))
            .route("/acme/{ca}/directory", get(handlers::acme::directory))
            .route("/acme/{ca}/new-nonce", get(handlers::acme::new_nonce))
            .route("/acme/{ca}/new-account", post(handlers::acme::new_account))
            .route("/acme/{ca}/new-order", post(handlers::acme::new_order))
            .route("/acme/{ca}/revoke-cert", post(handlers::acme::revoke_cert))
            .route("/acme/{ca}/acct/{id}", post(handlers::acme::account))
            .route(
                "/acme/{ca}/acct/{id}/orders",
                post(handlers::acme::account_orders),
            )
            .route("/acme/{ca}/order/{id}", post(handlers::acme::order))
            .route(
                "/acme/{ca}/order/{id}/finalize",
                post(handlers::acme::finalize),
            )
            .route("/acme/{ca}/authz/{id}", post(handlers::acme::authorization))
            .route("/acme/{ca}/chall/{id}", post(handlers::acme::challenge))
            .route("/acme/{ca}/cert/{id}", post(handlers::acme::certificate))
            .with_state(self.state.clone());

        // Management routes (bearer token required)
        let protected_router = Router::new()
            .route("/api/cas", get(handlers::management::list_cas))
            .route("/api/cas/{ca}", get(handlers::management::get_ca))
            .route(
                "/api/certificates",
                get(handlers::management::list_certificates)
                    .post(handlers::management::issue_certificate),
            )
            .route(
                "/api/certificates/{ca}/{serial}",
                get(handlers::management::get_certificate),
            )
            .route(
                "/api/certificates/{ca}/{serial}/revoke",
                post(handlers::management::revoke_certificate),
            )
            .route("/api/jobs/{id}", get(handlers::management::get_job))
            .layer(axum_middleware::from_fn_with_state(
                jwt_state,
                middleware::require_auth,
            ))
            .with_state(self.state.clone());

        let mut router = Router::new()
            .merge(health_router(self.state.readiness.clone()))
            .merge(public_router)
            .merge(protected_router)
            .layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_methods([Method::GET, Method::HEAD, Method::POST])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
                .expose_headers([
                    HeaderName::from_static("replay-nonce"),
                    header::LOCATION,
                    header::LINK,
                ])
                .allow_origin(Any);
            router = router.layer(cors);
        }

        router
    }

    /// Serve until `shutdown` is cancelled
    pub async fn start(self, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
        let router = self.build_router();

        info!("Starting gateway on {}", self.config.bind_addr);
        info!(
            "OpenAPI document: http://{}/api/openapi.json",
            self.config.bind_addr
        );

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_generation() {
        let doc = ApiDoc::openapi();
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json["paths"]["/ocsp"].is_object());
        assert!(json["paths"]["/crl/{ca}"]["get"].is_object());
        assert!(json["paths"]["/api/certificates"]["post"].is_object());
        assert!(json["components"]["securitySchemes"]["bearer_auth"].is_object());
    }
}
