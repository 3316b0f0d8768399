//! ACME (RFC 8555) HTTP binding.
//!
//! Authentication and state transitions live in [`certd_control::AcmeService`];
//! these handlers add the transport rules: content types, `Replay-Nonce`,
//! `Link` and `Location` headers, and problem documents.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use certd_control::{AcmeBody, AcmeError, AcmeResponse};
use certd_db::entities::certificate_authority;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::AppState;

const JOSE_JSON: &str = "application/jose+json";
const PROBLEM_JSON: &str = "application/problem+json";
const PEM_CHAIN: &str = "application/pem-certificate-chain";
const REPLAY_NONCE: &str = "replay-nonce";

fn insert_header(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.append(name, value);
    }
}

/// Headers every ACME response carries
fn common_headers(state: &AppState, ca_name: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    match state.acme.new_nonce() {
        Ok(nonce) => insert_header(
            &mut headers,
            header::HeaderName::from_static(REPLAY_NONCE),
            &nonce,
        ),
        Err(e) => debug!("Failed to issue nonce: {}", e),
    }
    if let Some(name) = ca_name {
        let index = format!(
            "<{}/acme/{}/directory>;rel=\"index\"",
            state.config.base_url(),
            name
        );
        insert_header(&mut headers, header::LINK, &index);
    }
    headers
}

fn problem_response(state: &AppState, ca_name: Option<&str>, err: AcmeError) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    debug!("ACME problem {}: {}", err.problem_type(), err);

    let mut headers = common_headers(state, ca_name);
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(PROBLEM_JSON));
    let body = serde_json::to_vec(&err.problem()).unwrap_or_default();
    (status, headers, body).into_response()
}

fn acme_response(state: &AppState, ca_name: &str, response: AcmeResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
    let mut headers = common_headers(state, Some(ca_name));
    if let Some(location) = &response.location {
        insert_header(&mut headers, header::LOCATION, location);
    }
    for link in &response.links {
        insert_header(&mut headers, header::LINK, link);
    }

    match response.body {
        AcmeBody::Json(value) => (status, headers, Json(value)).into_response(),
        AcmeBody::PemChain(pem) => {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(PEM_CHAIN));
            (status, headers, pem).into_response()
        }
        AcmeBody::Empty => (status, headers).into_response(),
    }
}

/// Resolve the CA, check the transport rules and run one JWS-authenticated operation.
async fn dispatch<F, Fut>(
    state: Arc<AppState>,
    ca_name: Option<String>,
    headers: &HeaderMap,
    uri: &Uri,
    body: Bytes,
    op: F,
) -> Response
where
    F: FnOnce(Arc<AppState>, certificate_authority::Model, String, Bytes) -> Fut,
    Fut: Future<Output = Result<AcmeResponse, AcmeError>>,
{
    let ca = match state.acme.resolve_ca(ca_name.as_deref()).await {
        Ok(ca) => ca,
        Err(e) => return problem_response(&state, None, e),
    };

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with(JOSE_JSON) {
        return problem_response(&state, Some(&ca.name), AcmeError::UnsupportedMediaType);
    }

    let url = format!("{}{}", state.config.base_url(), uri.path());
    let name = ca.name.clone();
    match op(state.clone(), ca, url, body).await {
        Ok(response) => acme_response(&state, &name, response),
        Err(e) => problem_response(&state, Some(&name), e),
    }
}

async fn directory_response(state: Arc<AppState>, ca_name: Option<String>) -> Response {
    match state.acme.resolve_ca(ca_name.as_deref()).await {
        Ok(ca) => {
            let mut headers = HeaderMap::new();
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
            (StatusCode::OK, headers, Json(state.acme.directory(&ca))).into_response()
        }
        Err(e) => problem_response(&state, None, e),
    }
}

/// Directory of the default ACME CA
#[utoipa::path(
    get,
    path = "/acme/directory",
    responses(
        (status = 200, description = "ACME directory object"),
        (status = 404, description = "No usable default CA", content_type = "application/problem+json")
    ),
    tag = "acme"
)]
pub async fn default_directory(State(state): State<Arc<AppState>>) -> Response {
    directory_response(state, None).await
}

/// Directory of one ACME CA
#[utoipa::path(
    get,
    path = "/acme/{ca}/directory",
    params(("ca" = String, Path, description = "CA name")),
    responses(
        (status = 200, description = "ACME directory object"),
        (status = 404, description = "Unknown CA", content_type = "application/problem+json")
    ),
    tag = "acme"
)]
pub async fn directory(State(state): State<Arc<AppState>>, Path(ca): Path<String>) -> Response {
    directory_response(state, Some(ca)).await
}

/// Fresh anti-replay nonce: HEAD answers 200, GET 204
#[utoipa::path(
    get,
    path = "/acme/{ca}/new-nonce",
    params(("ca" = String, Path, description = "CA name")),
    responses(
        (status = 204, description = "Nonce in the Replay-Nonce header"),
        (status = 404, description = "Unknown CA", content_type = "application/problem+json")
    ),
    tag = "acme"
)]
pub async fn new_nonce(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(ca): Path<String>,
) -> Response {
    let ca = match state.acme.resolve_ca(Some(&ca)).await {
        Ok(ca) => ca,
        Err(e) => return problem_response(&state, None, e),
    };
    let status = if method == Method::HEAD {
        StatusCode::OK
    } else {
        StatusCode::NO_CONTENT
    };
    (status, common_headers(&state, Some(&ca.name))).into_response()
}

/// Create or look up an account
#[utoipa::path(
    post,
    path = "/acme/{ca}/new-account",
    params(("ca" = String, Path, description = "CA name")),
    request_body(content = String, content_type = "application/jose+json"),
    responses(
        (status = 201, description = "Account created"),
        (status = 200, description = "Existing account")
    ),
    tag = "acme"
)]
pub async fn new_account(
    State(state): State<Arc<AppState>>,
    Path(ca): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    dispatch(state, Some(ca), &headers, &uri, body, |state, ca, url, body| async move {
        state.acme.new_account(&ca, &url, &body).await
    })
    .await
}

/// Fetch or update an account
#[utoipa::path(
    post,
    path = "/acme/{ca}/acct/{id}",
    params(
        ("ca" = String, Path, description = "CA name"),
        ("id" = String, Path, description = "Account id")
    ),
    request_body(content = String, content_type = "application/jose+json"),
    responses((status = 200, description = "Account object")),
    tag = "acme"
)]
pub async fn account(
    State(state): State<Arc<AppState>>,
    Path((ca, id)): Path<(String, String)>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    dispatch(state, Some(ca), &headers, &uri, body, |state, ca, url, body| async move {
        state.acme.account(&ca, &url, &body, &id).await
    })
    .await
}

/// Orders of an account
#[utoipa::path(
    post,
    path = "/acme/{ca}/acct/{id}/orders",
    params(
        ("ca" = String, Path, description = "CA name"),
        ("id" = String, Path, description = "Account id")
    ),
    request_body(content = String, content_type = "application/jose+json"),
    responses((status = 200, description = "Order URL list")),
    tag = "acme"
)]
pub async fn account_orders(
    State(state): State<Arc<AppState>>,
    Path((ca, id)): Path<(String, String)>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    dispatch(state, Some(ca), &headers, &uri, body, |state, ca, url, body| async move {
        state.acme.account_orders(&ca, &url, &body, &id).await
    })
    .await
}

/// Create an order
#[utoipa::path(
    post,
    path = "/acme/{ca}/new-order",
    params(("ca" = String, Path, description = "CA name")),
    request_body(content = String, content_type = "application/jose+json"),
    responses((status = 201, description = "Order created")),
    tag = "acme"
)]
pub async fn new_order(
    State(state): State<Arc<AppState>>,
    Path(ca): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    dispatch(state, Some(ca), &headers, &uri, body, |state, ca, url, body| async move {
        state.acme.new_order(&ca, &url, &body).await
    })
    .await
}

/// Fetch an order
#[utoipa::path(
    post,
    path = "/acme/{ca}/order/{id}",
    params(
        ("ca" = String, Path, description = "CA name"),
        ("id" = String, Path, description = "Order id")
    ),
    request_body(content = String, content_type = "application/jose+json"),
    responses((status = 200, description = "Order object")),
    tag = "acme"
)]
pub async fn order(
    State(state): State<Arc<AppState>>,
    Path((ca, id)): Path<(String, String)>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    dispatch(state, Some(ca), &headers, &uri, body, |state, ca, url, body| async move {
        state.acme.order(&ca, &url, &body, &id).await
    })
    .await
}

/// Finalize an order with a CSR
#[utoipa::path(
    post,
    path = "/acme/{ca}/order/{id}/finalize",
    params(
        ("ca" = String, Path, description = "CA name"),
        ("id" = String, Path, description = "Order id")
    ),
    request_body(content = String, content_type = "application/jose+json"),
    responses(
        (status = 200, description = "Order moved to processing"),
        (status = 403, description = "Order not ready", content_type = "application/problem+json")
    ),
    tag = "acme"
)]
pub async fn finalize(
    State(state): State<Arc<AppState>>,
    Path((ca, id)): Path<(String, String)>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    dispatch(state, Some(ca), &headers, &uri, body, |state, ca, url, body| async move {
        state.acme.finalize(&ca, &url, &body, &id).await
    })
    .await
}

/// Fetch an authorization
#[utoipa::path(
    post,
    path = "/acme/{ca}/authz/{id}",
    params(
        ("ca" = String, Path, description = "CA name"),
        ("id" = String, Path, description = "Authorization id")
    ),
    request_body(content = String, content_type = "application/jose+json"),
    responses((status = 200, description = "Authorization object")),
    tag = "acme"
)]
pub async fn authorization(
    State(state): State<Arc<AppState>>,
    Path((ca, id)): Path<(String, String)>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    dispatch(state, Some(ca), &headers, &uri, body, |state, ca, url, body| async move {
        state.acme.authorization(&ca, &url, &body, &id).await
    })
    .await
}

/// Fetch a challenge, or respond to it with a `{}` payload
#[utoipa::path(
    post,
    path = "/acme/{ca}/chall/{id}",
    params(
        ("ca" = String, Path, description = "CA name"),
        ("id" = String, Path, description = "Challenge id")
    ),
    request_body(content = String, content_type = "application/jose+json"),
    responses((status = 200, description = "Challenge object")),
    tag = "acme"
)]
pub async fn challenge(
    State(state): State<Arc<AppState>>,
    Path((ca, id)): Path<(String, String)>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    dispatch(state, Some(ca), &headers, &uri, body, |state, ca, url, body| async move {
        state.acme.challenge(&ca, &url, &body, &id).await
    })
    .await
}

/// Download the issued certificate chain
#[utoipa::path(
    post,
    path = "/acme/{ca}/cert/{id}",
    params(
        ("ca" = String, Path, description = "CA name"),
        ("id" = String, Path, description = "Certificate id")
    ),
    request_body(content = String, content_type = "application/jose+json"),
    responses(
        (status = 200, description = "PEM chain", content_type = "application/pem-certificate-chain")
    ),
    tag = "acme"
)]
pub async fn certificate(
    State(state): State<Arc<AppState>>,
    Path((ca, id)): Path<(String, String)>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    dispatch(state, Some(ca), &headers, &uri, body, |state, ca, url, body| async move {
        state.acme.certificate(&ca, &url, &body, &id).await
    })
    .await
}

/// Revoke a certificate
#[utoipa::path(
    post,
    path = "/acme/{ca}/revoke-cert",
    params(("ca" = String, Path, description = "CA name")),
    request_body(content = String, content_type = "application/jose+json"),
    responses(
        (status = 200, description = "Revocation accepted"),
        (status = 400, description = "Already revoked or bad reason", content_type = "application/problem+json")
    ),
    tag = "acme"
)]
pub async fn revoke_cert(
    State(state): State<Arc<AppState>>,
    Path(ca): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    dispatch(state, Some(ca), &headers, &uri, body, |state, ca, url, body| async move {
        state.acme.revoke_cert(&ca, &url, &body).await
    })
    .await
}
