//! OCSP responder endpoints (RFC 6960 appendix A)

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::debug;

use crate::AppState;

pub const OCSP_REQUEST: &str = "application/ocsp-request";
pub const OCSP_RESPONSE: &str = "application/ocsp-response";

fn ocsp_response(der: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, OCSP_RESPONSE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        der,
    )
        .into_response()
}

/// OCSP over GET: base64 DER request in the path
#[utoipa::path(
    get,
    path = "/ocsp/{request}",
    params(
        ("request" = String, Path, description = "URL-encoded base64 of the DER OCSPRequest")
    ),
    responses(
        (status = 200, description = "DER OCSPResponse", content_type = "application/ocsp-response")
    ),
    tag = "ocsp"
)]
pub async fn ocsp_get(
    State(state): State<Arc<AppState>>,
    Path(request): Path<String>,
) -> Response {
    debug!("OCSP GET request ({} bytes)", request.len());
    ocsp_response(state.ocsp.respond_get(&request).await)
}

/// OCSP over POST: DER request body
#[utoipa::path(
    post,
    path = "/ocsp",
    request_body(content = Vec<u8>, content_type = "application/ocsp-request"),
    responses(
        (status = 200, description = "DER OCSPResponse", content_type = "application/ocsp-response"),
        (status = 415, description = "Wrong content type")
    ),
    tag = "ocsp"
)]
pub async fn ocsp_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with(OCSP_REQUEST) {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("Expected {}", OCSP_REQUEST),
        )
            .into_response();
    }

    debug!("OCSP POST request ({} bytes)", body.len());
    ocsp_response(state.ocsp.respond_der(&body).await)
}
