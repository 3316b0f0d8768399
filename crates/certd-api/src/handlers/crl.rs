//! Revocation list endpoint (RFC 5280 section 5)
//!
//! Lists are signed by the Issuance Worker and stored per CA and scope; the
//! gateway only reads them back and picks the encoding.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use certd_control::Job;
use certd_ocsp::{crl_to_pem, CrlScope};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{api_error, issuance_error, management::find_ca, ApiError};
use crate::models::{CrlQuery, ErrorResponse};
use crate::AppState;

pub const PKIX_CRL: &str = "application/pkix-crl";
pub const PEM_FILE: &str = "application/x-pem-file";

/// Seconds a client should wait for a list that is still being signed
const RETRY_AFTER_SECS: &str = "5";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Der,
    Pem,
}

/// An explicit `encoding` wins over `Accept`; DER is the default.
fn negotiate(query: Option<&str>, headers: &HeaderMap) -> Result<Encoding, ApiError> {
    if let Some(encoding) = query {
        return match encoding.to_ascii_lowercase().as_str() {
            "der" => Ok(Encoding::Der),
            "pem" => Ok(Encoding::Pem),
            other => Err(api_error(
                StatusCode::BAD_REQUEST,
                "INVALID_ENCODING",
                format!("{}: expected der or pem.", other),
            )),
        };
    }

    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let pem = accept
        .split(',')
        .map(|range| range.split(';').next().unwrap_or_default().trim())
        .any(|range| range.eq_ignore_ascii_case(PEM_FILE));
    Ok(if pem { Encoding::Pem } else { Encoding::Der })
}

fn not_ready(ca: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::RETRY_AFTER, RETRY_AFTER_SECS)],
        Json(ErrorResponse {
            error: format!("{}: revocation list is being published.", ca),
            code: Some("TRANSIENT_DEPENDENCY".to_string()),
            retryable: true,
        }),
    )
        .into_response()
}

/// Fetch the current revocation list of a CA
#[utoipa::path(
    get,
    path = "/crl/{ca}",
    params(
        ("ca" = String, Path, description = "CA id or name"),
        CrlQuery
    ),
    responses(
        (status = 200, description = "Signed CertificateList", content_type = "application/pkix-crl"),
        (status = 400, description = "Unknown scope or encoding", body = ErrorResponse),
        (status = 404, description = "Unknown CA", body = ErrorResponse),
        (status = 503, description = "List not published yet", body = ErrorResponse)
    ),
    tag = "crl"
)]
pub async fn get_crl(
    State(state): State<Arc<AppState>>,
    Path(ca): Path<String>,
    Query(query): Query<CrlQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let scope = match query.scope.as_deref() {
        None => CrlScope::Full,
        Some(name) => CrlScope::parse(name).ok_or_else(|| {
            api_error(
                StatusCode::BAD_REQUEST,
                "INVALID_SCOPE",
                format!("{}: expected full, ca or user.", name),
            )
        })?,
    };
    let encoding = negotiate(query.encoding.as_deref(), &headers)?;
    let authority = find_ca(&state, &ca).await?;
    let now = Utc::now();

    let list = state
        .store
        .get_crl(&authority.id, scope.as_str())
        .await
        .map_err(issuance_error)?;

    let stale = list.as_ref().map_or(true, |list| list.next_update <= now);
    if stale {
        // One request per second at most while the list is missing
        let job = Job::PublishCrl {
            ca_id: authority.id.clone(),
            bucket: now.timestamp() * 1000,
        };
        if let Err(e) = state.queue.enqueue(&job).await {
            warn!(ca_id = %authority.id, "Failed to enqueue CRL publication: {}", e);
        }
    }
    let Some(list) = list else {
        debug!(ca_id = %authority.id, scope = scope.as_str(), "CRL not published yet");
        return Ok(not_ready(&authority.name));
    };

    let max_age = state
        .config
        .crl
        .max_age_secs
        .min((list.next_update - now).num_seconds())
        .max(0);
    let cache_control = if max_age == 0 {
        "no-cache".to_string()
    } else {
        format!("public, max-age={}", max_age)
    };

    let (content_type, body) = match encoding {
        Encoding::Der => (PKIX_CRL, list.der),
        Encoding::Pem => (PEM_FILE, crl_to_pem(&list.der).into_bytes()),
    };
    debug!(
        ca_id = %authority.id,
        scope = scope.as_str(),
        number = list.number,
        "Serving CRL"
    );

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CACHE_CONTROL, cache_control),
            (
                header::EXPIRES,
                list.next_update
                    .format("%a, %d %b %Y %H:%M:%S GMT")
                    .to_string(),
            ),
        ],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn accept(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_der_is_default() {
        assert_eq!(negotiate(None, &HeaderMap::new()).unwrap(), Encoding::Der);
        assert_eq!(negotiate(None, &accept("*/*")).unwrap(), Encoding::Der);
        assert_eq!(negotiate(None, &accept(PKIX_CRL)).unwrap(), Encoding::Der);
    }

    #[test]
    fn test_pem_from_accept_or_query() {
        assert_eq!(
            negotiate(
                None,
                &accept("application/pkix-crl;q=0.5, application/x-pem-file")
            )
            .unwrap(),
            Encoding::Pem
        );
        assert_eq!(negotiate(Some("PEM"), &accept(PKIX_CRL)).unwrap(), Encoding::Pem);
        assert_eq!(negotiate(Some("der"), &accept(PEM_FILE)).unwrap(), Encoding::Der);
    }

    #[test]
    fn test_unknown_encoding_rejected() {
        let (status, body) = negotiate(Some("base64"), &HeaderMap::new()).unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.code.as_deref(), Some("INVALID_ENCODING"));
    }
}
