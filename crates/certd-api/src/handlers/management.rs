//! Management API: CA inventory, certificate issuance and revocation, jobs.
//!
//! Mutations are accepted synchronously and carried out by the Issuance
//! Worker; the response carries the job id to poll.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use certd_cert::{CaWindow, ParsedCsr};
use certd_control::{CertificateFilter, IssuanceError, Job};
use certd_db::entities::{
    certificate::CertificateStatus,
    certificate_authority::{self, CaStatus},
    revocation::RevocationReason,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use super::{api_error, issuance_error, queue_error, ApiError};
use crate::middleware::AuthUser;
use crate::models::*;
use crate::AppState;

const MAX_REQUEST_ID_LEN: usize = 128;

/// Serial as rendered by this API: hex, optionally colon-separated or `0x`-prefixed.
fn path_serial(input: &str) -> Option<i64> {
    let hex: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| *c != ':')
        .collect();
    if hex.is_empty() {
        return None;
    }
    i64::from_str_radix(&hex, 16).ok().filter(|v| *v >= 0)
}

pub(crate) async fn find_ca(
    state: &AppState,
    ca: &str,
) -> Result<certificate_authority::Model, ApiError> {
    state
        .store
        .find_ca(ca)
        .await
        .map_err(issuance_error)?
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("{}: CA not found.", ca),
            )
        })
}

/// List certificate authorities
#[utoipa::path(
    get,
    path = "/api/cas",
    responses(
        (status = 200, description = "All authorities", body = CaList),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "authorities"
)]
pub async fn list_cas(State(state): State<Arc<AppState>>) -> Result<Json<CaList>, ApiError> {
    let cas: Vec<CaInfo> = state
        .store
        .list_cas()
        .await
        .map_err(issuance_error)?
        .into_iter()
        .map(CaInfo::from)
        .collect();

    Ok(Json(CaList {
        total: cas.len(),
        cas,
    }))
}

/// Get one certificate authority
#[utoipa::path(
    get,
    path = "/api/cas/{ca}",
    params(
        ("ca" = String, Path, description = "CA id or name")
    ),
    responses(
        (status = 200, description = "Authority found", body = CaInfo),
        (status = 404, description = "Unknown CA", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "authorities"
)]
pub async fn get_ca(
    State(state): State<Arc<AppState>>,
    Path(ca): Path<String>,
) -> Result<Json<CaInfo>, ApiError> {
    Ok(Json(find_ca(&state, &ca).await?.into()))
}

/// Submit a CSR for signing
///
/// The CA, CSR and policy are checked before the job is queued, so an
/// accepted request only fails later on transient or key errors.
#[utoipa::path(
    post,
    path = "/api/certificates",
    request_body = IssueCertificateRequest,
    responses(
        (status = 202, description = "Issuance queued", body = JobAccepted),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 404, description = "Unknown CA", body = ErrorResponse),
        (status = 422, description = "Rejected by policy", body = ErrorResponse),
        (status = 503, description = "Dependency unavailable", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "certificates"
)]
pub async fn issue_certificate(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<IssueCertificateRequest>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    let request_id = match req.request_id {
        Some(id) if id.trim().is_empty() || id.len() > MAX_REQUEST_ID_LEN => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST_ID",
                format!("request_id must be 1-{} characters", MAX_REQUEST_ID_LEN),
            ));
        }
        Some(id) => id,
        None => uuid::Uuid::new_v4().to_string(),
    };

    let ca = find_ca(&state, &req.ca).await?;
    let csr = ParsedCsr::parse(req.csr_pem.as_bytes())
        .map_err(|e| issuance_error(IssuanceError::from(e)))?;
    state
        .config
        .policy
        .evaluate(
            &CaWindow {
                active: ca.status == CaStatus::Active,
                not_before: ca.not_before,
                not_after: ca.not_after,
            },
            csr.common_name.as_deref(),
            &csr.dns_names,
            &req.profile,
            Utc::now(),
        )
        .map_err(|violation| issuance_error(violation.into()))?;

    let enqueued = state
        .queue
        .enqueue(&Job::Issue {
            ca_id: ca.id.clone(),
            csr_pem: req.csr_pem,
            profile: req.profile,
            order_id: None,
            request_id: request_id.clone(),
        })
        .await
        .map_err(queue_error)?;

    info!(
        subject = %user.subject,
        ca = %ca.name,
        request_id = %request_id,
        job_id = %enqueued.job_id,
        "Issuance requested"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job_id: enqueued.job_id,
            created: enqueued.created,
            request_id: Some(request_id),
        }),
    ))
}

/// List certificates
#[utoipa::path(
    get,
    path = "/api/certificates",
    params(CertificateQuery),
    responses(
        (status = 200, description = "Matching certificates", body = CertificateList),
        (status = 400, description = "Invalid filter", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "certificates"
)]
pub async fn list_certificates(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CertificateQuery>,
) -> Result<Json<CertificateList>, ApiError> {
    debug!("Listing certificates: {:?}", query);

    let ca_id = match &query.ca {
        Some(ca) => Some(find_ca(&state, ca).await?.id),
        None => None,
    };
    let status = match query.status.as_deref() {
        None => None,
        Some("valid") => Some(CertificateStatus::Valid),
        Some("revoked") => Some(CertificateStatus::Revoked),
        Some("expired") => Some(CertificateStatus::Expired),
        Some(other) => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "INVALID_STATUS",
                format!("Unknown status '{}'", other),
            ))
        }
    };

    let (rows, total) = state
        .store
        .list_certificates(&CertificateFilter {
            ca_id,
            status,
            limit: query.limit.unwrap_or(0),
            offset: query.offset.unwrap_or(0),
        })
        .await
        .map_err(issuance_error)?;

    Ok(Json(CertificateList {
        certificates: rows.into_iter().map(CertificateInfo::from).collect(),
        total,
    }))
}

/// Get one certificate by serial
#[utoipa::path(
    get,
    path = "/api/certificates/{ca}/{serial}",
    params(
        ("ca" = String, Path, description = "CA id or name"),
        ("serial" = String, Path, description = "Hex serial, e.g. 2A or 01:00")
    ),
    responses(
        (status = 200, description = "Certificate found", body = CertificateInfo),
        (status = 400, description = "Invalid serial", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "certificates"
)]
pub async fn get_certificate(
    State(state): State<Arc<AppState>>,
    Path((ca, serial)): Path<(String, String)>,
) -> Result<Json<CertificateInfo>, ApiError> {
    let serial_value = path_serial(&serial).ok_or_else(|| {
        api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_SERIAL",
            format!("{}: Invalid serial.", serial),
        )
    })?;
    let ca = find_ca(&state, &ca).await?;

    let certificate = state
        .store
        .get_certificate(&ca.id, serial_value)
        .await
        .map_err(issuance_error)?
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("{}: Certificate not found.", serial),
            )
        })?;

    Ok(Json(certificate.into()))
}

/// Revoke a certificate
#[utoipa::path(
    post,
    path = "/api/certificates/{ca}/{serial}/revoke",
    params(
        ("ca" = String, Path, description = "CA id or name"),
        ("serial" = String, Path, description = "Hex serial")
    ),
    request_body = RevokeCertificateRequest,
    responses(
        (status = 202, description = "Revocation queued", body = JobAccepted),
        (status = 400, description = "Invalid serial or reason", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 409, description = "Already revoked or expired", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "certificates"
)]
pub async fn revoke_certificate(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path((ca, serial)): Path<(String, String)>,
    body: Bytes,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    let req: RevokeCertificateRequest = if body.is_empty() {
        RevokeCertificateRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            api_error(StatusCode::BAD_REQUEST, "INVALID_BODY", e.to_string())
        })?
    };
    let reason = match req.reason.as_deref() {
        None => RevocationReason::Unspecified,
        Some(name) => RevocationReason::parse(name).ok_or_else(|| {
            api_error(
                StatusCode::BAD_REQUEST,
                "INVALID_REASON",
                format!("Unknown revocation reason '{}'", name),
            )
        })?,
    };
    let serial_value = path_serial(&serial).ok_or_else(|| {
        api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_SERIAL",
            format!("{}: Invalid serial.", serial),
        )
    })?;
    let ca = find_ca(&state, &ca).await?;

    let certificate = state
        .store
        .get_certificate(&ca.id, serial_value)
        .await
        .map_err(issuance_error)?
        .ok_or_else(|| {
            issuance_error(IssuanceError::NotFound(format!(
                "{}: Certificate not found.",
                serial
            )))
        })?;
    match certificate.status {
        CertificateStatus::Valid => {}
        CertificateStatus::Revoked => {
            return Err(issuance_error(IssuanceError::AlreadyRevoked(
                certd_cert::format_serial(serial_value),
            )))
        }
        CertificateStatus::Expired => {
            return Err(issuance_error(IssuanceError::InvalidTransition(format!(
                "{}: Certificate has expired.",
                certd_cert::format_serial(serial_value)
            ))))
        }
    }

    let enqueued = state
        .queue
        .enqueue(&Job::Revoke {
            ca_id: ca.id.clone(),
            serial: serial_value,
            reason,
        })
        .await
        .map_err(queue_error)?;

    info!(
        subject = %user.subject,
        ca = %ca.name,
        serial = %certd_cert::format_serial(serial_value),
        reason = ?reason,
        job_id = %enqueued.job_id,
        "Revocation requested"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job_id: enqueued.job_id,
            created: enqueued.created,
            request_id: None,
        }),
    ))
}

/// Get job status
#[utoipa::path(
    get,
    path = "/api/jobs/{id}",
    params(
        ("id" = String, Path, description = "Job id")
    ),
    responses(
        (status = 200, description = "Job found", body = JobInfo),
        (status = 404, description = "Unknown job", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, ApiError> {
    let job = state
        .queue
        .get(&id)
        .await
        .map_err(queue_error)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "NOT_FOUND", format!("{}: Job not found.", id)))?;
    Ok(Json(job.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_serial() {
        assert_eq!(path_serial("2A"), Some(42));
        assert_eq!(path_serial("01:00"), Some(256));
        assert_eq!(path_serial("0x2a"), Some(42));
        assert_eq!(path_serial(""), None);
        assert_eq!(path_serial("zz"), None);
    }
}
