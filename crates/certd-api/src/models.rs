//! Request and response bodies of the management API

use certd_control::ReadinessReport;
use certd_db::entities::{certificate, certificate_authority, job};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Whether the same request may succeed later
    #[serde(default)]
    pub retryable: bool,
}

/// Liveness response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Readiness of the process and its dependencies
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReadyResponse {
    pub ready: bool,
    pub database: bool,
    pub cache: bool,
    pub queue: bool,
    /// Only reported by Worker processes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<bool>,
}

impl From<ReadinessReport> for ReadyResponse {
    fn from(report: ReadinessReport) -> Self {
        Self {
            ready: report.ready,
            database: report.database,
            cache: report.cache,
            queue: report.queue,
            worker: report.worker,
        }
    }
}

/// Certificate authority summary
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CaInfo {
    pub id: String,
    pub name: String,
    pub subject: String,
    /// "active" or "disabled"
    pub status: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub acme_enabled: bool,
    /// Generation of the delegated OCSP responder key
    pub key_generation: i32,
    /// PEM-encoded CA certificate
    pub certificate_pem: String,
}

impl From<certificate_authority::Model> for CaInfo {
    fn from(ca: certificate_authority::Model) -> Self {
        Self {
            status: match ca.status {
                certificate_authority::CaStatus::Active => "active".to_string(),
                certificate_authority::CaStatus::Disabled => "disabled".to_string(),
            },
            id: ca.id,
            name: ca.name,
            subject: ca.subject,
            not_before: ca.not_before,
            not_after: ca.not_after,
            acme_enabled: ca.acme_enabled,
            key_generation: ca.key_generation,
            certificate_pem: ca.cert_pem,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CaList {
    pub cas: Vec<CaInfo>,
    pub total: usize,
}

/// Issued certificate
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CertificateInfo {
    pub id: String,
    pub ca_id: String,
    /// Colon-separated hex, e.g. `2A` or `01:00`
    pub serial: String,
    pub common_name: Option<String>,
    pub sans: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// "valid", "revoked" or "expired"
    pub status: String,
    pub certificate_pem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<certificate::Model> for CertificateInfo {
    fn from(cert: certificate::Model) -> Self {
        Self {
            serial: certd_cert::format_serial(cert.serial),
            sans: cert.san_list(),
            status: cert.status.as_str().to_string(),
            id: cert.id,
            ca_id: cert.ca_id,
            common_name: cert.common_name,
            not_before: cert.not_before,
            not_after: cert.not_after,
            certificate_pem: cert.cert_pem,
            order_id: cert.order_id,
            created_at: cert.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CertificateList {
    pub certificates: Vec<CertificateInfo>,
    pub total: u64,
}

/// Revocation list selection
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CrlQuery {
    /// "full" (default), "ca" or "user"
    pub scope: Option<String>,
    /// "der" or "pem"; overrides the Accept header
    pub encoding: Option<String>,
}

/// Certificate listing filters
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CertificateQuery {
    /// CA id or name
    pub ca: Option<String>,
    /// "valid", "revoked" or "expired"
    pub status: Option<String>,
    /// Page size (default 50, max 500)
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Certificate signing request submission
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct IssueCertificateRequest {
    /// CA id or name
    pub ca: String,
    /// PEM-encoded PKCS#10 request
    pub csr_pem: String,
    /// Overrides on top of the CSR
    #[serde(default)]
    #[schema(value_type = Object)]
    pub profile: certd_cert::ProfileRequest,
    /// Client-chosen id; resubmitting it never issues twice
    pub request_id: Option<String>,
}

/// Accepted asynchronous operation
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobAccepted {
    pub job_id: String,
    /// False when an earlier submission already covers this one
    pub created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct RevokeCertificateRequest {
    /// RFC 5280 reason name, e.g. `keyCompromise` (default `unspecified`)
    pub reason: Option<String>,
}

/// Job status
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobInfo {
    pub id: String,
    pub kind: String,
    /// queued, running, succeeded, failed, dead or superseded
    pub status: String,
    pub attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub result: Option<serde_json::Value>,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<job::Model> for JobInfo {
    fn from(job: job::Model) -> Self {
        Self {
            status: serde_json::to_value(job.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            result: job
                .result
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok()),
            id: job.id,
            kind: job.kind,
            attempts: job.attempts,
            last_error: job.last_error,
            error_kind: job.error_kind,
            available_at: job.available_at,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}
