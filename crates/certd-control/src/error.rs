use certd_cert::{CertError, KeyError, PolicyViolation};
use sea_orm::DbErr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classes of the control path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PolicyViolation,
    TransientDependency,
    KeyUnavailable,
    NotFound,
    AlreadyRevoked,
    /// Status change out of a terminal state
    InvalidTransition,
    DataConsistency,
    ExhaustedRetries,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PolicyViolation => "policy_violation",
            ErrorKind::TransientDependency => "transient_dependency",
            ErrorKind::KeyUnavailable => "key_unavailable",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyRevoked => "already_revoked",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::DataConsistency => "data_consistency",
            ErrorKind::ExhaustedRetries => "exhausted_retries",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Errors of issuance, revocation and status operations
#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("Policy violation: {0}")]
    PolicyViolation(#[from] PolicyViolation),

    #[error("Transient dependency failure: {0}")]
    TransientDependency(String),

    #[error("Signing key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}: Certificate is already revoked.")]
    AlreadyRevoked(String),

    #[error("{0}")]
    InvalidTransition(String),

    #[error("Data consistency violation: {0}")]
    DataConsistency(String),

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: i32, last_error: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IssuanceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IssuanceError::PolicyViolation(_) => ErrorKind::PolicyViolation,
            IssuanceError::TransientDependency(_) => ErrorKind::TransientDependency,
            IssuanceError::KeyUnavailable(_) => ErrorKind::KeyUnavailable,
            IssuanceError::NotFound(_) => ErrorKind::NotFound,
            IssuanceError::AlreadyRevoked(_) => ErrorKind::AlreadyRevoked,
            IssuanceError::InvalidTransition(_) => ErrorKind::InvalidTransition,
            IssuanceError::DataConsistency(_) => ErrorKind::DataConsistency,
            IssuanceError::ExhaustedRetries { .. } => ErrorKind::ExhaustedRetries,
            IssuanceError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a job failing with this error should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IssuanceError::TransientDependency(_) | IssuanceError::DataConsistency(_)
        )
    }
}

impl From<DbErr> for IssuanceError {
    fn from(err: DbErr) -> Self {
        IssuanceError::TransientDependency(format!("database: {}", err))
    }
}

impl From<KeyError> for IssuanceError {
    fn from(err: KeyError) -> Self {
        IssuanceError::KeyUnavailable(err.to_string())
    }
}

impl From<CertError> for IssuanceError {
    fn from(err: CertError) -> Self {
        match err {
            CertError::Key(key) => key.into(),
            CertError::UnknownCsrFormat(msg) => {
                IssuanceError::PolicyViolation(PolicyViolation::BadCsr(msg))
            }
            CertError::CsrSignature => IssuanceError::PolicyViolation(PolicyViolation::BadCsr(
                "signature verification failed".to_string(),
            )),
            other => IssuanceError::Internal(other.to_string()),
        }
    }
}

impl From<certd_ocsp::OcspError> for IssuanceError {
    fn from(err: certd_ocsp::OcspError) -> Self {
        match err {
            certd_ocsp::OcspError::Signing(msg) => IssuanceError::KeyUnavailable(msg),
            other => IssuanceError::Internal(other.to_string()),
        }
    }
}

impl From<crate::cache::CacheError> for IssuanceError {
    fn from(err: crate::cache::CacheError) -> Self {
        IssuanceError::TransientDependency(format!("cache: {}", err))
    }
}

impl From<crate::queue::QueueError> for IssuanceError {
    fn from(err: crate::queue::QueueError) -> Self {
        IssuanceError::TransientDependency(format!("queue: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(IssuanceError::TransientDependency("db".into()).is_retryable());
        assert!(IssuanceError::DataConsistency("skew".into()).is_retryable());
        assert!(!IssuanceError::PolicyViolation(PolicyViolation::MissingSubject).is_retryable());
        assert!(!IssuanceError::KeyUnavailable("gone".into()).is_retryable());
        assert!(!IssuanceError::NotFound("x".into()).is_retryable());
        assert!(!IssuanceError::InvalidTransition("expired".into()).is_retryable());
    }

    #[test]
    fn test_conversions() {
        let err: IssuanceError = CertError::CsrSignature.into();
        assert_eq!(err.kind(), ErrorKind::PolicyViolation);

        let err: IssuanceError = CertError::Key(KeyError::NotFound("ca".into())).into();
        assert_eq!(err.kind(), ErrorKind::KeyUnavailable);

        let err: IssuanceError = DbErr::Custom("down".into()).into();
        assert_eq!(err.kind(), ErrorKind::TransientDependency);
    }

    #[test]
    fn test_already_revoked_message() {
        let err = IssuanceError::AlreadyRevoked("2A".into());
        assert_eq!(err.to_string(), "2A: Certificate is already revoked.");
    }
}
