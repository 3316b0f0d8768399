use serde::Serialize;
use thiserror::Error;

use crate::error::IssuanceError;

/// ACME protocol errors, rendered as RFC 7807 problem documents.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AcmeError {
    #[error("{0}")]
    Malformed(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Bad or expired nonce.")]
    BadNonce,

    #[error("{0}")]
    BadSignatureAlgorithm(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("Account does not exist.")]
    AccountDoesNotExist,

    #[error("{0}")]
    RejectedIdentifier(String),

    #[error("{0}")]
    OrderNotReady(String),

    #[error("{0}")]
    BadCsr(String),

    #[error("{0}")]
    BadRevocationReason(String),

    #[error("{0}")]
    AlreadyRevoked(String),

    #[error("Requests must use the application/jose+json content type.")]
    UnsupportedMediaType,

    #[error("{0}")]
    ServerInternal(String),
}

/// Problem document body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub detail: String,
    pub status: u16,
}

impl AcmeError {
    pub fn problem_type(&self) -> &'static str {
        match self {
            AcmeError::Malformed(_) | AcmeError::NotFound(_) | AcmeError::UnsupportedMediaType => {
                "urn:ietf:params:acme:error:malformed"
            }
            AcmeError::BadNonce => "urn:ietf:params:acme:error:badNonce",
            AcmeError::BadSignatureAlgorithm(_) => {
                "urn:ietf:params:acme:error:badSignatureAlgorithm"
            }
            AcmeError::Unauthorized(_) => "urn:ietf:params:acme:error:unauthorized",
            AcmeError::AccountDoesNotExist => "urn:ietf:params:acme:error:accountDoesNotExist",
            AcmeError::RejectedIdentifier(_) => "urn:ietf:params:acme:error:rejectedIdentifier",
            AcmeError::OrderNotReady(_) => "urn:ietf:params:acme:error:orderNotReady",
            AcmeError::BadCsr(_) => "urn:ietf:params:acme:error:badCSR",
            AcmeError::BadRevocationReason(_) => {
                "urn:ietf:params:acme:error:badRevocationReason"
            }
            AcmeError::AlreadyRevoked(_) => "urn:ietf:params:acme:error:alreadyRevoked",
            AcmeError::ServerInternal(_) => "urn:ietf:params:acme:error:serverInternal",
        }
    }

    /// HTTP status code of the problem response
    pub fn status(&self) -> u16 {
        match self {
            AcmeError::NotFound(_) => 404,
            AcmeError::Unauthorized(_) | AcmeError::OrderNotReady(_) => 403,
            AcmeError::UnsupportedMediaType => 415,
            AcmeError::ServerInternal(_) => 500,
            _ => 400,
        }
    }

    pub fn problem(&self) -> Problem {
        Problem {
            problem_type: self.problem_type().to_string(),
            detail: self.to_string(),
            status: self.status(),
        }
    }
}

impl From<IssuanceError> for AcmeError {
    fn from(err: IssuanceError) -> Self {
        match err {
            IssuanceError::PolicyViolation(v) => AcmeError::RejectedIdentifier(v.to_string()),
            IssuanceError::NotFound(msg) => AcmeError::NotFound(msg),
            IssuanceError::AlreadyRevoked(serial) => {
                AcmeError::AlreadyRevoked(format!("{}: Certificate is already revoked.", serial))
            }
            IssuanceError::InvalidTransition(msg) => AcmeError::Malformed(msg),
            other => AcmeError::ServerInternal(other.to_string()),
        }
    }
}

impl From<sea_orm::DbErr> for AcmeError {
    fn from(err: sea_orm::DbErr) -> Self {
        AcmeError::ServerInternal(format!("database: {}", err))
    }
}

impl From<crate::queue::QueueError> for AcmeError {
    fn from(err: crate::queue::QueueError) -> Self {
        AcmeError::ServerInternal(format!("queue: {}", err))
    }
}
