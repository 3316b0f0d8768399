//! ACME challenge validation against the outside world.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use certd_db::entities::acme_challenge::ChallengeType;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("DNS lookup failed: {0}")]
    Dns(String),

    #[error("{0}")]
    Mismatch(String),
}

impl ValidationError {
    /// RFC 8555 problem type for the challenge error.
    pub fn problem_type(&self) -> &'static str {
        match self {
            ValidationError::Connection(_) => "urn:ietf:params:acme:error:connection",
            ValidationError::Dns(_) => "urn:ietf:params:acme:error:dns",
            ValidationError::Mismatch(_) => "urn:ietf:params:acme:error:incorrectResponse",
        }
    }
}

/// What must be proven for one challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRequest {
    pub challenge_type: ChallengeType,
    /// DNS identifier, without any wildcard prefix
    pub identifier: String,
    pub token: String,
    /// `token || '.' || thumbprint(accountKey)`
    pub key_authorization: String,
}

#[async_trait]
pub trait ChallengeValidator: Send + Sync {
    async fn validate(&self, request: &ChallengeRequest) -> Result<(), ValidationError>;
}

/// HTTP-01 over plain HTTP and DNS-01 over TXT lookups.
pub struct NetworkValidator {
    client: reqwest::Client,
    http_port: u16,
}

impl NetworkValidator {
    pub fn new(timeout: Duration, http_port: u16) -> Result<Self, ValidationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| ValidationError::Connection(e.to_string()))?;
        Ok(Self { client, http_port })
    }

    async fn validate_http01(&self, request: &ChallengeRequest) -> Result<(), ValidationError> {
        let url = if self.http_port == 80 {
            format!(
                "http://{}/.well-known/acme-challenge/{}",
                request.identifier, request.token
            )
        } else {
            format!(
                "http://{}:{}/.well-known/acme-challenge/{}",
                request.identifier, self.http_port, request.token
            )
        };
        debug!(url = %url, "Validating http-01 challenge");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ValidationError::Connection(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ValidationError::Mismatch(format!(
                "{} returned HTTP {}",
                url,
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| ValidationError::Connection(e.to_string()))?;
        if body.trim() == request.key_authorization {
            Ok(())
        } else {
            Err(ValidationError::Mismatch(format!(
                "key authorization mismatch at {}",
                url
            )))
        }
    }

    async fn validate_dns01(&self, request: &ChallengeRequest) -> Result<(), ValidationError> {
        use hickory_resolver::TokioAsyncResolver;

        let expected = dns01_txt_value(&request.key_authorization);
        let name = format!("_acme-challenge.{}.", request.identifier);
        debug!(name = %name, "Validating dns-01 challenge");

        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| ValidationError::Dns(e.to_string()))?;
        let response = resolver
            .txt_lookup(name.as_str())
            .await
            .map_err(|e| ValidationError::Dns(e.to_string()))?;

        for record in response.iter() {
            if record.to_string() == expected {
                return Ok(());
            }
        }
        Err(ValidationError::Mismatch(format!(
            "no TXT record at {} matches the key authorization",
            name
        )))
    }
}

#[async_trait]
impl ChallengeValidator for NetworkValidator {
    async fn validate(&self, request: &ChallengeRequest) -> Result<(), ValidationError> {
        match request.challenge_type {
            ChallengeType::Http01 => self.validate_http01(request).await,
            ChallengeType::Dns01 => self.validate_dns01(request).await,
        }
    }
}

/// TXT value for DNS-01: base64url(SHA-256(key authorization)).
pub fn dns01_txt_value(key_authorization: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns01_txt_value() {
        // RFC 8555 section 8.4 style digest, 32 bytes base64url without padding
        let value = dns01_txt_value("token.thumbprint");
        assert_eq!(value.len(), 43);
        assert!(!value.contains('='));
        assert_eq!(value, dns01_txt_value("token.thumbprint"));
    }

    #[tokio::test]
    async fn test_http01_connection_failure() {
        let validator = NetworkValidator::new(Duration::from_millis(500), 9).unwrap();
        let result = validator
            .validate(&ChallengeRequest {
                challenge_type: ChallengeType::Http01,
                identifier: "127.0.0.1".to_string(),
                token: "abc".to_string(),
                key_authorization: "abc.def".to_string(),
            })
            .await;
        assert!(matches!(result, Err(ValidationError::Connection(_))));
    }
}
