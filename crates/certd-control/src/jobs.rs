//! Job payloads carried by the queue.

use certd_cert::ProfileRequest;
use certd_db::entities::revocation::RevocationReason;
use serde::{Deserialize, Serialize};

/// Every unit of asynchronous work.
///
/// The variant name is the handler registry key; see [`Job::kind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Job {
    /// Sign a certificate for a CSR
    Issue {
        ca_id: String,
        csr_pem: String,
        #[serde(default)]
        profile: ProfileRequest,
        /// ACME order being finalized, if any
        order_id: Option<String>,
        /// Stable id making replays idempotent
        request_id: String,
    },
    Revoke {
        ca_id: String,
        serial: i64,
        reason: RevocationReason,
    },
    /// Re-sign the OCSP response of one serial
    RefreshOcsp {
        ca_id: String,
        serial: i64,
        status_version: i64,
        key_generation: i32,
    },
    /// Re-sign every revocation list of a CA
    PublishCrl {
        ca_id: String,
        /// Unix milliseconds of the request; newer requests supersede queued ones
        bucket: i64,
    },
    /// Enqueue refreshes for every live certificate and stale CRL
    RefreshAll { bucket: i64 },
    ExpirySweep { bucket: i64 },
    ValidateChallenge { challenge_id: String },
}

impl Job {
    pub const ISSUE: &'static str = "issue";
    pub const REVOKE: &'static str = "revoke";
    pub const REFRESH_OCSP: &'static str = "refresh_ocsp";
    pub const PUBLISH_CRL: &'static str = "publish_crl";
    pub const REFRESH_ALL: &'static str = "refresh_all";
    pub const EXPIRY_SWEEP: &'static str = "expiry_sweep";
    pub const VALIDATE_CHALLENGE: &'static str = "validate_challenge";

    pub fn kind(&self) -> &'static str {
        match self {
            Job::Issue { .. } => Self::ISSUE,
            Job::Revoke { .. } => Self::REVOKE,
            Job::RefreshOcsp { .. } => Self::REFRESH_OCSP,
            Job::PublishCrl { .. } => Self::PUBLISH_CRL,
            Job::RefreshAll { .. } => Self::REFRESH_ALL,
            Job::ExpirySweep { .. } => Self::EXPIRY_SWEEP,
            Job::ValidateChallenge { .. } => Self::VALIDATE_CHALLENGE,
        }
    }

    /// Key under which duplicate submissions collapse into one job.
    pub fn idempotency_key(&self) -> String {
        match self {
            Job::Issue { request_id, .. } => format!("issue:{}", request_id),
            Job::Revoke { ca_id, serial, .. } => format!("revoke:{}:{}", ca_id, serial),
            Job::RefreshOcsp {
                ca_id,
                serial,
                status_version,
                key_generation,
            } => format!(
                "refresh:{}:{}:v{}:g{}",
                ca_id, serial, status_version, key_generation
            ),
            Job::PublishCrl { ca_id, bucket } => format!("crl:{}:{}", ca_id, bucket),
            Job::RefreshAll { bucket } => format!("refresh_all:{}", bucket),
            Job::ExpirySweep { bucket } => format!("expiry_sweep:{}", bucket),
            Job::ValidateChallenge { challenge_id } => format!("validate:{}", challenge_id),
        }
    }

    /// Subject and version used to supersede older queued jobs.
    pub fn subject(&self) -> Option<(String, i64)> {
        match self {
            Job::RefreshOcsp {
                ca_id,
                serial,
                status_version,
                key_generation,
            } => Some((
                format!("{}:{}", ca_id, serial),
                version_stamp(*status_version, *key_generation),
            )),
            Job::PublishCrl { ca_id, bucket } => Some((format!("crl:{}", ca_id), *bucket)),
            _ => None,
        }
    }

    /// Whether a finished job with the same key may run again.
    pub fn is_rerunnable(&self) -> bool {
        matches!(self, Job::RefreshOcsp { .. } | Job::PublishCrl { .. })
    }

    /// Whether the handler needs a signing key.
    pub fn needs_signing(&self) -> bool {
        matches!(
            self,
            Job::Issue { .. } | Job::Revoke { .. } | Job::RefreshOcsp { .. } | Job::PublishCrl { .. }
        )
    }
}

/// Orders `(key_generation, status_version)` in one integer.
pub fn version_stamp(status_version: i64, key_generation: i32) -> i64 {
    ((key_generation as i64) << 32) | (status_version & 0xffff_ffff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_tag() {
        let job = Job::Revoke {
            ca_id: "ca".to_string(),
            serial: 42,
            reason: RevocationReason::KeyCompromise,
        };
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"type\":\"revoke\""));
        assert!(json.contains("\"reason\":\"key_compromise\""));
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
        assert_eq!(back.kind(), Job::REVOKE);
    }

    #[test]
    fn test_refresh_keys_and_ordering() {
        let older = Job::RefreshOcsp {
            ca_id: "ca".into(),
            serial: 5,
            status_version: 1,
            key_generation: 1,
        };
        let newer = Job::RefreshOcsp {
            ca_id: "ca".into(),
            serial: 5,
            status_version: 2,
            key_generation: 1,
        };
        assert_eq!(older.idempotency_key(), "refresh:ca:5:v1:g1");
        let (subject, v1) = older.subject().unwrap();
        let (_, v2) = newer.subject().unwrap();
        assert_eq!(subject, "ca:5");
        assert!(v2 > v1);
        assert!(version_stamp(1, 2) > version_stamp(100, 1));
    }

    #[test]
    fn test_crl_requests_supersede_by_time() {
        let older = Job::PublishCrl {
            ca_id: "ca".into(),
            bucket: 100,
        };
        let newer = Job::PublishCrl {
            ca_id: "ca".into(),
            bucket: 160,
        };
        assert_eq!(older.idempotency_key(), "crl:ca:100");
        assert_eq!(older.subject(), Some(("crl:ca".to_string(), 100)));
        assert!(newer.subject().unwrap().1 > older.subject().unwrap().1);
        assert!(older.is_rerunnable());
        assert!(older.needs_signing());
    }
}
