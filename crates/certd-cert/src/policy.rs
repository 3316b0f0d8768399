//! Issuance policy: what a CA is willing to sign.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejections that are final for a request. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("Must give at least a CN or one or more SANs.")]
    MissingSubject,

    #[error("Could not parse CommonName as subjectAlternativeName: {0}")]
    InvalidCommonName(String),

    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(String),

    #[error("Wildcard names are not allowed: {0}")]
    WildcardNotAllowed(String),

    #[error("Requested validity of {requested} days exceeds the maximum of {max} days.")]
    ValidityTooLong { requested: i64, max: i64 },

    #[error("Certificate would outlive CA, maximum expiry for this CA is {max_days} days.")]
    OutlivesCa { max_days: i64 },

    #[error("Certificate Authority is disabled.")]
    CaDisabled,

    #[error("Certificate Authority has expired.")]
    CaExpired,

    #[error("Certificate Authority is not yet valid.")]
    CaNotYetValid,

    #[error("Extended key usage not allowed: {0}")]
    ExtendedKeyUsageNotAllowed(String),

    #[error("Bad CSR: {0}")]
    BadCsr(String),
}

/// Extended key usages a profile may grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtendedKeyUsage {
    ServerAuth,
    ClientAuth,
    CodeSigning,
    EmailProtection,
    OcspSigning,
}

impl ExtendedKeyUsage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtendedKeyUsage::ServerAuth => "server_auth",
            ExtendedKeyUsage::ClientAuth => "client_auth",
            ExtendedKeyUsage::CodeSigning => "code_signing",
            ExtendedKeyUsage::EmailProtection => "email_protection",
            ExtendedKeyUsage::OcspSigning => "ocsp_signing",
        }
    }

    pub(crate) fn to_rcgen(self) -> rcgen::ExtendedKeyUsagePurpose {
        match self {
            ExtendedKeyUsage::ServerAuth => rcgen::ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsage::ClientAuth => rcgen::ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsage::CodeSigning => rcgen::ExtendedKeyUsagePurpose::CodeSigning,
            ExtendedKeyUsage::EmailProtection => rcgen::ExtendedKeyUsagePurpose::EmailProtection,
            ExtendedKeyUsage::OcspSigning => rcgen::ExtendedKeyUsagePurpose::OcspSigning,
        }
    }
}

/// Per-deployment issuance rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuancePolicy {
    /// Longest validity any certificate may request
    pub max_validity_days: i64,
    /// Validity used when a request does not specify one
    pub default_validity_days: i64,
    /// Copy the CN into the SAN list
    pub cn_in_san: bool,
    pub allow_wildcards: bool,
    pub allowed_extended_key_usages: Vec<ExtendedKeyUsage>,
    /// Granted when a request names no extended key usage
    pub default_extended_key_usages: Vec<ExtendedKeyUsage>,
    /// Backdating of notBefore to absorb client clock skew
    pub backdate_secs: i64,
}

impl Default for IssuancePolicy {
    fn default() -> Self {
        Self {
            max_validity_days: 397,
            default_validity_days: 90,
            cn_in_san: true,
            allow_wildcards: true,
            allowed_extended_key_usages: vec![
                ExtendedKeyUsage::ServerAuth,
                ExtendedKeyUsage::ClientAuth,
            ],
            default_extended_key_usages: vec![ExtendedKeyUsage::ServerAuth],
            backdate_secs: 300,
        }
    }
}

/// The CA state policy decisions depend on
#[derive(Debug, Clone)]
pub struct CaWindow {
    pub active: bool,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// What a caller asks for on top of the CSR
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileRequest {
    /// Overrides the CSR's CN when set
    pub common_name: Option<String>,
    /// Added to the CSR's SANs
    #[serde(default)]
    pub sans: Vec<String>,
    pub validity_days: Option<i64>,
    #[serde(default)]
    pub extended_key_usages: Vec<ExtendedKeyUsage>,
}

/// A request that passed policy, ready to be signed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovedProfile {
    pub common_name: Option<String>,
    pub sans: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub extended_key_usages: Vec<ExtendedKeyUsage>,
}

impl IssuancePolicy {
    /// Check a request against this policy and the issuing CA.
    ///
    /// `csr_common_name` and `csr_sans` come from the parsed CSR.
    pub fn evaluate(
        &self,
        ca: &CaWindow,
        csr_common_name: Option<&str>,
        csr_sans: &[String],
        request: &ProfileRequest,
        now: DateTime<Utc>,
    ) -> Result<ApprovedProfile, PolicyViolation> {
        if !ca.active {
            return Err(PolicyViolation::CaDisabled);
        }
        if now >= ca.not_after {
            return Err(PolicyViolation::CaExpired);
        }
        if now < ca.not_before {
            return Err(PolicyViolation::CaNotYetValid);
        }

        let common_name = request
            .common_name
            .clone()
            .or_else(|| csr_common_name.map(str::to_string))
            .map(|cn| cn.trim().to_ascii_lowercase())
            .filter(|cn| !cn.is_empty());

        let mut sans: Vec<String> = Vec::new();
        for name in csr_sans.iter().chain(request.sans.iter()) {
            let name = name.trim().to_ascii_lowercase();
            self.check_dns_name(&name)?;
            if !sans.contains(&name) {
                sans.push(name);
            }
        }

        if let Some(cn) = &common_name {
            if self.cn_in_san {
                self.check_dns_name(cn)
                    .map_err(|_| PolicyViolation::InvalidCommonName(cn.clone()))?;
                if !sans.contains(cn) {
                    sans.insert(0, cn.clone());
                }
            }
        }

        if common_name.is_none() && sans.is_empty() {
            return Err(PolicyViolation::MissingSubject);
        }

        let validity_days = request.validity_days.unwrap_or(self.default_validity_days);
        if validity_days <= 0 || validity_days > self.max_validity_days {
            return Err(PolicyViolation::ValidityTooLong {
                requested: validity_days,
                max: self.max_validity_days,
            });
        }

        let not_after = now + Duration::days(validity_days);
        if not_after > ca.not_after {
            return Err(PolicyViolation::OutlivesCa {
                max_days: (ca.not_after - now).num_days(),
            });
        }
        let not_before = (now - Duration::seconds(self.backdate_secs)).max(ca.not_before);

        let extended_key_usages = if request.extended_key_usages.is_empty() {
            self.default_extended_key_usages.clone()
        } else {
            request.extended_key_usages.clone()
        };
        for eku in &extended_key_usages {
            if !self.allowed_extended_key_usages.contains(eku) {
                return Err(PolicyViolation::ExtendedKeyUsageNotAllowed(
                    eku.as_str().to_string(),
                ));
            }
        }

        Ok(ApprovedProfile {
            common_name,
            sans,
            not_before,
            not_after,
            extended_key_usages,
        })
    }

    /// Hostname rules, applied to every SAN and to ACME identifiers.
    pub fn check_dns_name(&self, name: &str) -> Result<(), PolicyViolation> {
        let bare = match name.strip_prefix("*.") {
            Some(rest) => {
                if !self.allow_wildcards {
                    return Err(PolicyViolation::WildcardNotAllowed(name.to_string()));
                }
                rest
            }
            None => name,
        };
        if is_valid_hostname(bare) {
            Ok(())
        } else {
            Err(PolicyViolation::InvalidDnsName(name.to_string()))
        }
    }
}

/// Syntax check for a (non-wildcard) DNS hostname.
pub fn is_valid_hostname(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 || name.ends_with('.') {
        return false;
    }
    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ca(days: i64) -> CaWindow {
        let now = Utc::now();
        CaWindow {
            active: true,
            not_before: now - Duration::days(1),
            not_after: now + Duration::days(days),
        }
    }

    #[test]
    fn test_hostname_rules() {
        assert!(is_valid_hostname("example.com"));
        assert!(is_valid_hostname("a-b.example.co.uk"));
        assert!(!is_valid_hostname("localhost"));
        assert!(!is_valid_hostname("-bad.example.com"));
        assert!(!is_valid_hostname("bad-.example.com"));
        assert!(!is_valid_hostname("ex ample.com"));
        assert!(!is_valid_hostname("example..com"));
        assert!(!is_valid_hostname(&format!("{}.com", "a".repeat(64))));
    }

    #[test]
    fn test_cn_copied_into_sans() {
        let policy = IssuancePolicy::default();
        let approved = policy
            .evaluate(
                &ca(3650),
                Some("Example.COM"),
                &["www.example.com".to_string()],
                &ProfileRequest::default(),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(approved.common_name.as_deref(), Some("example.com"));
        assert_eq!(approved.sans, vec!["example.com", "www.example.com"]);
        assert_eq!(
            approved.extended_key_usages,
            vec![ExtendedKeyUsage::ServerAuth]
        );
    }

    #[test]
    fn test_missing_subject() {
        let policy = IssuancePolicy::default();
        let err = policy
            .evaluate(&ca(3650), None, &[], &ProfileRequest::default(), Utc::now())
            .unwrap_err();
        assert_eq!(err, PolicyViolation::MissingSubject);
    }

    #[test]
    fn test_invalid_cn_with_cn_in_san() {
        let policy = IssuancePolicy::default();
        let err = policy
            .evaluate(
                &ca(3650),
                Some("not a hostname"),
                &[],
                &ProfileRequest::default(),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, PolicyViolation::InvalidCommonName(_)));

        let relaxed = IssuancePolicy {
            cn_in_san: false,
            ..IssuancePolicy::default()
        };
        assert!(relaxed
            .evaluate(
                &ca(3650),
                Some("not a hostname"),
                &[],
                &ProfileRequest::default(),
                Utc::now(),
            )
            .is_ok());
    }

    #[test]
    fn test_outlives_ca() {
        let policy = IssuancePolicy::default();
        let err = policy
            .evaluate(
                &ca(30),
                Some("example.com"),
                &[],
                &ProfileRequest::default(),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, PolicyViolation::OutlivesCa { max_days } if max_days <= 30));
        assert!(err.to_string().starts_with("Certificate would outlive CA"));
    }

    #[test]
    fn test_validity_limit() {
        let policy = IssuancePolicy::default();
        let request = ProfileRequest {
            validity_days: Some(1000),
            ..ProfileRequest::default()
        };
        let err = policy
            .evaluate(&ca(3650), Some("example.com"), &[], &request, Utc::now())
            .unwrap_err();
        assert!(matches!(err, PolicyViolation::ValidityTooLong { .. }));
    }

    #[test]
    fn test_wildcards() {
        let policy = IssuancePolicy::default();
        assert!(policy.check_dns_name("*.example.com").is_ok());
        assert!(policy.check_dns_name("foo.*.example.com").is_err());

        let strict = IssuancePolicy {
            allow_wildcards: false,
            ..IssuancePolicy::default()
        };
        assert!(matches!(
            strict.check_dns_name("*.example.com"),
            Err(PolicyViolation::WildcardNotAllowed(_))
        ));
    }

    #[test]
    fn test_ca_state() {
        let policy = IssuancePolicy::default();
        let mut window = ca(3650);
        window.active = false;
        assert_eq!(
            policy
                .evaluate(&window, Some("example.com"), &[], &ProfileRequest::default(), Utc::now())
                .unwrap_err(),
            PolicyViolation::CaDisabled
        );

        let now = Utc::now();
        let expired = CaWindow {
            active: true,
            not_before: now - Duration::days(10),
            not_after: now - Duration::days(1),
        };
        assert_eq!(
            policy
                .evaluate(&expired, Some("example.com"), &[], &ProfileRequest::default(), now)
                .unwrap_err(),
            PolicyViolation::CaExpired
        );
    }

    #[test]
    fn test_eku_restrictions() {
        let policy = IssuancePolicy::default();
        let request = ProfileRequest {
            extended_key_usages: vec![ExtendedKeyUsage::CodeSigning],
            ..ProfileRequest::default()
        };
        assert!(matches!(
            policy.evaluate(&ca(3650), Some("example.com"), &[], &request, Utc::now()),
            Err(PolicyViolation::ExtendedKeyUsageNotAllowed(_))
        ));
    }
}
