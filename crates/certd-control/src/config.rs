//! Immutable process configuration.
//!
//! Built once at startup from a YAML file plus CLI/env overrides, then
//! shared read-only with every component.

use std::path::{Path, PathBuf};
use std::time::Duration;

use certd_cert::IssuancePolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertdConfig {
    /// Persistent Store connection string
    pub database_url: String,
    /// `memory://` or `redis://host:port`
    pub cache_url: String,
    /// Shared secret file; must exist and be non-empty
    pub secret_file: PathBuf,
    /// Directory holding CA and OCSP keys as `<key_ref>.pem`
    pub key_dir: PathBuf,
    /// Public base URL of the gateway, used in ACME URLs
    pub external_url: String,
    pub gateway: GatewayConfig,
    pub worker: WorkerConfig,
    pub ocsp: OcspConfig,
    pub crl: CrlConfig,
    pub acme: AcmeConfig,
    pub policy: IssuancePolicy,
}

impl Default for CertdConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./certd.db?mode=rwc".to_string(),
            cache_url: "memory://".to_string(),
            secret_file: PathBuf::from("./secret.key"),
            key_dir: PathBuf::from("./keys"),
            external_url: "http://localhost:8080".to_string(),
            gateway: GatewayConfig::default(),
            worker: WorkerConfig::default(),
            ocsp: OcspConfig::default(),
            crl: CrlConfig::default(),
            acme: AcmeConfig::default(),
            policy: IssuancePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: String,
    /// Gateway may sign OCSP responses with the delegated responder key.
    /// CA keys are never used by the gateway either way.
    pub sign_ocsp: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            sign_ocsp: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Jobs processed in parallel by one worker process
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    /// Visibility lease of a claimed job
    pub job_lease_secs: u64,
    /// Cross-process signing lease on a CA
    pub ca_lease_secs: u64,
    /// Attempts before a retryable job is dead-lettered
    pub max_attempts: i32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub ocsp_refresh_interval_secs: u64,
    pub expiry_sweep_interval_secs: u64,
    /// Liveness/readiness endpoint of the worker process
    pub health_bind: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 500,
            job_lease_secs: 60,
            ca_lease_secs: 30,
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            ocsp_refresh_interval_secs: 1_800,
            expiry_sweep_interval_secs: 3_600,
            health_bind: "0.0.0.0:8081".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_lease(&self) -> Duration {
        Duration::from_secs(self.job_lease_secs)
    }

    pub fn ca_lease(&self) -> Duration {
        Duration::from_secs(self.ca_lease_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcspConfig {
    /// nextUpdate - thisUpdate of every signed response
    pub validity_secs: i64,
    /// Oldest response (by thisUpdate) that may be served without tryLater
    pub staleness_window_secs: i64,
    /// Responses this close to going stale are refreshed in the background
    pub refresh_margin_secs: i64,
    /// Responder URL embedded in issued certificates (AIA)
    pub base_url: Option<String>,
    /// Lifetime of delegated responder certificates
    pub responder_validity_days: i64,
}

impl Default for OcspConfig {
    fn default() -> Self {
        Self {
            validity_secs: 86_400,
            staleness_window_secs: 43_200,
            refresh_margin_secs: 3_600,
            base_url: None,
            responder_validity_days: 90,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrlConfig {
    /// nextUpdate - thisUpdate of every published list
    pub validity_secs: i64,
    /// Lists this close to nextUpdate are republished by the refresh pass
    pub refresh_margin_secs: i64,
    /// `Cache-Control: max-age` on served lists, capped at nextUpdate
    pub max_age_secs: i64,
}

impl Default for CrlConfig {
    fn default() -> Self {
        Self {
            validity_secs: 86_400,
            refresh_margin_secs: 3_600,
            max_age_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcmeConfig {
    pub enabled: bool,
    /// CA name served at `/acme/directory`; first active ACME CA if unset
    pub default_ca: Option<String>,
    pub nonce_ttl_secs: i64,
    pub order_lifetime_secs: i64,
    pub authorization_lifetime_secs: i64,
    pub terms_of_service: Option<String>,
    pub website: Option<String>,
    /// Timeout of a single HTTP-01/DNS-01 validation attempt
    pub validation_timeout_secs: u64,
    /// Port used to reach HTTP-01 challenge responses
    pub http01_port: u16,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ca: None,
            nonce_ttl_secs: 3_600,
            order_lifetime_secs: 7 * 86_400,
            authorization_lifetime_secs: 7 * 86_400,
            terms_of_service: None,
            website: None,
            validation_timeout_secs: 10,
            http01_port: 80,
        }
    }
}

impl CertdConfig {
    /// Load and validate a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: CertdConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "worker.concurrency must be at least 1".to_string(),
            ));
        }
        if self.worker.max_attempts < 1 {
            return Err(ConfigError::Invalid(
                "worker.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.ocsp.validity_secs <= 0 {
            return Err(ConfigError::Invalid(
                "ocsp.validity_secs must be positive".to_string(),
            ));
        }
        if self.ocsp.staleness_window_secs <= 0
            || self.ocsp.staleness_window_secs > self.ocsp.validity_secs
        {
            return Err(ConfigError::Invalid(
                "ocsp.staleness_window_secs must be positive and not exceed ocsp.validity_secs"
                    .to_string(),
            ));
        }
        if self.ocsp.refresh_margin_secs < 0
            || self.ocsp.refresh_margin_secs >= self.ocsp.staleness_window_secs
        {
            return Err(ConfigError::Invalid(
                "ocsp.refresh_margin_secs must be smaller than ocsp.staleness_window_secs"
                    .to_string(),
            ));
        }
        if self.crl.validity_secs <= 0 {
            return Err(ConfigError::Invalid(
                "crl.validity_secs must be positive".to_string(),
            ));
        }
        if self.crl.refresh_margin_secs < 0
            || self.crl.refresh_margin_secs >= self.crl.validity_secs
        {
            return Err(ConfigError::Invalid(
                "crl.refresh_margin_secs must be smaller than crl.validity_secs".to_string(),
            ));
        }
        if self.crl.max_age_secs < 0 {
            return Err(ConfigError::Invalid(
                "crl.max_age_secs must not be negative".to_string(),
            ));
        }
        if self.policy.default_validity_days > self.policy.max_validity_days {
            return Err(ConfigError::Invalid(
                "policy.default_validity_days exceeds policy.max_validity_days".to_string(),
            ));
        }
        Ok(())
    }

    /// External URL without a trailing slash
    pub fn base_url(&self) -> &str {
        self.external_url.trim_end_matches('/')
    }
}
