//! Control plane of the certd CA core
//!
//! Store, job queue, OCSP cache and the services built on them: the
//! Issuance Worker, the OCSP responder and the ACME server.
pub mod acme;
pub mod ca;
pub mod cache;
pub mod config;
pub mod error;
pub mod jobs;
pub mod ocsp;
pub mod queue;
pub mod readiness;
pub mod secret;
pub mod store;
pub mod validator;
pub mod worker;

pub use acme::{AcmeBody, AcmeError, AcmeResponse, AcmeService, AcmeStore, OrderMachine};
pub use ca::{init_ca, rotate_ocsp_key, InitCa};
pub use cache::{connect_cache, CacheError, CacheSlot, CachedResponse, MemoryStatusCache, StatusCache};
pub use config::{
    AcmeConfig, CertdConfig, ConfigError, CrlConfig, GatewayConfig, OcspConfig, WorkerConfig,
};
pub use error::{ErrorKind, IssuanceError};
pub use jobs::Job;
pub use ocsp::{OcspResponder, OcspSigner};
pub use queue::{ClaimedJob, DbJobQueue, Enqueued, FailOutcome, JobQueue, QueueError, RetryPolicy};
pub use readiness::{Readiness, ReadinessReport, WorkerHealth};
pub use secret::{SecretError, SharedSecret};
pub use store::{CaStore, CertificateFilter, SerialRecord};
pub use validator::{ChallengeRequest, ChallengeValidator, NetworkValidator, ValidationError};
pub use worker::IssuanceWorker;
