//! Certificate material for the CA core
//!
//! Key Store access through exclusive signing leases, CSR intake,
//! issuance policy and certificate construction.

pub mod builder;
pub mod csr;
pub mod error;
pub mod keystore;
pub mod policy;
pub mod serial;

pub use builder::{
    create_root_ca, inspect_certificate, issue_leaf, issue_ocsp_responder, IssuedCertificate,
    RootCaParams,
};
pub use csr::{to_pem, ParsedCsr};
pub use error::{CertError, KeyError};
pub use keystore::{FileKeyStore, KeyStore, MemoryKeyStore, SigningLease};
pub use policy::{
    is_valid_hostname, ApprovedProfile, CaWindow, ExtendedKeyUsage, IssuancePolicy,
    PolicyViolation, ProfileRequest,
};
pub use serial::{format_serial, parse_serial};
