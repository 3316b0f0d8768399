//! OCSP (RFC 6960) and CRL (RFC 5280) wire formats for certd
//!
//! This crate is pure encoding: it decodes requests from either HTTP
//! binding, computes issuer hashes, and builds signed responses and
//! revocation lists through a [`ResponseSigner`] so key material stays
//! with the caller.

pub mod aia;
pub mod asn1;
pub mod crl;
pub mod hashes;
pub mod request;
pub mod response;

use der::asn1::{Any, OctetString, Uint};
use der::{Encode, Tag};
use spki::AlgorithmIdentifierOwned;
use thiserror::Error;

pub use aia::{ocsp_aia_extension_value, OID_AUTHORITY_INFO_ACCESS};
pub use asn1::{CertId, OcspResponseStatus};
pub use crl::{crl_to_pem, CrlBuilder, CrlIssuer, CrlScope, DecodedCrl, RevokedEntry};
pub use hashes::{pem_to_der, HashAlgorithm, IssuerHashes};
pub use request::{serial_from_bytes, ParsedRequest, StatusQuery};
pub use response::{
    internal_error, malformed_request, status_only_response, try_later, unauthorized,
    DecodedResponse, ResponderIdentity, ResponseBuilder, ResponseSigner, SerialStatus,
};

/// OCSP encoding errors
#[derive(Debug, Error)]
pub enum OcspError {
    #[error("DER error: {0}")]
    Der(#[from] der::Error),

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Signing failed: {0}")]
    Signing(String),
}

/// Build the CertID identifying `serial` under `issuer`.
pub fn cert_id(issuer: &IssuerHashes, alg: HashAlgorithm, serial: i64) -> Result<CertId, OcspError> {
    let serial = u64::try_from(serial)
        .map_err(|_| OcspError::Encoding(format!("negative serial {}", serial)))?;
    Ok(CertId {
        hash_algorithm: AlgorithmIdentifierOwned {
            oid: alg.oid(),
            parameters: Some(Any::new(Tag::Null, Vec::<u8>::new())?),
        },
        issuer_name_hash: OctetString::new(issuer.name_hash(alg))?,
        issuer_key_hash: OctetString::new(issuer.key_hash(alg))?,
        serial_number: Uint::new(&serial.to_be_bytes())?,
    })
}

/// Encode an unsigned request for one serial, as a relying party would.
pub fn encode_request(
    issuer: &IssuerHashes,
    alg: HashAlgorithm,
    serial: i64,
    nonce: Option<Vec<u8>>,
) -> Result<Vec<u8>, OcspError> {
    let request_extensions = match nonce {
        Some(nonce) => Some(vec![asn1::Extension {
            extn_id: asn1::OID_OCSP_NONCE,
            critical: false,
            extn_value: OctetString::new(nonce)?,
        }]),
        None => None,
    };
    let request = asn1::OcspRequest {
        tbs_request: asn1::TbsRequest {
            version: None,
            requestor_name: None,
            request_list: vec![asn1::Request {
                req_cert: cert_id(issuer, alg, serial)?,
                single_request_extensions: None,
            }],
            request_extensions,
        },
        optional_signature: None,
    };
    Ok(request.to_der()?)
}
