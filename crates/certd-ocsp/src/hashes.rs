//! Issuer hashes used to match CertIDs against known authorities.

use sha1::{Digest as _, Sha1};
use sha2::Sha256;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::asn1::{OID_SHA1, OID_SHA256};
use crate::OcspError;
use der::asn1::ObjectIdentifier;

/// Hash algorithms accepted in a CertID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub fn from_oid(oid: &ObjectIdentifier) -> Option<Self> {
        if *oid == OID_SHA1 {
            Some(HashAlgorithm::Sha1)
        } else if *oid == OID_SHA256 {
            Some(HashAlgorithm::Sha256)
        } else {
            None
        }
    }

    pub fn oid(&self) -> ObjectIdentifier {
        match self {
            HashAlgorithm::Sha1 => OID_SHA1,
            HashAlgorithm::Sha256 => OID_SHA256,
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

/// Raw issuer material a CertID is computed from.
///
/// `name_der` is the DER encoding of the issuer's subject Name and
/// `public_key` the contents of its subjectPublicKey BIT STRING.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuerHashes {
    name_der: Vec<u8>,
    public_key: Vec<u8>,
}

impl IssuerHashes {
    /// Extract issuer material from a DER certificate.
    pub fn from_certificate_der(der: &[u8]) -> Result<Self, OcspError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| OcspError::Certificate(e.to_string()))?;
        Ok(Self {
            name_der: cert.tbs_certificate.subject.as_raw().to_vec(),
            public_key: cert.public_key().subject_public_key.data.to_vec(),
        })
    }

    /// Extract issuer material from a PEM certificate.
    pub fn from_certificate_pem(pem: &str) -> Result<Self, OcspError> {
        let der = pem_to_der(pem)?;
        Self::from_certificate_der(&der)
    }

    pub fn name_hash(&self, alg: HashAlgorithm) -> Vec<u8> {
        alg.digest(&self.name_der)
    }

    pub fn key_hash(&self, alg: HashAlgorithm) -> Vec<u8> {
        alg.digest(&self.public_key)
    }

    /// SHA-1 key hash, the form used for `ResponderID.byKey`.
    pub fn sha1_key_hash(&self) -> Vec<u8> {
        self.key_hash(HashAlgorithm::Sha1)
    }

    /// Whether a CertID's issuer fields were computed from this issuer.
    pub fn matches(&self, alg: HashAlgorithm, name_hash: &[u8], key_hash: &[u8]) -> bool {
        self.name_hash(alg) == name_hash && self.key_hash(alg) == key_hash
    }
}

/// Decode the first PEM block of a certificate.
pub fn pem_to_der(pem: &str) -> Result<Vec<u8>, OcspError> {
    let (_, block) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| OcspError::Certificate(e.to_string()))?;
    Ok(block.contents)
}
