//! Certificate Revocation Lists (RFC 5280 section 5), encoded with `der`.
//!
//! One CA publishes one list per [`CrlScope`]. Lists are signed with the
//! CA key through the same [`ResponseSigner`] seam as OCSP responses.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use der::asn1::{Any, BitString, GeneralizedTime, ObjectIdentifier, OctetString, Uint, UtcTime};
use der::{Choice, Decode, Encode, Sequence};
use sha1::{Digest as _, Sha1};
use spki::AlgorithmIdentifierOwned;
use x509_parser::prelude::{FromDer, ParsedExtension, X509Certificate};

use crate::asn1::{CrlReason, Extension, OID_ECDSA_WITH_SHA256};
use crate::request::serial_from_bytes;
use crate::response::ResponseSigner;
use crate::OcspError;

/// `id-ce-cRLNumber`
pub const OID_CRL_NUMBER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.20");
/// `id-ce-cRLReasons`
pub const OID_CRL_REASON: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.21");
/// `id-ce-issuingDistributionPoint`
pub const OID_ISSUING_DISTRIBUTION_POINT: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.5.29.28");
/// `id-ce-authorityKeyIdentifier`
pub const OID_AUTHORITY_KEY_IDENTIFIER: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.5.29.35");

/// `v2`, required once any extension is present
const CRL_VERSION_2: u8 = 1;

/// Which certificates a list covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrlScope {
    /// Every revoked certificate of the CA
    Full,
    /// Only revoked CA certificates (`onlyContainsCACerts`)
    Ca,
    /// Only revoked end-entity certificates (`onlyContainsUserCerts`)
    User,
}

impl CrlScope {
    pub const ALL: [CrlScope; 3] = [CrlScope::Full, CrlScope::Ca, CrlScope::User];

    pub fn as_str(&self) -> &'static str {
        match self {
            CrlScope::Full => "full",
            CrlScope::Ca => "ca",
            CrlScope::User => "user",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Some(CrlScope::Full),
            "ca" => Some(CrlScope::Ca),
            "user" => Some(CrlScope::User),
            _ => None,
        }
    }

    fn distribution_point(&self) -> Option<IssuingDistributionPoint> {
        match self {
            CrlScope::Full => None,
            CrlScope::Ca => Some(IssuingDistributionPoint {
                only_contains_user_certs: None,
                only_contains_ca_certs: Some(true),
            }),
            CrlScope::User => Some(IssuingDistributionPoint {
                only_contains_user_certs: Some(true),
                only_contains_ca_certs: None,
            }),
        }
    }
}

/// ```text
/// Time ::= CHOICE {
///      utcTime        UTCTime,
///      generalTime    GeneralizedTime }
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq, Choice)]
#[allow(missing_docs)]
pub enum Time {
    #[asn1(type = "UTCTime")]
    UtcTime(UtcTime),
    #[asn1(type = "GeneralizedTime")]
    GeneralTime(GeneralizedTime),
}

impl Time {
    /// UTCTime through 2049, GeneralizedTime after.
    pub fn from_unix(unix_seconds: i64) -> Result<Self, OcspError> {
        let secs = u64::try_from(unix_seconds)
            .map_err(|_| OcspError::Encoding(format!("time before epoch: {}", unix_seconds)))?;
        let duration = Duration::from_secs(secs);
        match UtcTime::from_unix_duration(duration) {
            Ok(time) => Ok(Time::UtcTime(time)),
            Err(_) => Ok(Time::GeneralTime(GeneralizedTime::from_unix_duration(
                duration,
            )?)),
        }
    }

    pub fn unix_seconds(&self) -> i64 {
        let duration = match self {
            Time::UtcTime(time) => time.to_unix_duration(),
            Time::GeneralTime(time) => time.to_unix_duration(),
        };
        duration.as_secs() as i64
    }
}

/// ```text
/// RevokedCert ::= SEQUENCE {
///     userCertificate         CertificateSerialNumber,
///     revocationDate          Time,
///     crlEntryExtensions      Extensions OPTIONAL }
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
#[allow(missing_docs)]
pub struct RevokedCert {
    pub serial_number: Uint,
    pub revocation_date: Time,
    pub crl_entry_extensions: Option<Vec<Extension>>,
}

/// ```text
/// TBSCertList  ::=  SEQUENCE  {
///      version                 Version OPTIONAL,
///      signature               AlgorithmIdentifier,
///      issuer                  Name,
///      thisUpdate              Time,
///      nextUpdate              Time OPTIONAL,
///      revokedCertificates     SEQUENCE OF RevokedCert OPTIONAL,
///      crlExtensions           [0]  EXPLICIT Extensions OPTIONAL }
/// ```
///
/// The issuer Name is carried as the raw DER of the CA's subject.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
#[allow(missing_docs)]
pub struct TbsCertList {
    pub version: Option<u8>,
    pub signature: AlgorithmIdentifierOwned,
    pub issuer: Any,
    pub this_update: Time,
    pub next_update: Option<Time>,
    pub revoked_certificates: Option<Vec<RevokedCert>>,
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT", optional = "true")]
    pub crl_extensions: Option<Vec<Extension>>,
}

/// ```text
/// CertificateList  ::=  SEQUENCE  {
///     tbsCertList          TBSCertList,
///     signatureAlgorithm   AlgorithmIdentifier,
///     signatureValue       BIT STRING }
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
#[allow(missing_docs)]
pub struct CertificateList {
    pub tbs_cert_list: TbsCertList,
    pub signature_algorithm: AlgorithmIdentifierOwned,
    pub signature: BitString,
}

/// ```text
/// IssuingDistributionPoint ::= SEQUENCE {
///      distributionPoint          [0] DistributionPointName OPTIONAL,
///      onlyContainsUserCerts      [1] BOOLEAN DEFAULT FALSE,
///      onlyContainsCACerts        [2] BOOLEAN DEFAULT FALSE,
///      ... }
/// ```
///
/// Only the two scope flags are produced.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
#[allow(missing_docs)]
pub struct IssuingDistributionPoint {
    #[asn1(context_specific = "1", tag_mode = "IMPLICIT", optional = "true")]
    pub only_contains_user_certs: Option<bool>,
    #[asn1(context_specific = "2", tag_mode = "IMPLICIT", optional = "true")]
    pub only_contains_ca_certs: Option<bool>,
}

/// ```text
/// AuthorityKeyIdentifier ::= SEQUENCE {
///      keyIdentifier             [0] KeyIdentifier           OPTIONAL,
///      ... }
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
#[allow(missing_docs)]
pub struct AuthorityKeyIdentifier {
    #[asn1(context_specific = "0", tag_mode = "IMPLICIT", optional = "true")]
    pub key_identifier: Option<OctetString>,
}

/// Issuer material a CRL is stamped with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrlIssuer {
    name_der: Vec<u8>,
    key_identifier: Vec<u8>,
}

impl CrlIssuer {
    /// Subject Name and key identifier of a CA certificate. The key
    /// identifier is the certificate's SubjectKeyIdentifier, or the SHA-1
    /// of its public key when the extension is missing.
    pub fn from_certificate_der(der: &[u8]) -> Result<Self, OcspError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| OcspError::Certificate(e.to_string()))?;
        let key_identifier = cert
            .extensions()
            .iter()
            .find_map(|ext| match ext.parsed_extension() {
                ParsedExtension::SubjectKeyIdentifier(id) => Some(id.0.to_vec()),
                _ => None,
            })
            .unwrap_or_else(|| {
                Sha1::digest(&cert.public_key().subject_public_key.data[..]).to_vec()
            });
        Ok(Self {
            name_der: cert.tbs_certificate.subject.as_raw().to_vec(),
            key_identifier,
        })
    }

    pub fn from_certificate_pem(pem: &str) -> Result<Self, OcspError> {
        let der = crate::pem_to_der(pem)?;
        Self::from_certificate_der(&der)
    }

    pub fn key_identifier(&self) -> &[u8] {
        &self.key_identifier
    }
}

/// One revoked serial as listed on a CRL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevokedEntry {
    pub serial: i64,
    /// Unix seconds
    pub revoked_at: i64,
    /// CRLReason code
    pub reason: Option<u8>,
}

/// Accumulates revoked serials and signs them into a `CertificateList`.
pub struct CrlBuilder {
    issuer: CrlIssuer,
    scope: CrlScope,
    number: i64,
    this_update: i64,
    next_update: i64,
    revoked: Vec<RevokedCert>,
}

impl CrlBuilder {
    pub fn new(
        issuer: CrlIssuer,
        scope: CrlScope,
        number: i64,
        this_update: i64,
        next_update: i64,
    ) -> Result<Self, OcspError> {
        if next_update <= this_update {
            return Err(OcspError::Encoding(
                "nextUpdate must be after thisUpdate".to_string(),
            ));
        }
        if number < 0 {
            return Err(OcspError::Encoding(format!("negative CRL number {}", number)));
        }
        Ok(Self {
            issuer,
            scope,
            number,
            this_update,
            next_update,
            revoked: Vec::new(),
        })
    }

    pub fn add_revoked(mut self, entry: RevokedEntry) -> Result<Self, OcspError> {
        // unspecified (0) is expressed by omitting the reason
        let crl_entry_extensions = match entry.reason.and_then(CrlReason::from_code) {
            Some(CrlReason::Unspecified) | None => None,
            Some(reason) => Some(vec![Extension {
                extn_id: OID_CRL_REASON,
                critical: false,
                extn_value: OctetString::new(reason.to_der()?)?,
            }]),
        };
        self.revoked.push(RevokedCert {
            serial_number: serial_uint(entry.serial)?,
            revocation_date: Time::from_unix(entry.revoked_at)?,
            crl_entry_extensions,
        });
        Ok(self)
    }

    /// Encode and sign. Returns the DER `CertificateList`.
    pub fn sign(self, signer: &dyn ResponseSigner) -> Result<Vec<u8>, OcspError> {
        let mut crl_extensions = vec![
            Extension {
                extn_id: OID_AUTHORITY_KEY_IDENTIFIER,
                critical: false,
                extn_value: OctetString::new(
                    AuthorityKeyIdentifier {
                        key_identifier: Some(OctetString::new(self.issuer.key_identifier)?),
                    }
                    .to_der()?,
                )?,
            },
            Extension {
                extn_id: OID_CRL_NUMBER,
                critical: false,
                extn_value: OctetString::new(serial_uint(self.number)?.to_der()?)?,
            },
        ];
        if let Some(idp) = self.scope.distribution_point() {
            crl_extensions.push(Extension {
                extn_id: OID_ISSUING_DISTRIBUTION_POINT,
                critical: true,
                extn_value: OctetString::new(idp.to_der()?)?,
            });
        }

        let signature_algorithm = AlgorithmIdentifierOwned {
            oid: OID_ECDSA_WITH_SHA256,
            parameters: None,
        };
        let tbs = TbsCertList {
            version: Some(CRL_VERSION_2),
            signature: signature_algorithm.clone(),
            issuer: Any::from_der(&self.issuer.name_der)?,
            this_update: Time::from_unix(self.this_update)?,
            next_update: Some(Time::from_unix(self.next_update)?),
            revoked_certificates: (!self.revoked.is_empty()).then_some(self.revoked),
            crl_extensions: Some(crl_extensions),
        };
        let signature = signer.sign(&tbs.to_der()?)?;

        let list = CertificateList {
            tbs_cert_list: tbs,
            signature_algorithm,
            signature: BitString::from_bytes(&signature)?,
        };
        Ok(list.to_der()?)
    }
}

/// A decoded list, used by tests and clients of this crate.
#[derive(Debug, Clone)]
pub struct DecodedCrl {
    pub list: CertificateList,
}

impl DecodedCrl {
    pub fn from_der(der: &[u8]) -> Result<Self, OcspError> {
        Ok(Self {
            list: CertificateList::from_der(der)?,
        })
    }

    pub fn this_update(&self) -> i64 {
        self.list.tbs_cert_list.this_update.unix_seconds()
    }

    pub fn next_update(&self) -> Option<i64> {
        self.list
            .tbs_cert_list
            .next_update
            .as_ref()
            .map(Time::unix_seconds)
    }

    fn extension(&self, oid: ObjectIdentifier) -> Option<&Extension> {
        self.list
            .tbs_cert_list
            .crl_extensions
            .as_ref()?
            .iter()
            .find(|ext| ext.extn_id == oid)
    }

    pub fn number(&self) -> Option<i64> {
        let ext = self.extension(OID_CRL_NUMBER)?;
        let number = Uint::from_der(ext.extn_value.as_bytes()).ok()?;
        serial_from_bytes(number.as_bytes())
    }

    /// Scope as declared by the IssuingDistributionPoint extension.
    pub fn scope(&self) -> Option<CrlScope> {
        let Some(ext) = self.extension(OID_ISSUING_DISTRIBUTION_POINT) else {
            return Some(CrlScope::Full);
        };
        let idp = IssuingDistributionPoint::from_der(ext.extn_value.as_bytes()).ok()?;
        match (idp.only_contains_user_certs, idp.only_contains_ca_certs) {
            (Some(true), _) => Some(CrlScope::User),
            (_, Some(true)) => Some(CrlScope::Ca),
            _ => None,
        }
    }

    pub fn entries(&self) -> Vec<RevokedEntry> {
        let Some(revoked) = &self.list.tbs_cert_list.revoked_certificates else {
            return Vec::new();
        };
        revoked
            .iter()
            .filter_map(|cert| {
                let reason = cert
                    .crl_entry_extensions
                    .as_ref()
                    .and_then(|exts| exts.iter().find(|ext| ext.extn_id == OID_CRL_REASON))
                    .and_then(|ext| CrlReason::from_der(ext.extn_value.as_bytes()).ok())
                    .map(|reason| reason as u8);
                Some(RevokedEntry {
                    serial: serial_from_bytes(cert.serial_number.as_bytes())?,
                    revoked_at: cert.revocation_date.unix_seconds(),
                    reason,
                })
            })
            .collect()
    }

    /// DER of the signed `TBSCertList`, for signature checks.
    pub fn tbs_der(&self) -> Result<Vec<u8>, OcspError> {
        Ok(self.list.tbs_cert_list.to_der()?)
    }

    pub fn signature(&self) -> &[u8] {
        self.list.signature.raw_bytes()
    }
}

/// PEM armor with the `X509 CRL` label.
pub fn crl_to_pem(der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut pem = String::with_capacity(encoded.len() + 64);
    pem.push_str("-----BEGIN X509 CRL-----\n");
    for line in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END X509 CRL-----\n");
    pem
}

fn serial_uint(value: i64) -> Result<Uint, OcspError> {
    let value = u64::try_from(value)
        .map_err(|_| OcspError::Encoding(format!("negative serial {}", value)))?;
    Ok(Uint::new(&value.to_be_bytes())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::rand::SystemRandom;
    use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};

    struct RingSigner(EcdsaKeyPair);

    impl ResponseSigner for RingSigner {
        fn sign(&self, message: &[u8]) -> Result<Vec<u8>, OcspError> {
            self.0
                .sign(&SystemRandom::new(), message)
                .map(|sig| sig.as_ref().to_vec())
                .map_err(|_| OcspError::Signing("ring".to_string()))
        }
    }

    fn ca() -> (CrlIssuer, RingSigner) {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "CRL Test CA");
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();
        let issuer = CrlIssuer::from_certificate_der(cert.der()).unwrap();

        let rng = SystemRandom::new();
        let pair = EcdsaKeyPair::from_pkcs8(
            &ECDSA_P256_SHA256_ASN1_SIGNING,
            &key.serialize_der(),
            &rng,
        )
        .unwrap();
        (issuer, RingSigner(pair))
    }

    #[test]
    fn test_scope_names() {
        for scope in CrlScope::ALL {
            assert_eq!(CrlScope::parse(scope.as_str()), Some(scope));
        }
        assert_eq!(CrlScope::parse("USER"), Some(CrlScope::User));
        assert_eq!(CrlScope::parse("delta"), None);
    }

    #[test]
    fn test_time_switches_to_generalized_after_2049() {
        assert!(matches!(
            Time::from_unix(1_700_000_000).unwrap(),
            Time::UtcTime(_)
        ));
        // 2050-01-01T00:00:00Z
        let later = Time::from_unix(2_524_608_000).unwrap();
        assert!(matches!(later, Time::GeneralTime(_)));
        assert_eq!(later.unix_seconds(), 2_524_608_000);
        assert!(Time::from_unix(-1).is_err());
    }

    #[test]
    fn test_signed_list_decodes_and_verifies() {
        let (issuer, signer) = ca();
        let public = signer.0.public_key().as_ref().to_vec();
        let der = CrlBuilder::new(issuer.clone(), CrlScope::User, 7, 1_700_000_000, 1_700_086_400)
            .unwrap()
            .add_revoked(RevokedEntry {
                serial: 0x2a,
                revoked_at: 1_699_990_000,
                reason: Some(1),
            })
            .unwrap()
            .add_revoked(RevokedEntry {
                serial: 0x2b,
                revoked_at: 1_699_995_000,
                reason: Some(0),
            })
            .unwrap()
            .sign(&signer)
            .unwrap();

        let crl = DecodedCrl::from_der(&der).unwrap();
        assert_eq!(crl.this_update(), 1_700_000_000);
        assert_eq!(crl.next_update(), Some(1_700_086_400));
        assert_eq!(crl.number(), Some(7));
        assert_eq!(crl.scope(), Some(CrlScope::User));
        assert_eq!(
            crl.entries(),
            vec![
                RevokedEntry {
                    serial: 0x2a,
                    revoked_at: 1_699_990_000,
                    reason: Some(1),
                },
                RevokedEntry {
                    serial: 0x2b,
                    revoked_at: 1_699_995_000,
                    reason: None,
                },
            ]
        );

        let verifier =
            ring::signature::UnparsedPublicKey::new(&ring::signature::ECDSA_P256_SHA256_ASN1, public);
        assert!(verifier
            .verify(&crl.tbs_der().unwrap(), crl.signature())
            .is_ok());

        // Readable by an independent parser
        let (_, parsed) = x509_parser::parse_x509_crl(&der).unwrap();
        assert_eq!(parsed.iter_revoked_certificates().count(), 2);
    }

    #[test]
    fn test_empty_full_list_has_no_scope_flags() {
        let (issuer, signer) = ca();
        let der = CrlBuilder::new(issuer, CrlScope::Full, 1, 1_700_000_000, 1_700_000_600)
            .unwrap()
            .sign(&signer)
            .unwrap();
        let crl = DecodedCrl::from_der(&der).unwrap();
        assert!(crl.list.tbs_cert_list.revoked_certificates.is_none());
        assert_eq!(crl.scope(), Some(CrlScope::Full));
        assert!(crl.entries().is_empty());
        assert_eq!(crl.list.tbs_cert_list.version, Some(1));
    }

    #[test]
    fn test_builder_rejects_inverted_window() {
        let (issuer, _) = ca();
        assert!(CrlBuilder::new(issuer, CrlScope::Ca, 1, 100, 100).is_err());
    }

    #[test]
    fn test_pem_armor() {
        let pem = crl_to_pem(&[0x30, 0x03, 0x02, 0x01, 0x01]);
        assert!(pem.starts_with("-----BEGIN X509 CRL-----\n"));
        assert!(pem.ends_with("-----END X509 CRL-----\n"));
        assert!(pem.contains("MAMCAQE="));
    }
}
