//! Certificate construction with rcgen.
//!
//! All signing goes through a [`SigningLease`]; the issuer certificate is
//! rebuilt from the stored CA PEM so only the lease holder can produce a
//! valid signature.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    CustomExtension, DistinguishedName, DnType, Ia5String, IsCa, KeyUsagePurpose, SanType,
    SerialNumber,
};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::csr::ParsedCsr;
use crate::error::CertError;
use crate::keystore::SigningLease;
use crate::policy::{ApprovedProfile, ExtendedKeyUsage};

/// `id-pkix-ocsp-nocheck`
const OID_OCSP_NOCHECK: [u64; 10] = [1, 3, 6, 1, 5, 5, 7, 48, 1, 5];

/// A freshly signed certificate
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub serial: i64,
    pub pem: String,
    pub der: Vec<u8>,
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Parameters for a new self-signed root
#[derive(Debug, Clone)]
pub struct RootCaParams {
    pub common_name: String,
    pub organization: Option<String>,
    pub validity_days: i64,
}

fn offset_time(time: DateTime<Utc>) -> Result<time::OffsetDateTime, CertError> {
    time::OffsetDateTime::from_unix_timestamp(time.timestamp())
        .map_err(|e| CertError::Generation(e.to_string()))
}

fn serial_number(serial: i64) -> Result<SerialNumber, CertError> {
    let value = u64::try_from(serial)
        .map_err(|_| CertError::Generation(format!("invalid serial {}", serial)))?;
    Ok(SerialNumber::from(value))
}

fn san(name: &str) -> Result<SanType, CertError> {
    if let Ok(ip) = name.parse::<std::net::IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    Ia5String::try_from(name)
        .map(SanType::DnsName)
        .map_err(|e| CertError::Generation(format!("invalid SAN {}: {}", name, e)))
}

/// Subject, validity and DER of a PEM certificate.
pub fn inspect_certificate(
    pem: &str,
) -> Result<(String, DateTime<Utc>, DateTime<Utc>, Vec<u8>), CertError> {
    let der = certd_ocsp::pem_to_der(pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| CertError::InvalidCertificate(e.to_string()))?;
    let validity = cert.validity();
    let not_before = Utc
        .timestamp_opt(validity.not_before.timestamp(), 0)
        .single()
        .ok_or_else(|| CertError::InvalidCertificate("notBefore out of range".to_string()))?;
    let not_after = Utc
        .timestamp_opt(validity.not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| CertError::InvalidCertificate("notAfter out of range".to_string()))?;
    let subject = cert.subject().to_string();
    Ok((subject, not_before, not_after, der))
}

fn finish(cert: Certificate, serial: i64) -> Result<IssuedCertificate, CertError> {
    let pem = cert.pem();
    let (subject, not_before, not_after, der) = inspect_certificate(&pem)?;
    Ok(IssuedCertificate {
        serial,
        pem,
        der,
        subject,
        not_before,
        not_after,
    })
}

/// Reconstruct the issuer object rcgen needs from the stored CA PEM.
fn issuer(ca_cert_pem: &str, ca_key: &SigningLease) -> Result<Certificate, CertError> {
    let params = CertificateParams::from_ca_cert_pem(ca_cert_pem)?;
    Ok(params.self_signed(ca_key.key_pair())?)
}

/// Create a self-signed root CA for the key behind `ca_key`.
pub fn create_root_ca(
    ca_key: &SigningLease,
    root: &RootCaParams,
    now: DateTime<Utc>,
) -> Result<IssuedCertificate, CertError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, root.common_name.as_str());
    if let Some(org) = &root.organization {
        dn.push(DnType::OrganizationName, org.as_str());
    }
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = offset_time(now)?;
    params.not_after = offset_time(now + Duration::days(root.validity_days))?;

    // Root serials come from a random source; the CA counter covers issued certs
    let serial = (rand::random::<u64>() >> 1) as i64;
    params.serial_number = Some(serial_number(serial)?);

    let cert = params.self_signed(ca_key.key_pair())?;
    finish(cert, serial)
}

/// Issue the delegated OCSP responder certificate for a CA.
///
/// The certificate carries EKU OCSPSigning and `id-pkix-ocsp-nocheck`.
pub fn issue_ocsp_responder(
    ca_key: &SigningLease,
    ca_cert_pem: &str,
    responder_key: &SigningLease,
    common_name: &str,
    serial: i64,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> Result<IssuedCertificate, CertError> {
    let issuer = issuer(ca_cert_pem, ca_key)?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsage::OcspSigning.to_rcgen()];
    params.use_authority_key_identifier_extension = true;
    params.not_before = offset_time(not_before)?;
    params.not_after = offset_time(not_after)?;
    params.serial_number = Some(serial_number(serial)?);
    params.custom_extensions = vec![CustomExtension::from_oid_content(
        &OID_OCSP_NOCHECK,
        vec![0x05, 0x00],
    )];

    let cert = params.signed_by(responder_key.key_pair(), &issuer, ca_key.key_pair())?;
    finish(cert, serial)
}

/// Sign an approved end-entity request.
pub fn issue_leaf(
    ca_key: &SigningLease,
    ca_cert_pem: &str,
    csr: &ParsedCsr,
    profile: &ApprovedProfile,
    serial: i64,
    ocsp_url: Option<&str>,
) -> Result<IssuedCertificate, CertError> {
    let issuer = issuer(ca_cert_pem, ca_key)?;

    let mut request = CertificateSigningRequestParams::from_pem(&csr.to_pem())
        .map_err(|e| CertError::UnknownCsrFormat(e.to_string()))?;

    let params = &mut request.params;
    let mut dn = DistinguishedName::new();
    if let Some(cn) = &profile.common_name {
        dn.push(DnType::CommonName, cn.as_str());
    }
    params.distinguished_name = dn;
    params.subject_alt_names = profile
        .sans
        .iter()
        .map(|name| san(name))
        .collect::<Result<Vec<_>, _>>()?;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = profile
        .extended_key_usages
        .iter()
        .map(|eku| eku.to_rcgen())
        .collect();
    params.use_authority_key_identifier_extension = true;
    params.not_before = offset_time(profile.not_before)?;
    params.not_after = offset_time(profile.not_after)?;
    params.serial_number = Some(serial_number(serial)?);
    params.custom_extensions = match ocsp_url {
        Some(url) => vec![CustomExtension::from_oid_content(
            &certd_ocsp::OID_AUTHORITY_INFO_ACCESS,
            certd_ocsp::ocsp_aia_extension_value(url)?,
        )],
        None => Vec::new(),
    };

    let cert = request.signed_by(&issuer, ca_key.key_pair())?;
    finish(cert, serial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::{KeyStore, MemoryKeyStore};
    use crate::policy::{CaWindow, IssuancePolicy, ProfileRequest};
    use x509_parser::extensions::ParsedExtension;

    async fn root(store: &MemoryKeyStore) -> IssuedCertificate {
        store.generate("root").await.unwrap();
        let lease = store.acquire("root").await.unwrap();
        create_root_ca(
            &lease,
            &RootCaParams {
                common_name: "Test Root".to_string(),
                organization: Some("certd".to_string()),
                validity_days: 3650,
            },
            Utc::now(),
        )
        .unwrap()
    }

    fn csr(names: &[&str]) -> ParsedCsr {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params =
            CertificateParams::new(names.iter().map(|s| s.to_string()).collect::<Vec<_>>())
                .unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, names[0]);
        params.distinguished_name = dn;
        ParsedCsr::parse(params.serialize_request(&key).unwrap().der()).unwrap()
    }

    #[tokio::test]
    async fn test_root_ca() {
        let store = MemoryKeyStore::new();
        let ca = root(&store).await;
        assert!(ca.subject.contains("CN=Test Root"));
        assert!(ca.not_after > ca.not_before);

        let (_, cert) = X509Certificate::from_der(&ca.der).unwrap();
        assert!(cert.is_ca());
    }

    #[tokio::test]
    async fn test_issue_leaf_chain() {
        let store = MemoryKeyStore::new();
        let ca = root(&store).await;
        let lease = store.acquire("root").await.unwrap();

        let csr = csr(&["example.com", "www.example.com"]);
        let profile = IssuancePolicy::default()
            .evaluate(
                &CaWindow {
                    active: true,
                    not_before: ca.not_before,
                    not_after: ca.not_after,
                },
                csr.common_name.as_deref(),
                &csr.dns_names,
                &ProfileRequest::default(),
                Utc::now(),
            )
            .unwrap();

        let leaf = issue_leaf(
            &lease,
            &ca.pem,
            &csr,
            &profile,
            42,
            Some("http://ocsp.example.com/ocsp"),
        )
        .unwrap();
        assert_eq!(leaf.serial, 42);

        let (_, cert) = X509Certificate::from_der(&leaf.der).unwrap();
        assert_eq!(cert.raw_serial(), &[42]);
        assert_eq!(cert.issuer().to_string(), ca.subject);
        assert!(!cert.is_ca());

        let (_, ca_cert) = X509Certificate::from_der(&ca.der).unwrap();
        assert!(cert.verify_signature(Some(ca_cert.public_key())).is_ok());

        let has_aia = cert
            .extensions()
            .iter()
            .any(|ext| matches!(ext.parsed_extension(), ParsedExtension::AuthorityInfoAccess(_)));
        assert!(has_aia);
    }

    #[tokio::test]
    async fn test_ocsp_responder_certificate() {
        let store = MemoryKeyStore::new();
        let ca = root(&store).await;
        store.generate("root-ocsp").await.unwrap();
        let ca_lease = store.acquire("root").await.unwrap();
        let responder = store.acquire("root-ocsp").await.unwrap();

        let cert = issue_ocsp_responder(
            &ca_lease,
            &ca.pem,
            &responder,
            "Test Root OCSP",
            1,
            Utc::now(),
            Utc::now() + Duration::days(30),
        )
        .unwrap();

        let (_, parsed) = X509Certificate::from_der(&cert.der).unwrap();
        let eku = parsed.extended_key_usage().unwrap().unwrap();
        assert!(eku.value.ocsp_signing);
        assert_eq!(parsed.public_key().subject_public_key.data.as_ref(), responder.public_key_raw());
    }
}
