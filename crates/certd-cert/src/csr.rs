//! Certificate signing request intake.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

use crate::error::CertError;

/// A CSR whose self-signature has been verified.
#[derive(Debug, Clone)]
pub struct ParsedCsr {
    der: Vec<u8>,
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
}

impl ParsedCsr {
    /// Accepts PEM (`CERTIFICATE REQUEST` or `NEW CERTIFICATE REQUEST`) or raw DER.
    pub fn parse(input: &[u8]) -> Result<Self, CertError> {
        let der = if input.starts_with(b"-----BEGIN") {
            let (_, pem) = x509_parser::pem::parse_x509_pem(input)
                .map_err(|e| CertError::UnknownCsrFormat(e.to_string()))?;
            if !pem.label.ends_with("CERTIFICATE REQUEST") {
                return Err(CertError::UnknownCsrFormat(format!(
                    "unexpected PEM label {}",
                    pem.label
                )));
            }
            pem.contents
        } else {
            input.to_vec()
        };
        Self::from_der(der)
    }

    pub fn from_der(der: Vec<u8>) -> Result<Self, CertError> {
        let (common_name, dns_names) = {
            let (_, csr) = X509CertificationRequest::from_der(&der)
                .map_err(|e| CertError::UnknownCsrFormat(e.to_string()))?;
            csr.verify_signature().map_err(|_| CertError::CsrSignature)?;

            let common_name = csr
                .certification_request_info
                .subject
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .map(str::to_string);

            let mut dns_names = Vec::new();
            if let Some(extensions) = csr.requested_extensions() {
                for ext in extensions {
                    if let ParsedExtension::SubjectAlternativeName(san) = ext {
                        for name in &san.general_names {
                            if let GeneralName::DNSName(dns) = name {
                                dns_names.push(dns.to_string());
                            }
                        }
                    }
                }
            }
            (common_name, dns_names)
        };

        Ok(Self {
            der,
            common_name,
            dns_names,
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn to_pem(&self) -> String {
        to_pem("CERTIFICATE REQUEST", &self.der)
    }

    /// Every name the CSR asks for, CN included, lowercased and deduplicated.
    pub fn requested_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .common_name
            .iter()
            .chain(self.dns_names.iter())
            .map(|n| n.to_ascii_lowercase())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// PEM-armor DER bytes with 64 column lines.
pub fn to_pem(label: &str, der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut pem = format!("-----BEGIN {}-----\n", label);
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(chunk));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {}-----\n", label));
    pem
}
