//! Decoding of incoming OCSP requests for both HTTP bindings.

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use der::Decode;

use crate::asn1::{CertId, OcspRequest, OID_OCSP_NONCE};
use crate::hashes::HashAlgorithm;
use crate::OcspError;

/// One certificate a client asked about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusQuery {
    pub cert_id: CertId,
    pub hash_algorithm: HashAlgorithm,
}

impl StatusQuery {
    /// Serial number bytes, big-endian without sign padding.
    pub fn serial_bytes(&self) -> &[u8] {
        self.cert_id.serial_number.as_bytes()
    }

    /// Serial as an integer when it fits in 63 bits.
    pub fn serial(&self) -> Option<i64> {
        serial_from_bytes(self.serial_bytes())
    }

    pub fn issuer_name_hash(&self) -> &[u8] {
        self.cert_id.issuer_name_hash.as_bytes()
    }

    pub fn issuer_key_hash(&self) -> &[u8] {
        self.cert_id.issuer_key_hash.as_bytes()
    }
}

/// A decoded request: the queried certificates plus the optional nonce.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub queries: Vec<StatusQuery>,
    /// Raw `extnValue` of the nonce extension, echoed in the response
    pub nonce: Option<Vec<u8>>,
}

impl ParsedRequest {
    /// Decode a DER `OCSPRequest` (POST binding).
    pub fn from_der(der: &[u8]) -> Result<Self, OcspError> {
        let request = OcspRequest::from_der(der)?;
        let tbs = request.tbs_request;

        if tbs.request_list.is_empty() {
            return Err(OcspError::Malformed("empty request list".to_string()));
        }

        let mut queries = Vec::with_capacity(tbs.request_list.len());
        for req in tbs.request_list {
            let hash_algorithm = HashAlgorithm::from_oid(&req.req_cert.hash_algorithm.oid)
                .ok_or_else(|| {
                    OcspError::Malformed(format!(
                        "unsupported hash algorithm {}",
                        req.req_cert.hash_algorithm.oid
                    ))
                })?;
            queries.push(StatusQuery {
                cert_id: req.req_cert,
                hash_algorithm,
            });
        }

        let nonce = tbs
            .request_extensions
            .unwrap_or_default()
            .into_iter()
            .find(|ext| ext.extn_id == OID_OCSP_NONCE)
            .map(|ext| ext.extn_value.as_bytes().to_vec());

        Ok(Self { queries, nonce })
    }

    /// Decode the path segment of the GET binding.
    ///
    /// RFC 6960 specifies standard base64, URL-encoded. Clients differ in
    /// whether they percent-encode, so both forms and the URL-safe alphabet
    /// are accepted.
    pub fn from_get_path(segment: &str) -> Result<Self, OcspError> {
        let decoded = percent_decode(segment);
        let der = STANDARD
            .decode(decoded.as_bytes())
            .or_else(|_| URL_SAFE.decode(decoded.as_bytes()))
            .map_err(|e| OcspError::Malformed(format!("invalid base64: {}", e)))?;
        Self::from_der(&der)
    }
}

/// Interpret big-endian serial bytes as a non-negative i64.
pub fn serial_from_bytes(bytes: &[u8]) -> Option<i64> {
    let trimmed: Vec<u8> = bytes.iter().copied().skip_while(|b| *b == 0).collect();
    if trimmed.len() > 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf[8 - trimmed.len()..].copy_from_slice(&trimmed);
    let value = u64::from_be_bytes(buf);
    i64::try_from(value).ok()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(v) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_from_bytes() {
        assert_eq!(serial_from_bytes(&[0x2a]), Some(42));
        assert_eq!(serial_from_bytes(&[0x00, 0x80]), Some(128));
        assert_eq!(serial_from_bytes(&[0x01; 9]), None);
        assert_eq!(serial_from_bytes(&[0xff; 8]), None);
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("ab%2Bc%2F%3D"), "ab+c/=");
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("trail%2"), "trail%2");
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            ParsedRequest::from_der(&[0x30, 0x03, 0x01, 0x02]),
            Err(OcspError::Der(_))
        ));
        assert!(matches!(
            ParsedRequest::from_get_path("!!notbase64!!"),
            Err(OcspError::Malformed(_))
        ));
    }
}
