//! Building and decoding signed OCSP responses.

use std::time::Duration;

use der::asn1::{BitString, GeneralizedTime, Null, OctetString};
use der::{Decode, Encode};
use spki::AlgorithmIdentifierOwned;

use crate::asn1::{
    BasicOcspResponse, CertId, CertStatus, CrlReason, Extension, OcspResponse,
    OcspResponseStatus, ResponderId, ResponseBytes, ResponseData, RevokedInfo, SingleResponse,
    OID_ECDSA_WITH_SHA256, OID_OCSP_BASIC, OID_OCSP_NONCE,
};
use crate::OcspError;

/// Produces ECDSA P-256 SHA-256 signatures (DER `ECDSA-Sig-Value`) over
/// an encoded `ResponseData` or `TBSCertList`.
pub trait ResponseSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, OcspError>;
}

/// Public identity of a delegated responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponderIdentity {
    /// SHA-1 of the responder's subjectPublicKey
    pub key_hash: Vec<u8>,
    /// Responder certificate, included in every response
    pub certificate_der: Vec<u8>,
}

/// Status of one serial as known to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialStatus {
    Good,
    Revoked {
        /// Unix seconds
        revoked_at: i64,
        /// CRLReason code
        reason: Option<u8>,
    },
    Unknown,
}

impl SerialStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SerialStatus::Good => "good",
            SerialStatus::Revoked { .. } => "revoked",
            SerialStatus::Unknown => "unknown",
        }
    }
}

/// Accumulates single responses and signs them into one `OCSPResponse`.
pub struct ResponseBuilder {
    identity: ResponderIdentity,
    produced_at: i64,
    responses: Vec<SingleResponse>,
    nonce: Option<Vec<u8>>,
}

impl ResponseBuilder {
    pub fn new(identity: ResponderIdentity, produced_at: i64) -> Self {
        Self {
            identity,
            produced_at,
            responses: Vec::new(),
            nonce: None,
        }
    }

    /// Echo a client nonce (raw `extnValue` bytes).
    pub fn with_nonce(mut self, nonce: Option<Vec<u8>>) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn add_response(
        mut self,
        cert_id: CertId,
        status: SerialStatus,
        this_update: i64,
        next_update: i64,
    ) -> Result<Self, OcspError> {
        if next_update <= this_update {
            return Err(OcspError::Encoding(
                "nextUpdate must be after thisUpdate".to_string(),
            ));
        }

        let cert_status = match status {
            SerialStatus::Good => CertStatus::Good(Null),
            SerialStatus::Unknown => CertStatus::Unknown(Null),
            SerialStatus::Revoked { revoked_at, reason } => CertStatus::Revoked(RevokedInfo {
                revocation_time: generalized_time(revoked_at)?,
                revocation_reason: reason.and_then(CrlReason::from_code),
            }),
        };

        self.responses.push(SingleResponse {
            cert_id,
            cert_status,
            this_update: generalized_time(this_update)?,
            next_update: Some(generalized_time(next_update)?),
            single_extensions: None,
        });
        Ok(self)
    }

    /// Encode, sign and wrap into a successful `OCSPResponse`.
    pub fn sign(self, signer: &dyn ResponseSigner) -> Result<Vec<u8>, OcspError> {
        if self.responses.is_empty() {
            return Err(OcspError::Encoding("no responses to sign".to_string()));
        }

        let response_extensions = match self.nonce {
            Some(nonce) => Some(vec![Extension {
                extn_id: OID_OCSP_NONCE,
                critical: false,
                extn_value: OctetString::new(nonce)?,
            }]),
            None => None,
        };

        let tbs = ResponseData {
            version: None,
            responder_id: ResponderId::ByKey(OctetString::new(self.identity.key_hash)?),
            produced_at: generalized_time(self.produced_at)?,
            responses: self.responses,
            response_extensions,
        };
        let tbs_der = tbs.to_der()?;
        let signature = signer.sign(&tbs_der)?;

        let basic = BasicOcspResponse {
            tbs_response_data: tbs,
            signature_algorithm: AlgorithmIdentifierOwned {
                oid: OID_ECDSA_WITH_SHA256,
                parameters: None,
            },
            signature: BitString::from_bytes(&signature)?,
            certs: Some(vec![der::asn1::Any::from_der(
                &self.identity.certificate_der,
            )?]),
        };

        let response = OcspResponse {
            response_status: OcspResponseStatus::Successful,
            response_bytes: Some(ResponseBytes {
                response_type: OID_OCSP_BASIC,
                response: OctetString::new(basic.to_der()?)?,
            }),
        };
        Ok(response.to_der()?)
    }
}

/// Unsigned response carrying only an error status.
///
/// `OCSPResponse ::= SEQUENCE { responseStatus ENUMERATED }` is five bytes,
/// so it is emitted directly.
pub fn status_only_response(status: OcspResponseStatus) -> Vec<u8> {
    vec![0x30, 0x03, 0x0a, 0x01, status as u8]
}

pub fn try_later() -> Vec<u8> {
    status_only_response(OcspResponseStatus::TryLater)
}

pub fn unauthorized() -> Vec<u8> {
    status_only_response(OcspResponseStatus::Unauthorized)
}

pub fn malformed_request() -> Vec<u8> {
    status_only_response(OcspResponseStatus::MalformedRequest)
}

pub fn internal_error() -> Vec<u8> {
    status_only_response(OcspResponseStatus::InternalError)
}

/// A decoded response, used by tests and clients of this crate.
#[derive(Debug, Clone)]
pub struct DecodedResponse {
    pub status: OcspResponseStatus,
    pub basic: Option<BasicOcspResponse>,
}

impl DecodedResponse {
    pub fn from_der(der: &[u8]) -> Result<Self, OcspError> {
        let response = OcspResponse::from_der(der)?;
        let basic = match response.response_bytes {
            Some(bytes) if bytes.response_type == OID_OCSP_BASIC => {
                Some(BasicOcspResponse::from_der(bytes.response.as_bytes())?)
            }
            Some(bytes) => {
                return Err(OcspError::Malformed(format!(
                    "unexpected response type {}",
                    bytes.response_type
                )))
            }
            None => None,
        };
        Ok(Self {
            status: response.response_status,
            basic,
        })
    }

    /// Status, thisUpdate and nextUpdate (unix seconds) of each single response.
    pub fn statuses(&self) -> Vec<(SerialStatus, i64, Option<i64>)> {
        let Some(basic) = &self.basic else {
            return Vec::new();
        };
        basic
            .tbs_response_data
            .responses
            .iter()
            .map(|single| {
                let status = match &single.cert_status {
                    CertStatus::Good(_) => SerialStatus::Good,
                    CertStatus::Unknown(_) => SerialStatus::Unknown,
                    CertStatus::Revoked(info) => SerialStatus::Revoked {
                        revoked_at: unix_seconds(&info.revocation_time),
                        reason: info.revocation_reason.map(|r| r as u8),
                    },
                };
                (
                    status,
                    unix_seconds(&single.this_update),
                    single.next_update.as_ref().map(unix_seconds),
                )
            })
            .collect()
    }

    /// Nonce echoed by the responder, if any.
    pub fn nonce(&self) -> Option<Vec<u8>> {
        self.basic
            .as_ref()?
            .tbs_response_data
            .response_extensions
            .as_ref()?
            .iter()
            .find(|ext| ext.extn_id == OID_OCSP_NONCE)
            .map(|ext| ext.extn_value.as_bytes().to_vec())
    }
}

pub(crate) fn generalized_time(unix_seconds: i64) -> Result<GeneralizedTime, OcspError> {
    let secs = u64::try_from(unix_seconds)
        .map_err(|_| OcspError::Encoding(format!("time before epoch: {}", unix_seconds)))?;
    Ok(GeneralizedTime::from_unix_duration(Duration::from_secs(
        secs,
    ))?)
}

fn unix_seconds(time: &GeneralizedTime) -> i64 {
    time.to_unix_duration().as_secs() as i64
}
