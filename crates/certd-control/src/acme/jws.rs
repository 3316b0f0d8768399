//! Flattened JWS verification for ACME requests (RFC 7515, RFC 8555 §6.2).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ring::signature::{
    RsaPublicKeyComponents, UnparsedPublicKey, ECDSA_P256_SHA256_FIXED,
    RSA_PKCS1_2048_8192_SHA256,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::error::AcmeError;

/// `application/jose+json` request body
#[derive(Debug, Clone, Deserialize)]
pub struct FlattenedJws {
    pub protected: String,
    #[serde(default)]
    pub payload: String,
    pub signature: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtectedHeader {
    pub alg: String,
    pub nonce: Option<String>,
    pub url: String,
    pub jwk: Option<serde_json::Value>,
    pub kid: Option<String>,
}

/// Supported account keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Jwk {
    /// P-256 coordinates, base64url
    Ec { x: String, y: String },
    /// Modulus and exponent, base64url
    Rsa { n: String, e: String },
}

impl Jwk {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, AcmeError> {
        let field = |name: &str| -> Result<String, AcmeError> {
            value
                .get(name)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| AcmeError::Malformed(format!("JWK is missing \"{}\"", name)))
        };
        match field("kty")?.as_str() {
            "EC" => {
                let crv = field("crv")?;
                if crv != "P-256" {
                    return Err(AcmeError::BadSignatureAlgorithm(format!(
                        "Unsupported curve {}",
                        crv
                    )));
                }
                Ok(Jwk::Ec {
                    x: field("x")?,
                    y: field("y")?,
                })
            }
            "RSA" => Ok(Jwk::Rsa {
                n: field("n")?,
                e: field("e")?,
            }),
            other => Err(AcmeError::BadSignatureAlgorithm(format!(
                "Unsupported key type {}",
                other
            ))),
        }
    }

    /// Canonical JSON form with only the required members.
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Jwk::Ec { x, y } => serde_json::json!({"crv": "P-256", "kty": "EC", "x": x, "y": y}),
            Jwk::Rsa { n, e } => serde_json::json!({"e": e, "kty": "RSA", "n": n}),
        }
    }

    /// RFC 7638 thumbprint, base64url.
    pub fn thumbprint(&self) -> String {
        let canonical = match self {
            Jwk::Ec { x, y } => format!(r#"{{"crv":"P-256","kty":"EC","x":"{}","y":"{}"}}"#, x, y),
            Jwk::Rsa { n, e } => format!(r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#, e, n),
        };
        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }

    pub fn verify(&self, alg: &str, message: &[u8], signature: &[u8]) -> Result<(), AcmeError> {
        let invalid = |_| AcmeError::Malformed("JWS signature is invalid".to_string());
        match (self, alg) {
            (Jwk::Ec { x, y }, "ES256") => {
                let mut point = Vec::with_capacity(65);
                point.push(0x04);
                point.extend(b64(x)?);
                point.extend(b64(y)?);
                UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, point)
                    .verify(message, signature)
                    .map_err(invalid)
            }
            (Jwk::Rsa { n, e }, "RS256") => RsaPublicKeyComponents {
                n: b64(n)?,
                e: b64(e)?,
            }
            .verify(&RSA_PKCS1_2048_8192_SHA256, message, signature)
            .map_err(invalid),
            (_, alg) => Err(AcmeError::BadSignatureAlgorithm(format!(
                "Algorithm {} does not match the account key",
                alg
            ))),
        }
    }
}

/// Decode base64url without padding.
pub fn b64(input: &str) -> Result<Vec<u8>, AcmeError> {
    URL_SAFE_NO_PAD
        .decode(input.trim_end_matches('='))
        .map_err(|e| AcmeError::Malformed(format!("invalid base64url: {}", e)))
}

/// A JWS whose structure has been decoded but whose signature is not yet checked.
#[derive(Debug, Clone)]
pub struct DecodedJws {
    pub header: ProtectedHeader,
    /// Empty for POST-as-GET
    pub payload: Vec<u8>,
    signing_input: Vec<u8>,
    signature: Vec<u8>,
}

impl DecodedJws {
    pub fn parse(body: &[u8]) -> Result<Self, AcmeError> {
        let jws: FlattenedJws = serde_json::from_slice(body)
            .map_err(|e| AcmeError::Malformed(format!("Request is not a flattened JWS: {}", e)))?;
        let header: ProtectedHeader = serde_json::from_slice(&b64(&jws.protected)?)
            .map_err(|e| AcmeError::Malformed(format!("Invalid protected header: {}", e)))?;
        if header.jwk.is_some() == header.kid.is_some() {
            return Err(AcmeError::Malformed(
                "Exactly one of jwk and kid must be present".to_string(),
            ));
        }
        if !matches!(header.alg.as_str(), "ES256" | "RS256") {
            return Err(AcmeError::BadSignatureAlgorithm(format!(
                "Unsupported algorithm {}",
                header.alg
            )));
        }
        let payload = b64(&jws.payload)?;
        let signing_input = format!("{}.{}", jws.protected, jws.payload).into_bytes();
        Ok(Self {
            header,
            payload,
            signing_input,
            signature: b64(&jws.signature)?,
        })
    }

    pub fn verify_with(&self, key: &Jwk) -> Result<(), AcmeError> {
        key.verify(&self.header.alg, &self.signing_input, &self.signature)
    }

    /// Deserialize the payload; an empty payload is a POST-as-GET.
    pub fn payload_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, AcmeError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| AcmeError::Malformed(format!("Invalid payload: {}", e)))
    }

    pub fn is_post_as_get(&self) -> bool {
        self.payload.is_empty()
    }
}
