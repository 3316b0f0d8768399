use thiserror::Error;

/// Key Store errors
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Invalid key reference: {0}")]
    InvalidReference(String),

    #[error("Key store is read-only")]
    ReadOnly,

    #[error("Key already exists: {0}")]
    AlreadyExists(String),

    #[error("Unsupported or corrupt key: {0}")]
    Corrupt(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Certificate construction errors
#[derive(Debug, Error)]
pub enum CertError {
    #[error("Certificate generation failed: {0}")]
    Generation(String),

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Unknown CSR format: {0}")]
    UnknownCsrFormat(String),

    #[error("CSR signature verification failed")]
    CsrSignature,

    #[error(transparent)]
    Key(#[from] KeyError),
}

impl From<rcgen::Error> for CertError {
    fn from(err: rcgen::Error) -> Self {
        CertError::Generation(err.to_string())
    }
}

impl From<certd_ocsp::OcspError> for CertError {
    fn from(err: certd_ocsp::OcspError) -> Self {
        CertError::Generation(err.to_string())
    }
}
