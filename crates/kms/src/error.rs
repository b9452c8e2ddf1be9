use shared::error::CommonError;
use thiserror::Error;

/// Errors surfaced by the key management subsystem.
///
/// Messages name the failing entity (key id, version) but never carry key material.
#[derive(Error, Debug)]
pub enum KmsError {
    #[error("barrier is sealed")]
    Sealed,
    #[error("insufficient unseal shares: {provided} provided, {required} required")]
    InsufficientShares { required: u8, provided: usize },
    #[error("unseal shares failed integrity verification")]
    ShareIntegrity,
    #[error("invalid unseal input: {msg}")]
    InvalidUnsealInput { msg: String },
    #[error("unknown version {version} for key {key_id}")]
    UnknownKeyVersion { key_id: String, version: u32 },
    #[error("decryption failed for key {key_id} version {version}")]
    Decryption { key_id: String, version: u32 },
    #[error("signature verification failed for key {key_id} version {version}")]
    SignatureInvalid { key_id: String, version: u32 },
    #[error("elastic key not found: {elastic_key_id}")]
    ElasticKeyNotFound { elastic_key_id: String },
    #[error("algorithm policy violation for {elastic_key_id}: {msg}")]
    AlgorithmPolicyViolation { elastic_key_id: String, msg: String },
    #[error(
        "material key version {version} of {elastic_key_id} is retired and cannot be used to encrypt or sign"
    )]
    KeyVersionRetiredForEncrypt { elastic_key_id: String, version: u32 },
    #[error("material key version {version} of {elastic_key_id} is revoked")]
    KeyVersionRevoked { elastic_key_id: String, version: u32 },
    #[error(
        "algorithm mismatch for {elastic_key_id} version {version}: key uses {expected}, token declares {found}"
    )]
    AlgorithmMismatch {
        elastic_key_id: String,
        version: u32,
        expected: String,
        found: String,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Common(#[from] CommonError),
}

impl KmsError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        KmsError::Common(CommonError::InvalidRequest {
            msg: msg.into(),
            source: None,
        })
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        KmsError::Common(CommonError::Unknown(anyhow::anyhow!(msg.into())))
    }

    /// Only transient conditions are retryable. Integrity failures never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KmsError::Sealed | KmsError::Cancelled)
    }

    pub fn name(&self) -> &'static str {
        match self {
            KmsError::Sealed => "Sealed",
            KmsError::InsufficientShares { .. } => "InsufficientShares",
            KmsError::ShareIntegrity => "ShareIntegrity",
            KmsError::InvalidUnsealInput { .. } => "InvalidUnsealInput",
            KmsError::UnknownKeyVersion { .. } => "UnknownKeyVersion",
            KmsError::Decryption { .. } => "Decryption",
            KmsError::SignatureInvalid { .. } => "SignatureInvalid",
            KmsError::ElasticKeyNotFound { .. } => "ElasticKeyNotFound",
            KmsError::AlgorithmPolicyViolation { .. } => "AlgorithmPolicyViolation",
            KmsError::KeyVersionRetiredForEncrypt { .. } => "KeyVersionRetiredForEncrypt",
            KmsError::KeyVersionRevoked { .. } => "KeyVersionRevoked",
            KmsError::AlgorithmMismatch { .. } => "AlgorithmMismatch",
            KmsError::Cancelled => "Cancelled",
            KmsError::Common(e) => e.name(),
        }
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(KmsError::Sealed.is_retryable());
        assert!(KmsError::Cancelled.is_retryable());
        assert!(!KmsError::ShareIntegrity.is_retryable());
        assert!(
            !KmsError::Decryption {
                key_id: "k".to_string(),
                version: 1
            }
            .is_retryable()
        );
        assert!(!KmsError::invalid_request("nope").is_retryable());
        assert!(
            !KmsError::KeyVersionRevoked {
                elastic_key_id: "k".to_string(),
                version: 2
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_messages_identify_entity() {
        let err = KmsError::UnknownKeyVersion {
            key_id: "payments".to_string(),
            version: 7,
        };
        assert_eq!(err.to_string(), "unknown version 7 for key payments");
        assert_eq!(err.name(), "UnknownKeyVersion");
        assert_eq!(KmsError::invalid_request("x").name(), "InvalidRequest");
    }
}
