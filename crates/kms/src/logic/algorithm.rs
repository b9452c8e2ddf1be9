use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::KmsError;
use crate::logic::keygen::KeyFamily;

/// JWE content encryption (`enc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentEncryption {
    #[serde(rename = "A128GCM")]
    A128Gcm,
    #[serde(rename = "A192GCM")]
    A192Gcm,
    #[serde(rename = "A256GCM")]
    A256Gcm,
}

impl ContentEncryption {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentEncryption::A128Gcm => "A128GCM",
            ContentEncryption::A192Gcm => "A192GCM",
            ContentEncryption::A256Gcm => "A256GCM",
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            ContentEncryption::A128Gcm => 16,
            ContentEncryption::A192Gcm => 24,
            ContentEncryption::A256Gcm => 32,
        }
    }

    fn aes_family(&self) -> KeyFamily {
        match self {
            ContentEncryption::A128Gcm => KeyFamily::Aes128,
            ContentEncryption::A192Gcm => KeyFamily::Aes192,
            ContentEncryption::A256Gcm => KeyFamily::Aes256,
        }
    }
}

/// JWE key management (`alg`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyManagement {
    #[serde(rename = "dir")]
    Direct,
    #[serde(rename = "A128GCMKW")]
    A128GcmKw,
    #[serde(rename = "A192GCMKW")]
    A192GcmKw,
    #[serde(rename = "A256GCMKW")]
    A256GcmKw,
    #[serde(rename = "RSA-OAEP-256")]
    RsaOaep256,
    #[serde(rename = "ECDH-ES")]
    EcdhEs,
}

impl KeyManagement {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyManagement::Direct => "dir",
            KeyManagement::A128GcmKw => "A128GCMKW",
            KeyManagement::A192GcmKw => "A192GCMKW",
            KeyManagement::A256GcmKw => "A256GCMKW",
            KeyManagement::RsaOaep256 => "RSA-OAEP-256",
            KeyManagement::EcdhEs => "ECDH-ES",
        }
    }
}

/// JWS algorithms (`alg`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    HS256,
    HS384,
    HS512,
    RS256,
    RS384,
    RS512,
    ES256,
    ES384,
    ES512,
    EdDSA,
}

impl SignatureAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureAlgorithm::HS256 => "HS256",
            SignatureAlgorithm::HS384 => "HS384",
            SignatureAlgorithm::HS512 => "HS512",
            SignatureAlgorithm::RS256 => "RS256",
            SignatureAlgorithm::RS384 => "RS384",
            SignatureAlgorithm::RS512 => "RS512",
            SignatureAlgorithm::ES256 => "ES256",
            SignatureAlgorithm::ES384 => "ES384",
            SignatureAlgorithm::ES512 => "ES512",
            SignatureAlgorithm::EdDSA => "EdDSA",
        }
    }

    fn default_family(&self) -> KeyFamily {
        match self {
            SignatureAlgorithm::HS256 => KeyFamily::Hmac256,
            SignatureAlgorithm::HS384 => KeyFamily::Hmac384,
            SignatureAlgorithm::HS512 => KeyFamily::Hmac512,
            SignatureAlgorithm::RS256 | SignatureAlgorithm::RS384 | SignatureAlgorithm::RS512 => {
                KeyFamily::Rsa2048
            }
            SignatureAlgorithm::ES256 => KeyFamily::EcdsaP256,
            SignatureAlgorithm::ES384 => KeyFamily::EcdsaP384,
            SignatureAlgorithm::ES512 => KeyFamily::EcdsaP521,
            SignatureAlgorithm::EdDSA => KeyFamily::Ed25519,
        }
    }

    fn accepts(&self, family: KeyFamily) -> bool {
        match self {
            SignatureAlgorithm::RS256 | SignatureAlgorithm::RS384 | SignatureAlgorithm::RS512 => {
                family.is_rsa()
            }
            _ => family == self.default_family(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    Encrypt,
    Sign,
}

/// The algorithm an elastic key is bound to for its whole life. Every material key
/// version is generated for, and only used with, this algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElasticKeyAlgorithm {
    Encryption {
        alg: KeyManagement,
        enc: ContentEncryption,
        key_family: KeyFamily,
    },
    Signature {
        alg: SignatureAlgorithm,
        key_family: KeyFamily,
    },
}

impl ElasticKeyAlgorithm {
    /// `dir`: the material key is the content encryption key.
    pub fn direct(enc: ContentEncryption) -> Self {
        ElasticKeyAlgorithm::Encryption {
            alg: KeyManagement::Direct,
            enc,
            key_family: enc.aes_family(),
        }
    }

    /// AES-GCM key wrap of a random content key. `alg` must be one of the GCMKW variants.
    pub fn key_wrap(alg: KeyManagement, enc: ContentEncryption) -> Self {
        let key_family = match alg {
            KeyManagement::A128GcmKw => KeyFamily::Aes128,
            KeyManagement::A192GcmKw => KeyFamily::Aes192,
            _ => KeyFamily::Aes256,
        };
        ElasticKeyAlgorithm::Encryption {
            alg,
            enc,
            key_family,
        }
    }

    pub fn rsa_oaep(enc: ContentEncryption, key_family: KeyFamily) -> Self {
        ElasticKeyAlgorithm::Encryption {
            alg: KeyManagement::RsaOaep256,
            enc,
            key_family,
        }
    }

    pub fn ecdh_es(enc: ContentEncryption, key_family: KeyFamily) -> Self {
        ElasticKeyAlgorithm::Encryption {
            alg: KeyManagement::EcdhEs,
            enc,
            key_family,
        }
    }

    pub fn signature(alg: SignatureAlgorithm) -> Self {
        ElasticKeyAlgorithm::Signature {
            alg,
            key_family: alg.default_family(),
        }
    }

    pub fn signature_with_family(alg: SignatureAlgorithm, key_family: KeyFamily) -> Self {
        ElasticKeyAlgorithm::Signature { alg, key_family }
    }

    pub fn key_family(&self) -> KeyFamily {
        match self {
            ElasticKeyAlgorithm::Encryption { key_family, .. }
            | ElasticKeyAlgorithm::Signature { key_family, .. } => *key_family,
        }
    }

    pub fn usage(&self) -> KeyUsage {
        match self {
            ElasticKeyAlgorithm::Encryption { .. } => KeyUsage::Encrypt,
            ElasticKeyAlgorithm::Signature { .. } => KeyUsage::Sign,
        }
    }

    /// The header `alg` value.
    pub fn alg(&self) -> &'static str {
        match self {
            ElasticKeyAlgorithm::Encryption { alg, .. } => alg.as_str(),
            ElasticKeyAlgorithm::Signature { alg, .. } => alg.as_str(),
        }
    }

    /// The header `enc` value, for encryption keys.
    pub fn enc(&self) -> Option<&'static str> {
        match self {
            ElasticKeyAlgorithm::Encryption { enc, .. } => Some(enc.as_str()),
            ElasticKeyAlgorithm::Signature { .. } => None,
        }
    }

    /// Rejects combinations where the key family cannot serve the algorithm.
    pub fn validate(&self) -> Result<(), KmsError> {
        let valid = match self {
            ElasticKeyAlgorithm::Encryption {
                alg,
                enc,
                key_family,
            } => match alg {
                KeyManagement::Direct => *key_family == enc.aes_family(),
                KeyManagement::A128GcmKw => *key_family == KeyFamily::Aes128,
                KeyManagement::A192GcmKw => *key_family == KeyFamily::Aes192,
                KeyManagement::A256GcmKw => *key_family == KeyFamily::Aes256,
                KeyManagement::RsaOaep256 => key_family.is_rsa(),
                KeyManagement::EcdhEs => matches!(
                    key_family,
                    KeyFamily::EcdhP256 | KeyFamily::EcdhP384 | KeyFamily::EcdhP521
                ),
            },
            ElasticKeyAlgorithm::Signature { alg, key_family } => alg.accepts(*key_family),
        };

        if valid {
            Ok(())
        } else {
            Err(KmsError::invalid_request(format!(
                "key family {} cannot be used with {self}",
                self.key_family()
            )))
        }
    }
}

impl fmt::Display for ElasticKeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElasticKeyAlgorithm::Encryption {
                alg,
                enc,
                key_family,
            } => write!(f, "{}+{} ({})", alg.as_str(), enc.as_str(), key_family),
            ElasticKeyAlgorithm::Signature { alg, key_family } => {
                write!(f, "{} ({})", alg.as_str(), key_family)
            }
        }
    }
}
