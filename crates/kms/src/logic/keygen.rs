use std::{fmt, str::FromStr};

use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::KmsError;

/// Kinds of key material the pool can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyFamily {
    #[serde(rename = "RSA-2048")]
    Rsa2048,
    #[serde(rename = "RSA-3072")]
    Rsa3072,
    #[serde(rename = "RSA-4096")]
    Rsa4096,
    #[serde(rename = "ECDSA-P256")]
    EcdsaP256,
    #[serde(rename = "ECDSA-P384")]
    EcdsaP384,
    #[serde(rename = "ECDSA-P521")]
    EcdsaP521,
    #[serde(rename = "ECDH-P256")]
    EcdhP256,
    #[serde(rename = "ECDH-P384")]
    EcdhP384,
    #[serde(rename = "ECDH-P521")]
    EcdhP521,
    #[serde(rename = "Ed25519")]
    Ed25519,
    #[serde(rename = "AES-128")]
    Aes128,
    #[serde(rename = "AES-192")]
    Aes192,
    #[serde(rename = "AES-256")]
    Aes256,
    #[serde(rename = "HMAC-256")]
    Hmac256,
    #[serde(rename = "HMAC-384")]
    Hmac384,
    #[serde(rename = "HMAC-512")]
    Hmac512,
}

impl KeyFamily {
    pub const ALL: [KeyFamily; 16] = [
        KeyFamily::Rsa2048,
        KeyFamily::Rsa3072,
        KeyFamily::Rsa4096,
        KeyFamily::EcdsaP256,
        KeyFamily::EcdsaP384,
        KeyFamily::EcdsaP521,
        KeyFamily::EcdhP256,
        KeyFamily::EcdhP384,
        KeyFamily::EcdhP521,
        KeyFamily::Ed25519,
        KeyFamily::Aes128,
        KeyFamily::Aes192,
        KeyFamily::Aes256,
        KeyFamily::Hmac256,
        KeyFamily::Hmac384,
        KeyFamily::Hmac512,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyFamily::Rsa2048 => "RSA-2048",
            KeyFamily::Rsa3072 => "RSA-3072",
            KeyFamily::Rsa4096 => "RSA-4096",
            KeyFamily::EcdsaP256 => "ECDSA-P256",
            KeyFamily::EcdsaP384 => "ECDSA-P384",
            KeyFamily::EcdsaP521 => "ECDSA-P521",
            KeyFamily::EcdhP256 => "ECDH-P256",
            KeyFamily::EcdhP384 => "ECDH-P384",
            KeyFamily::EcdhP521 => "ECDH-P521",
            KeyFamily::Ed25519 => "Ed25519",
            KeyFamily::Aes128 => "AES-128",
            KeyFamily::Aes192 => "AES-192",
            KeyFamily::Aes256 => "AES-256",
            KeyFamily::Hmac256 => "HMAC-256",
            KeyFamily::Hmac384 => "HMAC-384",
            KeyFamily::Hmac512 => "HMAC-512",
        }
    }

    pub fn is_rsa(&self) -> bool {
        matches!(
            self,
            KeyFamily::Rsa2048 | KeyFamily::Rsa3072 | KeyFamily::Rsa4096
        )
    }

    pub fn rsa_bits(&self) -> Option<usize> {
        match self {
            KeyFamily::Rsa2048 => Some(2048),
            KeyFamily::Rsa3072 => Some(3072),
            KeyFamily::Rsa4096 => Some(4096),
            _ => None,
        }
    }

    /// Length in bytes of raw symmetric material, `None` for asymmetric families.
    pub fn symmetric_len(&self) -> Option<usize> {
        match self {
            KeyFamily::Aes128 => Some(16),
            KeyFamily::Aes192 => Some(24),
            KeyFamily::Aes256 | KeyFamily::Hmac256 => Some(32),
            KeyFamily::Hmac384 => Some(48),
            KeyFamily::Hmac512 => Some(64),
            _ => None,
        }
    }
}

impl fmt::Display for KeyFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyFamily {
    type Err = KmsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KeyFamily::ALL
            .iter()
            .find(|family| family.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| KmsError::invalid_request(format!("unknown key family: {s}")))
    }
}

/// Freshly generated key material.
///
/// Encodings: raw bytes for AES and HMAC, PKCS#8 DER for RSA, the big-endian
/// private scalar for EC families and the 32 byte seed for Ed25519.
pub struct PooledKey {
    family: KeyFamily,
    material: Zeroizing<Vec<u8>>,
}

impl PooledKey {
    pub fn family(&self) -> KeyFamily {
        self.family
    }

    pub fn material(&self) -> &[u8] {
        &self.material
    }

    pub fn into_material(self) -> Zeroizing<Vec<u8>> {
        self.material
    }
}

impl fmt::Debug for PooledKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledKey")
            .field("family", &self.family)
            .field("material", &"[REDACTED]")
            .finish()
    }
}

/// Generates one key synchronously. CPU bound for RSA; call from a blocking context.
pub fn generate_key(family: KeyFamily) -> Result<PooledKey, KmsError> {
    let material = match family {
        KeyFamily::Rsa2048 | KeyFamily::Rsa3072 | KeyFamily::Rsa4096 => {
            use rsa::pkcs8::EncodePrivateKey;

            let bits = family.rsa_bits().unwrap_or(2048);
            let private_key = rsa::RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| {
                KmsError::internal(format!("failed to generate {family} key: {e}"))
            })?;
            let der = private_key.to_pkcs8_der().map_err(|e| {
                KmsError::internal(format!("failed to encode {family} key: {e}"))
            })?;
            Zeroizing::new(der.as_bytes().to_vec())
        }
        KeyFamily::EcdsaP256 | KeyFamily::EcdhP256 => {
            Zeroizing::new(p256::SecretKey::random(&mut OsRng).to_bytes().to_vec())
        }
        KeyFamily::EcdsaP384 | KeyFamily::EcdhP384 => {
            Zeroizing::new(p384::SecretKey::random(&mut OsRng).to_bytes().to_vec())
        }
        KeyFamily::EcdsaP521 | KeyFamily::EcdhP521 => {
            Zeroizing::new(p521::SecretKey::random(&mut OsRng).to_bytes().to_vec())
        }
        KeyFamily::Ed25519 => Zeroizing::new(
            ed25519_dalek::SigningKey::generate(&mut OsRng)
                .to_bytes()
                .to_vec(),
        ),
        KeyFamily::Aes128
        | KeyFamily::Aes192
        | KeyFamily::Aes256
        | KeyFamily::Hmac256
        | KeyFamily::Hmac384
        | KeyFamily::Hmac512 => {
            let len = family.symmetric_len().unwrap_or(32);
            let mut bytes = Zeroizing::new(vec![0u8; len]);
            OsRng.fill_bytes(&mut bytes);
            bytes
        }
    };

    Ok(PooledKey { family, material })
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;

    #[test]
    fn test_symmetric_lengths() {
        shared::setup_test!();
        for (family, len) in [
            (KeyFamily::Aes128, 16),
            (KeyFamily::Aes192, 24),
            (KeyFamily::Aes256, 32),
            (KeyFamily::Hmac256, 32),
            (KeyFamily::Hmac384, 48),
            (KeyFamily::Hmac512, 64),
        ] {
            let key = generate_key(family).unwrap();
            assert_eq!(key.family(), family);
            assert_eq!(key.material().len(), len);
        }
    }

    #[test]
    fn test_asymmetric_encodings() {
        shared::setup_test!();
        use rsa::pkcs8::DecodePrivateKey;

        let rsa_key = generate_key(KeyFamily::Rsa2048).unwrap();
        let parsed = rsa::RsaPrivateKey::from_pkcs8_der(rsa_key.material()).unwrap();
        assert_eq!(rsa::traits::PublicKeyParts::size(&parsed), 256);

        let p256_key = generate_key(KeyFamily::EcdsaP256).unwrap();
        assert_eq!(p256_key.material().len(), 32);
        p256::SecretKey::from_slice(p256_key.material()).unwrap();

        let p384_key = generate_key(KeyFamily::EcdhP384).unwrap();
        assert_eq!(p384_key.material().len(), 48);

        let p521_key = generate_key(KeyFamily::EcdsaP521).unwrap();
        assert_eq!(p521_key.material().len(), 66);

        let ed_key = generate_key(KeyFamily::Ed25519).unwrap();
        assert_eq!(ed_key.material().len(), 32);
    }

    #[test]
    fn test_keys_are_distinct() {
        shared::setup_test!();
        let a = generate_key(KeyFamily::Aes256).unwrap();
        let b = generate_key(KeyFamily::Aes256).unwrap();
        assert_ne!(a.material(), b.material());
    }

    #[test]
    fn test_family_names() {
        shared::setup_test!();
        for family in KeyFamily::ALL {
            assert_eq!(family.as_str().parse::<KeyFamily>().unwrap(), family);
            let json = serde_json::to_string(&family).unwrap();
            assert_eq!(json, format!("\"{}\"", family.as_str()));
        }
        assert!("DES".parse::<KeyFamily>().is_err());
    }

    #[test]
    fn test_debug_redacts_material() {
        shared::setup_test!();
        let key = generate_key(KeyFamily::Hmac256).unwrap();
        let debug = format!("{key:?}");
        assert!(debug.contains("REDACTED"));
        assert!(debug.contains("Hmac256"));
    }
}
