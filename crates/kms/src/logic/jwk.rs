use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rsa::{RsaPrivateKey, pkcs8::DecodePrivateKey, traits::PublicKeyParts};
use serde::{Deserialize, Serialize};

use crate::error::KmsError;
use crate::logic::keygen::KeyFamily;

/// Public half of an asymmetric material key as a JWK (RFC 7517).
///
/// Stored in clear next to the wrapped private key, so it can be exported while sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicJwk {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

impl PublicJwk {
    fn new(kty: &str) -> Self {
        Self {
            kty: kty.to_string(),
            kid: None,
            alg: None,
            crv: None,
            n: None,
            e: None,
            x: None,
            y: None,
        }
    }
}

fn malformed(family: KeyFamily) -> KmsError {
    KmsError::invalid_request(format!("key material is not a valid {family} key"))
}

/// Checks that `material` is a well formed private key of `family` and derives its
/// public JWK. Symmetric families have no public half and yield `None`.
pub fn derive_public_jwk(
    family: KeyFamily,
    material: &[u8],
) -> Result<Option<PublicJwk>, KmsError> {
    macro_rules! ec {
        ($curve:ident, $crv:literal, $len:literal) => {{
            if material.len() != $len {
                return Err(malformed(family));
            }
            let secret = $curve::SecretKey::from_slice(material).map_err(|_| malformed(family))?;
            let point = secret.public_key().to_encoded_point(false);
            let (Some(x), Some(y)) = (point.x(), point.y()) else {
                return Err(malformed(family));
            };
            PublicJwk {
                crv: Some($crv.to_string()),
                x: Some(URL_SAFE_NO_PAD.encode(x)),
                y: Some(URL_SAFE_NO_PAD.encode(y)),
                ..PublicJwk::new("EC")
            }
        }};
    }

    let jwk = match family {
        KeyFamily::Rsa2048 | KeyFamily::Rsa3072 | KeyFamily::Rsa4096 => {
            let private = RsaPrivateKey::from_pkcs8_der(material).map_err(|_| malformed(family))?;
            private.validate().map_err(|_| malformed(family))?;
            if Some(private.size() * 8) != family.rsa_bits() {
                return Err(malformed(family));
            }
            PublicJwk {
                n: Some(URL_SAFE_NO_PAD.encode(private.n().to_bytes_be())),
                e: Some(URL_SAFE_NO_PAD.encode(private.e().to_bytes_be())),
                ..PublicJwk::new("RSA")
            }
        }
        KeyFamily::EcdsaP256 | KeyFamily::EcdhP256 => ec!(p256, "P-256", 32),
        KeyFamily::EcdsaP384 | KeyFamily::EcdhP384 => ec!(p384, "P-384", 48),
        KeyFamily::EcdsaP521 | KeyFamily::EcdhP521 => ec!(p521, "P-521", 66),
        KeyFamily::Ed25519 => {
            let seed: [u8; 32] = material.try_into().map_err(|_| malformed(family))?;
            let public = ed25519_dalek::SigningKey::from_bytes(&seed).verifying_key();
            PublicJwk {
                crv: Some("Ed25519".to_string()),
                x: Some(URL_SAFE_NO_PAD.encode(public.as_bytes())),
                ..PublicJwk::new("OKP")
            }
        }
        KeyFamily::Aes128
        | KeyFamily::Aes192
        | KeyFamily::Aes256
        | KeyFamily::Hmac256
        | KeyFamily::Hmac384
        | KeyFamily::Hmac512 => {
            if Some(material.len()) != family.symmetric_len() {
                return Err(malformed(family));
            }
            return Ok(None);
        }
    };
    Ok(Some(jwk))
}
