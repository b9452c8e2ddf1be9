use std::{fmt, sync::Arc};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::{RngCore, rngs::OsRng};
use rsa::{
    Oaep, RsaPrivateKey,
    pkcs8::DecodePrivateKey,
    signature::{SignatureEncoding, Signer, Verifier},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::KmsError;
use crate::logic::algorithm::{
    ContentEncryption, ElasticKeyAlgorithm, KeyManagement, KeyUsage, SignatureAlgorithm,
};
use crate::logic::cipher::{AeadFailure, gcm_decrypt_detached, gcm_encrypt_detached, random_nonce};
use crate::logic::elastic_key::ElasticKeyService;
use crate::logic::jwk::{PublicJwk, derive_public_jwk};
use crate::logic::keygen::KeyFamily;
use crate::logic::material_key::MaterialKey;
use crate::logic::{KmsEvent, KmsEventSender, publish_event};

const JWE_SEGMENTS: usize = 5;
const JWS_SEGMENTS: usize = 3;

/// Ephemeral EC public key (`epk`) of an ECDH-ES token, as a JWK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralPublicKey {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
}

impl EphemeralPublicKey {
    fn to_sec1(&self) -> Result<Vec<u8>, AeadFailure> {
        if self.kty != "EC" {
            return Err(AeadFailure);
        }
        let x = URL_SAFE_NO_PAD.decode(&self.x).map_err(|_| AeadFailure)?;
        let y = URL_SAFE_NO_PAD.decode(&self.y).map_err(|_| AeadFailure)?;
        let mut sec1 = Vec::with_capacity(1 + x.len() + y.len());
        sec1.push(0x04);
        sec1.extend_from_slice(&x);
        sec1.extend_from_slice(&y);
        Ok(sec1)
    }
}

/// Protected header shared by JWE and JWS tokens. `kid` is the elastic key id and
/// `ver` the material key version the token was produced with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoseHeader {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enc: Option<String>,
    pub kid: String,
    pub ver: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epk: Option<EphemeralPublicKey>,
}

impl JoseHeader {
    fn new(alg: &str, enc: Option<&str>, kid: &str, ver: u32) -> Self {
        Self {
            alg: alg.to_string(),
            enc: enc.map(str::to_string),
            kid: kid.to_string(),
            ver,
            iv: None,
            tag: None,
            epk: None,
        }
    }

    fn encode(&self) -> Result<String, KmsError> {
        let json = serde_json::to_vec(self).map_err(shared::error::CommonError::from)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    fn decode(segment: &str) -> Result<Self, KmsError> {
        let json = decode_segment(segment, "header")?;
        serde_json::from_slice(&json)
            .map_err(|e| KmsError::invalid_request(format!("malformed token header: {e}")))
    }
}

fn decode_segment(segment: &str, what: &str) -> Result<Vec<u8>, KmsError> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| KmsError::invalid_request(format!("malformed token {what}")))
}

fn split_compact(token: &str, segments: usize) -> Result<Vec<&str>, KmsError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != segments {
        return Err(KmsError::invalid_request(format!(
            "compact token must have {segments} segments, found {}",
            parts.len()
        )));
    }
    Ok(parts)
}

fn random_key(len: usize) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; len]);
    OsRng.fill_bytes(&mut key);
    key
}

fn rsa_private_key(der: &[u8]) -> Result<RsaPrivateKey, AeadFailure> {
    RsaPrivateKey::from_pkcs8_der(der).map_err(|_| AeadFailure)
}

/// Concat KDF (NIST SP 800-56A) with SHA-256, as used by ECDH-ES.
fn concat_kdf(
    z: &[u8],
    algorithm_id: &str,
    party_u: &[u8],
    party_v: &[u8],
    key_len: usize,
) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(key_len + 32));
    let mut counter: u32 = 1;
    while out.len() < key_len {
        let mut hasher = Sha256::new();
        hasher.update(counter.to_be_bytes());
        hasher.update(z);
        for field in [algorithm_id.as_bytes(), party_u, party_v] {
            hasher.update((field.len() as u32).to_be_bytes());
            hasher.update(field);
        }
        hasher.update(((key_len * 8) as u32).to_be_bytes());
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    out.truncate(key_len);
    out
}

/// Agreement with a fresh ephemeral key, for the sender side.
fn ecdh_ephemeral(
    family: KeyFamily,
    private: &[u8],
) -> Result<(Zeroizing<Vec<u8>>, EphemeralPublicKey), AeadFailure> {
    macro_rules! agree {
        ($curve:ident, $crv:literal) => {{
            let recipient = $curve::SecretKey::from_slice(private)
                .map_err(|_| AeadFailure)?
                .public_key();
            let ephemeral = $curve::ecdh::EphemeralSecret::random(&mut OsRng);
            let shared = ephemeral.diffie_hellman(&recipient);
            let point = ephemeral.public_key().to_encoded_point(false);
            let (Some(x), Some(y)) = (point.x(), point.y()) else {
                return Err(AeadFailure);
            };
            let epk = EphemeralPublicKey {
                kty: "EC".to_string(),
                crv: $crv.to_string(),
                x: URL_SAFE_NO_PAD.encode(x),
                y: URL_SAFE_NO_PAD.encode(y),
            };
            (Zeroizing::new(shared.raw_secret_bytes().to_vec()), epk)
        }};
    }

    Ok(match family {
        KeyFamily::EcdhP256 => agree!(p256, "P-256"),
        KeyFamily::EcdhP384 => agree!(p384, "P-384"),
        KeyFamily::EcdhP521 => agree!(p521, "P-521"),
        _ => return Err(AeadFailure),
    })
}

/// Agreement with the sender's ephemeral key, for the recipient side.
fn ecdh_static(
    family: KeyFamily,
    private: &[u8],
    epk: &EphemeralPublicKey,
) -> Result<Zeroizing<Vec<u8>>, AeadFailure> {
    let sec1 = epk.to_sec1()?;
    macro_rules! agree {
        ($curve:ident, $crv:literal) => {{
            if epk.crv != $crv {
                return Err(AeadFailure);
            }
            let secret = $curve::SecretKey::from_slice(private).map_err(|_| AeadFailure)?;
            let public = $curve::PublicKey::from_sec1_bytes(&sec1).map_err(|_| AeadFailure)?;
            let shared = $curve::ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
            Zeroizing::new(shared.raw_secret_bytes().to_vec())
        }};
    }

    Ok(match family {
        KeyFamily::EcdhP256 => agree!(p256, "P-256"),
        KeyFamily::EcdhP384 => agree!(p384, "P-384"),
        KeyFamily::EcdhP521 => agree!(p521, "P-521"),
        _ => return Err(AeadFailure),
    })
}

/// Content key and `encrypted_key` segment for a new token. Fills `iv`/`tag`/`epk`
/// into the header where the key management algorithm needs them.
fn wrap_cek(
    alg: KeyManagement,
    enc: ContentEncryption,
    key_family: KeyFamily,
    key: &[u8],
    header: &mut JoseHeader,
) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>), AeadFailure> {
    match alg {
        KeyManagement::Direct => Ok((Zeroizing::new(key.to_vec()), Vec::new())),
        KeyManagement::A128GcmKw | KeyManagement::A192GcmKw | KeyManagement::A256GcmKw => {
            let cek = random_key(enc.key_len());
            let iv = random_nonce();
            let (wrapped, tag) = gcm_encrypt_detached(key, &iv, &cek, &[])?;
            header.iv = Some(URL_SAFE_NO_PAD.encode(iv));
            header.tag = Some(URL_SAFE_NO_PAD.encode(tag));
            Ok((cek, wrapped))
        }
        KeyManagement::RsaOaep256 => {
            let cek = random_key(enc.key_len());
            let public = rsa_private_key(key)?.to_public_key();
            let wrapped = public
                .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &cek)
                .map_err(|_| AeadFailure)?;
            Ok((cek, wrapped))
        }
        KeyManagement::EcdhEs => {
            let (z, epk) = ecdh_ephemeral(key_family, key)?;
            header.epk = Some(epk);
            Ok((concat_kdf(&z, enc.as_str(), &[], &[], enc.key_len()), Vec::new()))
        }
    }
}

fn unwrap_cek(
    alg: KeyManagement,
    enc: ContentEncryption,
    key_family: KeyFamily,
    key: &[u8],
    header: &JoseHeader,
    encrypted_key: &[u8],
) -> Result<Zeroizing<Vec<u8>>, AeadFailure> {
    let cek = match alg {
        KeyManagement::Direct => {
            if !encrypted_key.is_empty() {
                return Err(AeadFailure);
            }
            Zeroizing::new(key.to_vec())
        }
        KeyManagement::A128GcmKw | KeyManagement::A192GcmKw | KeyManagement::A256GcmKw => {
            let (Some(iv), Some(tag)) = (&header.iv, &header.tag) else {
                return Err(AeadFailure);
            };
            let iv = URL_SAFE_NO_PAD.decode(iv).map_err(|_| AeadFailure)?;
            let tag = URL_SAFE_NO_PAD.decode(tag).map_err(|_| AeadFailure)?;
            gcm_decrypt_detached(key, &iv, encrypted_key, &tag, &[])?
        }
        KeyManagement::RsaOaep256 => Zeroizing::new(
            rsa_private_key(key)?
                .decrypt(Oaep::new::<Sha256>(), encrypted_key)
                .map_err(|_| AeadFailure)?,
        ),
        KeyManagement::EcdhEs => {
            if !encrypted_key.is_empty() {
                return Err(AeadFailure);
            }
            let epk = header.epk.as_ref().ok_or(AeadFailure)?;
            let z = ecdh_static(key_family, key, epk)?;
            concat_kdf(&z, enc.as_str(), &[], &[], enc.key_len())
        }
    };
    if cek.len() != enc.key_len() {
        return Err(AeadFailure);
    }
    Ok(cek)
}

fn sign_input(alg: SignatureAlgorithm, key: &[u8], input: &[u8]) -> Result<Vec<u8>, AeadFailure> {
    macro_rules! hmac_sign {
        ($digest:ty) => {{
            let mut mac = <Hmac<$digest> as Mac>::new_from_slice(key).map_err(|_| AeadFailure)?;
            mac.update(input);
            mac.finalize().into_bytes().to_vec()
        }};
    }
    macro_rules! rsa_sign {
        ($digest:ty) => {{
            let signing_key = rsa::pkcs1v15::SigningKey::<$digest>::new(rsa_private_key(key)?);
            signing_key.sign(input).to_vec()
        }};
    }
    macro_rules! ecdsa_sign {
        ($curve:ident) => {{
            let signing_key =
                $curve::ecdsa::SigningKey::from_slice(key).map_err(|_| AeadFailure)?;
            let signature: $curve::ecdsa::Signature = signing_key.sign(input);
            signature.to_bytes().to_vec()
        }};
    }

    Ok(match alg {
        SignatureAlgorithm::HS256 => hmac_sign!(Sha256),
        SignatureAlgorithm::HS384 => hmac_sign!(Sha384),
        SignatureAlgorithm::HS512 => hmac_sign!(Sha512),
        SignatureAlgorithm::RS256 => rsa_sign!(Sha256),
        SignatureAlgorithm::RS384 => rsa_sign!(Sha384),
        SignatureAlgorithm::RS512 => rsa_sign!(Sha512),
        SignatureAlgorithm::ES256 => ecdsa_sign!(p256),
        SignatureAlgorithm::ES384 => ecdsa_sign!(p384),
        SignatureAlgorithm::ES512 => ecdsa_sign!(p521),
        SignatureAlgorithm::EdDSA => {
            let seed: [u8; 32] = key.try_into().map_err(|_| AeadFailure)?;
            ed25519_dalek::SigningKey::from_bytes(&seed)
                .sign(input)
                .to_bytes()
                .to_vec()
        }
    })
}

fn verify_input(alg: SignatureAlgorithm, key: &[u8], input: &[u8], signature: &[u8]) -> bool {
    macro_rules! hmac_verify {
        ($digest:ty) => {{
            let Ok(mut mac) = <Hmac<$digest> as Mac>::new_from_slice(key) else {
                return false;
            };
            mac.update(input);
            mac.verify_slice(signature).is_ok()
        }};
    }
    macro_rules! rsa_verify {
        ($digest:ty) => {{
            let Ok(private) = rsa_private_key(key) else {
                return false;
            };
            let verifying_key = rsa::pkcs1v15::VerifyingKey::<$digest>::new(private.to_public_key());
            let Ok(signature) = rsa::pkcs1v15::Signature::try_from(signature) else {
                return false;
            };
            verifying_key.verify(input, &signature).is_ok()
        }};
    }
    macro_rules! ecdsa_verify {
        ($curve:ident) => {{
            let Ok(signing_key) = $curve::ecdsa::SigningKey::from_slice(key) else {
                return false;
            };
            let verifying_key = $curve::ecdsa::VerifyingKey::from(&signing_key);
            let Ok(signature) = $curve::ecdsa::Signature::from_slice(signature) else {
                return false;
            };
            verifying_key.verify(input, &signature).is_ok()
        }};
    }

    match alg {
        SignatureAlgorithm::HS256 => hmac_verify!(Sha256),
        SignatureAlgorithm::HS384 => hmac_verify!(Sha384),
        SignatureAlgorithm::HS512 => hmac_verify!(Sha512),
        SignatureAlgorithm::RS256 => rsa_verify!(Sha256),
        SignatureAlgorithm::RS384 => rsa_verify!(Sha384),
        SignatureAlgorithm::RS512 => rsa_verify!(Sha512),
        SignatureAlgorithm::ES256 => ecdsa_verify!(p256),
        SignatureAlgorithm::ES384 => ecdsa_verify!(p384),
        SignatureAlgorithm::ES512 => ecdsa_verify!(p521),
        SignatureAlgorithm::EdDSA => {
            let Ok(seed) = <[u8; 32]>::try_from(key) else {
                return false;
            };
            let Ok(signature) = ed25519_dalek::Signature::from_slice(signature) else {
                return false;
            };
            ed25519_dalek::SigningKey::from_bytes(&seed)
                .verifying_key()
                .verify_strict(input, &signature)
                .is_ok()
        }
    }
}

fn mismatch(header: &JoseHeader, expected: String, found: String) -> KmsError {
    KmsError::AlgorithmMismatch {
        elastic_key_id: header.kid.clone(),
        version: header.ver,
        expected,
        found,
    }
}

/// A freshly generated key handed to the caller. `encrypted` is a JWE of the private
/// bytes under the elastic key, for storing next to the data it protects.
pub struct GeneratedDataKey {
    pub family: KeyFamily,
    pub encrypted: String,
    pub private: Zeroizing<Vec<u8>>,
    pub public: Option<PublicJwk>,
}

impl fmt::Debug for GeneratedDataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedDataKey")
            .field("family", &self.family)
            .field("encrypted", &self.encrypted)
            .field("private", &"[REDACTED]")
            .field("public", &self.public)
            .finish()
    }
}

/// JWE encryption and JWS signing over elastic keys.
///
/// Holds no key state of its own: every call resolves material through the
/// [`ElasticKeyService`] and drops it before returning.
pub struct CryptoOperationEngine {
    keys: Arc<ElasticKeyService>,
    events: KmsEventSender,
}

impl CryptoOperationEngine {
    pub fn new(keys: Arc<ElasticKeyService>, events: KmsEventSender) -> Self {
        Self { keys, events }
    }

    /// Decodes the protected header of a JWE or JWS without verifying anything.
    pub fn inspect_header(token: &str) -> Result<JoseHeader, KmsError> {
        let header = token
            .split('.')
            .next()
            .ok_or_else(|| KmsError::invalid_request("empty token"))?;
        JoseHeader::decode(header)
    }

    /// Encrypts to a compact JWE with the active material version.
    pub async fn encrypt(
        &self,
        elastic_key_id: &str,
        plaintext: &[u8],
        cancel: &CancellationToken,
    ) -> Result<String, KmsError> {
        let material = self
            .keys
            .resolve_for_encrypt(elastic_key_id, KeyUsage::Encrypt, cancel)
            .await?;
        Self::encrypt_with(&material, plaintext)
    }

    /// Generates a key of `family` and returns it in clear together with a JWE of it
    /// under the elastic key. The generated key is not stored.
    pub async fn generate_data_key(
        &self,
        elastic_key_id: &str,
        family: KeyFamily,
        cancel: &CancellationToken,
    ) -> Result<GeneratedDataKey, KmsError> {
        let material = self
            .keys
            .resolve_for_encrypt(elastic_key_id, KeyUsage::Encrypt, cancel)
            .await?;
        let data_key = self.keys.draw_data_key(family, cancel).await?;
        let public = derive_public_jwk(family, data_key.material())?;
        let encrypted = Self::encrypt_with(&material, data_key.material())?;

        debug!(elastic_key_id, %family, "data key generated");
        publish_event(
            &self.events,
            KmsEvent::DataKeyGenerated {
                elastic_key_id: elastic_key_id.to_string(),
                family,
            },
        );
        Ok(GeneratedDataKey {
            family,
            encrypted,
            private: data_key.into_material(),
            public,
        })
    }

    fn encrypt_with(material: &MaterialKey, plaintext: &[u8]) -> Result<String, KmsError> {
        let elastic_key_id = material.elastic_key_id();
        let ElasticKeyAlgorithm::Encryption {
            alg,
            enc,
            key_family,
        } = material.algorithm()
        else {
            return Err(KmsError::invalid_request(format!(
                "elastic key {elastic_key_id} is not an encryption key"
            )));
        };

        let mut header = JoseHeader::new(
            alg.as_str(),
            Some(enc.as_str()),
            elastic_key_id,
            material.version(),
        );
        let (cek, encrypted_key) = wrap_cek(alg, enc, key_family, material.key(), &mut header)
            .map_err(|_| KmsError::internal(format!("{} key wrap failed", alg.as_str())))?;
        let protected = header.encode()?;

        let iv = random_nonce();
        let (ciphertext, tag) = gcm_encrypt_detached(&cek, &iv, plaintext, protected.as_bytes())
            .map_err(|_| KmsError::internal(format!("{} encryption failed", enc.as_str())))?;

        debug!(
            elastic_key_id,
            version = material.version(),
            alg = alg.as_str(),
            "jwe encrypted"
        );
        Ok(format!(
            "{protected}.{}.{}.{}.{}",
            URL_SAFE_NO_PAD.encode(encrypted_key),
            URL_SAFE_NO_PAD.encode(iv),
            URL_SAFE_NO_PAD.encode(ciphertext),
            URL_SAFE_NO_PAD.encode(tag)
        ))
    }

    /// Decrypts a compact JWE with the material version named in its header,
    /// which may be retired.
    pub async fn decrypt(
        &self,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        let result = self.decrypt_token(token, cancel).await;
        if let Err(e) = &result {
            self.report_failure("decrypt", token, e);
        }
        result
    }

    async fn decrypt_token(
        &self,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        let parts = split_compact(token, JWE_SEGMENTS)?;
        let header = JoseHeader::decode(parts[0])?;
        let encrypted_key = decode_segment(parts[1], "encrypted key")?;
        let iv = decode_segment(parts[2], "iv")?;
        let ciphertext = decode_segment(parts[3], "ciphertext")?;
        let tag = decode_segment(parts[4], "tag")?;

        let material = self
            .keys
            .resolve_for_decrypt(&header.kid, header.ver, cancel)
            .await?;
        let (alg, enc, key_family) = Self::expect_encryption(&material, &header)?;

        let failed = || KmsError::Decryption {
            key_id: header.kid.clone(),
            version: header.ver,
        };
        let cek = unwrap_cek(alg, enc, key_family, material.key(), &header, &encrypted_key)
            .map_err(|_| failed())?;
        gcm_decrypt_detached(&cek, &iv, &ciphertext, &tag, parts[0].as_bytes())
            .map_err(|_| failed())
    }

    fn expect_encryption(
        material: &MaterialKey,
        header: &JoseHeader,
    ) -> Result<(KeyManagement, ContentEncryption, KeyFamily), KmsError> {
        let ElasticKeyAlgorithm::Encryption {
            alg,
            enc,
            key_family,
        } = material.algorithm()
        else {
            return Err(KmsError::invalid_request(format!(
                "elastic key {} is not an encryption key",
                header.kid
            )));
        };
        if header.alg != alg.as_str() {
            return Err(mismatch(header, alg.as_str().to_string(), header.alg.clone()));
        }
        if header.enc.as_deref() != Some(enc.as_str()) {
            return Err(mismatch(
                header,
                enc.as_str().to_string(),
                header.enc.clone().unwrap_or_default(),
            ));
        }
        Ok((alg, enc, key_family))
    }

    /// Signs to a compact JWS with the active material version.
    pub async fn sign(
        &self,
        elastic_key_id: &str,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<String, KmsError> {
        let material = self
            .keys
            .resolve_for_encrypt(elastic_key_id, KeyUsage::Sign, cancel)
            .await?;
        let ElasticKeyAlgorithm::Signature { alg, .. } = material.algorithm() else {
            return Err(KmsError::invalid_request(format!(
                "elastic key {elastic_key_id} is not a signing key"
            )));
        };

        let protected =
            JoseHeader::new(alg.as_str(), None, elastic_key_id, material.version()).encode()?;
        let signing_input = format!("{protected}.{}", URL_SAFE_NO_PAD.encode(payload));
        let signature = sign_input(alg, material.key(), signing_input.as_bytes())
            .map_err(|_| KmsError::internal(format!("{} signing failed", alg.as_str())))?;

        debug!(
            elastic_key_id,
            version = material.version(),
            alg = alg.as_str(),
            "jws signed"
        );
        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    /// Verifies a compact JWS and returns its payload.
    pub async fn verify(&self, token: &str, cancel: &CancellationToken) -> Result<Vec<u8>, KmsError> {
        let result = self.verify_token(token, cancel).await;
        if let Err(e) = &result {
            self.report_failure("verify", token, e);
        }
        result
    }

    async fn verify_token(&self, token: &str, cancel: &CancellationToken) -> Result<Vec<u8>, KmsError> {
        let parts = split_compact(token, JWS_SEGMENTS)?;
        let header = JoseHeader::decode(parts[0])?;
        let payload = decode_segment(parts[1], "payload")?;
        let signature = decode_segment(parts[2], "signature")?;

        let material = self
            .keys
            .resolve_for_decrypt(&header.kid, header.ver, cancel)
            .await?;
        let ElasticKeyAlgorithm::Signature { alg, .. } = material.algorithm() else {
            return Err(KmsError::invalid_request(format!(
                "elastic key {} is not a signing key",
                header.kid
            )));
        };
        if header.alg != alg.as_str() {
            return Err(mismatch(&header, alg.as_str().to_string(), header.alg.clone()));
        }

        let signing_input = &token[..parts[0].len() + 1 + parts[1].len()];
        if !verify_input(alg, material.key(), signing_input.as_bytes(), &signature) {
            return Err(KmsError::SignatureInvalid {
                key_id: header.kid,
                version: header.ver,
            });
        }
        Ok(payload)
    }

    fn report_failure(&self, operation: &str, token: &str, error: &KmsError) {
        if matches!(error, KmsError::Cancelled) {
            return;
        }
        let header = Self::inspect_header(token).ok();
        let elastic_key_id = header.as_ref().map(|h| h.kid.clone());
        let version = header.as_ref().map(|h| h.ver);
        warn!(
            operation,
            elastic_key_id = ?elastic_key_id,
            version = ?version,
            error = error.name(),
            "token rejected"
        );
        publish_event(
            &self.events,
            KmsEvent::DecryptFailed {
                elastic_key_id,
                version,
                reason: error.name().to_string(),
            },
        );
    }
}
