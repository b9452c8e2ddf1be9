use aes_gcm::{
    Aes128Gcm, Aes256Gcm, AesGcm,
    aead::{Aead, AeadCore, AeadInPlace, KeyInit, Nonce, Payload, Tag},
    aes::{Aes192, cipher::consts::U12},
};
use rand::{RngCore, rngs::OsRng};
use zeroize::Zeroizing;

use crate::error::KmsError;

pub(crate) type Aes192Gcm = AesGcm<Aes192, U12>;

pub(crate) const NONCE_LEN: usize = 12;
pub(crate) const TAG_LEN: usize = 16;

/// AEAD failure. Deliberately carries no detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AeadFailure;

pub(crate) fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// AES-256-GCM with a fresh nonce. Output layout: `nonce || ciphertext || tag`.
pub(crate) fn seal_aes256(key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, KmsError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| KmsError::internal("invalid AES-256 key length"))?;
    let nonce_bytes = random_nonce();
    let ciphertext = cipher
        .encrypt(
            Nonce::<Aes256Gcm>::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| KmsError::internal("AES-256-GCM encryption failed"))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub(crate) fn open_aes256(
    key: &[u8],
    sealed: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, AeadFailure> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(AeadFailure);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| AeadFailure)?;
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    cipher
        .decrypt(
            Nonce::<Aes256Gcm>::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| AeadFailure)
}

fn encrypt_detached_with<C>(
    key: &[u8],
    iv: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), AeadFailure>
where
    C: KeyInit + AeadInPlace + AeadCore<NonceSize = U12>,
{
    let cipher = C::new_from_slice(key).map_err(|_| AeadFailure)?;
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::<C>::from_slice(iv), aad, &mut buffer)
        .map_err(|_| AeadFailure)?;
    Ok((buffer, tag.to_vec()))
}

fn decrypt_detached_with<C>(
    key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, AeadFailure>
where
    C: KeyInit + AeadInPlace + AeadCore<NonceSize = U12>,
{
    if iv.len() != NONCE_LEN || tag.len() != TAG_LEN {
        return Err(AeadFailure);
    }
    let cipher = C::new_from_slice(key).map_err(|_| AeadFailure)?;
    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            Nonce::<C>::from_slice(iv),
            aad,
            &mut buffer,
            Tag::<C>::from_slice(tag),
        )
        .map_err(|_| AeadFailure)?;
    Ok(buffer)
}

/// AES-GCM keyed by length (16, 24 or 32 bytes). Returns `(ciphertext, tag)`.
pub(crate) fn gcm_encrypt_detached(
    key: &[u8],
    iv: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), AeadFailure> {
    match key.len() {
        16 => encrypt_detached_with::<Aes128Gcm>(key, iv, plaintext, aad),
        24 => encrypt_detached_with::<Aes192Gcm>(key, iv, plaintext, aad),
        32 => encrypt_detached_with::<Aes256Gcm>(key, iv, plaintext, aad),
        _ => Err(AeadFailure),
    }
}

pub(crate) fn gcm_decrypt_detached(
    key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, AeadFailure> {
    match key.len() {
        16 => decrypt_detached_with::<Aes128Gcm>(key, iv, ciphertext, tag, aad),
        24 => decrypt_detached_with::<Aes192Gcm>(key, iv, ciphertext, tag, aad),
        32 => decrypt_detached_with::<Aes256Gcm>(key, iv, ciphertext, tag, aad),
        _ => Err(AeadFailure),
    }
}
