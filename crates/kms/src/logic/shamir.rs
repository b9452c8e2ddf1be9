//! Shamir secret sharing over GF(2^8).
//!
//! The shared payload is `secret || SHA-256(secret)[..8]`, so a reconstruction from
//! inconsistent or tampered shares is detected instead of yielding a wrong secret.

use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::KmsError;

const CHECKSUM_LEN: usize = 8;

/// One share: an x coordinate in `1..=255` and one y byte per payload byte.
#[derive(Clone)]
pub struct Share {
    pub index: u8,
    pub value: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for Share {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Share")
            .field("index", &self.index)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

fn gf_mul(mut a: u8, mut b: u8) -> u8 {
    let mut product = 0u8;
    for _ in 0..8 {
        let mask = 0u8.wrapping_sub(b & 1);
        product ^= a & mask;
        let carry = 0u8.wrapping_sub(a >> 7);
        a = (a << 1) ^ (0x1b & carry);
        b >>= 1;
    }
    product
}

// a^254 == a^-1 in GF(2^8); maps 0 to 0.
fn gf_inv(a: u8) -> u8 {
    let mut result = 1u8;
    let mut base = a;
    let mut exponent = 254u8;
    while exponent > 0 {
        if exponent & 1 == 1 {
            result = gf_mul(result, base);
        }
        base = gf_mul(base, base);
        exponent >>= 1;
    }
    result
}

fn checksum(secret: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha256::digest(secret);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}

/// Splits `secret` into `shares` shares, any `threshold` of which reconstruct it.
pub fn split(secret: &[u8], threshold: u8, shares: u8) -> Result<Vec<Share>, KmsError> {
    if secret.is_empty() {
        return Err(KmsError::InvalidUnsealInput {
            msg: "secret must not be empty".to_string(),
        });
    }
    if threshold < 2 || shares < threshold {
        return Err(KmsError::InvalidUnsealInput {
            msg: format!("cannot split into {shares} shares with threshold {threshold}"),
        });
    }

    let mut payload = Zeroizing::new(Vec::with_capacity(secret.len() + CHECKSUM_LEN));
    payload.extend_from_slice(secret);
    payload.extend_from_slice(&checksum(secret));

    let mut output: Vec<Share> = (1..=shares)
        .map(|index| Share {
            index,
            value: Zeroizing::new(Vec::with_capacity(payload.len())),
        })
        .collect();

    let mut coefficients = Zeroizing::new(vec![0u8; threshold as usize]);
    for byte in payload.iter() {
        coefficients[0] = *byte;
        OsRng.fill_bytes(&mut coefficients[1..]);

        for share in output.iter_mut() {
            // Horner evaluation at x = index
            let mut y = 0u8;
            for coefficient in coefficients.iter().rev() {
                y = gf_mul(y, share.index) ^ coefficient;
            }
            share.value.push(y);
        }
    }

    Ok(output)
}

/// Reconstructs the secret from at least `threshold` shares and verifies its checksum.
pub fn combine(shares: &[Share], threshold: u8) -> Result<Zeroizing<Vec<u8>>, KmsError> {
    if threshold < 2 {
        return Err(KmsError::InvalidUnsealInput {
            msg: format!("threshold must be at least 2, got {threshold}"),
        });
    }
    if shares.len() < threshold as usize {
        return Err(KmsError::InsufficientShares {
            required: threshold,
            provided: shares.len(),
        });
    }

    let mut seen = [false; 256];
    for share in shares {
        if share.index == 0 {
            return Err(KmsError::InvalidUnsealInput {
                msg: "share index 0 is not allowed".to_string(),
            });
        }
        if seen[share.index as usize] {
            return Err(KmsError::InvalidUnsealInput {
                msg: format!("duplicate share index {}", share.index),
            });
        }
        seen[share.index as usize] = true;
    }

    let Some(first) = shares.first() else {
        return Err(KmsError::InsufficientShares {
            required: threshold,
            provided: 0,
        });
    };
    let payload_len = first.value.len();
    if shares.iter().any(|share| share.value.len() != payload_len) {
        return Err(KmsError::InvalidUnsealInput {
            msg: "shares have different lengths".to_string(),
        });
    }
    if payload_len <= CHECKSUM_LEN {
        return Err(KmsError::InvalidUnsealInput {
            msg: "shares are too short".to_string(),
        });
    }

    // Lagrange basis polynomials evaluated at x = 0.
    let basis: Vec<u8> = shares
        .iter()
        .map(|share_i| {
            let mut numerator = 1u8;
            let mut denominator = 1u8;
            for share_j in shares.iter().filter(|s| s.index != share_i.index) {
                numerator = gf_mul(numerator, share_j.index);
                denominator = gf_mul(denominator, share_i.index ^ share_j.index);
            }
            gf_mul(numerator, gf_inv(denominator))
        })
        .collect();

    let mut payload = Zeroizing::new(vec![0u8; payload_len]);
    for (position, out) in payload.iter_mut().enumerate() {
        *out = shares
            .iter()
            .zip(basis.iter())
            .fold(0u8, |acc, (share, l)| acc ^ gf_mul(share.value[position], *l));
    }

    let secret_len = payload_len - CHECKSUM_LEN;
    let expected = checksum(&payload[..secret_len]);
    if !bool::from(expected.ct_eq(&payload[secret_len..])) {
        return Err(KmsError::ShareIntegrity);
    }

    Ok(Zeroizing::new(payload[..secret_len].to_vec()))
}
