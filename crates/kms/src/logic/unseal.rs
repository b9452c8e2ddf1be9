use std::{fmt, path::Path, path::PathBuf, sync::Arc};

use base64::Engine;
use hkdf::Hkdf;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared::error::CommonError;
use tracing::{info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::error::KmsError;
use crate::logic::config::UnsealConfig;
use crate::logic::shamir::{self, Share};
use crate::logic::{KmsEvent, KmsEventSender, publish_event};

pub const UNSEAL_KEY_LEN: usize = 32;
const SYSTEM_UNSEAL_INFO: &[u8] = b"kms/system-unseal/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsealMode {
    Simple,
    Shamir,
    System,
}

impl fmt::Display for UnsealMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnsealMode::Simple => "simple",
            UnsealMode::Shamir => "shamir",
            UnsealMode::System => "system",
        })
    }
}

/// Secret input supplied by an operator. In shamir mode `index` is the share's x coordinate.
#[derive(Clone)]
pub struct UnsealSecret {
    index: u8,
    bytes: Zeroizing<Vec<u8>>,
}

impl UnsealSecret {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            index: 0,
            bytes: Zeroizing::new(bytes),
        }
    }

    pub fn share(index: u8, bytes: Vec<u8>) -> Self {
        Self {
            index,
            bytes: Zeroizing::new(bytes),
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Parses `<index>:<base64>` for shares or a bare base64 secret.
    pub fn from_encoded(encoded: &str) -> Result<Self, KmsError> {
        let encoded = encoded.trim();
        let (index, payload) = match encoded.split_once(':') {
            Some((index, payload)) => {
                let index = index.parse::<u8>().map_err(|_| KmsError::InvalidUnsealInput {
                    msg: "share index must be a number between 1 and 255".to_string(),
                })?;
                (index, payload)
            }
            None => (0, encoded),
        };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|_| KmsError::InvalidUnsealInput {
                msg: "unseal secret is not valid base64".to_string(),
            })?;
        Ok(Self {
            index,
            bytes: Zeroizing::new(bytes),
        })
    }

    pub fn to_encoded(&self) -> Zeroizing<String> {
        let payload = base64::engine::general_purpose::STANDARD.encode(self.bytes.as_slice());
        let encoded = if self.index == 0 {
            payload
        } else {
            format!("{}:{}", self.index, payload)
        };
        Zeroizing::new(encoded)
    }
}

impl fmt::Debug for UnsealSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsealSecret")
            .field("index", &self.index)
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Reads one encoded secret per file.
pub fn read_unseal_secret_files(paths: &[PathBuf]) -> Result<Vec<UnsealSecret>, KmsError> {
    paths
        .iter()
        .map(|path| read_unseal_secret_file(path))
        .collect()
}

fn read_unseal_secret_file(path: &Path) -> Result<UnsealSecret, KmsError> {
    let mut contents = std::fs::read_to_string(path).map_err(CommonError::from)?;
    let secret = UnsealSecret::from_encoded(&contents);
    contents.zeroize();
    secret
}

/// Splits a fresh random unseal key into shares for operators.
pub fn generate_unseal_shares(threshold: u8, shares: u8) -> Result<Vec<UnsealSecret>, KmsError> {
    use rand::RngCore;

    let mut key = Zeroizing::new([0u8; UNSEAL_KEY_LEN]);
    rand::rngs::OsRng.fill_bytes(&mut key[..]);
    Ok(shamir::split(&key[..], threshold, shares)?
        .into_iter()
        .map(|share| UnsealSecret {
            index: share.index,
            bytes: share.value,
        })
        .collect())
}

/// The 256 bit key that protects the root key. Zeroized on drop.
#[derive(Clone)]
pub struct UnsealKey(Zeroizing<[u8; UNSEAL_KEY_LEN]>);

impl UnsealKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KmsError> {
        let array: [u8; UNSEAL_KEY_LEN] =
            bytes.try_into().map_err(|_| KmsError::InvalidUnsealInput {
                msg: format!("unseal key must be {UNSEAL_KEY_LEN} bytes"),
            })?;
        Ok(Self(Zeroizing::new(array)))
    }

    pub fn as_bytes(&self) -> &[u8; UNSEAL_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for UnsealKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UnsealKey([REDACTED])")
    }
}

/// Turns operator secrets into the unseal key.
pub trait UnsealStrategy: Send + Sync {
    fn mode(&self) -> UnsealMode;
    fn derive_key(&self, secrets: &[UnsealSecret]) -> Result<UnsealKey, KmsError>;
}

pub struct SimpleUnseal;

impl UnsealStrategy for SimpleUnseal {
    fn mode(&self) -> UnsealMode {
        UnsealMode::Simple
    }

    fn derive_key(&self, secrets: &[UnsealSecret]) -> Result<UnsealKey, KmsError> {
        match secrets {
            [secret] => UnsealKey::from_bytes(secret.bytes()),
            _ => Err(KmsError::InvalidUnsealInput {
                msg: format!("simple unseal expects exactly 1 secret, got {}", secrets.len()),
            }),
        }
    }
}

/// M-of-N reconstruction. Share indexes run from 1 to `shares`.
pub struct ShamirUnseal {
    threshold: u8,
    shares: u8,
}

impl ShamirUnseal {
    pub fn new(threshold: u8, shares: u8) -> Result<Self, KmsError> {
        if threshold < 2 || shares < threshold {
            return Err(KmsError::InvalidUnsealInput {
                msg: format!("cannot reconstruct from {shares} shares with threshold {threshold}"),
            });
        }
        Ok(Self { threshold, shares })
    }
}

impl UnsealStrategy for ShamirUnseal {
    fn mode(&self) -> UnsealMode {
        UnsealMode::Shamir
    }

    fn derive_key(&self, secrets: &[UnsealSecret]) -> Result<UnsealKey, KmsError> {
        if let Some(secret) = secrets.iter().find(|s| s.index > self.shares) {
            return Err(KmsError::InvalidUnsealInput {
                msg: format!(
                    "share index {} is outside 1..={}",
                    secret.index, self.shares
                ),
            });
        }
        let shares: Vec<Share> = secrets
            .iter()
            .map(|secret| Share {
                index: secret.index,
                value: secret.bytes.clone(),
            })
            .collect();
        let secret = shamir::combine(&shares, self.threshold)?;
        UnsealKey::from_bytes(&secret)
    }
}

/// Stable, host-specific identifiers the system unseal key is derived from.
pub trait FingerprintSource: Send + Sync {
    fn fingerprint(&self) -> Result<Vec<Vec<u8>>, KmsError>;
}

/// Reads the machine id and the hostname.
pub struct HostFingerprint;

const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

impl FingerprintSource for HostFingerprint {
    fn fingerprint(&self) -> Result<Vec<Vec<u8>>, KmsError> {
        let machine_id = MACHINE_ID_PATHS
            .iter()
            .find_map(|path| std::fs::read_to_string(path).ok())
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| KmsError::InvalidUnsealInput {
                msg: "no machine id available for system unseal".to_string(),
            })?;

        let hostname = std::fs::read_to_string("/proc/sys/kernel/hostname")
            .ok()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .map(|name| name.trim().to_string())
            .unwrap_or_default();

        Ok(vec![machine_id.into_bytes(), hostname.into_bytes()])
    }
}

pub struct SystemUnseal {
    salt: Vec<u8>,
    source: Arc<dyn FingerprintSource>,
}

impl SystemUnseal {
    pub fn new(salt: Vec<u8>, source: Arc<dyn FingerprintSource>) -> Self {
        Self { salt, source }
    }
}

impl UnsealStrategy for SystemUnseal {
    fn mode(&self) -> UnsealMode {
        UnsealMode::System
    }

    fn derive_key(&self, secrets: &[UnsealSecret]) -> Result<UnsealKey, KmsError> {
        if !secrets.is_empty() {
            warn!(
                count = secrets.len(),
                "system unseal ignores operator supplied secrets"
            );
        }

        // Length-prefix each component so ("ab", "c") and ("a", "bc") differ.
        let mut ikm = Zeroizing::new(Vec::new());
        for component in self.source.fingerprint()? {
            ikm.extend_from_slice(&(component.len() as u32).to_be_bytes());
            ikm.extend_from_slice(&Sha256::digest(&component));
        }

        let hkdf = Hkdf::<Sha256>::new(Some(&self.salt), &ikm);
        let mut okm = Zeroizing::new([0u8; UNSEAL_KEY_LEN]);
        hkdf.expand(SYSTEM_UNSEAL_INFO, &mut okm[..])
            .map_err(|_| KmsError::internal("hkdf expand failed"))?;
        Ok(UnsealKey(okm))
    }
}

pub fn unseal_strategy_from_config(
    config: &UnsealConfig,
) -> Result<Box<dyn UnsealStrategy>, KmsError> {
    let strategy: Box<dyn UnsealStrategy> = match config.mode {
        UnsealMode::Simple => Box::new(SimpleUnseal),
        UnsealMode::Shamir => Box::new(ShamirUnseal::new(config.threshold, config.shares)?),
        UnsealMode::System => Box::new(SystemUnseal::new(
            config.decoded_system_salt()?,
            Arc::new(HostFingerprint),
        )),
    };
    Ok(strategy)
}

/// Produces and caches the unseal key for the lifetime of one unsealed session.
pub struct UnsealProvider {
    strategy: Box<dyn UnsealStrategy>,
    cached: RwLock<Option<UnsealKey>>,
    events: KmsEventSender,
}

impl UnsealProvider {
    pub fn new(strategy: Box<dyn UnsealStrategy>, events: KmsEventSender) -> Self {
        Self {
            strategy,
            cached: RwLock::new(None),
            events,
        }
    }

    pub fn mode(&self) -> UnsealMode {
        self.strategy.mode()
    }

    /// Idempotent: once a key is cached, further calls return it without touching `secrets`.
    pub fn unseal(&self, secrets: &[UnsealSecret]) -> Result<UnsealKey, KmsError> {
        if let Some(key) = self.cached.read().as_ref() {
            return Ok(key.clone());
        }

        let mut cached = self.cached.write();
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }

        match self.strategy.derive_key(secrets) {
            Ok(key) => {
                info!(mode = %self.mode(), "unseal key derived");
                *cached = Some(key.clone());
                publish_event(&self.events, KmsEvent::UnsealSucceeded { mode: self.mode() });
                Ok(key)
            }
            Err(e) => {
                warn!(mode = %self.mode(), error = e.name(), "unseal failed");
                publish_event(
                    &self.events,
                    KmsEvent::UnsealFailed {
                        mode: self.mode(),
                        reason: e.name().to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    /// Derives a key from `secrets` without consulting or changing the cache.
    pub fn derive(&self, secrets: &[UnsealSecret]) -> Result<UnsealKey, KmsError> {
        self.strategy.derive_key(secrets)
    }

    /// Replaces the cached key, after the root key was re-sealed under `key`.
    pub fn replace(&self, key: UnsealKey) {
        *self.cached.write() = Some(key);
    }

    pub fn unseal_key(&self) -> Option<UnsealKey> {
        self.cached.read().clone()
    }

    pub fn is_unsealed(&self) -> bool {
        self.cached.read().is_some()
    }

    /// Drops the cached key; the next unseal needs secrets again.
    pub fn reseal(&self) {
        self.cached.write().take();
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use crate::logic::event_channel;

    struct FixedFingerprint(Vec<Vec<u8>>);

    impl FingerprintSource for FixedFingerprint {
        fn fingerprint(&self) -> Result<Vec<Vec<u8>>, KmsError> {
            Ok(self.0.clone())
        }
    }

    fn system(salt: &[u8], components: &[&[u8]]) -> SystemUnseal {
        SystemUnseal::new(
            salt.to_vec(),
            Arc::new(FixedFingerprint(
                components.iter().map(|c| c.to_vec()).collect(),
            )),
        )
    }

    #[test]
    fn test_simple_unseal_requires_one_32_byte_secret() {
        shared::setup_test!();
        let key = SimpleUnseal
            .derive_key(&[UnsealSecret::new(vec![3u8; 32])])
            .unwrap();
        assert_eq!(key.as_bytes(), &[3u8; 32]);

        assert!(matches!(
            SimpleUnseal.derive_key(&[]),
            Err(KmsError::InvalidUnsealInput { .. })
        ));
        assert!(matches!(
            SimpleUnseal.derive_key(&[UnsealSecret::new(vec![1u8; 16])]),
            Err(KmsError::InvalidUnsealInput { .. })
        ));
    }

    #[test]
    fn test_shamir_unseal_from_generated_shares() {
        shared::setup_test!();
        let shares = generate_unseal_shares(3, 5).unwrap();
        let strategy = ShamirUnseal::new(3, 5).unwrap();

        let a = strategy
            .derive_key(&[shares[0].clone(), shares[2].clone(), shares[4].clone()])
            .unwrap();
        let b = strategy
            .derive_key(&[shares[1].clone(), shares[3].clone(), shares[4].clone()])
            .unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());

        let err = strategy
            .derive_key(&[shares[0].clone(), shares[1].clone()])
            .unwrap_err();
        assert!(matches!(err, KmsError::InsufficientShares { .. }));
    }

    #[test]
    fn test_shamir_unseal_rejects_bad_parameters() {
        shared::setup_test!();
        assert!(ShamirUnseal::new(0, 0).is_err());
        assert!(ShamirUnseal::new(1, 5).is_err());
        assert!(ShamirUnseal::new(4, 3).is_err());

        let strategy = ShamirUnseal::new(2, 3).unwrap();
        assert!(matches!(
            strategy.derive_key(&[]),
            Err(KmsError::InsufficientShares {
                required: 2,
                provided: 0
            })
        ));

        // Share 4 does not exist in a 2-of-3 scheme.
        let shares = generate_unseal_shares(2, 5).unwrap();
        assert!(matches!(
            strategy.derive_key(&[shares[0].clone(), shares[3].clone()]),
            Err(KmsError::InvalidUnsealInput { .. })
        ));
        strategy
            .derive_key(&[shares[0].clone(), shares[2].clone()])
            .unwrap();
    }

    #[test]
    fn test_system_unseal_is_deterministic_per_host_and_salt() {
        shared::setup_test!();
        let salt = [5u8; 16];
        let a = system(&salt, &[b"machine-a", b"host"]).derive_key(&[]).unwrap();
        let b = system(&salt, &[b"machine-a", b"host"]).derive_key(&[]).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());

        let other_host = system(&salt, &[b"machine-b", b"host"]).derive_key(&[]).unwrap();
        assert_ne!(a.as_bytes(), other_host.as_bytes());

        let other_salt = system(&[6u8; 16], &[b"machine-a", b"host"])
            .derive_key(&[])
            .unwrap();
        assert_ne!(a.as_bytes(), other_salt.as_bytes());

        let shifted = system(&salt, &[b"machine-", b"ahost"]).derive_key(&[]).unwrap();
        assert_ne!(a.as_bytes(), shifted.as_bytes());
    }

    #[test]
    fn test_encoded_secret_parsing() {
        shared::setup_test!();
        let share = UnsealSecret::share(3, vec![1, 2, 3]);
        let parsed = UnsealSecret::from_encoded(&share.to_encoded()).unwrap();
        assert_eq!(parsed.index(), 3);
        assert_eq!(parsed.bytes(), &[1, 2, 3]);

        let bare = UnsealSecret::from_encoded("AQID\n").unwrap();
        assert_eq!(bare.index(), 0);
        assert_eq!(bare.bytes(), &[1, 2, 3]);

        assert!(UnsealSecret::from_encoded("300:AQID").is_err());
        assert!(UnsealSecret::from_encoded("1:not base64!").is_err());
    }

    #[test]
    fn test_read_secret_files() {
        shared::setup_test!();
        let dir = tempfile::tempdir().unwrap();
        let shares = generate_unseal_shares(2, 3).unwrap();
        let paths: Vec<PathBuf> = shares
            .iter()
            .take(2)
            .enumerate()
            .map(|(i, share)| {
                let path = dir.path().join(format!("share-{i}"));
                std::fs::write(&path, share.to_encoded().as_bytes()).unwrap();
                path
            })
            .collect();

        let secrets = read_unseal_secret_files(&paths).unwrap();
        let strategy = ShamirUnseal::new(2, 3).unwrap();
        let key = strategy.derive_key(&secrets).unwrap();
        let expected = strategy.derive_key(&shares[1..]).unwrap();
        assert_eq!(key.as_bytes(), expected.as_bytes());
    }

    #[tokio::test]
    async fn test_provider_caches_and_reseals() {
        shared::setup_test!();
        let (tx, mut rx) = event_channel();
        let provider = UnsealProvider::new(Box::new(SimpleUnseal), tx);
        assert!(!provider.is_unsealed());

        let first = provider.unseal(&[UnsealSecret::new(vec![9u8; 32])]).unwrap();
        assert!(provider.is_unsealed());
        assert_eq!(
            rx.recv().await.unwrap(),
            KmsEvent::UnsealSucceeded {
                mode: UnsealMode::Simple
            }
        );

        // Cached: different secrets are ignored.
        let second = provider.unseal(&[]).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());

        provider.reseal();
        assert!(!provider.is_unsealed());
        assert!(provider.unseal_key().is_none());
        let err = provider.unseal(&[]).unwrap_err();
        assert!(matches!(err, KmsError::InvalidUnsealInput { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            KmsEvent::UnsealFailed { .. }
        ));
    }

    #[test]
    fn test_strategy_from_config() {
        shared::setup_test!();
        let mut config = UnsealConfig::default();
        assert_eq!(
            unseal_strategy_from_config(&config).unwrap().mode(),
            UnsealMode::Shamir
        );
        let degenerate = UnsealConfig {
            threshold: 0,
            shares: 0,
            ..UnsealConfig::default()
        };
        assert!(unseal_strategy_from_config(&degenerate).is_err());

        config.mode = UnsealMode::Simple;
        assert_eq!(
            unseal_strategy_from_config(&config).unwrap().mode(),
            UnsealMode::Simple
        );

        config.mode = UnsealMode::System;
        assert!(unseal_strategy_from_config(&config).is_err());
        config.system_salt = Some("MDEyMzQ1Njc4OWFiY2RlZg==".to_string());
        assert_eq!(
            unseal_strategy_from_config(&config).unwrap().mode(),
            UnsealMode::System
        );
    }

    #[test]
    fn test_debug_redacts() {
        shared::setup_test!();
        let key = UnsealKey::from_bytes(&[1u8; 32]).unwrap();
        assert_eq!(format!("{key:?}"), "UnsealKey([REDACTED])");
        let secret = UnsealSecret::new(vec![1u8; 32]);
        assert!(format!("{secret:?}").contains("REDACTED"));
    }
}
