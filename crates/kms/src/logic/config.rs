use std::{collections::BTreeMap, path::Path, path::PathBuf, time::Duration};

use base64::Engine;
use serde::{Deserialize, Serialize};
use shared::error::CommonError;

use crate::error::KmsError;
use crate::logic::keygen::KeyFamily;
use crate::logic::unseal::UnsealMode;

pub const MIN_SYSTEM_SALT_LEN: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct KmsConfig {
    #[serde(default)]
    pub unseal: UnsealConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct UnsealConfig {
    #[serde(default = "default_unseal_mode")]
    pub mode: UnsealMode,
    #[serde(default = "default_threshold")]
    pub threshold: u8,
    #[serde(default = "default_shares")]
    pub shares: u8,
    /// Base64 salt mixed into the host fingerprint in `system` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_salt: Option<String>,
    /// Files holding encoded unseal secrets, one per file.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_files: Vec<PathBuf>,
}

fn default_unseal_mode() -> UnsealMode {
    UnsealMode::Shamir
}

fn default_threshold() -> u8 {
    3
}

fn default_shares() -> u8 {
    5
}

impl Default for UnsealConfig {
    fn default() -> Self {
        Self {
            mode: default_unseal_mode(),
            threshold: default_threshold(),
            shares: default_shares(),
            system_salt: None,
            secret_files: Vec::new(),
        }
    }
}

impl UnsealConfig {
    pub fn decoded_system_salt(&self) -> Result<Vec<u8>, KmsError> {
        let encoded = self.system_salt.as_deref().ok_or_else(|| {
            configuration_error("system unseal mode requires unseal.system_salt")
        })?;
        let salt = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| KmsError::Common(CommonError::Configuration {
                msg: "unseal.system_salt is not valid base64".to_string(),
                source: Some(e.into()),
            }))?;
        if salt.len() < MIN_SYSTEM_SALT_LEN {
            return Err(configuration_error(format!(
                "unseal.system_salt must decode to at least {MIN_SYSTEM_SALT_LEN} bytes"
            )));
        }
        Ok(salt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FamilyPoolConfig {
    /// Upper bound on buffered plus in-flight keys.
    pub size: usize,
    pub workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PoolConfig {
    /// Families listed here get background workers. Others are generated on demand.
    #[serde(default = "default_pool_families")]
    pub families: BTreeMap<KeyFamily, FamilyPoolConfig>,
}

const DEFAULT_FAMILY_POOL: FamilyPoolConfig = FamilyPoolConfig {
    size: 4,
    workers: 1,
};

fn default_pool_families() -> BTreeMap<KeyFamily, FamilyPoolConfig> {
    KeyFamily::ALL
        .iter()
        .map(|family| {
            let settings = if family.is_rsa() {
                FamilyPoolConfig {
                    size: 2,
                    workers: 1,
                }
            } else {
                DEFAULT_FAMILY_POOL
            };
            (*family, settings)
        })
        .collect()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            families: default_pool_families(),
        }
    }
}

impl PoolConfig {
    /// Pool only the given families, each with the same settings.
    pub fn only(families: &[KeyFamily], size: usize, workers: usize) -> Self {
        Self {
            families: families
                .iter()
                .map(|family| (*family, FamilyPoolConfig { size, workers }))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RotationConfig {
    /// Minimum time between rotations of one elastic key, unless the key overrides it.
    #[serde(default, with = "humantime_duration")]
    pub default_min_interval: Duration,
    /// Age after which a material key is reported as due for rotation.
    #[serde(default, with = "humantime_duration_opt", skip_serializing_if = "Option::is_none")]
    pub default_rotate_after: Option<Duration>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            default_min_interval: Duration::ZERO,
            default_rotate_after: None,
        }
    }
}

impl KmsConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, KmsError> {
        let config: KmsConfig = serde_yaml::from_str(yaml).map_err(CommonError::from)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, KmsError> {
        Ok(serde_yaml::to_string(self).map_err(CommonError::from)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, KmsError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(CommonError::from)?;
        Self::from_yaml(&contents)
    }

    pub fn validate(&self) -> Result<(), KmsError> {
        self.validate_unseal()?;
        self.validate_pool_and_rotation()
    }

    fn validate_unseal(&self) -> Result<(), KmsError> {
        match self.unseal.mode {
            UnsealMode::Shamir => {
                if self.unseal.threshold < 2 {
                    return Err(configuration_error("unseal.threshold must be at least 2"));
                }
                if self.unseal.shares < self.unseal.threshold {
                    return Err(configuration_error(
                        "unseal.shares must be greater than or equal to unseal.threshold",
                    ));
                }
            }
            UnsealMode::System => {
                self.unseal.decoded_system_salt()?;
            }
            UnsealMode::Simple => {}
        }
        Ok(())
    }

    /// Checks every section except `unseal`, which a caller supplied strategy replaces.
    pub fn validate_pool_and_rotation(&self) -> Result<(), KmsError> {
        for (family, settings) in &self.pool.families {
            if settings.workers > 0 && settings.size == 0 {
                return Err(configuration_error(format!(
                    "pool.families.{family}.size must be at least 1 when workers are configured"
                )));
            }
        }

        if let Some(rotate_after) = self.rotation.default_rotate_after
            && rotate_after < self.rotation.default_min_interval
        {
            return Err(configuration_error(
                "rotation.default_rotate_after must not be shorter than rotation.default_min_interval",
            ));
        }

        Ok(())
    }
}

fn configuration_error(msg: impl Into<String>) -> KmsError {
    KmsError::Common(CommonError::Configuration {
        msg: msg.into(),
        source: None,
    })
}

pub(crate) mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod humantime_duration_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => super::humantime_duration::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|raw| humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        shared::setup_test!();
        let config = KmsConfig::default();
        config.validate().unwrap();
        assert_eq!(config.unseal.mode, UnsealMode::Shamir);
        assert_eq!(config.unseal.threshold, 3);
        assert_eq!(config.unseal.shares, 5);
        assert_eq!(config.pool.families.len(), KeyFamily::ALL.len());
        assert_eq!(
            config.pool.families.get(&KeyFamily::Rsa4096).map(|c| c.size),
            Some(2)
        );
    }

    #[test]
    fn test_from_yaml() {
        shared::setup_test!();
        let yaml = r#"
unseal:
  mode: shamir
  threshold: 2
  shares: 3
pool:
  families:
    AES-256:
      size: 8
      workers: 2
    ECDSA-P256:
      size: 1
      workers: 1
rotation:
  default_min_interval: 1h 30m
  default_rotate_after: 90days
"#;
        let config = KmsConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.unseal.threshold, 2);
        assert_eq!(config.pool.families.len(), 2);
        assert_eq!(
            config.pool.families.get(&KeyFamily::Aes256),
            Some(&FamilyPoolConfig {
                size: 8,
                workers: 2
            })
        );
        assert_eq!(
            config.rotation.default_min_interval,
            Duration::from_secs(90 * 60)
        );
        assert_eq!(
            config.rotation.default_rotate_after,
            Some(Duration::from_secs(90 * 24 * 3600))
        );

        let round_trip = KmsConfig::from_yaml(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(round_trip, config);
    }

    #[test]
    fn test_rejects_bad_threshold() {
        shared::setup_test!();
        let yaml = "unseal:\n  mode: shamir\n  threshold: 4\n  shares: 3\n";
        assert!(KmsConfig::from_yaml(yaml).is_err());

        let yaml = "unseal:\n  mode: shamir\n  threshold: 1\n  shares: 3\n";
        assert!(KmsConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_system_mode_requires_salt() {
        shared::setup_test!();
        let yaml = "unseal:\n  mode: system\n";
        assert!(KmsConfig::from_yaml(yaml).is_err());

        let yaml = "unseal:\n  mode: system\n  system_salt: c2hvcnQ=\n";
        assert!(KmsConfig::from_yaml(yaml).is_err());

        let yaml = "unseal:\n  mode: system\n  system_salt: MDEyMzQ1Njc4OWFiY2RlZg==\n";
        let config = KmsConfig::from_yaml(yaml).unwrap();
        assert_eq!(
            config.unseal.decoded_system_salt().unwrap(),
            b"0123456789abcdef".to_vec()
        );
    }

    #[test]
    fn test_rejects_zero_sized_pool_with_workers() {
        shared::setup_test!();
        let yaml = "pool:\n  families:\n    HMAC-256:\n      size: 0\n      workers: 1\n";
        assert!(KmsConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_rotate_after_shorter_than_min_interval() {
        shared::setup_test!();
        let yaml = "rotation:\n  default_min_interval: 1h\n  default_rotate_after: 10m\n";
        assert!(KmsConfig::from_yaml(yaml).is_err());

        let yaml = "rotation:\n  default_min_interval: 10m\n  default_rotate_after: 1h\n";
        let config = KmsConfig::from_yaml(yaml).unwrap();
        config.validate_pool_and_rotation().unwrap();
    }

    #[test]
    fn test_from_file() {
        shared::setup_test!();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kms.yaml");
        std::fs::write(&path, "unseal:\n  mode: simple\n").unwrap();
        let config = KmsConfig::from_file(&path).unwrap();
        assert_eq!(config.unseal.mode, UnsealMode::Simple);

        assert!(KmsConfig::from_file(dir.path().join("missing.yaml")).is_err());
    }
}
