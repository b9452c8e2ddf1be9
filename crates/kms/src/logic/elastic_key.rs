use std::{fmt, sync::Arc, time::Duration};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use shared::primitives::{WrappedChronoDateTime, WrappedUuidV4};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::KmsError;
use crate::logic::algorithm::{ElasticKeyAlgorithm, KeyUsage};
use crate::logic::config::{RotationConfig, humantime_duration, humantime_duration_opt};
use crate::logic::jwk::PublicJwk;
use crate::logic::keygen::{KeyFamily, PooledKey};
use crate::logic::material_key::{MaterialKey, MaterialKeyRecord, MaterialKeyStatus, MaterialKeyStore};
use crate::logic::{KmsEvent, KmsEventSender, publish_event};
use crate::repository::{ActivateMaterialKey, ElasticKeyRepositoryLike};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElasticKeyStatus {
    Active,
    Disabled,
    /// Soft deleted. Material keys are kept but the key is no longer addressable.
    Deleted,
}

impl fmt::Display for ElasticKeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ElasticKeyStatus::Active => "active",
            ElasticKeyStatus::Disabled => "disabled",
            ElasticKeyStatus::Deleted => "deleted",
        })
    }
}

fn default_allow_rotation() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RotationPolicy {
    #[serde(default = "default_allow_rotation")]
    pub allow_rotation: bool,
    #[serde(default, with = "humantime_duration")]
    pub min_interval: Duration,
    #[serde(default, with = "humantime_duration_opt", skip_serializing_if = "Option::is_none")]
    pub rotate_after: Option<Duration>,
}

impl From<&RotationConfig> for RotationPolicy {
    fn from(config: &RotationConfig) -> Self {
        Self {
            allow_rotation: true,
            min_interval: config.default_min_interval,
            rotate_after: config.default_rotate_after,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElasticKey {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub algorithm: ElasticKeyAlgorithm,
    pub usage: KeyUsage,
    pub rotation_policy: RotationPolicy,
    pub active_version: u32,
    pub status: ElasticKeyStatus,
    pub created_at: WrappedChronoDateTime,
    pub updated_at: WrappedChronoDateTime,
    pub last_rotated_at: Option<WrappedChronoDateTime>,
    /// Operators may supply material versions through [`ElasticKeyService::import_material_key`].
    #[serde(default)]
    pub import_allowed: bool,
}

impl ElasticKey {
    fn rotation_anchor(&self) -> WrappedChronoDateTime {
        self.last_rotated_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone)]
pub struct CreateElasticKeyParams {
    pub name: String,
    pub description: Option<String>,
    pub algorithm: ElasticKeyAlgorithm,
    /// Must agree with the algorithm when given.
    pub usage: Option<KeyUsage>,
    /// Falls back to the configured rotation defaults.
    pub rotation_policy: Option<RotationPolicy>,
    pub import_allowed: bool,
}

impl CreateElasticKeyParams {
    pub fn new(name: impl Into<String>, algorithm: ElasticKeyAlgorithm) -> Self {
        Self {
            name: name.into(),
            description: None,
            algorithm,
            usage: None,
            rotation_policy: None,
            import_allowed: false,
        }
    }
}

/// Fields left as `None` keep their current value.
#[derive(Debug, Clone, Default)]
pub struct UpdateElasticKeyParams {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Manages elastic keys: stable, named keys whose material rotates underneath.
///
/// Writes to one elastic key are serialized by a per-key lock; reads never take it.
pub struct ElasticKeyService {
    repo: Arc<dyn ElasticKeyRepositoryLike>,
    materials: MaterialKeyStore,
    locks: DashMap<String, Arc<Mutex<()>>>,
    rotation_defaults: RotationPolicy,
    events: KmsEventSender,
}

impl ElasticKeyService {
    pub fn new(
        repo: Arc<dyn ElasticKeyRepositoryLike>,
        materials: MaterialKeyStore,
        rotation: &RotationConfig,
        events: KmsEventSender,
    ) -> Self {
        Self {
            repo,
            materials,
            locks: DashMap::new(),
            rotation_defaults: RotationPolicy::from(rotation),
            events,
        }
    }

    /// Takes the write lock of a live key. Unknown or deleted ids never get a lock entry.
    async fn lock_key(
        &self,
        elastic_key_id: &str,
        cancel: &CancellationToken,
    ) -> Result<OwnedMutexGuard<()>, KmsError> {
        self.load_live(elastic_key_id).await?;
        let lock = self
            .locks
            .entry(elastic_key_id.to_string())
            .or_default()
            .clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(KmsError::Cancelled),
            guard = lock.lock_owned() => Ok(guard),
        }
    }

    /// Loads a key that has not been deleted.
    async fn load_live(&self, elastic_key_id: &str) -> Result<ElasticKey, KmsError> {
        match self.repo.get_elastic_key(elastic_key_id).await? {
            Some(key) if key.status != ElasticKeyStatus::Deleted => Ok(key),
            _ => Err(KmsError::ElasticKeyNotFound {
                elastic_key_id: elastic_key_id.to_string(),
            }),
        }
    }

    pub async fn create_elastic_key(
        &self,
        params: CreateElasticKeyParams,
        cancel: &CancellationToken,
    ) -> Result<ElasticKey, KmsError> {
        self.materials.ensure_unsealed()?;
        params.algorithm.validate()?;
        if params.name.trim().is_empty() {
            return Err(KmsError::invalid_request("elastic key name must not be empty"));
        }
        let usage = params.algorithm.usage();
        if let Some(requested) = params.usage
            && requested != usage
        {
            return Err(KmsError::invalid_request(format!(
                "usage {requested:?} does not match algorithm {}",
                params.algorithm
            )));
        }

        let id = WrappedUuidV4::new().to_string();
        let material = self
            .materials
            .generate(&id, 1, params.algorithm, cancel)
            .await?;

        let now = WrappedChronoDateTime::now();
        let elastic_key = ElasticKey {
            id: id.clone(),
            name: params.name,
            description: params.description,
            algorithm: params.algorithm,
            usage,
            rotation_policy: params
                .rotation_policy
                .unwrap_or_else(|| self.rotation_defaults.clone()),
            active_version: 1,
            status: ElasticKeyStatus::Active,
            created_at: now,
            updated_at: now,
            last_rotated_at: None,
            import_allowed: params.import_allowed,
        };

        if cancel.is_cancelled() {
            return Err(KmsError::Cancelled);
        }
        self.repo.create_elastic_key(&elastic_key, &material).await?;

        info!(elastic_key_id = %id, algorithm = %elastic_key.algorithm, "elastic key created");
        publish_event(
            &self.events,
            KmsEvent::ElasticKeyCreated {
                elastic_key_id: id,
                algorithm: elastic_key.algorithm.to_string(),
            },
        );
        Ok(elastic_key)
    }

    pub async fn get_elastic_key(&self, elastic_key_id: &str) -> Result<ElasticKey, KmsError> {
        self.load_live(elastic_key_id).await
    }

    /// Every key that has not been deleted.
    pub async fn list_elastic_keys(&self) -> Result<Vec<ElasticKey>, KmsError> {
        Ok(self
            .repo
            .list_elastic_keys()
            .await?
            .into_iter()
            .filter(|key| key.status != ElasticKeyStatus::Deleted)
            .collect())
    }

    /// Metadata of every material version. Nothing is decrypted.
    pub async fn list_material_keys(
        &self,
        elastic_key_id: &str,
    ) -> Result<Vec<MaterialKeyRecord>, KmsError> {
        self.load_live(elastic_key_id).await?;
        self.materials.list_versions(elastic_key_id).await
    }

    /// Creates version `active + 1`, makes it active and retires the previous version.
    pub async fn rotate(
        &self,
        elastic_key_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ElasticKey, KmsError> {
        self.materials.ensure_unsealed()?;
        let _guard = self.lock_key(elastic_key_id, cancel).await?;
        let key = self.load_live(elastic_key_id).await?;

        if key.status != ElasticKeyStatus::Active {
            return Err(KmsError::AlgorithmPolicyViolation {
                elastic_key_id: elastic_key_id.to_string(),
                msg: format!("cannot rotate a {} key", key.status),
            });
        }
        if !key.rotation_policy.allow_rotation {
            return Err(KmsError::AlgorithmPolicyViolation {
                elastic_key_id: elastic_key_id.to_string(),
                msg: "rotation is disabled for this key".to_string(),
            });
        }
        let since_last = key.rotation_anchor().elapsed();
        if since_last < key.rotation_policy.min_interval {
            return Err(KmsError::AlgorithmPolicyViolation {
                elastic_key_id: elastic_key_id.to_string(),
                msg: format!(
                    "minimum rotation interval of {} has not elapsed",
                    humantime::format_duration(key.rotation_policy.min_interval)
                ),
            });
        }

        let previous_version = key.active_version;
        let new_version = previous_version + 1;
        let material = self
            .materials
            .generate(elastic_key_id, new_version, key.algorithm, cancel)
            .await?;
        let key = self.activate(key, &material, cancel).await?;

        info!(
            elastic_key_id,
            previous_version, new_version, "material key rotated"
        );
        publish_event(
            &self.events,
            KmsEvent::MaterialKeyRotated {
                elastic_key_id: elastic_key_id.to_string(),
                previous_version,
                new_version,
            },
        );
        Ok(key)
    }

    async fn activate(
        &self,
        key: ElasticKey,
        material: &MaterialKeyRecord,
        cancel: &CancellationToken,
    ) -> Result<ElasticKey, KmsError> {
        if cancel.is_cancelled() {
            return Err(KmsError::Cancelled);
        }
        let now = WrappedChronoDateTime::now();
        self.repo
            .activate_material_key(&ActivateMaterialKey {
                elastic_key_id: &key.id,
                expected_active_version: key.active_version,
                material_key: material,
                activated_at: now,
            })
            .await?;
        Ok(ElasticKey {
            active_version: material.version,
            updated_at: now,
            last_rotated_at: Some(now),
            ..key
        })
    }

    /// Stores operator supplied material as version `active + 1` and activates it.
    /// The key must allow import; its rotation interval does not apply.
    pub async fn import_material_key(
        &self,
        elastic_key_id: &str,
        material: &[u8],
        cancel: &CancellationToken,
    ) -> Result<ElasticKey, KmsError> {
        self.materials.ensure_unsealed()?;
        let _guard = self.lock_key(elastic_key_id, cancel).await?;
        let key = self.load_live(elastic_key_id).await?;
        if !key.import_allowed {
            return Err(KmsError::AlgorithmPolicyViolation {
                elastic_key_id: elastic_key_id.to_string(),
                msg: "import is not allowed for this key".to_string(),
            });
        }
        if key.status != ElasticKeyStatus::Active {
            return Err(KmsError::AlgorithmPolicyViolation {
                elastic_key_id: elastic_key_id.to_string(),
                msg: format!("cannot import into a {} key", key.status),
            });
        }

        let version = key.active_version + 1;
        let record = self
            .materials
            .import(elastic_key_id, version, key.algorithm, material, cancel)
            .await?;
        let key = self.activate(key, &record, cancel).await?;

        info!(elastic_key_id, version, "material key imported");
        publish_event(
            &self.events,
            KmsEvent::MaterialKeyImported {
                elastic_key_id: elastic_key_id.to_string(),
                version,
            },
        );
        Ok(key)
    }

    /// Marks one version revoked. Revoked versions are refused for every operation,
    /// including decrypting and verifying existing tokens.
    pub async fn revoke_material_key(
        &self,
        elastic_key_id: &str,
        version: u32,
        cancel: &CancellationToken,
    ) -> Result<MaterialKeyRecord, KmsError> {
        let _guard = self.lock_key(elastic_key_id, cancel).await?;
        let record = self.materials.load(elastic_key_id, version).await?;
        if record.status == MaterialKeyStatus::Revoked {
            return Err(KmsError::invalid_request(format!(
                "material key version {version} of {elastic_key_id} is already revoked"
            )));
        }

        if cancel.is_cancelled() {
            return Err(KmsError::Cancelled);
        }
        let now = WrappedChronoDateTime::now();
        self.repo
            .revoke_material_key(elastic_key_id, version, now)
            .await?;

        warn!(elastic_key_id, version, "material key revoked");
        publish_event(
            &self.events,
            KmsEvent::MaterialKeyRevoked {
                elastic_key_id: elastic_key_id.to_string(),
                version,
            },
        );
        Ok(MaterialKeyRecord {
            status: MaterialKeyStatus::Revoked,
            revoked_at: Some(now),
            ..record
        })
    }

    /// Removes a revoked, non-active version for good.
    pub async fn delete_material_key(
        &self,
        elastic_key_id: &str,
        version: u32,
        cancel: &CancellationToken,
    ) -> Result<(), KmsError> {
        let _guard = self.lock_key(elastic_key_id, cancel).await?;
        let key = self.load_live(elastic_key_id).await?;
        let record = self.materials.load(elastic_key_id, version).await?;
        if record.status != MaterialKeyStatus::Revoked {
            return Err(KmsError::invalid_request(format!(
                "material key version {version} of {elastic_key_id} must be revoked before deletion"
            )));
        }
        if version == key.active_version {
            return Err(KmsError::invalid_request(format!(
                "material key version {version} is the active version of {elastic_key_id}"
            )));
        }

        if cancel.is_cancelled() {
            return Err(KmsError::Cancelled);
        }
        self.repo.delete_material_key(elastic_key_id, version).await?;

        info!(elastic_key_id, version, "material key deleted");
        publish_event(
            &self.events,
            KmsEvent::MaterialKeyDeleted {
                elastic_key_id: elastic_key_id.to_string(),
                version,
            },
        );
        Ok(())
    }

    pub async fn update_elastic_key(
        &self,
        elastic_key_id: &str,
        params: UpdateElasticKeyParams,
        cancel: &CancellationToken,
    ) -> Result<ElasticKey, KmsError> {
        if params.name.as_ref().is_some_and(|name| name.trim().is_empty()) {
            return Err(KmsError::invalid_request("elastic key name must not be empty"));
        }
        let _guard = self.lock_key(elastic_key_id, cancel).await?;
        let mut key = self.load_live(elastic_key_id).await?;
        if let Some(name) = params.name {
            key.name = name;
        }
        if let Some(description) = params.description {
            key.description = Some(description);
        }

        if cancel.is_cancelled() {
            return Err(KmsError::Cancelled);
        }
        key.updated_at = WrappedChronoDateTime::now();
        self.repo
            .update_elastic_key_details(
                elastic_key_id,
                &key.name,
                key.description.as_deref(),
                key.updated_at,
            )
            .await?;

        info!(elastic_key_id, "elastic key updated");
        publish_event(
            &self.events,
            KmsEvent::ElasticKeyUpdated {
                elastic_key_id: elastic_key_id.to_string(),
            },
        );
        Ok(key)
    }

    /// Public JWK of a version, the active one by default. Needs no unsealed barrier.
    pub async fn get_public_key(
        &self,
        elastic_key_id: &str,
        version: Option<u32>,
    ) -> Result<PublicJwk, KmsError> {
        let key = self.load_live(elastic_key_id).await?;
        let record = self
            .load_usable(elastic_key_id, version.unwrap_or(key.active_version))
            .await?;
        let Some(mut jwk) = record.public_key else {
            return Err(KmsError::invalid_request(format!(
                "elastic key {elastic_key_id} uses a symmetric algorithm and has no public key"
            )));
        };
        jwk.kid = Some(elastic_key_id.to_string());
        jwk.alg = Some(key.algorithm.alg().to_string());
        Ok(jwk)
    }

    /// A one-off key for data key generation. Nothing is stored.
    pub async fn draw_data_key(
        &self,
        family: KeyFamily,
        cancel: &CancellationToken,
    ) -> Result<PooledKey, KmsError> {
        self.materials.draw(family, cancel).await
    }

    pub async fn disable_elastic_key(
        &self,
        elastic_key_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ElasticKey, KmsError> {
        self.set_status(elastic_key_id, ElasticKeyStatus::Disabled, cancel)
            .await
    }

    pub async fn enable_elastic_key(
        &self,
        elastic_key_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ElasticKey, KmsError> {
        self.set_status(elastic_key_id, ElasticKeyStatus::Active, cancel)
            .await
    }

    /// Soft delete. The key and all its material versions stay in the repository.
    pub async fn delete_elastic_key(
        &self,
        elastic_key_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), KmsError> {
        self.set_status(elastic_key_id, ElasticKeyStatus::Deleted, cancel)
            .await?;
        self.locks.remove(elastic_key_id);
        Ok(())
    }

    async fn set_status(
        &self,
        elastic_key_id: &str,
        status: ElasticKeyStatus,
        cancel: &CancellationToken,
    ) -> Result<ElasticKey, KmsError> {
        let _guard = self.lock_key(elastic_key_id, cancel).await?;
        let key = self.load_live(elastic_key_id).await?;
        if key.status == status {
            return Ok(key);
        }

        if cancel.is_cancelled() {
            return Err(KmsError::Cancelled);
        }
        let now = WrappedChronoDateTime::now();
        self.repo
            .update_elastic_key_status(elastic_key_id, status, now)
            .await?;

        info!(elastic_key_id, %status, "elastic key status changed");
        publish_event(
            &self.events,
            KmsEvent::ElasticKeyStatusChanged {
                elastic_key_id: elastic_key_id.to_string(),
                status,
            },
        );
        Ok(ElasticKey {
            status,
            updated_at: now,
            ..key
        })
    }

    /// Age of the active version has passed the key's `rotate_after`.
    pub async fn is_rotation_due(&self, elastic_key_id: &str) -> Result<bool, KmsError> {
        let key = self.load_live(elastic_key_id).await?;
        Ok(match key.rotation_policy.rotate_after {
            Some(rotate_after) => key.rotation_anchor().elapsed() >= rotate_after,
            None => false,
        })
    }

    fn ensure_usable_for_encrypt(key: &ElasticKey, usage: KeyUsage) -> Result<(), KmsError> {
        if key.status != ElasticKeyStatus::Active {
            return Err(KmsError::invalid_request(format!(
                "elastic key {} is {}",
                key.id, key.status
            )));
        }
        if key.usage != usage {
            return Err(KmsError::invalid_request(format!(
                "elastic key {} is not usable for {usage:?}",
                key.id
            )));
        }
        Ok(())
    }

    /// The active material key, for encrypting or signing.
    pub async fn resolve_for_encrypt(
        &self,
        elastic_key_id: &str,
        usage: KeyUsage,
        cancel: &CancellationToken,
    ) -> Result<MaterialKey, KmsError> {
        self.materials.ensure_unsealed()?;
        let key = self.load_live(elastic_key_id).await?;
        Self::ensure_usable_for_encrypt(&key, usage)?;
        let record = self.load_usable(elastic_key_id, key.active_version).await?;
        self.materials.decrypt(&record, cancel).await
    }

    /// Like [`Self::resolve_for_encrypt`] but pinned to a version, which must be the active one.
    pub async fn resolve_version_for_encrypt(
        &self,
        elastic_key_id: &str,
        version: u32,
        usage: KeyUsage,
        cancel: &CancellationToken,
    ) -> Result<MaterialKey, KmsError> {
        self.materials.ensure_unsealed()?;
        let key = self.load_live(elastic_key_id).await?;
        Self::ensure_usable_for_encrypt(&key, usage)?;
        let record = self.load_usable(elastic_key_id, version).await?;
        if record.status == MaterialKeyStatus::Retired || record.version != key.active_version {
            return Err(KmsError::KeyVersionRetiredForEncrypt {
                elastic_key_id: elastic_key_id.to_string(),
                version,
            });
        }
        self.materials.decrypt(&record, cancel).await
    }

    /// Any existing version, active or retired, for decrypting or verifying.
    pub async fn resolve_for_decrypt(
        &self,
        elastic_key_id: &str,
        version: u32,
        cancel: &CancellationToken,
    ) -> Result<MaterialKey, KmsError> {
        self.materials.ensure_unsealed()?;
        self.load_live(elastic_key_id).await?;
        let record = self.load_usable(elastic_key_id, version).await?;
        self.materials.decrypt(&record, cancel).await
    }

    async fn load_usable(
        &self,
        elastic_key_id: &str,
        version: u32,
    ) -> Result<MaterialKeyRecord, KmsError> {
        let record = self.materials.load(elastic_key_id, version).await?;
        if record.status == MaterialKeyStatus::Revoked {
            return Err(KmsError::KeyVersionRevoked {
                elastic_key_id: elastic_key_id.to_string(),
                version,
            });
        }
        Ok(record)
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use crate::logic::algorithm::{ContentEncryption, SignatureAlgorithm};
    use crate::logic::barrier::BarrierService;
    use crate::logic::config::PoolConfig;
    use crate::logic::keygen::KeyFamily;
    use crate::logic::pool::KeyGenerationPool;
    use crate::logic::unseal::UnsealKey;
    use crate::logic::{KmsEventReceiver, event_channel};
    use crate::repository::InMemoryRepository;

    struct Fixture {
        service: Arc<ElasticKeyService>,
        repo: InMemoryRepository,
        barrier: Arc<BarrierService>,
        pool: Arc<KeyGenerationPool>,
        events: KmsEventReceiver,
        cancel: CancellationToken,
    }

    async fn fixture(rotation: RotationConfig) -> Fixture {
        let (tx, rx) = event_channel();
        let repo = InMemoryRepository::new();
        let pool = KeyGenerationPool::start(
            &PoolConfig::only(&[KeyFamily::Aes256, KeyFamily::Hmac256], 4, 1),
            tx.clone(),
        );
        let barrier = Arc::new(BarrierService::new(
            Arc::new(repo.clone()),
            pool.clone(),
            tx.clone(),
        ));
        let cancel = CancellationToken::new();
        barrier
            .unseal(&UnsealKey::from_bytes(&[3u8; 32]).unwrap(), &cancel)
            .await
            .unwrap();
        let materials = MaterialKeyStore::new(Arc::new(repo.clone()), barrier.clone(), pool.clone());
        let service = Arc::new(ElasticKeyService::new(
            Arc::new(repo.clone()),
            materials,
            &rotation,
            tx,
        ));
        Fixture {
            service,
            repo,
            barrier,
            pool,
            events: rx,
            cancel,
        }
    }

    fn aes_params() -> CreateElasticKeyParams {
        CreateElasticKeyParams::new("payments", ElasticKeyAlgorithm::direct(ContentEncryption::A256Gcm))
    }

    #[tokio::test]
    async fn test_create_and_get() {
        shared::setup_test!();
        let mut f = fixture(RotationConfig::default()).await;
        let key = f.service.create_elastic_key(aes_params(), &f.cancel).await.unwrap();
        assert_eq!(key.active_version, 1);
        assert_eq!(key.usage, KeyUsage::Encrypt);
        assert_eq!(key.status, ElasticKeyStatus::Active);

        assert_eq!(f.service.get_elastic_key(&key.id).await.unwrap(), key);
        assert_eq!(f.service.list_elastic_keys().await.unwrap().len(), 1);

        let versions = f.service.list_material_keys(&key.id).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].status, MaterialKeyStatus::Active);

        let material = f
            .service
            .resolve_for_encrypt(&key.id, KeyUsage::Encrypt, &f.cancel)
            .await
            .unwrap();
        assert_eq!(material.key().len(), 32);

        loop {
            if let KmsEvent::ElasticKeyCreated { elastic_key_id, .. } = f.events.recv().await.unwrap() {
                assert_eq!(elastic_key_id, key.id);
                break;
            }
        }
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_params() {
        shared::setup_test!();
        let f = fixture(RotationConfig::default()).await;

        let mut wrong_usage = aes_params();
        wrong_usage.usage = Some(KeyUsage::Sign);
        assert!(f.service.create_elastic_key(wrong_usage, &f.cancel).await.is_err());

        let bad_family = CreateElasticKeyParams::new(
            "bad",
            ElasticKeyAlgorithm::signature_with_family(SignatureAlgorithm::ES256, KeyFamily::Aes256),
        );
        assert!(f.service.create_elastic_key(bad_family, &f.cancel).await.is_err());

        let mut unnamed = aes_params();
        unnamed.name = "  ".to_string();
        assert!(f.service.create_elastic_key(unnamed, &f.cancel).await.is_err());
        assert!(f.service.list_elastic_keys().await.unwrap().is_empty());
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_rotation_retires_previous_version() {
        shared::setup_test!();
        let f = fixture(RotationConfig::default()).await;
        let key = f.service.create_elastic_key(aes_params(), &f.cancel).await.unwrap();
        let v1 = f
            .service
            .resolve_for_encrypt(&key.id, KeyUsage::Encrypt, &f.cancel)
            .await
            .unwrap();

        let rotated = f.service.rotate(&key.id, &f.cancel).await.unwrap();
        assert_eq!(rotated.active_version, 2);
        assert!(rotated.last_rotated_at.is_some());
        assert_eq!(f.service.get_elastic_key(&key.id).await.unwrap().active_version, 2);

        let versions = f.service.list_material_keys(&key.id).await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].status, MaterialKeyStatus::Retired);
        assert!(versions[0].retired_at.is_some());
        assert_eq!(versions[1].status, MaterialKeyStatus::Active);

        let v2 = f
            .service
            .resolve_for_encrypt(&key.id, KeyUsage::Encrypt, &f.cancel)
            .await
            .unwrap();
        assert_eq!(v2.version(), 2);
        assert_ne!(v1.key(), v2.key());

        // Retired versions still decrypt but never encrypt.
        let old = f
            .service
            .resolve_for_decrypt(&key.id, 1, &f.cancel)
            .await
            .unwrap();
        assert_eq!(old.key(), v1.key());
        assert_eq!(old.status(), MaterialKeyStatus::Retired);
        assert!(matches!(
            f.service
                .resolve_version_for_encrypt(&key.id, 1, KeyUsage::Encrypt, &f.cancel)
                .await,
            Err(KmsError::KeyVersionRetiredForEncrypt { version: 1, .. })
        ));
        assert!(matches!(
            f.service
                .resolve_for_decrypt(&key.id, 5, &f.cancel)
                .await,
            Err(KmsError::UnknownKeyVersion { version: 5, .. })
        ));
        f.pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rotations_are_serialized() {
        shared::setup_test!();
        let f = fixture(RotationConfig::default()).await;
        let key = f.service.create_elastic_key(aes_params(), &f.cancel).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let service = f.service.clone();
            let id = key.id.clone();
            let cancel = f.cancel.clone();
            tasks.push(tokio::spawn(async move {
                service.rotate(&id, &cancel).await.unwrap().active_version
            }));
        }
        let mut versions = Vec::new();
        for task in tasks {
            versions.push(task.await.unwrap());
        }
        versions.sort();
        assert_eq!(versions, (2..=9).collect::<Vec<u32>>());

        let stored = f.service.list_material_keys(&key.id).await.unwrap();
        assert_eq!(stored.len(), 9);
        assert_eq!(
            stored
                .iter()
                .filter(|v| v.status == MaterialKeyStatus::Active)
                .count(),
            1
        );
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_rotation_policy() {
        shared::setup_test!();
        let f = fixture(RotationConfig {
            default_min_interval: Duration::from_secs(3600),
            default_rotate_after: None,
        })
        .await;
        let key = f.service.create_elastic_key(aes_params(), &f.cancel).await.unwrap();
        assert!(matches!(
            f.service.rotate(&key.id, &f.cancel).await,
            Err(KmsError::AlgorithmPolicyViolation { .. })
        ));

        let mut pinned = aes_params();
        pinned.rotation_policy = Some(RotationPolicy {
            allow_rotation: false,
            min_interval: Duration::ZERO,
            rotate_after: None,
        });
        let pinned = f.service.create_elastic_key(pinned, &f.cancel).await.unwrap();
        assert!(matches!(
            f.service.rotate(&pinned.id, &f.cancel).await,
            Err(KmsError::AlgorithmPolicyViolation { .. })
        ));
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_rotation_due() {
        shared::setup_test!();
        let f = fixture(RotationConfig::default()).await;
        let mut params = aes_params();
        params.rotation_policy = Some(RotationPolicy {
            allow_rotation: true,
            min_interval: Duration::ZERO,
            rotate_after: Some(Duration::ZERO),
        });
        let due = f.service.create_elastic_key(params, &f.cancel).await.unwrap();
        assert!(f.service.is_rotation_due(&due.id).await.unwrap());

        let never = f.service.create_elastic_key(aes_params(), &f.cancel).await.unwrap();
        assert!(!f.service.is_rotation_due(&never.id).await.unwrap());
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_transitions() {
        shared::setup_test!();
        let f = fixture(RotationConfig::default()).await;
        let key = f.service.create_elastic_key(aes_params(), &f.cancel).await.unwrap();

        let disabled = f.service.disable_elastic_key(&key.id, &f.cancel).await.unwrap();
        assert_eq!(disabled.status, ElasticKeyStatus::Disabled);
        assert!(
            f.service
                .resolve_for_encrypt(&key.id, KeyUsage::Encrypt, &f.cancel)
                .await
                .is_err()
        );
        assert!(
            f.service
                .resolve_for_decrypt(&key.id, 1, &f.cancel)
                .await
                .is_ok()
        );
        assert!(matches!(
            f.service.rotate(&key.id, &f.cancel).await,
            Err(KmsError::AlgorithmPolicyViolation { .. })
        ));

        f.service.enable_elastic_key(&key.id, &f.cancel).await.unwrap();
        f.service.delete_elastic_key(&key.id, &f.cancel).await.unwrap();
        assert!(matches!(
            f.service.get_elastic_key(&key.id).await,
            Err(KmsError::ElasticKeyNotFound { .. })
        ));
        assert!(f.service.list_elastic_keys().await.unwrap().is_empty());

        // Soft delete keeps the material in the repository.
        assert_eq!(f.repo.list_material_keys(&key.id).await.unwrap().len(), 1);
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_usage_is_enforced() {
        shared::setup_test!();
        let f = fixture(RotationConfig::default()).await;
        let signing = f
            .service
            .create_elastic_key(
                CreateElasticKeyParams::new(
                    "tokens",
                    ElasticKeyAlgorithm::signature(SignatureAlgorithm::HS256),
                ),
                &f.cancel,
            )
            .await
            .unwrap();
        assert_eq!(signing.usage, KeyUsage::Sign);
        assert!(
            f.service
                .resolve_for_encrypt(&signing.id, KeyUsage::Encrypt, &f.cancel)
                .await
                .is_err()
        );
        f.service
            .resolve_for_encrypt(&signing.id, KeyUsage::Sign, &f.cancel)
            .await
            .unwrap();
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_rotation_changes_nothing() {
        shared::setup_test!();
        let f = fixture(RotationConfig::default()).await;
        let key = f.service.create_elastic_key(aes_params(), &f.cancel).await.unwrap();
        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(matches!(
            f.service.rotate(&key.id, &cancelled).await,
            Err(KmsError::Cancelled)
        ));
        assert_eq!(f.service.get_elastic_key(&key.id).await.unwrap().active_version, 1);
        assert_eq!(f.service.list_material_keys(&key.id).await.unwrap().len(), 1);
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_sealed_service_fails_closed() {
        shared::setup_test!();
        let f = fixture(RotationConfig::default()).await;
        let key = f.service.create_elastic_key(aes_params(), &f.cancel).await.unwrap();
        f.barrier.reseal().await;
        let before = f.pool.stats(KeyFamily::Aes256);

        assert!(matches!(
            f.service.create_elastic_key(aes_params(), &f.cancel).await,
            Err(KmsError::Sealed)
        ));
        assert!(matches!(
            f.service.rotate(&key.id, &f.cancel).await,
            Err(KmsError::Sealed)
        ));
        assert!(matches!(
            f.service
                .resolve_for_encrypt(&key.id, KeyUsage::Encrypt, &f.cancel)
                .await,
            Err(KmsError::Sealed)
        ));
        assert!(matches!(
            f.service
                .resolve_version_for_encrypt(&key.id, 1, KeyUsage::Encrypt, &f.cancel)
                .await,
            Err(KmsError::Sealed)
        ));
        // Sealed is reported before an unknown id.
        assert!(matches!(
            f.service.resolve_for_decrypt("missing", 1, &f.cancel).await,
            Err(KmsError::Sealed)
        ));
        assert!(matches!(
            f.service
                .import_material_key(&key.id, &[1u8; 32], &f.cancel)
                .await,
            Err(KmsError::Sealed)
        ));
        assert!(matches!(
            f.service.draw_data_key(KeyFamily::Aes256, &f.cancel).await,
            Err(KmsError::Sealed)
        ));

        let after = f.pool.stats(KeyFamily::Aes256);
        assert_eq!(after.served_from_buffer, before.served_from_buffer);
        assert_eq!(after.served_on_demand, before.served_on_demand);
        assert_eq!(f.service.list_elastic_keys().await.unwrap().len(), 1);
        assert_eq!(f.service.list_material_keys(&key.id).await.unwrap().len(), 1);
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_ids_leave_no_lock_entries() {
        shared::setup_test!();
        let f = fixture(RotationConfig::default()).await;
        for id in ["missing-1", "missing-2", "missing-3"] {
            assert!(matches!(
                f.service.rotate(id, &f.cancel).await,
                Err(KmsError::ElasticKeyNotFound { .. })
            ));
            assert!(matches!(
                f.service.disable_elastic_key(id, &f.cancel).await,
                Err(KmsError::ElasticKeyNotFound { .. })
            ));
            assert!(matches!(
                f.service.revoke_material_key(id, 1, &f.cancel).await,
                Err(KmsError::ElasticKeyNotFound { .. })
            ));
            assert!(matches!(
                f.service
                    .update_elastic_key(id, UpdateElasticKeyParams::default(), &f.cancel)
                    .await,
                Err(KmsError::ElasticKeyNotFound { .. })
            ));
        }
        assert_eq!(f.service.locks.len(), 0);

        let key = f.service.create_elastic_key(aes_params(), &f.cancel).await.unwrap();
        f.service.rotate(&key.id, &f.cancel).await.unwrap();
        assert_eq!(f.service.locks.len(), 1);
        f.service.delete_elastic_key(&key.id, &f.cancel).await.unwrap();
        assert!(f.service.rotate(&key.id, &f.cancel).await.is_err());
        assert_eq!(f.service.locks.len(), 0);
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_corrupted_material_fails_decryption() {
        shared::setup_test!();
        let f = fixture(RotationConfig::default()).await;
        let key = f.service.create_elastic_key(aes_params(), &f.cancel).await.unwrap();
        f.repo.corrupt_material_key(&key.id, 1);

        let err = f
            .service
            .resolve_for_decrypt(&key.id, 1, &f.cancel)
            .await
            .unwrap_err();
        match err {
            KmsError::Decryption { key_id, version } => {
                assert_eq!(key_id, key.id);
                assert_eq!(version, 1);
            }
            other => panic!("expected Decryption, got {other:?}"),
        }
        assert!(matches!(
            f.service
                .resolve_for_encrypt(&key.id, KeyUsage::Encrypt, &f.cancel)
                .await,
            Err(KmsError::Decryption { version: 1, .. })
        ));
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_import_material_key() {
        shared::setup_test!();
        let mut f = fixture(RotationConfig {
            default_min_interval: Duration::from_secs(3600),
            default_rotate_after: None,
        })
        .await;
        let closed = f.service.create_elastic_key(aes_params(), &f.cancel).await.unwrap();
        assert!(matches!(
            f.service
                .import_material_key(&closed.id, &[7u8; 32], &f.cancel)
                .await,
            Err(KmsError::AlgorithmPolicyViolation { .. })
        ));

        let mut params = aes_params();
        params.import_allowed = true;
        let key = f.service.create_elastic_key(params, &f.cancel).await.unwrap();
        assert!(key.import_allowed);
        assert!(matches!(
            f.service
                .import_material_key(&key.id, &[7u8; 16], &f.cancel)
                .await,
            Err(KmsError::Common(_))
        ));

        // The rotation interval has not elapsed, import is still accepted.
        let imported = f
            .service
            .import_material_key(&key.id, &[7u8; 32], &f.cancel)
            .await
            .unwrap();
        assert_eq!(imported.active_version, 2);
        let active = f
            .service
            .resolve_for_encrypt(&key.id, KeyUsage::Encrypt, &f.cancel)
            .await
            .unwrap();
        assert_eq!(active.version(), 2);
        assert_eq!(active.key(), &[7u8; 32]);

        let versions = f.service.list_material_keys(&key.id).await.unwrap();
        assert!(!versions[0].imported);
        assert_eq!(versions[0].status, MaterialKeyStatus::Retired);
        assert!(versions[1].imported);

        f.service.disable_elastic_key(&key.id, &f.cancel).await.unwrap();
        assert!(matches!(
            f.service
                .import_material_key(&key.id, &[8u8; 32], &f.cancel)
                .await,
            Err(KmsError::AlgorithmPolicyViolation { .. })
        ));

        loop {
            if let KmsEvent::MaterialKeyImported { elastic_key_id, version } =
                f.events.recv().await.unwrap()
            {
                assert_eq!(elastic_key_id, key.id);
                assert_eq!(version, 2);
                break;
            }
        }
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_revoke_and_delete_material_key() {
        shared::setup_test!();
        let f = fixture(RotationConfig::default()).await;
        let key = f.service.create_elastic_key(aes_params(), &f.cancel).await.unwrap();
        f.service.rotate(&key.id, &f.cancel).await.unwrap();

        let revoked = f
            .service
            .revoke_material_key(&key.id, 1, &f.cancel)
            .await
            .unwrap();
        assert_eq!(revoked.status, MaterialKeyStatus::Revoked);
        assert!(revoked.revoked_at.is_some());
        assert!(matches!(
            f.service.resolve_for_decrypt(&key.id, 1, &f.cancel).await,
            Err(KmsError::KeyVersionRevoked { version: 1, .. })
        ));
        assert!(
            f.service
                .revoke_material_key(&key.id, 1, &f.cancel)
                .await
                .is_err()
        );
        assert!(matches!(
            f.service.revoke_material_key(&key.id, 9, &f.cancel).await,
            Err(KmsError::UnknownKeyVersion { version: 9, .. })
        ));

        // Only revoked versions can be deleted.
        assert!(
            f.service
                .delete_material_key(&key.id, 2, &f.cancel)
                .await
                .is_err()
        );
        f.service
            .delete_material_key(&key.id, 1, &f.cancel)
            .await
            .unwrap();
        assert!(matches!(
            f.service.resolve_for_decrypt(&key.id, 1, &f.cancel).await,
            Err(KmsError::UnknownKeyVersion { version: 1, .. })
        ));

        // A revoked active version blocks encryption until the next rotation.
        f.service
            .revoke_material_key(&key.id, 2, &f.cancel)
            .await
            .unwrap();
        assert!(matches!(
            f.service
                .resolve_for_encrypt(&key.id, KeyUsage::Encrypt, &f.cancel)
                .await,
            Err(KmsError::KeyVersionRevoked { version: 2, .. })
        ));
        assert!(
            f.service
                .delete_material_key(&key.id, 2, &f.cancel)
                .await
                .is_err()
        );
        f.service.rotate(&key.id, &f.cancel).await.unwrap();
        let material = f
            .service
            .resolve_for_encrypt(&key.id, KeyUsage::Encrypt, &f.cancel)
            .await
            .unwrap();
        assert_eq!(material.version(), 3);

        let versions = f.service.list_material_keys(&key.id).await.unwrap();
        let statuses: Vec<(u32, MaterialKeyStatus)> =
            versions.iter().map(|v| (v.version, v.status)).collect();
        assert_eq!(
            statuses,
            vec![
                (2, MaterialKeyStatus::Revoked),
                (3, MaterialKeyStatus::Active)
            ]
        );
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_elastic_key() {
        shared::setup_test!();
        let f = fixture(RotationConfig::default()).await;
        let key = f.service.create_elastic_key(aes_params(), &f.cancel).await.unwrap();

        let updated = f
            .service
            .update_elastic_key(
                &key.id,
                UpdateElasticKeyParams {
                    name: Some("billing".to_string()),
                    description: Some("invoices".to_string()),
                },
                &f.cancel,
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "billing");
        assert_eq!(updated.description.as_deref(), Some("invoices"));
        assert_eq!(updated.active_version, key.active_version);
        assert_eq!(f.service.get_elastic_key(&key.id).await.unwrap(), updated);

        let renamed_only = f
            .service
            .update_elastic_key(
                &key.id,
                UpdateElasticKeyParams {
                    name: Some("ledger".to_string()),
                    description: None,
                },
                &f.cancel,
            )
            .await
            .unwrap();
        assert_eq!(renamed_only.description.as_deref(), Some("invoices"));

        assert!(
            f.service
                .update_elastic_key(
                    &key.id,
                    UpdateElasticKeyParams {
                        name: Some(" ".to_string()),
                        description: None,
                    },
                    &f.cancel,
                )
                .await
                .is_err()
        );
        assert_eq!(f.service.get_elastic_key(&key.id).await.unwrap().name, "ledger");
        f.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_public_key_export() {
        shared::setup_test!();
        let f = fixture(RotationConfig::default()).await;
        let signing = f
            .service
            .create_elastic_key(
                CreateElasticKeyParams::new(
                    "tokens",
                    ElasticKeyAlgorithm::signature(SignatureAlgorithm::ES256),
                ),
                &f.cancel,
            )
            .await
            .unwrap();
        let jwk = f.service.get_public_key(&signing.id, None).await.unwrap();
        assert_eq!(jwk.kty, "EC");
        assert_eq!(jwk.kid.as_deref(), Some(signing.id.as_str()));
        assert_eq!(jwk.alg.as_deref(), Some("ES256"));
        assert_eq!(
            f.service.get_public_key(&signing.id, Some(1)).await.unwrap(),
            jwk
        );
        assert!(matches!(
            f.service.get_public_key(&signing.id, Some(2)).await,
            Err(KmsError::UnknownKeyVersion { version: 2, .. })
        ));

        let symmetric = f.service.create_elastic_key(aes_params(), &f.cancel).await.unwrap();
        assert!(f.service.get_public_key(&symmetric.id, None).await.is_err());

        // Public halves are stored in clear.
        f.barrier.reseal().await;
        assert_eq!(f.service.get_public_key(&signing.id, None).await.unwrap(), jwk);
        f.pool.shutdown().await;
    }
}
