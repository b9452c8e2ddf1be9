use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use shared::primitives::{WrappedChronoDateTime, WrappedUuidV4};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::KmsError;
use crate::logic::algorithm::ElasticKeyAlgorithm;
use crate::logic::barrier::{BarrierService, WrappedContentKey};
use crate::logic::jwk::{PublicJwk, derive_public_jwk};
use crate::logic::keygen::{KeyFamily, PooledKey};
use crate::logic::pool::KeyGenerationPool;
use crate::repository::ElasticKeyRepositoryLike;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialKeyStatus {
    Active,
    Retired,
    /// Refused for every operation. Only revoked versions may be deleted.
    Revoked,
}

/// Stored form of one material key version. The key bytes are wrapped by the barrier's
/// content tier with a context binding elastic key id, version and algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialKeyRecord {
    pub id: WrappedUuidV4,
    pub elastic_key_id: String,
    pub version: u32,
    pub algorithm: ElasticKeyAlgorithm,
    pub encrypted_key: WrappedContentKey,
    pub status: MaterialKeyStatus,
    pub created_at: WrappedChronoDateTime,
    pub retired_at: Option<WrappedChronoDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<WrappedChronoDateTime>,
    /// Supplied by an operator rather than drawn from the pool.
    #[serde(default)]
    pub imported: bool,
    /// Absent for symmetric algorithms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicJwk>,
}

/// Decrypted material key. Zeroized on drop.
pub struct MaterialKey {
    elastic_key_id: String,
    version: u32,
    algorithm: ElasticKeyAlgorithm,
    status: MaterialKeyStatus,
    key: Zeroizing<Vec<u8>>,
}

impl MaterialKey {
    pub fn elastic_key_id(&self) -> &str {
        &self.elastic_key_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn algorithm(&self) -> ElasticKeyAlgorithm {
        self.algorithm
    }

    pub fn status(&self) -> MaterialKeyStatus {
        self.status
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

impl fmt::Debug for MaterialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaterialKey")
            .field("elastic_key_id", &self.elastic_key_id)
            .field("version", &self.version)
            .field("algorithm", &self.algorithm)
            .field("status", &self.status)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

fn binding_context(
    elastic_key_id: &str,
    version: u32,
    id: &WrappedUuidV4,
    algorithm: &ElasticKeyAlgorithm,
) -> Vec<u8> {
    format!("kms/material/{elastic_key_id}/v{version}/{id}/{algorithm}").into_bytes()
}

pub struct MaterialKeyStore {
    repo: Arc<dyn ElasticKeyRepositoryLike>,
    barrier: Arc<BarrierService>,
    pool: Arc<KeyGenerationPool>,
}

impl MaterialKeyStore {
    pub fn new(
        repo: Arc<dyn ElasticKeyRepositoryLike>,
        barrier: Arc<BarrierService>,
        pool: Arc<KeyGenerationPool>,
    ) -> Self {
        Self {
            repo,
            barrier,
            pool,
        }
    }

    pub fn ensure_unsealed(&self) -> Result<(), KmsError> {
        self.barrier.ensure_unsealed()
    }

    /// Draws fresh material from the pool and wraps it. The record is not persisted here.
    /// Nothing is taken from the pool while the barrier is sealed.
    pub async fn generate(
        &self,
        elastic_key_id: &str,
        version: u32,
        algorithm: ElasticKeyAlgorithm,
        cancel: &CancellationToken,
    ) -> Result<MaterialKeyRecord, KmsError> {
        let material = self.draw(algorithm.key_family(), cancel).await?;
        self.wrap(elastic_key_id, version, algorithm, material.material(), false, cancel)
            .await
    }

    /// Wraps operator supplied material after checking it fits the algorithm's key family.
    pub async fn import(
        &self,
        elastic_key_id: &str,
        version: u32,
        algorithm: ElasticKeyAlgorithm,
        material: &[u8],
        cancel: &CancellationToken,
    ) -> Result<MaterialKeyRecord, KmsError> {
        self.barrier.ensure_unsealed()?;
        self.wrap(elastic_key_id, version, algorithm, material, true, cancel)
            .await
    }

    /// A fresh key of `family` that is never stored, for data key generation.
    pub async fn draw(
        &self,
        family: KeyFamily,
        cancel: &CancellationToken,
    ) -> Result<PooledKey, KmsError> {
        self.barrier.ensure_unsealed()?;
        self.pool.acquire(family, cancel).await
    }

    async fn wrap(
        &self,
        elastic_key_id: &str,
        version: u32,
        algorithm: ElasticKeyAlgorithm,
        material: &[u8],
        imported: bool,
        cancel: &CancellationToken,
    ) -> Result<MaterialKeyRecord, KmsError> {
        let public_key = derive_public_jwk(algorithm.key_family(), material)?;
        let id = WrappedUuidV4::new();
        let context = binding_context(elastic_key_id, version, &id, &algorithm);
        let encrypted_key = self
            .barrier
            .wrap_content_key(material, &context, cancel)
            .await?;

        debug!(
            elastic_key_id,
            version,
            imported,
            content_version = encrypted_key.content_version,
            "material key wrapped"
        );

        Ok(MaterialKeyRecord {
            id,
            elastic_key_id: elastic_key_id.to_string(),
            version,
            algorithm,
            encrypted_key,
            status: MaterialKeyStatus::Active,
            created_at: WrappedChronoDateTime::now(),
            retired_at: None,
            revoked_at: None,
            imported,
            public_key,
        })
    }

    pub async fn load(
        &self,
        elastic_key_id: &str,
        version: u32,
    ) -> Result<MaterialKeyRecord, KmsError> {
        self.repo
            .get_material_key(elastic_key_id, version)
            .await?
            .ok_or_else(|| KmsError::UnknownKeyVersion {
                key_id: elastic_key_id.to_string(),
                version,
            })
    }

    pub async fn list_versions(
        &self,
        elastic_key_id: &str,
    ) -> Result<Vec<MaterialKeyRecord>, KmsError> {
        Ok(self.repo.list_material_keys(elastic_key_id).await?)
    }

    pub async fn decrypt(
        &self,
        record: &MaterialKeyRecord,
        cancel: &CancellationToken,
    ) -> Result<MaterialKey, KmsError> {
        let context = binding_context(
            &record.elastic_key_id,
            record.version,
            &record.id,
            &record.algorithm,
        );
        let key = self
            .barrier
            .unwrap_content_key(&record.encrypted_key, &context, cancel)
            .await
            .map_err(|e| match e {
                KmsError::Decryption { .. } => KmsError::Decryption {
                    key_id: record.elastic_key_id.clone(),
                    version: record.version,
                },
                other => other,
            })?;

        Ok(MaterialKey {
            elastic_key_id: record.elastic_key_id.clone(),
            version: record.version,
            algorithm: record.algorithm,
            status: record.status,
            key,
        })
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use crate::logic::algorithm::{ContentEncryption, SignatureAlgorithm};
    use crate::logic::config::PoolConfig;
    use crate::logic::event_channel;
    use crate::logic::keygen::KeyFamily;
    use crate::logic::unseal::UnsealKey;
    use crate::repository::InMemoryRepository;

    async fn store() -> (MaterialKeyStore, Arc<BarrierService>, Arc<KeyGenerationPool>) {
        let (tx, _rx) = event_channel();
        let repo = InMemoryRepository::new();
        let pool = KeyGenerationPool::start(
            &PoolConfig::only(&[KeyFamily::Aes256], 4, 1),
            tx.clone(),
        );
        let barrier = Arc::new(BarrierService::new(
            Arc::new(repo.clone()),
            pool.clone(),
            tx,
        ));
        barrier
            .unseal(
                &UnsealKey::from_bytes(&[1u8; 32]).unwrap(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        (
            MaterialKeyStore::new(Arc::new(repo), barrier.clone(), pool.clone()),
            barrier,
            pool,
        )
    }

    #[tokio::test]
    async fn test_generate_and_decrypt() {
        shared::setup_test!();
        let (store, _barrier, pool) = store().await;
        let cancel = CancellationToken::new();
        let algorithm = ElasticKeyAlgorithm::direct(ContentEncryption::A128Gcm);

        let record = store.generate("ek-1", 1, algorithm, &cancel).await.unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.status, MaterialKeyStatus::Active);
        assert_eq!(record.encrypted_key.content_version, 1);

        let key = store.decrypt(&record, &cancel).await.unwrap();
        assert_eq!(key.key().len(), 16);
        assert_eq!(key.version(), 1);
        assert_eq!(key.elastic_key_id(), "ek-1");
        assert!(format!("{key:?}").contains("REDACTED"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_record_fields_are_bound() {
        shared::setup_test!();
        let (store, _barrier, pool) = store().await;
        let cancel = CancellationToken::new();
        let record = store
            .generate(
                "ek-1",
                1,
                ElasticKeyAlgorithm::signature(SignatureAlgorithm::HS256),
                &cancel,
            )
            .await
            .unwrap();

        let mut moved = record.clone();
        moved.elastic_key_id = "ek-2".to_string();
        assert!(matches!(
            store.decrypt(&moved, &cancel).await,
            Err(KmsError::Decryption { version: 1, .. })
        ));

        let mut bumped = record.clone();
        bumped.version = 2;
        assert!(matches!(
            store.decrypt(&bumped, &cancel).await,
            Err(KmsError::Decryption { version: 2, .. })
        ));

        let mut swapped = record.clone();
        swapped.algorithm = ElasticKeyAlgorithm::signature(SignatureAlgorithm::HS512);
        assert!(store.decrypt(&swapped, &cancel).await.is_err());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_sealed_barrier_blocks_decrypt() {
        shared::setup_test!();
        let (store, barrier, pool) = store().await;
        let cancel = CancellationToken::new();
        let record = store
            .generate(
                "ek-1",
                1,
                ElasticKeyAlgorithm::direct(ContentEncryption::A256Gcm),
                &cancel,
            )
            .await
            .unwrap();
        barrier.reseal().await;
        assert!(matches!(
            store.decrypt(&record, &cancel).await,
            Err(KmsError::Sealed)
        ));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_load_unknown_version() {
        shared::setup_test!();
        let (store, _barrier, pool) = store().await;
        assert!(matches!(
            store.load("missing", 3).await,
            Err(KmsError::UnknownKeyVersion { version: 3, .. })
        ));
        assert!(store.list_versions("missing").await.unwrap().is_empty());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_sealed_generate_draws_nothing_from_pool() {
        shared::setup_test!();
        let (store, barrier, pool) = store().await;
        let cancel = CancellationToken::new();
        barrier.reseal().await;
        let before = pool.stats(KeyFamily::Aes256);

        for algorithm in [
            ElasticKeyAlgorithm::direct(ContentEncryption::A256Gcm),
            ElasticKeyAlgorithm::signature(SignatureAlgorithm::HS512),
        ] {
            assert!(matches!(
                store.generate("ek-1", 1, algorithm, &cancel).await,
                Err(KmsError::Sealed)
            ));
        }
        assert!(matches!(
            store.draw(KeyFamily::Aes256, &cancel).await,
            Err(KmsError::Sealed)
        ));

        let after = pool.stats(KeyFamily::Aes256);
        assert_eq!(after.served_from_buffer, before.served_from_buffer);
        assert_eq!(after.served_on_demand, before.served_on_demand);
        assert_eq!(pool.stats(KeyFamily::Hmac512).served_on_demand, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_import_checks_material() {
        shared::setup_test!();
        let (store, _barrier, pool) = store().await;
        let cancel = CancellationToken::new();
        let algorithm = ElasticKeyAlgorithm::direct(ContentEncryption::A256Gcm);

        assert!(
            store
                .import("ek-1", 2, algorithm, &[5u8; 16], &cancel)
                .await
                .is_err()
        );
        let record = store
            .import("ek-1", 2, algorithm, &[5u8; 32], &cancel)
            .await
            .unwrap();
        assert!(record.imported);
        assert!(record.public_key.is_none());
        assert_eq!(store.decrypt(&record, &cancel).await.unwrap().key(), &[5u8; 32]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_asymmetric_records_carry_public_key() {
        shared::setup_test!();
        let (store, _barrier, pool) = store().await;
        let cancel = CancellationToken::new();
        let record = store
            .generate(
                "ek-1",
                1,
                ElasticKeyAlgorithm::signature(SignatureAlgorithm::ES256),
                &cancel,
            )
            .await
            .unwrap();
        assert!(!record.imported);
        let public = record.public_key.clone().unwrap();
        assert_eq!(public.kty, "EC");
        assert_eq!(public.crv.as_deref(), Some("P-256"));

        let private = store.decrypt(&record, &cancel).await.unwrap();
        assert_eq!(
            derive_public_jwk(KeyFamily::EcdsaP256, private.key()).unwrap(),
            Some(public)
        );
        pool.shutdown().await;
    }
}
