mod memory;

pub use memory::InMemoryRepository;

use shared::{error::CommonError, primitives::WrappedChronoDateTime};

use crate::logic::barrier::{BarrierKeyRecord, BarrierTier};
use crate::logic::elastic_key::{ElasticKey, ElasticKeyStatus};
use crate::logic::material_key::MaterialKeyRecord;

// Repository trait for the barrier key hierarchy
#[async_trait::async_trait]
pub trait BarrierRepositoryLike: Send + Sync {
    /// Persists version 1 of every tier in one transaction. Fails if a root key exists.
    async fn initialize_barrier(
        &self,
        root: &BarrierKeyRecord,
        intermediate: &BarrierKeyRecord,
        content: &BarrierKeyRecord,
    ) -> Result<(), CommonError>;

    async fn get_root_key(&self) -> Result<Option<BarrierKeyRecord>, CommonError>;

    async fn replace_root_key(&self, root: &BarrierKeyRecord) -> Result<(), CommonError>;

    /// Appends an intermediate or content key version. Versions must be strictly increasing.
    async fn create_barrier_key(&self, record: &BarrierKeyRecord) -> Result<(), CommonError>;

    /// All versions of a tier, ascending.
    async fn list_barrier_keys(
        &self,
        tier: BarrierTier,
    ) -> Result<Vec<BarrierKeyRecord>, CommonError>;
}

#[derive(Debug)]
pub struct ActivateMaterialKey<'a> {
    pub elastic_key_id: &'a str,
    /// The stored active version must still equal this, or the update is rejected.
    pub expected_active_version: u32,
    pub material_key: &'a MaterialKeyRecord,
    pub activated_at: WrappedChronoDateTime,
}

// Repository trait for elastic keys and their material key versions
#[async_trait::async_trait]
pub trait ElasticKeyRepositoryLike: Send + Sync {
    /// Stores a new elastic key together with its first material key, atomically.
    async fn create_elastic_key(
        &self,
        elastic_key: &ElasticKey,
        material_key: &MaterialKeyRecord,
    ) -> Result<(), CommonError>;

    async fn get_elastic_key(&self, id: &str) -> Result<Option<ElasticKey>, CommonError>;

    async fn list_elastic_keys(&self) -> Result<Vec<ElasticKey>, CommonError>;

    async fn update_elastic_key_status(
        &self,
        id: &str,
        status: ElasticKeyStatus,
        updated_at: WrappedChronoDateTime,
    ) -> Result<(), CommonError>;

    async fn update_elastic_key_details(
        &self,
        id: &str,
        name: &str,
        description: Option<&str>,
        updated_at: WrappedChronoDateTime,
    ) -> Result<(), CommonError>;

    async fn get_material_key(
        &self,
        elastic_key_id: &str,
        version: u32,
    ) -> Result<Option<MaterialKeyRecord>, CommonError>;

    /// All versions of one elastic key, ascending.
    async fn list_material_keys(
        &self,
        elastic_key_id: &str,
    ) -> Result<Vec<MaterialKeyRecord>, CommonError>;

    /// In one transaction: insert the new version as active, retire the previous one
    /// unless it was revoked, and move the elastic key's active pointer.
    async fn activate_material_key(
        &self,
        params: &ActivateMaterialKey<'_>,
    ) -> Result<(), CommonError>;

    /// Fails if the version does not exist or is already revoked.
    async fn revoke_material_key(
        &self,
        elastic_key_id: &str,
        version: u32,
        revoked_at: WrappedChronoDateTime,
    ) -> Result<(), CommonError>;

    /// Hard delete. Only revoked versions that are not the active version may be removed.
    async fn delete_material_key(&self, elastic_key_id: &str, version: u32)
    -> Result<(), CommonError>;
}
