use std::{collections::BTreeMap, sync::Arc};

use parking_lot::RwLock;
use shared::{error::CommonError, primitives::WrappedChronoDateTime};

use super::{ActivateMaterialKey, BarrierRepositoryLike, ElasticKeyRepositoryLike};
use crate::logic::barrier::{BarrierKeyRecord, BarrierTier};
use crate::logic::elastic_key::{ElasticKey, ElasticKeyStatus};
use crate::logic::material_key::{MaterialKeyRecord, MaterialKeyStatus};

#[derive(Default)]
struct State {
    root: Option<BarrierKeyRecord>,
    barrier_keys: BTreeMap<(BarrierTier, u32), BarrierKeyRecord>,
    elastic_keys: BTreeMap<String, ElasticKey>,
    material_keys: BTreeMap<(String, u32), MaterialKeyRecord>,
}

fn conflict(msg: impl Into<String>) -> CommonError {
    CommonError::Repository {
        msg: msg.into(),
        source: None,
    }
}

fn not_found(what: &str, lookup_id: &str) -> CommonError {
    CommonError::NotFound {
        msg: what.to_string(),
        lookup_id: lookup_id.to_string(),
        source: None,
    }
}

/// Repository backed by process memory. Every write validates first and then applies
/// all of its changes under one lock, so readers never observe a partial update.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<RwLock<State>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flips a byte of a stored barrier key so that it no longer authenticates.
    #[cfg(test)]
    pub(crate) fn corrupt_barrier_key(&self, tier: BarrierTier, version: u32) {
        let mut state = self.state.write();
        let record = match tier {
            BarrierTier::Root => state.root.as_mut(),
            _ => state.barrier_keys.get_mut(&(tier, version)),
        };
        if let Some(byte) = record.and_then(|r| r.encrypted_key.last_mut()) {
            *byte ^= 0x01;
        }
    }

    /// Flips a byte of a stored material key's wrapped bytes.
    #[cfg(test)]
    pub(crate) fn corrupt_material_key(&self, elastic_key_id: &str, version: u32) {
        let mut state = self.state.write();
        if let Some(byte) = state
            .material_keys
            .get_mut(&(elastic_key_id.to_string(), version))
            .and_then(|r| r.encrypted_key.ciphertext.last_mut())
        {
            *byte ^= 0x01;
        }
    }
}

#[async_trait::async_trait]
impl BarrierRepositoryLike for InMemoryRepository {
    async fn initialize_barrier(
        &self,
        root: &BarrierKeyRecord,
        intermediate: &BarrierKeyRecord,
        content: &BarrierKeyRecord,
    ) -> Result<(), CommonError> {
        let mut state = self.state.write();
        if state.root.is_some() {
            return Err(conflict("barrier is already initialized"));
        }
        if intermediate.tier != BarrierTier::Intermediate || content.tier != BarrierTier::Content {
            return Err(conflict("barrier records were given in the wrong tiers"));
        }
        state.root = Some(root.clone());
        state
            .barrier_keys
            .insert((intermediate.tier, intermediate.version), intermediate.clone());
        state
            .barrier_keys
            .insert((content.tier, content.version), content.clone());
        Ok(())
    }

    async fn get_root_key(&self) -> Result<Option<BarrierKeyRecord>, CommonError> {
        Ok(self.state.read().root.clone())
    }

    async fn replace_root_key(&self, root: &BarrierKeyRecord) -> Result<(), CommonError> {
        let mut state = self.state.write();
        match &state.root {
            None => Err(CommonError::NotFound {
                msg: "root key".to_string(),
                lookup_id: "root".to_string(),
                source: None,
            }),
            Some(existing) if existing.version != root.version => Err(conflict(format!(
                "root key version {} does not match stored version {}",
                root.version, existing.version
            ))),
            Some(_) => {
                state.root = Some(root.clone());
                Ok(())
            }
        }
    }

    async fn create_barrier_key(&self, record: &BarrierKeyRecord) -> Result<(), CommonError> {
        if record.tier == BarrierTier::Root {
            return Err(conflict("root keys are created by initialize_barrier"));
        }
        let mut state = self.state.write();
        let latest = state
            .barrier_keys
            .range((record.tier, 0)..=(record.tier, u32::MAX))
            .next_back()
            .map(|(_, r)| r.version)
            .unwrap_or_default();
        if record.version <= latest {
            return Err(conflict(format!(
                "{} key version {} is not newer than {latest}",
                record.tier, record.version
            )));
        }
        state
            .barrier_keys
            .insert((record.tier, record.version), record.clone());
        Ok(())
    }

    async fn list_barrier_keys(
        &self,
        tier: BarrierTier,
    ) -> Result<Vec<BarrierKeyRecord>, CommonError> {
        let state = self.state.read();
        if tier == BarrierTier::Root {
            return Ok(state.root.iter().cloned().collect());
        }
        Ok(state
            .barrier_keys
            .range((tier, 0)..=(tier, u32::MAX))
            .map(|(_, r)| r.clone())
            .collect())
    }
}

#[async_trait::async_trait]
impl ElasticKeyRepositoryLike for InMemoryRepository {
    async fn create_elastic_key(
        &self,
        elastic_key: &ElasticKey,
        material_key: &MaterialKeyRecord,
    ) -> Result<(), CommonError> {
        let mut state = self.state.write();
        if state.elastic_keys.contains_key(&elastic_key.id) {
            return Err(conflict(format!(
                "elastic key {} already exists",
                elastic_key.id
            )));
        }
        if material_key.elastic_key_id != elastic_key.id
            || material_key.version != elastic_key.active_version
        {
            return Err(conflict("material key does not belong to the elastic key"));
        }
        state
            .elastic_keys
            .insert(elastic_key.id.clone(), elastic_key.clone());
        state.material_keys.insert(
            (material_key.elastic_key_id.clone(), material_key.version),
            material_key.clone(),
        );
        Ok(())
    }

    async fn get_elastic_key(&self, id: &str) -> Result<Option<ElasticKey>, CommonError> {
        Ok(self.state.read().elastic_keys.get(id).cloned())
    }

    async fn list_elastic_keys(&self) -> Result<Vec<ElasticKey>, CommonError> {
        let mut keys: Vec<ElasticKey> = self.state.read().elastic_keys.values().cloned().collect();
        keys.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(keys)
    }

    async fn update_elastic_key_status(
        &self,
        id: &str,
        status: ElasticKeyStatus,
        updated_at: WrappedChronoDateTime,
    ) -> Result<(), CommonError> {
        let mut state = self.state.write();
        let key = state
            .elastic_keys
            .get_mut(id)
            .ok_or_else(|| not_found("elastic key", id))?;
        key.status = status;
        key.updated_at = updated_at;
        Ok(())
    }

    async fn update_elastic_key_details(
        &self,
        id: &str,
        name: &str,
        description: Option<&str>,
        updated_at: WrappedChronoDateTime,
    ) -> Result<(), CommonError> {
        let mut state = self.state.write();
        let key = state
            .elastic_keys
            .get_mut(id)
            .ok_or_else(|| not_found("elastic key", id))?;
        key.name = name.to_string();
        key.description = description.map(str::to_string);
        key.updated_at = updated_at;
        Ok(())
    }

    async fn get_material_key(
        &self,
        elastic_key_id: &str,
        version: u32,
    ) -> Result<Option<MaterialKeyRecord>, CommonError> {
        Ok(self
            .state
            .read()
            .material_keys
            .get(&(elastic_key_id.to_string(), version))
            .cloned())
    }

    async fn list_material_keys(
        &self,
        elastic_key_id: &str,
    ) -> Result<Vec<MaterialKeyRecord>, CommonError> {
        let id = elastic_key_id.to_string();
        Ok(self
            .state
            .read()
            .material_keys
            .range((id.clone(), 0)..=(id, u32::MAX))
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn activate_material_key(
        &self,
        params: &ActivateMaterialKey<'_>,
    ) -> Result<(), CommonError> {
        let mut state = self.state.write();
        let elastic_key_id = params.elastic_key_id.to_string();
        let new_version = params.material_key.version;

        let Some(key) = state.elastic_keys.get(&elastic_key_id) else {
            return Err(not_found("elastic key", &elastic_key_id));
        };
        if key.active_version != params.expected_active_version {
            return Err(conflict(format!(
                "elastic key {elastic_key_id} active version is {}, expected {}",
                key.active_version, params.expected_active_version
            )));
        }
        if params.material_key.elastic_key_id != elastic_key_id
            || new_version != params.expected_active_version + 1
        {
            return Err(conflict(format!(
                "material key version {new_version} cannot follow version {}",
                params.expected_active_version
            )));
        }

        let previous = (elastic_key_id.clone(), params.expected_active_version);
        if let Some(old) = state.material_keys.get_mut(&previous)
            && old.status == MaterialKeyStatus::Active
        {
            old.status = MaterialKeyStatus::Retired;
            old.retired_at = Some(params.activated_at);
        }
        let mut record = params.material_key.clone();
        record.status = MaterialKeyStatus::Active;
        record.retired_at = None;
        state
            .material_keys
            .insert((elastic_key_id.clone(), new_version), record);

        if let Some(key) = state.elastic_keys.get_mut(&elastic_key_id) {
            key.active_version = new_version;
            key.updated_at = params.activated_at;
            key.last_rotated_at = Some(params.activated_at);
        }
        Ok(())
    }

    async fn revoke_material_key(
        &self,
        elastic_key_id: &str,
        version: u32,
        revoked_at: WrappedChronoDateTime,
    ) -> Result<(), CommonError> {
        let mut state = self.state.write();
        let record = state
            .material_keys
            .get_mut(&(elastic_key_id.to_string(), version))
            .ok_or_else(|| not_found("material key", &format!("{elastic_key_id}/v{version}")))?;
        if record.status == MaterialKeyStatus::Revoked {
            return Err(conflict(format!(
                "material key version {version} of {elastic_key_id} is already revoked"
            )));
        }
        record.status = MaterialKeyStatus::Revoked;
        record.revoked_at = Some(revoked_at);
        Ok(())
    }

    async fn delete_material_key(
        &self,
        elastic_key_id: &str,
        version: u32,
    ) -> Result<(), CommonError> {
        let mut state = self.state.write();
        let key = (elastic_key_id.to_string(), version);
        let Some(record) = state.material_keys.get(&key) else {
            return Err(not_found("material key", &format!("{elastic_key_id}/v{version}")));
        };
        if record.status != MaterialKeyStatus::Revoked {
            return Err(conflict(format!(
                "material key version {version} of {elastic_key_id} must be revoked before deletion"
            )));
        }
        if state
            .elastic_keys
            .get(elastic_key_id)
            .is_some_and(|ek| ek.active_version == version)
        {
            return Err(conflict(format!(
                "material key version {version} is the active version of {elastic_key_id}"
            )));
        }
        state.material_keys.remove(&key);
        Ok(())
    }
}
