use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use shared::primitives::{WrappedChronoDateTime, WrappedUuidV4};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::KmsError;
use crate::logic::cipher::{open_aes256, seal_aes256};
use crate::logic::keygen::KeyFamily;
use crate::logic::pool::KeyGenerationPool;
use crate::logic::unseal::UnsealKey;
use crate::logic::{KmsEvent, KmsEventSender, publish_event};
use crate::repository::BarrierRepositoryLike;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierTier {
    Root,
    Intermediate,
    Content,
}

impl BarrierTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            BarrierTier::Root => "root",
            BarrierTier::Intermediate => "intermediate",
            BarrierTier::Content => "content",
        }
    }
}

impl fmt::Display for BarrierTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierState {
    Sealed,
    Unsealing,
    Unsealed,
}

impl BarrierState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BarrierState::Unsealing,
            2 => BarrierState::Unsealed,
            _ => BarrierState::Sealed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            BarrierState::Sealed => 0,
            BarrierState::Unsealing => 1,
            BarrierState::Unsealed => 2,
        }
    }
}

/// Persisted form of one barrier key version. `encrypted_key` is sealed under the
/// parent tier (`parent_version`), or under the unseal key for the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierKeyRecord {
    pub id: WrappedUuidV4,
    pub tier: BarrierTier,
    pub version: u32,
    pub parent_version: Option<u32>,
    pub encrypted_key: Vec<u8>,
    pub created_at: WrappedChronoDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BarrierStatus {
    pub state: BarrierState,
    pub root_version: Option<u32>,
    pub intermediate_version: Option<u32>,
    pub content_version: Option<u32>,
    pub intermediate_versions: usize,
    pub content_versions: usize,
}

impl BarrierStatus {
    fn sealed(state: BarrierState) -> Self {
        Self {
            state,
            root_version: None,
            intermediate_version: None,
            content_version: None,
            intermediate_versions: 0,
            content_versions: 0,
        }
    }
}

/// A key sealed by the active content key, tagged with that key's version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedContentKey {
    pub ciphertext: Vec<u8>,
    pub content_version: u32,
}

struct TierKey {
    id: WrappedUuidV4,
    version: u32,
    key: Zeroizing<Vec<u8>>,
}

// Append-only: versions are inserted, never replaced or removed while unsealed.
struct KeyArena {
    tier: BarrierTier,
    keys: BTreeMap<u32, TierKey>,
}

impl KeyArena {
    fn new(tier: BarrierTier) -> Self {
        Self {
            tier,
            keys: BTreeMap::new(),
        }
    }

    fn active(&self) -> Result<&TierKey, KmsError> {
        self.keys
            .values()
            .next_back()
            .ok_or_else(|| KmsError::internal(format!("no {} key loaded", self.tier)))
    }

    fn get(&self, version: u32) -> Result<&TierKey, KmsError> {
        self.keys
            .get(&version)
            .ok_or_else(|| KmsError::UnknownKeyVersion {
                key_id: format!("barrier/{}", self.tier),
                version,
            })
    }

    fn next_version(&self) -> u32 {
        self.keys.keys().next_back().map_or(1, |v| v + 1)
    }

    fn insert(&mut self, key: TierKey) {
        self.keys.insert(key.version, key);
    }
}

struct UnsealedTiers {
    root: TierKey,
    intermediate: KeyArena,
    content: KeyArena,
}

enum BarrierKeys {
    Sealed,
    Unsealed(UnsealedTiers),
}

impl BarrierKeys {
    fn unsealed(&self) -> Result<&UnsealedTiers, KmsError> {
        match self {
            BarrierKeys::Unsealed(tiers) => Ok(tiers),
            BarrierKeys::Sealed => Err(KmsError::Sealed),
        }
    }

    fn unsealed_mut(&mut self) -> Result<&mut UnsealedTiers, KmsError> {
        match self {
            BarrierKeys::Unsealed(tiers) => Ok(tiers),
            BarrierKeys::Sealed => Err(KmsError::Sealed),
        }
    }
}

fn tier_aad(tier: BarrierTier, id: &WrappedUuidV4, version: u32) -> Vec<u8> {
    format!("kms/barrier/{tier}/{id}/v{version}").into_bytes()
}

fn content_aad(content_version: u32, context: &[u8]) -> Vec<u8> {
    let mut aad = format!("kms/content/v{content_version}/").into_bytes();
    aad.extend_from_slice(context);
    aad
}

fn seal_tier_key(
    parent_key: &[u8],
    tier: BarrierTier,
    key: &TierKey,
    parent_version: Option<u32>,
) -> Result<BarrierKeyRecord, KmsError> {
    Ok(BarrierKeyRecord {
        id: key.id.clone(),
        tier,
        version: key.version,
        parent_version,
        encrypted_key: seal_aes256(parent_key, &key.key, &tier_aad(tier, &key.id, key.version))?,
        created_at: WrappedChronoDateTime::now(),
    })
}

fn open_tier_key(parent_key: &[u8], record: &BarrierKeyRecord) -> Result<TierKey, KmsError> {
    let key = open_aes256(
        parent_key,
        &record.encrypted_key,
        &tier_aad(record.tier, &record.id, record.version),
    )
    .map_err(|_| KmsError::Decryption {
        key_id: format!("barrier/{}/{}", record.tier, record.id),
        version: record.version,
    })?;
    Ok(TierKey {
        id: record.id.clone(),
        version: record.version,
        key,
    })
}

/// Owns the root, intermediate and content key tiers.
///
/// While sealed nothing is decrypted and every operation fails with
/// [`KmsError::Sealed`]. Unsealing decrypts every persisted version of every tier
/// once, so later unwraps never touch the repository.
pub struct BarrierService {
    repo: Arc<dyn BarrierRepositoryLike>,
    pool: Arc<KeyGenerationPool>,
    events: KmsEventSender,
    state: AtomicU8,
    keys: RwLock<BarrierKeys>,
}

impl BarrierService {
    pub fn new(
        repo: Arc<dyn BarrierRepositoryLike>,
        pool: Arc<KeyGenerationPool>,
        events: KmsEventSender,
    ) -> Self {
        Self {
            repo,
            pool,
            events,
            state: AtomicU8::new(BarrierState::Sealed.as_u8()),
            keys: RwLock::new(BarrierKeys::Sealed),
        }
    }

    pub fn state(&self) -> BarrierState {
        BarrierState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: BarrierState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Fails fast with `Sealed`, without waiting on the key lock.
    pub fn ensure_unsealed(&self) -> Result<(), KmsError> {
        match self.state() {
            BarrierState::Sealed => Err(KmsError::Sealed),
            _ => Ok(()),
        }
    }

    async fn read_keys(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RwLockReadGuard<'_, BarrierKeys>, KmsError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(KmsError::Cancelled),
            guard = self.keys.read() => Ok(guard),
        }
    }

    async fn write_keys(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RwLockWriteGuard<'_, BarrierKeys>, KmsError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(KmsError::Cancelled),
            guard = self.keys.write() => Ok(guard),
        }
    }

    pub async fn status(&self) -> BarrierStatus {
        let keys = self.keys.read().await;
        status_of(self.state(), &keys)
    }

    /// Loads and decrypts the hierarchy. On an empty store, creates version 1 of every tier.
    pub async fn unseal(
        &self,
        unseal_key: &UnsealKey,
        cancel: &CancellationToken,
    ) -> Result<BarrierStatus, KmsError> {
        let mut keys = self.write_keys(cancel).await?;
        if let BarrierKeys::Unsealed(_) = &*keys {
            return Ok(status_of(self.state(), &keys));
        }

        self.set_state(BarrierState::Unsealing);
        match self.load_tiers(unseal_key, cancel).await {
            Ok(tiers) => {
                *keys = BarrierKeys::Unsealed(tiers);
                self.set_state(BarrierState::Unsealed);
                let status = status_of(BarrierState::Unsealed, &keys);
                info!(
                    root_version = ?status.root_version,
                    intermediate_version = ?status.intermediate_version,
                    content_version = ?status.content_version,
                    "barrier unsealed"
                );
                publish_event(
                    &self.events,
                    KmsEvent::BarrierUnsealed {
                        root_version: status.root_version.unwrap_or_default(),
                        intermediate_version: status.intermediate_version.unwrap_or_default(),
                        content_version: status.content_version.unwrap_or_default(),
                    },
                );
                Ok(status)
            }
            Err(e) => {
                self.set_state(BarrierState::Sealed);
                warn!(error = %e, "barrier unseal failed");
                Err(e)
            }
        }
    }

    async fn load_tiers(
        &self,
        unseal_key: &UnsealKey,
        cancel: &CancellationToken,
    ) -> Result<UnsealedTiers, KmsError> {
        let Some(root_record) = self.repo.get_root_key().await? else {
            return self.bootstrap(unseal_key, cancel).await;
        };

        let root = open_tier_key(unseal_key.as_bytes(), &root_record)?;

        let mut intermediate = KeyArena::new(BarrierTier::Intermediate);
        for record in self.repo.list_barrier_keys(BarrierTier::Intermediate).await? {
            if record.parent_version != Some(root.version) {
                return Err(KmsError::UnknownKeyVersion {
                    key_id: format!("barrier/{}", BarrierTier::Root),
                    version: record.parent_version.unwrap_or_default(),
                });
            }
            intermediate.insert(open_tier_key(&root.key, &record)?);
        }

        let mut content = KeyArena::new(BarrierTier::Content);
        for record in self.repo.list_barrier_keys(BarrierTier::Content).await? {
            let parent = intermediate.get(record.parent_version.unwrap_or_default())?;
            content.insert(open_tier_key(&parent.key, &record)?);
        }

        if intermediate.keys.is_empty() || content.keys.is_empty() {
            return Err(KmsError::internal(
                "barrier store has a root key but is missing intermediate or content keys",
            ));
        }

        Ok(UnsealedTiers {
            root,
            intermediate,
            content,
        })
    }

    async fn bootstrap(
        &self,
        unseal_key: &UnsealKey,
        cancel: &CancellationToken,
    ) -> Result<UnsealedTiers, KmsError> {
        info!("barrier store is empty, creating initial key hierarchy");
        let root = self.new_tier_key(1, cancel).await?;
        let intermediate_key = self.new_tier_key(1, cancel).await?;
        let content_key = self.new_tier_key(1, cancel).await?;

        let root_record = seal_tier_key(unseal_key.as_bytes(), BarrierTier::Root, &root, None)?;
        let intermediate_record = seal_tier_key(
            &root.key,
            BarrierTier::Intermediate,
            &intermediate_key,
            Some(root.version),
        )?;
        let content_record = seal_tier_key(
            &intermediate_key.key,
            BarrierTier::Content,
            &content_key,
            Some(intermediate_key.version),
        )?;

        if cancel.is_cancelled() {
            return Err(KmsError::Cancelled);
        }
        self.repo
            .initialize_barrier(&root_record, &intermediate_record, &content_record)
            .await?;

        let mut intermediate = KeyArena::new(BarrierTier::Intermediate);
        intermediate.insert(intermediate_key);
        let mut content = KeyArena::new(BarrierTier::Content);
        content.insert(content_key);

        Ok(UnsealedTiers {
            root,
            intermediate,
            content,
        })
    }

    async fn new_tier_key(
        &self,
        version: u32,
        cancel: &CancellationToken,
    ) -> Result<TierKey, KmsError> {
        let key = self.pool.acquire(KeyFamily::Aes256, cancel).await?;
        Ok(TierKey {
            id: WrappedUuidV4::new(),
            version,
            key: key.into_material(),
        })
    }

    /// Discards every decrypted key. Idempotent.
    pub async fn reseal(&self) {
        let mut keys = self.keys.write().await;
        let was_unsealed = matches!(&*keys, BarrierKeys::Unsealed(_));
        *keys = BarrierKeys::Sealed;
        self.set_state(BarrierState::Sealed);
        if was_unsealed {
            info!("barrier resealed");
            publish_event(&self.events, KmsEvent::BarrierResealed);
        }
    }

    /// Seals `plaintext` under the active content key. `context` is bound as AAD.
    pub async fn wrap_content_key(
        &self,
        plaintext: &[u8],
        context: &[u8],
        cancel: &CancellationToken,
    ) -> Result<WrappedContentKey, KmsError> {
        self.ensure_unsealed()?;
        let keys = self.read_keys(cancel).await?;
        let content = keys.unsealed()?.content.active()?;
        let ciphertext = seal_aes256(&content.key, plaintext, &content_aad(content.version, context))?;
        Ok(WrappedContentKey {
            ciphertext,
            content_version: content.version,
        })
    }

    pub async fn unwrap_content_key(
        &self,
        wrapped: &WrappedContentKey,
        context: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        self.ensure_unsealed()?;
        let keys = self.read_keys(cancel).await?;
        let content = keys.unsealed()?.content.get(wrapped.content_version)?;
        open_aes256(
            &content.key,
            &wrapped.ciphertext,
            &content_aad(content.version, context),
        )
        .map_err(|_| KmsError::Decryption {
            key_id: format!("barrier/{}/{}", BarrierTier::Content, content.id),
            version: content.version,
        })
    }

    /// Adds a content key version sealed under the active intermediate key and makes it active.
    pub async fn rotate_content_key(&self, cancel: &CancellationToken) -> Result<u32, KmsError> {
        self.ensure_unsealed()?;
        let material = self.pool.acquire(KeyFamily::Aes256, cancel).await?;

        let mut keys = self.write_keys(cancel).await?;
        let tiers = keys.unsealed_mut()?;
        let parent = tiers.intermediate.active()?;
        let new_key = TierKey {
            id: WrappedUuidV4::new(),
            version: tiers.content.next_version(),
            key: material.into_material(),
        };
        let record = seal_tier_key(
            &parent.key,
            BarrierTier::Content,
            &new_key,
            Some(parent.version),
        )?;

        if cancel.is_cancelled() {
            return Err(KmsError::Cancelled);
        }
        self.repo.create_barrier_key(&record).await?;

        let version = new_key.version;
        tiers.content.insert(new_key);
        info!(version, "content key rotated");
        publish_event(
            &self.events,
            KmsEvent::BarrierKeyRotated {
                tier: BarrierTier::Content,
                version,
            },
        );
        Ok(version)
    }

    /// Adds an intermediate key version sealed under the root key. Content keys sealed
    /// under older intermediate versions stay readable.
    pub async fn rotate_intermediate_key(
        &self,
        cancel: &CancellationToken,
    ) -> Result<u32, KmsError> {
        self.ensure_unsealed()?;
        let material = self.pool.acquire(KeyFamily::Aes256, cancel).await?;

        let mut keys = self.write_keys(cancel).await?;
        let tiers = keys.unsealed_mut()?;
        let new_key = TierKey {
            id: WrappedUuidV4::new(),
            version: tiers.intermediate.next_version(),
            key: material.into_material(),
        };
        let record = seal_tier_key(
            &tiers.root.key,
            BarrierTier::Intermediate,
            &new_key,
            Some(tiers.root.version),
        )?;

        if cancel.is_cancelled() {
            return Err(KmsError::Cancelled);
        }
        self.repo.create_barrier_key(&record).await?;

        let version = new_key.version;
        tiers.intermediate.insert(new_key);
        info!(version, "intermediate key rotated");
        publish_event(
            &self.events,
            KmsEvent::BarrierKeyRotated {
                tier: BarrierTier::Intermediate,
                version,
            },
        );
        Ok(version)
    }

    /// Re-seals the root key under a new unseal key. The root key itself does not change.
    pub async fn rewrap_root_key(
        &self,
        new_unseal_key: &UnsealKey,
        cancel: &CancellationToken,
    ) -> Result<(), KmsError> {
        self.ensure_unsealed()?;
        let keys = self.write_keys(cancel).await?;
        let tiers = keys.unsealed()?;
        let record = seal_tier_key(
            new_unseal_key.as_bytes(),
            BarrierTier::Root,
            &tiers.root,
            None,
        )?;

        if cancel.is_cancelled() {
            return Err(KmsError::Cancelled);
        }
        self.repo.replace_root_key(&record).await?;
        info!("root key re-sealed under a new unseal key");
        publish_event(&self.events, KmsEvent::RootKeyRewrapped);
        Ok(())
    }
}

fn status_of(state: BarrierState, keys: &BarrierKeys) -> BarrierStatus {
    match keys {
        BarrierKeys::Sealed => BarrierStatus::sealed(state),
        BarrierKeys::Unsealed(tiers) => BarrierStatus {
            state,
            root_version: Some(tiers.root.version),
            intermediate_version: tiers.intermediate.active().ok().map(|k| k.version),
            content_version: tiers.content.active().ok().map(|k| k.version),
            intermediate_versions: tiers.intermediate.keys.len(),
            content_versions: tiers.content.keys.len(),
        },
    }
}
