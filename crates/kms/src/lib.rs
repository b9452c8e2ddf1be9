pub mod error;
pub mod logic;
pub mod repository;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::KmsError;
use crate::logic::{
    BarrierService, BarrierState, BarrierStatus, CryptoOperationEngine, ElasticKeyService,
    KeyGenerationPool, KmsConfig, KmsEventReceiver, KmsEventSender, MaterialKeyStore,
    UnsealProvider, UnsealSecret, UnsealStrategy, event_channel, read_unseal_secret_files,
    unseal_strategy_from_config,
};
use crate::repository::{BarrierRepositoryLike, ElasticKeyRepositoryLike};

/// Wires the unseal provider, barrier, key pool, elastic key service and crypto
/// engine over one repository.
///
/// Must be created inside a tokio runtime: the key pool starts its workers immediately.
pub struct Kms {
    config: KmsConfig,
    events: KmsEventSender,
    unseal: UnsealProvider,
    pool: Arc<KeyGenerationPool>,
    barrier: Arc<BarrierService>,
    elastic_keys: Arc<ElasticKeyService>,
    crypto: CryptoOperationEngine,
}

impl Kms {
    pub fn new<R>(config: KmsConfig, repo: Arc<R>) -> Result<Self, KmsError>
    where
        R: BarrierRepositoryLike + ElasticKeyRepositoryLike + 'static,
    {
        config.validate()?;
        let strategy = unseal_strategy_from_config(&config.unseal)?;
        Self::with_unseal_strategy(config, repo, strategy)
    }

    /// Like [`Kms::new`] with a caller supplied unseal strategy, e.g. a system
    /// strategy over a custom fingerprint source. The `unseal` config section is
    /// not consulted for key derivation; every other section is validated.
    pub fn with_unseal_strategy<R>(
        config: KmsConfig,
        repo: Arc<R>,
        strategy: Box<dyn UnsealStrategy>,
    ) -> Result<Self, KmsError>
    where
        R: BarrierRepositoryLike + ElasticKeyRepositoryLike + 'static,
    {
        config.validate_pool_and_rotation()?;
        let (events, _) = event_channel();
        let pool = KeyGenerationPool::start(&config.pool, events.clone());
        let barrier = Arc::new(BarrierService::new(
            repo.clone(),
            pool.clone(),
            events.clone(),
        ));
        let materials = MaterialKeyStore::new(repo.clone(), barrier.clone(), pool.clone());
        let elastic_keys = Arc::new(ElasticKeyService::new(
            repo,
            materials,
            &config.rotation,
            events.clone(),
        ));
        let crypto = CryptoOperationEngine::new(elastic_keys.clone(), events.clone());

        info!(unseal_mode = %strategy.mode(), "kms created, barrier sealed");
        Ok(Self {
            unseal: UnsealProvider::new(strategy, events.clone()),
            config,
            events,
            pool,
            barrier,
            elastic_keys,
            crypto,
        })
    }

    /// Derives the unseal key and opens the barrier. A failed barrier unseal also
    /// drops the derived key, so the next attempt starts from fresh secrets.
    pub async fn unseal(
        &self,
        secrets: &[UnsealSecret],
        cancel: &CancellationToken,
    ) -> Result<BarrierStatus, KmsError> {
        let key = self.unseal.unseal(secrets)?;
        match self.barrier.unseal(&key, cancel).await {
            Ok(status) => Ok(status),
            Err(e) => {
                self.unseal.reseal();
                Err(e)
            }
        }
    }

    /// Unseals with the secret files named in `unseal.secret_files`.
    pub async fn unseal_from_files(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BarrierStatus, KmsError> {
        let secrets = read_unseal_secret_files(&self.config.unseal.secret_files)?;
        self.unseal(&secrets, cancel).await
    }

    pub async fn reseal(&self) {
        self.barrier.reseal().await;
        self.unseal.reseal();
    }

    /// Re-seals the root key under the key derived from `new_secrets`. The old
    /// secrets stop working once this returns.
    pub async fn rekey_root(
        &self,
        new_secrets: &[UnsealSecret],
        cancel: &CancellationToken,
    ) -> Result<(), KmsError> {
        if self.barrier.state() != BarrierState::Unsealed {
            return Err(KmsError::Sealed);
        }
        let new_key = self.unseal.derive(new_secrets)?;
        self.barrier.rewrap_root_key(&new_key, cancel).await?;
        self.unseal.replace(new_key);
        Ok(())
    }

    /// Reseals and stops the key pool. Buffered key material is discarded.
    pub async fn shutdown(&self) {
        self.reseal().await;
        self.pool.shutdown().await;
        info!("kms shut down");
    }

    pub fn subscribe(&self) -> KmsEventReceiver {
        self.events.subscribe()
    }

    pub fn config(&self) -> &KmsConfig {
        &self.config
    }

    pub fn state(&self) -> BarrierState {
        self.barrier.state()
    }

    pub async fn status(&self) -> BarrierStatus {
        self.barrier.status().await
    }

    pub fn barrier(&self) -> &Arc<BarrierService> {
        &self.barrier
    }

    pub fn pool(&self) -> &Arc<KeyGenerationPool> {
        &self.pool
    }

    pub fn elastic_keys(&self) -> &Arc<ElasticKeyService> {
        &self.elastic_keys
    }

    pub fn crypto(&self) -> &CryptoOperationEngine {
        &self.crypto
    }
}
