use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use shared::error::CommonError;
use shared::subsystem::{SubsystemHandle, spawn_subsystem};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::KmsError;
use crate::logic::config::PoolConfig;
use crate::logic::keygen::{KeyFamily, PooledKey, generate_key};
use crate::logic::{KmsEvent, KmsEventSender, publish_event};

const GENERATION_RETRY_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Default)]
struct PoolCounters {
    generated: AtomicU64,
    served_from_buffer: AtomicU64,
    served_on_demand: AtomicU64,
    generation_failures: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub family: KeyFamily,
    pub capacity: usize,
    pub workers: usize,
    pub buffered: usize,
    pub generated: u64,
    pub served_from_buffer: u64,
    pub served_on_demand: u64,
    pub generation_failures: u64,
    pub discarded: u64,
}

struct FamilyPool {
    family: KeyFamily,
    capacity: usize,
    workers: usize,
    receiver: Mutex<mpsc::Receiver<PooledKey>>,
    counters: Arc<PoolCounters>,
}

/// Pre-generates key material per family on background workers.
///
/// Each worker reserves a channel slot before generating, so buffered plus
/// in-flight keys never exceed the configured size. Every key is handed out
/// at most once.
pub struct KeyGenerationPool {
    pools: HashMap<KeyFamily, FamilyPool>,
    on_demand: HashMap<KeyFamily, Arc<PoolCounters>>,
    workers: Mutex<Vec<SubsystemHandle>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    events: KmsEventSender,
}

impl KeyGenerationPool {
    /// Spawns the workers. Must be called from within a tokio runtime.
    pub fn start(config: &PoolConfig, events: KmsEventSender) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let mut pools = HashMap::new();
        let mut handles = Vec::new();

        for (family, settings) in &config.families {
            if settings.workers == 0 || settings.size == 0 {
                continue;
            }

            let (tx, rx) = mpsc::channel(settings.size);
            let counters = Arc::new(PoolCounters::default());

            for worker_id in 0..settings.workers {
                handles.push(spawn_subsystem(
                    format!("key-pool-{family}-{worker_id}"),
                    run_worker(*family, tx.clone(), shutdown.child_token(), counters.clone()),
                ));
            }

            pools.insert(
                *family,
                FamilyPool {
                    family: *family,
                    capacity: settings.size,
                    workers: settings.workers,
                    receiver: Mutex::new(rx),
                    counters,
                },
            );
        }

        let on_demand = KeyFamily::ALL
            .iter()
            .filter(|family| !pools.contains_key(*family))
            .map(|family| (*family, Arc::new(PoolCounters::default())))
            .collect();

        info!(
            pooled_families = pools.len(),
            workers = handles.len(),
            "key generation pool started"
        );

        Arc::new(Self {
            pools,
            on_demand,
            workers: Mutex::new(handles),
            shutdown,
            closed: AtomicBool::new(false),
            events,
        })
    }

    /// Takes a buffered key if one is ready.
    pub fn try_acquire(&self, family: KeyFamily) -> Option<PooledKey> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let pool = self.pools.get(&family)?;
        let key = pool.receiver.lock().try_recv().ok()?;
        pool.counters
            .served_from_buffer
            .fetch_add(1, Ordering::Relaxed);
        Some(key)
    }

    /// Returns a buffered key, or generates one on a blocking thread when the buffer is empty.
    pub async fn acquire(
        &self,
        family: KeyFamily,
        cancel: &CancellationToken,
    ) -> Result<PooledKey, KmsError> {
        if cancel.is_cancelled() {
            return Err(KmsError::Cancelled);
        }
        if let Some(key) = self.try_acquire(family) {
            return Ok(key);
        }

        let counters = match self.pools.get(&family) {
            Some(pool) if self.is_shut_down() => {
                debug!(family = %family, "key pool is shut down, generating on demand");
                pool.counters.clone()
            }
            Some(pool) => {
                warn!(family = %family, "key pool exhausted, generating on demand");
                publish_event(&self.events, KmsEvent::PoolExhausted { family });
                pool.counters.clone()
            }
            None => {
                debug!(family = %family, "family is not pooled, generating on demand");
                self.on_demand
                    .get(&family)
                    .cloned()
                    .unwrap_or_default()
            }
        };

        let generation = tokio::task::spawn_blocking(move || generate_key(family));
        let key = tokio::select! {
            _ = cancel.cancelled() => return Err(KmsError::Cancelled),
            result = generation => result.map_err(CommonError::from)??,
        };
        counters.served_on_demand.fetch_add(1, Ordering::Relaxed);
        Ok(key)
    }

    pub fn stats(&self, family: KeyFamily) -> PoolStats {
        match self.pools.get(&family) {
            Some(pool) => {
                let buffered = pool.receiver.lock().len();
                snapshot(family, pool.capacity, pool.workers, buffered, &pool.counters)
            }
            None => {
                let counters = self.on_demand.get(&family).cloned().unwrap_or_default();
                snapshot(family, 0, 0, 0, &counters)
            }
        }
    }

    pub fn pooled_families(&self) -> Vec<KeyFamily> {
        let mut families: Vec<KeyFamily> = self.pools.keys().copied().collect();
        families.sort();
        families
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops the workers, waits for in-flight generation and discards buffered keys.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();

        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            handle.wait_for_shutdown().await;
        }

        for pool in self.pools.values() {
            let mut receiver = pool.receiver.lock();
            receiver.close();
            let mut discarded = 0u64;
            while let Ok(key) = receiver.try_recv() {
                drop(key);
                discarded += 1;
            }
            pool.counters
                .discarded
                .fetch_add(discarded, Ordering::Relaxed);
            debug!(family = %pool.family, discarded, "drained key pool");
        }

        info!("key generation pool stopped");
    }
}

fn snapshot(
    family: KeyFamily,
    capacity: usize,
    workers: usize,
    buffered: usize,
    counters: &PoolCounters,
) -> PoolStats {
    PoolStats {
        family,
        capacity,
        workers,
        buffered,
        generated: counters.generated.load(Ordering::Relaxed),
        served_from_buffer: counters.served_from_buffer.load(Ordering::Relaxed),
        served_on_demand: counters.served_on_demand.load(Ordering::Relaxed),
        generation_failures: counters.generation_failures.load(Ordering::Relaxed),
        discarded: counters.discarded.load(Ordering::Relaxed),
    }
}

async fn run_worker(
    family: KeyFamily,
    tx: mpsc::Sender<PooledKey>,
    shutdown: CancellationToken,
    counters: Arc<PoolCounters>,
) -> Result<(), CommonError> {
    loop {
        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        match tokio::task::spawn_blocking(move || generate_key(family)).await {
            Ok(Ok(key)) => {
                counters.generated.fetch_add(1, Ordering::Relaxed);
                permit.send(key);
            }
            Ok(Err(e)) => {
                counters.generation_failures.fetch_add(1, Ordering::Relaxed);
                error!(family = %family, error = %e, "key generation failed");
                drop(permit);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(GENERATION_RETRY_BACKOFF) => {}
                }
            }
            Err(join_error) => {
                counters.generation_failures.fetch_add(1, Ordering::Relaxed);
                return Err(CommonError::from(join_error));
            }
        }
    }

    Ok(())
}
