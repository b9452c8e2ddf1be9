// Key management logic: unsealing, the barrier key hierarchy, key generation,
// elastic/material key lifecycle and the JOSE crypto operations built on top.

pub mod algorithm;
pub mod barrier;
pub mod cipher;
pub mod config;
pub mod elastic_key;
pub mod jose;
pub mod jwk;
pub mod keygen;
pub mod material_key;
pub mod pool;
pub mod shamir;
pub mod unseal;

pub use algorithm::*;
pub use barrier::*;
pub use config::*;
pub use elastic_key::*;
pub use jose::*;
pub use jwk::*;
pub use keygen::*;
pub use material_key::*;
pub use pool::*;
pub use unseal::*;

use tracing::debug;

// Lifecycle and security events. Payloads carry identifiers only, never key material.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KmsEvent {
    UnsealSucceeded {
        mode: UnsealMode,
    },
    UnsealFailed {
        mode: UnsealMode,
        reason: String,
    },
    BarrierUnsealed {
        root_version: u32,
        intermediate_version: u32,
        content_version: u32,
    },
    BarrierResealed,
    BarrierKeyRotated {
        tier: BarrierTier,
        version: u32,
    },
    RootKeyRewrapped,
    PoolExhausted {
        family: KeyFamily,
    },
    ElasticKeyCreated {
        elastic_key_id: String,
        algorithm: String,
    },
    MaterialKeyRotated {
        elastic_key_id: String,
        previous_version: u32,
        new_version: u32,
    },
    ElasticKeyStatusChanged {
        elastic_key_id: String,
        status: ElasticKeyStatus,
    },
    ElasticKeyUpdated {
        elastic_key_id: String,
    },
    MaterialKeyImported {
        elastic_key_id: String,
        version: u32,
    },
    MaterialKeyRevoked {
        elastic_key_id: String,
        version: u32,
    },
    MaterialKeyDeleted {
        elastic_key_id: String,
        version: u32,
    },
    DataKeyGenerated {
        elastic_key_id: String,
        family: KeyFamily,
    },
    DecryptFailed {
        elastic_key_id: Option<String>,
        version: Option<u32>,
        reason: String,
    },
}

impl KmsEvent {
    pub fn name(&self) -> &'static str {
        match self {
            KmsEvent::UnsealSucceeded { .. } => "unseal_succeeded",
            KmsEvent::UnsealFailed { .. } => "unseal_failed",
            KmsEvent::BarrierUnsealed { .. } => "barrier_unsealed",
            KmsEvent::BarrierResealed => "barrier_resealed",
            KmsEvent::BarrierKeyRotated { .. } => "barrier_key_rotated",
            KmsEvent::RootKeyRewrapped => "root_key_rewrapped",
            KmsEvent::PoolExhausted { .. } => "pool_exhausted",
            KmsEvent::ElasticKeyCreated { .. } => "elastic_key_created",
            KmsEvent::MaterialKeyRotated { .. } => "material_key_rotated",
            KmsEvent::ElasticKeyStatusChanged { .. } => "elastic_key_status_changed",
            KmsEvent::ElasticKeyUpdated { .. } => "elastic_key_updated",
            KmsEvent::MaterialKeyImported { .. } => "material_key_imported",
            KmsEvent::MaterialKeyRevoked { .. } => "material_key_revoked",
            KmsEvent::MaterialKeyDeleted { .. } => "material_key_deleted",
            KmsEvent::DataKeyGenerated { .. } => "data_key_generated",
            KmsEvent::DecryptFailed { .. } => "decrypt_failed",
        }
    }
}

pub type KmsEventSender = tokio::sync::broadcast::Sender<KmsEvent>;
pub type KmsEventReceiver = tokio::sync::broadcast::Receiver<KmsEvent>;

pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub fn event_channel() -> (KmsEventSender, KmsEventReceiver) {
    tokio::sync::broadcast::channel(EVENT_CHANNEL_CAPACITY)
}

/// Publishes an event to current subscribers. Having no subscribers is not an error.
pub fn publish_event(tx: &KmsEventSender, event: KmsEvent) {
    debug!(event = event.name(), "kms event");
    if tx.receiver_count() > 0 {
        let _ = tx.send(event);
    }
}
