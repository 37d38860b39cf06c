//! Abort markers in a JetStream key-value bucket.
//!
//! Shared by every worker and the operator CLI, so an abort issued from
//! anywhere stops forward messages on all workers.

use async_nats::jetstream::{self, kv, Context};
use async_trait::async_trait;
use cloudrig_workflow::{AbortLedger, DispatchError};
use std::time::Duration;
use uuid::Uuid;

use super::publisher::NatsError;

/// Default bucket name.
pub const DEFAULT_ABORT_BUCKET: &str = "cloudrig_aborts";

/// Markers outlive any chain's scheduled messages.
const MARKER_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

const MARKER_VALUE: &str = "aborted";

fn bucket_config(bucket: &str) -> kv::Config {
    kv::Config {
        bucket: bucket.to_string(),
        description: "cloudRIG chains aborted by an operator".to_string(),
        history: 1,
        max_age: MARKER_MAX_AGE,
        storage: jetstream::stream::StorageType::File,
        ..Default::default()
    }
}

/// [`AbortLedger`] over a NATS KV bucket keyed by chain id.
#[derive(Clone)]
pub struct NatsAborts {
    store: kv::Store,
}

impl NatsAborts {
    /// Open the bucket, creating it if needed.
    pub async fn new(js: &Context, bucket: Option<&str>) -> Result<Self, NatsError> {
        let bucket = bucket.unwrap_or(DEFAULT_ABORT_BUCKET);
        let store = match js.get_key_value(bucket).await {
            Ok(store) => {
                tracing::debug!(bucket = %bucket, "Using existing abort bucket");
                store
            }
            Err(_) => {
                let store = js
                    .create_key_value(bucket_config(bucket))
                    .await
                    .map_err(|e| NatsError::JetStream(e.to_string()))?;
                tracing::info!(bucket = %bucket, "Created abort bucket");
                store
            }
        };
        Ok(Self { store })
    }
}

#[async_trait]
impl AbortLedger for NatsAborts {
    async fn mark_aborted(&self, chain_id: Uuid) -> Result<(), DispatchError> {
        self.store
            .put(chain_id.to_string(), MARKER_VALUE.into())
            .await
            .map_err(|e| DispatchError::Publish(format!("abort marker: {e}")))?;
        tracing::info!(chain_id = %chain_id, "Chain marked aborted");
        Ok(())
    }

    async fn is_aborted(&self, chain_id: Uuid) -> Result<bool, DispatchError> {
        let entry = self
            .store
            .get(chain_id.to_string())
            .await
            .map_err(|e| DispatchError::Publish(format!("abort marker: {e}")))?;
        Ok(entry.is_some())
    }
}
