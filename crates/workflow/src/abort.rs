//! Per-chain abort markers.
//!
//! An operator abort sends the chain down its compensating path, but
//! forward messages already sitting in the bus or scheduler would still be
//! delivered. The runtime consults an [`AbortLedger`] before and after every
//! forward step so those messages stop the forward path instead of racing
//! the rollback.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::DispatchError;

/// Failure code of a forward step whose chain was aborted while it ran.
pub const ABORTED_CODE: &str = "aborted";

/// Records which chains an operator has aborted.
#[async_trait]
pub trait AbortLedger: Send + Sync {
    async fn mark_aborted(&self, chain_id: Uuid) -> Result<(), DispatchError>;

    async fn is_aborted(&self, chain_id: Uuid) -> Result<bool, DispatchError>;
}

/// In-process ledger.
#[derive(Debug, Default)]
pub struct MemoryAborts {
    chains: Mutex<HashSet<Uuid>>,
}

impl MemoryAborts {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AbortLedger for MemoryAborts {
    async fn mark_aborted(&self, chain_id: Uuid) -> Result<(), DispatchError> {
        self.chains
            .lock()
            .map_err(|_| DispatchError::Publish("abort ledger poisoned".to_string()))?
            .insert(chain_id);
        Ok(())
    }

    async fn is_aborted(&self, chain_id: Uuid) -> Result<bool, DispatchError> {
        Ok(self
            .chains
            .lock()
            .map_err(|_| DispatchError::Publish("abort ledger poisoned".to_string()))?
            .contains(&chain_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_marks_are_per_chain() {
        let ledger = MemoryAborts::new();
        let aborted = Uuid::new_v4();
        let other = Uuid::new_v4();

        ledger.mark_aborted(aborted).await.unwrap();

        assert!(ledger.is_aborted(aborted).await.unwrap());
        assert!(!ledger.is_aborted(other).await.unwrap());
    }
}
