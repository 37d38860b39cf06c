//! Dispatch primitives: advance, schedule and rollback.
//!
//! These are the only ways a step result becomes the next message. The
//! transports underneath are traits so the same primitives run over NATS
//! JetStream in the worker and over an in-process queue in tests.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::envelope::{Envelope, StepDescriptor};
use crate::error::DispatchError;
use crate::step::StepId;

/// Subject prefix for step messages.
pub const STEP_SUBJECT_PREFIX: &str = "cloudrig.steps";

/// Build the routing key for a step owned by `owner_id`.
///
/// Characters that are not valid inside a NATS subject token are replaced
/// with `_`.
pub fn routing_key(owner_id: &str, target: StepId) -> String {
    format!("{}.{}.{}", STEP_SUBJECT_PREFIX, subject_token(owner_id), target)
}

/// Make an arbitrary string usable as one subject token.
pub fn subject_token(raw: &str) -> String {
    let token: String = raw
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    if token.is_empty() {
        "_".to_string()
    } else {
        token
    }
}

/// Routing key for the head of the envelope's pending steps.
pub fn head_routing_key(envelope: &Envelope) -> Result<String, DispatchError> {
    let head = envelope.head().ok_or(DispatchError::NoTarget)?;
    Ok(routing_key(&envelope.settings.owner_id, head.target))
}

/// Publishes envelopes immediately.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, routing_key: &str, envelope: &Envelope) -> Result<(), DispatchError>;
}

/// Publishes envelopes no earlier than `delay` from now.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn schedule(
        &self,
        delay: Duration,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), DispatchError>;
}

/// Result of an advance or rollback dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// A message was published to this routing key.
    Published(String),
    /// `pendingSteps` was empty; the chain is finished and nothing was sent.
    Completed,
}

/// The three dispatch primitives.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Compensating chain installed when a forward step fails.
    fn compensating_chain(&self) -> Vec<StepDescriptor>;

    /// Publish to the head of `pendingSteps` now, or report completion when
    /// there is no head.
    async fn advance(&self, envelope: &Envelope) -> Result<Dispatched, DispatchError>;

    /// Publish to the head of `pendingSteps` after `delay`.
    async fn schedule(&self, delay: Duration, envelope: &Envelope) -> Result<(), DispatchError>;

    /// Publish a rollback-path envelope to the head of its compensating
    /// chain.
    async fn rollback(&self, envelope: &Envelope) -> Result<Dispatched, DispatchError>;
}

/// Dispatch primitives over a message bus and a scheduler.
#[derive(Clone)]
pub struct BusDispatcher {
    bus: Arc<dyn MessageBus>,
    scheduler: Arc<dyn Scheduler>,
    compensating: Vec<StepDescriptor>,
}

impl BusDispatcher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        scheduler: Arc<dyn Scheduler>,
        compensating: Vec<StepDescriptor>,
    ) -> Self {
        Self {
            bus,
            scheduler,
            compensating,
        }
    }
}

#[async_trait]
impl Dispatch for BusDispatcher {
    fn compensating_chain(&self) -> Vec<StepDescriptor> {
        self.compensating.clone()
    }

    async fn advance(&self, envelope: &Envelope) -> Result<Dispatched, DispatchError> {
        if envelope.head().is_none() {
            return Ok(Dispatched::Completed);
        }
        let key = head_routing_key(envelope)?;
        self.bus.publish(&key, envelope).await?;

        tracing::debug!(
            chain_id = %envelope.config.chain_id,
            routing_key = %key,
            remaining = envelope.pending_steps().len(),
            "Advanced chain"
        );
        Ok(Dispatched::Published(key))
    }

    async fn schedule(&self, delay: Duration, envelope: &Envelope) -> Result<(), DispatchError> {
        let key = head_routing_key(envelope)?;
        self.scheduler.schedule(delay, &key, envelope).await?;

        tracing::debug!(
            chain_id = %envelope.config.chain_id,
            routing_key = %key,
            delay_secs = delay.as_secs(),
            "Scheduled step"
        );
        Ok(())
    }

    async fn rollback(&self, envelope: &Envelope) -> Result<Dispatched, DispatchError> {
        if !envelope.is_rolling_back() {
            return Err(DispatchError::InvalidEnvelope(
                "rollback requires a rollback cause".to_string(),
            ));
        }
        if envelope.head().is_none() {
            return Ok(Dispatched::Completed);
        }
        let key = head_routing_key(envelope)?;
        self.bus.publish(&key, envelope).await?;

        tracing::info!(
            chain_id = %envelope.config.chain_id,
            routing_key = %key,
            "Rollback dispatched"
        );
        Ok(Dispatched::Published(key))
    }
}
