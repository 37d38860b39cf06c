//! Shared fakes for unit tests.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

use crate::dispatch::{Dispatch, Dispatched, MessageBus, Scheduler};
use crate::envelope::{DeploymentConfig, Envelope, Settings, StepDescriptor};
use crate::error::DispatchError;
use crate::progress::ProgressSink;
use crate::step::StepId;

pub fn sample_envelope(steps: Vec<StepDescriptor>) -> Envelope {
    Envelope::new(
        DeploymentConfig::new("eu-west-2", "123456789012"),
        Settings::new("owner-1"),
        steps,
    )
}

#[derive(Debug, Clone)]
pub enum Sent {
    Published {
        routing_key: String,
        envelope: Envelope,
    },
    Scheduled {
        delay: Duration,
        routing_key: String,
        envelope: Envelope,
    },
}

/// Bus and scheduler that only records.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageBus for RecordingTransport {
    async fn publish(&self, routing_key: &str, envelope: &Envelope) -> Result<(), DispatchError> {
        self.sent.lock().unwrap().push(Sent::Published {
            routing_key: routing_key.to_string(),
            envelope: envelope.clone(),
        });
        Ok(())
    }
}

#[async_trait]
impl Scheduler for RecordingTransport {
    async fn schedule(
        &self,
        delay: Duration,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), DispatchError> {
        self.sent.lock().unwrap().push(Sent::Scheduled {
            delay,
            routing_key: routing_key.to_string(),
            envelope: envelope.clone(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum Call {
    Advance(Envelope),
    Schedule(Duration, Envelope),
    Rollback(Envelope),
}

/// Records every primitive invocation.
#[derive(Default)]
pub struct RecordingDispatch {
    calls: Mutex<Vec<Call>>,
}

impl RecordingDispatch {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dispatch for RecordingDispatch {
    fn compensating_chain(&self) -> Vec<StepDescriptor> {
        vec![StepDescriptor::new(StepId::Teardown)]
    }

    async fn advance(&self, envelope: &Envelope) -> Result<Dispatched, DispatchError> {
        self.calls.lock().unwrap().push(Call::Advance(envelope.clone()));
        Ok(match envelope.head() {
            Some(head) => Dispatched::Published(head.target.to_string()),
            None => Dispatched::Completed,
        })
    }

    async fn schedule(&self, delay: Duration, envelope: &Envelope) -> Result<(), DispatchError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Schedule(delay, envelope.clone()));
        Ok(())
    }

    async fn rollback(&self, envelope: &Envelope) -> Result<Dispatched, DispatchError> {
        self.calls.lock().unwrap().push(Call::Rollback(envelope.clone()));
        Ok(match envelope.head() {
            Some(head) => Dispatched::Published(head.target.to_string()),
            None => Dispatched::Completed,
        })
    }
}

/// Collects progress lines.
#[derive(Default)]
pub struct RecordingProgress {
    lines: Mutex<Vec<String>>,
}

impl RecordingProgress {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn report(&self, message: &str) {
        self.lines.lock().unwrap().push(message.to_string());
    }
}
