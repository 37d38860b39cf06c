//! In-process transport.
//!
//! Implements [`MessageBus`] and [`Scheduler`] over a tokio channel so whole
//! chains can run without a broker. Scheduled deliveries use
//! `tokio::time::sleep`, which makes them deterministic under a paused test
//! clock.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::dispatch::{BusDispatcher, MessageBus, Scheduler};
use crate::envelope::{Envelope, StepDescriptor};
use crate::error::{DispatchError, WorkflowResult};
use crate::progress::ProgressSink;
use crate::runtime::{Disposition, StepRuntime};

/// One message travelling through the local transport.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub routing_key: String,
    pub envelope: Envelope,
}

/// Record of what was handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Published { routing_key: String },
    Scheduled { routing_key: String, delay: Duration },
}

pub struct LocalTransport {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    in_flight: Arc<AtomicUsize>,
    events: Mutex<Vec<LocalEvent>>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            in_flight: Arc::new(AtomicUsize::new(0)),
            events: Mutex::new(Vec::new()),
        })
    }

    /// Dispatcher publishing through this transport.
    pub fn dispatcher(self: &Arc<Self>, compensating: Vec<StepDescriptor>) -> BusDispatcher {
        BusDispatcher::new(self.clone(), self.clone(), compensating)
    }

    /// Everything published or scheduled so far.
    pub fn events(&self) -> Vec<LocalEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Messages sent but not yet handled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Deliver an envelope again, as an at-least-once bus may.
    pub fn redeliver(&self, delivery: Delivery) -> Result<(), DispatchError> {
        self.send(delivery)
    }

    fn send(&self, delivery: Delivery) -> Result<(), DispatchError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.tx.send(delivery).map_err(|e| {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            DispatchError::Publish(e.to_string())
        })
    }

    fn record(&self, event: LocalEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    /// Wait for the next delivery.
    pub async fn next(&self) -> Option<Delivery> {
        let delivery = self.rx.lock().await.recv().await?;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Some(delivery)
    }

    /// Handle deliveries until nothing is left in flight.
    pub async fn run_until_idle(
        &self,
        runtime: &StepRuntime,
        progress: &dyn ProgressSink,
    ) -> WorkflowResult<Vec<(Delivery, Disposition)>> {
        let mut handled = Vec::new();
        while self.in_flight() > 0 {
            let Some(delivery) = self.next().await else {
                break;
            };
            let disposition = runtime.handle(delivery.envelope.clone(), progress).await?;
            handled.push((delivery, disposition));
        }
        Ok(handled)
    }
}

#[async_trait]
impl MessageBus for LocalTransport {
    async fn publish(&self, routing_key: &str, envelope: &Envelope) -> Result<(), DispatchError> {
        self.record(LocalEvent::Published {
            routing_key: routing_key.to_string(),
        });
        self.send(Delivery {
            routing_key: routing_key.to_string(),
            envelope: envelope.clone(),
        })
    }
}

#[async_trait]
impl Scheduler for LocalTransport {
    async fn schedule(
        &self,
        delay: Duration,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), DispatchError> {
        self.record(LocalEvent::Scheduled {
            routing_key: routing_key.to_string(),
            delay,
        });

        let delivery = Delivery {
            routing_key: routing_key.to_string(),
            envelope: envelope.clone(),
        };
        let tx = self.tx.clone();
        let in_flight = self.in_flight.clone();
        in_flight.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(delivery).is_err() {
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        });
        Ok(())
    }
}
