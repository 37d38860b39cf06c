//! Worker lifecycle management.

use anyhow::{Context as _, Result};
use async_nats::jetstream::Message;
use cloudrig_steps::{compensating_chain, create_default_registry, HttpResourceControl};
use cloudrig_workflow::{BusDispatcher, Disposition, Envelope, StepRuntime};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::WorkerConfig;
use crate::nats::{self, Decoded, NatsAborts, NatsBus, NatsSubscriber};
use crate::progress::{NatsAlerts, NatsProgress};

/// Worker that runs the steps addressed by incoming messages.
pub struct Worker {
    /// Worker configuration.
    config: WorkerConfig,

    /// NATS subscriber for step messages.
    subscriber: NatsSubscriber,

    /// Bus used for dispatch and progress.
    bus: NatsBus,

    /// Step runtime wrapper.
    runtime: StepRuntime,

    /// Semaphore for concurrency control.
    semaphore: Arc<Semaphore>,
}

impl Worker {
    /// Create a new worker.
    pub async fn new(config: WorkerConfig) -> Result<Self> {
        let client = async_nats::connect(&config.nats_url)
            .await
            .with_context(|| format!("connecting to NATS at {}", config.nats_url))?;

        let bus = NatsBus::new(client, Some(config.nats_stream.as_str())).await?;
        let subscriber = NatsSubscriber::new(
            bus.context(),
            &config.nats_stream,
            &config.nats_consumer,
            config.ack_wait,
        )
        .await?;
        let aborts = NatsAborts::new(bus.context(), Some(config.abort_bucket.as_str())).await?;

        let provider = Arc::new(HttpResourceControl::new(&config.provider_url));
        let registry = create_default_registry(provider.clone(), provider, config.poll_policy());

        let dispatcher = BusDispatcher::new(
            Arc::new(bus.clone()),
            Arc::new(bus.clone()),
            compensating_chain(),
        );
        let runtime = StepRuntime::new(Arc::new(registry), Arc::new(dispatcher))
            .with_alerts(Arc::new(NatsAlerts::new(bus.clone())))
            .with_aborts(Arc::new(aborts));

        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_tasks));

        Ok(Self {
            config,
            subscriber,
            bus,
            runtime,
            semaphore,
        })
    }

    /// Run the worker until an unrecoverable transport error.
    pub async fn run(&self) -> Result<()> {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        tracing::info!(
            worker_id = %self.config.worker_id,
            hostname = %hostname,
            consumer = %self.subscriber.name(),
            steps = ?self.runtime.registry().list(),
            "Worker started"
        );

        self.process_messages().await
    }

    /// Process step messages from NATS.
    async fn process_messages(&self) -> Result<()> {
        loop {
            // Wait for available slot
            let permit = self.semaphore.clone().acquire_owned().await?;

            let Some((decoded, msg)) = self.subscriber.receive().await? else {
                drop(permit);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            };

            match decoded {
                Decoded::Ready(envelope) => {
                    tracing::debug!(
                        chain_id = %envelope.config.chain_id,
                        subject = %msg.subject,
                        "Received step message"
                    );

                    let runtime = self.runtime.clone();
                    let bus = self.bus.clone();
                    let keepalive = self.config.keepalive_interval();
                    tokio::spawn(async move {
                        // Keep permit until done
                        let _permit = permit;
                        handle_message(&runtime, bus, envelope, &msg, keepalive).await;
                    });
                }
                Decoded::Early(remaining) => {
                    tracing::trace!(
                        subject = %msg.subject,
                        delay_secs = remaining.as_secs(),
                        "Holding back scheduled message"
                    );
                    nats::nack(&msg, Some(remaining)).await?;
                    drop(permit);
                }
                Decoded::Malformed(error) => {
                    tracing::warn!(
                        subject = %msg.subject,
                        error = %error,
                        "Dropping malformed step message"
                    );
                    nats::term(&msg).await?;
                    drop(permit);
                }
            }
        }
    }
}

/// Run one envelope and settle its message.
///
/// The message is acknowledged once the resulting dispatch has been
/// handed to NATS. A failed dispatch leaves the chain where it was, so the
/// message is redelivered instead. While the step runs the message is
/// marked in progress every `keepalive` so a long step is not redelivered
/// to another worker.
async fn handle_message(
    runtime: &StepRuntime,
    bus: NatsBus,
    envelope: Envelope,
    msg: &Message,
    keepalive: Duration,
) {
    let chain_id = envelope.config.chain_id;
    let progress = NatsProgress::for_chain(bus, &envelope);

    let handled = runtime.handle(envelope, &progress);
    tokio::pin!(handled);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive);

    let result = loop {
        tokio::select! {
            result = &mut handled => break result,
            _ = ticker.tick() => {
                if let Err(e) = nats::in_progress(msg).await {
                    tracing::warn!(chain_id = %chain_id, error = %e, "Failed to extend ack wait");
                }
            }
        }
    };

    match result {
        Ok(disposition) => {
            log_disposition(&chain_id.to_string(), &disposition);
            if let Err(e) = nats::ack(msg).await {
                tracing::error!(chain_id = %chain_id, error = %e, "Failed to ack step message");
            }
        }
        Err(e) => {
            tracing::error!(
                chain_id = %chain_id,
                error = %e,
                "Dispatch failed, message will be redelivered"
            );
            if let Err(e) = nats::nack(msg, None).await {
                tracing::error!(chain_id = %chain_id, error = %e, "Failed to nack step message");
            }
        }
    }
}

fn log_disposition(chain_id: &str, disposition: &Disposition) {
    match disposition {
        Disposition::Advanced { step, next } => {
            tracing::debug!(chain_id, step = %step, next = %next, "Step advanced")
        }
        Disposition::Scheduled { step, delay } => {
            tracing::debug!(chain_id, step = %step, delay_secs = delay.as_secs(), "Step re-armed")
        }
        Disposition::Completed { step, rolled_back } => {
            tracing::info!(chain_id, step = %step, rolled_back, "Chain completed")
        }
        Disposition::RollbackStarted { step, next } => {
            tracing::warn!(chain_id, step = %step, next = %next, "Rollback started")
        }
        Disposition::CompensationRetried { step, attempt } => {
            tracing::warn!(chain_id, step = %step, attempt, "Compensating step retried")
        }
        Disposition::Abandoned(report) => {
            tracing::error!(chain_id, failed_step = ?report.failed_step, "Chain abandoned")
        }
        Disposition::Ignored { reason } => {
            tracing::debug!(chain_id, reason = %reason, "Message ignored")
        }
    }
}
