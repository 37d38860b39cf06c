//! Progress and alert sinks publishing to NATS.

use async_trait::async_trait;
use cloudrig_workflow::dispatch::subject_token;
use cloudrig_workflow::{AbandonedChain, AlertSink, Envelope, ProgressSink, TracingAlerts, TracingProgress};

use crate::nats::{progress_subject, NatsBus};

/// Logs progress and publishes it to the chain's progress subject.
pub struct NatsProgress {
    bus: NatsBus,
    subject: String,
    log: TracingProgress,
}

impl NatsProgress {
    /// Build the sink for the chain an envelope belongs to.
    pub fn for_chain(bus: NatsBus, envelope: &Envelope) -> Self {
        Self {
            bus,
            subject: progress_subject(
                &envelope.settings.owner_id,
                &envelope.config.chain_id.to_string(),
            ),
            log: TracingProgress::for_chain(envelope),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl ProgressSink for NatsProgress {
    fn report(&self, message: &str) {
        self.log.report(message);

        let bus = self.bus.clone();
        let subject = self.subject.clone();
        let message = message.to_string();
        tokio::spawn(async move {
            bus.publish_progress(subject, message).await;
        });
    }
}

/// Subject abandoned chains of an owner are reported to.
pub fn alert_subject(owner_id: &str) -> String {
    format!("cloudrig.alerts.{}", subject_token(owner_id))
}

/// Logs abandoned chains and publishes the report as JSON.
pub struct NatsAlerts {
    bus: NatsBus,
}

impl NatsAlerts {
    pub fn new(bus: NatsBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl AlertSink for NatsAlerts {
    async fn abandoned(&self, report: &AbandonedChain) {
        TracingAlerts.abandoned(report).await;

        match serde_json::to_string(report) {
            Ok(body) => {
                self.bus
                    .publish_progress(alert_subject(&report.owner_id), body)
                    .await
            }
            Err(e) => tracing::error!(error = %e, "Failed to serialize abandoned chain report"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_subject() {
        assert_eq!(alert_subject("alice@example.com"), "cloudrig.alerts.alice@example_com");
    }
}
