//! NATS bus and scheduler for step messages.
//!
//! Every step message is published to its routing key inside a single
//! JetStream stream. Delayed messages carry a `Cloudrig-Not-Before` header;
//! the subscriber holds them back until that instant, so the schedule
//! lives in the stream and survives worker restarts.

use async_nats::jetstream::{self, Context};
use async_nats::HeaderMap;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use cloudrig_workflow::dispatch::{subject_token, STEP_SUBJECT_PREFIX};
use cloudrig_workflow::{DispatchError, Envelope, MessageBus, Scheduler};
use std::time::Duration;
use thiserror::Error;

/// Subjects captured by the step stream.
pub const STEP_SUBJECTS: &str = "cloudrig.steps.>";

/// Default JetStream stream name.
pub const DEFAULT_STREAM: &str = "cloudrig_steps";

/// Header carrying the earliest delivery time of a scheduled message.
pub const NOT_BEFORE_HEADER: &str = "Cloudrig-Not-Before";

/// Errors that can occur during NATS operations.
#[derive(Debug, Error)]
pub enum NatsError {
    #[error("NATS connection error: {0}")]
    Connection(String),

    #[error("JetStream error: {0}")]
    JetStream(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Acknowledge error: {0}")]
    Ack(String),
}

impl From<NatsError> for DispatchError {
    fn from(e: NatsError) -> Self {
        DispatchError::Publish(e.to_string())
    }
}

/// Subject progress lines of a chain are published to.
pub fn progress_subject(owner_id: &str, chain_id: &str) -> String {
    format!(
        "cloudrig.progress.{}.{}",
        subject_token(owner_id),
        subject_token(chain_id)
    )
}

/// JetStream-backed [`MessageBus`] and [`Scheduler`].
#[derive(Clone)]
pub struct NatsBus {
    /// Core client, used for fire-and-forget progress.
    client: async_nats::Client,

    /// JetStream context.
    js: Context,
}

impl NatsBus {
    /// Create a bus on an existing client, creating the stream if needed.
    pub async fn new(client: async_nats::Client, stream_name: Option<&str>) -> Result<Self, NatsError> {
        let stream = stream_name.unwrap_or(DEFAULT_STREAM);
        let js = jetstream::new(client.clone());

        Self::ensure_stream(&js, stream).await?;

        Ok(Self { client, js })
    }

    /// Ensure the JetStream stream exists.
    async fn ensure_stream(js: &Context, stream: &str) -> Result<(), NatsError> {
        match js.get_stream(stream).await {
            Ok(_) => {
                tracing::debug!(stream = %stream, "Using existing NATS stream");
                Ok(())
            }
            Err(_) => {
                let config = jetstream::stream::Config {
                    name: stream.to_string(),
                    subjects: vec![STEP_SUBJECTS.to_string()],
                    max_age: Duration::from_secs(7 * 24 * 3600),
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                };

                js.create_stream(config)
                    .await
                    .map_err(|e| NatsError::JetStream(e.to_string()))?;

                tracing::info!(stream = %stream, subjects = STEP_SUBJECTS, "Created NATS stream");
                Ok(())
            }
        }
    }

    pub fn context(&self) -> &Context {
        &self.js
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    async fn publish_step(
        &self,
        routing_key: &str,
        envelope: &Envelope,
        headers: Option<HeaderMap>,
    ) -> Result<(), NatsError> {
        if !routing_key.starts_with(STEP_SUBJECT_PREFIX) {
            return Err(NatsError::Publish(format!(
                "routing key {routing_key} is outside {STEP_SUBJECTS}"
            )));
        }
        let payload = envelope
            .to_vec()
            .map_err(|e| NatsError::Publish(format!("Serialization error: {}", e)))?;

        let ack = match headers {
            Some(headers) => {
                self.js
                    .publish_with_headers(routing_key.to_string(), headers, payload.into())
                    .await
            }
            None => self.js.publish(routing_key.to_string(), payload.into()).await,
        };
        ack.map_err(|e| NatsError::Publish(e.to_string()))?
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?;
        Ok(())
    }

    /// Publish a progress line on core NATS. Failures are only logged.
    pub async fn publish_progress(&self, subject: String, message: String) {
        if let Err(e) = self.client.publish(subject.clone(), message.into()).await {
            tracing::warn!(subject = %subject, error = %e, "Failed to publish progress");
        }
    }
}

/// Header map delaying delivery by `delay`.
pub(crate) fn not_before(delay: Duration) -> Result<HeaderMap, NatsError> {
    let delay = chrono::Duration::from_std(delay)
        .map_err(|e| NatsError::Publish(format!("delay out of range: {e}")))?;
    let at = (Utc::now() + delay).to_rfc3339_opts(SecondsFormat::Millis, true);

    let mut headers = HeaderMap::new();
    headers.insert(NOT_BEFORE_HEADER, at.as_str());
    Ok(headers)
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, routing_key: &str, envelope: &Envelope) -> Result<(), DispatchError> {
        self.publish_step(routing_key, envelope, None).await?;

        tracing::debug!(
            chain_id = %envelope.config.chain_id,
            routing_key = %routing_key,
            "Published step message"
        );
        Ok(())
    }
}

#[async_trait]
impl Scheduler for NatsBus {
    async fn schedule(
        &self,
        delay: Duration,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), DispatchError> {
        let headers = not_before(delay).map_err(|e| DispatchError::Schedule(e.to_string()))?;
        self.publish_step(routing_key, envelope, Some(headers))
            .await
            .map_err(|e| DispatchError::Schedule(e.to_string()))?;

        tracing::debug!(
            chain_id = %envelope.config.chain_id,
            routing_key = %routing_key,
            delay_secs = delay.as_secs(),
            "Scheduled step message"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    #[test]
    fn test_progress_subject() {
        assert_eq!(
            progress_subject("owner.1", "6f0c"),
            "cloudrig.progress.owner_1.6f0c"
        );
    }

    #[test]
    fn test_not_before_header() {
        let before = Utc::now();
        let headers = not_before(Duration::from_secs(60)).unwrap();
        let raw = headers.get(NOT_BEFORE_HEADER).unwrap().as_str();
        let at = DateTime::parse_from_rfc3339(raw).unwrap();

        assert!(at >= before + chrono::Duration::seconds(60));
        assert!(at <= Utc::now() + chrono::Duration::seconds(61));
    }

    #[test]
    fn test_default_constants() {
        assert_eq!(DEFAULT_STREAM, "cloudrig_steps");
        assert!(STEP_SUBJECTS.starts_with(STEP_SUBJECT_PREFIX));
    }
}
