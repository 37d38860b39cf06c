//! NATS JetStream subscriber for step messages.

use async_nats::jetstream::{self, consumer::pull::Config as ConsumerConfig, AckKind, Context};
use async_nats::HeaderMap;
use chrono::{DateTime, Utc};
use cloudrig_workflow::Envelope;
use futures::StreamExt;
use std::time::Duration;

use super::publisher::{NatsError, NOT_BEFORE_HEADER, STEP_SUBJECTS};

type PullConsumer = jetstream::consumer::Consumer<ConsumerConfig>;

/// What a delivered message turned out to be.
#[derive(Debug)]
pub enum Decoded {
    /// Due now.
    Ready(Envelope),
    /// Scheduled for later; hold it back for the remaining time.
    Early(Duration),
    /// Not an envelope. Redelivering would not help.
    Malformed(String),
}

/// Classify a message payload against the current time.
pub fn decode(payload: &[u8], headers: Option<&HeaderMap>, now: DateTime<Utc>) -> Decoded {
    if let Some(raw) = headers.and_then(|h| h.get(NOT_BEFORE_HEADER)) {
        match DateTime::parse_from_rfc3339(raw.as_str()) {
            Ok(at) => {
                let remaining = at.with_timezone(&Utc) - now;
                if let Ok(remaining) = remaining.to_std() {
                    if !remaining.is_zero() {
                        return Decoded::Early(remaining);
                    }
                }
            }
            Err(e) => {
                return Decoded::Malformed(format!("bad {NOT_BEFORE_HEADER} header: {e}"));
            }
        }
    }

    match Envelope::from_slice(payload) {
        Ok(envelope) => Decoded::Ready(envelope),
        Err(e) => Decoded::Malformed(e.to_string()),
    }
}

/// NATS JetStream subscriber for step messages.
pub struct NatsSubscriber {
    /// Durable pull consumer.
    consumer: PullConsumer,

    /// Consumer name.
    name: String,
}

impl NatsSubscriber {
    /// Create or bind the durable consumer on `stream`.
    ///
    /// `ack_wait` only applies when the consumer is created; an existing
    /// consumer keeps its own.
    pub async fn new(
        js: &Context,
        stream: &str,
        consumer: &str,
        ack_wait: Duration,
    ) -> Result<Self, NatsError> {
        let stream = js
            .get_stream(stream)
            .await
            .map_err(|e| NatsError::JetStream(e.to_string()))?;

        let consumer_config = ConsumerConfig {
            durable_name: Some(consumer.to_string()),
            filter_subject: STEP_SUBJECTS.to_string(),
            ack_wait,
            ..Default::default()
        };

        let pull = match stream.get_consumer(consumer).await {
            Ok(existing) => existing,
            Err(_) => {
                let created = stream
                    .create_consumer(consumer_config)
                    .await
                    .map_err(|e| NatsError::JetStream(e.to_string()))?;
                tracing::info!(consumer = %consumer, "Created NATS consumer");
                created
            }
        };

        Ok(Self {
            consumer: pull,
            name: consumer.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive the next step message.
    ///
    /// Returns `None` when nothing arrived within the fetch window.
    pub async fn receive(&self) -> Result<Option<(Decoded, jetstream::Message)>, NatsError> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(1)
            .messages()
            .await
            .map_err(|e| NatsError::JetStream(e.to_string()))?;

        if let Some(msg) = messages.next().await {
            let msg = msg.map_err(|e| NatsError::JetStream(format!("Failed to receive message: {}", e)))?;
            let decoded = decode(&msg.payload, msg.headers.as_ref(), Utc::now());
            return Ok(Some((decoded, msg)));
        }

        Ok(None)
    }
}

/// Acknowledge a message.
pub async fn ack(msg: &jetstream::Message) -> Result<(), NatsError> {
    msg.ack()
        .await
        .map_err(|e| NatsError::Ack(format!("Failed to ack message: {}", e)))
}

/// Negatively acknowledge a message, optionally delaying redelivery.
pub async fn nack(msg: &jetstream::Message, delay: Option<Duration>) -> Result<(), NatsError> {
    msg.ack_with(AckKind::Nak(delay))
        .await
        .map_err(|e| NatsError::Ack(format!("Failed to nack message: {}", e)))
}

/// Tell the server the message is still being worked on, resetting its
/// ack wait.
pub async fn in_progress(msg: &jetstream::Message) -> Result<(), NatsError> {
    msg.ack_with(AckKind::Progress)
        .await
        .map_err(|e| NatsError::Ack(format!("Failed to mark message in progress: {}", e)))
}

/// Terminate a message so it is never redelivered.
pub async fn term(msg: &jetstream::Message) -> Result<(), NatsError> {
    msg.ack_with(AckKind::Term)
        .await
        .map_err(|e| NatsError::Ack(format!("Failed to term message: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cloudrig_workflow::{DeploymentConfig, Settings, StepDescriptor, StepId};

    fn payload() -> Vec<u8> {
        Envelope::new(
            DeploymentConfig::new("eu-west-2", "123456789012"),
            Settings::new("owner-1"),
            vec![StepDescriptor::new(StepId::WaitAgent)],
        )
        .to_vec()
        .unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn headers(at: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(NOT_BEFORE_HEADER, at);
        headers
    }

    #[test]
    fn test_decode_without_header_is_ready() {
        assert!(matches!(decode(&payload(), None, now()), Decoded::Ready(_)));
    }

    #[test]
    fn test_decode_early_message() {
        let h = headers("2026-03-01T12:00:45Z");
        match decode(&payload(), Some(&h), now()) {
            Decoded::Early(remaining) => assert_eq!(remaining, Duration::from_secs(45)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_due_message() {
        let h = headers("2026-03-01T11:59:00Z");
        assert!(matches!(decode(&payload(), Some(&h), now()), Decoded::Ready(_)));

        let h = headers("2026-03-01T12:00:00Z");
        assert!(matches!(decode(&payload(), Some(&h), now()), Decoded::Ready(_)));
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(decode(b"not json", None, now()), Decoded::Malformed(_)));

        let h = headers("soon");
        assert!(matches!(decode(&payload(), Some(&h), now()), Decoded::Malformed(_)));
    }
}
