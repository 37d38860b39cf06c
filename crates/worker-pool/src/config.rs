//! Worker configuration.

use anyhow::Result;
use cloudrig_workflow::PollPolicy;
use std::time::Duration;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identifier (UUID).
    pub worker_id: String,

    /// NATS server URL.
    pub nats_url: String,

    /// JetStream stream holding step messages.
    pub nats_stream: String,

    /// Durable consumer shared by all workers.
    pub nats_consumer: String,

    /// How long JetStream waits for an ack before redelivering. Messages
    /// still being handled are kept alive with in-progress acks.
    pub ack_wait: Duration,

    /// KV bucket holding operator abort markers.
    pub abort_bucket: String,

    /// Resource provider base URL.
    pub provider_url: String,

    /// Maximum concurrently handled messages.
    pub max_concurrent_tasks: usize,

    /// Re-arm interval of polling steps.
    pub poll_interval: Duration,

    /// Maximum time a polling step may wait.
    pub poll_timeout: Duration,

    /// Emit logs as JSON lines.
    pub json_logs: bool,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let worker_id = std::env::var("CLOUDRIG_WORKER_ID").unwrap_or(defaults.worker_id);

        let nats_url = std::env::var("NATS_URL").unwrap_or(defaults.nats_url);

        let nats_stream = std::env::var("CLOUDRIG_NATS_STREAM").unwrap_or(defaults.nats_stream);

        let nats_consumer =
            std::env::var("CLOUDRIG_NATS_CONSUMER").unwrap_or(defaults.nats_consumer);

        let ack_wait_secs: u64 = std::env::var("CLOUDRIG_NATS_ACK_WAIT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.ack_wait.as_secs());

        let abort_bucket = std::env::var("CLOUDRIG_ABORT_BUCKET").unwrap_or(defaults.abort_bucket);

        let provider_url = std::env::var("CLOUDRIG_PROVIDER_URL").unwrap_or(defaults.provider_url);

        let max_concurrent: usize = std::env::var("CLOUDRIG_WORKER_MAX_CONCURRENT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_concurrent_tasks);

        let poll_interval_secs: u64 = std::env::var("CLOUDRIG_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.poll_interval.as_secs());

        let poll_timeout_secs: u64 = std::env::var("CLOUDRIG_POLL_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.poll_timeout.as_secs());

        if ack_wait_secs == 0 {
            anyhow::bail!("CLOUDRIG_NATS_ACK_WAIT_SECS must be at least 1");
        }
        if max_concurrent == 0 {
            anyhow::bail!("CLOUDRIG_WORKER_MAX_CONCURRENT must be at least 1");
        }
        if poll_interval_secs == 0 || poll_timeout_secs < poll_interval_secs {
            anyhow::bail!(
                "Invalid poll policy: interval {}s, timeout {}s",
                poll_interval_secs,
                poll_timeout_secs
            );
        }

        let json_logs = std::env::var("CLOUDRIG_LOG_FORMAT")
            .map(|f| f.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(Self {
            worker_id,
            nats_url,
            nats_stream,
            nats_consumer,
            ack_wait: Duration::from_secs(ack_wait_secs),
            abort_bucket,
            provider_url,
            max_concurrent_tasks: max_concurrent,
            poll_interval: Duration::from_secs(poll_interval_secs),
            poll_timeout: Duration::from_secs(poll_timeout_secs),
            json_logs,
        })
    }

    /// How often a message still being handled is marked in progress.
    pub fn keepalive_interval(&self) -> Duration {
        (self.ack_wait / 2).max(Duration::from_secs(1))
    }

    /// Policy shared by the built-in polling steps.
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(self.poll_interval, self.poll_timeout)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            nats_url: "nats://localhost:4222".to_string(),
            nats_stream: "cloudrig_steps".to_string(),
            nats_consumer: "cloudrig-worker".to_string(),
            ack_wait: Duration::from_secs(300),
            abort_bucket: "cloudrig_aborts".to_string(),
            provider_url: "http://localhost:8090".to_string(),
            max_concurrent_tasks: 4,
            poll_interval: Duration::from_secs(60),
            poll_timeout: Duration::from_secs(1800),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.nats_stream, "cloudrig_steps");
        assert_eq!(config.max_concurrent_tasks, 4);
        assert!(!config.worker_id.is_empty());
    }

    #[test]
    fn test_keepalive_interval() {
        let mut config = WorkerConfig::default();
        assert_eq!(config.keepalive_interval(), Duration::from_secs(150));

        config.ack_wait = Duration::from_secs(1);
        assert_eq!(config.keepalive_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_poll_policy() {
        let policy = WorkerConfig::default().poll_policy();
        assert_eq!(policy.interval, Duration::from_secs(60));
        assert_eq!(policy.timeout, Duration::from_secs(1800));
    }
}
