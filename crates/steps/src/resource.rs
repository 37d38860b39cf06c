//! Collaborator interfaces consumed by the steps.
//!
//! The provider owns the actual compute resource. Steps only talk to it
//! through these traits so they can be exercised against in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ProviderError;

/// What to ask the provider for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    pub region: String,
    pub account_scope: String,
    pub instance_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Lifecycle state reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    Terminated,
    #[serde(other)]
    Unknown,
}

/// Result of `describeStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusFacts {
    pub state: ResourceState,
    #[serde(default)]
    pub reachable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
}

/// Registration reported by the management agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentFacts {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_status: Option<String>,
}

/// Output of a remote command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl CommandOutput {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Resource-control operations.
#[async_trait]
pub trait ResourceControl: Send + Sync {
    /// Create a resource. Repeated calls with the same idempotency key must
    /// return the same resource instead of creating another.
    async fn request_resource(
        &self,
        spec: &ResourceSpec,
        idempotency_key: &str,
    ) -> Result<String, ProviderError>;

    /// Resource created under `idempotency_key`, if any. Lets a
    /// compensating step find a resource whose create response was lost.
    async fn find_resource(&self, idempotency_key: &str) -> Result<Option<String>, ProviderError>;

    async fn describe_status(&self, resource_id: &str) -> Result<StatusFacts, ProviderError>;

    /// `None` while the management agent has not registered.
    async fn describe_agent(&self, resource_id: &str) -> Result<Option<AgentFacts>, ProviderError>;

    /// Terminate a resource. Terminating one that is already gone succeeds.
    async fn terminate_resource(&self, resource_id: &str) -> Result<(), ProviderError>;
}

/// Commands executed on the resource through its management agent.
#[async_trait]
pub trait RemoteCommand: Send + Sync {
    async fn run_command(
        &self,
        resource_id: &str,
        command: &str,
        idempotency_key: &str,
    ) -> Result<CommandOutput, ProviderError>;
}

/// The `instance` state entry written by `requestResource`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub resource_id: String,
    #[serde(default)]
    pub instance_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_facts_tolerates_unknown_state() {
        let facts: StatusFacts =
            serde_json::from_str(r#"{"state": "rebooting", "reachable": false}"#).unwrap();
        assert_eq!(facts.state, ResourceState::Unknown);

        let facts: StatusFacts = serde_json::from_str(
            r#"{"state": "running", "reachable": true, "publicAddress": "203.0.113.7"}"#,
        )
        .unwrap();
        assert_eq!(facts.state, ResourceState::Running);
        assert_eq!(facts.public_address.as_deref(), Some("203.0.113.7"));
    }
}
