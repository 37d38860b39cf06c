//! In-memory provider.
//!
//! Behaves like the HTTP provider without a network: create requests are
//! deduplicated by idempotency key, resources become reachable and their
//! agent registers after a configurable number of status checks. Used for
//! dry runs and by the chain tests.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::ProviderError;
use crate::resource::{
    AgentFacts, CommandOutput, RemoteCommand, ResourceControl, ResourceSpec, ResourceState,
    StatusFacts,
};

#[derive(Debug, Clone)]
struct Resource {
    spec: ResourceSpec,
    status_checks: usize,
    agent_checks: usize,
    terminated: bool,
}

#[derive(Default)]
struct Inner {
    resources: HashMap<String, Resource>,
    by_key: HashMap<String, String>,
    commands: Vec<(String, String, String)>,
    terminate_failures_left: usize,
}

pub struct InMemoryProvider {
    inner: Mutex<Inner>,
    reachable_after: usize,
    agent_after: usize,
    failing_command: Option<String>,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvider {
    /// Resources are reachable and registered on the first check.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            reachable_after: 0,
            agent_after: 0,
            failing_command: None,
        }
    }

    /// Number of pending status checks before a resource is reachable.
    pub fn reachable_after(mut self, checks: usize) -> Self {
        self.reachable_after = checks;
        self
    }

    /// Number of pending agent checks before the agent registers.
    pub fn agent_after(mut self, checks: usize) -> Self {
        self.agent_after = checks;
        self
    }

    /// Commands containing `fragment` exit non-zero.
    pub fn fail_commands_containing(mut self, fragment: impl Into<String>) -> Self {
        self.failing_command = Some(fragment.into());
        self
    }

    /// The next `count` terminate calls fail.
    pub fn fail_terminations(self, count: usize) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner.terminate_failures_left = count;
        }
        self
    }

    /// Number of distinct resources ever created.
    pub fn created(&self) -> usize {
        self.inner.lock().map(|i| i.resources.len()).unwrap_or_default()
    }

    /// Resources created and not terminated.
    pub fn live(&self) -> Vec<String> {
        let mut live: Vec<String> = self
            .inner
            .lock()
            .map(|i| {
                i.resources
                    .iter()
                    .filter(|(_, r)| !r.terminated)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();
        live.sort();
        live
    }

    /// `ResourceSpec` a resource was created with.
    pub fn spec_of(&self, resource_id: &str) -> Option<ResourceSpec> {
        self.inner
            .lock()
            .ok()
            .and_then(|i| i.resources.get(resource_id).map(|r| r.spec.clone()))
    }

    /// Every command run so far, as `(resource, command, idempotency key)`.
    pub fn commands(&self) -> Vec<(String, String, String)> {
        self.inner.lock().map(|i| i.commands.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, ProviderError> {
        self.inner
            .lock()
            .map_err(|_| ProviderError::Http("provider state poisoned".to_string()))
    }
}

#[async_trait]
impl ResourceControl for InMemoryProvider {
    async fn request_resource(
        &self,
        spec: &ResourceSpec,
        idempotency_key: &str,
    ) -> Result<String, ProviderError> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner.by_key.get(idempotency_key) {
            return Ok(existing.clone());
        }
        let resource_id = format!("i-{:04}", inner.resources.len() + 1);
        inner.resources.insert(
            resource_id.clone(),
            Resource {
                spec: spec.clone(),
                status_checks: 0,
                agent_checks: 0,
                terminated: false,
            },
        );
        inner
            .by_key
            .insert(idempotency_key.to_string(), resource_id.clone());
        Ok(resource_id)
    }

    async fn find_resource(&self, idempotency_key: &str) -> Result<Option<String>, ProviderError> {
        Ok(self.lock()?.by_key.get(idempotency_key).cloned())
    }

    async fn describe_status(&self, resource_id: &str) -> Result<StatusFacts, ProviderError> {
        let reachable_after = self.reachable_after;
        let mut inner = self.lock()?;
        let resource = inner
            .resources
            .get_mut(resource_id)
            .ok_or_else(|| ProviderError::NotFound(resource_id.to_string()))?;

        if resource.terminated {
            return Ok(StatusFacts {
                state: ResourceState::Terminated,
                reachable: false,
                public_address: None,
            });
        }
        let ready = resource.status_checks >= reachable_after;
        resource.status_checks += 1;
        Ok(StatusFacts {
            state: if ready {
                ResourceState::Running
            } else {
                ResourceState::Pending
            },
            reachable: ready,
            public_address: ready.then(|| "203.0.113.10".to_string()),
        })
    }

    async fn describe_agent(&self, resource_id: &str) -> Result<Option<AgentFacts>, ProviderError> {
        let agent_after = self.agent_after;
        let mut inner = self.lock()?;
        let resource = inner
            .resources
            .get_mut(resource_id)
            .ok_or_else(|| ProviderError::NotFound(resource_id.to_string()))?;

        let registered = resource.agent_checks >= agent_after;
        resource.agent_checks += 1;
        Ok(registered.then(|| AgentFacts {
            agent_id: format!("mi-{resource_id}"),
            platform: Some("Windows".to_string()),
            ping_status: Some("Online".to_string()),
        }))
    }

    async fn terminate_resource(&self, resource_id: &str) -> Result<(), ProviderError> {
        let mut inner = self.lock()?;
        if inner.terminate_failures_left > 0 {
            inner.terminate_failures_left -= 1;
            return Err(ProviderError::Status {
                status: 503,
                body: "terminate throttled".to_string(),
            });
        }
        if let Some(resource) = inner.resources.get_mut(resource_id) {
            resource.terminated = true;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteCommand for InMemoryProvider {
    async fn run_command(
        &self,
        resource_id: &str,
        command: &str,
        idempotency_key: &str,
    ) -> Result<CommandOutput, ProviderError> {
        let mut inner = self.lock()?;
        if !inner.resources.contains_key(resource_id) {
            return Err(ProviderError::NotFound(resource_id.to_string()));
        }
        inner.commands.push((
            resource_id.to_string(),
            command.to_string(),
            idempotency_key.to_string(),
        ));

        if let Some(fragment) = &self.failing_command {
            if command.contains(fragment.as_str()) {
                return Ok(CommandOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: format!("{command}: failed"),
                });
            }
        }

        let stdout = if command.contains(" info") {
            json!({"address": "10.147.17.5", "online": true}).to_string()
        } else {
            "ok".to_string()
        };
        Ok(CommandOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec() -> ResourceSpec {
        ResourceSpec {
            region: "eu-west-2".into(),
            account_scope: "123456789012".into(),
            instance_type: "g4dn.xlarge".into(),
            image: None,
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn test_request_is_idempotent_per_key() {
        let provider = InMemoryProvider::new();

        let first = tokio_test::block_on(provider.request_resource(&spec(), "chain-a:requestResource")).unwrap();
        let again = tokio_test::block_on(provider.request_resource(&spec(), "chain-a:requestResource")).unwrap();
        let other = tokio_test::block_on(provider.request_resource(&spec(), "chain-b:requestResource")).unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(provider.created(), 2);
    }

    #[test]
    fn test_find_resource_by_key() {
        let provider = InMemoryProvider::new();
        let id = tokio_test::block_on(provider.request_resource(&spec(), "chain-a:requestResource")).unwrap();

        let found = tokio_test::block_on(provider.find_resource("chain-a:requestResource")).unwrap();
        let missing = tokio_test::block_on(provider.find_resource("chain-b:requestResource")).unwrap();

        assert_eq!(found, Some(id));
        assert_eq!(missing, None);
    }

    #[test]
    fn test_terminate_unknown_resource_succeeds() {
        let provider = InMemoryProvider::new();
        tokio_test::block_on(provider.terminate_resource("i-missing")).unwrap();
        assert!(provider.live().is_empty());
    }

    #[test]
    fn test_status_turns_reachable() {
        let provider = InMemoryProvider::new().reachable_after(1);
        let id = tokio_test::block_on(provider.request_resource(&spec(), "k")).unwrap();

        let first = tokio_test::block_on(provider.describe_status(&id)).unwrap();
        assert_eq!(first.state, ResourceState::Pending);
        let second = tokio_test::block_on(provider.describe_status(&id)).unwrap();
        assert!(second.reachable);

        tokio_test::block_on(provider.terminate_resource(&id)).unwrap();
        let gone = tokio_test::block_on(provider.describe_status(&id)).unwrap();
        assert_eq!(gone.state, ResourceState::Terminated);
    }
}
