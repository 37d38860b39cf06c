//! The workflow envelope: the only state threaded through a chain.
//!
//! An envelope is created once by whoever starts the chain and afterwards
//! only lives inside messages and scheduler entries. Nothing is stored
//! between steps, so serialization must round-trip every field, including
//! keys this crate does not know about.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::outcome::StatePatch;
use crate::step::StepId;

/// Immutable deployment configuration, fixed at chain start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    /// Provider region the rig lives in.
    pub region: String,

    /// Account the resources are billed to.
    pub account_scope: String,

    /// Identifies the chain in progress reports and idempotency keys.
    pub chain_id: Uuid,

    /// Credential references and other deployment keys.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeploymentConfig {
    /// Create a configuration for a new chain.
    pub fn new(region: impl Into<String>, account_scope: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            account_scope: account_scope.into(),
            chain_id: Uuid::new_v4(),
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// User-scoped identifiers used to address messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub owner_id: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Settings {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            extra: Map::new(),
        }
    }
}

/// One entry of `pendingSteps`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescriptor {
    /// Step to run.
    pub target: StepId,

    /// Step-specific intent, distinct from accumulated state.
    #[serde(default)]
    pub args: Value,
}

impl StepDescriptor {
    pub fn new(target: StepId) -> Self {
        Self {
            target,
            args: Value::Object(Map::new()),
        }
    }

    pub fn with_args(target: StepId, args: Value) -> Self {
        Self { target, args }
    }
}

/// Why a chain left the forward path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackCause {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Forward step that failed, if the rollback was not operator-initiated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepId>,

    /// One entry per failed compensating attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compensation_failures: Vec<String>,
}

impl RollbackCause {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            step: None,
            compensation_failures: Vec::new(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_step(mut self, step: StepId) -> Self {
        self.step = Some(step);
        self
    }
}

/// Which path an envelope is travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPath {
    Forward,
    Rollback,
}

/// Serialized workflow state passed with every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub config: DeploymentConfig,

    pub settings: Settings,

    #[serde(default)]
    state: Map<String, Value>,

    #[serde(default)]
    pending_steps: VecDeque<StepDescriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    rollback_cause: Option<RollbackCause>,
}

impl Envelope {
    /// Create a forward-path envelope with an empty state.
    pub fn new(
        config: DeploymentConfig,
        settings: Settings,
        steps: impl IntoIterator<Item = StepDescriptor>,
    ) -> Self {
        Self {
            config,
            settings,
            state: Map::new(),
            pending_steps: steps.into_iter().collect(),
            rollback_cause: None,
        }
    }

    /// Seed state before the chain starts, e.g. the resource a stop chain
    /// should terminate.
    pub fn with_state(mut self, key: impl Into<String>, value: Value) -> Self {
        self.state.insert(key.into(), value);
        self
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn path(&self) -> ChainPath {
        if self.rollback_cause.is_some() {
            ChainPath::Rollback
        } else {
            ChainPath::Forward
        }
    }

    pub fn is_rolling_back(&self) -> bool {
        self.path() == ChainPath::Rollback
    }

    pub fn state(&self) -> &Map<String, Value> {
        &self.state
    }

    pub fn state_value(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    pub fn state_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        self.state
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
    }

    pub fn pending_steps(&self) -> &VecDeque<StepDescriptor> {
        &self.pending_steps
    }

    /// Step the envelope is currently addressed to.
    pub fn head(&self) -> Option<&StepDescriptor> {
        self.pending_steps.front()
    }

    pub fn rollback_cause(&self) -> Option<&RollbackCause> {
        self.rollback_cause.as_ref()
    }

    /// Remove the descriptor this envelope was delivered to.
    pub(crate) fn pop_current(&mut self) -> Option<StepDescriptor> {
        self.pending_steps.pop_front()
    }

    /// Push a descriptor back to the front so it runs again.
    pub(crate) fn rearm(&mut self, descriptor: StepDescriptor) {
        self.pending_steps.push_front(descriptor);
    }

    /// Add or replace state keys. There is no way to remove a key.
    pub(crate) fn apply(&mut self, patch: StatePatch) {
        for (key, value) in patch.into_entries() {
            self.state.insert(key, value);
        }
    }

    /// Switch to the rollback path, replacing the forward remainder with
    /// the compensating chain.
    pub(crate) fn enter_rollback(
        &mut self,
        cause: RollbackCause,
        compensating: Vec<StepDescriptor>,
    ) -> Result<(), WorkflowError> {
        if let Some(existing) = &self.rollback_cause {
            return Err(WorkflowError::AlreadyRollingBack(existing.message.clone()));
        }
        self.rollback_cause = Some(cause);
        self.pending_steps = compensating.into();
        Ok(())
    }

    /// Record a failed compensating attempt. Returns the number of failed
    /// attempts so far, or `None` on the forward path.
    pub(crate) fn record_compensation_failure(&mut self, failure: String) -> Option<usize> {
        let cause = self.rollback_cause.as_mut()?;
        cause.compensation_failures.push(failure);
        Some(cause.compensation_failures.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> Envelope {
        Envelope::new(
            DeploymentConfig::new("eu-west-2", "123456789012")
                .with_extra("credentialsRef", json!("cloudrig-profile")),
            Settings::new("owner-1"),
            vec![
                StepDescriptor::new(StepId::WaitAgent),
                StepDescriptor::with_args(StepId::InstallSoftware, json!({"packages": ["steam"]})),
            ],
        )
    }

    #[test]
    fn test_wire_shape() {
        let env = envelope().with_state("instance", json!({"resourceId": "i-1"}));
        let value = serde_json::to_value(&env).unwrap();

        assert_eq!(value["config"]["region"], "eu-west-2");
        assert_eq!(value["config"]["accountScope"], "123456789012");
        assert_eq!(value["config"]["credentialsRef"], "cloudrig-profile");
        assert_eq!(value["settings"]["ownerId"], "owner-1");
        assert_eq!(value["state"]["instance"]["resourceId"], "i-1");
        assert_eq!(value["pendingSteps"][0]["target"], "waitAgent");
        assert_eq!(value["pendingSteps"][1]["args"]["packages"][0], "steam");
        assert!(value.get("rollbackCause").is_none());
    }

    #[test]
    fn test_round_trip_preserves_unknown_keys() {
        let json = r#"{
            "config": {"region": "us-east-1", "accountScope": "acct", "chainId": "6f1c2f4e-8a3b-4d5e-9f00-112233445566", "zeroTierNetwork": "abc"},
            "settings": {"ownerId": "u1", "displayName": "Rig"},
            "state": {"instance": {"resourceId": "i-9"}},
            "pendingSteps": [{"target": "teardown", "args": null}],
            "rollbackCause": {"message": "boom", "code": "collaborator"}
        }"#;

        let env = Envelope::from_slice(json.as_bytes()).unwrap();
        assert_eq!(env.config.extra["zeroTierNetwork"], "abc");
        assert_eq!(env.settings.extra["displayName"], "Rig");
        assert_eq!(env.path(), ChainPath::Rollback);

        let again = Envelope::from_slice(&env.to_vec().unwrap()).unwrap();
        assert_eq!(again, env);
    }

    #[test]
    fn test_apply_only_adds_or_replaces() {
        let mut env = envelope().with_state("instance", json!({"resourceId": "i-1"}));
        env.apply(StatePatch::new().with("agent", json!({"agentId": "a-1"})));
        env.apply(StatePatch::new().with("agent", json!({"agentId": "a-2"})));

        assert_eq!(env.state_value("instance").unwrap()["resourceId"], "i-1");
        assert_eq!(env.state_value("agent").unwrap()["agentId"], "a-2");
    }

    #[test]
    fn test_enter_rollback_once() {
        let mut env = envelope();
        env.enter_rollback(RollbackCause::new("boom"), vec![StepDescriptor::new(StepId::Teardown)])
            .unwrap();

        assert!(env.is_rolling_back());
        assert_eq!(env.pending_steps().len(), 1);
        assert_eq!(env.head().unwrap().target, StepId::Teardown);

        let err = env.enter_rollback(RollbackCause::new("again"), vec![]).unwrap_err();
        assert!(matches!(err, WorkflowError::AlreadyRollingBack(m) if m == "boom"));
    }

    #[test]
    fn test_record_compensation_failure() {
        let mut env = envelope();
        assert_eq!(env.record_compensation_failure("x".into()), None);

        env.enter_rollback(RollbackCause::new("boom"), vec![]).unwrap();
        assert_eq!(env.record_compensation_failure("first".into()), Some(1));
        assert_eq!(env.record_compensation_failure("second".into()), Some(2));
        assert_eq!(
            env.rollback_cause().unwrap().compensation_failures,
            vec!["first".to_string(), "second".to_string()]
        );
    }
}
