//! Step identifiers, the `Step` trait and the step registry.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::envelope::{DeploymentConfig, Envelope, Settings};
use crate::error::StepError;
use crate::outcome::Outcome;
use crate::progress::ProgressSink;

/// Identifier of every step the engine can address.
///
/// Serialized as the `target` of a step descriptor and used as the last
/// token of the routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepId {
    /// Ask the provider for a new compute resource.
    RequestResource,
    /// Poll until the resource is running and reachable.
    WaitReachable,
    /// Poll until the management agent has registered.
    WaitAgent,
    /// Join the resource to the private network.
    ConfigureNetwork,
    /// Install the requested software packages.
    InstallSoftware,
    /// Terminate the resource.
    Teardown,
}

impl StepId {
    pub const ALL: [StepId; 6] = [
        StepId::RequestResource,
        StepId::WaitReachable,
        StepId::WaitAgent,
        StepId::ConfigureNetwork,
        StepId::InstallSoftware,
        StepId::Teardown,
    ];

    /// Wire name of the step.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestResource => "requestResource",
            Self::WaitReachable => "waitReachable",
            Self::WaitAgent => "waitAgent",
            Self::ConfigureNetwork => "configureNetwork",
            Self::InstallSoftware => "installSoftware",
            Self::Teardown => "teardown",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| format!("unknown step: {s}"))
    }
}

/// Read-only view handed to a step while it runs.
///
/// Steps never see a mutable envelope; they describe state changes through
/// the [`StatePatch`](crate::StatePatch) in their outcome.
pub struct StepContext<'a> {
    envelope: &'a Envelope,
    step: StepId,
    args: &'a serde_json::Value,
    progress: &'a dyn ProgressSink,
}

impl<'a> StepContext<'a> {
    pub fn new(
        envelope: &'a Envelope,
        step: StepId,
        args: &'a serde_json::Value,
        progress: &'a dyn ProgressSink,
    ) -> Self {
        Self {
            envelope,
            step,
            args,
            progress,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        self.envelope
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.envelope.config
    }

    pub fn settings(&self) -> &Settings {
        &self.envelope.settings
    }

    pub fn step(&self) -> StepId {
        self.step
    }

    /// Raw args of the current step descriptor.
    pub fn args(&self) -> &serde_json::Value {
        self.args
    }

    /// Deserialize the current args. A `null` args value is read as `{}`.
    pub fn args_as<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        let args = if self.args.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            self.args.clone()
        };
        serde_json::from_value(args).map_err(|e| StepError::InvalidArgs(format!("{}: {}", self.step, e)))
    }

    /// Deserialize a state entry written by an earlier step.
    pub fn state_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StepError> {
        self.envelope
            .state_as(key)
            .map_err(|e| StepError::InvalidState(format!("{key}: {e}")))
    }

    pub fn progress(&self) -> &dyn ProgressSink {
        self.progress
    }

    /// Key that is stable across duplicate deliveries of the same envelope
    /// to the same step, and distinct across chains.
    pub fn idempotency_key(&self) -> String {
        self.idempotency_key_for(self.step)
    }

    /// The key `step` uses in this chain. Compensating steps use it to find
    /// what a forward step created.
    pub fn idempotency_key_for(&self, step: StepId) -> String {
        format!("{}:{}", self.envelope.config.chain_id, step)
    }
}

/// A single addressable unit of business logic.
#[async_trait]
pub trait Step: Send + Sync {
    /// Returns the identifier this step is registered under.
    fn id(&self) -> StepId;

    /// State keys this step may add or replace.
    fn owned_keys(&self) -> &'static [&'static str] {
        &[]
    }

    /// Whether this step may run on the rollback path.
    fn compensating(&self) -> bool {
        false
    }

    /// Run the step against the current envelope.
    async fn run(&self, ctx: &StepContext<'_>) -> Result<Outcome, StepError>;
}

/// Registry of available steps.
pub struct StepRegistry {
    steps: HashMap<StepId, Arc<dyn Step>>,
}

impl StepRegistry {
    /// Create a new empty step registry.
    pub fn new() -> Self {
        Self {
            steps: HashMap::new(),
        }
    }

    /// Register a step. A later registration for the same id replaces the
    /// earlier one.
    pub fn register<S: Step + 'static>(&mut self, step: S) {
        self.steps.insert(step.id(), Arc::new(step));
    }

    /// Get a step by id.
    pub fn get(&self, id: StepId) -> Option<Arc<dyn Step>> {
        self.steps.get(&id).cloned()
    }

    /// Check if a step is registered.
    pub fn has(&self, id: StepId) -> bool {
        self.steps.contains_key(&id)
    }

    /// List all registered step ids, sorted.
    pub fn list(&self) -> Vec<StepId> {
        let mut ids: Vec<StepId> = self.steps.keys().copied().collect();
        ids.sort();
        ids
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgress;
    use crate::testing::sample_envelope;

    struct MockStep;

    #[async_trait]
    impl Step for MockStep {
        fn id(&self) -> StepId {
            StepId::WaitAgent
        }

        async fn run(&self, _ctx: &StepContext<'_>) -> Result<Outcome, StepError> {
            Ok(Outcome::advance())
        }
    }

    #[test]
    fn test_step_id_wire_names() {
        for id in StepId::ALL {
            let json = serde_json::to_string(&id).unwrap();
            assert_eq!(json, format!("\"{}\"", id.as_str()));
            assert_eq!(id.as_str().parse::<StepId>().unwrap(), id);
        }
        assert!("waitSSM".parse::<StepId>().is_err());
    }

    #[test]
    fn test_registry_register() {
        let mut registry = StepRegistry::new();
        assert!(registry.list().is_empty());

        registry.register(MockStep);
        assert!(registry.has(StepId::WaitAgent));
        assert!(!registry.has(StepId::Teardown));
        assert_eq!(registry.list(), vec![StepId::WaitAgent]);
    }

    #[test]
    fn test_registered_step_runs() {
        let mut registry = StepRegistry::new();
        registry.register(MockStep);

        let envelope = sample_envelope(vec![]);
        let args = serde_json::json!({});
        let ctx = StepContext::new(&envelope, StepId::WaitAgent, &args, &NoopProgress);
        let step = registry.get(StepId::WaitAgent).unwrap();

        let outcome = tokio_test::block_on(step.run(&ctx)).unwrap();
        assert_eq!(outcome, Outcome::advance());
    }

    #[test]
    fn test_context_args_and_idempotency_key() {
        #[derive(Deserialize)]
        struct Args {
            #[serde(default)]
            packages: Vec<String>,
        }

        let envelope = sample_envelope(vec![]);
        let null = serde_json::Value::Null;
        let ctx = StepContext::new(&envelope, StepId::InstallSoftware, &null, &NoopProgress);

        let args: Args = ctx.args_as().unwrap();
        assert!(args.packages.is_empty());
        assert_eq!(
            ctx.idempotency_key(),
            format!("{}:installSoftware", envelope.config.chain_id)
        );
        assert_eq!(
            ctx.idempotency_key_for(StepId::RequestResource),
            format!("{}:requestResource", envelope.config.chain_id)
        );

        let bad = serde_json::json!({"packages": 3});
        let ctx = StepContext::new(&envelope, StepId::InstallSoftware, &bad, &NoopProgress);
        assert!(matches!(ctx.args_as::<Args>(), Err(StepError::InvalidArgs(_))));
    }
}
