//! Built-in steps.
//!
//! - `requestResource` - Ask the provider for a compute resource
//! - `waitReachable` - Poll until the resource is running and reachable
//! - `waitAgent` - Poll until the management agent registers
//! - `configureNetwork` - Join the resource to the private network
//! - `installSoftware` - Install packages through the agent
//! - `teardown` - Terminate the resource (also the compensating step)

mod agent;
mod install;
mod network;
mod reachable;
mod request;
mod teardown;

pub use self::agent::WaitAgent;
pub use self::install::{InstallArgs, InstallSoftware};
pub use self::network::{ConfigureNetwork, NetworkArgs, NetworkRecord};
pub use self::reachable::WaitReachable;
pub use self::request::{RequestArgs, RequestResource};
pub use self::teardown::{Teardown, TeardownRecord};

use cloudrig_workflow::{PollPolicy, Polling, StepContext, StepError, StepRegistry};
use std::sync::Arc;

use crate::resource::{InstanceRecord, RemoteCommand, ResourceControl};

/// State key written by `requestResource`.
pub const INSTANCE_KEY: &str = "instance";

/// Create a step registry with all built-in steps registered.
pub fn create_default_registry(
    resources: Arc<dyn ResourceControl>,
    commands: Arc<dyn RemoteCommand>,
    poll: PollPolicy,
) -> StepRegistry {
    let mut registry = StepRegistry::new();

    registry.register(RequestResource::new(resources.clone()));
    registry.register(Polling::new(WaitReachable::new(resources.clone(), poll)));
    registry.register(Polling::new(WaitAgent::new(resources.clone(), poll)));
    registry.register(ConfigureNetwork::new(commands.clone()));
    registry.register(InstallSoftware::new(commands));
    registry.register(Teardown::new(resources));

    registry
}

/// The resource created earlier in the chain.
pub(crate) fn require_instance(ctx: &StepContext<'_>) -> Result<InstanceRecord, StepError> {
    ctx.state_as::<InstanceRecord>(INSTANCE_KEY)?.ok_or_else(|| {
        StepError::InvalidState(format!("{} needs state.{INSTANCE_KEY}", ctx.step()))
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use cloudrig_workflow::{DeploymentConfig, Envelope, Settings};
    use serde_json::json;

    pub fn envelope() -> Envelope {
        Envelope::new(
            DeploymentConfig::new("eu-west-2", "123456789012"),
            Settings::new("owner-1"),
            vec![],
        )
    }

    pub fn with_instance(resource_id: &str) -> Envelope {
        envelope().with_state(
            super::INSTANCE_KEY,
            json!({"resourceId": resource_id, "instanceType": "g4dn.xlarge"}),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryProvider;
    use cloudrig_workflow::StepId;
    use std::time::Duration;

    #[test]
    fn test_default_registry_has_every_step() {
        let provider = Arc::new(InMemoryProvider::new());
        let registry = create_default_registry(
            provider.clone(),
            provider,
            PollPolicy::new(Duration::from_secs(60), Duration::from_secs(1800)),
        );

        let mut expected = StepId::ALL.to_vec();
        expected.sort();
        assert_eq!(registry.list(), expected);
        assert!(registry.get(StepId::Teardown).unwrap().compensating());
        assert!(!registry.get(StepId::RequestResource).unwrap().compensating());
    }
}
