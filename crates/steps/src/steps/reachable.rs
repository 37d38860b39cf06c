use async_trait::async_trait;
use cloudrig_workflow::{Condition, PollPolicy, PollingStep, StatePatch, StepContext, StepError, StepId};
use std::sync::Arc;

use super::require_instance;
use crate::resource::{ResourceControl, ResourceState};

/// Waits until the resource is running and accepts connections.
pub struct WaitReachable {
    resources: Arc<dyn ResourceControl>,
    policy: PollPolicy,
}

impl WaitReachable {
    pub fn new(resources: Arc<dyn ResourceControl>, policy: PollPolicy) -> Self {
        Self { resources, policy }
    }
}

#[async_trait]
impl PollingStep for WaitReachable {
    fn id(&self) -> StepId {
        StepId::WaitReachable
    }

    fn owned_keys(&self) -> &'static [&'static str] {
        &["reachability"]
    }

    fn policy(&self) -> PollPolicy {
        self.policy
    }

    async fn check(&self, ctx: &StepContext<'_>) -> Result<Condition, StepError> {
        let instance = require_instance(ctx)?;
        let facts = self.resources.describe_status(&instance.resource_id).await?;

        if facts.state == ResourceState::Running && facts.reachable {
            ctx.progress()
                .report(&format!("Resource {} is reachable", instance.resource_id));
            let mut patch = StatePatch::new();
            patch.insert("reachability", &facts)?;
            return Ok(Condition::Met(patch));
        }

        Ok(Condition::Pending(format!(
            "{} is {:?}, reachable={}",
            instance.resource_id, facts.state, facts.reachable
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryProvider;
    use crate::resource::{ResourceControl, ResourceSpec};
    use crate::steps::test_support::{envelope, with_instance};
    use cloudrig_workflow::NoopProgress;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn policy() -> PollPolicy {
        PollPolicy::new(Duration::from_secs(60), Duration::from_secs(1800))
    }

    #[tokio::test]
    async fn test_pending_then_met() {
        let provider = Arc::new(InMemoryProvider::new().reachable_after(1));
        let resource_id = provider
            .request_resource(
                &ResourceSpec {
                    region: "eu-west-2".into(),
                    account_scope: "123456789012".into(),
                    instance_type: "g4dn.xlarge".into(),
                    image: None,
                    tags: BTreeMap::new(),
                },
                "k",
            )
            .await
            .unwrap();
        let step = WaitReachable::new(provider, policy());
        let env = with_instance(&resource_id);
        let args = json!({});
        let ctx = StepContext::new(&env, StepId::WaitReachable, &args, &NoopProgress);

        assert!(matches!(step.check(&ctx).await.unwrap(), Condition::Pending(_)));
        match step.check(&ctx).await.unwrap() {
            Condition::Met(patch) => assert_eq!(patch.keys().collect::<Vec<_>>(), vec!["reachability"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_instance_is_invalid_state() {
        let step = WaitReachable::new(Arc::new(InMemoryProvider::new()), policy());
        let env = envelope();
        let args = json!({});
        let ctx = StepContext::new(&env, StepId::WaitReachable, &args, &NoopProgress);

        assert!(matches!(step.check(&ctx).await, Err(StepError::InvalidState(_))));
    }
}
