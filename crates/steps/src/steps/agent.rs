use async_trait::async_trait;
use cloudrig_workflow::{Condition, PollPolicy, PollingStep, StatePatch, StepContext, StepError, StepId};
use std::sync::Arc;

use super::require_instance;
use crate::resource::ResourceControl;

/// Waits until the management agent on the resource has registered.
pub struct WaitAgent {
    resources: Arc<dyn ResourceControl>,
    policy: PollPolicy,
}

impl WaitAgent {
    pub fn new(resources: Arc<dyn ResourceControl>, policy: PollPolicy) -> Self {
        Self { resources, policy }
    }
}

#[async_trait]
impl PollingStep for WaitAgent {
    fn id(&self) -> StepId {
        StepId::WaitAgent
    }

    fn owned_keys(&self) -> &'static [&'static str] {
        &["agent"]
    }

    fn policy(&self) -> PollPolicy {
        self.policy
    }

    async fn check(&self, ctx: &StepContext<'_>) -> Result<Condition, StepError> {
        let instance = require_instance(ctx)?;

        match self.resources.describe_agent(&instance.resource_id).await? {
            Some(agent) => {
                ctx.progress()
                    .report(&format!("Agent {} registered", agent.agent_id));
                let mut patch = StatePatch::new();
                patch.insert("agent", &agent)?;
                Ok(Condition::Met(patch))
            }
            None => Ok(Condition::Pending(format!(
                "agent on {} not registered",
                instance.resource_id
            ))),
        }
    }
}
