use async_trait::async_trait;
use cloudrig_workflow::{Outcome, StatePatch, Step, StepContext, StepError, StepId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::INSTANCE_KEY;
use crate::resource::{InstanceRecord, ResourceControl};

/// The `teardown` state entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownRecord {
    pub resource_id: String,
    pub terminated: bool,
}

/// Terminates the resource recorded in state.
///
/// Runs both as the stop chain and as the compensating chain. A chain that
/// was aborted or failed before `state.instance` was written may still own
/// a resource, so without one in state the provider is asked for whatever
/// `requestResource` created under this chain's key. With nothing found
/// there is nothing to undo and it simply advances.
pub struct Teardown {
    resources: Arc<dyn ResourceControl>,
}

impl Teardown {
    pub fn new(resources: Arc<dyn ResourceControl>) -> Self {
        Self { resources }
    }
}

#[async_trait]
impl Step for Teardown {
    fn id(&self) -> StepId {
        StepId::Teardown
    }

    fn owned_keys(&self) -> &'static [&'static str] {
        &["teardown"]
    }

    fn compensating(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<Outcome, StepError> {
        let resource_id = match ctx.state_as::<InstanceRecord>(INSTANCE_KEY)? {
            Some(instance) => instance.resource_id,
            None => {
                let key = ctx.idempotency_key_for(StepId::RequestResource);
                match self.resources.find_resource(&key).await? {
                    Some(resource_id) => {
                        tracing::info!(
                            %resource_id,
                            idempotency_key = %key,
                            "Found resource missing from state"
                        );
                        resource_id
                    }
                    None => {
                        ctx.progress().report("No resource to tear down");
                        return Ok(Outcome::advance());
                    }
                }
            }
        };

        self.resources.terminate_resource(&resource_id).await?;
        ctx.progress()
            .report(&format!("Terminated resource {resource_id}"));

        let mut patch = StatePatch::new();
        patch.insert(
            "teardown",
            &TeardownRecord {
                resource_id,
                terminated: true,
            },
        )?;
        Ok(Outcome::advance_with(patch))
    }
}
