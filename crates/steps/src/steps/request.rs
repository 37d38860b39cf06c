use async_trait::async_trait;
use cloudrig_workflow::{Outcome, StatePatch, Step, StepContext, StepError, StepId};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::INSTANCE_KEY;
use crate::resource::{InstanceRecord, ResourceControl, ResourceSpec};

fn default_instance_type() -> String {
    "g4dn.xlarge".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestArgs {
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Requests the compute resource.
///
/// A resource already recorded in state is never requested again, and the
/// provider call carries a key derived from the chain so a duplicate
/// delivery that races past the state check still yields one resource.
pub struct RequestResource {
    resources: Arc<dyn ResourceControl>,
}

impl RequestResource {
    pub fn new(resources: Arc<dyn ResourceControl>) -> Self {
        Self { resources }
    }
}

#[async_trait]
impl Step for RequestResource {
    fn id(&self) -> StepId {
        StepId::RequestResource
    }

    fn owned_keys(&self) -> &'static [&'static str] {
        &[INSTANCE_KEY]
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<Outcome, StepError> {
        if let Some(existing) = ctx.state_as::<InstanceRecord>(INSTANCE_KEY)? {
            tracing::debug!(resource_id = %existing.resource_id, "Resource already requested");
            return Ok(Outcome::advance());
        }

        let args: RequestArgs = ctx.args_as()?;
        let mut tags = args.tags;
        tags.insert("cloudrig:owner".to_string(), ctx.settings().owner_id.clone());
        tags.insert("cloudrig:chain".to_string(), ctx.config().chain_id.to_string());

        let spec = ResourceSpec {
            region: ctx.config().region.clone(),
            account_scope: ctx.config().account_scope.clone(),
            instance_type: args.instance_type.clone(),
            image: args.image,
            tags,
        };

        let resource_id = self
            .resources
            .request_resource(&spec, &ctx.idempotency_key())
            .await?;
        ctx.progress()
            .report(&format!("Requested {} resource {resource_id}", spec.instance_type));

        let mut patch = StatePatch::new();
        patch.insert(
            INSTANCE_KEY,
            &InstanceRecord {
                resource_id,
                instance_type: args.instance_type,
            },
        )?;
        Ok(Outcome::advance_with(patch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryProvider;
    use crate::steps::test_support::{envelope, with_instance};
    use cloudrig_workflow::NoopProgress;
    use serde_json::json;

    #[tokio::test]
    async fn test_requests_resource_with_chain_key() {
        let provider = Arc::new(InMemoryProvider::new());
        let step = RequestResource::new(provider.clone());
        let env = envelope();
        let args = json!({"instanceType": "g5.xlarge", "tags": {"team": "rig"}});
        let ctx = StepContext::new(&env, StepId::RequestResource, &args, &NoopProgress);

        let outcome = step.run(&ctx).await.unwrap();

        let Outcome::Advance(patch) = outcome else {
            panic!("expected advance");
        };
        assert_eq!(patch.keys().collect::<Vec<_>>(), vec![INSTANCE_KEY]);
        assert_eq!(provider.created(), 1);

        let spec = provider.spec_of("i-0001").unwrap();
        assert_eq!(spec.instance_type, "g5.xlarge");
        assert_eq!(spec.region, "eu-west-2");
        assert_eq!(spec.tags["team"], "rig");
        assert_eq!(spec.tags["cloudrig:owner"], "owner-1");
    }

    #[tokio::test]
    async fn test_duplicate_delivery_reuses_resource() {
        let provider = Arc::new(InMemoryProvider::new());
        let step = RequestResource::new(provider.clone());
        let env = envelope();
        let args = json!({});
        let ctx = StepContext::new(&env, StepId::RequestResource, &args, &NoopProgress);

        let first = step.run(&ctx).await.unwrap();
        let second = step.run(&ctx).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.created(), 1);
    }

    #[tokio::test]
    async fn test_existing_instance_is_kept() {
        let provider = Arc::new(InMemoryProvider::new());
        let step = RequestResource::new(provider.clone());
        let env = with_instance("i-existing");
        let args = json!({});
        let ctx = StepContext::new(&env, StepId::RequestResource, &args, &NoopProgress);

        assert_eq!(step.run(&ctx).await.unwrap(), Outcome::advance());
        assert_eq!(provider.created(), 0);
    }
}
