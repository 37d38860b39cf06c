use async_trait::async_trait;
use cloudrig_workflow::{Outcome, StatePatch, Step, StepContext, StepError, StepId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::require_instance;
use crate::error::ProviderError;
use crate::resource::{CommandOutput, RemoteCommand};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkArgs {
    pub network_id: String,
}

/// The `network` state entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRecord {
    pub network_id: String,
    pub address: String,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    address: String,
}

/// Joins the resource to the private network and records its address.
pub struct ConfigureNetwork {
    commands: Arc<dyn RemoteCommand>,
}

impl ConfigureNetwork {
    pub fn new(commands: Arc<dyn RemoteCommand>) -> Self {
        Self { commands }
    }
}

pub(crate) fn checked(output: CommandOutput) -> Result<CommandOutput, ProviderError> {
    if output.is_success() {
        Ok(output)
    } else {
        Err(ProviderError::CommandFailed {
            exit_code: output.exit_code,
            stderr: output.stderr,
        })
    }
}

#[async_trait]
impl Step for ConfigureNetwork {
    fn id(&self) -> StepId {
        StepId::ConfigureNetwork
    }

    fn owned_keys(&self) -> &'static [&'static str] {
        &["network"]
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<Outcome, StepError> {
        let args: NetworkArgs = ctx.args_as()?;
        let instance = require_instance(ctx)?;
        let key = ctx.idempotency_key();

        let join = format!("zerotier-cli -j join {}", args.network_id);
        checked(
            self.commands
                .run_command(&instance.resource_id, &join, &format!("{key}:join"))
                .await?,
        )?;

        let info = checked(
            self.commands
                .run_command(&instance.resource_id, "zerotier-cli -j info", &format!("{key}:info"))
                .await?,
        )?;
        let node: NodeInfo = serde_json::from_str(info.stdout.trim())
            .map_err(|e| StepError::Collaborator(format!("unreadable node info: {e}")))?;

        ctx.progress().report(&format!(
            "Joined network {} as {}",
            args.network_id, node.address
        ));

        let mut patch = StatePatch::new();
        patch.insert(
            "network",
            &NetworkRecord {
                network_id: args.network_id,
                address: node.address,
            },
        )?;
        Ok(Outcome::advance_with(patch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryProvider;
    use crate::resource::{ResourceControl, ResourceSpec};
    use crate::steps::test_support::with_instance;
    use cloudrig_workflow::NoopProgress;
    use serde_json::json;
    use std::collections::BTreeMap;

    async fn provisioned(provider: &InMemoryProvider) -> String {
        provider
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
            .unwrap()
    }

    #[tokio::test]
    async fn test_joins_and_records_address() {
        let provider = Arc::new(InMemoryProvider::new());
        let resource_id = provisioned(&provider).await;
        let step = ConfigureNetwork::new(provider.clone());
        let env = with_instance(&resource_id);
        let args = json!({"networkId": "8056c2e21c000001"});
        let ctx = StepContext::new(&env, StepId::ConfigureNetwork, &args, &NoopProgress);

        let Outcome::Advance(patch) = step.run(&ctx).await.unwrap() else {
            panic!("expected advance");
        };
        assert_eq!(patch.keys().collect::<Vec<_>>(), vec!["network"]);

        let commands = provider.commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].1, "zerotier-cli -j join 8056c2e21c000001");
        assert!(commands[0].2.ends_with(":configureNetwork:join"));
    }

    #[tokio::test]
    async fn test_failed_join_is_an_error() {
        let provider = Arc::new(InMemoryProvider::new().fail_commands_containing("join"));
        let resource_id = provisioned(&provider).await;
        let step = ConfigureNetwork::new(provider);
        let env = with_instance(&resource_id);
        let args = json!({"networkId": "n"});
        let ctx = StepContext::new(&env, StepId::ConfigureNetwork, &args, &NoopProgress);

        let err = step.run(&ctx).await.unwrap_err();
        assert_eq!(err.code(), "collaborator");
    }

    #[tokio::test]
    async fn test_missing_network_id_is_invalid_args() {
        let step = ConfigureNetwork::new(Arc::new(InMemoryProvider::new()));
        let env = with_instance("i-1");
        let args = json!({});
        let ctx = StepContext::new(&env, StepId::ConfigureNetwork, &args, &NoopProgress);

        assert!(matches!(step.run(&ctx).await, Err(StepError::InvalidArgs(_))));
    }
}
