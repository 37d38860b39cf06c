use async_trait::async_trait;
use cloudrig_workflow::{Outcome, StatePatch, Step, StepContext, StepError, StepId};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::network::checked;
use super::require_instance;
use crate::resource::RemoteCommand;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallArgs {
    #[serde(default)]
    pub packages: Vec<String>,
}

/// Installs packages one command at a time.
pub struct InstallSoftware {
    commands: Arc<dyn RemoteCommand>,
}

impl InstallSoftware {
    pub fn new(commands: Arc<dyn RemoteCommand>) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl Step for InstallSoftware {
    fn id(&self) -> StepId {
        StepId::InstallSoftware
    }

    fn owned_keys(&self) -> &'static [&'static str] {
        &["software"]
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<Outcome, StepError> {
        let args: InstallArgs = ctx.args_as()?;
        let instance = require_instance(ctx)?;
        let key = ctx.idempotency_key();

        for package in &args.packages {
            if package.trim().is_empty() || package.contains(char::is_whitespace) {
                return Err(StepError::InvalidArgs(format!("bad package name: {package:?}")));
            }
            let command = format!("choco install {package} -y --no-progress");
            checked(
                self.commands
                    .run_command(&instance.resource_id, &command, &format!("{key}:{package}"))
                    .await?,
            )?;
            ctx.progress().report(&format!("Installed {package}"));
        }

        Ok(Outcome::advance_with(
            StatePatch::new().with("software", json!({ "installed": args.packages })),
        ))
    }
}
