//! Chain templates.

use cloudrig_workflow::{DeploymentConfig, Envelope, Settings, StepDescriptor, StepId};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::steps::INSTANCE_KEY;

/// What a provisioning chain should build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    pub instance_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub network_id: String,
    #[serde(default)]
    pub packages: Vec<String>,
}

/// Steps of a provisioning chain, in order.
pub fn provision_steps(request: &ProvisionRequest) -> Vec<StepDescriptor> {
    let mut request_args = json!({ "instanceType": request.instance_type });
    if let Some(image) = &request.image {
        request_args["image"] = json!(image);
    }

    vec![
        StepDescriptor::with_args(StepId::RequestResource, request_args),
        StepDescriptor::new(StepId::WaitReachable),
        StepDescriptor::new(StepId::WaitAgent),
        StepDescriptor::with_args(
            StepId::ConfigureNetwork,
            json!({ "networkId": request.network_id }),
        ),
        StepDescriptor::with_args(
            StepId::InstallSoftware,
            json!({ "packages": request.packages }),
        ),
    ]
}

/// Steps of a stop chain.
pub fn stop_steps() -> Vec<StepDescriptor> {
    vec![StepDescriptor::new(StepId::Teardown)]
}

/// Compensating chain substituted for the forward remainder on failure.
pub fn compensating_chain() -> Vec<StepDescriptor> {
    vec![StepDescriptor::new(StepId::Teardown)]
}

/// Initial envelope of a provisioning chain.
pub fn provision(config: DeploymentConfig, settings: Settings, request: &ProvisionRequest) -> Envelope {
    Envelope::new(config, settings, provision_steps(request))
}

/// Initial envelope of a chain terminating an existing resource.
pub fn stop(config: DeploymentConfig, settings: Settings, resource_id: &str) -> Envelope {
    Envelope::new(config, settings, stop_steps()).with_state(
        INSTANCE_KEY,
        json!({ "resourceId": resource_id }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ProvisionRequest {
        ProvisionRequest {
            instance_type: "g4dn.xlarge".into(),
            image: Some("ami-0abc".into()),
            network_id: "8056c2e21c000001".into(),
            packages: vec!["steam".into(), "parsec".into()],
        }
    }

    #[test]
    fn test_provision_order() {
        let targets: Vec<StepId> = provision_steps(&request()).iter().map(|s| s.target).collect();
        assert_eq!(
            targets,
            vec![
                StepId::RequestResource,
                StepId::WaitReachable,
                StepId::WaitAgent,
                StepId::ConfigureNetwork,
                StepId::InstallSoftware,
            ]
        );
    }

    #[test]
    fn test_provision_args() {
        let steps = provision_steps(&request());
        assert_eq!(steps[0].args["image"], "ami-0abc");
        assert_eq!(steps[3].args["networkId"], "8056c2e21c000001");
        assert_eq!(steps[4].args["packages"][1], "parsec");
    }

    #[test]
    fn test_stop_seeds_instance() {
        let env = stop(
            DeploymentConfig::new("eu-west-2", "123456789012"),
            Settings::new("owner-1"),
            "i-0abc",
        );
        assert_eq!(env.state_value(INSTANCE_KEY).unwrap()["resourceId"], "i-0abc");
        assert_eq!(env.head().unwrap().target, StepId::Teardown);
    }
}
