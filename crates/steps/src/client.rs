//! Resource provider HTTP client.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ProviderError;
use crate::resource::{AgentFacts, CommandOutput, RemoteCommand, ResourceControl, ResourceSpec, StatusFacts};

/// Header carrying the idempotency key of a create request.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedResource {
    resource_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandRequest<'a> {
    command: &'a str,
    idempotency_key: &'a str,
}

/// HTTP client for the resource provider API.
///
/// Implements both [`ResourceControl`] and [`RemoteCommand`].
#[derive(Clone)]
pub struct HttpResourceControl {
    client: reqwest::Client,
    base_url: String,
}

impl HttpResourceControl {
    /// Create a new provider client.
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn resource_url(&self, resource_id: &str, suffix: &str) -> String {
        format!("{}/resources/{}{}", self.base_url, resource_id, suffix)
    }

    async fn unexpected(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        ProviderError::Status { status, body }
    }
}

#[async_trait]
impl ResourceControl for HttpResourceControl {
    async fn request_resource(
        &self,
        spec: &ResourceSpec,
        idempotency_key: &str,
    ) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(format!("{}/resources", self.base_url))
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(spec)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let created: CreatedResource = response.json().await?;
                tracing::debug!(
                    resource_id = %created.resource_id,
                    idempotency_key,
                    "Resource requested"
                );
                Ok(created.resource_id)
            }
            _ => Err(Self::unexpected(response).await),
        }
    }

    async fn find_resource(&self, idempotency_key: &str) -> Result<Option<String>, ProviderError> {
        let response = self
            .client
            .get(format!("{}/resources", self.base_url))
            .query(&[("idempotencyKey", idempotency_key)])
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let found: CreatedResource = response.json().await?;
                Ok(Some(found.resource_id))
            }
            _ => Err(Self::unexpected(response).await),
        }
    }

    async fn describe_status(&self, resource_id: &str) -> Result<StatusFacts, ProviderError> {
        let response = self
            .client
            .get(self.resource_url(resource_id, "/status"))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ProviderError::NotFound(resource_id.to_string())),
            status if status.is_success() => Ok(response.json().await?),
            _ => Err(Self::unexpected(response).await),
        }
    }

    async fn describe_agent(&self, resource_id: &str) -> Result<Option<AgentFacts>, ProviderError> {
        let response = self
            .client
            .get(self.resource_url(resource_id, "/agent"))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            _ => Err(Self::unexpected(response).await),
        }
    }

    async fn terminate_resource(&self, resource_id: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .delete(self.resource_url(resource_id, ""))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                tracing::debug!(resource_id, "Resource already gone");
                Ok(())
            }
            status if status.is_success() => Ok(()),
            _ => Err(Self::unexpected(response).await),
        }
    }
}

#[async_trait]
impl RemoteCommand for HttpResourceControl {
    async fn run_command(
        &self,
        resource_id: &str,
        command: &str,
        idempotency_key: &str,
    ) -> Result<CommandOutput, ProviderError> {
        let response = self
            .client
            .post(self.resource_url(resource_id, "/commands"))
            .json(&CommandRequest {
                command,
                idempotency_key,
            })
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ProviderError::NotFound(resource_id.to_string())),
            status if status.is_success() => Ok(response.json().await?),
            _ => Err(Self::unexpected(response).await),
        }
    }
}
