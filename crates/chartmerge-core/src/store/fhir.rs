use std::time::Duration;

use super::{parse_reference, ResourceStore};
use crate::error::StoreError;
use crate::resource::Resource;

/// Resource store backed by a FHIR REST server.
pub struct FhirHttpStore {
    base_url: String,
    http_client: reqwest::Client,
}

impl FhirHttpStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URLs pass through; relative references hang off the base.
    fn absolute(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }

    async fn read_resource(
        &self,
        url: &str,
        response: reqwest::Response,
    ) -> Result<Resource, StoreError> {
        let response = check_status(url, response).await?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Resource::from_value(body).map_err(|e| StoreError::Decode(format!("{url}: {e}")))
    }
}

async fn check_status(
    url: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
        return Err(StoreError::NotFound(url.to_string()));
    }
    let message = response.text().await.unwrap_or_default();
    Err(StoreError::Rejected {
        status: status.as_u16(),
        message,
    })
}

fn transport(err: reqwest::Error) -> StoreError {
    StoreError::Transport(err.to_string())
}

#[async_trait::async_trait]
impl ResourceStore for FhirHttpStore {
    async fn fetch(&self, resource_type: &str, id: &str) -> Result<Resource, StoreError> {
        self.fetch_url(&format!("{resource_type}/{id}")).await
    }

    async fn fetch_url(&self, url: &str) -> Result<Resource, StoreError> {
        let url = self.absolute(url);
        tracing::debug!(url = %url, "GET");
        let response = self
            .http_client
            .get(&url)
            .header("Accept", "application/fhir+json")
            .send()
            .await
            .map_err(transport)?;
        self.read_resource(&url, response).await
    }

    async fn create(&self, resource: &Resource) -> Result<Resource, StoreError> {
        let url = self.absolute(resource.resource_type());
        // The server assigns the id on create.
        let mut body = resource.clone().into_value();
        if let Some(fields) = body.as_object_mut() {
            fields.remove("id");
        }
        tracing::debug!(url = %url, "POST");
        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        self.read_resource(&url, response).await
    }

    async fn replace(&self, resource: &Resource) -> Result<Resource, StoreError> {
        let reference = resource.reference().ok_or_else(|| StoreError::Rejected {
            status: 400,
            message: format!("{} has no id to replace", resource.resource_type()),
        })?;
        let url = self.absolute(&reference);
        tracing::debug!(url = %url, "PUT");
        let response = self
            .http_client
            .put(&url)
            .json(resource)
            .send()
            .await
            .map_err(transport)?;
        self.read_resource(&url, response).await
    }

    async fn delete_url(&self, url: &str) -> Result<(), StoreError> {
        if parse_reference(url).is_none() {
            return Err(StoreError::NotFound(url.to_string()));
        }
        let url = self.absolute(url);
        tracing::debug!(url = %url, "DELETE");
        let response = self
            .http_client
            .delete(&url)
            .send()
            .await
            .map_err(transport)?;
        check_status(&url, response).await?;
        Ok(())
    }
}
