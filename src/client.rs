//! HTTP client for the appctl API server.

use crate::{
    api::{DeployRequest, MessageResponse, StatusResponse},
    error::{Error, Result},
};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the front door endpoints
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Send `Authorization: Bearer <token>` with every request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<MessageResponse>(&body)
            .map(|m| m.message)
            .unwrap_or(body);
        Err(Error::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// Create an AppDeployment
    pub async fn deploy(&self, request: &DeployRequest) -> Result<MessageResponse> {
        self.send(self.client.post(self.url("/deploy")).json(request))
            .await
    }

    /// Read the state and available replicas of a deployment
    pub async fn status(&self, name: &str) -> Result<StatusResponse> {
        self.send(self.client.get(self.url(&format!("/status/{name}"))))
            .await
    }

    /// Delete a deployment
    pub async fn destroy(&self, name: &str) -> Result<MessageResponse> {
        self.send(self.client.delete(self.url(&format!("/{name}"))))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = ApiClient::new("http://localhost:8080/").unwrap();
        assert_eq!(client.base_url, "http://localhost:8080");
        assert!(client.token.is_none());
    }

    #[test]
    fn test_url_building() {
        let client = ApiClient::new("http://localhost:8080")
            .unwrap()
            .with_token("abc");
        assert_eq!(client.url("/status/web"), "http://localhost:8080/status/web");
        assert_eq!(client.token.as_deref(), Some("abc"));
    }
}
