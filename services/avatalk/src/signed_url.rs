use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use avatalk_core::signaling::SignedUrlProvider;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    signed_url: String,
}

/// Fetches signed conversation URLs from an HTTP endpoint.
pub struct HttpSignedUrlProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl HttpSignedUrlProvider {
    pub fn new(endpoint: impl Into<String>, api_key: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[async_trait]
impl SignedUrlProvider for HttpSignedUrlProvider {
    async fn get_signed_url(&self, agent_id: &str) -> Result<String> {
        debug!(agent_id, "Requesting signed URL");
        let mut request = self
            .client
            .get(&self.endpoint)
            .query(&[("agent_id", agent_id)]);
        if let Some(api_key) = &self.api_key {
            request = request.header("xi-api-key", api_key.expose_secret());
        }

        let response: SignedUrlResponse = request
            .send()
            .await
            .context("Signed URL request failed")?
            .error_for_status()
            .context("Signed URL endpoint returned an error")?
            .json()
            .await
            .context("Failed to parse signed URL response")?;

        if response.signed_url.is_empty() {
            bail!("Signed URL endpoint returned an empty URL");
        }
        Ok(response.signed_url)
    }
}

/// Public agents need no signature; the URL is derived from the agent id.
pub struct PublicAgentUrl {
    conversation_url: String,
}

impl PublicAgentUrl {
    pub fn new(conversation_url: impl Into<String>) -> Self {
        Self {
            conversation_url: conversation_url.into(),
        }
    }
}

#[async_trait]
impl SignedUrlProvider for PublicAgentUrl {
    async fn get_signed_url(&self, agent_id: &str) -> Result<String> {
        Ok(format!("{}?agent_id={}", self.conversation_url, agent_id))
    }
}
