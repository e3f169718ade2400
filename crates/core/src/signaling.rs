use anyhow::Result;
use async_trait::async_trait;

/// Issues capability URLs for agent sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignedUrlProvider: Send + Sync {
    /// Returns the socket URL for one conversation with `agent_id`.
    async fn get_signed_url(&self, agent_id: &str) -> Result<String>;
}
