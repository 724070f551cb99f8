//! REST client for the chat service. Covers the list/history/delta-sync
//! endpoints, media upload and the profile service.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use shared::protocol::{
    ConversationDto, MediaUploadRequest, MediaUploadResponse, MessageDto, ProfileDto, SyncResponse,
};

/// Generous timeout; slow mobile networks are the norm, not the exception.
pub const REST_TIMEOUT: Duration = Duration::from_secs(90);

/// Source of truth for participant profiles. [`ChatApi`] is the production
/// implementation; tests substitute their own.
#[async_trait]
pub trait ProfileService: Send + Sync {
    async fn fetch_profile(&self, user_id: &str) -> Result<ProfileDto>;
}

#[derive(Clone)]
pub struct ChatApi {
    client: Client,
    base_url: String,
}

impl ChatApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REST_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub async fn conversations(&self, user_id: &str) -> Result<Vec<ConversationDto>> {
        let url = format!("{}/api/chat/conversations", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("userId", user_id)])
            .send()
            .await
            .context("conversation list request failed")?
            .error_for_status()
            .context("conversation list request rejected")?;
        response
            .json()
            .await
            .context("invalid conversation list payload")
    }

    pub async fn history(&self, chat_id: &str, page: u32, size: u32) -> Result<Vec<MessageDto>> {
        let url = format!("{}/api/chat/history/{chat_id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("page", page), ("size", size)])
            .send()
            .await
            .context("history request failed")?
            .error_for_status()
            .context("history request rejected")?;
        response.json().await.context("invalid history payload")
    }

    /// Delta sync since the given ISO-8601 timestamp. An empty body means
    /// the server has nothing newer and decodes as the default response.
    pub async fn sync_since(&self, since: &str) -> Result<SyncResponse> {
        let url = format!("{}/api/chat/sync", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("since", since)])
            .send()
            .await
            .context("sync request failed")?
            .error_for_status()
            .context("sync request rejected")?;
        let body = response.bytes().await.context("failed to read sync body")?;
        if body.is_empty() {
            debug!("sync returned empty body, nothing to apply");
            return Ok(SyncResponse::default());
        }
        serde_json::from_slice(&body).context("invalid sync payload")
    }

    pub async fn upload_media(&self, request: &MediaUploadRequest) -> Result<MediaUploadResponse> {
        let url = format!("{}/api/chat/media/upload", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .context("media upload request failed")?
            .error_for_status()
            .context("media upload rejected")?;
        response.json().await.context("invalid media upload payload")
    }
}

#[async_trait]
impl ProfileService for ChatApi {
    async fn fetch_profile(&self, user_id: &str) -> Result<ProfileDto> {
        let url = format!("{}/api/profile/{user_id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("profile request failed")?
            .error_for_status()
            .context("profile request rejected")?;
        response.json().await.context("invalid profile payload")
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
