//! ============================================================================
//! Messaging Client - Chat platform API
//! ============================================================================
//! Outbound side of the bot:
//! - Reply to an inbound event (single-use reply token)
//! - Push to a user or group
//! - Look up a user's display name
//! - Download an image message to local storage
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Messaging API base URL
const LINE_API: &str = "https://api.line.me/v2/bot";

/// Content (media) API base URL
const LINE_DATA_API: &str = "https://api-data.line.me/v2/bot";

/// Upper bound on any single platform call
const REQUEST_TIMEOUT_SECS: u64 = 15;

/// One outbound chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Image {
        original_content_url: String,
        preview_image_url: String,
    },
    #[serde(rename_all = "camelCase")]
    Flex {
        alt_text: String,
        contents: serde_json::Value,
    },
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        OutboundMessage::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        let url = url.into();
        OutboundMessage::Image {
            original_content_url: url.clone(),
            preview_image_url: url,
        }
    }
}

/// Chat platform operations the bot depends on
#[async_trait]
pub trait MessagingClient: Send + Sync {
    async fn reply(&self, reply_token: &str, messages: &[OutboundMessage]) -> Result<()>;

    async fn push(&self, destination: &str, messages: &[OutboundMessage]) -> Result<()>;

    /// Display name of a user
    async fn get_profile(&self, user_id: &str) -> Result<String>;

    /// Save an image message under `dir`, returning the file path
    async fn download_media(&self, message_id: &str, dir: &Path) -> Result<PathBuf>;
}

/// reqwest-backed client for the LINE Messaging API
pub struct LineClient {
    client: reqwest::Client,
    access_token: String,
    api_base: String,
    data_base: String,
}

impl LineClient {
    /// Create a new LineClient with a channel access token
    pub fn new(access_token: String) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("tambun-bot/1.0")
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            access_token,
            api_base: LINE_API.to_string(),
            data_base: LINE_DATA_API.to_string(),
        }
    }

    /// Point the client at another host (staging or a local fake)
    pub fn with_base_urls(mut self, api_base: &str, data_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.data_base = data_base.trim_end_matches('/').to_string();
        self
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    async fn post_messages<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> Result<()> {
        let url = format!("{}/message/{}", self.api_base, endpoint);

        let response = self
            .client
            .post(&url)
            .header("Authorization", self.bearer())
            .header("Content-Type", "application/json; charset=utf-8")
            .json(body)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to call {}: {}", endpoint, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Messaging API error on {} ({}): {}", endpoint, status, error_text));
        }
        Ok(())
    }
}

#[async_trait]
impl MessagingClient for LineClient {
    async fn reply(&self, reply_token: &str, messages: &[OutboundMessage]) -> Result<()> {
        debug!("Replying with {} message(s)", messages.len());
        let request = ReplyRequest { reply_token, messages };
        self.post_messages("reply", &request).await
    }

    async fn push(&self, destination: &str, messages: &[OutboundMessage]) -> Result<()> {
        info!("Pushing {} message(s) to {}", messages.len(), destination);
        let request = PushRequest { to: destination, messages };
        self.post_messages("push", &request).await
    }

    async fn get_profile(&self, user_id: &str) -> Result<String> {
        let url = format!("{}/profile/{}", self.api_base, user_id);

        let response = self
            .client
            .get(&url)
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(|e| anyhow!("Failed to fetch profile: {}", e))?;

        if !response.status().is_success() {
            return Err(anyhow!("Profile lookup failed ({})", response.status()));
        }

        let profile: ProfileResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse profile: {}", e))?;

        Ok(profile.display_name)
    }

    async fn download_media(&self, message_id: &str, dir: &Path) -> Result<PathBuf> {
        let url = format!("{}/message/{}/content", self.data_base, message_id);

        let response = self
            .client
            .get(&url)
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(|e| anyhow!("Failed to download message content: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(anyhow!("Content download failed for {} ({})", message_id, status));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| anyhow!("Failed to read message content: {}", e))?;

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| anyhow!("Failed to create directory: {}", e))?;
        let path = dir.join(format!("{}.jpg", message_id));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| anyhow!("Failed to save image: {}", e))?;

        info!("Saved {} bytes of message {} to {}", bytes.len(), message_id, path.display());
        Ok(path)
    }
}

// ============================================================================
// Messaging API Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplyRequest<'a> {
    reply_token: &'a str,
    messages: &'a [OutboundMessage],
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    to: &'a str,
    messages: &'a [OutboundMessage],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    display_name: String,
}
