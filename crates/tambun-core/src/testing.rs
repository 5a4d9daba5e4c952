//! Test doubles shared by the unit tests.

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::messaging::{MessagingClient, OutboundMessage};

type Sent = Vec<(String, Vec<OutboundMessage>)>;

/// Records every outbound call instead of talking to the platform
#[derive(Default)]
pub struct RecordingMessenger {
    pub replies: Mutex<Sent>,
    pub pushes: Mutex<Sent>,
    pub downloads: AtomicUsize,
    pub fail_profile: bool,
    /// Holds every push this long, like a slow platform API
    pub push_delay: Option<Duration>,
}

impl RecordingMessenger {
    pub fn replies(&self) -> Sent {
        self.replies.lock().unwrap().clone()
    }

    pub fn pushes(&self) -> Sent {
        self.pushes.lock().unwrap().clone()
    }

    pub fn reply_count(&self) -> usize {
        self.replies.lock().unwrap().len()
    }

    pub fn last_reply(&self) -> Vec<OutboundMessage> {
        self.replies().last().map(|(_, m)| m.clone()).unwrap_or_default()
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessagingClient for RecordingMessenger {
    async fn reply(&self, reply_token: &str, messages: &[OutboundMessage]) -> Result<()> {
        self.replies
            .lock()
            .unwrap()
            .push((reply_token.to_string(), messages.to_vec()));
        Ok(())
    }

    async fn push(&self, destination: &str, messages: &[OutboundMessage]) -> Result<()> {
        if let Some(delay) = self.push_delay {
            tokio::time::sleep(delay).await;
        }
        self.pushes
            .lock()
            .unwrap()
            .push((destination.to_string(), messages.to_vec()));
        Ok(())
    }

    async fn get_profile(&self, _user_id: &str) -> Result<String> {
        if self.fail_profile {
            anyhow::bail!("profile service down");
        }
        Ok("Somchai".to_string())
    }

    async fn download_media(&self, message_id: &str, dir: &Path) -> Result<PathBuf> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(dir.join(format!("{}.jpg", message_id)))
    }
}
