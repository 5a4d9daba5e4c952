//! ============================================================================
//! Inbound Events - Webhook envelope parsing
//! ============================================================================
//! Turns the platform's webhook JSON into typed `InboundEvent`s and checks
//! the request signature. Only the fields the bot reacts to are modelled.
//! ============================================================================

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tracing::warn;

use crate::types::{ConversationKey, ConversationType};

/// Header carrying the base64 HMAC-SHA256 of the request body
pub const SIGNATURE_HEADER: &str = "x-line-signature";

/// Who sent an event and in which conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSource {
    pub user_id: String,
    pub conversation_type: ConversationType,
    pub conversation_id: String,
}

impl EventSource {
    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(&self.user_id, &self.conversation_id)
    }
}

/// Button actions carried in postback data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostbackAction {
    SelectProject { project_id: Option<String> },
    ConfirmDonation { donation_id: Option<String> },
    Unknown(String),
}

impl PostbackAction {
    /// Parse form-encoded postback data (`action=...&project_id=...`)
    pub fn parse(data: &str) -> Self {
        let mut action = None;
        let mut project_id = None;
        let mut donation_id = None;
        for (k, v) in url::form_urlencoded::parse(data.as_bytes()) {
            let value = Some(v.into_owned()).filter(|s| !s.is_empty());
            match k.as_ref() {
                "action" => action = value,
                "project_id" => project_id = value,
                "donation_id" => donation_id = value,
                _ => {}
            }
        }

        match action.as_deref() {
            Some("select_project") => PostbackAction::SelectProject { project_id },
            Some("confirm_donation") => PostbackAction::ConfirmDonation { donation_id },
            _ => PostbackAction::Unknown(data.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Text { message_id: String, text: String },
    Image { message_id: String },
    Postback(PostbackAction),
    /// Stickers, follows, joins... acknowledged and ignored
    Unsupported(String),
}

/// One event the state machine consumes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Envelope id, stable across platform redeliveries
    pub event_id: Option<String>,
    pub is_redelivery: bool,
    pub reply_token: Option<String>,
    pub source: EventSource,
    pub kind: EventKind,
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    #[serde(default)]
    #[allow(dead_code)]
    destination: Option<String>,
    /// Decoded one at a time so a bad event never takes its siblings down
    #[serde(default)]
    events: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    webhook_event_id: Option<String>,
    #[serde(default)]
    delivery_context: Option<DeliveryContext>,
    #[serde(default)]
    reply_token: Option<String>,
    #[serde(default)]
    source: Option<RawSource>,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    postback: Option<RawPostback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeliveryContext {
    #[serde(default)]
    is_redelivery: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSource {
    #[serde(rename = "type")]
    source_type: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    group_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    message_type: String,
    id: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPostback {
    data: String,
}

impl RawSource {
    fn into_source(self) -> EventSource {
        let user_id = self.user_id.unwrap_or_default();
        match (self.source_type.as_str(), self.group_id) {
            ("group", Some(group_id)) => EventSource {
                user_id,
                conversation_type: ConversationType::Group,
                conversation_id: group_id,
            },
            // Direct chats and rooms are keyed by the user
            _ => EventSource {
                conversation_id: user_id.clone(),
                user_id,
                conversation_type: ConversationType::Direct,
            },
        }
    }
}

impl RawEvent {
    fn into_event(self) -> InboundEvent {
        let kind = match (self.event_type.as_str(), self.message, self.postback) {
            ("message", Some(message), _) => match message.message_type.as_str() {
                "text" => EventKind::Text {
                    message_id: message.id,
                    text: message.text.unwrap_or_default(),
                },
                "image" => EventKind::Image { message_id: message.id },
                other => EventKind::Unsupported(format!("message:{}", other)),
            },
            ("postback", _, Some(postback)) => EventKind::Postback(PostbackAction::parse(&postback.data)),
            (other, _, _) => EventKind::Unsupported(other.to_string()),
        };

        let source = self
            .source
            .map(RawSource::into_source)
            .unwrap_or_else(|| EventSource {
                user_id: String::new(),
                conversation_type: ConversationType::Direct,
                conversation_id: String::new(),
            });

        InboundEvent {
            event_id: self.webhook_event_id.filter(|id| !id.is_empty()),
            is_redelivery: self.delivery_context.map(|d| d.is_redelivery).unwrap_or(false),
            reply_token: self.reply_token.filter(|t| !t.trim().is_empty()),
            source,
            kind,
        }
    }
}

/// Parse a webhook request body into events. Only an unreadable envelope
/// is an error; malformed events inside it are logged and skipped.
pub fn parse_webhook(body: &[u8]) -> Result<Vec<InboundEvent>> {
    let envelope: WebhookEnvelope = serde_json::from_slice(body)
        .map_err(|e| anyhow!("Failed to parse webhook body: {}", e))?;

    let mut events = Vec::with_capacity(envelope.events.len());
    for (index, raw) in envelope.events.into_iter().enumerate() {
        match serde_json::from_value::<RawEvent>(raw) {
            Ok(event) => events.push(event.into_event()),
            Err(e) => warn!("Skipping malformed webhook event #{}: {}", index, e),
        }
    }
    Ok(events)
}

// ============================================================================
// Signature Verification
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// base64(HMAC-SHA256(channel_secret, body))
pub fn sign_body(channel_secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(channel_secret.as_bytes())
        .map_err(|e| anyhow!("HMAC init failed: {}", e))?;
    mac.update(body);
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Check the signature header against the body, in constant time
pub fn verify_signature(channel_secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = STANDARD.decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(channel_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
