use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::domain::{MessageKind, MessageStatus};

/// Per-user topics delivered over the socket. The server routes each as a
/// `{topic, payload}` envelope; payload shapes are the DTOs below.
pub const TOPIC_MESSAGES: &str = "/user/queue/messages";
pub const TOPIC_READ_RECEIPTS: &str = "/user/queue/read-receipt";
pub const TOPIC_PRESENCE: &str = "/user/queue/presence";
pub const TOPIC_TYPING: &str = "/user/queue/typing";
pub const TOPIC_CONVERSATIONS: &str = "/user/queue/conversations";
pub const TOPIC_STATUS_UPDATES: &str = "/user/queue/status-updates";

pub const ALL_TOPICS: [&str; 6] = [
    TOPIC_MESSAGES,
    TOPIC_READ_RECEIPTS,
    TOPIC_PRESENCE,
    TOPIC_TYPING,
    TOPIC_CONVERSATIONS,
    TOPIC_STATUS_UPDATES,
];

/// Application destinations for client publishes.
pub const DEST_SEND: &str = "/app/chat.send";
pub const DEST_TYPING: &str = "/app/chat.typing";
pub const DEST_DELIVERED: &str = "/app/chat.delivered";
pub const DEST_READ: &str = "/app/chat.read";
pub const DEST_HEARTBEAT: &str = "/app/chat.heartbeat";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    pub content: String,
    pub timestamp: String,
    pub status: MessageStatus,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LastMessageDto {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

fn default_participant_name() -> String {
    "User".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantDto {
    pub user_id: String,
    #[serde(default = "default_participant_name")]
    pub name: String,
    #[serde(default)]
    pub profile_picture_url: Option<String>,
}

impl ParticipantDto {
    pub fn placeholder(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: default_participant_name(),
            profile_picture_url: None,
        }
    }
}

/// The list endpoint is inconsistent about participant encoding: some
/// deployments return bare id strings, others full objects. Accept both.
fn deserialize_participants<'de, D>(deserializer: D) -> Result<Vec<ParticipantDto>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<Value>::deserialize(deserializer)?;
    let mut participants = Vec::with_capacity(raw.len());
    for element in raw {
        match element {
            Value::String(user_id) => participants.push(ParticipantDto::placeholder(user_id)),
            other => {
                if let Ok(dto) = serde_json::from_value::<ParticipantDto>(other) {
                    participants.push(dto);
                }
            }
        }
    }
    Ok(participants)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDto {
    pub chat_id: String,
    #[serde(default, deserialize_with = "deserialize_participants")]
    pub participants: Vec<ParticipantDto>,
    #[serde(default)]
    pub last_message: Option<LastMessageDto>,
    #[serde(default)]
    pub unread_counts: HashMap<String, i64>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationUpdateDto {
    pub chat_id: String,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_timestamp: Option<String>,
    #[serde(default)]
    pub unread_counts: HashMap<String, i64>,
    #[serde(default)]
    pub participants: Option<Vec<ParticipantDto>>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingDto {
    pub sender_id: String,
    pub recipient_id: String,
    pub is_typing: bool,
}

/// Outbound typing notification; the server fills in the sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSendDto {
    pub recipient_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdateDto {
    pub message_id: String,
    pub chat_id: String,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptDto {
    pub message_id: String,
    pub sender_id: String,
}

/// Delivered/read acknowledgment published to `/app/chat.delivered` or
/// `/app/chat.read`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckDto {
    pub message_id: String,
    pub sender_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceDto {
    pub user_id: String,
    pub status: String,
}

impl PresenceDto {
    pub fn is_online(&self) -> bool {
        self.status.eq_ignore_ascii_case("ONLINE")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    #[serde(default)]
    pub messages: Vec<MessageDto>,
    #[serde(default)]
    pub status_updates: Vec<StatusUpdateDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDto {
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub profile_picture_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaUploadRequest {
    pub data: String,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaUploadResponse {
    pub url: String,
}

/// Envelope for inbound socket frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    pub topic: String,
    pub payload: Value,
}

/// Subscription request sent once per topic after the socket opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeFrame {
    pub subscribe: String,
}

/// Client publish to an application destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendFrame {
    pub destination: String,
    pub payload: Value,
}

/// Every event kind the socket can deliver, decoded at the transport
/// boundary. `Unknown` keeps the pipeline alive when the server ships new
/// topics this client does not understand yet.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Message(MessageDto),
    ConversationUpdate(ConversationUpdateDto),
    StatusUpdate(StatusUpdateDto),
    ReadReceipt(ReadReceiptDto),
    Presence(PresenceDto),
    Typing(TypingDto),
    Unknown { topic: String },
}

impl ChatEvent {
    pub fn decode(topic: &str, payload: Value) -> Result<Self, serde_json::Error> {
        Ok(match topic {
            TOPIC_MESSAGES => ChatEvent::Message(serde_json::from_value(payload)?),
            TOPIC_CONVERSATIONS => ChatEvent::ConversationUpdate(serde_json::from_value(payload)?),
            TOPIC_STATUS_UPDATES => ChatEvent::StatusUpdate(serde_json::from_value(payload)?),
            TOPIC_READ_RECEIPTS => ChatEvent::ReadReceipt(serde_json::from_value(payload)?),
            TOPIC_PRESENCE => ChatEvent::Presence(serde_json::from_value(payload)?),
            TOPIC_TYPING => ChatEvent::Typing(serde_json::from_value(payload)?),
            other => ChatEvent::Unknown {
                topic: other.to_string(),
            },
        })
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
