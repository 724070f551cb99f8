use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Deterministic identifier for a two-party chat: the lexicographically
/// smaller participant id, an underscore, then the larger one. Commutative,
/// so both sides derive the same key without coordination.
pub fn conversation_key(a: &str, b: &str) -> String {
    if a < b {
        format!("{a}_{b}")
    } else {
        format!("{b}_{a}")
    }
}

/// Current UTC time as an ISO-8601 string with millisecond precision and a
/// literal `Z` suffix, matching the remote service's timestamp format.
/// Lexicographic order on these strings is chronological order.
pub fn iso_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
    Deleted,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "PENDING",
            MessageStatus::Sent => "SENT",
            MessageStatus::Delivered => "DELIVERED",
            MessageStatus::Read => "READ",
            MessageStatus::Failed => "FAILED",
            MessageStatus::Deleted => "DELETED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(MessageStatus::Pending),
            "SENT" => Some(MessageStatus::Sent),
            "DELIVERED" => Some(MessageStatus::Delivered),
            "READ" => Some(MessageStatus::Read),
            "FAILED" => Some(MessageStatus::Failed),
            "DELETED" => Some(MessageStatus::Deleted),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => 4,
            MessageStatus::Deleted => 5,
        }
    }

    /// Whether a message may move from `self` to `next`. Status only moves
    /// forward along Pending -> Sent -> Delivered -> Read; Failed is
    /// reachable from Pending only; Deleted is terminal.
    pub fn can_transition(&self, next: MessageStatus) -> bool {
        match (*self, next) {
            (current, n) if current == n => false,
            (MessageStatus::Pending, MessageStatus::Failed) => true,
            (_, MessageStatus::Failed) => false,
            (MessageStatus::Failed, _) => false,
            (MessageStatus::Deleted, _) => false,
            (_, MessageStatus::Deleted) => true,
            (current, n) => n.rank() > current.rank(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Video,
    Voice,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "TEXT",
            MessageKind::Image => "IMAGE",
            MessageKind::Video => "VIDEO",
            MessageKind::Voice => "VOICE",
            MessageKind::System => "SYSTEM",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "TEXT" => Some(MessageKind::Text),
            "IMAGE" => Some(MessageKind::Image),
            "VIDEO" => Some(MessageKind::Video),
            "VOICE" => Some(MessageKind::Voice),
            "SYSTEM" => Some(MessageKind::System),
            _ => None,
        }
    }
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
