use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, InboxId, MessageId};

/// Placeholder used in a [`MessageKey`] when the transport gave no message id.
pub const MISSING_MESSAGE_ID: &str = "unknown";

/// Content-type tag carried by every inbound message.
///
/// Accepts bare tags (`text`) and qualified tags (`xmtp.org/text:1.0`);
/// anything unrecognised is kept verbatim in `Other`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ContentType {
    Text,
    Reply,
    Reaction,
    Attachment,
    ReadReceipt,
    Other(String),
}

impl ContentType {
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Text => "text",
            Self::Reply => "reply",
            Self::Reaction => "reaction",
            Self::Attachment => "attachment",
            Self::ReadReceipt => "read_receipt",
            Self::Other(tag) => tag,
        }
    }
}

impl From<&str> for ContentType {
    fn from(tag: &str) -> Self {
        if tag.eq_ignore_ascii_case("text/plain") {
            return Self::Text;
        }
        // authority/type:version
        let without_version = tag.split(':').next().unwrap_or(tag);
        let type_id = without_version.rsplit('/').next().unwrap_or(without_version);
        match type_id.to_ascii_lowercase().as_str() {
            "text" => Self::Text,
            "reply" => Self::Reply,
            "reaction" => Self::Reaction,
            "attachment" | "remotestaticattachment" => Self::Attachment,
            "read_receipt" | "readreceipt" => Self::ReadReceipt,
            _ => Self::Other(tag.to_string()),
        }
    }
}

impl From<String> for ContentType {
    fn from(tag: String) -> Self {
        Self::from(tag.as_str())
    }
}

impl From<ContentType> for String {
    fn from(ct: ContentType) -> Self {
        ct.as_str().to_string()
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded message body as handed over by the transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Structured(serde_json::Value),
}

impl MessageContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Structured(_) => None,
        }
    }
}

/// Item yielded by the transport's message stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub id: Option<MessageId>,
    pub sender_inbox_id: InboxId,
    pub conversation_id: ConversationId,
    pub content_type: ContentType,
    pub content: MessageContent,
    pub sent_at: DateTime<Utc>,
}

impl RawMessage {
    /// Plain-text message, the only kind the dispatcher forwards.
    pub fn text(
        id: Option<&str>,
        sender: &str,
        conversation: &str,
        content: &str,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.map(MessageId::from),
            sender_inbox_id: InboxId::from(sender),
            conversation_id: ConversationId::from(conversation),
            content_type: ContentType::Text,
            content: MessageContent::Text(content.to_string()),
            sent_at,
        }
    }

    pub fn key(&self) -> MessageKey {
        MessageKey::from_raw(self)
    }
}

/// Normalized message handed to the business handler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessedMessage {
    pub content: String,
    pub sender_inbox_id: InboxId,
    pub sender_address: String,
    pub conversation_id: ConversationId,
    pub message_id: Option<MessageId>,
    pub sent_at: DateTime<Utc>,
}

/// Deterministic identity of a delivery, used only for deduplication.
///
/// Message ids are not stable across every transport path, so the sender,
/// conversation and send timestamp are folded in as well.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageKey {
    message_id: String,
    sender: InboxId,
    conversation: ConversationId,
    sent_at_ms: i64,
}

impl MessageKey {
    pub fn from_raw(raw: &RawMessage) -> Self {
        Self {
            message_id: raw
                .id
                .as_ref()
                .map_or_else(|| MISSING_MESSAGE_ID.to_string(), |id| id.to_string()),
            sender: raw.sender_inbox_id.clone(),
            conversation: raw.conversation_id.clone(),
            sent_at_ms: raw.sent_at.timestamp_millis(),
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.message_id, self.sender, self.conversation, self.sent_at_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn content_type_parses_qualified_tags() {
        assert_eq!(ContentType::from("xmtp.org/text:1.0"), ContentType::Text);
        assert_eq!(ContentType::from("text/plain"), ContentType::Text);
        assert_eq!(ContentType::from("xmtp.org/reaction:1.0"), ContentType::Reaction);
        assert_eq!(ContentType::from("xmtp.org/readReceipt:1.0"), ContentType::ReadReceipt);
        assert_eq!(
            ContentType::from("example.com/poll:2.0"),
            ContentType::Other("example.com/poll:2.0".into())
        );
    }

    #[test]
    fn content_type_serde_uses_tag_strings() {
        let json = serde_json::to_string(&ContentType::Text).unwrap();
        assert_eq!(json, r#""text""#);
        let parsed: ContentType = serde_json::from_str(r#""xmtp.org/reply:1.0""#).unwrap();
        assert_eq!(parsed, ContentType::Reply);
    }

    #[test]
    fn message_content_untagged() {
        let text: MessageContent = serde_json::from_str(r#""hello""#).unwrap();
        assert_eq!(text.as_text(), Some("hello"));

        let structured: MessageContent = serde_json::from_str(r#"{"emoji":"👍"}"#).unwrap();
        assert_eq!(structured.as_text(), None);
    }

    #[test]
    fn key_uses_sentinel_when_id_missing() {
        let raw = RawMessage::text(None, "alice", "c1", "hi", at(1_000));
        assert_eq!(raw.key().to_string(), "unknown:alice:c1:1000");
    }

    #[test]
    fn identical_deliveries_share_a_key() {
        let a = RawMessage::text(Some("m1"), "alice", "c1", "hi", at(5));
        let b = RawMessage::text(Some("m1"), "alice", "c1", "hi again", at(5));
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn timestamp_distinguishes_keys() {
        let a = RawMessage::text(None, "alice", "c1", "hi", at(5));
        let b = RawMessage::text(None, "alice", "c1", "hi", at(6));
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn raw_message_json_shape() {
        let json = r#"{
            "sender_inbox_id": "bob",
            "conversation_id": "c9",
            "content_type": "xmtp.org/text:1.0",
            "content": "ping",
            "sent_at": "2025-01-01T00:00:00Z"
        }"#;
        let raw: RawMessage = serde_json::from_str(json).unwrap();
        assert!(raw.id.is_none());
        assert!(raw.content_type.is_text());
        assert_eq!(raw.content.as_text(), Some("ping"));
    }
}
