use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Namespace used in conversation keys.
pub const CHANNEL_NAMESPACE: &str = "wx849";

/// Who a message belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId {
    /// Chat the reply goes to: the peer's id in private chats, the room id in groups.
    pub chat_id: String,
    /// The account that actually wrote the message.
    pub sender_id: String,
    pub is_group: bool,
}

impl ConversationId {
    pub fn private(sender_id: &str) -> Self {
        Self {
            chat_id: sender_id.to_string(),
            sender_id: sender_id.to_string(),
            is_group: false,
        }
    }

    pub fn group(room_id: &str, sender_id: &str) -> Self {
        Self {
            chat_id: room_id.to_string(),
            sender_id: sender_id.to_string(),
            is_group: true,
        }
    }

    /// Session key for this conversation.
    ///
    /// Group members get their own context unless `shared_group` is set,
    /// in which case the whole room shares one.
    pub fn key(&self, shared_group: bool) -> String {
        if !self.is_group {
            format!("{CHANNEL_NAMESPACE}:{}", self.sender_id)
        } else if shared_group {
            format!("{CHANNEL_NAMESPACE}:{}", self.chat_id)
        } else {
            format!("{CHANNEL_NAMESPACE}:{}:{}", self.chat_id, self.sender_id)
        }
    }
}

/// Data-less content classification, used for config and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Text,
    Image,
    Voice,
    File,
    System,
    Unknown,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Voice => "voice",
            Self::File => "file",
            Self::System => "system",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image metadata carried by the protocol's `<img>` element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub aes_key: Option<String>,
    pub cdn_url: Option<String>,
    pub length: Option<u64>,
    pub md5: Option<String>,
}

/// Voice note metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceRef {
    pub url: Option<String>,
    /// Duration in milliseconds, when reported.
    pub duration_ms: Option<u64>,
}

/// File (or video) attachment metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    pub extension: Option<String>,
    pub size: Option<u64>,
    pub attach_id: Option<String>,
}

/// Canonical message content. Closed: anything unrecognised is `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Content {
    Text {
        text: String,
        /// Text of the message being quoted, for quote-replies.
        quote: Option<String>,
    },
    Image(ImageRef),
    Voice(VoiceRef),
    File(FileRef),
    System(String),
    Unknown {
        raw_type: i64,
    },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            quote: None,
        }
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Text { .. } => ContentKind::Text,
            Self::Image(_) => ContentKind::Image,
            Self::Voice(_) => ContentKind::Voice,
            Self::File(_) => ContentKind::File,
            Self::System(_) => ContentKind::System,
            Self::Unknown { .. } => ContentKind::Unknown,
        }
    }

    /// Text a prefix rule is matched against, and what the backend sees.
    ///
    /// Media has no user-written text, so it is described by a single
    /// bracketed line instead.
    pub fn as_prompt_text(&self) -> String {
        match self {
            Self::Text { text, .. } => text.clone(),
            Self::Image(_) => "[image]".to_string(),
            Self::Voice(v) => match v.duration_ms {
                Some(ms) => format!("[voice: {}s]", ms.div_ceil(1000)),
                None => "[voice]".to_string(),
            },
            Self::File(f) => format!("[file: {}]", f.name),
            Self::System(text) => text.clone(),
            Self::Unknown { raw_type } => format!("[unsupported message type {raw_type}]"),
        }
    }
}

/// An inbound chat event after normalization. Never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Protocol message id, used for dedup.
    pub id: String,
    pub conversation: ConversationId,
    pub content: Content,
    pub timestamp: DateTime<Utc>,
    /// Accounts `@`-mentioned in the message.
    #[serde(default)]
    pub mentions: Vec<String>,
    /// The raw event exactly as the protocol service delivered it.
    #[serde(skip)]
    pub raw: Arc<serde_json::Value>,
}

impl Message {
    pub fn kind(&self) -> ContentKind {
        self.content.kind()
    }

    /// First 60 characters of the content, for log lines.
    pub fn preview(&self) -> String {
        let text = self.content.as_prompt_text();
        if text.chars().count() > 60 {
            let truncated: String = text.chars().take(60).collect();
            format!("{truncated}...")
        } else {
            text
        }
    }
}

/// Acknowledgement that the protocol service accepted an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Id assigned by the service, when it reports one.
    pub message_id: Option<String>,
    /// How many attempts the send took.
    pub attempts: u32,
}

/// One conversational turn sent to the AI backend.
#[derive(Debug, Clone, Serialize)]
pub struct ConverseRequest {
    /// Session key of the conversation.
    pub conversation_key: String,
    /// Stable end-user identifier reported to the backend.
    pub user: String,
    pub text: String,
    pub persona: String,
    /// Backend-side conversation handle from the previous turn.
    pub history_ref: Option<String>,
}

/// The backend's answer to a `ConverseRequest`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    /// Handle to pass back on the next turn, if the backend keeps history.
    pub history_ref: Option<String>,
    pub model: Option<String>,
    pub latency_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_key() {
        let id = ConversationId::private("wxid_alice");
        assert_eq!(id.key(false), "wx849:wxid_alice");
        assert_eq!(id.key(true), "wx849:wxid_alice");
        assert_eq!(id.chat_id, "wxid_alice");
    }

    #[test]
    fn test_group_key_per_member_and_shared() {
        let id = ConversationId::group("123@chatroom", "wxid_bob");
        assert_eq!(id.key(false), "wx849:123@chatroom:wxid_bob");
        assert_eq!(id.key(true), "wx849:123@chatroom");
    }

    #[test]
    fn test_content_kind_and_prompt_text() {
        assert_eq!(Content::text("hi").kind(), ContentKind::Text);
        assert_eq!(Content::text("hi").as_prompt_text(), "hi");

        let file = Content::File(FileRef {
            name: "report.pdf".into(),
            ..Default::default()
        });
        assert_eq!(file.kind(), ContentKind::File);
        assert_eq!(file.as_prompt_text(), "[file: report.pdf]");

        let voice = Content::Voice(VoiceRef {
            url: None,
            duration_ms: Some(2500),
        });
        assert_eq!(voice.as_prompt_text(), "[voice: 3s]");
        assert_eq!(
            Content::Unknown { raw_type: 42 }.kind(),
            ContentKind::Unknown
        );
    }

    #[test]
    fn test_content_kind_serde_lowercase() {
        let kinds: Vec<ContentKind> = serde_json::from_str(r#"["image","voice"]"#).unwrap();
        assert_eq!(kinds, vec![ContentKind::Image, ContentKind::Voice]);
    }

    #[test]
    fn test_preview_truncates() {
        let msg = Message {
            id: "1".into(),
            conversation: ConversationId::private("a"),
            content: Content::text("x".repeat(100)),
            timestamp: Utc::now(),
            mentions: Vec::new(),
            raw: Arc::new(serde_json::Value::Null),
        };
        assert_eq!(msg.preview().chars().count(), 63);
        assert!(msg.preview().ends_with("..."));
    }
}
