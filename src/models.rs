use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Suffix carried by every locally generated message id.
pub const TEMP_ID_SUFFIX: &str = "-local";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub failed_to_send: bool,
    /// Temporary id of the local entry this server message was sent as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<String>,
}

impl Message {
    pub fn is_temporary(&self) -> bool {
        is_temporary_id(&self.id)
    }
}

pub fn is_temporary_id(id: &str) -> bool {
    id.ends_with(TEMP_ID_SUFFIX)
}

/// What gets transmitted when the user submits text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub text: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub client_temp_id: String,
}

impl From<&Message> for OutgoingMessage {
    fn from(message: &Message) -> Self {
        OutgoingMessage {
            text: message.text.clone(),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            client_temp_id: message.id.clone(),
        }
    }
}

/// Acknowledgment for one transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendAck {
    pub fn ok() -> Self {
        SendAck { success: true, error: None }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        SendAck { success: false, error: Some(reason.into()) }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DeliveryStatus {
    Sending,   // Rendered locally, waiting for the acknowledgment
    Sent,      // Acknowledged, waiting for the broadcast echo
    Confirmed, // Carries a server id
    Failed,    // Rejected or timed out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastMessagePreview {
    pub message_id: String,
    pub sender_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Set while the preview is an optimistic patch.
    #[serde(default)]
    pub pending: bool,
}

impl LastMessagePreview {
    pub fn pending_from(message: &Message) -> Self {
        LastMessagePreview {
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            text: message.text.clone(),
            created_at: message.created_at,
            pending: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    #[serde(default)]
    pub last_message: Option<LastMessagePreview>,
}

/// One page of the cursor-paginated conversation list.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConversationPage {
    pub conversations: Vec<ConversationSummary>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// One page of message history, newest first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}
