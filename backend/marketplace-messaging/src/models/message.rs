use super::{Attachment, Profile};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable message row. Ordered by `created_at` ascending within its
/// conversation, ties broken by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    /// Resolved display identity of the sender, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Profile>,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn ordering_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}

/// Row submitted by the composer; id and timestamp are assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub attachments: Vec<Attachment>,
}

impl NewMessage {
    pub fn text(conversation_id: Uuid, sender_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            sender_id,
            content: content.into(),
            attachments: Vec::new(),
        }
    }
}
