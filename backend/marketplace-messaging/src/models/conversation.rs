use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Display identity of a marketplace participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub id: Uuid,
    pub title: String,
}

/// Snapshot of the most recent message, shown as the directory preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A conversation as seen by one viewer.
///
/// `other_user` and `unread_count` are relative to that viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub job: JobRef,
    /// Participant who posted the job and accepted the application.
    pub client_id: Uuid,
    pub freelancer_id: Uuid,
    pub other_user: Profile,
    pub last_message: Option<LastMessage>,
    pub unread_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Directory order: most recently updated first, ties by id.
    pub fn directory_order(a: &Conversation, b: &Conversation) -> std::cmp::Ordering {
        b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id))
    }
}
