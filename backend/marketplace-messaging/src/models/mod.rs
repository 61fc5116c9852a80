pub mod attachment;
pub mod conversation;
pub mod message;

pub use attachment::Attachment;
pub use conversation::{Conversation, JobRef, LastMessage, Profile};
pub use message::{Message, NewMessage};

/// Authenticated user the messaging view is rendered for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub id: uuid::Uuid,
    pub email: Option<String>,
}
