use super::ConversationDirectory;
use crate::backends::MessagingStore;
use crate::error::AppError;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkRead {
    Persisted,
    /// The store rejected the reset; the directory still shows zero.
    DisplayedOnly(AppError),
}

/// Zeroes the viewer's unread counter for the active conversation.
#[derive(Clone)]
pub struct ReadStateTracker {
    store: Arc<dyn MessagingStore>,
}

impl ReadStateTracker {
    pub fn new(store: Arc<dyn MessagingStore>) -> Self {
        Self { store }
    }

    pub async fn mark_read(
        &self,
        directory: &mut ConversationDirectory,
        conversation_id: Uuid,
    ) -> MarkRead {
        let viewer_id = directory.viewer().id;
        directory.set_unread(conversation_id, 0);

        match self.store.reset_unread(conversation_id, viewer_id).await {
            Ok(()) => {
                tracing::debug!(conversation_id = %conversation_id, "Marked conversation read");
                MarkRead::Persisted
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    conversation_id = %conversation_id,
                    viewer_id = %viewer_id,
                    "Failed to reset unread count"
                );
                MarkRead::DisplayedOnly(e)
            }
        }
    }
}
