use crate::backends::{IdentityProvider, MessagingStore};
use crate::error::{AppError, AppResult};
use crate::models::{Conversation, LastMessage, Message, Viewer};
use crate::realtime::MessageInserted;
use std::sync::Arc;
use uuid::Uuid;

/// How the directory reacted to an insert event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryUpdate {
    /// Only the in-memory preview of the open conversation was touched.
    Patched,
    /// The list was reloaded from the store.
    Refreshed,
}

/// The viewer's conversation list, ordered most recently updated first.
pub struct ConversationDirectory {
    identity: Arc<dyn IdentityProvider>,
    store: Arc<dyn MessagingStore>,
    viewer: Viewer,
    conversations: Vec<Conversation>,
}

async fn require_viewer(identity: &dyn IdentityProvider) -> AppResult<Viewer> {
    identity
        .current_viewer()
        .await?
        .ok_or(AppError::AuthenticationRequired)
}

impl ConversationDirectory {
    pub async fn load(
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn MessagingStore>,
    ) -> AppResult<Self> {
        let viewer = require_viewer(identity.as_ref()).await?;
        let conversations = store.list_conversations(viewer.id).await?;

        tracing::info!(
            viewer_id = %viewer.id,
            count = conversations.len(),
            "Loaded conversation directory"
        );

        Ok(Self {
            identity,
            store,
            viewer,
            conversations,
        })
    }

    /// Reload the list. The session is checked again; a signed-out viewer
    /// gets `AuthenticationRequired` and the current list is kept.
    pub async fn refresh(&mut self) -> AppResult<()> {
        let viewer = require_viewer(self.identity.as_ref()).await?;
        let conversations = self.store.list_conversations(viewer.id).await?;

        tracing::debug!(
            viewer_id = %viewer.id,
            count = conversations.len(),
            "Refreshed conversation directory"
        );

        self.viewer = viewer;
        self.conversations = conversations;
        Ok(())
    }

    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    pub fn entries(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, conversation_id: Uuid) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == conversation_id)
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations
            .iter()
            .map(|c| c.unread_count)
            .fold(0u32, u32::saturating_add)
    }

    /// Returns `false` when the conversation is not in the list.
    pub fn set_unread(&mut self, conversation_id: Uuid, count: u32) -> bool {
        match self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            Some(conversation) => {
                conversation.unread_count = count;
                true
            }
            None => false,
        }
    }

    /// Move `message` into its conversation's preview if it is newer than the
    /// current one, keeping the list ordered.
    pub fn record_preview(&mut self, message: &Message) -> bool {
        let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == message.conversation_id)
        else {
            return false;
        };

        let newer = conversation
            .last_message
            .as_ref()
            .map_or(true, |last| message.created_at >= last.created_at);
        if newer {
            conversation.last_message = Some(LastMessage {
                content: message.content.clone(),
                created_at: message.created_at,
            });
        }
        if message.created_at > conversation.updated_at {
            conversation.updated_at = message.created_at;
        }

        self.conversations.sort_by(Conversation::directory_order);
        true
    }

    /// Directory side of the feed: the open conversation is patched in
    /// memory, anything else triggers a reload so unread counts and
    /// previews come from the store.
    pub async fn on_insert(
        &mut self,
        event: &MessageInserted,
        open_conversation: Option<Uuid>,
    ) -> AppResult<DirectoryUpdate> {
        let conversation_id = event.conversation_id();
        if open_conversation == Some(conversation_id) && self.record_preview(&event.message) {
            return Ok(DirectoryUpdate::Patched);
        }

        self.refresh().await?;
        Ok(DirectoryUpdate::Refreshed)
    }

    /// Open (or find) the conversation for an accepted application. The
    /// viewer must be one of the two parties.
    pub async fn start_for_application(
        &mut self,
        client_id: Uuid,
        freelancer_id: Uuid,
        job_id: Uuid,
    ) -> AppResult<Uuid> {
        let viewer = require_viewer(self.identity.as_ref()).await?;
        if viewer.id != client_id && viewer.id != freelancer_id {
            return Err(AppError::Forbidden);
        }

        let conversation_id = self
            .store
            .find_or_create_conversation(job_id, client_id, freelancer_id)
            .await?;

        tracing::info!(
            conversation_id = %conversation_id,
            job_id = %job_id,
            "Conversation ready for accepted application"
        );

        self.refresh().await?;
        Ok(conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::{MemoryBackend, Operation};
    use crate::backends::StaticIdentity;
    use crate::models::NewMessage;

    struct Fixture {
        backend: MemoryBackend,
        viewer: Uuid,
        other: Uuid,
        job: Uuid,
    }

    fn fixture() -> Fixture {
        let backend = MemoryBackend::new();
        let viewer = backend.add_profile("Viv", None);
        let other = backend.add_profile("Otto", None);
        let job = backend.add_job("Landing page");
        Fixture {
            backend,
            viewer,
            other,
            job,
        }
    }

    async fn directory(f: &Fixture) -> ConversationDirectory {
        ConversationDirectory::load(
            Arc::new(StaticIdentity::signed_in(f.viewer)),
            Arc::new(f.backend.clone()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_load_requires_session() {
        let f = fixture();
        let result = ConversationDirectory::load(
            Arc::new(StaticIdentity::anonymous()),
            Arc::new(f.backend.clone()),
        )
        .await;
        assert!(matches!(result, Err(AppError::AuthenticationRequired)));
    }

    #[tokio::test]
    async fn test_load_fetch_failure_is_surfaced() {
        let f = fixture();
        f.backend.set_failing(Operation::ListConversations, true);
        let result = ConversationDirectory::load(
            Arc::new(StaticIdentity::signed_in(f.viewer)),
            Arc::new(f.backend.clone()),
        )
        .await;
        assert!(matches!(result, Err(AppError::Fetch(_))));
    }

    #[tokio::test]
    async fn test_entries_are_newest_first_with_other_party() {
        let f = fixture();
        let third = f.backend.add_profile("Tess", None);
        let older = f
            .backend
            .find_or_create_conversation(f.job, f.viewer, f.other)
            .await
            .unwrap();
        let newer = f
            .backend
            .find_or_create_conversation(f.job, f.viewer, third)
            .await
            .unwrap();

        let dir = directory(&f).await;
        let ids: Vec<Uuid> = dir.entries().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![newer, older]);
        assert_eq!(dir.get(older).unwrap().other_user.name, "Otto");

        f.backend
            .insert_message(NewMessage::text(older, f.other, "ping"))
            .await
            .unwrap();
        let mut dir = dir;
        dir.refresh().await.unwrap();
        assert_eq!(dir.entries()[0].id, older);
        assert_eq!(dir.total_unread(), 1);
    }

    #[tokio::test]
    async fn test_on_insert_patches_open_and_refreshes_others() {
        let f = fixture();
        let conversation = f
            .backend
            .find_or_create_conversation(f.job, f.viewer, f.other)
            .await
            .unwrap();
        let mut dir = directory(&f).await;

        let message = f
            .backend
            .insert_message(NewMessage::text(conversation, f.other, "hello"))
            .await
            .unwrap();
        let event = MessageInserted::new(message);

        let update = dir.on_insert(&event, Some(conversation)).await.unwrap();
        assert_eq!(update, DirectoryUpdate::Patched);
        let entry = dir.get(conversation).unwrap();
        assert_eq!(entry.last_message.as_ref().unwrap().content, "hello");
        assert_eq!(entry.unread_count, 0);

        let update = dir.on_insert(&event, None).await.unwrap();
        assert_eq!(update, DirectoryUpdate::Refreshed);
        assert_eq!(dir.get(conversation).unwrap().unread_count, 1);
    }

    #[tokio::test]
    async fn test_start_for_application_is_idempotent() {
        let f = fixture();
        let mut dir = directory(&f).await;
        assert!(dir.entries().is_empty());

        let first = dir
            .start_for_application(f.viewer, f.other, f.job)
            .await
            .unwrap();
        let second = dir
            .start_for_application(f.viewer, f.other, f.job)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(dir.entries().len(), 1);

        let stranger = f.backend.add_profile("Sam", None);
        let result = dir.start_for_application(stranger, f.other, f.job).await;
        assert!(matches!(result, Err(AppError::Forbidden)));
    }

    #[tokio::test]
    async fn test_set_unread_unknown_conversation() {
        let f = fixture();
        let mut dir = directory(&f).await;
        assert!(!dir.set_unread(Uuid::new_v4(), 0));
    }
}
