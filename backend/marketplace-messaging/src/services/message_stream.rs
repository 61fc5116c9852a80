//! History of the open conversation, kept current from the change feed.
//!
//! The sequence is ordered by `(created_at, id)` and holds each message id at
//! most once, whatever order or multiplicity the feed delivers in.

use crate::backends::MessagingStore;
use crate::error::AppResult;
use crate::models::{Message, Profile};
use crate::realtime::MessageInserted;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamUpdate {
    /// Added at the tail.
    Appended,
    /// Arrived late and was placed before newer messages.
    Inserted { position: usize },
    /// Already present; ignored.
    Duplicate,
    /// Belongs to another conversation.
    OtherConversation,
}

impl StreamUpdate {
    pub fn is_new(&self) -> bool {
        matches!(self, StreamUpdate::Appended | StreamUpdate::Inserted { .. })
    }
}

pub struct MessageStream {
    store: Arc<dyn MessagingStore>,
    conversation_id: Uuid,
    messages: Vec<Message>,
    seen: HashSet<Uuid>,
    profiles: HashMap<Uuid, Profile>,
}

impl MessageStream {
    /// Load the full history. `known` seeds the sender cache, typically with
    /// the counterpart from the directory entry.
    pub async fn open(
        store: Arc<dyn MessagingStore>,
        conversation_id: Uuid,
        known: impl IntoIterator<Item = Profile>,
    ) -> AppResult<Self> {
        let history = store.fetch_messages(conversation_id).await?;

        let mut stream = Self {
            store,
            conversation_id,
            messages: Vec::with_capacity(history.len()),
            seen: HashSet::with_capacity(history.len()),
            profiles: known.into_iter().map(|p| (p.id, p)).collect(),
        };
        for message in history {
            stream.merge(message);
        }

        tracing::info!(
            conversation_id = %conversation_id,
            count = stream.messages.len(),
            "Opened message stream"
        );
        Ok(stream)
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, message_id: Uuid) -> bool {
        self.seen.contains(&message_id)
    }

    /// Insert `message` at its ordered position unless its id is known.
    pub fn merge(&mut self, message: Message) -> StreamUpdate {
        if message.conversation_id != self.conversation_id {
            return StreamUpdate::OtherConversation;
        }
        if !self.seen.insert(message.id) {
            return StreamUpdate::Duplicate;
        }
        if let Some(sender) = &message.sender {
            self.profiles
                .entry(sender.id)
                .or_insert_with(|| sender.clone());
        }

        let key = message.ordering_key();
        let position = self.messages.partition_point(|m| m.ordering_key() <= key);
        if position == self.messages.len() {
            self.messages.push(message);
            StreamUpdate::Appended
        } else {
            self.messages.insert(position, message);
            StreamUpdate::Inserted { position }
        }
    }

    /// Stream side of the feed. Feed rows carry no sender display data, so
    /// it is filled in from the cache or the store before merging.
    pub async fn on_insert(&mut self, event: &MessageInserted) -> StreamUpdate {
        if event.conversation_id() != self.conversation_id {
            return StreamUpdate::OtherConversation;
        }
        if self.contains(event.message.id) {
            tracing::debug!(message_id = %event.message.id, "Dropped duplicate feed event");
            return StreamUpdate::Duplicate;
        }

        let mut message = event.message.clone();
        if message.sender.is_none() {
            message.sender = self.resolve_sender(message.sender_id).await;
        }
        self.merge(message)
    }

    /// Re-fetch history and merge whatever the feed missed. Returns the
    /// number of messages added.
    pub async fn resync(&mut self) -> AppResult<usize> {
        let history = self.store.fetch_messages(self.conversation_id).await?;
        let added = history
            .into_iter()
            .map(|m| self.merge(m))
            .filter(StreamUpdate::is_new)
            .count();

        if added > 0 {
            tracing::info!(
                conversation_id = %self.conversation_id,
                added,
                "Resync recovered messages"
            );
        }
        Ok(added)
    }

    async fn resolve_sender(&mut self, sender_id: Uuid) -> Option<Profile> {
        if let Some(profile) = self.profiles.get(&sender_id) {
            return Some(profile.clone());
        }

        match self.store.fetch_profile(sender_id).await {
            Ok(Some(profile)) => {
                self.profiles.insert(sender_id, profile.clone());
                Some(profile)
            }
            Ok(None) => {
                tracing::warn!(sender_id = %sender_id, "Sender has no profile");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, sender_id = %sender_id, "Failed to resolve sender");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::{MemoryBackend, Operation};
    use crate::models::NewMessage;
    use chrono::{Duration, Utc};

    async fn seeded() -> (MemoryBackend, Uuid, Uuid, Uuid) {
        let backend = MemoryBackend::new();
        let client = backend.add_profile("Cleo", None);
        let freelancer = backend.add_profile("Finn", None);
        let job = backend.add_job("Illustration");
        let conversation = backend
            .find_or_create_conversation(job, client, freelancer)
            .await
            .unwrap();
        (backend, conversation, client, freelancer)
    }

    fn message_at(conversation_id: Uuid, sender_id: Uuid, offset_ms: i64) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            sender: None,
            content: format!("at {offset_ms}"),
            attachments: Vec::new(),
            created_at: Utc::now() + Duration::milliseconds(offset_ms),
        }
    }

    #[tokio::test]
    async fn test_open_loads_history_in_order() {
        let (backend, conversation, client, freelancer) = seeded().await;
        for (sender, text) in [(client, "one"), (freelancer, "two"), (client, "three")] {
            backend
                .insert_message(NewMessage::text(conversation, sender, text))
                .await
                .unwrap();
        }

        let stream = MessageStream::open(Arc::new(backend), conversation, [])
            .await
            .unwrap();
        let contents: Vec<&str> = stream.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
        assert!(stream
            .messages()
            .windows(2)
            .all(|w| w[0].created_at <= w[1].created_at));
        assert_eq!(stream.messages()[1].sender.as_ref().unwrap().name, "Finn");
    }

    #[tokio::test]
    async fn test_merge_drops_duplicates_and_orders_late_events() {
        let (backend, conversation, client, _) = seeded().await;
        let mut stream = MessageStream::open(Arc::new(backend), conversation, [])
            .await
            .unwrap();

        let early = message_at(conversation, client, 0);
        let late = message_at(conversation, client, 10);

        assert_eq!(stream.merge(late.clone()), StreamUpdate::Appended);
        assert_eq!(
            stream.merge(early.clone()),
            StreamUpdate::Inserted { position: 0 }
        );
        assert_eq!(stream.merge(late.clone()), StreamUpdate::Duplicate);
        assert_eq!(stream.len(), 2);
        assert_eq!(stream.messages()[0].id, early.id);
        assert_eq!(stream.messages()[1].id, late.id);
    }

    #[tokio::test]
    async fn test_on_insert_resolves_unknown_sender() {
        let (backend, conversation, _, freelancer) = seeded().await;
        let mut stream = MessageStream::open(Arc::new(backend), conversation, [])
            .await
            .unwrap();

        let event = MessageInserted::new(message_at(conversation, freelancer, 0));
        assert_eq!(stream.on_insert(&event).await, StreamUpdate::Appended);
        assert_eq!(stream.messages()[0].sender.as_ref().unwrap().name, "Finn");

        let other = MessageInserted::new(message_at(Uuid::new_v4(), freelancer, 0));
        assert_eq!(
            stream.on_insert(&other).await,
            StreamUpdate::OtherConversation
        );
    }

    #[tokio::test]
    async fn test_profile_lookup_failure_leaves_sender_empty() {
        let (backend, conversation, _, freelancer) = seeded().await;
        let mut stream = MessageStream::open(Arc::new(backend.clone()), conversation, [])
            .await
            .unwrap();
        backend.set_failing(Operation::FetchProfile, true);

        let event = MessageInserted::new(message_at(conversation, freelancer, 0));
        assert!(stream.on_insert(&event).await.is_new());
        assert!(stream.messages()[0].sender.is_none());
    }

    #[tokio::test]
    async fn test_resync_recovers_missed_messages() {
        let (backend, conversation, client, _) = seeded().await;
        let mut stream = MessageStream::open(Arc::new(backend.clone()), conversation, [])
            .await
            .unwrap();

        backend
            .insert_message(NewMessage::text(conversation, client, "missed"))
            .await
            .unwrap();
        assert_eq!(stream.resync().await.unwrap(), 1);
        assert_eq!(stream.resync().await.unwrap(), 0);
        assert_eq!(stream.messages()[0].content, "missed");
    }
}
