//! In-process backend implementing the store, the object store and the
//! change feed. Used by the integration tests and for local runs without
//! PostgreSQL/Redis/S3.

use super::{MessagingStore, ObjectStore};
use crate::error::{AppError, AppResult};
use crate::models::{Conversation, JobRef, LastMessage, Message, NewMessage, Profile};
use crate::realtime::{ChangeFeed, FeedSubscription, MessageInserted};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

const FEED_CAPACITY: usize = 256;

/// Operations that can be made to fail, to exercise error paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListConversations,
    FetchMessages,
    InsertMessage,
    ResetUnread,
    FetchProfile,
    PutObject,
    Subscribe,
}

#[derive(Debug, Clone)]
struct ConversationRecord {
    id: Uuid,
    job_id: Uuid,
    client_id: Uuid,
    freelancer_id: Uuid,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: String,
}

#[derive(Default)]
struct State {
    profiles: HashMap<Uuid, Profile>,
    jobs: HashMap<Uuid, JobRef>,
    conversations: HashMap<Uuid, ConversationRecord>,
    unread: HashMap<(Uuid, Uuid), u32>,
    messages: Vec<Message>,
    objects: HashMap<String, StoredObject>,
    failing: HashSet<Operation>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl State {
    fn check(&self, op: Operation) -> AppResult<()> {
        if !self.failing.contains(&op) {
            return Ok(());
        }
        let reason = format!("injected failure: {op:?}");
        Err(match op {
            Operation::PutObject => AppError::Upload(reason),
            Operation::Subscribe => AppError::Subscription(reason),
            _ => AppError::Fetch(reason),
        })
    }

    /// Strictly increasing timestamps keep ordering deterministic.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }
}

#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    feed: broadcast::Sender<MessageInserted>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            feed,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_profile(&self, name: &str, avatar_url: Option<&str>) -> Uuid {
        let id = Uuid::new_v4();
        self.state().profiles.insert(
            id,
            Profile {
                id,
                name: name.to_string(),
                avatar_url: avatar_url.map(str::to_string),
            },
        );
        id
    }

    pub fn add_job(&self, title: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.state().jobs.insert(
            id,
            JobRef {
                id,
                title: title.to_string(),
            },
        );
        id
    }

    pub fn set_failing(&self, op: Operation, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing.insert(op);
        } else {
            state.failing.remove(&op);
        }
    }

    pub fn set_unread(&self, conversation_id: Uuid, user_id: Uuid, count: u32) {
        self.state().unread.insert((conversation_id, user_id), count);
    }

    pub fn unread_for(&self, conversation_id: Uuid, user_id: Uuid) -> Option<u32> {
        self.state().unread.get(&(conversation_id, user_id)).copied()
    }

    pub fn message_count(&self, conversation_id: Uuid) -> usize {
        self.state()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .count()
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.state().objects.get(key).cloned()
    }

    pub fn object_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Push an event straight onto the feed, bypassing the store. Lets tests
    /// replay duplicates or deliver events out of order.
    pub fn publish_raw(&self, event: MessageInserted) {
        // No receivers is fine.
        let _ = self.feed.send(event);
    }
}

#[async_trait]
impl MessagingStore for MemoryBackend {
    async fn list_conversations(&self, viewer_id: Uuid) -> AppResult<Vec<Conversation>> {
        let state = self.state();
        state.check(Operation::ListConversations)?;

        let mut conversations = Vec::new();
        for record in state.conversations.values() {
            let Some(unread) = state.unread.get(&(record.id, viewer_id)) else {
                continue;
            };
            let other_id = if record.client_id == viewer_id {
                record.freelancer_id
            } else {
                record.client_id
            };
            let other_user = state
                .profiles
                .get(&other_id)
                .cloned()
                .ok_or_else(|| AppError::Fetch(format!("profile {other_id} missing")))?;
            let job = state
                .jobs
                .get(&record.job_id)
                .cloned()
                .ok_or_else(|| AppError::Fetch(format!("job {} missing", record.job_id)))?;
            let last_message = state
                .messages
                .iter()
                .filter(|m| m.conversation_id == record.id)
                .max_by_key(|m| m.ordering_key())
                .map(|m| LastMessage {
                    content: m.content.clone(),
                    created_at: m.created_at,
                });

            conversations.push(Conversation {
                id: record.id,
                job,
                client_id: record.client_id,
                freelancer_id: record.freelancer_id,
                other_user,
                last_message,
                unread_count: *unread,
                updated_at: record.updated_at,
            });
        }

        conversations.sort_by(Conversation::directory_order);
        Ok(conversations)
    }

    async fn fetch_messages(&self, conversation_id: Uuid) -> AppResult<Vec<Message>> {
        let state = self.state();
        state.check(Operation::FetchMessages)?;

        let mut messages: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .map(|mut m| {
                m.sender = state.profiles.get(&m.sender_id).cloned();
                m
            })
            .collect();
        messages.sort_by_key(Message::ordering_key);
        Ok(messages)
    }

    async fn insert_message(&self, message: NewMessage) -> AppResult<Message> {
        let inserted = {
            let mut state = self.state();
            state.check(Operation::InsertMessage)?;

            if !state
                .unread
                .contains_key(&(message.conversation_id, message.sender_id))
            {
                return Err(AppError::Forbidden);
            }

            let created_at = state.next_timestamp();
            let inserted = Message {
                id: Uuid::new_v4(),
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                sender: None,
                content: message.content,
                attachments: message.attachments,
                created_at,
            };
            state.messages.push(inserted.clone());

            for ((conversation_id, user_id), count) in state.unread.iter_mut() {
                if *conversation_id == message.conversation_id && *user_id != message.sender_id {
                    *count += 1;
                }
            }
            if let Some(record) = state.conversations.get_mut(&message.conversation_id) {
                record.updated_at = created_at;
            }
            inserted
        };

        self.publish_raw(MessageInserted::new(inserted.clone()));
        Ok(inserted)
    }

    async fn reset_unread(&self, conversation_id: Uuid, viewer_id: Uuid) -> AppResult<()> {
        let mut state = self.state();
        state.check(Operation::ResetUnread)?;

        match state.unread.get_mut(&(conversation_id, viewer_id)) {
            Some(count) => {
                *count = 0;
                Ok(())
            }
            None => Err(AppError::NotFound),
        }
    }

    async fn fetch_profile(&self, user_id: Uuid) -> AppResult<Option<Profile>> {
        let state = self.state();
        state.check(Operation::FetchProfile)?;
        Ok(state.profiles.get(&user_id).cloned())
    }

    async fn find_or_create_conversation(
        &self,
        job_id: Uuid,
        client_id: Uuid,
        freelancer_id: Uuid,
    ) -> AppResult<Uuid> {
        if client_id == freelancer_id {
            return Err(AppError::Validation(
                "a conversation needs two different participants".into(),
            ));
        }

        let mut state = self.state();
        if let Some(existing) = state.conversations.values().find(|c| {
            c.job_id == job_id && c.client_id == client_id && c.freelancer_id == freelancer_id
        }) {
            return Ok(existing.id);
        }

        let id = Uuid::new_v4();
        let updated_at = state.next_timestamp();
        state.conversations.insert(
            id,
            ConversationRecord {
                id,
                job_id,
                client_id,
                freelancer_id,
                updated_at,
            },
        );
        state.unread.insert((id, client_id), 0);
        state.unread.insert((id, freelancer_id), 0);
        Ok(id)
    }
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> AppResult<()> {
        let mut state = self.state();
        state.check(Operation::PutObject)?;
        state.objects.insert(
            key.to_string(),
            StoredObject {
                body,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("memory://message-attachments/{key}")
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(&self) -> AppResult<FeedSubscription> {
        self.state().check(Operation::Subscribe)?;

        let mut source = self.feed.subscribe();
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let handle = tokio::spawn(async move {
            loop {
                let item = match source.recv().await {
                    Ok(event) => Ok(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => Err(
                        AppError::Subscription(format!("feed lagged, {skipped} events dropped")),
                    ),
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        Ok(FeedSubscription::new("memory", rx, move || handle.abort()))
    }
}
