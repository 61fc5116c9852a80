//! Seams to the external platform: identity, relational store, object store.
//!
//! Each trait has a production adapter and [`memory::MemoryBackend`], which
//! implements all of them (plus the change feed) in process.

use crate::error::AppResult;
use crate::models::{Conversation, Message, NewMessage, Profile, Viewer};
use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

pub mod identity;
pub mod memory;
pub mod postgres;
pub mod s3;

pub use identity::{JwtIdentity, StaticIdentity};
pub use memory::MemoryBackend;
pub use postgres::PgMessagingStore;
pub use s3::S3ObjectStore;

/// Session lookup. `Ok(None)` means nobody is signed in.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_viewer(&self) -> AppResult<Option<Viewer>>;
}

#[async_trait]
pub trait MessagingStore: Send + Sync {
    /// Conversations involving `viewer_id`, most recently updated first.
    async fn list_conversations(&self, viewer_id: Uuid) -> AppResult<Vec<Conversation>>;

    /// Full history, ascending by `created_at` then id.
    async fn fetch_messages(&self, conversation_id: Uuid) -> AppResult<Vec<Message>>;

    /// Insert a message, bump every other participant's unread counter and
    /// the conversation's `updated_at`, then notify the change feed.
    async fn insert_message(&self, message: NewMessage) -> AppResult<Message>;

    /// Set the viewer's unread counter for the conversation to zero.
    async fn reset_unread(&self, conversation_id: Uuid, viewer_id: Uuid) -> AppResult<()>;

    async fn fetch_profile(&self, user_id: Uuid) -> AppResult<Option<Profile>>;

    /// Conversation for an accepted application; created on first call and
    /// returned unchanged afterwards.
    async fn find_or_create_conversation(
        &self,
        job_id: Uuid,
        client_id: Uuid,
        freelancer_id: Uuid,
    ) -> AppResult<Uuid>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> AppResult<()>;

    /// Stable public URL for a stored key.
    fn public_url(&self, key: &str) -> String;
}
