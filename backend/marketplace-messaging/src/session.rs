//! The messaging view: directory, open conversation and composer wired to a
//! single change-feed subscription.
//!
//! States are `Closed` (directory only) and `Open(conversation)`. The feed
//! subscription lives exactly as long as the view and is released on
//! [`MessagingView::leave`] or drop.

use crate::error::{AppError, AppResult};
use crate::models::Message;
use crate::realtime::{FeedSubscription, MessageInserted};
use crate::services::{
    AttachmentUploader, Composer, ConversationDirectory, LocalFile, MarkRead, MessageStream,
    ReadStateTracker, StreamUpdate,
};
use crate::state::AppState;
use futures::StreamExt as _;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Closed,
    Open(Uuid),
}

/// One item received from the change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedItem {
    Event(MessageInserted),
    Error(AppError),
    Ended,
}

/// Result of dispatching one feed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEvent {
    /// New message merged into the open conversation, which was marked read.
    Merged {
        message_id: Uuid,
        update: StreamUpdate,
    },
    /// Event for the open conversation that was already shown.
    Duplicate { message_id: Uuid },
    /// Event for another conversation; the directory was reloaded.
    DirectoryRefreshed { conversation_id: Uuid },
    /// Reloading the directory failed; the previous list is still shown.
    DirectoryStale(AppError),
    /// The feed reported an error. It is not retried.
    FeedError(AppError),
    /// The feed ended. Unread counts now only update on navigation.
    FeedEnded,
}

pub struct MessagingView {
    state: AppState,
    directory: ConversationDirectory,
    stream: Option<MessageStream>,
    tracker: ReadStateTracker,
    composer: Composer,
    subscription: Option<FeedSubscription>,
}

impl MessagingView {
    /// Check the session, subscribe to the feed and load the directory.
    ///
    /// A failed subscription does not prevent entering; the view then only
    /// refreshes on navigation.
    pub async fn enter(state: AppState) -> AppResult<Self> {
        let viewer = state
            .identity
            .current_viewer()
            .await?
            .ok_or(AppError::AuthenticationRequired)?;

        let subscription = match state.feed.subscribe().await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                tracing::warn!(error = %e, viewer_id = %viewer.id, "Change feed unavailable");
                None
            }
        };

        // Dropping `subscription` on this error path releases it.
        let directory =
            ConversationDirectory::load(state.identity.clone(), state.store.clone()).await?;

        let uploader = AttachmentUploader::new(state.objects.clone(), state.attachment_max_bytes);
        let composer = Composer::new(state.identity.clone(), state.store.clone(), uploader);
        let tracker = ReadStateTracker::new(state.store.clone());

        tracing::info!(
            viewer_id = %viewer.id,
            conversations = directory.entries().len(),
            live = subscription.is_some(),
            "Entered messaging view"
        );

        Ok(Self {
            state,
            directory,
            stream: None,
            tracker,
            composer,
            subscription,
        })
    }

    pub fn state(&self) -> ViewState {
        match &self.stream {
            Some(stream) => ViewState::Open(stream.conversation_id()),
            None => ViewState::Closed,
        }
    }

    pub fn open_conversation(&self) -> Option<Uuid> {
        self.stream.as_ref().map(MessageStream::conversation_id)
    }

    pub fn directory(&self) -> &ConversationDirectory {
        &self.directory
    }

    /// Messages of the open conversation; empty when closed.
    pub fn messages(&self) -> &[Message] {
        match &self.stream {
            Some(stream) => stream.messages(),
            None => &[],
        }
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub fn composer_mut(&mut self) -> &mut Composer {
        &mut self.composer
    }

    pub fn is_live(&self) -> bool {
        self.subscription.is_some()
    }

    /// Open `conversation_id`, replacing any open conversation, and mark it
    /// read. On failure the previous state is kept.
    pub async fn select(&mut self, conversation_id: Uuid) -> AppResult<&[Message]> {
        let known = self
            .directory
            .get(conversation_id)
            .map(|c| c.other_user.clone())
            .ok_or(AppError::NotFound)?;

        let stream =
            MessageStream::open(self.state.store.clone(), conversation_id, [known]).await?;
        self.stream = Some(stream);
        self.tracker
            .mark_read(&mut self.directory, conversation_id)
            .await;

        Ok(self.messages())
    }

    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            tracing::debug!(conversation_id = %stream.conversation_id(), "Closed conversation");
        }
    }

    /// Reload the directory and, if a conversation is open, re-fetch its
    /// history. Used on navigation when the feed is down.
    pub async fn refresh(&mut self) -> AppResult<()> {
        self.directory.refresh().await?;
        if let Some(stream) = self.stream.as_mut() {
            let conversation_id = stream.conversation_id();
            if stream.resync().await? > 0 {
                self.tracker
                    .mark_read(&mut self.directory, conversation_id)
                    .await;
            }
        }
        Ok(())
    }

    pub async fn send(&self, text: &str) -> AppResult<Message> {
        self.composer.send(self.open_conversation(), text).await
    }

    pub async fn submit_draft(&mut self) -> AppResult<Message> {
        let conversation = self.open_conversation();
        self.composer.submit_draft(conversation).await
    }

    pub async fn attach(&self, files: &[LocalFile]) -> AppResult<Vec<Message>> {
        self.composer.attach(self.open_conversation(), files).await
    }

    /// Take the next item off the feed without applying it. Cancel-safe:
    /// dropping the future loses nothing, so it can sit in a `select!` next
    /// to other input. `None` once there is no subscription left.
    pub async fn recv_event(&mut self) -> Option<FeedItem> {
        let item = self.subscription.as_mut()?.next().await;
        Some(match item {
            Some(Ok(event)) => FeedItem::Event(event),
            Some(Err(e)) => FeedItem::Error(e),
            None => FeedItem::Ended,
        })
    }

    /// Apply an item from [`recv_event`](Self::recv_event). Must run to
    /// completion once the item has been received.
    pub async fn apply(&mut self, item: FeedItem) -> ViewEvent {
        match item {
            FeedItem::Event(event) => self.dispatch(event).await,
            FeedItem::Error(e) => {
                tracing::warn!(error = %e, "Change feed error");
                ViewEvent::FeedError(e)
            }
            FeedItem::Ended => {
                tracing::warn!("Change feed ended");
                self.subscription = None;
                ViewEvent::FeedEnded
            }
        }
    }

    /// Receive and apply one feed item. Not cancel-safe; loops that race the
    /// feed against other input use `recv_event` and `apply` instead.
    pub async fn next_event(&mut self) -> Option<ViewEvent> {
        let item = self.recv_event().await?;
        Some(self.apply(item).await)
    }

    /// Hand one insert event to the stream and the directory.
    pub async fn dispatch(&mut self, event: MessageInserted) -> ViewEvent {
        let open = self.open_conversation();
        let message_id = event.message.id;
        let conversation_id = event.conversation_id();

        let update = match self.stream.as_mut() {
            Some(stream) => stream.on_insert(&event).await,
            None => StreamUpdate::OtherConversation,
        };

        let directory_result = self.directory.on_insert(&event, open).await;

        if update.is_new() {
            if let MarkRead::DisplayedOnly(e) = self
                .tracker
                .mark_read(&mut self.directory, conversation_id)
                .await
            {
                tracing::debug!(error = %e, "Unread reset not persisted");
            }
        }

        if let Err(e) = directory_result {
            tracing::warn!(
                error = %e,
                conversation_id = %conversation_id,
                "Failed to refresh conversation directory"
            );
            return ViewEvent::DirectoryStale(e);
        }

        match update {
            StreamUpdate::Appended | StreamUpdate::Inserted { .. } => {
                ViewEvent::Merged { message_id, update }
            }
            StreamUpdate::Duplicate => ViewEvent::Duplicate { message_id },
            StreamUpdate::OtherConversation => ViewEvent::DirectoryRefreshed { conversation_id },
        }
    }

    /// Leave the view, releasing the feed subscription.
    pub fn leave(mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        tracing::info!(viewer_id = %self.directory.viewer().id, "Left messaging view");
    }
}
