// Feed delivery under slow stores, feed errors and failed directory reloads.

use async_trait::async_trait;
use marketplace_messaging::backends::memory::{MemoryBackend, Operation};
use marketplace_messaging::backends::{MessagingStore, StaticIdentity};
use marketplace_messaging::error::{AppError, AppResult};
use marketplace_messaging::models::{Conversation, Message, NewMessage, Profile};
use marketplace_messaging::realtime::MessageInserted;
use marketplace_messaging::session::{MessagingView, ViewEvent};
use marketplace_messaging::state::AppState;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Store whose profile lookups take longer than the caller's other input.
struct SlowProfiles {
    inner: MemoryBackend,
    delay: Duration,
}

#[async_trait]
impl MessagingStore for SlowProfiles {
    async fn list_conversations(&self, viewer_id: Uuid) -> AppResult<Vec<Conversation>> {
        self.inner.list_conversations(viewer_id).await
    }

    async fn fetch_messages(&self, conversation_id: Uuid) -> AppResult<Vec<Message>> {
        self.inner.fetch_messages(conversation_id).await
    }

    async fn insert_message(&self, message: NewMessage) -> AppResult<Message> {
        self.inner.insert_message(message).await
    }

    async fn reset_unread(&self, conversation_id: Uuid, viewer_id: Uuid) -> AppResult<()> {
        self.inner.reset_unread(conversation_id, viewer_id).await
    }

    async fn fetch_profile(&self, user_id: Uuid) -> AppResult<Option<Profile>> {
        tokio::time::sleep(self.delay).await;
        self.inner.fetch_profile(user_id).await
    }

    async fn find_or_create_conversation(
        &self,
        job_id: Uuid,
        client_id: Uuid,
        freelancer_id: Uuid,
    ) -> AppResult<Uuid> {
        self.inner
            .find_or_create_conversation(job_id, client_id, freelancer_id)
            .await
    }
}

struct Fixture {
    backend: MemoryBackend,
    viewer: Uuid,
    counterpart: Uuid,
    conversation: Uuid,
}

async fn fixture() -> Fixture {
    let backend = MemoryBackend::new();
    let viewer = backend.add_profile("Vera Freelancer", None);
    let counterpart = backend.add_profile("Acme Client", None);
    let job = backend.add_job("Brand refresh");
    let conversation = backend
        .find_or_create_conversation(job, counterpart, viewer)
        .await
        .unwrap();
    Fixture {
        backend,
        viewer,
        counterpart,
        conversation,
    }
}

fn state_for(f: &Fixture) -> AppState {
    AppState::in_memory(
        f.backend.clone(),
        Arc::new(StaticIdentity::signed_in(f.viewer)),
    )
}

#[tokio::test]
async fn test_event_survives_losing_a_race_with_other_input() {
    let f = fixture().await;
    let mut state = state_for(&f);
    state.store = Arc::new(SlowProfiles {
        inner: f.backend.clone(),
        delay: Duration::from_millis(200),
    });

    let mut view = MessagingView::enter(state).await.unwrap();
    view.select(f.conversation).await.unwrap();

    // The viewer's own profile is not cached, so applying this insert waits
    // on the slow lookup.
    let sent = view.send("Draft attached").await.unwrap();

    let mut other_input = 0;
    let applied = loop {
        tokio::select! {
            Some(item) = view.recv_event(), if view.is_live() => {
                break view.apply(item).await;
            }
            _ = tokio::time::sleep(Duration::from_millis(20)) => {
                other_input += 1;
                assert!(other_input < 50, "feed event never arrived");
            }
        }
    };

    assert!(matches!(
        applied,
        ViewEvent::Merged { message_id, .. } if message_id == sent.id
    ));
    assert_eq!(view.messages().len(), 1);
    assert_eq!(
        view.messages()[0].sender.as_ref().unwrap().name,
        "Vera Freelancer"
    );
}

#[tokio::test]
async fn test_cancelled_receive_keeps_event_queued() {
    let f = fixture().await;
    let mut view = MessagingView::enter(state_for(&f)).await.unwrap();
    view.select(f.conversation).await.unwrap();

    // Nothing queued yet: the timer wins and the receive is dropped.
    tokio::select! {
        _ = view.recv_event() => panic!("no event was published"),
        _ = tokio::time::sleep(Duration::from_millis(10)) => {}
    }

    let message = f
        .backend
        .insert_message(NewMessage::text(f.conversation, f.counterpart, "still here?"))
        .await
        .unwrap();
    assert!(matches!(
        view.next_event().await.unwrap(),
        ViewEvent::Merged { message_id, .. } if message_id == message.id
    ));
}

#[tokio::test]
async fn test_lagging_feed_reports_error_and_stays_live() {
    let f = fixture().await;
    let mut view = MessagingView::enter(state_for(&f)).await.unwrap();

    // More than the feed buffers before the subscriber gets to run.
    let template = f
        .backend
        .insert_message(NewMessage::text(f.conversation, f.counterpart, "burst"))
        .await
        .unwrap();
    for _ in 0..400 {
        let mut message = template.clone();
        message.id = Uuid::new_v4();
        f.backend.publish_raw(MessageInserted::new(message));
    }

    let event = view.next_event().await.unwrap();
    assert!(matches!(
        event,
        ViewEvent::FeedError(AppError::Subscription(ref reason)) if reason.contains("lagged")
    ));
    assert!(view.is_live());

    // Later events still arrive.
    assert!(matches!(
        view.next_event().await.unwrap(),
        ViewEvent::DirectoryRefreshed { conversation_id } if conversation_id == f.conversation
    ));
}

#[tokio::test]
async fn test_failed_directory_reload_keeps_previous_entries() {
    let f = fixture().await;
    let mut view = MessagingView::enter(state_for(&f)).await.unwrap();
    let before: Vec<Conversation> = view.directory().entries().to_vec();

    f.backend.set_failing(Operation::ListConversations, true);
    f.backend
        .insert_message(NewMessage::text(f.conversation, f.counterpart, "hello?"))
        .await
        .unwrap();

    let event = view.next_event().await.unwrap();
    assert!(matches!(event, ViewEvent::DirectoryStale(AppError::Fetch(_))));
    assert_eq!(view.directory().entries(), before.as_slice());
    assert!(view.is_live());
}
