//! Realtime change feed for message insertions.
//!
//! A [`FeedSubscription`] is an owned resource: it yields a lazy, infinite,
//! non-restartable sequence of [`MessageInserted`] events and releases the
//! underlying listener when it is dropped or explicitly unsubscribed.

use crate::error::AppResult;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use uuid::Uuid;

pub mod events;
pub mod redis_feed;

pub use events::MessageInserted;
pub use redis_feed::RedisChangeFeed;

/// Source of insert events for the messages collection.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self) -> AppResult<FeedSubscription>;
}

/// Producer side of the feed, called by stores after a message commit.
#[async_trait]
pub trait FeedPublisher: Send + Sync {
    async fn publish(&self, event: &MessageInserted) -> AppResult<()>;
}

type Release = Box<dyn FnOnce() + Send>;

pub struct FeedSubscription {
    id: Uuid,
    source: &'static str,
    events: mpsc::Receiver<AppResult<MessageInserted>>,
    release: Option<Release>,
}

impl FeedSubscription {
    /// `release` runs exactly once, on `unsubscribe` or drop.
    pub fn new(
        source: &'static str,
        events: mpsc::Receiver<AppResult<MessageInserted>>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        let id = Uuid::new_v4();
        tracing::debug!(subscription_id = %id, source, "feed subscription acquired");
        Self {
            id,
            source,
            events,
            release: Some(Box::new(release)),
        }
    }

    /// Wait for the next event. `None` means the feed ended and will not
    /// produce anything again.
    pub async fn next_event(&mut self) -> Option<AppResult<MessageInserted>> {
        self.events.recv().await
    }

    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }

    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            self.events.close();
            release();
            tracing::debug!(subscription_id = %self.id, source = self.source, "feed subscription released");
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl Stream for FeedSubscription {
    type Item = AppResult<MessageInserted>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_release_runs_once_on_unsubscribe() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let (_tx, rx) = mpsc::channel(1);
        let subscription = FeedSubscription::new("test", rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(subscription.is_active());
        subscription.unsubscribe();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_runs_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let (_tx, rx) = mpsc::channel(1);
        {
            let _subscription = FeedSubscription::new("test", rx, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscription_is_a_stream() {
        use futures::StreamExt;

        let (tx, rx) = mpsc::channel(2);
        let subscription = FeedSubscription::new("test", rx, || {});
        tx.send(Err(AppError::Subscription("lagged".into())))
            .await
            .unwrap();
        drop(tx);

        let items: Vec<_> = subscription.collect().await;
        assert_eq!(items, vec![Err(AppError::Subscription("lagged".into()))]);
    }

    #[tokio::test]
    async fn test_ended_feed_stays_ended() {
        let (tx, rx) = mpsc::channel(1);
        let mut subscription = FeedSubscription::new("test", rx, || {});
        drop(tx);
        assert!(subscription.next_event().await.is_none());
        assert!(subscription.next_event().await.is_none());
    }
}
