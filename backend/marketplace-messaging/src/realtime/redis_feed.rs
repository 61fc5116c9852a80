//! Redis Streams-backed change feed.
//!
//! Stores append one entry per committed message to a single fan-out stream;
//! each subscription runs a blocking `XREAD` listener that forwards parsed
//! entries to its channel until the subscription is released.

use super::{ChangeFeed, FeedPublisher, FeedSubscription, MessageInserted};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;
use tokio::time::{self, Duration};

pub const FEED_STREAM_KEY: &str = "stream:messages:inserted";

/// Approximate cap on retained feed entries.
const FEED_MAXLEN: usize = 50_000;
const BLOCK_MS: usize = 5_000;

#[derive(Clone)]
pub struct RedisChangeFeed {
    client: Client,
    publisher: ConnectionManager,
    batch_size: usize,
}

impl RedisChangeFeed {
    pub async fn connect(url: &str, batch_size: usize) -> AppResult<Self> {
        let client = Client::open(url)
            .map_err(|e| AppError::Config(format!("invalid REDIS_URL: {e}")))?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            publisher,
            batch_size: batch_size.max(1),
        })
    }
}

#[async_trait]
impl FeedPublisher for RedisChangeFeed {
    async fn publish(&self, event: &MessageInserted) -> AppResult<()> {
        let payload = event.to_json()?;
        let conversation_id = event.conversation_id().to_string();
        let mut conn = self.publisher.clone();

        let entry_id: String = conn
            .xadd_maxlen(
                FEED_STREAM_KEY,
                StreamMaxlen::Approx(FEED_MAXLEN),
                "*",
                &[
                    ("conversation_id", conversation_id.as_str()),
                    ("payload", payload.as_str()),
                ],
            )
            .await?;

        tracing::debug!(
            entry_id = %entry_id,
            message_id = %event.message.id,
            conversation_id = %conversation_id,
            "published message insert"
        );
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for RedisChangeFeed {
    async fn subscribe(&self) -> AppResult<FeedSubscription> {
        let mut conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| AppError::Subscription(format!("connect: {e}")))?;

        // Start after the newest existing entry so only new inserts are seen.
        let latest: StreamRangeReply = conn
            .xrevrange_count(FEED_STREAM_KEY, "+", "-", 1)
            .await
            .map_err(|e| AppError::Subscription(format!("read stream head: {e}")))?;
        let start_id = latest
            .ids
            .first()
            .map(|entry| entry.id.clone())
            .unwrap_or_else(|| "0-0".to_string());

        let (tx, rx) = mpsc::channel(self.batch_size * 2);
        let handle = tokio::spawn(listen(conn, tx, start_id, self.batch_size));

        Ok(FeedSubscription::new("redis", rx, move || handle.abort()))
    }
}

/// Errors the listener rides out: block timeouts and dropped connections.
fn is_transient(e: &redis::RedisError) -> bool {
    e.is_timeout() || e.kind() == redis::ErrorKind::IoError
}

async fn listen(
    mut conn: ConnectionManager,
    tx: mpsc::Sender<AppResult<MessageInserted>>,
    mut last_id: String,
    batch_size: usize,
) {
    let options = StreamReadOptions::default()
        .block(BLOCK_MS)
        .count(batch_size);

    loop {
        let read: redis::RedisResult<Option<StreamReadReply>> = conn
            .xread_options(&[FEED_STREAM_KEY], &[last_id.as_str()], &options)
            .await;

        match read {
            Ok(Some(reply)) => {
                for stream in reply.keys {
                    for entry in stream.ids {
                        last_id = entry.id.clone();
                        let event = match entry.get::<String>("payload") {
                            Some(payload) => MessageInserted::from_json(&payload),
                            None => Err(AppError::Subscription(format!(
                                "feed entry {} has no payload",
                                entry.id
                            ))),
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
            // Block timeout with no new entries.
            Ok(None) => {}
            // The connection manager reconnects underneath; keep the same cursor.
            Err(e) if is_transient(&e) => {
                time::sleep(Duration::from_millis(100)).await;
            }
            // Reported once, then the feed ends; the view falls back to refresh.
            Err(e) => {
                tracing::error!(error = %e, "change feed listener stopped");
                let _ = tx
                    .send(Err(AppError::Subscription(e.to_string())))
                    .await;
                return;
            }
        }

        if tx.is_closed() {
            return;
        }
    }
}
