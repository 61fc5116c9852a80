//! PostgreSQL store (tokio-postgres + deadpool).
//!
//! Rows are mapped with `try_get` so a malformed row becomes a `Fetch` error
//! instead of a panic.

use super::MessagingStore;
use crate::error::{AppError, AppResult};
use crate::models::{
    Attachment, Conversation, JobRef, LastMessage, Message, NewMessage, Profile,
};
use crate::realtime::{FeedPublisher, MessageInserted};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio_postgres::Row;
use uuid::Uuid;

#[derive(Clone)]
pub struct PgMessagingStore {
    db: Pool,
    publisher: Option<Arc<dyn FeedPublisher>>,
}

impl PgMessagingStore {
    pub fn new(db: Pool) -> Self {
        Self {
            db,
            publisher: None,
        }
    }

    /// Publish committed inserts to the given feed.
    pub fn with_publisher(mut self, publisher: Arc<dyn FeedPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }
}

fn column<'a, T>(row: &'a Row, name: &str) -> AppResult<T>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get(name)
        .map_err(|e| AppError::Fetch(format!("column {name}: {e}")))
}

fn unread_from_db(raw: i32) -> AppResult<u32> {
    u32::try_from(raw).map_err(|_| AppError::Fetch(format!("negative unread_count {raw}")))
}

pub(crate) fn conversation_from_row(row: &Row) -> AppResult<Conversation> {
    let last_content: Option<String> = column(row, "last_content")?;
    let last_created_at: Option<DateTime<Utc>> = column(row, "last_created_at")?;
    let last_message = match (last_content, last_created_at) {
        (Some(content), Some(created_at)) => Some(LastMessage {
            content,
            created_at,
        }),
        _ => None,
    };

    Ok(Conversation {
        id: column(row, "id")?,
        job: JobRef {
            id: column(row, "job_id")?,
            title: column(row, "job_title")?,
        },
        client_id: column(row, "client_id")?,
        freelancer_id: column(row, "freelancer_id")?,
        other_user: Profile {
            id: column(row, "other_id")?,
            name: column(row, "other_name")?,
            avatar_url: column(row, "other_avatar_url")?,
        },
        last_message,
        unread_count: unread_from_db(column(row, "unread_count")?)?,
        updated_at: column(row, "updated_at")?,
    })
}

pub(crate) fn message_from_row(row: &Row) -> AppResult<Message> {
    let sender_id: Uuid = column(row, "sender_id")?;
    let sender_name: Option<String> = column(row, "sender_name")?;
    let sender_avatar_url: Option<String> = column(row, "sender_avatar_url")?;
    let attachments: JsonValue = column(row, "attachments")?;

    Ok(Message {
        id: column(row, "id")?,
        conversation_id: column(row, "conversation_id")?,
        sender_id,
        sender: sender_name.map(|name| Profile {
            id: sender_id,
            name,
            avatar_url: sender_avatar_url,
        }),
        content: column(row, "content")?,
        attachments: Attachment::list_from_json(&attachments)?,
        created_at: column(row, "created_at")?,
    })
}

#[async_trait]
impl MessagingStore for PgMessagingStore {
    async fn list_conversations(&self, viewer_id: Uuid) -> AppResult<Vec<Conversation>> {
        let client = self.db.get().await?;

        let rows = client
            .query(
                r#"
                SELECT
                    c.id, c.client_id, c.freelancer_id, c.updated_at,
                    j.id AS job_id, j.title AS job_title,
                    p.id AS other_id, p.name AS other_name, p.avatar_url AS other_avatar_url,
                    cp.unread_count,
                    lm.content AS last_content, lm.created_at AS last_created_at
                FROM conversation_participants cp
                JOIN conversations c ON c.id = cp.conversation_id
                JOIN jobs j ON j.id = c.job_id
                JOIN profiles p ON p.id = CASE
                    WHEN c.client_id = $1 THEN c.freelancer_id
                    ELSE c.client_id
                END
                LEFT JOIN LATERAL (
                    SELECT m.content, m.created_at
                    FROM messages m
                    WHERE m.conversation_id = c.id
                    ORDER BY m.created_at DESC, m.id DESC
                    LIMIT 1
                ) lm ON TRUE
                WHERE cp.user_id = $1
                ORDER BY c.updated_at DESC, c.id ASC
                "#,
                &[&viewer_id],
            )
            .await
            .map_err(|e| AppError::Fetch(format!("list conversations: {e}")))?;

        rows.iter().map(conversation_from_row).collect()
    }

    async fn fetch_messages(&self, conversation_id: Uuid) -> AppResult<Vec<Message>> {
        let client = self.db.get().await?;

        let rows = client
            .query(
                r#"
                SELECT
                    m.id, m.conversation_id, m.sender_id, m.content, m.attachments, m.created_at,
                    p.name AS sender_name, p.avatar_url AS sender_avatar_url
                FROM messages m
                LEFT JOIN profiles p ON p.id = m.sender_id
                WHERE m.conversation_id = $1
                ORDER BY m.created_at ASC, m.id ASC
                "#,
                &[&conversation_id],
            )
            .await
            .map_err(|e| AppError::Fetch(format!("fetch messages: {e}")))?;

        rows.iter().map(message_from_row).collect()
    }

    async fn insert_message(&self, message: NewMessage) -> AppResult<Message> {
        let id = Uuid::new_v4();
        let attachments = Attachment::list_to_json(&message.attachments)?;

        let mut client = self.db.get().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| AppError::Fetch(format!("tx: {e}")))?;

        let is_participant = tx
            .query_opt(
                "SELECT 1 FROM conversation_participants WHERE conversation_id = $1 AND user_id = $2",
                &[&message.conversation_id, &message.sender_id],
            )
            .await
            .map_err(|e| AppError::Fetch(format!("check participant: {e}")))?
            .is_some();
        if !is_participant {
            return Err(AppError::Forbidden);
        }

        let row = tx
            .query_one(
                r#"
                INSERT INTO messages (id, conversation_id, sender_id, content, attachments)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING created_at
                "#,
                &[
                    &id,
                    &message.conversation_id,
                    &message.sender_id,
                    &message.content,
                    &attachments,
                ],
            )
            .await
            .map_err(|e| AppError::Fetch(format!("insert message: {e}")))?;
        let created_at: DateTime<Utc> = column(&row, "created_at")?;

        tx.execute(
            "UPDATE conversation_participants SET unread_count = unread_count + 1 WHERE conversation_id = $1 AND user_id <> $2",
            &[&message.conversation_id, &message.sender_id],
        )
        .await
        .map_err(|e| AppError::Fetch(format!("bump unread: {e}")))?;

        tx.execute(
            "UPDATE conversations SET updated_at = $2 WHERE id = $1",
            &[&message.conversation_id, &created_at],
        )
        .await
        .map_err(|e| AppError::Fetch(format!("touch conversation: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| AppError::Fetch(format!("commit: {e}")))?;

        let inserted = Message {
            id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            sender: None,
            content: message.content,
            attachments: message.attachments,
            created_at,
        };

        // The row is committed; a feed failure only delays other clients.
        if let Some(publisher) = &self.publisher {
            if let Err(e) = publisher
                .publish(&MessageInserted::new(inserted.clone()))
                .await
            {
                tracing::warn!(
                    error = %e,
                    message_id = %inserted.id,
                    conversation_id = %inserted.conversation_id,
                    "Failed to publish message insert to change feed"
                );
            }
        }

        Ok(inserted)
    }

    async fn reset_unread(&self, conversation_id: Uuid, viewer_id: Uuid) -> AppResult<()> {
        let client = self.db.get().await?;

        let updated = client
            .execute(
                "UPDATE conversation_participants SET unread_count = 0 WHERE conversation_id = $1 AND user_id = $2",
                &[&conversation_id, &viewer_id],
            )
            .await
            .map_err(|e| AppError::Fetch(format!("reset unread: {e}")))?;

        if updated == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn fetch_profile(&self, user_id: Uuid) -> AppResult<Option<Profile>> {
        let client = self.db.get().await?;

        let row = client
            .query_opt(
                "SELECT id, name, avatar_url FROM profiles WHERE id = $1",
                &[&user_id],
            )
            .await
            .map_err(|e| AppError::Fetch(format!("fetch profile: {e}")))?;

        row.map(|row| {
            Ok(Profile {
                id: column(&row, "id")?,
                name: column(&row, "name")?,
                avatar_url: column(&row, "avatar_url")?,
            })
        })
        .transpose()
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

        let mut client = self.db.get().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| AppError::Fetch(format!("tx: {e}")))?;

        let id = Uuid::new_v4();
        let inserted = tx
            .query_opt(
                r#"
                INSERT INTO conversations (id, job_id, client_id, freelancer_id)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (job_id, client_id, freelancer_id) DO NOTHING
                RETURNING id
                "#,
                &[&id, &job_id, &client_id, &freelancer_id],
            )
            .await
            .map_err(|e| AppError::Fetch(format!("insert conversation: {e}")))?;

        let conversation_id: Uuid = match inserted {
            Some(row) => {
                tx.execute(
                    "INSERT INTO conversation_participants (conversation_id, user_id) VALUES ($1, $2), ($1, $3) ON CONFLICT DO NOTHING",
                    &[&id, &client_id, &freelancer_id],
                )
                .await
                .map_err(|e| AppError::Fetch(format!("insert participants: {e}")))?;
                column(&row, "id")?
            }
            None => {
                let row = tx
                    .query_one(
                        "SELECT id FROM conversations WHERE job_id = $1 AND client_id = $2 AND freelancer_id = $3",
                        &[&job_id, &client_id, &freelancer_id],
                    )
                    .await
                    .map_err(|e| AppError::Fetch(format!("find conversation: {e}")))?;
                column(&row, "id")?
            }
        };

        tx.commit()
            .await
            .map_err(|e| AppError::Fetch(format!("commit: {e}")))?;

        Ok(conversation_id)
    }
}
