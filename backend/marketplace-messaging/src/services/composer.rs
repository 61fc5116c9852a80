use super::attachment_uploader::{AttachmentUploader, LocalFile};
use crate::backends::{IdentityProvider, MessagingStore};
use crate::error::{AppError, AppResult};
use crate::models::{Message, NewMessage};
use std::sync::Arc;
use uuid::Uuid;

pub fn file_caption(filename: &str) -> String {
    format!("Sent file: {filename}")
}

/// Sends text and file messages for the current viewer.
///
/// Nothing is inserted locally on success; the change feed delivers the new
/// row to the message stream like any other insert.
pub struct Composer {
    identity: Arc<dyn IdentityProvider>,
    store: Arc<dyn MessagingStore>,
    uploader: AttachmentUploader,
    draft: String,
}

impl Composer {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn MessagingStore>,
        uploader: AttachmentUploader,
    ) -> Self {
        Self {
            identity,
            store,
            uploader,
            draft: String::new(),
        }
    }

    async fn sender_id(&self) -> AppResult<Uuid> {
        self.identity
            .current_viewer()
            .await?
            .map(|viewer| viewer.id)
            .ok_or(AppError::AuthenticationRequired)
    }

    pub async fn send(&self, conversation: Option<Uuid>, text: &str) -> AppResult<Message> {
        let conversation_id =
            conversation.ok_or_else(|| AppError::Validation("no conversation selected".into()))?;
        let body = text.trim();
        if body.is_empty() {
            return Err(AppError::Validation("message is empty".into()));
        }

        let sender_id = self.sender_id().await?;
        let message = self
            .store
            .insert_message(NewMessage::text(conversation_id, sender_id, body))
            .await?;

        tracing::info!(
            conversation_id = %conversation_id,
            message_id = %message.id,
            "Message sent"
        );
        Ok(message)
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    /// Send the draft; it is cleared only if the send succeeds.
    pub async fn submit_draft(&mut self, conversation: Option<Uuid>) -> AppResult<Message> {
        let message = self.send(conversation, &self.draft).await?;
        self.draft.clear();
        Ok(message)
    }

    /// Upload each file in order and send one message per file. Every file
    /// is validated before the first upload; after that the first failure
    /// stops the batch and earlier files stay sent.
    pub async fn attach(
        &self,
        conversation: Option<Uuid>,
        files: &[LocalFile],
    ) -> AppResult<Vec<Message>> {
        let conversation_id =
            conversation.ok_or_else(|| AppError::Validation("no conversation selected".into()))?;
        if files.is_empty() {
            return Err(AppError::Validation("no files selected".into()));
        }
        for file in files {
            self.uploader.validate(file)?;
        }

        let sender_id = self.sender_id().await?;
        let mut sent = Vec::with_capacity(files.len());
        for file in files {
            let attachment = self.uploader.upload(conversation_id, file).await?;
            let message = self
                .store
                .insert_message(NewMessage {
                    conversation_id,
                    sender_id,
                    content: file_caption(&file.filename),
                    attachments: vec![attachment],
                })
                .await?;

            tracing::info!(
                conversation_id = %conversation_id,
                message_id = %message.id,
                filename = %file.filename,
                "File message sent"
            );
            sent.push(message);
        }
        Ok(sent)
    }
}
