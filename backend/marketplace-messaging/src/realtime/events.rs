use crate::error::{AppError, AppResult};
use crate::models::Message;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Insert notification pushed by the change feed for every new message row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInserted {
    pub message: Message,
}

/// Wire shape of feed entries:
/// `{"type": "message.inserted", "message": { ...row... }}`
#[derive(Serialize, Deserialize)]
#[serde(tag = "type")]
enum FeedPayload {
    #[serde(rename = "message.inserted")]
    MessageInserted { message: Message },
}

impl MessageInserted {
    pub fn new(message: Message) -> Self {
        Self { message }
    }

    pub fn conversation_id(&self) -> Uuid {
        self.message.conversation_id
    }

    pub fn to_json(&self) -> AppResult<String> {
        let payload = FeedPayload::MessageInserted {
            message: self.message.clone(),
        };
        serde_json::to_string(&payload)
            .map_err(|e| AppError::Subscription(format!("serialize feed event: {e}")))
    }

    /// Parse a feed entry, rejecting payloads that do not describe a
    /// well-formed message row.
    pub fn from_json(payload: &str) -> AppResult<Self> {
        let FeedPayload::MessageInserted { mut message } = serde_json::from_str(payload)
            .map_err(|e| AppError::Subscription(format!("malformed feed event: {e}")))?;

        for attachment in &message.attachments {
            if attachment.url.trim().is_empty() || attachment.filename.trim().is_empty() {
                return Err(AppError::Subscription(format!(
                    "message {} carries an incomplete attachment",
                    message.id
                )));
            }
        }
        // Feed rows are raw; display data is resolved by the consumer.
        message.sender = None;

        Ok(Self { message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Attachment;
    use chrono::Utc;

    fn sample() -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            sender: None,
            content: "Sent file: brief.pdf".into(),
            attachments: vec![Attachment {
                url: "https://cdn.example.com/c/1-brief.pdf".into(),
                filename: "brief.pdf".into(),
                content_type: "application/pdf".into(),
                size: 10,
            }],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_payload_is_tagged() {
        let json = MessageInserted::new(sample()).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "message.inserted");
        assert_eq!(value["message"]["attachments"][0]["filename"], "brief.pdf");
    }

    #[test]
    fn test_from_json_accepts_own_output() {
        let message = sample();
        let json = MessageInserted::new(message.clone()).to_json().unwrap();
        let parsed = MessageInserted::from_json(&json).unwrap();
        assert_eq!(parsed.message, message);
        assert_eq!(parsed.conversation_id(), message.conversation_id);
    }

    #[test]
    fn test_from_json_rejects_unknown_type_and_missing_fields() {
        let unknown = r#"{"type":"message.deleted","message":{}}"#;
        assert!(matches!(
            MessageInserted::from_json(unknown),
            Err(AppError::Subscription(_))
        ));

        let missing = r#"{"type":"message.inserted","message":{"id":"not-a-uuid"}}"#;
        assert!(matches!(
            MessageInserted::from_json(missing),
            Err(AppError::Subscription(_))
        ));
    }

    #[test]
    fn test_from_json_rejects_incomplete_attachment() {
        let mut message = sample();
        message.attachments[0].url = String::new();
        let json = MessageInserted::new(message).to_json().unwrap();
        assert!(MessageInserted::from_json(&json).is_err());
    }
}
