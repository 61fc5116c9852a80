use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Descriptor of an uploaded file referenced by exactly one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
}

impl Attachment {
    fn validate(self) -> AppResult<Self> {
        if self.url.trim().is_empty() {
            return Err(AppError::Fetch("attachment without url".into()));
        }
        if self.filename.trim().is_empty() {
            return Err(AppError::Fetch("attachment without filename".into()));
        }
        Ok(self)
    }

    /// Map the loosely typed `attachments` column (JSON array or null) into
    /// descriptors, rejecting entries that are missing required fields.
    pub fn list_from_json(value: &JsonValue) -> AppResult<Vec<Attachment>> {
        match value {
            JsonValue::Null => Ok(Vec::new()),
            JsonValue::Array(items) => items
                .iter()
                .map(|item| {
                    serde_json::from_value::<Attachment>(item.clone())
                        .map_err(AppError::from)
                        .and_then(Attachment::validate)
                })
                .collect(),
            other => Err(AppError::Fetch(format!(
                "attachments must be an array, got {other}"
            ))),
        }
    }

    pub fn list_to_json(attachments: &[Attachment]) -> AppResult<JsonValue> {
        Ok(serde_json::to_value(attachments)?)
    }
}
