use crate::backends::ObjectStore;
use crate::error::{AppError, AppResult};
use crate::models::Attachment;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Word and Excel documents accepted next to images and PDFs.
const OFFICE_TYPES: &[&str] = &[
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
];

/// A file picked by the user, not yet uploaded.
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub filename: String,
    pub content_type: String,
    pub bytes: Bytes,
}

impl LocalFile {
    pub fn new(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

pub fn is_allowed_content_type(content_type: &str) -> bool {
    let Ok(parsed) = content_type.parse::<mime::Mime>() else {
        return false;
    };
    parsed.type_() == mime::IMAGE
        || parsed.essence_str() == mime::APPLICATION_PDF.essence_str()
        || OFFICE_TYPES.contains(&parsed.essence_str())
}

#[derive(Clone)]
pub struct AttachmentUploader {
    objects: Arc<dyn ObjectStore>,
    max_bytes: u64,
}

impl AttachmentUploader {
    pub fn new(objects: Arc<dyn ObjectStore>, max_bytes: u64) -> Self {
        Self { objects, max_bytes }
    }

    /// Checks that need no network call.
    pub fn validate(&self, file: &LocalFile) -> AppResult<()> {
        if file.filename.trim().is_empty() {
            return Err(AppError::Validation("file name is empty".into()));
        }
        if file.bytes.is_empty() {
            return Err(AppError::Validation(format!("{} is empty", file.filename)));
        }
        if file.size() > self.max_bytes {
            return Err(AppError::Validation(format!(
                "{} exceeds the {} byte limit",
                file.filename, self.max_bytes
            )));
        }
        if !is_allowed_content_type(&file.content_type) {
            return Err(AppError::Validation(format!(
                "{} has unsupported type {}",
                file.filename, file.content_type
            )));
        }
        Ok(())
    }

    /// `<conversation_id>/<unix_millis>-<file name>`; directory components in
    /// the user-supplied name are dropped.
    pub fn object_key(conversation_id: Uuid, uploaded_at: DateTime<Utc>, filename: &str) -> String {
        let base = filename
            .rsplit(['/', '\\'])
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("file");
        format!(
            "{}/{}-{}",
            conversation_id,
            uploaded_at.timestamp_millis(),
            base
        )
    }

    pub async fn upload(&self, conversation_id: Uuid, file: &LocalFile) -> AppResult<Attachment> {
        self.validate(file)?;

        let key = Self::object_key(conversation_id, Utc::now(), &file.filename);
        self.objects
            .put(&key, file.bytes.clone(), &file.content_type)
            .await
            .map_err(|e| match e {
                AppError::Upload(_) => e,
                other => AppError::Upload(other.to_string()),
            })?;

        let url = self.objects.public_url(&key);
        tracing::info!(
            conversation_id = %conversation_id,
            key = %key,
            size = file.size(),
            "Uploaded attachment"
        );

        Ok(Attachment {
            url,
            filename: file.filename.clone(),
            content_type: file.content_type.clone(),
            size: file.size(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::{MemoryBackend, Operation};
    use chrono::TimeZone;

    fn uploader(backend: &MemoryBackend, max_bytes: u64) -> AttachmentUploader {
        AttachmentUploader::new(Arc::new(backend.clone()), max_bytes)
    }

    #[test]
    fn test_allowed_content_types() {
        assert!(is_allowed_content_type("image/png"));
        assert!(is_allowed_content_type("image/jpeg"));
        assert!(is_allowed_content_type("application/pdf"));
        assert!(is_allowed_content_type(
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        ));
        assert!(!is_allowed_content_type("application/x-msdownload"));
        assert!(!is_allowed_content_type("not a mime"));
    }

    #[test]
    fn test_object_key_is_namespaced_and_strips_directories() {
        let conversation = Uuid::nil();
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(
            AttachmentUploader::object_key(conversation, at, "../../etc/brief.pdf"),
            format!("{conversation}/1700000000123-brief.pdf")
        );
        assert_eq!(
            AttachmentUploader::object_key(conversation, at, "C:\\docs\\spec.docx"),
            format!("{conversation}/1700000000123-spec.docx")
        );
    }

    #[tokio::test]
    async fn test_upload_returns_descriptor_matching_file() {
        let backend = MemoryBackend::new();
        let file = LocalFile::new("mock.png", "image/png", vec![1u8, 2, 3]);
        let conversation = Uuid::new_v4();

        let attachment = uploader(&backend, 1024)
            .upload(conversation, &file)
            .await
            .unwrap();

        assert!(!attachment.url.is_empty());
        assert_eq!(attachment.filename, "mock.png");
        assert_eq!(attachment.content_type, "image/png");
        assert_eq!(attachment.size, 3);

        let keys = backend.object_keys();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].starts_with(&conversation.to_string()));
        assert!(attachment.url.ends_with(&keys[0]));
    }

    #[tokio::test]
    async fn test_validation_happens_before_upload() {
        let backend = MemoryBackend::new();
        let uploader = uploader(&backend, 2);
        let conversation = Uuid::new_v4();

        let too_big = LocalFile::new("a.png", "image/png", vec![0u8; 3]);
        let empty = LocalFile::new("a.png", "image/png", Vec::<u8>::new());
        let exe = LocalFile::new("a.exe", "application/x-msdownload", vec![0u8]);

        for file in [too_big, empty, exe] {
            let err = uploader.upload(conversation, &file).await.unwrap_err();
            assert!(err.is_user_error());
        }
        assert!(backend.object_keys().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_is_upload_error() {
        let backend = MemoryBackend::new();
        backend.set_failing(Operation::PutObject, true);
        let file = LocalFile::new("a.pdf", "application/pdf", vec![1u8]);
        let err = uploader(&backend, 10)
            .upload(Uuid::new_v4(), &file)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Upload(_)));
    }
}
