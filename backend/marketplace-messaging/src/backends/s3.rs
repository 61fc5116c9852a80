use super::ObjectStore;
use crate::config::S3Config;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;

/// Attachment storage on S3 (or an S3-compatible endpoint such as MinIO).
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    config: S3Config,
}

impl S3ObjectStore {
    pub fn new(client: Client, config: S3Config) -> Self {
        Self { client, config }
    }

    /// Build a client from the default credential chain.
    pub async fn from_config(config: S3Config) -> Self {
        use aws_sdk_s3::config::Region;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        // Custom endpoint for S3-compatible storage
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let shared = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.endpoint.is_some())
            .build();

        Self::new(Client::from_conf(s3_config), config)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> AppResult<()> {
        let size = body.len();
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| AppError::Upload(format!("put {key}: {e}")))?;

        tracing::debug!(bucket = %self.config.bucket, key, size, "stored attachment object");
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        self.config.public_url(key)
    }
}
