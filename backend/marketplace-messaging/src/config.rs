use dotenvy::dotenv;
use std::env;

/// Attachments above this size are rejected before upload (100MB).
pub const DEFAULT_ATTACHMENT_MAX_BYTES: u64 = 100_000_000;
pub const DEFAULT_ATTACHMENT_BUCKET: &str = "message-attachments";

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    /// Base URL objects are publicly served from (CDN or bucket URL).
    pub public_base_url: String,
}

impl S3Config {
    /// Public retrieval URL for a stored key. Path segments are
    /// percent-encoded so user-supplied file names survive intact.
    pub fn public_url(&self, key: &str) -> String {
        let encoded = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/{}", self.public_base_url.trim_end_matches('/'), encoded)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: usize,
    pub redis_url: String,
    pub feed_batch_size: usize,
    pub s3: S3Config,
    pub jwt_secret: Option<String>,
    pub attachment_max_bytes: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, crate::error::AppError> {
        dotenv().ok();
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| crate::error::AppError::Config("DATABASE_URL missing".into()))?;
        let db_max_connections = env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);
        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let feed_batch_size = env::var("FEED_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        let bucket =
            env::var("S3_BUCKET").unwrap_or_else(|_| DEFAULT_ATTACHMENT_BUCKET.to_string());
        let region = env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        let endpoint = env::var("S3_ENDPOINT").ok();
        let public_base_url = env::var("S3_PUBLIC_BASE_URL")
            .unwrap_or_else(|_| format!("https://{bucket}.s3.{region}.amazonaws.com"));

        let attachment_max_bytes = match env::var("ATTACHMENT_MAX_BYTES") {
            Ok(raw) => raw.parse().map_err(|e| {
                crate::error::AppError::Config(format!("ATTACHMENT_MAX_BYTES: {e}"))
            })?,
            Err(_) => DEFAULT_ATTACHMENT_MAX_BYTES,
        };

        Ok(Self {
            database_url,
            db_max_connections,
            redis_url,
            feed_batch_size,
            s3: S3Config {
                bucket,
                region,
                endpoint,
                public_base_url,
            },
            jwt_secret: env::var("JWT_SECRET").ok().filter(|s| !s.is_empty()),
            attachment_max_bytes,
        })
    }
}
