use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

/// Errors surfaced by the messaging subsystem.
///
/// Nothing here is retried automatically. Every failure is terminal for the
/// user action that triggered it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AppError {
    /// No active session; callers should redirect to the login route.
    #[error("authentication required")]
    AuthenticationRequired,

    /// Rejected before any network call was made.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("fetch error: {0}")]
    Fetch(String),

    #[error("upload error: {0}")]
    Upload(String),

    /// Realtime feed disruption. Logged by callers, never retried.
    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,
}

impl From<tokio_postgres::Error> for AppError {
    fn from(e: tokio_postgres::Error) -> Self {
        AppError::Fetch(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        AppError::Fetch(e.to_string())
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::Fetch(format!("redis: {e}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Fetch(format!("malformed record: {e}"))
    }
}

impl AppError {
    /// Whether the caller should send the user to the login route.
    pub fn requires_login(&self) -> bool {
        matches!(self, AppError::AuthenticationRequired)
    }

    /// Errors caused by user input rather than by a backend.
    pub fn is_user_error(&self) -> bool {
        matches!(self, AppError::Validation(_))
    }
}
