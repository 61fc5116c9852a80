use crate::error::AppError;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::{error, info};

/// Tables backing the messaging subsystem.
///
/// `conversation_participants.unread_count` holds the per-viewer counter; the
/// check constraint keeps it non-negative.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS profiles (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    avatar_url TEXT
);

CREATE TABLE IF NOT EXISTS jobs (
    id UUID PRIMARY KEY,
    title TEXT NOT NULL,
    client_id UUID NOT NULL REFERENCES profiles(id)
);

CREATE TABLE IF NOT EXISTS conversations (
    id UUID PRIMARY KEY,
    job_id UUID NOT NULL REFERENCES jobs(id),
    client_id UUID NOT NULL REFERENCES profiles(id),
    freelancer_id UUID NOT NULL REFERENCES profiles(id),
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (job_id, client_id, freelancer_id)
);

CREATE TABLE IF NOT EXISTS conversation_participants (
    conversation_id UUID NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    user_id UUID NOT NULL REFERENCES profiles(id),
    unread_count INTEGER NOT NULL DEFAULT 0 CHECK (unread_count >= 0),
    PRIMARY KEY (conversation_id, user_id)
);

CREATE TABLE IF NOT EXISTS messages (
    id UUID PRIMARY KEY,
    conversation_id UUID NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    sender_id UUID NOT NULL REFERENCES profiles(id),
    content TEXT NOT NULL,
    attachments JSONB NOT NULL DEFAULT '[]'::jsonb,
    created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp()
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_created
    ON messages (conversation_id, created_at, id);
CREATE INDEX IF NOT EXISTS idx_participants_user
    ON conversation_participants (user_id);
"#;

/// Build a deadpool-postgres pool and verify it with a round trip.
pub async fn init_pool(database_url: &str, max_connections: usize) -> Result<Pool, AppError> {
    let pg_config: tokio_postgres::Config = database_url
        .parse()
        .map_err(|e| AppError::Config(format!("invalid DATABASE_URL: {e}")))?;

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
    let pool = Pool::builder(mgr)
        .max_size(max_connections)
        .build()
        .map_err(|e| AppError::Config(format!("build pool: {e}")))?;

    let verify = async {
        let client = pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok::<(), AppError>(())
    };

    match tokio::time::timeout(Duration::from_secs(10), verify).await {
        Ok(Ok(())) => {
            info!(max_connections, "Database pool created and verified");
            Ok(pool)
        }
        Ok(Err(e)) => {
            error!(error = %e, "Database connection verification failed");
            Err(e)
        }
        Err(_) => {
            error!("Database connection verification timeout");
            Err(AppError::Fetch("database connection timeout".into()))
        }
    }
}

/// Apply [`SCHEMA`]. Every statement is idempotent.
pub async fn ensure_schema(pool: &Pool) -> Result<(), AppError> {
    let client = pool.get().await?;
    client.batch_execute(SCHEMA).await?;
    Ok(())
}
