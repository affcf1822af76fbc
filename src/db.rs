use crate::types::{LearnFlowError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous};
use std::path::Path;
use std::time::Duration;

pub type DbPool = SqlitePool;

pub const SCHEMA_VERSION: &str = "1";

/// Opens (creating if needed) the chat archive database and brings its schema
/// up to date.
pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let options = SqliteConnectOptions::new()
        .filename(path.as_ref())
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

    let pool = match SqlitePool::connect_with(options).await {
        Ok(p) => p,
        Err(e) => return Err(LearnFlowError::Database(e).into()),
    };

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        return Err(LearnFlowError::Internal(
            format!("Chat archive migration failed: {}", e),
            tracing_error::SpanTrace::capture(),
        )
        .into());
    }

    match schema_version(&pool).await {
        Some(v) if v == SCHEMA_VERSION => {
            tracing::info!("Chat archive ready at {} (schema {})", path.as_ref().display(), v)
        }
        Some(v) => tracing::warn!(
            "Chat archive schema is {}, expected {}; continuing",
            v,
            SCHEMA_VERSION
        ),
        None => tracing::warn!("Chat archive has no schema version row"),
    }

    Ok(pool)
}

async fn schema_version(pool: &DbPool) -> Option<String> {
    let row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;
    match row {
        Ok((version,)) => Some(version),
        Err(e) => {
            tracing::debug!("Schema version lookup failed: {}", e);
            None
        }
    }
}

pub async fn ping(pool: &DbPool) -> Result<()> {
    sqlx::query("SELECT 1").fetch_one(pool).await?;
    Ok(())
}
