//! SQLite connection setup and schema

use meetq_queue::QueueError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// SQLite configuration options
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database URL (e.g., "sqlite:meetq.db?mode=rwc" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode for better concurrency
    pub wal_mode: bool,
    /// Busy timeout in seconds
    pub busy_timeout_secs: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:meetq.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            busy_timeout_secs: 30,
        }
    }
}

impl SqliteConfig {
    pub fn new(url: &str) -> Self {
        if is_memory_url(url) {
            return Self::memory();
        }
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// Create config for in-memory database (testing)
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            // Every connection would otherwise get its own empty database
            max_connections: 1,
            wal_mode: false,
            busy_timeout_secs: 5,
        }
    }
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        queue TEXT NOT NULL,
        job_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        available_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        last_error TEXT,
        locked_by TEXT,
        lease_expires_at INTEGER,
        dedup_key TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (queue, status, available_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_lease ON jobs (status, lease_expires_at)",
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_live_dedup ON jobs (queue, dedup_key)
    WHERE dedup_key IS NOT NULL
      AND status IN ('pending', 'delayed', 'active', 'retry-scheduled')
    "#,
];

/// Open a pool and make sure the schema exists.
pub async fn connect(config: &SqliteConfig) -> Result<SqlitePool, QueueError> {
    let mut options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| QueueError::StoreUnavailable(e.to_string()))?
        .busy_timeout(Duration::from_secs(config.busy_timeout_secs));

    if config.wal_mode {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);
    if is_memory_url(&config.url) {
        // Dropping the last connection drops the database
        pool_options = pool_options
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }

    let pool = pool_options
        .connect_with(options)
        .await
        .map_err(|e| QueueError::StoreUnavailable(e.to_string()))?;

    info!(
        url = %config.url,
        wal = config.wal_mode,
        max_connections = config.max_connections,
        "Connected to SQLite"
    );

    migrate(&pool).await?;
    Ok(pool)
}

/// Create the jobs table and its indexes if missing.
pub async fn migrate(pool: &SqlitePool) -> Result<(), QueueError> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| QueueError::StoreUnavailable(format!("Migration failed: {e}")))?;
    }
    debug!("Job schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_url_forces_single_connection() {
        let config = SqliteConfig::new("sqlite::memory:");
        assert_eq!(config.max_connections, 1);
        assert!(!config.wal_mode);

        let config = SqliteConfig::new("sqlite:meetq.db?mode=rwc");
        assert_eq!(config.max_connections, 5);
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let pool = connect(&SqliteConfig::memory()).await.unwrap();
        migrate(&pool).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
