//! SQLite storage for the queue.
//!
//! All SQL lives under this module. Each function runs exactly one statement
//! against the connection it is given; the caller decides which transaction
//! that connection belongs to.

use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    SqliteConnection, SqlitePool,
};

use crate::config::{ClaimStrategy, Config};

pub mod message;

/// First SQLite release that understands `RETURNING`.
const RETURNING_SINCE: (u32, u32, u32) = (3, 35, 0);

pub async fn connect(config: &Config) -> sqlx::Result<SqlitePool> {
    let pool = match config.db_path() {
        Some(path) => {
            let opts = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .locking_mode(SqliteLockingMode::Normal)
                .busy_timeout(config.busy_timeout())
                .optimize_on_close(true, None)
                .auto_vacuum(SqliteAutoVacuum::Full);

            SqlitePoolOptions::new()
                .max_connections(config.max_connections())
                .connect_with(opts)
                .await?
        }
        None => {
            // Every connection to ":memory:" is its own database, so the pool
            // is pinned to one connection that is never recycled.
            let opts = SqliteConnectOptions::new()
                .in_memory(true)
                .busy_timeout(config.busy_timeout());

            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(opts)
                .await?
        }
    };

    ensure_schema(&pool).await?;

    Ok(pool)
}

/// Creates the queue table if it is missing. Safe to race against other
/// processes opening the same file.
pub async fn ensure_schema(pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::query(
        "
        CREATE TABLE IF NOT EXISTS messages (
            sequence INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT NOT NULL UNIQUE,
            data TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('free', 'locked', 'done', 'failed')),
            in_time INTEGER NOT NULL,
            lock_time INTEGER,
            done_time INTEGER
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS messages_status_sequence ON messages (status, sequence)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn sqlite_version(db: &mut SqliteConnection) -> sqlx::Result<String> {
    sqlx::query_scalar("SELECT sqlite_version()")
        .fetch_one(db)
        .await
}

/// Picks the claim strategy the connected engine can run.
pub fn detect_claim_strategy(version: &str) -> ClaimStrategy {
    if parse_version(version).is_some_and(|v| v >= RETURNING_SINCE) {
        ClaimStrategy::Returning
    } else {
        ClaimStrategy::LockThenFetch
    }
}

fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version.trim().split('.').map(|part| part.parse::<u32>());

    let major = parts.next()?.ok()?;
    let minor = parts.next().unwrap_or(Ok(0)).ok()?;
    let patch = parts.next().unwrap_or(Ok(0)).ok()?;

    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_from_version() {
        assert_eq!(detect_claim_strategy("3.45.1"), ClaimStrategy::Returning);
        assert_eq!(detect_claim_strategy("3.35.0"), ClaimStrategy::Returning);
        assert_eq!(detect_claim_strategy("3.34.1"), ClaimStrategy::LockThenFetch);
        assert_eq!(detect_claim_strategy("3.8"), ClaimStrategy::LockThenFetch);
        assert_eq!(detect_claim_strategy("garbage"), ClaimStrategy::LockThenFetch);
    }

    #[tokio::test]
    async fn schema_is_idempotent() {
        let pool = connect(&Config::default()).await.unwrap();
        ensure_schema(&pool).await.unwrap();

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'messages'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 1);
    }

    #[tokio::test]
    async fn memory_pool_shares_one_database() {
        let pool = connect(&Config::default()).await.unwrap();

        sqlx::query(
            "INSERT INTO messages (message_id, data, status, in_time) VALUES ('a', 'x', 'free', 1)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn rejects_unknown_status() {
        let pool = connect(&Config::default()).await.unwrap();

        let res = sqlx::query(
            "INSERT INTO messages (message_id, data, status, in_time) VALUES ('a', 'x', 'pending', 1)",
        )
        .execute(&pool)
        .await;
        assert!(res.is_err());
    }
}
