use sqlx::{SqliteConnection, SqlitePool};

use crate::{
    config::{ClaimStrategy, Config},
    db,
    error::{Error, Result},
    id,
    message::{Message, Status},
    models::QueueStats,
    utils::now_ns,
};

/// The two ways a claimed message can be resolved.
#[derive(Clone, Copy, Debug)]
enum Outcome {
    Done,
    Failed,
}

impl From<Outcome> for Status {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Done => Status::Done,
            Outcome::Failed => Status::Failed,
        }
    }
}

/// Handle to a queue stored in SQLite.
///
/// A handle keeps no message state of its own. Any number of handles, in
/// this process or others, may share the same file; every operation is a
/// single transaction against the store, so two handles never observe or
/// produce a half-applied change.
#[derive(Clone)]
pub struct Queue {
    db: SqlitePool,
    config: Config,
    strategy: ClaimStrategy,
}

impl Queue {
    /// Opens an in-memory queue with the default configuration.
    pub async fn connect() -> Result<Self> {
        Self::connect_with(Config::default()).await
    }

    pub async fn connect_with(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;

        let version = {
            let mut conn = pool.acquire().await?;
            db::sqlite_version(&mut conn).await?
        };

        let detected = db::detect_claim_strategy(&version);
        let strategy = match (config.claim_strategy, detected) {
            (None, detected) => detected,
            (Some(ClaimStrategy::Returning), ClaimStrategy::LockThenFetch) => {
                return Err(Error::invalid_config(format!(
                    "claim strategy `returning` needs SQLite 3.35 or newer, found {version}"
                )));
            }
            (Some(forced), _) => forced,
        };

        tracing::info!(
            db_path = config.db_path().unwrap_or(Config::MEMORY),
            sqlite = %version,
            %strategy,
            maxsize = ?config.maxsize,
            "Opened queue"
        );

        Ok(Self {
            db: pool,
            config,
            strategy,
        })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn claim_strategy(&self) -> ClaimStrategy {
        self.strategy
    }

    /// Appends a message and returns its identifier.
    ///
    /// Fails with [`Error::CapacityExceeded`] when `maxsize` free or locked
    /// messages already exist; nothing is written in that case.
    pub async fn put(&self, data: impl AsRef<str>) -> Result<String> {
        let message_id = id::generate();

        let mut tx = self.db.begin().await?;

        let sequence = Message::insert(
            &mut *tx,
            &message_id,
            data.as_ref(),
            now_ns(),
            self.config.maxsize,
        )
        .await?
        .ok_or_else(|| self.capacity_exceeded())?;

        tx.commit().await?;

        tracing::debug!(%message_id, sequence, "Enqueued message");

        Ok(message_id)
    }

    /// Appends several messages in one transaction.
    ///
    /// Either every message is written or none is: if the batch would push the
    /// queue past `maxsize`, the whole batch is rolled back.
    pub async fn put_many<I>(&self, items: I) -> Result<Vec<String>>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut tx = self.db.begin().await?;
        let mut ids = Vec::new();

        for data in items {
            let message_id = id::generate();

            Message::insert(
                &mut *tx,
                &message_id,
                data.as_ref(),
                now_ns(),
                self.config.maxsize,
            )
            .await?
            .ok_or_else(|| self.capacity_exceeded())?;

            ids.push(message_id);
        }

        tx.commit().await?;

        tracing::debug!(count = ids.len(), "Enqueued batch");

        Ok(ids)
    }

    /// Claims the oldest free message.
    ///
    /// Returns `None` right away when nothing is free; waiting for work is up
    /// to the caller. Concurrent callers never receive the same message.
    pub async fn pop(&self) -> Result<Option<Message>> {
        let now = now_ns();

        let mut tx = self.db.begin().await?;

        let claimed = match self.strategy {
            ClaimStrategy::Returning => Message::claim_returning(&mut *tx, now).await?,
            ClaimStrategy::LockThenFetch => lock_then_fetch(&mut *tx, now).await?,
        };

        let Some(message) = claimed else {
            tx.rollback().await?;
            return Ok(None);
        };

        tx.commit().await?;

        tracing::debug!(
            message_id = %message.message_id,
            sequence = message.sequence,
            "Claimed message"
        );

        Ok(Some(message))
    }

    /// Returns the message `pop` would claim next, without claiming it.
    pub async fn peek(&self) -> Result<Option<Message>> {
        let mut conn = self.db.acquire().await?;
        Ok(Message::oldest_free(&mut conn).await?)
    }

    pub async fn get(&self, message_id: &str) -> Result<Message> {
        let mut conn = self.db.acquire().await?;
        Message::get(&mut conn, message_id)
            .await?
            .ok_or_else(|| Error::not_found(message_id))
    }

    /// Marks a locked message as done.
    ///
    /// Returns the number of messages changed. Unknown ids and messages that
    /// are not locked give 0, so a repeated call is harmless.
    pub async fn done(&self, message_id: &str) -> Result<u64> {
        self.finish(message_id, Outcome::Done).await
    }

    /// Marks a locked message as failed. Same contract as [`Queue::done`].
    pub async fn fail(&self, message_id: &str) -> Result<u64> {
        self.finish(message_id, Outcome::Failed).await
    }

    async fn finish(&self, message_id: &str, outcome: Outcome) -> Result<u64> {
        let status = Status::from(outcome);

        let mut tx = self.db.begin().await?;
        let affected = Message::finish(&mut *tx, message_id, status, now_ns()).await?;
        tx.commit().await?;

        tracing::debug!(message_id, %status, affected, "Resolved message");

        Ok(affected)
    }

    /// Removes a message in any state. Returns 0 if it did not exist.
    pub async fn delete(&self, message_id: &str) -> Result<u64> {
        let mut tx = self.db.begin().await?;
        let affected = Message::delete(&mut *tx, message_id).await?;
        tx.commit().await?;

        tracing::debug!(message_id, affected, "Deleted message");

        Ok(affected)
    }

    /// Deletes done messages, and failed ones unless `retain_failed` is set.
    pub async fn prune(&self) -> Result<u64> {
        let include_failed = !self.config.retain_failed;

        let mut tx = self.db.begin().await?;
        let removed = Message::prune(&mut *tx, include_failed).await?;
        tx.commit().await?;

        tracing::debug!(removed, include_failed, "Pruned queue");

        Ok(removed)
    }

    /// Number of free and locked messages.
    pub async fn qsize(&self) -> Result<u64> {
        let mut conn = self.db.acquire().await?;
        Ok(Message::count_active(&mut conn).await?)
    }

    pub async fn empty(&self) -> Result<bool> {
        Ok(self.qsize().await? == 0)
    }

    /// Whether the next `put` would be rejected. Always false when unbounded.
    pub async fn full(&self) -> Result<bool> {
        match self.config.maxsize {
            Some(maxsize) => Ok(self.qsize().await? >= maxsize),
            None => Ok(false),
        }
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let mut conn = self.db.acquire().await?;
        Ok(Message::count_by_status(&mut conn)
            .await?
            .into_iter()
            .collect())
    }

    /// Rebuilds the database file to hand space freed by pruning back to the
    /// filesystem.
    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.db).await?;
        Ok(())
    }

    /// Closes every pooled connection. Later calls on this handle, or its
    /// clones, fail with [`Error::StorageUnavailable`].
    pub async fn close(&self) {
        self.db.close().await;
    }

    fn capacity_exceeded(&self) -> Error {
        Error::CapacityExceeded {
            maxsize: self.config.maxsize.unwrap_or_default(),
        }
    }
}

/// Claims the oldest free message on engines without `RETURNING`, then reads
/// it back by its sequence.
///
/// A row that was claimed but cannot be read back is an error, so the caller
/// drops the transaction instead of committing a claim nobody holds.
async fn lock_then_fetch(db: &mut SqliteConnection, now: i64) -> Result<Option<Message>> {
    Message::reserve_write(db).await?;

    let Some(sequence) = Message::oldest_free_sequence(db).await? else {
        return Ok(None);
    };

    // The write lock is held, so nobody else can have claimed it since.
    if Message::lock_sequence(db, sequence, now).await? == 0 {
        return Ok(None);
    }

    match Message::get_by_sequence(db, sequence).await? {
        Some(message) => Ok(Some(message)),
        None => Err(sqlx::Error::RowNotFound.into()),
    }
}
