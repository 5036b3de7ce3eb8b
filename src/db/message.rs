use sqlx::SqliteConnection;

use crate::message::{Message, Status};

impl Message {
    /// Appends a free message unless `maxsize` active messages already exist.
    ///
    /// The capacity check is part of the insert statement, so it cannot race
    /// with a concurrent insert. Returns the new row's sequence, or `None`
    /// when the queue is full.
    pub async fn insert(
        db: &mut SqliteConnection,
        message_id: &str,
        data: &str,
        in_time: i64,
        maxsize: Option<u64>,
    ) -> sqlx::Result<Option<i64>> {
        let maxsize = maxsize.map(|max| i64::try_from(max).unwrap_or(i64::MAX));

        let res = sqlx::query(
            "
            INSERT INTO messages (message_id, data, status, in_time)
            SELECT $1, $2, $3, $4
            WHERE $5 IS NULL
               OR (SELECT COUNT(*) FROM messages WHERE status IN ('free', 'locked')) < $5
            ",
        )
        .bind(message_id)
        .bind(data)
        .bind(Status::Free)
        .bind(in_time)
        .bind(maxsize)
        .execute(db)
        .await?;

        Ok((res.rows_affected() == 1).then(|| res.last_insert_rowid()))
    }

    /// Claims the oldest free message and returns it in one statement.
    pub async fn claim_returning(
        db: &mut SqliteConnection,
        now: i64,
    ) -> sqlx::Result<Option<Message>> {
        sqlx::query_as(
            "
            UPDATE messages
            SET status = 'locked', lock_time = MAX($1, in_time)
            WHERE sequence = (
                SELECT sequence FROM messages
                WHERE status = 'free'
                ORDER BY sequence
                LIMIT 1
            )
            AND status = 'free'
            RETURNING *
            ",
        )
        .bind(now)
        .fetch_optional(db)
        .await
    }

    /// Takes the database write lock for the current transaction without
    /// changing any row.
    ///
    /// Run it first in a transaction that reads before it writes. Otherwise, in
    /// WAL mode, a commit from another connection between the read and the
    /// write fails the write with `SQLITE_BUSY` and the busy timeout does not
    /// retry it.
    pub async fn reserve_write(db: &mut SqliteConnection) -> sqlx::Result<()> {
        sqlx::query("UPDATE messages SET status = status WHERE 0")
            .execute(db)
            .await?;

        Ok(())
    }

    pub async fn oldest_free_sequence(db: &mut SqliteConnection) -> sqlx::Result<Option<i64>> {
        sqlx::query_scalar(
            "SELECT sequence FROM messages WHERE status = 'free' ORDER BY sequence LIMIT 1",
        )
        .fetch_optional(db)
        .await
    }

    /// Claims the message at `sequence` if it is still free. Returns the number
    /// of rows claimed, which is 0 or 1.
    pub async fn lock_sequence(
        db: &mut SqliteConnection,
        sequence: i64,
        now: i64,
    ) -> sqlx::Result<u64> {
        let res = sqlx::query(
            "
            UPDATE messages
            SET status = 'locked', lock_time = MAX($1, in_time)
            WHERE sequence = $2 AND status = 'free'
            ",
        )
        .bind(now)
        .bind(sequence)
        .execute(db)
        .await?;

        Ok(res.rows_affected())
    }

    pub async fn get_by_sequence(
        db: &mut SqliteConnection,
        sequence: i64,
    ) -> sqlx::Result<Option<Message>> {
        sqlx::query_as("SELECT * FROM messages WHERE sequence = $1")
            .bind(sequence)
            .fetch_optional(db)
            .await
    }

    pub async fn get(db: &mut SqliteConnection, message_id: &str) -> sqlx::Result<Option<Message>> {
        sqlx::query_as("SELECT * FROM messages WHERE message_id = $1")
            .bind(message_id)
            .fetch_optional(db)
            .await
    }

    pub async fn oldest_free(db: &mut SqliteConnection) -> sqlx::Result<Option<Message>> {
        sqlx::query_as(
            "SELECT * FROM messages WHERE status = 'free' ORDER BY sequence LIMIT 1",
        )
        .fetch_optional(db)
        .await
    }

    /// Moves a locked message to `Done` or `Failed`.
    ///
    /// `done_time` never precedes the claim, even if this process's clock is
    /// behind the claimant's.
    pub async fn finish(
        db: &mut SqliteConnection,
        message_id: &str,
        status: Status,
        now: i64,
    ) -> sqlx::Result<u64> {
        let res = sqlx::query(
            "
            UPDATE messages
            SET status = $1, done_time = MAX($2, COALESCE(lock_time, in_time))
            WHERE message_id = $3 AND status = $4
            ",
        )
        .bind(status)
        .bind(now)
        .bind(message_id)
        .bind(status.predecessor())
        .execute(db)
        .await?;

        Ok(res.rows_affected())
    }

    /// Returns a locked message to the free pool and clears its claim.
    pub async fn release(db: &mut SqliteConnection, message_id: &str) -> sqlx::Result<u64> {
        let res = sqlx::query(
            "
            UPDATE messages
            SET status = $1, lock_time = NULL
            WHERE message_id = $2 AND status = $3
            ",
        )
        .bind(Status::Free)
        .bind(message_id)
        .bind(Status::Free.predecessor())
        .execute(db)
        .await?;

        Ok(res.rows_affected())
    }

    pub async fn delete(db: &mut SqliteConnection, message_id: &str) -> sqlx::Result<u64> {
        let res = sqlx::query("DELETE FROM messages WHERE message_id = $1")
            .bind(message_id)
            .execute(db)
            .await?;

        Ok(res.rows_affected())
    }

    /// Deletes done messages, and failed ones too when `include_failed`.
    pub async fn prune(db: &mut SqliteConnection, include_failed: bool) -> sqlx::Result<u64> {
        let res = sqlx::query(
            "DELETE FROM messages WHERE status = 'done' OR ($1 AND status = 'failed')",
        )
        .bind(include_failed)
        .execute(db)
        .await?;

        Ok(res.rows_affected())
    }

    pub async fn count_active(db: &mut SqliteConnection) -> sqlx::Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE status IN ('free', 'locked')",
        )
        .fetch_one(db)
        .await?;

        Ok(count.max(0) as u64)
    }

    pub async fn count_by_status(db: &mut SqliteConnection) -> sqlx::Result<Vec<(Status, u64)>> {
        let rows: Vec<(Status, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM messages GROUP BY status")
                .fetch_all(db)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(status, count)| (status, count.max(0) as u64))
            .collect())
    }

    /// One page of messages in `status`, ordered by sequence, starting after
    /// `after`. With `locked_before`, only rows claimed before that time.
    pub async fn page(
        db: &mut SqliteConnection,
        status: Status,
        locked_before: Option<i64>,
        after: i64,
        limit: u32,
    ) -> sqlx::Result<Vec<Message>> {
        sqlx::query_as(
            "
            SELECT * FROM messages
            WHERE status = $1
              AND sequence > $2
              AND ($3 IS NULL OR lock_time < $3)
            ORDER BY sequence
            LIMIT $4
            ",
        )
        .bind(status)
        .bind(after)
        .bind(locked_before)
        .bind(limit)
        .fetch_all(db)
        .await
    }
}

#[cfg(test)]
mod tests {
    use sqlx::{Connection, SqliteConnection};

    use super::*;

    async fn setup_db() -> SqliteConnection {
        let mut db = SqliteConnection::connect("sqlite::memory:").await.unwrap();

        sqlx::query(
            "
            CREATE TABLE messages (
                sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL UNIQUE,
                data TEXT NOT NULL,
                status TEXT NOT NULL,
                in_time INTEGER NOT NULL,
                lock_time INTEGER,
                done_time INTEGER
            )
            ",
        )
        .execute(&mut db)
        .await
        .unwrap();

        db
    }

    #[tokio::test]
    async fn insert_respects_maxsize() {
        let mut db = setup_db().await;

        assert_eq!(Message::insert(&mut db, "a", "x", 10, Some(2)).await.unwrap(), Some(1));
        assert_eq!(Message::insert(&mut db, "b", "y", 11, Some(2)).await.unwrap(), Some(2));
        assert_eq!(Message::insert(&mut db, "c", "z", 12, Some(2)).await.unwrap(), None);
        assert_eq!(Message::insert(&mut db, "c", "z", 12, None).await.unwrap(), Some(3));
        assert_eq!(Message::insert(&mut db, "d", "w", 13, Some(0)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn sequence_is_never_reused() {
        let mut db = setup_db().await;

        Message::insert(&mut db, "a", "x", 10, None).await.unwrap();
        Message::insert(&mut db, "b", "y", 11, None).await.unwrap();
        assert_eq!(Message::delete(&mut db, "b").await.unwrap(), 1);

        assert_eq!(Message::insert(&mut db, "c", "z", 12, None).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn both_claim_paths_pick_the_same_row() {
        let mut db = setup_db().await;

        Message::insert(&mut db, "a", "x", 10, None).await.unwrap();
        Message::insert(&mut db, "b", "y", 11, None).await.unwrap();

        let first = Message::claim_returning(&mut db, 100).await.unwrap().unwrap();
        assert_eq!(first.message_id, "a");
        assert_eq!(first.lock_time, Some(100));

        Message::reserve_write(&mut db).await.unwrap();
        let sequence = Message::oldest_free_sequence(&mut db).await.unwrap().unwrap();
        assert_eq!(Message::lock_sequence(&mut db, sequence, 200).await.unwrap(), 1);
        let second = Message::get_by_sequence(&mut db, sequence).await.unwrap().unwrap();
        assert_eq!(second.message_id, "b");
        assert_eq!(second.status, Status::Locked);
        assert_eq!(second.lock_time, Some(200));

        assert_eq!(Message::lock_sequence(&mut db, sequence, 300).await.unwrap(), 0);
        assert!(Message::oldest_free_sequence(&mut db).await.unwrap().is_none());
        assert!(Message::claim_returning(&mut db, 300).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reserve_write_changes_nothing() {
        let mut db = setup_db().await;

        Message::insert(&mut db, "a", "x", 10, None).await.unwrap();
        Message::reserve_write(&mut db).await.unwrap();

        let msg = Message::get(&mut db, "a").await.unwrap().unwrap();
        assert_eq!(msg.status, Status::Free);
        assert_eq!(msg.lock_time, None);
    }

    #[tokio::test]
    async fn lock_time_never_precedes_in_time() {
        let mut db = setup_db().await;

        Message::insert(&mut db, "a", "x", 500, None).await.unwrap();

        let claimed = Message::claim_returning(&mut db, 100).await.unwrap().unwrap();
        assert_eq!(claimed.lock_time, Some(500));

        assert_eq!(Message::finish(&mut db, "a", Status::Done, 50).await.unwrap(), 1);
        let done = Message::get(&mut db, "a").await.unwrap().unwrap();
        assert_eq!(done.done_time, Some(500));
    }

    #[tokio::test]
    async fn finish_only_from_locked() {
        let mut db = setup_db().await;

        Message::insert(&mut db, "a", "x", 10, None).await.unwrap();
        assert_eq!(Message::finish(&mut db, "a", Status::Failed, 20).await.unwrap(), 0);
        assert_eq!(Message::release(&mut db, "a").await.unwrap(), 0);

        Message::claim_returning(&mut db, 30).await.unwrap();
        assert_eq!(Message::finish(&mut db, "a", Status::Failed, 40).await.unwrap(), 1);
        assert_eq!(Message::finish(&mut db, "a", Status::Done, 50).await.unwrap(), 0);
        assert_eq!(Message::finish(&mut db, "missing", Status::Done, 50).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn paging_by_status() {
        let mut db = setup_db().await;

        for (i, id) in ["a", "b", "c", "d"].into_iter().enumerate() {
            Message::insert(&mut db, id, "x", i as i64, None).await.unwrap();
        }
        for now in [100, 200, 300] {
            Message::claim_returning(&mut db, now).await.unwrap();
        }

        let first = Message::page(&mut db, Status::Locked, None, 0, 2).await.unwrap();
        assert_eq!(
            first.iter().map(|m| m.message_id.as_str()).collect::<Vec<_>>(),
            ["a", "b"]
        );

        let rest = Message::page(&mut db, Status::Locked, None, first[1].sequence, 2)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].message_id, "c");

        let stale = Message::page(&mut db, Status::Locked, Some(250), 0, 10).await.unwrap();
        assert_eq!(stale.len(), 2);

        let counts = Message::count_by_status(&mut db).await.unwrap();
        assert!(counts.contains(&(Status::Locked, 3)));
        assert!(counts.contains(&(Status::Free, 1)));
        assert_eq!(Message::count_active(&mut db).await.unwrap(), 4);
    }
}
