//! Support for recovering messages whose claimant went away.
//!
//! The queue never reclaims a locked message by itself: only the application
//! can tell a crashed consumer from a slow one. What it offers instead is a
//! way to find messages that have been locked for too long, and a way to put
//! them back.
//!
//! ```no_run
//! # async fn sweep(queue: &liteq::Queue) -> liteq::Result<()> {
//! use futures_util::TryStreamExt;
//!
//! let ten_minutes = 10 * 60 * 1_000_000_000;
//! let stale: Vec<_> = queue.list_locked(ten_minutes).try_collect().await?;
//! for message in stale {
//!     queue.requeue(&message.message_id).await?;
//! }
//! # Ok(())
//! # }
//! ```

use futures_util::{stream, Stream, TryStreamExt};

use crate::{
    error::{Error, Result},
    message::{Message, Status},
    queue::Queue,
    utils::now_ns,
};

/// Rows fetched per round trip while scanning.
const PAGE_SIZE: u32 = 64;

impl Queue {
    /// Locked messages claimed more than `older_than_ns` nanoseconds ago,
    /// in sequence order.
    ///
    /// The stream is lazy and reads the store a page at a time without
    /// holding a connection between pages, so it is fine to requeue or fail
    /// messages while iterating. Calling this again starts a fresh scan.
    pub fn list_locked(&self, older_than_ns: i64) -> impl Stream<Item = Result<Message>> + '_ {
        let cutoff = now_ns().saturating_sub(older_than_ns.max(0));
        self.scan(Status::Locked, Some(cutoff))
    }

    /// Every failed message, in sequence order.
    pub fn list_failed(&self) -> impl Stream<Item = Result<Message>> + '_ {
        self.scan(Status::Failed, None)
    }

    /// Returns a locked message to the queue and clears its claim time. The
    /// message keeps its sequence, so it is the next one `pop` hands out if
    /// it is the oldest free message.
    ///
    /// Returns 0, and changes nothing, if the message is not locked.
    pub async fn requeue(&self, message_id: &str) -> Result<u64> {
        let mut tx = self.db().begin().await?;
        let affected = Message::release(&mut *tx, message_id).await?;
        tx.commit().await?;

        tracing::debug!(message_id, affected, "Requeued message");

        Ok(affected)
    }

    fn scan(
        &self,
        status: Status,
        locked_before: Option<i64>,
    ) -> impl Stream<Item = Result<Message>> + '_ {
        stream::try_unfold(Some(0_i64), move |cursor| async move {
            let Some(after) = cursor else {
                return Ok::<_, Error>(None);
            };

            let mut conn = self.db().acquire().await?;
            let page = Message::page(&mut conn, status, locked_before, after, PAGE_SIZE).await?;

            let next = match page.last() {
                Some(last) if page.len() == PAGE_SIZE as usize => Some(last.sequence),
                _ => None,
            };

            Ok(Some((page, next)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, Error>)))
        .try_flatten()
    }
}
