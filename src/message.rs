//! Message types and lifecycle states.
//!
//! Every message moves through the same small state machine:
//!
//! ```text
//!   put          pop            done / fail
//!  ─────> Free ───────> Locked ─────────────> Done | Failed
//!           ^             │
//!           └─────────────┘
//!               requeue
//! ```
//!
//! Terminal messages (`Done`, `Failed`) are never mutated again; the only
//! thing that can happen to them is deletion, either explicitly or by
//! pruning.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

/// Lifecycle state of a message.
///
/// Stored as lowercase text. Any other value read back from the store fails
/// to decode instead of being silently mapped onto one of these.
#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Status {
    /// Waiting to be claimed
    Free,
    /// Claimed by a consumer, not yet resolved
    Locked,
    /// Processed successfully
    Done,
    /// Processing failed
    Failed,
}

impl Status {
    /// The only state a transition into `self` may start from.
    ///
    /// `Free` is entered from `Locked` by an explicit requeue; insertion is
    /// not a transition.
    pub fn predecessor(self) -> Status {
        match self {
            Status::Free => Status::Locked,
            Status::Locked => Status::Free,
            Status::Done | Status::Failed => Status::Locked,
        }
    }

    /// Counted against the queue's capacity and reported by `qsize`.
    pub fn is_active(self) -> bool {
        match self {
            Status::Free | Status::Locked => true,
            Status::Done | Status::Failed => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn can_transition_to(self, next: Status) -> bool {
        next.predecessor() == self
    }
}

/// A snapshot of one queued message.
///
/// Snapshots are never cached: each one reflects the store at the moment it
/// was read, and another process may change the row right after.
#[derive(Serialize, Deserialize, FromRow, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Unique, time-ordered identifier assigned at insertion
    pub message_id: String,
    /// Caller payload, opaque to the queue
    pub data: String,
    pub status: Status,
    /// Insertion time, nanoseconds since the epoch
    pub in_time: i64,
    /// Time of the most recent claim
    pub lock_time: Option<i64>,
    /// Time the message reached `Done` or `Failed`
    pub done_time: Option<i64>,
    /// Insertion order; decides which free message is claimed next
    pub sequence: i64,
}

impl Message {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time spent between the claim and the final mark.
    pub fn processing_duration(&self) -> Option<TimeDelta> {
        let lock_time = self.lock_time?;
        let done_time = self.done_time?;
        Some(TimeDelta::nanoseconds(done_time - lock_time))
    }

    /// Time spent between insertion and the final mark.
    pub fn total_duration(&self) -> Option<TimeDelta> {
        let done_time = self.done_time?;
        Some(TimeDelta::nanoseconds(done_time - self.in_time))
    }

    /// How long the message has been held by its claimant as of `now_ns`.
    ///
    /// Only meaningful for `Locked` messages; anything else returns `None`.
    pub fn lock_age(&self, now_ns: i64) -> Option<TimeDelta> {
        match self.status {
            Status::Locked => self
                .lock_time
                .map(|lock_time| TimeDelta::nanoseconds(now_ns.saturating_sub(lock_time))),
            Status::Free | Status::Done | Status::Failed => None,
        }
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.in_time)
    }
}
