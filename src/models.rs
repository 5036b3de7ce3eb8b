use serde::{Deserialize, Serialize};

use crate::message::Status;

/// Row counts per lifecycle state, read in a single query.
#[derive(Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct QueueStats {
    pub free: u64,
    pub locked: u64,
    pub done: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.free + self.locked + self.done + self.failed
    }

    /// Messages counted against capacity, same as `Queue::qsize`.
    pub fn active(&self) -> u64 {
        self.free + self.locked
    }

    pub fn count(&self, status: Status) -> u64 {
        match status {
            Status::Free => self.free,
            Status::Locked => self.locked,
            Status::Done => self.done,
            Status::Failed => self.failed,
        }
    }

    pub(crate) fn record(&mut self, status: Status, count: u64) {
        match status {
            Status::Free => self.free = count,
            Status::Locked => self.locked = count,
            Status::Done => self.done = count,
            Status::Failed => self.failed = count,
        }
    }
}

impl FromIterator<(Status, u64)> for QueueStats {
    fn from_iter<I: IntoIterator<Item = (Status, u64)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(QueueStats::default(), |mut stats, (status, count)| {
                stats.record(status, count);
                stats
            })
    }
}
