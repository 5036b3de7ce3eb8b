//! A persistent task queue backed by a single SQLite file.
//!
//! Producers [`put`](Queue::put) string payloads, consumers
//! [`pop`](Queue::pop) them for exclusive processing and then mark them
//! [`done`](Queue::done) or [`fail`](Queue::fail)ed. There is no broker:
//! every process that can open the file can use the queue, and each
//! operation is one SQLite transaction, so no two consumers ever claim the
//! same message.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod config;
pub mod db;
pub mod error;
pub mod id;
pub mod message;
pub mod models;
pub mod queue;
pub mod recovery;
pub mod utils;

pub use config::{ClaimStrategy, Config};
pub use error::{Error, Result};
pub use message::{Message, Status};
pub use models::QueueStats;
pub use queue::Queue;
pub use utils::now_ns;

/// Installs a global `tracing` subscriber filtered by `LITEQ_LOG`.
///
/// Debug builds log human-readable output, release builds log JSON.
pub fn init_tracing() -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_env_var("LITEQ_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    Ok(())
}
