use std::time::Duration;

use serde::Deserialize;

/// How `pop` turns the oldest free message into a claimed one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ClaimStrategy {
    /// One `UPDATE ... RETURNING` statement claims the row and yields it.
    Returning,
    /// The claim `UPDATE` is followed by a read of the claimed row inside
    /// the same transaction. Used when the engine has no `RETURNING`.
    LockThenFetch,
}

#[derive(Clone, Debug, Deserialize, bon::Builder)]
pub struct Config {
    /// Path of the queue database. `None` or `":memory:"` keeps it in memory.
    #[builder(into)]
    pub db_path: Option<String>,
    /// Upper bound on free + locked messages. `None` is unbounded.
    pub maxsize: Option<u64>,
    /// Keep failed messages when pruning.
    #[serde(default = "default_retain_failed")]
    #[builder(default = true)]
    pub retain_failed: bool,
    /// Forces a claim strategy instead of detecting one from the engine.
    pub claim_strategy: Option<ClaimStrategy>,
    pub busy_timeout_ms: Option<u64>,
    pub max_connections: Option<u32>,
}

fn default_retain_failed() -> bool {
    true
}

impl Config {
    pub const MEMORY: &'static str = ":memory:";

    const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
    const DEFAULT_MAX_CONNECTIONS: u32 = 8;

    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("LITEQ_").from_env::<Self>()?)
    }

    /// Returns the on-disk path, or `None` for an in-memory store.
    pub fn db_path(&self) -> Option<&str> {
        self.db_path
            .as_deref()
            .filter(|path| !path.is_empty() && *path != Self::MEMORY)
    }

    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(Self::DEFAULT_BUSY_TIMEOUT)
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
            .unwrap_or(Self::DEFAULT_MAX_CONNECTIONS)
            .max(1)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}
