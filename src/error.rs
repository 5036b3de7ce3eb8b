use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Queue is at capacity ({maxsize} outstanding messages)"))]
    CapacityExceeded { maxsize: u64 },

    #[snafu(display("Message not found: {message_id}"))]
    NotFound { message_id: String },

    #[snafu(display("Storage unavailable: {source}"))]
    StorageUnavailable {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Invalid configuration: {message}"))]
    InvalidConfig { message: String },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::StorageUnavailable { source }
    }
}

impl Error {
    pub fn not_found(message_id: impl Into<String>) -> Self {
        Self::NotFound {
            message_id: message_id.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Returns true for failures the caller may reasonably retry later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::CapacityExceeded { .. } => true,
            Self::StorageUnavailable { source } => match source {
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
                sqlx::Error::Database(err) => is_busy(err.as_ref()),
                _ => false,
            },
            Self::NotFound { .. } | Self::InvalidConfig { .. } => false,
        }
    }
}

/// `SQLITE_BUSY` or `SQLITE_LOCKED`, including their extended codes.
fn is_busy(err: &dyn sqlx::error::DatabaseError) -> bool {
    err.code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, 5 | 6))
}
