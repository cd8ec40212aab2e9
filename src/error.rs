//! Error types for dispatchq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error during {operation}: {message}")]
    Transport {
        operation: &'static str,
        message: String,
        /// Unrecoverable (auth, connectivity); stops ingestion.
        fatal: bool,
    },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// A transient transport failure; retried on the next poll.
    pub fn transient(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Transport {
            operation,
            message: message.into(),
            fatal: false,
        }
    }

    /// A transport failure that must stop the poller.
    pub fn fatal(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Transport {
            operation,
            message: message.into(),
            fatal: true,
        }
    }

    /// Whether this error should terminate the poll loop.
    ///
    /// Database errors count as fatal when the pool cannot be configured, TLS
    /// fails, or the server rejects our credentials or privileges.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Transport { fatal, .. } => *fatal,
            Self::Config(_) => true,
            Self::Database(err) => is_fatal_sqlx(err),
            _ => false,
        }
    }
}

impl Error {
    /// Wrap a database failure from a queue operation as a transport error.
    pub(crate) fn from_sqlx(operation: &'static str, err: sqlx::Error) -> Self {
        Self::Transport {
            operation,
            fatal: is_fatal_sqlx(&err),
            message: err.to_string(),
        }
    }
}

fn is_fatal_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Configuration(_) | sqlx::Error::Tls(_) => true,
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| code.starts_with("28") || code == "42501"),
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, Error>;
