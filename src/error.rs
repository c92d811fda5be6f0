//! Error types for jobgate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{op}: {source}")]
    Database {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("job {0} is not claimed (status is not processing)")]
    NotClaimed(String),

    #[error("collecting {signal}: {message}")]
    Collection {
        signal: &'static str,
        message: String,
    },

    #[error("collecting {0} timed out")]
    CollectionTimeout(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap a database error with the name of the operation that produced it.
    ///
    /// Meant for `map_err`: `.map_err(Error::db("dequeue"))`.
    pub fn db(op: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Error::Database { op, source }
    }

    pub(crate) fn collection(signal: &'static str, message: impl std::fmt::Display) -> Self {
        Error::Collection {
            signal,
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
