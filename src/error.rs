//! Error types.
//!
//! Only database failures (and API misuse) are ever surfaced to a synchronous caller. Cache backend failures are
//! recovered by the repository itself and only make it into the logs.

use std::error::Error as StdError;
use std::fmt::Display;
use std::sync::Arc;

use thiserror::Error;

use crate::types::CacheMode;

type SharedSource = Arc<dyn StdError + Send + Sync + 'static>;

/// A database operation failed.
///
/// The error is cheap to clone: concurrent lookups of the same key share a single load and the outcome, including a
/// failure, is handed to every waiter.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DataAccessError {
    message: String,
    #[source]
    source:  Option<SharedSource>,
}

impl DataAccessError {
    pub fn new<S: ToString>(message: S) -> Self {
        Self {
            message: message.to_string(),
            source:  None,
        }
    }

    /// Wrap a driver error, keeping it as the error source.
    pub fn with_source<S, E>(message: S, source: E) -> Self
    where
        S: Display,
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: format!("{message}: {source}"),
            source:  Some(Arc::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(feature = "sea-orm")]
impl From<sea_orm::DbErr> for DataAccessError {
    fn from(err: sea_orm::DbErr) -> Self {
        Self::with_source("database error", err)
    }
}

/// The distributed cache backend could not be reached or refused the operation.
#[derive(Debug, Clone, Error)]
#[error("cache backend unavailable: {message}")]
pub struct CacheUnavailableError {
    message: String,
    #[source]
    source:  Option<SharedSource>,
}

impl CacheUnavailableError {
    pub fn new<S: ToString>(message: S) -> Self {
        Self {
            message: message.to_string(),
            source:  None,
        }
    }

    pub fn with_source<S, E>(message: S, source: E) -> Self
    where
        S: Display,
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: format!("{message}: {source}"),
            source:  Some(Arc::new(source)),
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CacheUnavailableError {
    fn from(err: redis::RedisError) -> Self {
        Self::with_source("redis", err)
    }
}

#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    CacheUnavailable(#[from] CacheUnavailableError),

    #[error("data access failed: {0}")]
    DataAccess(#[from] DataAccessError),

    #[error("operation '{operation}' is not supported by a {mode} repository")]
    UnsupportedOperation { operation: &'static str, mode: CacheMode },

    #[error("entity '{0}' not found")]
    EntityNotFound(String),

    #[error("cache entry codec: {0}")]
    Codec(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("repository is closed")]
    Closed,
}

impl RepositoryError {
    /// `true` for failures coming from the database.
    pub fn is_data_access(&self) -> bool {
        matches!(self, Self::DataAccess(_))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnsupportedOperation { .. })
    }
}

impl From<postcard::Error> for RepositoryError {
    fn from(err: postcard::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

pub type Result<T, E = RepositoryError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_access_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer gone");
        let err = DataAccessError::with_source("fetch account", io);
        assert_eq!(err.message(), "fetch account: peer gone");
        assert!(err.source().is_some());

        let repo_err: RepositoryError = err.clone().into();
        assert!(repo_err.is_data_access());
        assert_eq!(repo_err.to_string(), "data access failed: fetch account: peer gone");
    }

    #[test]
    fn unsupported_operation_names_the_mode() {
        let err = RepositoryError::UnsupportedOperation {
            operation: "save",
            mode:      CacheMode::ReadOnly,
        };
        assert!(err.is_unsupported());
        assert_eq!(
            err.to_string(),
            "operation 'save' is not supported by a read-only repository"
        );
    }
}
