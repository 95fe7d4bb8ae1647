//! Error types for topology monitoring and server selection.
use std::{io, sync};

use thiserror::Error;

/// A type alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Server error codes that indicate the server is no longer primary or is recovering.
const STATE_CHANGE_CODES: [i32; 7] = [10107, 13435, 11600, 11602, 189, 91, 13436];

/// The possible errors raised while monitoring a cluster or selecting a server.
#[derive(Debug, Error)]
pub enum Error {
    /// An invalid argument or configuration value was provided.
    #[error("{0}")]
    ArgumentError(String),

    /// An operation could not be carried out against the cluster.
    #[error("{0}")]
    OperationError(String),

    /// A server reply was missing fields or carried an unexpected value.
    #[error("{0}")]
    ResponseError(String),

    /// A server replied with a command error.
    #[error("command failed with code {code}: {message}")]
    CommandError { code: i32, message: String },

    /// No server matched the selector before the selection timeout elapsed.
    #[error("{message}. Current cluster description: {cluster}")]
    ServerSelectionTimeout { message: String, cluster: String },

    /// The selector cannot be satisfied by waiting, e.g. an invalid max staleness or a
    /// wire version mismatch between the driver and the cluster.
    #[error("server selection failed: {0}")]
    ServerSelectionError(String),

    /// The caller cancelled a pending operation.
    #[error("the operation was cancelled")]
    Cancelled,

    /// The cluster was disposed while the operation was pending.
    #[error("the cluster has been disposed")]
    ClusterDisposed,

    /// An I/O operation did not complete within its deadline.
    #[error("{0} timed out")]
    Timeout(String),

    /// A network-level failure.
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    /// A malformed BSON value was read from a server reply.
    #[error("bson error: {0}")]
    Bson(#[from] bson::document::ValueAccessError),

    /// A lock guarding shared state was poisoned by a panicking thread.
    #[error("lock poisoned")]
    LockError,
}

impl<T> From<sync::PoisonError<T>> for Error {
    fn from(_: sync::PoisonError<T>) -> Error {
        Error::LockError
    }
}

impl Error {
    /// Whether this error came from the network rather than from the server.
    pub fn is_network_error(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }

    /// Whether the server reported that it stepped down or is recovering.
    pub fn is_state_change_error(&self) -> bool {
        match self {
            Error::CommandError { code, message } => {
                STATE_CHANGE_CODES.contains(code)
                    || message.contains("not master")
                    || message.contains("not primary")
                    || message.contains("node is recovering")
            }
            _ => false,
        }
    }

    /// Whether a server selection loop gave up on this error, as opposed to a failure
    /// from the operation itself.
    pub fn is_server_selection_error(&self) -> bool {
        matches!(
            self,
            Error::ServerSelectionTimeout { .. } | Error::ServerSelectionError(_)
        )
    }
}
