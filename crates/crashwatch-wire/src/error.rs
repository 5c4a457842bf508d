//! Wire client error types.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for statement round trips.
pub type WireResult<T> = Result<T, SendError>;

/// Errors establishing a connection.
#[derive(Debug, Error)]
pub enum ConnError {
    /// Nothing is listening at the address.
    #[error("connection to {addr} refused")]
    Refused { addr: SocketAddr },

    /// The connect attempt did not complete in time.
    #[error("connection to {addr} timed out after {timeout:?}")]
    Timeout { addr: SocketAddr, timeout: Duration },

    /// Any other socket failure while connecting.
    #[error("failed to connect to {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl ConnError {
    pub(crate) fn from_io(addr: SocketAddr, timeout: Duration, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused { addr },
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout { addr, timeout },
            _ => Self::Io { addr, source: err },
        }
    }
}

/// Coarse classification of a failed round trip.
///
/// Callers use this to decide between reconnect-and-retry and giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendErrorKind {
    Timeout,
    ConnectionReset,
    ConnectFailed,
}

/// Errors from a single statement round trip.
#[derive(Debug, Error)]
pub enum SendError {
    /// No complete response arrived before the deadline.
    #[error("statement timed out after {0:?}")]
    Timeout(Duration),

    /// The connection broke while writing or reading.
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// A connection could not be established for the statement.
    #[error(transparent)]
    Connect(#[from] ConnError),
}

impl SendError {
    /// Returns the coarse kind of this failure.
    pub fn kind(&self) -> SendErrorKind {
        match self {
            Self::Timeout(_) => SendErrorKind::Timeout,
            Self::ConnectionReset(_) => SendErrorKind::ConnectionReset,
            Self::Connect(_) => SendErrorKind::ConnectFailed,
        }
    }

    pub(crate) fn from_io(timeout: Duration, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout(timeout),
            _ => Self::ConnectionReset(err.to_string()),
        }
    }
}
