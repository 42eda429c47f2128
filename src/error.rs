//! Error taxonomy shared across the agent and the server.
//!
//! The retry policy in `retry` keys off `Error::is_transient`: a transient
//! error is one that is likely to succeed on a later attempt (connection
//! reset, timeout, idle-session database timeouts). Everything else is
//! surfaced to the caller on first failure.

use std::io;
use thiserror::Error;

/// SQLSTATE class for connection exceptions.
const SQLSTATE_CONNECTION_CLASS: &str = "08";
/// SQLSTATE for idle-in-transaction session timeout.
const SQLSTATE_IDLE_IN_TRANSACTION: &str = "25P03";
/// SQLSTATE for idle session timeout.
const SQLSTATE_IDLE_SESSION: &str = "57P05";

/// The error type used throughout ingot.
#[derive(Debug, Error)]
pub enum Error {
    /// The named metric does not exist in storage. Maps to 404 at the HTTP
    /// boundary.
    #[error("the metric was not found")]
    NotFound,
    /// The metric kind is not one of gauge/counter, the kind does not match
    /// the populated payload field, or a numeric literal failed to
    /// parse. Maps to 400 at the HTTP boundary.
    #[error("the metric kind is incorrect: {0}")]
    InvalidKind(String),
    /// A failure that is expected to clear on retry.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The integrity hash sent with a payload does not match the payload.
    #[error("integrity hash mismatch")]
    Integrity,
    /// A request body that could not be unwrapped or parsed. Maps to 400 at
    /// the HTTP boundary.
    #[error("malformed payload: {0}")]
    Payload(String),
    /// Key loading, key parsing or payload decryption failed.
    #[error("encryption failure: {0}")]
    Encryption(String),
    /// Snapshot file I/O failed. Logged and ignored by the snapshot loop.
    #[error("persistence failure: {0}")]
    Persistence(String),
    /// A storage backend failure that is not worth retrying.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl Error {
    /// True if the retry policy should sleep and try again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Classify a network-level I/O error.
    ///
    /// Connection resets, refusals and timeouts are transient. Anything
    /// else is a hard storage failure.
    pub fn from_net(err: &io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock => Error::Transient(err.to_string()),
            _ => Error::Storage(err.to_string()),
        }
    }

    /// Classify an outbound HTTP client error.
    pub fn from_http(err: &reqwest::Error) -> Error {
        if err.is_timeout() || err.is_connect() {
            Error::Transient(err.to_string())
        } else {
            Error::Storage(err.to_string())
        }
    }

    /// Classify a database driver error by SQLSTATE.
    ///
    /// Errors without a SQLSTATE are connection-level failures from the
    /// driver itself and retry the same way a reset socket does. With a
    /// SQLSTATE, only the connection-exception class and the idle-session
    /// timeout codes are transient.
    pub fn from_db(err: &postgres::Error) -> Error {
        match err.code() {
            None => Error::Transient(err.to_string()),
            Some(state) => {
                let code = state.code();
                if code.starts_with(SQLSTATE_CONNECTION_CLASS)
                    || code == SQLSTATE_IDLE_IN_TRANSACTION
                    || code == SQLSTATE_IDLE_SESSION
                {
                    Error::Transient(err.to_string())
                } else {
                    Error::Storage(err.to_string())
                }
            }
        }
    }
}
