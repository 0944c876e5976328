//! Errors surfaced by pool operations.

use std::time::Duration;

use crate::transport::TransportError;

/// A convenient alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by pool operations.
///
/// Transient wire errors never appear here: retriable RPCs absorb them
/// and fail over. What surfaces is either a pool-level failure or a fatal
/// transport error passed through unchanged.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Every server was dialed twice while opening a connection and none
    /// accepted.
    #[error(
        "an attempt was made to connect to each of the servers twice, \
         but none of the attempts succeeded"
    )]
    AllServersUnavailable,

    /// A checkout waited `pool_timeout` with every creatable connection
    /// already handed out.
    #[error(
        "pool limit of size {size} overflow {overflow} reached, \
         connection timed out, pool_timeout {timeout:?}"
    )]
    NoConnectionAvailable {
        /// Configured steady-state size.
        size: usize,
        /// Overflow counter at the time of failure.
        overflow: i64,
        /// How long the checkout waited.
        timeout: Duration,
    },

    /// An operation failed over more times than `max_retries` allows.
    #[error("retried {retries} times")]
    MaximumRetry {
        /// Consecutive failovers performed before giving up.
        retries: u32,
    },

    /// The pool was asked to do something it cannot do, such as a double
    /// checkin or returning a connection to a pool that does not own it.
    #[error("{0}")]
    InvalidRequest(String),

    /// A fatal transport error, propagated unchanged.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
