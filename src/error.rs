//! Error taxonomy.
//!
//! Per the three-way split used throughout this stack: malformed wire input
//! is logged at `warn` and the frame is dropped (never surfaced as an
//! `Err`); programmer misuse is returned here as [`NetstackError`]; bug-class
//! conditions (our own emitted bytes failing their own invariants, a resolved
//! destination MAC turning out to be unresolvable) panic, because they mean
//! the stack itself is broken rather than that the caller did something
//! recoverable.

use thiserror::Error;

use crate::addr::Ipv4Address;

/// Errors returned to a caller for misuse of the public API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetstackError {
    /// An operation was attempted on an adapter or socket after `destroy()`/`close()`.
    #[error("use after destroy")]
    Destroyed,

    /// `listen` was called twice for the same `(ip, port)`.
    #[error("already listening on {ip}:{port}")]
    DuplicateListener { ip: Ipv4Address, port: u16 },

    /// `write` was called on a socket that was never connected or accepted.
    #[error("write on a socket that is not registered")]
    UnconnectedWrite,

    /// A hostname or address string could not be parsed as an IPv4 address.
    #[error("not a valid IPv4 address: {0:?}")]
    InvalidHostAddress(String),

    /// A connection key was registered twice without the prior occupant being CLOSED.
    #[error("connection key already registered: {0}")]
    DuplicateConnectionKey(String),
}
