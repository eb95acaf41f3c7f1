//! Error taxonomy for the server engine.
//!
//! Mirrors the three-way split in the design doc: transport failures never
//! escape a connection, startup failures unwind whatever partial state
//! `Server::run` had already constructed, and the `NotFound` surfaced here is
//! the only request-classification outcome that ever reaches a `Result` —
//! every other protocol violation is a `Request::Invalid` value, turned into
//! the `ERROR` wire response by `build_response` without ever being raised as
//! an error (the source's `parseHeader` likewise returns a verdict, not an
//! exception).

use std::{fmt, io};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, NirError>;

#[derive(Debug)]
pub enum NirError {
    /// Accept/read/send/reset failed on a connection's socket. Recovered
    /// locally by resetting the connection; never propagated to a caller.
    Transport(io::Error),
    /// A well-formed `GET XRAY` request referenced an out-of-range index.
    NotFound,
    /// Bind, listen, epoll creation, or worker spawn failed during `run`.
    Startup(io::Error),
}

impl fmt::Display for NirError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NirError::Transport(e) => write!(f, "transport error: {e}"),
            NirError::NotFound => write!(f, "the required index is not available"),
            NirError::Startup(e) => write!(f, "startup error: {e}"),
        }
    }
}

impl std::error::Error for NirError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NirError::Transport(e) | NirError::Startup(e) => Some(e),
            NirError::NotFound => None,
        }
    }
}
