use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

use crate::reactor::timer::TimerId;

/// Errors surfaced by reactor operations.
///
/// Dispatch never fails: backend errors during a poll are downgraded to an
/// empty fired set so the loop stays live. Everything here comes from setup
/// paths (creation, registration, resizing) or from explicit lookups.
#[derive(Debug, Error)]
pub enum Error {
    /// The file descriptor does not fit in the reactor's registered set.
    #[error("fd {fd} is outside the reactor capacity")]
    Range { fd: RawFd },

    /// A resize would drop a descriptor that still carries interest.
    #[error("cannot shrink capacity to {requested}: a higher fd is still registered")]
    TooSmall { requested: usize },

    /// No pending timer carries this id.
    #[error("no timer with id {id}")]
    NotFound { id: TimerId },

    /// The OS multiplexing primitive failed.
    #[error("polling backend error: {0}")]
    Backend(#[from] io::Error),
}
