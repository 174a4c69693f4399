use std::io;

use thiserror::Error;

/// Errors surfaced while constructing an event loop or its transport state.
///
/// Runtime transfer failures never use this type; they are folded into the
/// [`LiftStatus`](crate::LiftStatus) carried by every [`Response`](crate::Response).
#[derive(Debug, Error)]
pub enum Error {
    /// Poller or thread setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The transport's multi interface rejected a setup call.
    #[error("multi setup: {0}")]
    Multi(#[from] curl::MultiError),
    /// A transport handle rejected configuration during setup.
    #[error("transport setup: {0}")]
    Curl(#[from] curl::Error),
    /// Invalid event loop configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

/// Programming misuse detected synchronously on the calling thread.
///
/// A request body and mime fields cannot coexist on one request; whichever
/// is set second fails with this error and leaves the request unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LogicConflict {
    /// `data()` was called after mime fields were added.
    #[error("cannot set request body data after adding mime fields")]
    BodyAfterMimeFields,
    /// `mime_field()` was called after a body was set.
    #[error("cannot add mime fields after setting request body data")]
    MimeFieldAfterBody,
}
