//! Error types for the fstat layer.

use std::io;

use o4_pyforce::P4Error;
use thiserror::Error;

/// Errors from the fstat codec, cache store, and merge iterator.
#[derive(Debug, Error)]
pub enum FstatError {
    /// A line that is neither a record, a comment, nor a passthrough.
    /// Indicates cache corruption or a wire bug — never recovered from.
    #[error("malformed fstat line: {line:?}")]
    Malformed {
        /// The offending line, verbatim.
        line: String,
    },

    /// The fstat request covers more files than the server will scan.
    /// The user must narrow the depot path.
    #[error(
        "p4 refused the fstat request for {depot_path} as too large; \
         sync a narrower path and retry"
    )]
    RequestTooLarge { depot_path: String },

    /// p4 timed out more times than the retry budget allows.
    #[error("too many p4 timeouts retrieving fstat for {depot_path}")]
    TimeoutsExhausted { depot_path: String },

    /// The remote fstat service misbehaved (bad status, bad redirect, …).
    #[error("fstat server: {0}")]
    Server(String),

    #[error(transparent)]
    P4(#[from] P4Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
