//! Crate-level error type.
//!
//! Only failures the operator has to act on end up here. Decode problems are
//! absorbed by the decoder and retryable link failures by the connection
//! manager, so neither has a variant.

use thiserror::Error;

use crate::link::LinkError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The link reported a failure that retrying cannot fix.
    #[error("printer link failed: {0}")]
    Link(#[from] LinkError),

    /// Reconnection gave up after the configured number of attempts.
    #[error("gave up reconnecting after {attempts} attempt(s): {last}")]
    RetriesExhausted { attempts: u32, last: LinkError },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}
