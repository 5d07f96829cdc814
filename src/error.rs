//! Error taxonomy for the exchange layer.
//!
//! Every error is terminal for the exchange instance it was raised on. Errors
//! are handed to the listener that owns the affected pipeline; they are never
//! logged and dropped. Backpressure is *not* an error: a full buffer hands the
//! page back through [`AddPage::Full`](crate::buffer::AddPage::Full).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = ExchangeError> = std::result::Result<T, E>;

/// Errors raised by buffers, handlers and transports.
///
/// `Clone` because one producer fault is fanned out to every pending and
/// future fetch listener of the same sink. Serializable so a remote sink's
/// failure reaches the fetching node intact.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ExchangeError {
    /// The buffer was finished or closed before the operation.
    #[error("exchange buffer is closed")]
    Closed,

    /// A single page can never fit the configured capacity.
    #[error("page of {rows} rows / {bytes} bytes exceeds buffer capacity")]
    PageTooLarge { rows: usize, bytes: usize },

    /// A caller broke the fetch protocol (fetch after finished, response without a request).
    #[error("exchange protocol violation: {0}")]
    ProtocolViolation(String),

    /// An upstream operator failed; recorded on the sink and surfaced to every fetcher.
    #[error("producer failed: {0}")]
    ProducerFailed(String),

    /// The RPC primitive failed to reach a peer or timed out.
    #[error("transport failure talking to {peer}: {reason}")]
    Transport { peer: String, reason: String },

    /// No sink handler is registered under the requested exchange id.
    #[error("no exchange sink registered for id {0}")]
    UnknownExchange(String),

    /// A serialized page or response could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The owning pipeline was cancelled.
    #[error("exchange cancelled: {0}")]
    Cancelled(String),

    /// Page construction rejected malformed column data.
    #[error("invalid page: {0}")]
    InvalidPage(String),

    /// A configuration value is out of range.
    #[error("invalid exchange config: {0}")]
    InvalidConfig(String),
}

impl ExchangeError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn producer(msg: impl Into<String>) -> Self {
        Self::ProducerFailed(msg.into())
    }

    pub fn transport(peer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transport {
            peer: peer.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error came from the transport rather than the exchange itself.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}
