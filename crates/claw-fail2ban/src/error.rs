//! Error types for request banning.

use thiserror::Error;

/// Errors that can occur while building or running the ban pipeline.
#[derive(Debug, Error)]
pub enum Fail2BanError {
    /// An IP address or CIDR could not be parsed.
    #[error("invalid address {input:?}: {reason}")]
    InvalidAddress {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An entry of an address list could not be parsed.
    #[error("invalid address list entry #{index} ({input:?}): {reason}")]
    InvalidAddressList {
        /// Position of the failing entry in the list.
        index: usize,
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The request carries no transport peer address.
    #[error("request has no peer address")]
    MissingPeerAddr,

    /// The underlying response writer cannot be hijacked.
    #[error("response writer does not support hijacking")]
    HijackUnsupported,

    /// The response was held back for a ban decision and cannot be hijacked.
    #[error("cannot hijack a response held for a ban decision")]
    HijackWhileCaught,

    /// The connection was already taken over.
    #[error("connection already hijacked")]
    AlreadyHijacked,

    /// A status code range could not be parsed.
    #[error("invalid status code range {input:?}: {reason}")]
    InvalidCodeRange {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A duration string could not be parsed.
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    /// A URL pattern is not a valid regular expression.
    #[error("invalid URL pattern {pattern:?}: {source}")]
    InvalidPattern {
        /// The rejected pattern.
        pattern: String,
        /// Underlying regex error.
        #[source]
        source: regex::Error,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A decision handler failed.
    #[error("handler error: {0}")]
    Handler(String),
}

/// Result type for ban pipeline operations.
pub type Fail2BanResult<T> = Result<T, Fail2BanError>;
