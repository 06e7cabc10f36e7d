//! Error types for the EdgeProbe core library

use std::io;
use std::net::AddrParseError;
use thiserror::Error;

/// Result type alias for EdgeProbe operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by every EdgeProbe crate
///
/// Probe failures are deliberately absent: a probe that produced no
/// samples is recorded as the absence of a result row, never as an error.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input shape: invalid IP, start > end, unknown source,
    /// mismatched address family
    #[error("Validation error: {0}")]
    Validation(String),

    /// Range-API HTTP failure after retries
    #[error("Upstream fetch failed: {0}")]
    UpstreamFetch(String),

    /// Range-API response shape unrecognized
    #[error("Unsupported provider API: {0}")]
    UnsupportedProvider(String),

    /// Storage call failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Queue broker reported a status outside the terminal/transient set
    #[error("Unexpected job status '{status}' for job {job}")]
    UnexpectedJobStatus { job: String, status: String },

    /// Cooperative cancellation on shutdown
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O errors with automatic conversion
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Parsing errors for IP addresses and CIDRs
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<AddrParseError> for Error {
    fn from(err: AddrParseError) -> Self {
        Error::Parse(format!("Invalid IP address: {}", err))
    }
}

impl From<ipnetwork::IpNetworkError> for Error {
    fn from(err: ipnetwork::IpNetworkError) -> Self {
        Error::Parse(format!("Invalid IP network: {}", err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(format!("JSON error: {}", err))
    }
}
