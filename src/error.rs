//! Error types for the Moonraker synchronization layer
//!
//! This module provides the error taxonomy used across the transport,
//! discovery and command paths, with structured error codes for
//! machine-readable handling and logging.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for synchronization operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// JSON-RPC code returned when the remote does not know a method
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Error types for Moonraker client operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// `send` was called while no channel was open
    #[error("Socket not connected")]
    NotConnected,

    /// Connection errors (address resolution, handshake)
    #[error("Connection error: {0}")]
    Connection(String),

    /// The remote answered with an `error` object
    #[error("Remote error {code}: {message}")]
    Remote { code: i64, message: String },

    /// No response arrived before the request deadline
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The channel closed while the request was outstanding
    #[error("Channel closed before a response arrived for request {0}")]
    ChannelClosed(u64),

    /// JSON parsing errors
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Response payloads that do not have the expected shape
    #[error("Parsing error: {0}")]
    Parsing(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Object catalog discovery errors
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Structured error code for machine-readable error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Connection errors (1000-1099)
    NotConnected,
    ConnectionFailed,
    ConnectionLost,

    // Configuration errors (1200-1299)
    ConfigurationInvalid,

    // Data errors (1400-1499)
    ParsingFailed,
    InvalidInput,

    // Service errors (1600-1699)
    ServiceTimeout,
    RemoteFailure,
    MethodNotFound,

    // Protocol errors (1700-1799)
    DiscoveryFailed,

    // Internal errors (1900-1999)
    IoFailure,
}

impl ErrorCode {
    /// Get numeric error code
    pub fn as_number(&self) -> u32 {
        match self {
            ErrorCode::NotConnected => 1001,
            ErrorCode::ConnectionFailed => 1002,
            ErrorCode::ConnectionLost => 1003,

            ErrorCode::ConfigurationInvalid => 1202,

            ErrorCode::ParsingFailed => 1401,
            ErrorCode::InvalidInput => 1402,

            ErrorCode::ServiceTimeout => 1602,
            ErrorCode::RemoteFailure => 1603,
            ErrorCode::MethodNotFound => 1604,

            ErrorCode::DiscoveryFailed => 1701,

            ErrorCode::IoFailure => 1901,
        }
    }

    /// Get error category
    pub fn category(&self) -> &'static str {
        match self.as_number() {
            1000..=1099 => "connection",
            1200..=1299 => "configuration",
            1400..=1499 => "data",
            1600..=1699 => "service",
            1700..=1799 => "protocol",
            1900..=1999 => "internal",
            _ => "unknown",
        }
    }
}

impl SyncError {
    /// Create a connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a remote error from a JSON-RPC error object
    pub fn remote<S: Into<String>>(code: i64, message: S) -> Self {
        Self::Remote {
            code,
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a parsing error
    pub fn parsing_error<S: Into<String>>(msg: S) -> Self {
        Self::Parsing(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a discovery error
    pub fn discovery<S: Into<String>>(msg: S) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// True for a remote "method not found" answer, which marks an
    /// optional component that is not installed on the server
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, SyncError::Remote { code, .. } if *code == METHOD_NOT_FOUND)
    }

    /// Map to structured error code
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            SyncError::NotConnected => ErrorCode::NotConnected,
            SyncError::Connection(_) => ErrorCode::ConnectionFailed,
            SyncError::ChannelClosed(_) => ErrorCode::ConnectionLost,
            SyncError::Remote { code, .. } if *code == METHOD_NOT_FOUND => {
                ErrorCode::MethodNotFound
            }
            SyncError::Remote { .. } => ErrorCode::RemoteFailure,
            SyncError::Timeout(_) => ErrorCode::ServiceTimeout,
            SyncError::Json(_) | SyncError::Parsing(_) => ErrorCode::ParsingFailed,
            SyncError::Config(_) => ErrorCode::ConfigurationInvalid,
            SyncError::Discovery(_) => ErrorCode::DiscoveryFailed,
            SyncError::InvalidInput(_) => ErrorCode::InvalidInput,
            SyncError::Io(_) => ErrorCode::IoFailure,
        }
    }

    /// Short identifier used as a structured logging field
    pub fn error_type(&self) -> &'static str {
        match self {
            SyncError::NotConnected => "not_connected",
            SyncError::Connection(_) => "connection_error",
            SyncError::Remote { .. } => "remote_error",
            SyncError::Timeout(_) => "timeout_error",
            SyncError::ChannelClosed(_) => "channel_closed",
            SyncError::Json(_) => "json_error",
            SyncError::Parsing(_) => "parsing_error",
            SyncError::Config(_) => "config_error",
            SyncError::Discovery(_) => "discovery_error",
            SyncError::InvalidInput(_) => "invalid_input_error",
            SyncError::Io(_) => "io_error",
        }
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::NotConnected
                | SyncError::Connection(_)
                | SyncError::Timeout(_)
                | SyncError::ChannelClosed(_)
        )
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::Connection(format!("Invalid address: {err}"))
    }
}
