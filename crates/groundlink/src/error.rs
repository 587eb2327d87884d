//! Error types for groundlink.
//!
//! Only caller-visible failures live here. Malformed telemetry lines never
//! produce an error (the parser recovers them to a zeroed frame), and read
//! faults inside the link loop are classified by [`crate::link::classify_fault`]
//! instead of being propagated.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// The main error type for groundlink operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Link Errors ===
    /// The serial port could not be opened at connect time.
    #[error("serial port {port} unavailable: {message}")]
    PortUnavailable {
        /// The port name that was requested.
        port: String,
        /// Description of what went wrong.
        message: String,
    },

    /// A baud rate outside the supported set was requested.
    #[error("unsupported baud rate {0} (expected one of 9600, 19200, 57600, 115200, 230400, 460800)")]
    UnsupportedBaud(u32),

    /// A baud rate that is not a number was given.
    #[error("invalid baud rate '{0}' (expected a number such as 115200)")]
    InvalidBaud(String),

    /// A telemetry schema name was not recognized.
    #[error("unknown telemetry schema '{0}' (expected 'attitude' or 'environmental')")]
    UnknownSchema(String),

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Push Channel Errors ===
    /// A push endpoint could not bind its listening socket.
    #[error("failed to bind push endpoint {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An operation timed out.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
    },

    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for groundlink operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Io(err.into())
    }
}

impl Error {
    /// Create a port-unavailable error for the given port.
    #[must_use]
    pub fn port_unavailable(port: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PortUnavailable {
            port: port.into(),
            message: message.into(),
        }
    }

    /// Create a configuration validation error.
    #[must_use]
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this error is a connect-time port failure.
    #[must_use]
    pub fn is_port_unavailable(&self) -> bool {
        matches!(self, Self::PortUnavailable { .. })
    }

    /// Check if this error came from loading or validating configuration.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigLoad(_)
                | Self::ConfigValidation { .. }
                | Self::UnsupportedBaud(_)
                | Self::InvalidBaud(_)
        )
    }
}
