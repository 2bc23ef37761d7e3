/// Unified error handling for docwire
///
/// Every failure the client core can surface is a variant of [`DriverError`].
/// Variants carry enough structure (endpoint, timeout, server code) for
/// callers to handle them programmatically, and the retry policy classifies
/// them through [`DriverError::is_retryable`].
use crate::core::Endpoint;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Server error codes that indicate a transient condition on the server side.
///
/// Operations failing with one of these codes may be retried.
pub const TRANSIENT_SERVER_CODES: &[i32] = &[
    6,     // HostUnreachable
    7,     // HostNotFound
    89,    // NetworkTimeout
    91,    // ShutdownInProgress
    189,   // PrimarySteppedDown
    262,   // ExceededTimeLimit
    9001,  // SocketException
    10107, // NotWritablePrimary
    11600, // InterruptedAtShutdown
    11602, // InterruptedDueToReplStateChange
    13435, // NotPrimaryNoSecondaryOk
    13436, // NotPrimaryOrSecondary
];

/// Duplicate key violation reported by the server.
pub const DUPLICATE_KEY_CODE: i32 = 11000;

/// Document failed server-side validation.
pub const DOCUMENT_VALIDATION_CODE: i32 = 121;

/// Main error type for docwire operations
#[derive(Debug, Error)]
pub enum DriverError {
    /// Payload malformed or oversized; a caller bug, never retried
    #[error("Encoding error: {message}")]
    Encoding { message: String },

    /// Caller supplied an argument the client cannot use
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Transport could not be established within the connect timeout
    #[error("Connect to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: Endpoint, timeout: Duration },

    /// Transport could not be established (refused, unresolvable, ...)
    #[error("Connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    /// Handshake exchange failed or the server is incompatible
    #[error("Handshake with {endpoint} failed: {message}")]
    Handshake { endpoint: Endpoint, message: String },

    /// No reply arrived within the socket timeout; the connection is discarded
    #[error("Request to {endpoint} timed out after {timeout:?}")]
    RequestTimeout { endpoint: Endpoint, timeout: Duration },

    /// I/O or framing failure mid-operation; the connection is discarded
    #[error("Stream error on {endpoint}: {message}")]
    Stream { endpoint: Endpoint, message: String },

    /// No pooled connection became available in time
    #[error("Timed out after {timeout:?} waiting for a connection to {endpoint}")]
    PoolTimeout { endpoint: Endpoint, timeout: Duration },

    /// The pool was closed while (or before) waiting for a connection
    #[error("Connection pool for {endpoint} is closed")]
    PoolClosed { endpoint: Endpoint },

    /// Topology has no endpoint matching the selection criteria
    #[error("No suitable server for {criteria}: {details}")]
    NoSuitableServer { criteria: String, details: String },

    /// The server explicitly rejected the operation
    #[error("Server error: {0}")]
    Server(ServerError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The client was shut down
    #[error("Client has been shut down")]
    Shutdown,

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Error reported by the remote server, propagated verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: i32,
    pub code_name: Option<String>,
    pub message: String,
}

impl ServerError {
    pub fn new<S: Into<String>>(code: i32, message: S) -> Self {
        Self {
            code,
            code_name: None,
            message: message.into(),
        }
    }

    /// Whether the code is on the transient allow-list
    pub fn is_transient(&self) -> bool {
        TRANSIENT_SERVER_CODES.contains(&self.code)
    }

    pub fn is_duplicate_key(&self) -> bool {
        self.code == DUPLICATE_KEY_CODE
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code_name {
            Some(name) => write!(f, "{} ({}): {}", name, self.code, self.message),
            None => write!(f, "code {}: {}", self.code, self.message),
        }
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A key that is not part of the closed configuration structure
    #[error("Unknown option '{key}' in {section}")]
    UnknownOption { section: String, key: String },
}

/// Result type alias for docwire operations
pub type DriverResult<T> = Result<T, DriverError>;

/// Convenience methods for creating specific error types
impl DriverError {
    pub fn encoding<S: Into<String>>(message: S) -> Self {
        DriverError::Encoding {
            message: message.into(),
        }
    }

    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        DriverError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn handshake<S: Into<String>>(endpoint: &Endpoint, message: S) -> Self {
        DriverError::Handshake {
            endpoint: endpoint.clone(),
            message: message.into(),
        }
    }

    pub fn stream<S: Into<String>>(endpoint: &Endpoint, message: S) -> Self {
        DriverError::Stream {
            endpoint: endpoint.clone(),
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        DriverError::Internal {
            message: message.into(),
        }
    }

    /// Transport-level failures: the connection (or attempt to open one) is gone
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            DriverError::ConnectTimeout { .. }
                | DriverError::Connect { .. }
                | DriverError::Handshake { .. }
                | DriverError::RequestTimeout { .. }
                | DriverError::Stream { .. }
        )
    }

    /// Check if this error qualifies for the built-in operation retry
    pub fn is_retryable(&self) -> bool {
        match self {
            DriverError::PoolTimeout { .. } => true,
            DriverError::Server(server) => server.is_transient(),
            other => other.is_network_error(),
        }
    }

    /// Code reported by the server, if the server rejected the operation
    pub fn server_code(&self) -> Option<i32> {
        match self {
            DriverError::Server(server) => Some(server.code),
            _ => None,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DriverError::Config(_) => ErrorSeverity::Critical,
            DriverError::Internal { .. } => ErrorSeverity::Critical,
            DriverError::Encoding { .. } | DriverError::InvalidArgument { .. } => {
                ErrorSeverity::Error
            }
            DriverError::Server(server) if server.is_transient() => ErrorSeverity::Warning,
            DriverError::Server(_) => ErrorSeverity::Error,
            DriverError::NoSuitableServer { .. } => ErrorSeverity::Error,
            DriverError::Shutdown | DriverError::PoolClosed { .. } => ErrorSeverity::Info,
            _ => ErrorSeverity::Warning,
        }
    }
}

impl From<ServerError> for DriverError {
    fn from(error: ServerError) -> Self {
        DriverError::Server(error)
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new("localhost", 27017)
    }

    #[test]
    fn test_error_display() {
        let error = DriverError::stream(&endpoint(), "connection reset");
        assert!(matches!(error, DriverError::Stream { .. }));
        assert_eq!(
            error.to_string(),
            "Stream error on localhost:27017: connection reset"
        );

        let server = DriverError::Server(ServerError {
            code: 11000,
            code_name: Some("DuplicateKey".to_string()),
            message: "E11000 duplicate key".to_string(),
        });
        assert_eq!(
            server.to_string(),
            "Server error: DuplicateKey (11000): E11000 duplicate key"
        );
    }

    #[test]
    fn test_error_severity() {
        let config_error = DriverError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        let timeout = DriverError::RequestTimeout {
            endpoint: endpoint(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(timeout.severity(), ErrorSeverity::Warning);
    }

    #[test]
    fn test_network_errors_are_retryable() {
        let refused = DriverError::Connect {
            endpoint: endpoint(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(refused.is_network_error());
        assert!(refused.is_retryable());

        let pool_timeout = DriverError::PoolTimeout {
            endpoint: endpoint(),
            timeout: Duration::from_millis(10),
        };
        assert!(!pool_timeout.is_network_error());
        assert!(pool_timeout.is_retryable());
    }

    #[test]
    fn test_non_retryable_errors() {
        assert!(!DriverError::encoding("too big").is_retryable());
        assert!(!DriverError::NoSuitableServer {
            criteria: "write".to_string(),
            details: "no servers".to_string(),
        }
        .is_retryable());

        let validation = DriverError::from(ServerError::new(
            DOCUMENT_VALIDATION_CODE,
            "Document failed validation",
        ));
        assert!(!validation.is_retryable());
        assert_eq!(validation.server_code(), Some(121));
    }

    #[test]
    fn test_transient_server_codes() {
        let stepped_down = ServerError::new(189, "primary stepped down");
        assert!(stepped_down.is_transient());
        assert!(DriverError::Server(stepped_down).is_retryable());

        let duplicate = ServerError::new(DUPLICATE_KEY_CODE, "dup");
        assert!(duplicate.is_duplicate_key());
        assert!(!duplicate.is_transient());
    }
}
