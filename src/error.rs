/// Unified error handling for relevo
///
/// This module provides the error taxonomy used across the failover engine:
/// transport failures that trigger failover, query failures that do not,
/// search exhaustion, transaction guards and configuration errors.
use std::fmt;
use std::io;
use thiserror::Error;

pub use crate::config::ConfigError;

/// Main error type for failover operations
#[derive(Debug, Error)]
pub enum FailoverError {
    /// Transport-level failure on a live connection; triggers failover
    #[error("Connectivity error on {host}: {message}")]
    Connectivity { host: String, message: String },

    /// Server answered with an error; the connection itself is healthy
    #[error("Query error: {message}")]
    Query { message: String },

    /// Search exhausted every candidate without satisfying the requested roles
    #[error("No active connection found for {}", describe_roles(.primary, .replica))]
    NoHostFound { primary: bool, replica: bool },

    /// Role switch requested while a transaction is open
    #[error("Trying to change read-only mode during a transaction")]
    InTransaction,

    /// Reconnection budget exhausted
    #[error("Too many reconnection attempts ({attempts})")]
    TooManyAttempts { attempts: u32 },

    /// Read-write routing requested while no primary is connected
    #[error("No primary host is actually connected")]
    NoPrimaryAvailable,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Local I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn describe_roles(primary: &bool, replica: &bool) -> &'static str {
    match (*primary, *replica) {
        (true, true) => "primary and replica",
        (true, false) => "primary",
        (false, true) => "replica",
        (false, false) => "no role",
    }
}

/// Result type alias for failover operations
pub type FailoverResult<T> = Result<T, FailoverError>;

/// Convenience methods for creating specific error types
impl FailoverError {
    /// Create a connectivity error for a host
    pub fn connectivity<H: fmt::Display, S: Into<String>>(host: H, message: S) -> Self {
        FailoverError::Connectivity {
            host: host.to_string(),
            message: message.into(),
        }
    }

    /// Create a query error
    pub fn query<S: Into<String>>(message: S) -> Self {
        FailoverError::Query {
            message: message.into(),
        }
    }

    /// Create a search exhaustion error naming the missing roles
    pub fn no_host_found(primary: bool, replica: bool) -> Self {
        FailoverError::NoHostFound { primary, replica }
    }

    /// Whether this error must start the failover procedure
    pub fn is_connectivity(&self) -> bool {
        matches!(self, FailoverError::Connectivity { .. } | FailoverError::Io(_))
    }

    /// Check if this error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            FailoverError::Connectivity { .. } => true,
            FailoverError::Io(_) => true,
            FailoverError::NoHostFound { .. } => true,
            FailoverError::NoPrimaryAvailable => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            FailoverError::Config(_) => ErrorSeverity::Critical,
            FailoverError::TooManyAttempts { .. } => ErrorSeverity::Critical,
            FailoverError::Connectivity { .. } => ErrorSeverity::Warning,
            FailoverError::Io(_) => ErrorSeverity::Warning,
            FailoverError::NoHostFound { .. } => ErrorSeverity::Warning,
            FailoverError::NoPrimaryAvailable => ErrorSeverity::Warning,
            FailoverError::InTransaction => ErrorSeverity::Info,
            FailoverError::Query { .. } => ErrorSeverity::Error,
        }
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
