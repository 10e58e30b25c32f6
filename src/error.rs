//! Error types for Multicon.
//!
//! Defines the main error enum used throughout the crate.

use thiserror::Error;

/// Main error type for Multicon operations.
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// The named profile is missing from the configuration document.
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    /// The database-type tag is not one of the known backends.
    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),

    /// The operation exists but the active backend does not provide it.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// SSH tunnel failures (never fatal to a query, but surfaced from probes).
    #[error("Tunnel error: {0}")]
    Tunnel(String),

    /// Database connection errors (host unreachable, auth failed, etc.)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query execution errors (syntax errors, constraint violations, etc.)
    #[error("Query error: {0}")]
    Query(String),

    /// Configuration errors (invalid YAML, missing required parameters, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cell template errors (unknown placeholder, malformed parameter).
    #[error("Template error: {0}")]
    Template(String),

    /// Internal errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConnectorError {
    /// Creates a profile-not-found error for the given profile name.
    pub fn profile_not_found(name: impl Into<String>) -> Self {
        Self::ProfileNotFound(name.into())
    }

    /// Creates an unsupported-backend error for the given type tag.
    pub fn unsupported_backend(tag: impl Into<String>) -> Self {
        Self::UnsupportedBackend(tag.into())
    }

    /// Creates a not-implemented error naming the operation and backend.
    pub fn not_implemented(operation: &str, backend: &str) -> Self {
        Self::NotImplemented(format!("{operation} is not available for {backend}"))
    }

    /// Creates a tunnel error with the given message.
    pub fn tunnel(msg: impl Into<String>) -> Self {
        Self::Tunnel(msg.into())
    }

    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a query error with the given message.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a template error with the given message.
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::ProfileNotFound(_) => "Profile Not Found",
            Self::UnsupportedBackend(_) => "Unsupported Backend",
            Self::NotImplemented(_) => "Not Implemented",
            Self::Tunnel(_) => "Tunnel Error",
            Self::Connection(_) => "Connection Error",
            Self::Query(_) => "Query Error",
            Self::Config(_) => "Configuration Error",
            Self::Template(_) => "Template Error",
            Self::Internal(_) => "Internal Error",
        }
    }
}

/// Result type alias using ConnectorError.
pub type Result<T> = std::result::Result<T, ConnectorError>;
