//! Error types for ssl-proxy

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Proxy error types
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Snippet template could not be parsed or rendered
    #[error("Template error: {0}")]
    Template(String),

    /// A desired-state source could not be read as a whole
    #[error("Source '{source_name}' unavailable: {reason}")]
    Source { source_name: String, reason: String },

    /// The routing engine reload command failed
    #[error("Reload failed: {0}")]
    Reload(String),

    /// Registry entry does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Registry entry already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProxyError {
    /// Shorthand for a whole-source failure
    pub fn source_unavailable(source_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Source {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }
}
