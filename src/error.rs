//! Error types for the airlock gateway

use std::collections::HashMap;
use std::io;

use thiserror::Error;

/// Result type alias for the airlock gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Airlock gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Provider session failed to open or fetch a schema
    #[error("Connection error for provider '{provider}': {message}")]
    Connection {
        /// Provider name
        provider: String,
        /// Inner cause
        message: String,
    },

    /// Supervisor-level invariant violation or sandbox host unreachable
    #[error("Worker error: {message}")]
    Worker {
        /// What went wrong
        message: String,
        /// Optional diagnostic captures (stdout/stderr, ports, provider id)
        details: Option<HashMap<String, String>>,
    },

    /// The sandbox host returned a failure for the isolate execution
    #[error("Sandbox error [{code}]: {message}")]
    Sandbox {
        /// Short machine-readable code
        code: String,
        /// Human-readable message
        message: String,
        /// HTTP status returned by the host, when any
        status: Option<u16>,
    },

    /// Inputs failed validation at the public API surface
    #[error("Validation error: {0}")]
    Validation(String),

    /// User code contained a disallowed pattern before execution
    #[error("Security error: {0}")]
    Security(String),

    /// The sandbox host exited with a recognizable build failure
    #[error("Build error: {0}")]
    Build(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport-level failure on a provider session
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,
}

impl Error {
    /// Create a connection error
    pub fn connection(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a worker error without details
    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker {
            message: message.into(),
            details: None,
        }
    }

    /// Create a worker error carrying a diagnostic detail map
    pub fn worker_with_details(
        message: impl Into<String>,
        details: HashMap<String, String>,
    ) -> Self {
        Self::Worker {
            message: message.into(),
            details: Some(details),
        }
    }

    /// Create a sandbox error
    pub fn sandbox(
        code: impl Into<String>,
        message: impl Into<String>,
        status: Option<u16>,
    ) -> Self {
        Self::Sandbox {
            code: code.into(),
            message: message.into(),
            status,
        }
    }

    /// True when the error indicates the sandbox host failed to build the worker
    #[must_use]
    pub fn is_build_error(&self) -> bool {
        matches!(self, Self::Build(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_names_provider() {
        let err = Error::connection("github", "spawn failed");
        let msg = err.to_string();
        assert!(msg.contains("github"));
        assert!(msg.contains("spawn failed"));
    }

    #[test]
    fn worker_error_details_roundtrip() {
        let mut details = HashMap::new();
        details.insert("stderr".to_string(), "boom".to_string());
        let err = Error::worker_with_details("host unreachable", details);
        match err {
            Error::Worker { details, .. } => {
                assert_eq!(details.unwrap().get("stderr").unwrap(), "boom");
            }
            other => panic!("unexpected variant: {other}"),
        }
    }

    #[test]
    fn sandbox_error_formats_code() {
        let err = Error::sandbox("EXEC_FAILED", "isolate crashed", Some(500));
        assert!(err.to_string().contains("EXEC_FAILED"));
        assert!(!err.is_build_error());
    }

    #[test]
    fn build_error_is_recognized() {
        assert!(Error::Build("esbuild exited 1".to_string()).is_build_error());
    }
}
