//! Error types for vmreg.
//!
//! Errors fall into two tiers: fatal ones that abort a registration run
//! (connection, authentication, datastore lookup) and per-file ones that are
//! reported and skipped by the batch loop.

use thiserror::Error;

/// Main error type for the vmreg library.
#[derive(Debug, Error)]
pub enum VmregError {
    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Authentication failed for {user}@{host}: {message}")]
    Authentication {
        host: String,
        user: String,
        message: String,
    },

    #[error("Hypervisor API returned {status}: {message}")]
    Api { status: u16, message: String },

    // Inventory lookups
    #[error("Datacenter not found: {name}")]
    DatacenterNotFound { name: String },

    #[error("Datastore not found: {name}")]
    DatastoreNotFound { name: String },

    #[error("Host not found: {name}")]
    HostNotFound { name: String },

    // Path translation
    #[error("Path {path:?} is not under browser root {root:?}")]
    InvalidPath { path: String, root: String },

    // Registration
    #[error("Registration of {path} failed: {message}")]
    Registration { path: String, message: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for vmreg operations.
pub type Result<T> = std::result::Result<T, VmregError>;

impl From<serde_json::Error> for VmregError {
    fn from(err: serde_json::Error) -> Self {
        VmregError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Transport failures without a known time limit keep reqwest's own message;
/// sessions that know their timeout map timeouts to [`VmregError::Timeout`].
impl From<reqwest::Error> for VmregError {
    fn from(err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            format!("Request timed out: {}", err)
        } else {
            err.to_string()
        };
        VmregError::Network {
            message,
            cause: std::error::Error::source(&err).map(|s| s.to_string()),
        }
    }
}

impl From<url::ParseError> for VmregError {
    fn from(err: url::ParseError) -> Self {
        VmregError::Config {
            message: format!("Invalid URL: {}", err),
        }
    }
}

impl VmregError {
    /// Create a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        VmregError::Network {
            message: message.into(),
            cause: None,
        }
    }

    /// Whether this error aborts a whole registration run.
    ///
    /// Per-file problems (bad path, rejected registration) are recoverable;
    /// everything that prevents talking to the host or finding the datastore
    /// is not.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            VmregError::InvalidPath { .. } | VmregError::Registration { .. }
        )
    }
}
