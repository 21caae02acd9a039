//! Error types for the APIToolkit SDK.
//!
//! Only [`BootstrapError::Unauthorized`] and [`ConfigError`] ever reach the
//! host application, and only at construction time. Everything raised while
//! serving traffic is logged and swallowed by the middleware.

use thiserror::Error;

/// Result type alias for APIToolkit operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error returned when building an APIToolkit client or layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Client metadata could not be fetched and the failure is fatal.
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    /// The Pub/Sub sink could not be set up.
    ///
    /// Failures of individual events are logged, never returned.
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable deserialization failed.
    #[error("Configuration error: {0}")]
    Env(#[from] envy::Error),

    /// A redaction field path could not be parsed.
    #[error("Invalid field path `{path}`: {reason}")]
    InvalidPath {
        /// The expression as configured
        path: String,
        /// What the parser rejected
        reason: String,
    },
}

/// Errors raised while fetching client metadata at startup.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The API key was rejected.
    #[error("APIToolkit Error: Invalid API key")]
    Unauthorized,

    /// The metadata endpoint answered with a non-success status.
    #[error("Error getting client metadata: status {0}")]
    Status(u16),

    /// The metadata endpoint could not be reached.
    #[error("Client metadata request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The metadata response body was not understood.
    #[error("Malformed client metadata: {0}")]
    Metadata(String),
}

impl BootstrapError {
    /// Whether this failure should abort construction.
    ///
    /// Anything else leaves the client in the degraded state where traffic is
    /// served normally and no telemetry is emitted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

/// A body could not be redacted.
#[derive(Debug, Error)]
pub enum RedactError {
    /// The body is not valid JSON.
    #[error("Body is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors raised while delivering an event to the ingestion sink.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The event could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The sink could not be reached.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The sink answered with a non-success status.
    #[error("Sink rejected event with status {status}: {body}")]
    Rejected {
        /// HTTP status returned by the sink
        status: u16,
        /// Response body, for diagnostics
        body: String,
    },

    /// The background queue is at capacity.
    #[error("Publish queue is full")]
    QueueFull,

    /// The publisher has been shut down.
    #[error("Publisher is shut down")]
    Closed,
}
