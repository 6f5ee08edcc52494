use thiserror::Error;

/// Errors raised while loading and compiling a rule set.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Malformed rule set: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid path pattern {template:?}: {source}")]
    PathTemplate {
        template: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid body regex {pattern:?} for path {path:?}: {source}")]
    BodyRegex {
        path: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Failed to read rule file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A single undecodable envelope. The connection stays usable.
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Whether the read loop must stop after this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Malformed(_))
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Tunnel disconnected")]
    Disconnected,

    #[error("Request id {0} is already pending")]
    DuplicateId(String),

    #[error("Failed to send envelope: {0}")]
    Send(#[from] TransportError),
}

/// Failures of the out-of-band response body side channel.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Stream closed before metadata was received: {0}")]
    Truncated(#[source] std::io::Error),

    #[error("Stream metadata of {0} bytes exceeds limit")]
    MetadataTooLarge(u32),

    #[error("Invalid stream metadata: {0}")]
    InvalidMetadata(#[from] serde_json::Error),
}

/// Failures issuing a tunnelled request against a real HTTP endpoint.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid HTTP method {0:?}")]
    InvalidMethod(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
