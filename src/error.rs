//! Error types for the completion checker

use thiserror::Error;

/// Errors raised while probing releases or talking to the host
#[derive(Error, Debug)]
pub enum CompletionError {
    /// IO error during network or file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error during secure connection
    #[error("TLS error: {0}")]
    Tls(String),

    /// Connection or read timeout
    #[error("Connection timeout")]
    Timeout,

    /// Invalid reply from a news server
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// NNTP protocol error with response code
    #[error("NNTP error {code}: {message}")]
    Protocol {
        /// NNTP response code (e.g., 481, 502)
        code: u16,
        /// Error message from server
        message: String,
    },

    /// News server rejected the configured credentials
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Host RPC call failed at the application level
    #[error("host RPC error: {0}")]
    Rpc(String),

    /// HTTP transport error talking to the host
    #[error("host HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed JSON-RPC payload from the host
    #[error("host JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed XML-RPC payload from the host
    #[error("host XML error: {0}")]
    Xml(String),

    /// Missing or unparseable environment configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Result type alias using CompletionError
pub type Result<T> = std::result::Result<T, CompletionError>;

/// Reasons a release descriptor cannot produce a probe set
///
/// These never mark a release bad: the release is resumed with a warning so
/// the host can try to process what this extension cannot.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorError {
    /// The queued NZB file does not exist on disk
    #[error("no such NZB file")]
    NoSuchFile,

    /// The NZB carries no group or no article message-IDs
    #[error("invalid NZB file")]
    Invalid,

    /// Every article in the NZB belongs to a par2 file
    #[error("NZB contains no rar articles")]
    NoRarArticles,
}
