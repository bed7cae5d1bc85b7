//! Error types for conquer-core
//!
//! The taxonomy follows how each class of failure is handled:
//!
//! - [`TransportError`]: socket and connect failures, recovered locally with
//!   backoff and URL fail-over until the retry limit is exhausted.
//! - [`ProtocolError`]: malformed envelopes and unexpected status codes,
//!   retried when the status says so, escalated otherwise.
//! - [`ServerError`]: an explicit `error` message from the coordinator. Always fatal.
//! - [`SettingsError`]: invalid or missing settings. Fails before any connection attempt.

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for conquer-core
#[derive(Error, Debug)]
pub enum Error {
    /// Socket/connect errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Envelope and status code errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Coordinator-reported errors
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// Settings resolution/validation errors
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    /// The client is shutting down and no longer accepts messages
    #[error("client is stopping, message not accepted")]
    Stopping,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (event loop thread, channel failures, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Whether the operation that produced this error may be attempted again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_retryable(),
            Self::Protocol(err) => err.is_retryable(),
            Self::Io(_) => true,
            Self::Server(_) | Self::Settings(_) | Self::Stopping | Self::Json(_) => false,
            Self::Runtime(_) => false,
        }
    }
}

/// Connection level failures.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connecting to the endpoint failed
    #[error("could not connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    /// The handshake was rejected with an HTTP status
    #[error("server rejected connection to {url} [code: {status}]")]
    Rejected { url: String, status: u16 },

    /// Connecting took longer than the configured timeout
    #[error("connection to {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    /// The socket was closed by the peer or failed mid-session
    #[error("connection closed: {0}")]
    Closed(String),

    /// A configured endpoint is not a websocket URL
    #[error("invalid server URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The legacy HTTP client ran out of attempts
    #[error("server communication error: {0}")]
    Communication(String),

    /// The retry limit was exhausted
    #[error("giving up after {attempts} connection attempt(s) [connection id: {connection_id}]")]
    GaveUp { attempts: u32, connection_id: String },
}

impl TransportError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::GaveUp { .. } | Self::InvalidUrl { .. } | Self::Communication(_)
        )
    }
}

/// Failure to decode an inbound wire envelope.
///
/// Local to the transport client: a frame that fails to decode is logged and
/// skipped, it never reaches `send`/`subscribe` callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Json(String),

    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("missing envelope field '{0}'")]
    MissingField(&'static str),

    #[error("invalid envelope field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("unknown message type '{0}'")]
    UnknownType(String),
}

/// Malformed payloads and unexpected responses.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A wire envelope could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A payload did not have the expected shape
    #[error("malformed {message_type} payload: {reason}")]
    MalformedPayload { message_type: String, reason: String },

    /// An HTTP response carried a non-success status
    #[error("status code={status}, request id={request_id}")]
    Status { status: u16, request_id: String },
}

impl ProtocolError {
    /// 404 and 5xx responses may be retried; any other 4xx is final.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status == 404 || *status >= 500,
            Self::Decode(_) | Self::MalformedPayload { .. } => false,
        }
    }
}

/// Explicit error reported by the coordinator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{title} {body}")]
pub struct ServerError {
    pub title: String,
    pub body: String,
    /// Key/value pairs in the order the server sent them.
    pub meta: Vec<(String, String)>,
}

/// Invalid or missing settings, detected before connecting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("missing {description}, please set '{name}'")]
    Missing {
        name: &'static str,
        description: &'static str,
    },

    #[error("config parameter \"{name}\" must be an integer, but is \"{value}\"")]
    NotAnInteger { name: String, value: String },

    #[error("could not read config file {path}: {reason}")]
    ConfigFile { path: String, reason: String },

    #[error("unsupported key '{0}' in environment variables")]
    UnsupportedKey(String),
}
