//! Error taxonomy for the session engine.
//!
//! Connector failures (`ConnectionError`, `AuthenticationError`) reject the pending
//! connection exactly once. `DispatchError` never leaves the handler registry; it only
//! reaches the log. Everything a caller can observe funnels into [`SessionError`].

use std::time::Duration;

use thiserror::Error;

use crate::stanza::Element;

/// Missing or malformed input detected before any network I/O.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid parameter: {0}")]
pub struct InvalidParameterError(pub String);

impl InvalidParameterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Transport-level failure. `condition` is the server or transport supplied reason.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Connection error: {condition}")]
pub struct ConnectionError {
    pub condition: String,
}

impl ConnectionError {
    pub fn new(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
        }
    }

    pub(crate) fn closed() -> Self {
        Self::new("connection closed")
    }
}

/// Credentials were rejected by the server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Authentication failed: {condition}")]
pub struct AuthenticationError {
    pub condition: String,
}

impl AuthenticationError {
    pub fn new(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
        }
    }
}

/// A handler callback failed or panicked while processing a stanza.
#[derive(Error, Debug, Clone)]
#[error("Handler {handler} failed on <{stanza}>: {reason}")]
pub struct DispatchError {
    pub handler: u64,
    pub stanza: String,
    pub reason: String,
}

/// No correlated response arrived within the configured bound.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Request {id} timed out after {}ms", .timeout.as_millis())]
pub struct RequestTimeoutError {
    pub id: String,
    pub timeout: Duration,
}

/// An `<error/>` payload returned by the server for a request.
#[derive(Error, Debug, Clone)]
#[error("Server returned {error_type} error: {condition}")]
pub struct StanzaError {
    /// `type` attribute of the `<error/>` element (cancel, modify, auth, wait...).
    pub error_type: String,
    /// Defined condition element name, e.g. `item-not-found`.
    pub condition: String,
    pub text: Option<String>,
    pub stanza: Element,
}

#[derive(Error, Debug, Clone)]
pub enum RequestError {
    #[error(transparent)]
    Timeout(#[from] RequestTimeoutError),

    #[error(transparent)]
    Remote(#[from] StanzaError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Malformed XML received from the wire or handed to the parser.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XmlError {
    #[error("XML parse error: {0}")]
    Parse(String),

    #[error("Document ended before the root element was closed")]
    Incomplete,

    #[error("No root element found")]
    Empty,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Failed to serialize value for {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Storage backend rejected {key}: {reason}")]
    Backend { key: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranscriptError {
    #[error("Message {0} is already part of the transcript")]
    DuplicateMessage(String),

    #[error("Message {0} not found")]
    UnknownMessage(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    Env { key: String, value: String },
}

/// Umbrella error returned by account and context operations.
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error(transparent)]
    InvalidParameter(#[from] InvalidParameterError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transcript(#[from] TranscriptError),

    #[error(transparent)]
    Xml(#[from] XmlError),

    #[error("Account {0} already exists")]
    DuplicateAccount(String),

    #[error("Account {0} has been destroyed")]
    AccountDestroyed(String),

    #[error("Pipeline {pipe} stopped: {reason}")]
    Pipeline { pipe: &'static str, reason: String },
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
