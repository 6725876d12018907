use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorType {
    InvalidRequestError,
    RateLimitError,
    AuthenticationError,
    ServerError,
    #[serde(other)]
    Unknown,
}

/// Payload of a provider `error` event.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerError {
    #[serde(rename = "type")]
    pub error_type: ApiErrorType,
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
    #[serde(default)]
    pub param: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
}

impl ServerError {
    /// Request-level rejections leave the session usable; everything else ends the call.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self.error_type, ApiErrorType::InvalidRequestError)
    }
}

/// Coarse failure classes used to decide how far an error propagates.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MediaAccess,
    Connection,
    Protocol,
    ToolArgument,
    Persistence,
    Config,
    Cancelled,
}

impl ErrorKind {
    /// Whether the user can reasonably try the same call again.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::MediaAccess | Self::Connection)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP protocol error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse or serialize JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Header error: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("WAV encoding error: {0}")]
    Wav(#[from] hound::Error),

    #[error("OpenAI API error: {0:?}")]
    Api(ServerError),

    #[error("Media access error: {0}")]
    MediaAccess(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Tool argument error: {0}")]
    ToolArgument(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("The call was stopped before the connection was established")]
    Cancelled,

    #[error("The connection was closed unexpectedly")]
    ConnectionClosed,
}

impl Error {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::WebSocket(_)
            | Self::Http(_)
            | Self::Url(_)
            | Self::Header(_)
            | Self::Api(_)
            | Self::Connection(_)
            | Self::ConnectionClosed => ErrorKind::Connection,
            Self::Serialization(_) | Self::Protocol(_) => ErrorKind::Protocol,
            Self::Io(_) | Self::ObjectStore(_) | Self::Wav(_) | Self::Persistence(_) => {
                ErrorKind::Persistence
            }
            Self::MediaAccess(_) => ErrorKind::MediaAccess,
            Self::ToolArgument(_) => ErrorKind::ToolArgument,
            Self::Config(_) => ErrorKind::Config,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Re-tag a failure that happened while establishing the provider link.
    #[must_use]
    pub fn into_connection(self) -> Self {
        match self {
            Self::Connection(_) | Self::Cancelled => self,
            other => Self::Connection(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
