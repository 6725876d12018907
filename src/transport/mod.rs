pub mod rest;
pub mod ws;

use crate::Result;
use bytes::Bytes;
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

pub use rest::{Credential, CredentialIssuer, RestCredentialIssuer};
pub use ws::{WsConnector, WsLink};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One opaque payload travelling between the browser and the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Peek at a frame just enough to log it. Payloads that start with `{`
    /// are read as JSON control events, anything else is reported by size.
    #[must_use]
    pub fn summary(&self) -> FrameSummary {
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(rename = "type")]
            kind: Option<String>,
            event_id: Option<String>,
        }

        let bytes: &[u8] = match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes.as_ref(),
        };
        if bytes.first() != Some(&b'{') {
            return FrameSummary::Binary { size: bytes.len() };
        }

        match serde_json::from_slice::<Envelope>(bytes) {
            Ok(envelope) => FrameSummary::Event {
                kind: envelope.kind.unwrap_or_else(|| "unknown".to_string()),
                event_id: envelope.event_id,
            },
            Err(_) => FrameSummary::Binary { size: bytes.len() },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameSummary {
    Event { kind: String, event_id: Option<String> },
    Binary { size: usize },
}

impl fmt::Display for FrameSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event { kind, event_id: Some(id) } => write!(f, "{kind} ({id})"),
            Self::Event { kind, event_id: None } => f.write_str(kind),
            Self::Binary { size } => write!(f, "binary message ({size} bytes)"),
        }
    }
}

/// An established, bidirectional connection to the provider.
pub trait Link: Send {
    fn send(&mut self, frame: Frame) -> BoxFuture<'_, Result<()>>;
    /// `Ok(None)` once the remote side has closed the connection.
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<Frame>>>;
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Opens provider links. Swapped for an in-memory connector in tests.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, credential: &'a Credential) -> BoxFuture<'a, Result<Box<dyn Link>>>;
}
