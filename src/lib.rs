#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Realtime voice relay for the family reunion assistant.
//!
//! A browser opens one WebSocket per call. The relay mints an ephemeral
//! provider credential, opens the provider socket, forwards frames both
//! ways, keeps the transcript and a recording, and persists both when the
//! call ends.

pub mod bridge;
pub mod call;
pub mod config;
pub mod conversation;
pub mod error;
pub mod interpreter;
pub mod persistence;
pub mod protocol;
pub mod server;
pub mod transport;

pub use bridge::{ConnectionStatus, TransportBridge};
pub use call::{CallCommand, CallConfig, CallManager, CallUpdate, EndReason, RelayEvent, Session, SessionId};
pub use conversation::{DiagramPayload, Message, Sender, SpeechActivity};
pub use error::{Error, ErrorKind, Result};
pub use interpreter::{Effect, EventCategory, Interpreter};
pub use persistence::{ObjectStoreGateway, PersistenceGateway, TranscriptRecord};
pub use protocol::client_events::ClientEvent;
pub use protocol::server_events::ServerEvent;
pub use protocol::models::{Item, ResponseConfig, SessionConfig, Tool};
pub use transport::{Connector, Credential, CredentialIssuer, Frame, Link};

pub(crate) const TRACE_LOG_MAX_BYTES: usize = 1024;
const TRACE_TRUNCATE_SUFFIX: &str = "... (truncated)";

pub(crate) fn safe_truncate(s: &str, max_bytes: usize) -> std::borrow::Cow<'_, str> {
    if s.len() <= max_bytes {
        return std::borrow::Cow::Borrowed(s);
    }

    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    std::borrow::Cow::Owned(format!(
        "{} {} {} bytes",
        &s[..end],
        TRACE_TRUNCATE_SUFFIX,
        s.len() - end
    ))
}
