use super::media::MediaStream;
use super::recorder::{AudioBuffer, Track};
use crate::bridge::{ConnectionStatus, TransportBridge};
use crate::conversation::{Message, SpeechActivity};
use crate::error::{Error, ErrorKind};
use crate::interpreter::Interpreter;
use crate::transport::Frame;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Opaque per-call identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    UserEnded,
    Timeout,
    ProviderError,
    RemoteClosed,
    ClientDisconnected,
}

/// Facts about a call recorded alongside its transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMetadata {
    pub user_agent: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub end_reason: EndReason,
}

/// Frames the relay itself sends to the client, next to the forwarded provider traffic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum RelayEvent {
    #[serde(rename = "relay.status")]
    Status { status: ConnectionStatus },
    #[serde(rename = "relay.message")]
    Message { message: Message },
    #[serde(rename = "relay.activity")]
    Activity { activity: SpeechActivity },
    #[serde(rename = "relay.tick")]
    Tick { remaining_seconds: u64 },
    #[serde(rename = "relay.notice")]
    Notice { message: String },
    #[serde(rename = "relay.error")]
    Failure {
        kind: ErrorKind,
        message: String,
        retryable: bool,
    },
}

impl RelayEvent {
    #[must_use]
    pub fn failure(err: &Error) -> Self {
        let kind = err.kind();
        Self::Failure {
            kind,
            message: err.to_string(),
            retryable: kind.is_retryable(),
        }
    }
}

/// Everything the client side of a call needs to hear about.
#[derive(Debug, Clone, PartialEq)]
pub enum CallUpdate {
    /// A provider frame, forwarded untouched.
    Provider(Frame),
    Relay(RelayEvent),
}

/// Input from the client side of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallCommand {
    /// A control frame for the provider, forwarded untouched.
    Forward(Frame),
    /// Raw PCM16 microphone audio.
    Audio(Bytes),
    Stop,
}

/// State of one call. Single use: once stopped, a new call needs a new session.
pub struct Session {
    pub(crate) id: SessionId,
    pub(crate) ceiling: Duration,
    pub(crate) status: ConnectionStatus,
    pub(crate) bridge: TransportBridge,
    pub(crate) inbound: mpsc::UnboundedReceiver<Frame>,
    pub(crate) interpreter: Interpreter,
    pub(crate) audio: Option<AudioBuffer>,
    pub(crate) media: Option<MediaStream>,
    pub(crate) started_at: Option<Instant>,
    pub(crate) started_wall: Option<DateTime<Utc>>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) error_deadline: Option<Instant>,
    pub(crate) stopped: bool,
    pub(crate) end_reason: Option<EndReason>,
    pub(crate) user_agent: Option<String>,
    pub(crate) persistence: Option<JoinHandle<()>>,
    updates: mpsc::UnboundedSender<CallUpdate>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        ceiling: Duration,
        bridge: TransportBridge,
        updates: mpsc::UnboundedSender<CallUpdate>,
    ) -> Self {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        bridge.on_message(move |frame| {
            inbound_tx.send(frame.clone()).map_err(|_| Error::ConnectionClosed)
        });

        Self {
            id,
            ceiling,
            status: ConnectionStatus::Idle,
            bridge,
            inbound,
            interpreter: Interpreter::new(),
            audio: None,
            media: None,
            started_at: None,
            started_wall: None,
            deadline: None,
            error_deadline: None,
            stopped: false,
            end_reason: None,
            user_agent: None,
            persistence: None,
            updates,
        }
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub const fn status(&self) -> ConnectionStatus {
        self.status
    }

    #[must_use]
    pub const fn ceiling(&self) -> Duration {
        self.ceiling
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        self.interpreter.messages()
    }

    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.stopped
    }

    #[must_use]
    pub const fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    #[must_use]
    pub fn bridge_status(&self) -> ConnectionStatus {
        self.bridge.status()
    }

    /// Time left before the ceiling; zero when the call is not running.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// Wait for the background persistence of a stopped call to finish.
    pub async fn wait_persisted(&mut self) {
        if let Some(task) = self.persistence.take() {
            if let Err(err) = task.await {
                tracing::error!("Persistence task for call {} failed: {err}", self.id);
            }
        }
    }

    pub(crate) fn set_status(&mut self, status: ConnectionStatus) {
        if self.status == status {
            return;
        }
        tracing::info!("Call {} is {status:?}", self.id);
        self.status = status;
        self.publish(RelayEvent::Status { status });
    }

    pub(crate) fn publish(&self, event: RelayEvent) {
        self.forward(CallUpdate::Relay(event));
    }

    pub(crate) fn forward(&self, update: CallUpdate) {
        if self.updates.send(update).is_err() {
            tracing::debug!("Client for call {} is gone, update dropped", self.id);
        }
    }

    pub(crate) fn record(&mut self, track: Track, pcm: &[u8]) {
        if let Some(audio) = self.audio.as_mut() {
            audio.append_pcm16(track, pcm);
        }
    }

    pub(crate) fn media_live(&self) -> bool {
        self.media.as_ref().is_some_and(MediaStream::is_live)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("ceiling", &self.ceiling)
            .field("messages", &self.interpreter.messages().len())
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn relay_events_use_relay_namespace() {
        let value = serde_json::to_value(RelayEvent::Status { status: ConnectionStatus::Connected }).unwrap();
        assert_eq!(value, json!({ "type": "relay.status", "status": "connected" }));

        let value = serde_json::to_value(RelayEvent::Tick { remaining_seconds: 42 }).unwrap();
        assert_eq!(value, json!({ "type": "relay.tick", "remaining_seconds": 42 }));
    }

    #[test]
    fn failures_carry_retry_hint() {
        let value = serde_json::to_value(RelayEvent::failure(&Error::MediaAccess("denied".into()))).unwrap();
        assert_eq!(value["type"], "relay.error");
        assert_eq!(value["kind"], "media_access");
        assert_eq!(value["retryable"], true);
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }
}
