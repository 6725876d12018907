//! One call per client WebSocket.
//!
//! The socket is split into a reader task (client frames to call commands), a
//! writer task (call updates to client frames) and the call itself, which
//! runs on the upgrade task.

use super::AppState;
use crate::call::recorder::SAMPLE_RATE;
use crate::call::{CallCommand, CallUpdate, MediaSource, MediaStream};
use crate::transport::Frame;
use crate::{Error, Result};
use async_trait::async_trait;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::http::header::USER_AGENT;
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const COMMAND_BUFFER: usize = 256;
const MAX_WS_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Relay-level control frames sent by the client.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
enum ClientControl {
    #[serde(rename = "call.media_ready")]
    MediaReady {
        #[serde(default = "default_sample_rate")]
        sample_rate: u32,
    },
    #[serde(rename = "call.media_denied")]
    MediaDenied {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "call.stop")]
    Stop,
}

const fn default_sample_rate() -> u32 {
    SAMPLE_RATE
}

impl ClientControl {
    fn parse(text: &str) -> Option<Self> {
        if !text.contains("\"call.") {
            return None;
        }
        serde_json::from_str(text).ok()
    }
}

#[derive(Debug)]
enum Announcement {
    Ready(u32),
    Denied(String),
}

pub async fn relay_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    ws.max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, user_agent))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_agent: Option<String>) {
    let (sink, stream) = socket.split();

    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    let mut session = state.manager.open_session(updates_tx).with_user_agent(user_agent);
    tracing::info!("Client connected, call {}", session.id());

    let writer = tokio::spawn(write_updates(sink, updates_rx));

    let (command_tx, mut commands) = mpsc::channel(COMMAND_BUFFER);
    let (announce_tx, announce_rx) = oneshot::channel();
    let accepting = Arc::new(AtomicBool::new(false));
    let reader = tokio::spawn(read_client(stream, command_tx, announce_tx, Arc::clone(&accepting)));

    let mut media = AnnouncedMedia {
        announcement: Some(announce_rx),
        timeout: state.media_timeout,
        sample_rate: state.manager.config().sample_rate,
        accepting,
    };

    match state.manager.start(&mut session, &mut media, &mut commands).await {
        Ok(()) => {
            let reason = state.manager.run(&mut session, &mut commands).await;
            tracing::info!("Call {} ended: {reason:?}", session.id());
        }
        Err(Error::Cancelled) => tracing::info!("Call {} cancelled before connecting", session.id()),
        Err(err) => tracing::warn!("Call {} did not start: {err}", session.id()),
    }

    reader.abort();
    drop(session);
    if let Err(err) = writer.await {
        tracing::debug!("Client writer ended abnormally: {err}");
    }
}

async fn read_client(
    mut stream: SplitStream<WebSocket>,
    commands: mpsc::Sender<CallCommand>,
    announce: oneshot::Sender<Announcement>,
    accepting: Arc<AtomicBool>,
) {
    let mut announce = Some(announce);

    while let Some(message) = stream.next().await {
        let command = match message {
            Ok(Message::Text(text)) => match ClientControl::parse(text.as_str()) {
                Some(ClientControl::MediaReady { sample_rate }) => {
                    resolve(&mut announce, Announcement::Ready(sample_rate));
                    continue;
                }
                Some(ClientControl::MediaDenied { reason }) => {
                    let reason = reason.unwrap_or_else(|| "microphone access was denied".to_string());
                    resolve(&mut announce, Announcement::Denied(reason));
                    continue;
                }
                Some(ClientControl::Stop) => CallCommand::Stop,
                None => CallCommand::Forward(Frame::Text(text.to_string())),
            },
            Ok(Message::Binary(pcm)) => {
                if !accepting.load(Ordering::Acquire) {
                    tracing::debug!("Dropping {} bytes of audio sent before media was ready", pcm.len());
                    continue;
                }
                CallCommand::Audio(pcm)
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Err(err) => {
                tracing::warn!("Client socket error: {err}");
                break;
            }
        };

        if commands.send(command).await.is_err() {
            break;
        }
    }
    tracing::debug!("Client stopped sending");
}

fn resolve(announce: &mut Option<oneshot::Sender<Announcement>>, announcement: Announcement) {
    match announce.take() {
        Some(tx) => {
            let _ = tx.send(announcement);
        }
        None => tracing::debug!("Ignoring repeated media announcement {announcement:?}"),
    }
}

async fn write_updates(mut sink: SplitSink<WebSocket, Message>, mut updates: mpsc::UnboundedReceiver<CallUpdate>) {
    while let Some(update) = updates.recv().await {
        let message = match update {
            CallUpdate::Provider(Frame::Text(text)) => Message::Text(text.into()),
            CallUpdate::Provider(Frame::Binary(bytes)) => Message::Binary(bytes),
            CallUpdate::Relay(event) => match serde_json::to_string(&event) {
                Ok(json) => Message::Text(json.into()),
                Err(err) => {
                    tracing::error!("Failed to serialize relay event: {err}");
                    continue;
                }
            },
        };
        if let Err(err) = sink.send(message).await {
            tracing::debug!("Client socket closed: {err}");
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

/// Microphone announced by the client over the call socket.
struct AnnouncedMedia {
    announcement: Option<oneshot::Receiver<Announcement>>,
    timeout: Duration,
    sample_rate: u32,
    accepting: Arc<AtomicBool>,
}

#[async_trait]
impl MediaSource for AnnouncedMedia {
    async fn acquire(&mut self) -> Result<MediaStream> {
        let announcement = self
            .announcement
            .take()
            .ok_or_else(|| Error::MediaAccess("audio input was already acquired".to_string()))?;

        let rate = match tokio::time::timeout(self.timeout, announcement).await {
            Err(_) => {
                return Err(Error::MediaAccess(format!(
                    "no audio input announced within {}s",
                    self.timeout.as_secs()
                )));
            }
            Ok(Err(_)) => {
                return Err(Error::MediaAccess("client left before announcing audio input".to_string()));
            }
            Ok(Ok(Announcement::Denied(reason))) => return Err(Error::MediaAccess(reason)),
            Ok(Ok(Announcement::Ready(rate))) => rate,
        };
        if rate != self.sample_rate {
            return Err(Error::MediaAccess(format!(
                "unsupported sample rate {rate}, expected {}",
                self.sample_rate
            )));
        }

        self.accepting.store(true, Ordering::Release);
        let accepting = Arc::clone(&self.accepting);
        Ok(MediaStream::new(rate).on_release(move || accepting.store(false, Ordering::Release)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announced(timeout: Duration) -> (oneshot::Sender<Announcement>, AnnouncedMedia) {
        let (tx, rx) = oneshot::channel();
        let media = AnnouncedMedia {
            announcement: Some(rx),
            timeout,
            sample_rate: SAMPLE_RATE,
            accepting: Arc::new(AtomicBool::new(false)),
        };
        (tx, media)
    }

    #[test]
    fn control_frames_are_recognised() {
        assert_eq!(
            ClientControl::parse(r#"{"type":"call.media_ready","sample_rate":24000}"#),
            Some(ClientControl::MediaReady { sample_rate: 24_000 })
        );
        assert_eq!(ClientControl::parse(r#"{"type":"call.stop"}"#), Some(ClientControl::Stop));
        assert_eq!(ClientControl::parse(r#"{"type":"response.create"}"#), None);
        assert_eq!(ClientControl::parse(r#"{"type":"call.unknown"}"#), None);
    }

    #[tokio::test]
    async fn ready_announcement_opens_the_audio_gate() {
        let (tx, mut media) = announced(Duration::from_secs(1));
        tx.send(Announcement::Ready(SAMPLE_RATE)).unwrap();
        let mut stream = media.acquire().await.unwrap();
        assert!(media.accepting.load(Ordering::Acquire));
        stream.release();
        assert!(!media.accepting.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn denial_and_wrong_rate_are_media_errors() {
        let (tx, mut media) = announced(Duration::from_secs(1));
        tx.send(Announcement::Denied("blocked".into())).unwrap();
        assert!(matches!(media.acquire().await, Err(Error::MediaAccess(reason)) if reason == "blocked"));

        let (tx, mut media) = announced(Duration::from_secs(1));
        tx.send(Announcement::Ready(48_000)).unwrap();
        assert!(matches!(media.acquire().await, Err(Error::MediaAccess(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out() {
        let (_tx, mut media) = announced(Duration::from_secs(10));
        assert!(matches!(media.acquire().await, Err(Error::MediaAccess(_))));
    }
}
