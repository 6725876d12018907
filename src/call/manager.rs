use super::media::{MediaSource, MediaStream};
use super::recorder::{AudioBuffer, SAMPLE_RATE, Track};
use super::session::{CallCommand, CallMetadata, CallUpdate, EndReason, RelayEvent, Session, SessionId};
use crate::bridge::{ConnectionStatus, DEFAULT_ERROR_GRACE, TransportBridge};
use crate::conversation::Message;
use crate::interpreter::Effect;
use crate::persistence::PersistenceGateway;
use crate::protocol::client_events::ClientEvent;
use crate::transport::{Connector, CredentialIssuer, Frame};
use crate::{Error, Result};
use base64::Engine as _;
use base64::engine::general_purpose;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

pub const DEFAULT_CEILING: Duration = Duration::from_secs(300);
pub const CLOSING_MESSAGE: &str =
    "Our family tree session has ended. Thank you for sharing your information!";
pub(crate) const MAX_INPUT_AUDIO_CHUNK_BYTES: usize = 15 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Hard limit on call length.
    pub ceiling: Duration,
    /// How often the remaining time is pushed to the client.
    pub tick: Duration,
    /// How long a fatal provider error stays visible before the call ends.
    pub error_grace: Duration,
    pub sample_rate: u32,
    pub closing_message: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ceiling: DEFAULT_CEILING,
            tick: Duration::from_secs(1),
            error_grace: DEFAULT_ERROR_GRACE,
            sample_rate: SAMPLE_RATE,
            closing_message: CLOSING_MESSAGE.to_string(),
        }
    }
}

/// Drives calls from start to persistence.
///
/// A call is `start`ed (media, credential, provider link), then `run` until
/// the user stops it, the ceiling passes, or the provider goes away. `stop`
/// releases everything and hands the transcript and recording to the
/// persistence gateway in the background.
#[derive(Clone)]
pub struct CallManager {
    config: CallConfig,
    issuer: Arc<dyn CredentialIssuer>,
    connector: Arc<dyn Connector>,
    persistence: Arc<dyn PersistenceGateway>,
}

impl CallManager {
    #[must_use]
    pub fn new(
        config: CallConfig,
        issuer: Arc<dyn CredentialIssuer>,
        connector: Arc<dyn Connector>,
        persistence: Arc<dyn PersistenceGateway>,
    ) -> Self {
        Self { config, issuer, connector, persistence }
    }

    #[must_use]
    pub const fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Create an idle session whose client-facing output goes to `updates`.
    #[must_use]
    pub fn open_session(&self, updates: mpsc::UnboundedSender<CallUpdate>) -> Session {
        let bridge =
            TransportBridge::new(Arc::clone(&self.connector)).with_error_grace(self.config.error_grace);
        Session::new(SessionId::generate(), self.config.ceiling, bridge, updates)
    }

    /// Acquire media and open the provider link.
    ///
    /// A `Stop` arriving on `commands` before the link is up, or the client
    /// going away, abandons the attempt and leaves the session idle.
    ///
    /// # Errors
    /// [`Error::MediaAccess`] when the microphone is unavailable,
    /// [`Error::Connection`] when the credential or handshake fails,
    /// [`Error::Cancelled`] when stopped while connecting.
    pub async fn start(
        &self,
        session: &mut Session,
        media: &mut dyn MediaSource,
        commands: &mut mpsc::Receiver<CallCommand>,
    ) -> Result<()> {
        if session.stopped || session.status != ConnectionStatus::Idle {
            return Err(Error::Connection(format!("call {} cannot be started again", session.id)));
        }
        session.set_status(ConnectionStatus::Connecting);

        let outcome = tokio::select! {
            result = establish(self.issuer.as_ref(), media, &mut session.bridge) => Ok(result),
            reason = stop_requested(commands) => Err(reason),
        };

        match outcome {
            Err(reason) => {
                tracing::info!("Call {} abandoned while connecting ({reason:?})", session.id);
                session.bridge.close().await;
                session.stopped = true;
                session.end_reason = Some(reason);
                session.set_status(ConnectionStatus::Idle);
                Err(Error::Cancelled)
            }
            Ok(Err(err)) => {
                tracing::warn!("Call {} failed to start: {err}", session.id);
                session.bridge.close().await;
                session.stopped = true;
                session.set_status(ConnectionStatus::Error);
                session.publish(RelayEvent::failure(&err));
                Err(err)
            }
            Ok(Ok(stream)) => {
                let now = Instant::now();
                session.media = Some(stream);
                session.audio = Some(AudioBuffer::new(self.config.sample_rate, session.ceiling));
                session.started_at = Some(now);
                session.started_wall = Some(Utc::now());
                session.deadline = Some(now + session.ceiling);
                session.set_status(ConnectionStatus::Connected);
                session.publish(RelayEvent::Tick { remaining_seconds: session.ceiling.as_secs() });
                Ok(())
            }
        }
    }

    /// Relay traffic until the call ends, then stop it.
    pub async fn run(&self, session: &mut Session, commands: &mut mpsc::Receiver<CallCommand>) -> EndReason {
        if session.stopped {
            return session.end_reason.unwrap_or(EndReason::UserEnded);
        }
        let Some(deadline) = session.deadline else {
            tracing::warn!("Call {} was never started", session.id);
            self.stop(session, EndReason::UserEnded).await;
            return EndReason::UserEnded;
        };

        let mut bridge_status = session.bridge.subscribe();
        let mut ticker = tokio::time::interval_at(Instant::now() + self.config.tick, self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            let error_deadline = session.error_deadline;
            tokio::select! {
                biased;

                frame = session.inbound.recv() => match frame {
                    Some(frame) => self.on_provider_frame(session, frame),
                    None => break EndReason::RemoteClosed,
                },
                command = commands.recv() => match command {
                    Some(CallCommand::Stop) => break EndReason::UserEnded,
                    Some(command) => on_command(session, command),
                    None => break EndReason::ClientDisconnected,
                },
                () = tokio::time::sleep_until(deadline) => {
                    tracing::info!("Call {} reached its {:?} ceiling", session.id, session.ceiling);
                    let closing = Message::ai(self.config.closing_message.clone());
                    let effect = session.interpreter.push(closing);
                    self.apply_effect(session, effect);
                    break EndReason::Timeout;
                }
                () = tokio::time::sleep_until(error_deadline.unwrap_or(deadline)), if error_deadline.is_some() => {
                    break EndReason::ProviderError;
                }
                _ = ticker.tick() => {
                    session.publish(RelayEvent::Tick { remaining_seconds: session.remaining().as_secs() });
                }
                changed = bridge_status.changed() => {
                    let status = *bridge_status.borrow_and_update();
                    match status {
                        _ if changed.is_err() => break EndReason::RemoteClosed,
                        ConnectionStatus::Idle if session.error_deadline.is_some() => {
                            break EndReason::ProviderError;
                        }
                        ConnectionStatus::Idle => break EndReason::RemoteClosed,
                        ConnectionStatus::Error => self.enter_error(session),
                        _ => {}
                    }
                }
            }
        };

        self.stop(session, reason).await;
        reason
    }

    /// End the call. Idempotent: only the first call releases resources and
    /// schedules persistence.
    pub async fn stop(&self, session: &mut Session, reason: EndReason) {
        if session.stopped {
            tracing::debug!("Call {} already ended", session.id);
            return;
        }
        session.stopped = true;
        session.end_reason = Some(reason);
        session.deadline = None;
        session.error_deadline = None;
        tracing::info!("Ending call {} ({reason:?})", session.id);

        session.set_status(ConnectionStatus::Disconnecting);
        session.bridge.close().await;
        if let Some(mut media) = session.media.take() {
            media.release();
        }

        let job = PersistJob {
            session_id: session.id.clone(),
            messages: session.interpreter.messages().to_vec(),
            audio: session.audio.take(),
            duration: session.elapsed().min(session.ceiling),
            metadata: CallMetadata {
                user_agent: session.user_agent.clone(),
                started_at: session.started_wall,
                end_reason: reason,
            },
        };
        session.persistence = Some(tokio::spawn(persist(Arc::clone(&self.persistence), job)));
        session.set_status(ConnectionStatus::Idle);
    }

    fn on_provider_frame(&self, session: &mut Session, frame: Frame) {
        session.forward(CallUpdate::Provider(frame.clone()));
        match &frame {
            Frame::Text(text) => {
                for effect in session.interpreter.apply_frame(text) {
                    self.apply_effect(session, effect);
                }
            }
            Frame::Binary(pcm) => session.record(Track::Remote, pcm),
        }
    }

    fn apply_effect(&self, session: &mut Session, effect: Effect) {
        match effect {
            Effect::Append(message) => session.publish(RelayEvent::Message { message }),
            Effect::Send(event) => send_event(&session.bridge, &event),
            Effect::Activity(activity) => session.publish(RelayEvent::Activity { activity }),
            Effect::RemoteAudio(pcm) => session.record(Track::Remote, &pcm),
            Effect::ProviderError(error) if error.is_fatal() => {
                tracing::error!("Provider error on call {}: {}", session.id, error.message);
                session.publish(RelayEvent::failure(&Error::Api(error)));
                self.enter_error(session);
            }
            Effect::ProviderError(error) => {
                session.publish(RelayEvent::Notice { message: error.message });
            }
            Effect::Notice(message) => session.publish(RelayEvent::Notice { message }),
        }
    }

    fn enter_error(&self, session: &mut Session) {
        if session.error_deadline.is_none() {
            session.error_deadline = Some(Instant::now() + self.config.error_grace);
            session.set_status(ConnectionStatus::Error);
        }
    }
}

async fn establish(
    issuer: &dyn CredentialIssuer,
    media: &mut dyn MediaSource,
    bridge: &mut TransportBridge,
) -> Result<MediaStream> {
    let stream = media.acquire().await?;
    let credential = issuer.issue().await.map_err(Error::into_connection)?;
    bridge.connect(&credential).await?;
    Ok(stream)
}

/// Resolves once the client asks to stop or goes away, reporting which.
async fn stop_requested(commands: &mut mpsc::Receiver<CallCommand>) -> EndReason {
    while let Some(command) = commands.recv().await {
        if command == CallCommand::Stop {
            return EndReason::UserEnded;
        }
        tracing::debug!("Ignoring client input while connecting");
    }
    EndReason::ClientDisconnected
}

fn on_command(session: &mut Session, command: CallCommand) {
    match command {
        CallCommand::Forward(frame) => {
            if session.media_live() {
                if let Some(pcm) = appended_audio(&frame) {
                    session.record(Track::Local, &pcm);
                }
            }
            session.bridge.send(frame);
        }
        CallCommand::Audio(pcm) => {
            if !session.media_live() {
                tracing::debug!("Dropping microphone audio after release");
                return;
            }
            if pcm.len() > MAX_INPUT_AUDIO_CHUNK_BYTES {
                tracing::warn!("Dropping {} byte audio chunk over the append limit", pcm.len());
                return;
            }
            session.record(Track::Local, &pcm);
            let event = ClientEvent::InputAudioBufferAppend {
                event_id: None,
                audio: general_purpose::STANDARD.encode(&pcm),
            };
            send_event(&session.bridge, &event);
        }
        CallCommand::Stop => {}
    }
}

fn send_event(bridge: &TransportBridge, event: &ClientEvent) {
    match serde_json::to_string(event) {
        Ok(json) => {
            bridge.send(Frame::Text(json));
        }
        Err(err) => tracing::error!("Failed to serialize {}: {err}", event.event_type()),
    }
}

/// Microphone audio carried by a client `input_audio_buffer.append` frame.
fn appended_audio(frame: &Frame) -> Option<Vec<u8>> {
    #[derive(Deserialize)]
    struct Append {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        audio: Option<String>,
    }

    let text = frame.as_text()?;
    if !text.contains("input_audio_buffer.append") {
        return None;
    }
    let append: Append = serde_json::from_str(text).ok()?;
    if append.kind != "input_audio_buffer.append" {
        return None;
    }
    general_purpose::STANDARD.decode(append.audio?).ok()
}

struct PersistJob {
    session_id: SessionId,
    messages: Vec<Message>,
    audio: Option<AudioBuffer>,
    duration: Duration,
    metadata: CallMetadata,
}

async fn persist(gateway: Arc<dyn PersistenceGateway>, job: PersistJob) {
    let PersistJob { session_id, messages, audio, duration, metadata } = job;

    if messages.is_empty() {
        tracing::info!("No messages to save for call {session_id}");
    } else {
        match gateway.save_transcript(&session_id, &messages, duration, &metadata).await {
            Ok(key) => tracing::info!("Saved transcript of call {session_id} to {key}"),
            Err(err) => tracing::error!("Failed to save transcript of call {session_id}: {err}"),
        }
    }

    let Some(buffer) = audio.filter(|buffer| !buffer.is_empty()) else {
        tracing::info!("No audio to save for call {session_id}");
        return;
    };
    let blob = match buffer.finalize() {
        Ok(blob) => blob,
        Err(err) => {
            tracing::error!("Failed to encode audio of call {session_id}: {err}");
            return;
        }
    };
    match gateway.save_audio(&session_id, &blob, duration).await {
        Ok(key) => tracing::info!("Saved audio of call {session_id} to {key}"),
        Err(err) => tracing::error!("Failed to save audio of call {session_id}: {err}"),
    }
}
