//! Projection of provider events onto the call transcript.
//!
//! [`Interpreter::apply`] takes one event and returns the effects the caller
//! has to carry out (messages to publish, frames to send back). The
//! interpreter itself performs no I/O.

pub mod tools;

use crate::conversation::{Message, SpeechActivity};
use crate::error::ServerError;
use crate::protocol::client_events::ClientEvent;
use crate::protocol::models::{Item, ResponseConfig};
use crate::protocol::server_events::ServerEvent;
use crate::{TRACE_LOG_MAX_BYTES, safe_truncate};
use base64::Engine as _;
use base64::engine::general_purpose;
use serde_json::json;
use std::collections::HashMap;
use tools::{DIAGRAM_FALLBACK_TEXT, ToolCallTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    SessionLifecycle,
    SpeechActivity,
    TranscriptDelta,
    TranscriptDone,
    ToolInvocation,
    ToolInvocationComplete,
    Error,
    AudioOutput,
    Other,
}

impl EventCategory {
    #[must_use]
    pub const fn of(event: &ServerEvent) -> Self {
        match event {
            ServerEvent::SessionCreated { .. }
            | ServerEvent::SessionUpdated { .. }
            | ServerEvent::ResponseCreated { .. }
            | ServerEvent::ResponseDone { .. } => Self::SessionLifecycle,
            ServerEvent::InputAudioBufferSpeechStarted { .. }
            | ServerEvent::InputAudioBufferSpeechStopped { .. }
            | ServerEvent::InputAudioBufferCommitted { .. } => Self::SpeechActivity,
            ServerEvent::ResponseTextDelta { .. } | ServerEvent::ResponseAudioTranscriptDelta { .. } => {
                Self::TranscriptDelta
            }
            ServerEvent::ResponseTextDone { .. }
            | ServerEvent::ResponseAudioTranscriptDone { .. }
            | ServerEvent::InputAudioTranscriptionCompleted { .. } => Self::TranscriptDone,
            ServerEvent::ResponseOutputItemAdded { item: Item::FunctionCall { .. }, .. }
            | ServerEvent::ResponseFunctionCallArgumentsDelta { .. } => Self::ToolInvocation,
            ServerEvent::ResponseFunctionCallArgumentsDone { .. } => Self::ToolInvocationComplete,
            ServerEvent::Error { .. } => Self::Error,
            ServerEvent::ResponseAudioDelta { .. } | ServerEvent::ResponseAudioDone { .. } => {
                Self::AudioOutput
            }
            ServerEvent::ResponseOutputItemAdded { .. }
            | ServerEvent::ResponseOutputItemDone { .. }
            | ServerEvent::ConversationItemCreated { .. }
            | ServerEvent::Unknown(_) => Self::Other,
        }
    }
}

/// Work produced by interpreting one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// A message was appended to the transcript.
    Append(Message),
    /// A control event for the provider.
    Send(ClientEvent),
    Activity(SpeechActivity),
    /// Decoded PCM16 audio spoken by the assistant.
    RemoteAudio(Vec<u8>),
    ProviderError(ServerError),
    /// A recoverable protocol problem worth telling the user about.
    Notice(String),
}

type Handler = fn(&mut Interpreter, &ServerEvent) -> Vec<Effect>;

const fn handler_for(category: EventCategory) -> Handler {
    match category {
        EventCategory::SessionLifecycle => on_session_lifecycle,
        EventCategory::SpeechActivity => on_speech_activity,
        EventCategory::TranscriptDelta => on_transcript_delta,
        EventCategory::TranscriptDone => on_transcript_done,
        EventCategory::ToolInvocation => on_tool_invocation,
        EventCategory::ToolInvocationComplete => on_tool_invocation_complete,
        EventCategory::Error => on_error,
        EventCategory::AudioOutput => on_audio_output,
        EventCategory::Other => on_other,
    }
}

/// Conversation state of one call.
#[derive(Debug, Default)]
pub struct Interpreter {
    messages: Vec<Message>,
    /// In-flight transcript text keyed by response id.
    scratch: HashMap<String, String>,
    tools: ToolCallTracker,
    activity: SpeechActivity,
    greeted: bool,
}

impl Interpreter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &ServerEvent) -> Vec<Effect> {
        let category = EventCategory::of(event);
        tracing::debug!("Interpreting {} as {category:?}", event.event_type());
        handler_for(category)(self, event)
    }

    /// Parse and apply one provider text frame. Unparseable frames yield a
    /// single [`Effect::Notice`] and leave the state untouched.
    pub fn apply_frame(&mut self, text: &str) -> Vec<Effect> {
        match ServerEvent::parse(text) {
            Ok(event) => self.apply(&event),
            Err(err) => {
                tracing::warn!("{err}: {}", safe_truncate(text, TRACE_LOG_MAX_BYTES));
                vec![Effect::Notice(err.to_string())]
            }
        }
    }

    /// Append a message that did not come from the provider.
    pub fn push(&mut self, message: Message) -> Effect {
        self.messages.push(message.clone());
        Effect::Append(message)
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub const fn activity(&self) -> SpeechActivity {
        self.activity
    }

    #[must_use]
    pub fn pending_tool_calls(&self) -> usize {
        self.tools.pending()
    }

    fn set_activity(&mut self, activity: SpeechActivity, effects: &mut Vec<Effect>) {
        if self.activity != activity {
            self.activity = activity;
            effects.push(Effect::Activity(activity));
        }
    }

    fn commit_response_text(&mut self, response_id: &str, final_text: &str) -> Vec<Effect> {
        let buffered = self.scratch.remove(response_id).unwrap_or_default();
        let text = if buffered.trim().is_empty() { final_text.to_string() } else { buffered };
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut effects = vec![self.push(Message::ai(text))];
        self.set_activity(SpeechActivity::Idle, &mut effects);
        effects
    }
}

fn on_session_lifecycle(state: &mut Interpreter, event: &ServerEvent) -> Vec<Effect> {
    match event {
        ServerEvent::SessionCreated { .. } if !state.greeted => {
            state.greeted = true;
            tracing::info!("Provider session created, requesting greeting");
            vec![Effect::Send(ClientEvent::response_create(Some(ResponseConfig::audio_and_text())))]
        }
        // A response that ended without its transcript done event still said something.
        ServerEvent::ResponseDone { response, .. } => {
            state.tools.forget_completed(response.output.iter().filter_map(|item| match item {
                Item::FunctionCall { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            }));
            if state.scratch.contains_key(&response.id) {
                tracing::debug!("Response {} finished with uncommitted transcript", response.id);
                state.commit_response_text(&response.id, "")
            } else {
                Vec::new()
            }
        }
        _ => Vec::new(),
    }
}

fn on_speech_activity(state: &mut Interpreter, event: &ServerEvent) -> Vec<Effect> {
    let mut effects = Vec::new();
    match event {
        ServerEvent::InputAudioBufferSpeechStarted { .. } => {
            state.set_activity(SpeechActivity::Listening, &mut effects);
        }
        ServerEvent::InputAudioBufferSpeechStopped { .. } => {
            state.set_activity(SpeechActivity::Processing, &mut effects);
        }
        _ => {}
    }
    effects
}

fn on_transcript_delta(state: &mut Interpreter, event: &ServerEvent) -> Vec<Effect> {
    match event {
        ServerEvent::ResponseTextDelta { response_id, delta, .. }
        | ServerEvent::ResponseAudioTranscriptDelta { response_id, delta, .. } => {
            state.scratch.entry(response_id.clone()).or_default().push_str(delta);
        }
        _ => {}
    }
    Vec::new()
}

fn on_transcript_done(state: &mut Interpreter, event: &ServerEvent) -> Vec<Effect> {
    match event {
        ServerEvent::ResponseTextDone { response_id, text, .. } => {
            state.commit_response_text(response_id, text)
        }
        ServerEvent::ResponseAudioTranscriptDone { response_id, transcript, .. } => {
            state.commit_response_text(response_id, transcript)
        }
        ServerEvent::InputAudioTranscriptionCompleted { transcript, .. } => {
            let text = transcript.trim();
            if text.is_empty() {
                Vec::new()
            } else {
                vec![state.push(Message::user(text))]
            }
        }
        _ => Vec::new(),
    }
}

fn on_tool_invocation(state: &mut Interpreter, event: &ServerEvent) -> Vec<Effect> {
    match event {
        ServerEvent::ResponseOutputItemAdded { item: Item::FunctionCall { call_id, name, .. }, .. } => {
            tracing::debug!("Tool call {call_id} announced for {name}");
            state.tools.announce(call_id, name);
        }
        ServerEvent::ResponseFunctionCallArgumentsDelta { call_id, delta, .. } => {
            state.tools.append(call_id, delta);
        }
        _ => {}
    }
    Vec::new()
}

fn on_tool_invocation_complete(state: &mut Interpreter, event: &ServerEvent) -> Vec<Effect> {
    let ServerEvent::ResponseFunctionCallArgumentsDone { call_id, name, arguments, .. } = event else {
        return Vec::new();
    };
    let Some(call) = state.tools.complete(call_id, name.as_deref(), arguments) else {
        tracing::debug!("Duplicate completion for tool call {call_id} ignored");
        return Vec::new();
    };

    let (message, output) = match tools::execute(&call) {
        Ok(diagram) => {
            tracing::info!("Rendered family tree diagram for call {}", call.call_id);
            (Message::diagram(diagram), json!({ "status": "rendered" }))
        }
        Err(err) => {
            tracing::warn!("Tool call {} failed: {err}", call.call_id);
            (
                Message::ai(DIAGRAM_FALLBACK_TEXT),
                json!({ "error": { "type": "tool_argument_error", "message": err.to_string() } }),
            )
        }
    };

    vec![
        state.push(message),
        Effect::Send(ClientEvent::item_create(Item::function_call_output(call.call_id, &output))),
        Effect::Send(ClientEvent::response_create(None)),
    ]
}

fn on_error(_state: &mut Interpreter, event: &ServerEvent) -> Vec<Effect> {
    match event {
        ServerEvent::Error { error, .. } => {
            tracing::warn!("Provider error ({:?}): {}", error.error_type, error.message);
            vec![Effect::ProviderError(error.clone())]
        }
        _ => Vec::new(),
    }
}

fn on_audio_output(_state: &mut Interpreter, event: &ServerEvent) -> Vec<Effect> {
    match event {
        ServerEvent::ResponseAudioDelta { delta, .. } => match general_purpose::STANDARD.decode(delta) {
            Ok(pcm) => vec![Effect::RemoteAudio(pcm)],
            Err(err) => vec![Effect::Notice(format!("undecodable audio delta: {err}"))],
        },
        _ => Vec::new(),
    }
}

const fn on_other(_state: &mut Interpreter, _event: &ServerEvent) -> Vec<Effect> {
    Vec::new()
}
