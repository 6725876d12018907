use serde::Deserialize;
use serde_json::Value;
use super::models::{ArbitraryJson, Item, Response};
use crate::error::{Error, Result, ServerError};

/// Provider events the relay interprets. Names follow the beta wire protocol;
/// the GA spellings are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        event_id: String,
        error: ServerError,
    },
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        event_id: String,
        #[serde(default)]
        session: ArbitraryJson,
    },
    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        event_id: String,
        #[serde(default)]
        session: ArbitraryJson,
    },
    #[serde(rename = "input_audio_buffer.speech_started")]
    InputAudioBufferSpeechStarted {
        #[serde(default)]
        event_id: String,
        #[serde(default)]
        audio_start_ms: u32,
        #[serde(default)]
        item_id: String,
    },
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    InputAudioBufferSpeechStopped {
        #[serde(default)]
        event_id: String,
        #[serde(default)]
        audio_end_ms: u32,
        #[serde(default)]
        item_id: String,
    },
    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted {
        #[serde(default)]
        event_id: String,
        #[serde(default)]
        previous_item_id: Option<String>,
        #[serde(default)]
        item_id: String,
    },
    #[serde(rename = "conversation.item.created", alias = "conversation.item.added")]
    ConversationItemCreated {
        #[serde(default)]
        event_id: String,
        #[serde(default)]
        previous_item_id: Option<String>,
        item: Item,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputAudioTranscriptionCompleted {
        #[serde(default)]
        event_id: String,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        content_index: u32,
        transcript: String,
    },
    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        event_id: String,
        response: Response,
    },
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        event_id: String,
        response: Response,
    },
    #[serde(rename = "response.output_item.added")]
    ResponseOutputItemAdded {
        #[serde(default)]
        event_id: String,
        response_id: String,
        #[serde(default)]
        output_index: u32,
        item: Item,
    },
    #[serde(rename = "response.output_item.done")]
    ResponseOutputItemDone {
        #[serde(default)]
        event_id: String,
        response_id: String,
        #[serde(default)]
        output_index: u32,
        item: Item,
    },
    #[serde(rename = "response.text.delta", alias = "response.output_text.delta")]
    ResponseTextDelta {
        #[serde(default)]
        event_id: String,
        response_id: String,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        output_index: u32,
        #[serde(default)]
        content_index: u32,
        delta: String,
    },
    #[serde(rename = "response.text.done", alias = "response.output_text.done")]
    ResponseTextDone {
        #[serde(default)]
        event_id: String,
        response_id: String,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        output_index: u32,
        #[serde(default)]
        content_index: u32,
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "response.audio.delta", alias = "response.output_audio.delta")]
    ResponseAudioDelta {
        #[serde(default)]
        event_id: String,
        response_id: String,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        output_index: u32,
        #[serde(default)]
        content_index: u32,
        delta: String,
    },
    #[serde(rename = "response.audio.done", alias = "response.output_audio.done")]
    ResponseAudioDone {
        #[serde(default)]
        event_id: String,
        response_id: String,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        output_index: u32,
        #[serde(default)]
        content_index: u32,
    },
    #[serde(
        rename = "response.audio_transcript.delta",
        alias = "response.output_audio_transcript.delta"
    )]
    ResponseAudioTranscriptDelta {
        #[serde(default)]
        event_id: String,
        response_id: String,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        output_index: u32,
        #[serde(default)]
        content_index: u32,
        delta: String,
    },
    #[serde(
        rename = "response.audio_transcript.done",
        alias = "response.output_audio_transcript.done"
    )]
    ResponseAudioTranscriptDone {
        #[serde(default)]
        event_id: String,
        response_id: String,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        output_index: u32,
        #[serde(default)]
        content_index: u32,
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "response.function_call_arguments.delta")]
    ResponseFunctionCallArgumentsDelta {
        #[serde(default)]
        event_id: String,
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        output_index: u32,
        call_id: String,
        delta: String,
    },
    #[serde(rename = "response.function_call_arguments.done")]
    ResponseFunctionCallArgumentsDone {
        #[serde(default)]
        event_id: String,
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        output_index: u32,
        call_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        arguments: String,
    },
    #[serde(skip)]
    Unknown(ArbitraryJson),
}

const KNOWN_EVENT_TYPES: &[&str] = &[
    "error",
    "session.created",
    "session.updated",
    "input_audio_buffer.speech_started",
    "input_audio_buffer.speech_stopped",
    "input_audio_buffer.committed",
    "conversation.item.created",
    "conversation.item.added",
    "conversation.item.input_audio_transcription.completed",
    "response.created",
    "response.done",
    "response.output_item.added",
    "response.output_item.done",
    "response.text.delta",
    "response.output_text.delta",
    "response.text.done",
    "response.output_text.done",
    "response.audio.delta",
    "response.output_audio.delta",
    "response.audio.done",
    "response.output_audio.done",
    "response.audio_transcript.delta",
    "response.output_audio_transcript.delta",
    "response.audio_transcript.done",
    "response.output_audio_transcript.done",
    "response.function_call_arguments.delta",
    "response.function_call_arguments.done",
];

impl ServerEvent {
    /// Parse one provider text frame.
    ///
    /// Event types the relay does not interpret come back as [`ServerEvent::Unknown`].
    ///
    /// # Errors
    /// Returns [`Error::Protocol`] when the frame is not a JSON object with a
    /// string `type`, or when a known event type carries a malformed body.
    #[allow(clippy::result_large_err)]
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("frame is not valid JSON: {e}")))?;
        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return Err(Error::Protocol("frame has no type discriminator".to_string()));
        };

        if !KNOWN_EVENT_TYPES.contains(&kind) {
            tracing::debug!("Ignoring uninterpreted event type {kind}");
            return Ok(Self::Unknown(value));
        }

        Self::deserialize(&value).map_err(|e| Error::Protocol(format!("malformed {kind} event: {e}")))
    }

    #[must_use]
    pub fn event_type(&self) -> &str {
        match self {
            Self::Error { .. } => "error",
            Self::SessionCreated { .. } => "session.created",
            Self::SessionUpdated { .. } => "session.updated",
            Self::InputAudioBufferSpeechStarted { .. } => "input_audio_buffer.speech_started",
            Self::InputAudioBufferSpeechStopped { .. } => "input_audio_buffer.speech_stopped",
            Self::InputAudioBufferCommitted { .. } => "input_audio_buffer.committed",
            Self::ConversationItemCreated { .. } => "conversation.item.created",
            Self::InputAudioTranscriptionCompleted { .. } => {
                "conversation.item.input_audio_transcription.completed"
            }
            Self::ResponseCreated { .. } => "response.created",
            Self::ResponseDone { .. } => "response.done",
            Self::ResponseOutputItemAdded { .. } => "response.output_item.added",
            Self::ResponseOutputItemDone { .. } => "response.output_item.done",
            Self::ResponseTextDelta { .. } => "response.text.delta",
            Self::ResponseTextDone { .. } => "response.text.done",
            Self::ResponseAudioDelta { .. } => "response.audio.delta",
            Self::ResponseAudioDone { .. } => "response.audio.done",
            Self::ResponseAudioTranscriptDelta { .. } => "response.audio_transcript.delta",
            Self::ResponseAudioTranscriptDone { .. } => "response.audio_transcript.done",
            Self::ResponseFunctionCallArgumentsDelta { .. } => "response.function_call_arguments.delta",
            Self::ResponseFunctionCallArgumentsDone { .. } => "response.function_call_arguments.done",
            Self::Unknown(value) => value.get("type").and_then(Value::as_str).unwrap_or("unknown"),
        }
    }

    #[must_use]
    pub fn event_id(&self) -> Option<&str> {
        macro_rules! extract {
            ($($variant:ident),*) => {
                match self {
                    $(Self::$variant { event_id, .. } => Some(event_id.as_str()),)*
                    Self::Unknown(value) => value.get("event_id").and_then(Value::as_str),
                }
            };
        }
        extract!(
            Error, SessionCreated, SessionUpdated, InputAudioBufferSpeechStarted,
            InputAudioBufferSpeechStopped, InputAudioBufferCommitted, ConversationItemCreated,
            InputAudioTranscriptionCompleted, ResponseCreated, ResponseDone,
            ResponseOutputItemAdded, ResponseOutputItemDone, ResponseTextDelta, ResponseTextDone,
            ResponseAudioDelta, ResponseAudioDone, ResponseAudioTranscriptDelta,
            ResponseAudioTranscriptDone, ResponseFunctionCallArgumentsDelta,
            ResponseFunctionCallArgumentsDone
        )
        .filter(|id| !id.is_empty())
    }
}
