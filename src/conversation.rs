use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Ai,
    User,
}

/// Family-tree diagram produced by a tool call: Mermaid source plus a caption.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiagramPayload {
    pub source: String,
    pub description: String,
}

/// One immutable entry of the call transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub sender: Sender,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagram: Option<DiagramPayload>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Message {
    #[must_use]
    pub fn ai(text: impl Into<String>) -> Self {
        Self::new(Sender::Ai, text.into(), None)
    }

    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Sender::User, text.into(), None)
    }

    #[must_use]
    pub fn diagram(payload: DiagramPayload) -> Self {
        let text = payload.description.clone();
        Self::new(Sender::Ai, text, Some(payload))
    }

    fn new(sender: Sender, text: String, diagram: Option<DiagramPayload>) -> Self {
        Self {
            sender,
            text,
            diagram,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// What the voice indicator should show.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpeechActivity {
    #[default]
    Idle,
    Listening,
    Processing,
}
