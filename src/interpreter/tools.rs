use crate::conversation::DiagramPayload;
use crate::protocol::models::Tool;
use crate::{Error, Result};
use schemars::JsonSchema;
use schemars::schema::RootSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;

pub const DIAGRAM_TOOL: &str = "render_family_tree";
const DIAGRAM_TOOL_DESCRIPTION: &str = "Draw or update the family tree diagram shown to the user. \
Call it whenever you learn a new relative or relationship, passing the whole tree so far.";

/// Shown in place of a diagram when the tool arguments cannot be used.
pub const DIAGRAM_FALLBACK_TEXT: &str =
    "I couldn't draw the family tree from that just now. Let's keep talking and I'll try again.";

/// Arguments of the diagram tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct DiagramArgs {
    /// Mermaid flowchart source describing the family tree so far.
    pub mermaid: String,
    /// One or two sentences describing what the diagram shows.
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub schema: RootSchema,
}

impl ToolDefinition {
    #[must_use]
    pub fn diagram() -> Self {
        Self {
            name: DIAGRAM_TOOL.to_string(),
            description: Some(DIAGRAM_TOOL_DESCRIPTION.to_string()),
            schema: schemars::schema_for!(DiagramArgs),
        }
    }

    /// Convert into the protocol-level tool definition.
    ///
    /// # Errors
    /// Returns an error if schema serialization fails.
    #[allow(clippy::result_large_err)]
    pub fn try_as_tool(&self) -> Result<Tool> {
        let parameters = serde_json::to_value(&self.schema)?;
        Ok(Tool::Function {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters,
        })
    }
}

/// Tools advertised to the provider for every call.
///
/// # Errors
/// Returns an error if a schema cannot be serialized.
#[allow(clippy::result_large_err)]
pub fn session_tools() -> Result<Vec<Tool>> {
    Ok(vec![ToolDefinition::diagram().try_as_tool()?])
}

#[derive(Debug)]
enum CallState {
    AwaitingArguments { name: Option<String>, buffer: String },
    Complete,
}

/// A tool call whose terminating event has arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedCall {
    pub call_id: String,
    pub name: Option<String>,
    pub arguments: String,
}

/// Per-call-id sub-machine: `awaiting-arguments -> complete`.
#[derive(Debug, Default)]
pub struct ToolCallTracker {
    calls: HashMap<String, CallState>,
}

impl ToolCallTracker {
    pub fn announce(&mut self, call_id: &str, name: &str) {
        match self.calls.entry(call_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(CallState::AwaitingArguments {
                    name: Some(name.to_string()),
                    buffer: String::new(),
                });
            }
            Entry::Occupied(mut slot) => {
                if let CallState::AwaitingArguments { name: known, .. } = slot.get_mut() {
                    known.get_or_insert_with(|| name.to_string());
                }
            }
        }
    }

    pub fn append(&mut self, call_id: &str, delta: &str) {
        let state = self
            .calls
            .entry(call_id.to_string())
            .or_insert_with(|| CallState::AwaitingArguments { name: None, buffer: String::new() });
        match state {
            CallState::AwaitingArguments { buffer, .. } => buffer.push_str(delta),
            CallState::Complete => tracing::debug!("Ignoring arguments for completed call {call_id}"),
        }
    }

    /// Close a call. The terminating event's arguments win over the buffered
    /// deltas unless they are empty. Returns `None` for a call that already completed.
    pub fn complete(&mut self, call_id: &str, name: Option<&str>, arguments: &str) -> Option<CompletedCall> {
        let previous = self.calls.insert(call_id.to_string(), CallState::Complete);
        let (known_name, buffered) = match previous {
            Some(CallState::Complete) => return None,
            Some(CallState::AwaitingArguments { name, buffer }) => (name, buffer),
            None => (None, String::new()),
        };

        let arguments = if arguments.trim().is_empty() { buffered } else { arguments.to_string() };
        Some(CompletedCall {
            call_id: call_id.to_string(),
            name: name.map(str::to_string).or(known_name),
            arguments,
        })
    }

    /// Forget completed calls once the response that carried them is done.
    /// Calls still awaiting arguments are kept.
    pub fn forget_completed<'a>(&mut self, call_ids: impl IntoIterator<Item = &'a str>) {
        for call_id in call_ids {
            if matches!(self.calls.get(call_id), Some(CallState::Complete)) {
                self.calls.remove(call_id);
            }
        }
    }

    /// Calls still waiting for their terminating event.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.calls
            .values()
            .filter(|state| matches!(state, CallState::AwaitingArguments { .. }))
            .count()
    }

    #[must_use]
    pub fn tracked(&self) -> usize {
        self.calls.len()
    }
}

/// Run a completed call and produce the diagram it describes.
///
/// # Errors
/// Returns [`Error::ToolArgument`] for an unknown tool, missing or malformed
/// arguments, or an empty diagram source.
#[allow(clippy::result_large_err)]
pub fn execute(call: &CompletedCall) -> Result<DiagramPayload> {
    let name = call.name.as_deref().unwrap_or(DIAGRAM_TOOL);
    if name != DIAGRAM_TOOL {
        return Err(Error::ToolArgument(format!("unknown tool: {name}")));
    }
    if call.arguments.trim().is_empty() {
        return Err(Error::ToolArgument(format!("{name} was called without arguments")));
    }

    let args: DiagramArgs = serde_json::from_str(&call.arguments)
        .map_err(|e| Error::ToolArgument(format!("invalid {name} arguments: {e}")))?;
    if args.mermaid.trim().is_empty() {
        return Err(Error::ToolArgument(format!("{name} needs a non-empty mermaid diagram")));
    }

    Ok(DiagramPayload {
        source: args.mermaid,
        description: args.description,
    })
}
