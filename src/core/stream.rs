use tracing::debug;

use crate::core::engine::ProviderEvent;
use crate::core::errors::{classify_provider_error, TurnError};
use crate::core::message::{
    ControlMarker, Message, MessageMetadata, Part, Role, ToolInvocationState,
};

/// One unit of normalized output emitted to an external observer during
/// a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    TextDelta {
        text: String,
    },
    TextEnd,
    ToolInputAvailable {
        call_id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolOutputAvailable {
        call_id: String,
        output: String,
    },
    MessageMetadata(MessageMetadata),
    Control(ControlMarker),
    QuestionPending {
        call_id: String,
    },
    QuestionAnswered {
        call_id: String,
    },
    QuestionTimedOut {
        call_id: String,
    },
    Error(TurnError),
    Finish {
        outcome: TurnOutcome,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Cancelled,
    Errored,
}

/// Builds the durable assistant message while translating raw provider
/// events into chunks. Text deltas concatenate into a pending buffer
/// that becomes a text part on TextEnd (or at flush time, whichever
/// comes first).
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    parts: Vec<Part>,
    pending_text: String,
    metadata: MessageMetadata,
    error: Option<TurnError>,
    resume_token_invalid: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps one raw provider event to zero or more chunks, updating the
    /// accumulated parts. A terminal provider error is captured and
    /// converted; it never propagates as a panic or Err.
    pub fn apply(&mut self, event: ProviderEvent) -> Vec<Chunk> {
        match event {
            ProviderEvent::TextDelta(text) => {
                self.pending_text.push_str(&text);
                vec![Chunk::TextDelta { text }]
            }
            ProviderEvent::TextEnd => {
                self.flush_pending_text();
                vec![Chunk::TextEnd]
            }
            ProviderEvent::ToolCall {
                call_id,
                name,
                input,
            } => {
                self.flush_pending_text();
                self.parts
                    .push(Part::tool_call(call_id.clone(), name.clone(), input.clone()));
                vec![Chunk::ToolInputAvailable {
                    call_id,
                    name,
                    input,
                }]
            }
            ProviderEvent::ToolResult { call_id, output } => {
                if !self.attach_tool_output(&call_id, output.clone()) {
                    debug!(call_id = %call_id, "Tool result for unknown call id dropped");
                    return Vec::new();
                }
                vec![Chunk::ToolOutputAvailable { call_id, output }]
            }
            ProviderEvent::Metadata(metadata) => {
                self.metadata.merge(metadata.clone());
                vec![Chunk::MessageMetadata(metadata)]
            }
            ProviderEvent::ResumeToken(token) => {
                let metadata = MessageMetadata {
                    resume_token: Some(token),
                    ..Default::default()
                };
                self.metadata.merge(metadata.clone());
                vec![Chunk::MessageMetadata(metadata)]
            }
            ProviderEvent::Error {
                message,
                resume_token_invalid,
            } => {
                let error = classify_provider_error(&message);
                self.error = Some(error.clone());
                self.resume_token_invalid = resume_token_invalid;
                vec![
                    Chunk::Error(error),
                    Chunk::Finish {
                        outcome: TurnOutcome::Errored,
                    },
                ]
            }
            ProviderEvent::Done => {
                self.flush_pending_text();
                vec![Chunk::Finish {
                    outcome: TurnOutcome::Completed,
                }]
            }
        }
    }

    /// True once a terminal error or Done has been mapped; the drive
    /// loop stops consuming afterwards.
    pub fn is_terminal(chunks: &[Chunk]) -> bool {
        chunks
            .iter()
            .any(|chunk| matches!(chunk, Chunk::Finish { .. }))
    }

    pub fn flush_pending_text(&mut self) {
        if self.pending_text.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.pending_text);
        self.parts.push(Part::Text { text });
    }

    pub fn attach_tool_output(&mut self, call_id: &str, output: String) -> bool {
        for part in &mut self.parts {
            if let Part::ToolInvocation {
                call_id: id,
                state,
                output: slot,
                ..
            } = part
            {
                if id == call_id {
                    *state = ToolInvocationState::Result;
                    *slot = Some(output);
                    return true;
                }
            }
        }
        false
    }

    pub fn push_control(&mut self, marker: ControlMarker) {
        self.parts.push(Part::Control { marker });
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    pub fn error(&self) -> Option<&TurnError> {
        self.error.as_ref()
    }

    pub fn set_error(&mut self, error: TurnError) {
        self.error = Some(error);
    }

    pub fn resume_token_invalid(&self) -> bool {
        self.resume_token_invalid
    }

    pub fn has_parts(&self) -> bool {
        !self.parts.is_empty() || !self.pending_text.is_empty()
    }

    /// Drains the accumulated state into one assistant message,
    /// finalizing any residual text buffer first. A captured turn error
    /// becomes the final part, so the failure is stored with whatever
    /// partial output preceded it.
    pub fn into_message(mut self) -> (Option<Message>, MessageMetadata) {
        self.flush_pending_text();
        if let Some(error) = self.error.take() {
            self.parts.push(Part::Error { error });
        }
        if self.parts.is_empty() {
            return (None, self.metadata);
        }
        let mut message = Message::new(Role::Assistant, self.parts);
        if !self.metadata.is_empty() {
            message.metadata = Some(self.metadata.clone());
        }
        (Some(message), self.metadata)
    }
}
