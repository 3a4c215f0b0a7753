use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::errors::TurnError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn is_user(self) -> bool {
        self == Role::User
    }

    pub fn is_assistant(self) -> bool {
        self == Role::Assistant
    }
}

impl AsRef<str> for Role {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl TryFrom<&str> for Role {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(format!("invalid message role: {value}")),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.as_str().to_string()
    }
}

/// Lifecycle of a tool-invocation part: appended in `Call` state when the
/// provider announces the invocation, transitioned to `Result` when output
/// for the same call id arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolInvocationState {
    Call,
    Result,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlMarker {
    /// The conversation history was compacted upstream of this point.
    Compaction,
    /// The turn was interrupted before the provider finished.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Part {
    Text {
        text: String,
    },
    ToolInvocation {
        call_id: String,
        name: String,
        input: serde_json::Value,
        state: ToolInvocationState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    Attachment {
        name: String,
        media_type: String,
        data: String,
    },
    Control {
        marker: ControlMarker,
    },
    /// Classified turn error, recorded with whatever partial parts the
    /// turn produced before failing.
    Error {
        error: TurnError,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn tool_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Part::ToolInvocation {
            call_id: call_id.into(),
            name: name.into(),
            input,
            state: ToolInvocationState::Call,
            output: None,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            Part::ToolInvocation { call_id, .. } => Some(call_id),
            _ => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Part::Text { .. })
    }
}

/// Per-model token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub usage_by_model: HashMap<String, TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
}

impl MessageMetadata {
    /// Field-wise merge; later values win, absent fields leave the
    /// existing value in place.
    pub fn merge(&mut self, other: MessageMetadata) {
        if other.input_tokens.is_some() {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens.is_some() {
            self.output_tokens = other.output_tokens;
        }
        for (model, usage) in other.usage_by_model {
            self.usage_by_model.insert(model, usage);
        }
        if other.checkpoint_id.is_some() {
            self.checkpoint_id = other.checkpoint_id;
        }
        if other.resume_token.is_some() {
            self.resume_token = other.resume_token;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none()
            && self.output_tokens.is_none()
            && self.usage_by_model.is_empty()
            && self.checkpoint_id.is_none()
            && self.resume_token.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            role,
            parts,
            metadata: None,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn is_user(&self) -> bool {
        self.role.is_user()
    }

    pub fn is_assistant(&self) -> bool {
        self.role.is_assistant()
    }

    /// Concatenated text content, used for duplicate-resubmission checks
    /// and stranded-turn merging.
    pub fn rendered_text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let Part::Text { text } = part {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    /// Finds a tool-invocation part by call id and attaches its output,
    /// moving it to the `Result` state.
    pub fn attach_tool_output(&mut self, call_id: &str, payload: String) -> bool {
        for part in &mut self.parts {
            if let Part::ToolInvocation {
                call_id: id,
                state,
                output,
                ..
            } = part
            {
                if id == call_id {
                    *state = ToolInvocationState::Result;
                    *output = Some(payload);
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_role_strings_are_rejected() {
        assert!(Role::try_from("tool").is_err());
        assert_eq!(Role::try_from("assistant"), Ok(Role::Assistant));
    }

    #[test]
    fn tool_output_attaches_by_call_id() {
        let mut message = Message::new(
            Role::Assistant,
            vec![
                Part::text("looking that up"),
                Part::tool_call("call-1", "lookup", serde_json::json!({"q": "mcp"})),
            ],
        );

        assert!(message.attach_tool_output("call-1", "42".to_string()));
        assert!(!message.attach_tool_output("call-2", "nope".to_string()));

        match &message.parts[1] {
            Part::ToolInvocation { state, output, .. } => {
                assert_eq!(*state, ToolInvocationState::Result);
                assert_eq!(output.as_deref(), Some("42"));
            }
            other => panic!("expected tool invocation, got {other:?}"),
        }
    }

    #[test]
    fn metadata_merge_is_last_write_wins_per_field() {
        let mut metadata = MessageMetadata {
            input_tokens: Some(10),
            checkpoint_id: Some("ckpt-1".to_string()),
            ..Default::default()
        };
        metadata.merge(MessageMetadata {
            input_tokens: Some(12),
            output_tokens: Some(3),
            ..Default::default()
        });

        assert_eq!(metadata.input_tokens, Some(12));
        assert_eq!(metadata.output_tokens, Some(3));
        assert_eq!(metadata.checkpoint_id.as_deref(), Some("ckpt-1"));
    }

    #[test]
    fn rendered_text_skips_non_text_parts() {
        let message = Message::new(
            Role::Assistant,
            vec![
                Part::text("a"),
                Part::tool_call("c1", "t", serde_json::Value::Null),
                Part::text("b"),
            ],
        );
        assert_eq!(message.rendered_text(), "a\nb");
    }

    #[test]
    fn parts_round_trip_through_serde() {
        let part = Part::tool_call("call-9", "search", serde_json::json!({"q": 1}));
        let json = serde_json::to_string(&part).expect("serialize");
        let back: Part = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(part, back);

        let part = Part::Error {
            error: TurnError::new(crate::core::errors::TurnErrorKind::RateLimit, "429"),
        };
        let json = serde_json::to_string(&part).expect("serialize");
        let back: Part = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(part, back);
    }
}
