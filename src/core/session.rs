use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    Plan,
    Agent,
}

/// One logical, independently resumable conversation thread.
///
/// Created on the first turn for a session id and mutated by every turn
/// after that. The resume token is provider-issued and opaque; it is
/// cleared whenever the provider reports it invalid so the next turn
/// starts fresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub conversation_id: String,
    pub working_dir: PathBuf,
    pub mode: SessionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Set while a generation is running; cleared on every terminal path
    /// so a later load never shows a stuck in-progress state.
    #[serde(default)]
    pub in_progress: bool,
}

impl Session {
    pub fn new(id: impl Into<String>, working_dir: PathBuf, mode: SessionMode) -> Self {
        let id = id.into();
        Self {
            conversation_id: format!("conv-{id}"),
            id,
            working_dir,
            mode,
            resume_token: None,
            messages: Vec::new(),
            in_progress: false,
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// User turns appended after the most recent assistant reply. A prior
    /// cancelled generation leaves these stranded; the next turn folds
    /// them back into its prompt.
    pub fn stranded_user_turns(&self) -> Vec<&Message> {
        let mut stranded = Vec::new();
        for message in self.messages.iter().rev() {
            if message.is_assistant() {
                break;
            }
            if message.is_user() {
                stranded.push(message);
            }
        }
        stranded.reverse();
        stranded
    }

    pub fn clear_resume_token(&mut self) {
        self.resume_token = None;
    }
}
