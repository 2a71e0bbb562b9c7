//! The transcript of a tutoring session.

use serde::Serialize;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    Child,
    Tutor,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::Child => write!(f, "child"),
            MessageRole::Tutor => write!(f, "tutor"),
        }
    }
}

/// One utterance shown in the transcript. Never mutated after it is logged.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Message {
    /// Rendering key only; carries no ordering.
    pub id: Uuid,
    pub role: MessageRole,
    pub text: String,
}

/// Append-only, creation-ordered list of messages.
#[derive(Debug, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, role: MessageRole, text: impl Into<String>) -> &Message {
        self.messages.push(Message {
            id: Uuid::new_v4(),
            role,
            text: text.into(),
        });
        &self.messages[self.messages.len() - 1]
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drops the whole transcript when a session is torn down.
    pub(crate) fn clear(&mut self) {
        self.messages.clear();
    }
}
