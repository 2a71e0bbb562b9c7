//! Conversation Agent
//!
//! This module adapts a remote chat model into the two operations a tutoring
//! session needs: opening a conversation on a topic and exchanging one turn.
//! Neither operation fails from the caller's point of view. Transport errors
//! are retried with [`RetryPolicy`] and then replaced by a friendly, literal
//! fallback so the child is never left without an answer.

use crate::retry::RetryPolicy;
use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

/// Sent in place of learner text when the child went silent. The personas
/// answer it with a bilingual version of their last utterance.
pub const TIMEOUT_SENTINEL: &str = "TIMEOUT_TRANSLATE";

/// Spoken when the opening call could not reach the model.
pub const FALLBACK_GREETING: &str = "Hi there! 👋 I am ready. (Xin chào!)";

/// Spoken when a turn could not reach the model.
pub const FALLBACK_REPLY: &str = "Cô chưa nghe rõ, bé nói lại nhé? Can you say that again? 👂";

/// Spoken when the model answered a turn with no text.
pub const EMPTY_REPLY: &str = "I didn't catch that.";

const CONVERSATION_PERSONA: &str = r#"You are a warm English teacher talking with a young child (ages 4 to 8).
Goal: help the child communicate naturally in English.
Rules:
- Speak in very short sentences of 3 to 6 words.
- When the child answers correctly, praise gently and ask the next simple question.
- When the child answers incorrectly, correct gently in this form: "😊 Almost! We say: '<correct sentence>'. Can you try again?"
- Stay on child-friendly topics such as family, animals, food and toys. Never discuss sensitive subjects.
- If you receive exactly "TIMEOUT_TRANSLATE", the child did not understand or did not reply. Then:
  1. Translate your last question or statement into Vietnamese.
  2. Repeat the English question or statement.
  Example: "Con tên là gì? What is your name?""#;

const VOCABULARY_PERSONA: &str = r#"You teach single English words about one topic to Vietnamese children (ages 4 to 8).
Rules:
1. Teach exactly ONE English word related to the topic at a time.
2. Always say the word 3 times so the child hears it clearly, e.g. "Apple. Apple. Apple. 🍎".
3. If the child's answer matches the word, even roughly, say "Good job!" with an emoji and move on to the next word, again said 3 times.
4. If the child's answer is wrong or different:
   - Do not move to the next word.
   - Say "Gần đúng rồi!" (Almost!).
   - Explain in Vietnamese how to pronounce it, e.g. "Con đọc là 'Ap-pồ' nhé."
   - Say the English word 2 times.
   - Ask the child to try again.
5. If you receive exactly "TIMEOUT_TRANSLATE", the child is stuck. Reply with the Vietnamese translation of the last word you taught followed by the English word, e.g. "Quả táo. Apple. 🍎""#;

/// Which kind of practice the session runs.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LearningMode {
    Conversation,
    Vocabulary,
}

impl LearningMode {
    /// The fixed system instructions for this mode.
    pub fn persona(&self) -> &'static str {
        match self {
            LearningMode::Conversation => CONVERSATION_PERSONA,
            LearningMode::Vocabulary => VOCABULARY_PERSONA,
        }
    }

    /// The hidden learner message that opens the conversation.
    fn opening_prompt(&self, topic: &str) -> String {
        match self {
            LearningMode::Vocabulary => format!(
                "I want to learn words about {topic}. Please teach me the first word. Remember: Repeat the English word 3 times."
            ),
            LearningMode::Conversation => format!(
                "Hello teacher! I want to talk about {topic}. Please say hello and ask me a simple question about {topic}."
            ),
        }
    }

    /// Used when the model opened the conversation with no text.
    fn empty_greeting(&self, topic: &str) -> String {
        match self {
            LearningMode::Vocabulary => format!("{topic} 🌟"),
            LearningMode::Conversation => format!("Hello! Let's talk about {topic}!"),
        }
    }
}

impl fmt::Display for LearningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LearningMode::Conversation => write!(f, "conversation"),
            LearningMode::Vocabulary => write!(f, "vocabulary"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    Learner,
    Tutor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub text: String,
}

/// Everything the model needs to produce the next tutor turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub instructions: String,
    /// Ordered history, ending with the learner turn to answer.
    pub history: Vec<ChatTurn>,
}

impl ChatRequest {
    /// The learner text this request asks the model to answer.
    pub fn last_learner_text(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|t| t.role == ChatRole::Learner)
            .map(|t| t.text.as_str())
    }
}

/// A remote chat model.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Produces the tutor's next turn. May fail on any transport problem.
    async fn complete(&self, request: &ChatRequest) -> Result<String>;
}

/// The conversation held with the model for one tutoring session.
///
/// Owned by whoever drives the session and lent to the agent for each call.
#[derive(Debug, Clone)]
pub struct AgentSession {
    topic: String,
    mode: LearningMode,
    history: Vec<ChatTurn>,
}

impl AgentSession {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn mode(&self) -> LearningMode {
        self.mode
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }
}

/// Talks to the chat model on behalf of a tutoring session.
pub struct ConversationAgent {
    transport: Arc<dyn ChatTransport>,
    retry: RetryPolicy,
}

impl ConversationAgent {
    pub fn new(transport: Arc<dyn ChatTransport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    /// Opens a conversation about `topic` with the persona for `mode`.
    ///
    /// Returns the new session together with the greeting to speak.
    pub async fn initialize(&self, topic: &str, mode: LearningMode) -> (AgentSession, String) {
        let mut session = AgentSession {
            topic: topic.to_string(),
            mode,
            history: Vec::new(),
        };
        info!(%topic, %mode, "Opening conversation with the chat model");

        let greeting = match self.exchange(&mut session, &mode.opening_prompt(topic)).await {
            Ok(text) if text.trim().is_empty() => mode.empty_greeting(topic),
            Ok(text) => text,
            Err(e) => {
                error!(error = ?e, %topic, "Failed to open conversation, using fallback greeting");
                FALLBACK_GREETING.to_string()
            }
        };
        (session, greeting)
    }

    /// Sends one learner turn and returns the tutor's reply.
    pub async fn send(&self, session: &mut AgentSession, text: &str) -> String {
        match self.exchange(session, text).await {
            Ok(reply) if reply.trim().is_empty() => EMPTY_REPLY.to_string(),
            Ok(reply) => reply,
            Err(e) => {
                error!(error = ?e, topic = %session.topic, "Chat model unreachable, using fallback reply");
                FALLBACK_REPLY.to_string()
            }
        }
    }

    /// Runs one retried round trip. History only grows when it succeeds.
    async fn exchange(&self, session: &mut AgentSession, text: &str) -> Result<String> {
        let mut history = session.history.clone();
        history.push(ChatTurn {
            role: ChatRole::Learner,
            text: text.to_string(),
        });
        let request = ChatRequest {
            instructions: session.mode.persona().to_string(),
            history,
        };

        let reply = self
            .retry
            .run(|| {
                let transport = Arc::clone(&self.transport);
                let request = request.clone();
                async move { transport.complete(&request).await }
            })
            .await?;

        session.history = request.history;
        session.history.push(ChatTurn {
            role: ChatRole::Tutor,
            text: reply.clone(),
        });
        Ok(reply)
    }
}
