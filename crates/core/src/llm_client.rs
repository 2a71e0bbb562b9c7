use crate::agent::{ChatRequest, ChatRole, ChatTransport};
use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
    },
};
use async_trait::async_trait;
use tracing::debug;

/// Sampling temperature for tutor replies.
const TEMPERATURE: f32 = 0.7;

/// An implementation of `ChatTransport` for any OpenAI-compatible API.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The model identifier to use for chat completions (e.g., "gpt-4o").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

/// Converts a tutoring request into the provider's message list.
fn build_messages(request: &ChatRequest) -> Result<Vec<ChatCompletionRequestMessage>> {
    let mut messages: Vec<ChatCompletionRequestMessage> = vec![
        ChatCompletionRequestSystemMessageArgs::default()
            .content(request.instructions.clone())
            .build()?
            .into(),
    ];
    for turn in &request.history {
        match turn.role {
            ChatRole::Learner => messages.push(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(turn.text.clone())
                    .build()?
                    .into(),
            ),
            ChatRole::Tutor => messages.push(
                ChatCompletionRequestAssistantMessageArgs::default()
                    .content(turn.text.clone())
                    .build()?
                    .into(),
            ),
        }
    }
    Ok(messages)
}

#[async_trait]
impl ChatTransport for OpenAICompatibleClient {
    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(build_messages(request)?)
            .temperature(TEMPERATURE)
            .n(1)
            .build()?;

        let response: CreateChatCompletionResponse = self.client.chat().create(request).await?;
        let choice = response
            .choices
            .first()
            .context("No response choice from chat model")?;
        debug!(model = %self.model, finish_reason = ?choice.finish_reason, "Chat completion received");

        // An absent body is not a transport failure; the agent substitutes its own text.
        Ok(choice.message.content.clone().unwrap_or_default())
    }
}
