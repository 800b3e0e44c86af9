use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

use crate::config::LlmConfig;

/// Ordered text increments from the generative backend.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Generative backend contract.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<String>;

    async fn generate_stream(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<TextStream>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChoiceChunk>,
}

#[derive(Debug, Deserialize)]
struct ChoiceChunk {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, PartialEq)]
enum SseData {
    Delta(String),
    Done,
}

/// Parse one `data:` line of an OpenAI-compatible completion stream.
fn parse_sse_line(line: &str) -> Option<SseData> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload == "[DONE]" {
        return Some(SseData::Done);
    }
    let chunk: ChatCompletionChunk = serde_json::from_str(payload).ok()?;
    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();
    (!text.is_empty()).then_some(SseData::Delta(text))
}

/// OpenAI-compatible `/v1/chat/completions` client.
#[derive(Clone)]
pub struct LlmService {
    client: Client,
    config: LlmConfig,
}

impl LlmService {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, config })
    }

    fn request_body<'a>(
        &'a self,
        system_prompt: &str,
        messages: &[ChatMessage],
        params: &GenerationParams,
        stream: bool,
    ) -> ChatCompletionRequest<'a> {
        let mut all = Vec::with_capacity(messages.len() + 1);
        all.push(ChatMessage::new("system", system_prompt));
        all.extend_from_slice(messages);

        ChatCompletionRequest {
            model: &self.config.model,
            messages: all,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            stream,
        }
    }

    async fn post(&self, body: &ChatCompletionRequest<'_>) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(format!("{}/v1/chat/completions", self.config.base_url))
            .json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.context("Failed to call LLM API")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error: {} - {}", status, body);
        }

        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for LlmService {
    async fn generate(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<String> {
        debug!("Starting chat generation with {} messages", messages.len());

        #[derive(Deserialize)]
        struct ChatCompletionResponse {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMessage,
        }
        #[derive(Deserialize)]
        struct ChoiceMessage {
            content: String,
        }

        let body = self.request_body(system_prompt, messages, params, false);
        let response: ChatCompletionResponse = self
            .post(&body)
            .await?
            .json()
            .await
            .context("Failed to parse LLM response")?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .context("No choices returned from LLM")
    }

    async fn generate_stream(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<TextStream> {
        debug!("Starting chat stream with {} messages", messages.len());

        let body = self.request_body(system_prompt, messages, params, true);
        let mut bytes = self.post(&body).await?.bytes_stream();

        let stream = async_stream::try_stream! {
            // Lines may straddle network chunks, buffer raw bytes until a newline.
            let mut buffer: Vec<u8> = Vec::new();
            'read: while let Some(chunk) = bytes.next().await {
                let chunk = chunk.context("LLM stream error")?;
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    match parse_sse_line(line.trim_end()) {
                        Some(SseData::Delta(text)) => yield text,
                        Some(SseData::Done) => break 'read,
                        None => {}
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_sse_line(line), Some(SseData::Delta("Hel".into())));
    }

    #[test]
    fn test_parse_sse_done_and_noise() {
        assert_eq!(parse_sse_line("data: [DONE]"), Some(SseData::Done));
        assert_eq!(parse_sse_line(": keep-alive"), None);
        assert_eq!(parse_sse_line(""), None);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            None
        );
    }

    #[test]
    fn test_request_body_prepends_system_prompt() {
        let service = LlmService::new(LlmConfig::default()).unwrap();
        let params = GenerationParams {
            temperature: 0.3,
            max_tokens: 42,
        };
        let body = service.request_body(
            "You are Aria.",
            &[ChatMessage::new("user", "hi")],
            &params,
            true,
        );
        assert_eq!(body.messages[0], ChatMessage::new("system", "You are Aria."));
        assert_eq!(body.messages[1].content, "hi");
        assert_eq!(body.max_tokens, 42);
        assert!(body.stream);
    }
}
