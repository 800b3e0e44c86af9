use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::conversation::{ConversationMode, ConversationSettings};
use super::memory::MemoryCategory;
use super::message::MessageType;
use crate::utils::error::{ApiError, ErrorInfo};

// ===== REQUEST MODELS =====

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartConversationRequest {
    pub character_id: Uuid,
    #[serde(default)]
    pub initial_message: Option<String>,
    #[serde(default)]
    pub mode: ConversationMode,
    #[serde(default)]
    pub settings: Option<ConversationSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub options: Option<MessageOptions>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl SendMessageRequest {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            message_type: MessageType::Text,
            options: None,
            metadata: None,
        }
    }

    /// Content must be non-blank and at most `max_chars` characters.
    pub fn validate(&self, max_chars: usize) -> Result<(), ApiError> {
        if self.content.trim().is_empty() {
            return Err(ApiError::Validation("Message content is required".to_string()));
        }
        let len = self.content.chars().count();
        if len > max_chars {
            return Err(ApiError::Validation(format!(
                "Message content is {} characters, the limit is {}",
                len, max_chars
            )));
        }
        if let Some(options) = &self.options {
            options.validate()?;
        }
        Ok(())
    }
}

/// Per-turn overrides of the conversation settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageOptions {
    pub include_emotions: Option<bool>,
    pub include_actions: Option<bool>,
    pub max_response_length: Option<u32>,
    pub preferred_tone: Option<String>,
    pub request_voice_response: Option<bool>,
}

impl MessageOptions {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.max_response_length == Some(0) {
            return Err(ApiError::Validation(
                "maxResponseLength must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListConversationsQuery {
    pub character_id: Option<Uuid>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagesQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryQuery {
    pub query: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddMemoriesRequest {
    pub memories: Vec<MemoryItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryItem {
    pub content: String,
    #[serde(default)]
    pub category: Option<MemoryCategory>,
    #[serde(default)]
    pub importance: Option<f64>,
}

// ===== STREAM EVENT MODELS =====

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    MessageStart,
    Typing,
    MessageChunk,
    MessageEnd,
    Error,
}

impl StreamEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamEventType::MessageStart => "message_start",
            StreamEventType::Typing => "typing",
            StreamEventType::MessageChunk => "message_chunk",
            StreamEventType::MessageEnd => "message_end",
            StreamEventType::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEventType::MessageEnd | StreamEventType::Error)
    }
}

/// One typed event of an incremental response.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub event_type: StreamEventType,
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
    pub is_complete: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl StreamEvent {
    fn base(event_type: StreamEventType, conversation_id: Uuid, message_id: Uuid) -> Self {
        Self {
            event_type,
            conversation_id,
            message_id,
            content: None,
            chunk_index: None,
            is_complete: false,
            timestamp: Utc::now(),
            metadata: None,
            error: None,
        }
    }

    pub fn start(conversation_id: Uuid, message_id: Uuid) -> Self {
        Self::base(StreamEventType::MessageStart, conversation_id, message_id)
    }

    pub fn typing(conversation_id: Uuid, message_id: Uuid) -> Self {
        Self::base(StreamEventType::Typing, conversation_id, message_id)
    }

    pub fn chunk(conversation_id: Uuid, message_id: Uuid, index: usize, text: String) -> Self {
        Self {
            content: Some(text),
            chunk_index: Some(index),
            ..Self::base(StreamEventType::MessageChunk, conversation_id, message_id)
        }
    }

    pub fn end(
        conversation_id: Uuid,
        message_id: Uuid,
        full_text: String,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            content: Some(full_text),
            is_complete: true,
            metadata,
            ..Self::base(StreamEventType::MessageEnd, conversation_id, message_id)
        }
    }

    pub fn error(conversation_id: Uuid, message_id: Uuid, err: &ApiError) -> Self {
        Self {
            is_complete: true,
            error: Some(ErrorInfo::from(err)),
            ..Self::base(StreamEventType::Error, conversation_id, message_id)
        }
    }
}
