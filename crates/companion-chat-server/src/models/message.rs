use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::utils::error::ApiError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl FromStr for MessageRole {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(ApiError::Internal(format!("Unknown message role: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Voice,
    Image,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Voice => "voice",
            MessageType::Image => "image",
        }
    }
}

impl FromStr for MessageType {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageType::Text),
            "voice" => Ok(MessageType::Voice),
            "image" => Ok(MessageType::Image),
            other => Err(ApiError::Internal(format!("Unknown message type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmotionData {
    pub primary: String,
    pub intensity: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    pub scores: BTreeMap<String, f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionData {
    pub description: String,
    pub action_type: String,
    pub duration_seconds: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<EmotionData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    /// Synthesized-voice reference for voice-mode conversations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub significant: Option<bool>,
    /// Client supplied metadata, stored verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<serde_json::Value>,
}

/// Immutable entry of a conversation's append-only log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    pub fn user(conversation_id: Uuid, content: impl Into<String>, message_type: MessageType) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role: MessageRole::User,
            content: content.into(),
            message_type,
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    pub fn assistant(
        conversation_id: Uuid,
        content: impl Into<String>,
        metadata: MessageMetadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role: MessageRole::Assistant,
            content: content.into(),
            message_type: MessageType::Text,
            timestamp: Utc::now(),
            metadata: Some(metadata),
        }
    }

    pub fn emotion(&self) -> Option<&EmotionData> {
        self.metadata.as_ref().and_then(|m| m.emotion.as_ref())
    }

    pub fn action(&self) -> Option<&ActionData> {
        self.metadata.as_ref().and_then(|m| m.action.as_ref())
    }
}
