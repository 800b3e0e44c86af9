use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::utils::error::ApiError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    #[default]
    Text,
    Voice,
    Video,
}

impl ConversationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationMode::Text => "text",
            ConversationMode::Voice => "voice",
            ConversationMode::Video => "video",
        }
    }
}

impl FromStr for ConversationMode {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(ConversationMode::Text),
            "voice" => Ok(ConversationMode::Voice),
            "video" => Ok(ConversationMode::Video),
            other => Err(ApiError::Validation(format!("Unknown conversation mode: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Paused,
    Ended,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Paused => "paused",
            ConversationStatus::Ended => "ended",
        }
    }

    /// Check a lifecycle transition.
    ///
    /// `Ok(true)` when the status changes, `Ok(false)` when the target equals the
    /// current status (no-op). `ended` is terminal.
    pub fn check_transition(self, target: ConversationStatus) -> Result<bool, ApiError> {
        use ConversationStatus::*;
        match (self, target) {
            (current, target) if current == target => Ok(false),
            (Ended, _) => Err(ApiError::Validation(format!(
                "Conversation has ended and cannot become {}",
                target
            ))),
            (Active, Paused) | (Paused, Active) | (Active, Ended) | (Paused, Ended) => Ok(true),
            (current, target) => Err(ApiError::Validation(format!(
                "Invalid transition {} -> {}",
                current, target
            ))),
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationStatus {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ConversationStatus::Active),
            "paused" => Ok(ConversationStatus::Paused),
            "ended" => Ok(ConversationStatus::Ended),
            other => Err(ApiError::Internal(format!("Unknown conversation status: {}", other))),
        }
    }
}

/// Per-conversation generation parameters. Unset fields fall back to server defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversationSettings {
    pub save_history: bool,
    pub language: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub response_style: Option<String>,
    pub enable_emotions: bool,
    pub enable_actions: bool,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            save_history: true,
            language: None,
            temperature: None,
            max_tokens: None,
            response_style: None,
            enable_emotions: true,
            enable_actions: true,
        }
    }
}

impl ConversationSettings {
    pub fn validate(&self) -> Result<(), ApiError> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ApiError::Validation(
                    "temperature must be between 0.0 and 2.0".to_string(),
                ));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(ApiError::Validation("maxTokens must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub character_id: Uuid,
    pub mode: ConversationMode,
    pub status: ConversationStatus,
    pub settings: ConversationSettings,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message_count: i64,
}

impl Conversation {
    pub fn new(
        user_id: Uuid,
        character_id: Uuid,
        mode: ConversationMode,
        settings: ConversationSettings,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            character_id,
            mode,
            status: ConversationStatus::Active,
            settings,
            started_at: now,
            last_activity_at: now,
            ended_at: None,
            message_count: 0,
        }
    }

    /// Only active conversations take new messages.
    pub fn ensure_accepts_messages(&self) -> Result<(), ApiError> {
        match self.status {
            ConversationStatus::Active => Ok(()),
            ConversationStatus::Paused => Err(ApiError::Validation(
                "Conversation is paused, resume it before sending messages".to_string(),
            )),
            ConversationStatus::Ended => Err(ApiError::Validation(
                "Conversation has ended".to_string(),
            )),
        }
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id,
            character_id: self.character_id,
            mode: self.mode,
            status: self.status,
            started_at: self.started_at,
            last_activity_at: self.last_activity_at,
            message_count: self.message_count,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Selects a user's conversations. Results are ordered by last activity in
/// `order`; the start-date bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationFilter {
    pub character_id: Option<Uuid>,
    pub started_from: Option<DateTime<Utc>>,
    pub started_to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub order: SortOrder,
}

impl ConversationFilter {
    pub fn matches(&self, conversation: &Conversation) -> bool {
        self.character_id.map_or(true, |c| conversation.character_id == c)
            && self.started_from.map_or(true, |from| conversation.started_at >= from)
            && self.started_to.map_or(true, |to| conversation.started_at <= to)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: Uuid,
    pub character_id: Uuid,
    pub mode: ConversationMode,
    pub status: ConversationStatus,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub message_count: i64,
}
