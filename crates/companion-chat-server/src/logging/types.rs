use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Domain activity categories
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    ConversationStarted,
    ConversationPaused,
    ConversationResumed,
    ConversationEnded,
    MessageSent,
    StreamCompleted,
    GenerationFailed,
    MemoryExtracted,
    MemoryEvicted,
    MemoryConsolidated,
    DuplexConnected,
    DuplexDisconnected,
    DuplexReclaimed,
    FrameRejected,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConversationStarted => "conversation_started",
            Self::ConversationPaused => "conversation_paused",
            Self::ConversationResumed => "conversation_resumed",
            Self::ConversationEnded => "conversation_ended",
            Self::MessageSent => "message_sent",
            Self::StreamCompleted => "stream_completed",
            Self::GenerationFailed => "generation_failed",
            Self::MemoryExtracted => "memory_extracted",
            Self::MemoryEvicted => "memory_evicted",
            Self::MemoryConsolidated => "memory_consolidated",
            Self::DuplexConnected => "duplex_connected",
            Self::DuplexDisconnected => "duplex_disconnected",
            Self::DuplexReclaimed => "duplex_reclaimed",
            Self::FrameRejected => "frame_rejected",
        }
    }
}

/// Activity status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Success,
    Error,
    Warning,
    Info,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

/// Complete activity log entry
#[derive(Debug, Clone)]
pub struct ActivityLog {
    pub user_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub character_id: Option<Uuid>,

    pub activity_type: ActivityType,
    pub status: ActivityStatus,

    pub message: Option<String>,
    pub response_time_ms: Option<i32>,

    pub error_code: Option<String>,
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub custom_fields: Option<HashMap<String, Value>>,
}

impl ActivityLog {
    /// Create builder for fluent API
    pub fn builder(activity_type: ActivityType) -> ActivityLogBuilder {
        ActivityLogBuilder::new(activity_type)
    }
}

/// Builder pattern for ActivityLog
pub struct ActivityLogBuilder {
    log: ActivityLog,
}

impl ActivityLogBuilder {
    pub fn new(activity_type: ActivityType) -> Self {
        Self {
            log: ActivityLog {
                user_id: None,
                conversation_id: None,
                character_id: None,
                activity_type,
                status: ActivityStatus::Success,
                message: None,
                response_time_ms: None,
                error_code: None,
                error_message: None,
                created_at: Utc::now(),
                custom_fields: None,
            },
        }
    }

    pub fn user(mut self, id: Uuid) -> Self {
        self.log.user_id = Some(id);
        self
    }

    pub fn conversation(mut self, id: Uuid) -> Self {
        self.log.conversation_id = Some(id);
        self
    }

    pub fn character(mut self, id: Uuid) -> Self {
        self.log.character_id = Some(id);
        self
    }

    pub fn status(mut self, status: ActivityStatus) -> Self {
        self.log.status = status;
        self
    }

    pub fn message(mut self, content: impl Into<String>) -> Self {
        self.log.message = Some(content.into());
        self
    }

    pub fn response_time(mut self, ms: u128) -> Self {
        self.log.response_time_ms = Some(ms.min(i32::MAX as u128) as i32);
        self
    }

    pub fn error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.log.error_code = Some(code.into());
        self.log.error_message = Some(message.into());
        self.log.status = ActivityStatus::Error;
        self
    }

    /// Add custom key-value data, stored in the metadata column
    pub fn custom(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.log
            .custom_fields
            .get_or_insert_with(HashMap::new)
            .insert(key.to_string(), value.into());
        self
    }

    pub fn build(self) -> ActivityLog {
        self.log
    }
}
