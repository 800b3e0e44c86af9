use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::utils::error::ApiError;

pub const BASE_IMPORTANCE: f64 = 0.5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    Fact,
    Preference,
    Event,
    General,
}

impl MemoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::Fact => "fact",
            MemoryCategory::Preference => "preference",
            MemoryCategory::Event => "event",
            MemoryCategory::General => "general",
        }
    }
}

impl FromStr for MemoryCategory {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fact" => Ok(MemoryCategory::Fact),
            "preference" => Ok(MemoryCategory::Preference),
            "event" => Ok(MemoryCategory::Event),
            "general" => Ok(MemoryCategory::General),
            other => Err(ApiError::Validation(format!("Unknown memory category: {}", other))),
        }
    }
}

pub fn clamp_importance(value: f64) -> f64 {
    if value.is_nan() {
        return BASE_IMPORTANCE;
    }
    value.clamp(0.0, 1.0)
}

/// Importance-weighted textual memory of a (user, character) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub id: Uuid,
    pub user_id: Uuid,
    pub character_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    pub content: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub category: MemoryCategory,
    pub importance: f64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: i64,
}

impl Memory {
    pub fn new(
        user_id: Uuid,
        character_id: Uuid,
        content: impl Into<String>,
        embedding: Vec<f32>,
        category: MemoryCategory,
        importance: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            character_id,
            conversation_id: None,
            message_id: None,
            content: content.into(),
            embedding,
            category,
            importance: clamp_importance(importance),
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
        }
    }

    pub fn with_source(mut self, conversation_id: Uuid, message_id: Option<Uuid>) -> Self {
        self.conversation_id = Some(conversation_id);
        self.message_id = message_id;
        self
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScoredMemory {
    #[serde(flatten)]
    pub memory: Memory,
    pub similarity: f32,
}

/// Relationship state and shared-memory digest of a (user, character) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CharacterContext {
    pub user_id: Uuid,
    pub character_id: Uuid,
    pub relationship_strength: i64,
    /// Oldest first.
    pub shared_memories: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl CharacterContext {
    pub fn new(user_id: Uuid, character_id: Uuid) -> Self {
        Self {
            user_id,
            character_id,
            relationship_strength: 0,
            shared_memories: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Append entries, dropping the oldest while over `capacity`.
    pub fn push_shared(&mut self, entries: impl IntoIterator<Item = String>, capacity: usize) {
        for entry in entries {
            if capacity == 0 {
                break;
            }
            while self.shared_memories.len() >= capacity {
                self.shared_memories.remove(0);
            }
            self.shared_memories.push(entry);
        }
        self.updated_at = Utc::now();
    }

    /// Last `n` shared memories, oldest first.
    pub fn recent_shared(&self, n: usize) -> &[String] {
        let start = self.shared_memories.len().saturating_sub(n);
        &self.shared_memories[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_importance_clamped_on_construction() {
        let m = Memory::new(Uuid::new_v4(), Uuid::new_v4(), "x", vec![], MemoryCategory::General, 1.7);
        assert_eq!(m.importance, 1.0);
        let m = Memory::new(Uuid::new_v4(), Uuid::new_v4(), "x", vec![], MemoryCategory::General, -0.2);
        assert_eq!(m.importance, 0.0);
        assert_eq!(clamp_importance(f64::NAN), BASE_IMPORTANCE);
    }

    #[test]
    fn test_shared_memories_bounded_fifo() {
        let mut ctx = CharacterContext::new(Uuid::new_v4(), Uuid::new_v4());
        ctx.push_shared((0..5).map(|i| format!("m{}", i)), 3);
        assert_eq!(ctx.shared_memories, vec!["m2", "m3", "m4"]);
        assert_eq!(ctx.recent_shared(2), &["m3".to_string(), "m4".to_string()]);
        assert_eq!(ctx.recent_shared(10).len(), 3);
    }
}
