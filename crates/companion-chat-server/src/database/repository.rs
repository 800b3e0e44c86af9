use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::settings::EvictionPolicy;
use crate::models::{
    CharacterContext, Conversation, ConversationFilter, ConversationSettings, ConversationStatus,
    Memory, Message, MessageBreakdown, ScoredMemory,
};
use crate::utils::error::ApiError;

/// Persistence port for conversations and their message log.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), ApiError>;

    async fn find_conversation(&self, id: Uuid) -> Result<Option<Conversation>, ApiError>;

    /// A user's conversations matching `filter`, ordered by last activity.
    async fn list_conversations(
        &self,
        user_id: Uuid,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, ApiError>;

    /// Message counts by type, and assistant emotion labels, across the given conversations.
    async fn message_breakdown(
        &self,
        conversation_ids: &[Uuid],
    ) -> Result<MessageBreakdown, ApiError>;

    /// Apply a lifecycle transition atomically. Returns the stored conversation
    /// and whether it changed. `ended_at` is stamped only on the transition into `ended`.
    async fn transition_status(
        &self,
        id: Uuid,
        target: ConversationStatus,
    ) -> Result<(Conversation, bool), ApiError>;

    async fn update_settings(
        &self,
        id: Uuid,
        settings: &ConversationSettings,
    ) -> Result<Conversation, ApiError>;

    /// Append messages in order. The message counter and last-activity stamp are
    /// updated in the same atomic step, and each timestamp is raised to the last
    /// stored one so the log never goes backwards. Fails with `Validation`
    /// unless the conversation is active at the time of the append. Returns the
    /// stored messages.
    async fn append_messages(
        &self,
        conversation_id: Uuid,
        messages: Vec<Message>,
    ) -> Result<Vec<Message>, ApiError>;

    /// Ascending by timestamp. With `last`, only the trailing `last` messages.
    async fn list_messages(
        &self,
        conversation_id: Uuid,
        last: Option<usize>,
    ) -> Result<Vec<Message>, ApiError>;
}

/// Persistence port for memories and character contexts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MemoryRepository: Send + Sync {
    /// Insert and enforce `capacity` for the memory's (user, character) pair.
    /// Returns the ids evicted to make room.
    async fn insert_memory(
        &self,
        memory: Memory,
        capacity: usize,
        policy: EvictionPolicy,
    ) -> Result<Vec<Uuid>, ApiError>;

    /// Nearest memories by cosine similarity, most similar first. No side effects.
    async fn search_memories(
        &self,
        user_id: Uuid,
        character_id: Uuid,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredMemory>, ApiError>;

    /// Stamp `last_accessed_at` and increment `access_count` on exactly `ids`.
    async fn mark_accessed(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<(), ApiError>;

    /// Newest first.
    async fn list_memories(
        &self,
        user_id: Uuid,
        character_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Memory>, ApiError>;

    /// Get or create.
    async fn character_context(
        &self,
        user_id: Uuid,
        character_id: Uuid,
    ) -> Result<CharacterContext, ApiError>;

    async fn push_shared_memories(
        &self,
        user_id: Uuid,
        character_id: Uuid,
        entries: Vec<String>,
        capacity: usize,
    ) -> Result<CharacterContext, ApiError>;

    async fn bump_relationship(
        &self,
        user_id: Uuid,
        character_id: Uuid,
    ) -> Result<CharacterContext, ApiError>;
}

/// Index of the entry to evict from `memories` (oldest first order).
pub fn eviction_index(memories: &[Memory], policy: EvictionPolicy) -> Option<usize> {
    if memories.is_empty() {
        return None;
    }
    match policy {
        EvictionPolicy::Fifo => memories
            .iter()
            .enumerate()
            .min_by_key(|(_, m)| m.created_at)
            .map(|(i, _)| i),
        EvictionPolicy::LowestImportance => memories
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.importance
                    .partial_cmp(&b.importance)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|(i, _)| i),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MemoryCategory;
    use chrono::Duration;

    fn mem(age_secs: i64, importance: f64) -> Memory {
        let mut m = Memory::new(
            Uuid::nil(),
            Uuid::nil(),
            format!("{}", age_secs),
            vec![],
            MemoryCategory::General,
            importance,
        );
        m.created_at = Utc::now() - Duration::seconds(age_secs);
        m
    }

    #[test]
    fn test_fifo_ignores_importance() {
        let memories = vec![mem(30, 0.9), mem(20, 0.1), mem(10, 0.5)];
        assert_eq!(eviction_index(&memories, EvictionPolicy::Fifo), Some(0));
    }

    #[test]
    fn test_lowest_importance_ties_break_by_age() {
        let memories = vec![mem(30, 0.9), mem(20, 0.2), mem(25, 0.2)];
        assert_eq!(eviction_index(&memories, EvictionPolicy::LowestImportance), Some(2));
        assert_eq!(eviction_index(&[], EvictionPolicy::Fifo), None);
    }
}
