use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::repository::{eviction_index, ConversationRepository, MemoryRepository};
use crate::config::settings::EvictionPolicy;
use crate::models::{
    CharacterContext, Conversation, ConversationFilter, ConversationSettings, ConversationStatus,
    Memory, Message, MessageBreakdown, MessageRole, ScoredMemory, SortOrder,
};
use crate::utils::error::ApiError;
use crate::utils::similarity::top_k_by_similarity;

struct ConversationEntry {
    conversation: Conversation,
    messages: Vec<Message>,
}

#[derive(Default)]
struct PairEntry {
    /// Insertion order, oldest first.
    memories: Vec<Memory>,
    context: Option<CharacterContext>,
}

type PairKey = (Uuid, Uuid);

/// Process-local store. Every mutation runs under the DashMap entry lock of
/// its conversation or (user, character) pair.
#[derive(Default)]
pub struct InMemoryStore {
    conversations: DashMap<Uuid, ConversationEntry>,
    pairs: DashMap<PairKey, PairEntry>,
    /// memory id -> owning pair
    memory_index: DashMap<Uuid, PairKey>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(id: Uuid) -> ApiError {
        ApiError::NotFound(format!("Conversation {} not found", id))
    }
}

#[async_trait]
impl ConversationRepository for InMemoryStore {
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), ApiError> {
        self.conversations.insert(
            conversation.id,
            ConversationEntry {
                conversation: conversation.clone(),
                messages: Vec::new(),
            },
        );
        Ok(())
    }

    async fn find_conversation(&self, id: Uuid) -> Result<Option<Conversation>, ApiError> {
        Ok(self.conversations.get(&id).map(|e| e.conversation.clone()))
    }

    async fn list_conversations(
        &self,
        user_id: Uuid,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, ApiError> {
        let mut found: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|e| e.conversation.user_id == user_id && filter.matches(&e.conversation))
            .map(|e| e.conversation.clone())
            .collect();

        match filter.order {
            SortOrder::Asc => found.sort_by(|a, b| a.last_activity_at.cmp(&b.last_activity_at)),
            SortOrder::Desc => found.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at)),
        }
        if let Some(limit) = filter.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn message_breakdown(
        &self,
        conversation_ids: &[Uuid],
    ) -> Result<MessageBreakdown, ApiError> {
        let mut breakdown = MessageBreakdown::default();
        for id in conversation_ids {
            let Some(entry) = self.conversations.get(id) else {
                continue;
            };
            for message in &entry.messages {
                *breakdown
                    .by_type
                    .entry(message.message_type.as_str().to_string())
                    .or_insert(0) += 1;

                if message.role != MessageRole::Assistant {
                    continue;
                }
                if let Some(emotion) = message.emotion() {
                    *breakdown.by_emotion.entry(emotion.primary.clone()).or_insert(0) += 1;
                }
            }
        }
        Ok(breakdown)
    }

    async fn transition_status(
        &self,
        id: Uuid,
        target: ConversationStatus,
    ) -> Result<(Conversation, bool), ApiError> {
        let mut entry = self
            .conversations
            .get_mut(&id)
            .ok_or_else(|| Self::not_found(id))?;

        let conversation = &mut entry.conversation;
        let changed = conversation.status.check_transition(target)?;
        if changed {
            let now = Utc::now();
            conversation.status = target;
            conversation.last_activity_at = now.max(conversation.last_activity_at);
            if target == ConversationStatus::Ended {
                conversation.ended_at = Some(now);
            }
        }
        Ok((conversation.clone(), changed))
    }

    async fn update_settings(
        &self,
        id: Uuid,
        settings: &ConversationSettings,
    ) -> Result<Conversation, ApiError> {
        let mut entry = self
            .conversations
            .get_mut(&id)
            .ok_or_else(|| Self::not_found(id))?;
        entry.conversation.settings = settings.clone();
        Ok(entry.conversation.clone())
    }

    async fn append_messages(
        &self,
        conversation_id: Uuid,
        messages: Vec<Message>,
    ) -> Result<Vec<Message>, ApiError> {
        let mut entry = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| Self::not_found(conversation_id))?;
        entry.conversation.ensure_accepts_messages()?;

        let mut floor = entry.messages.last().map(|m| m.timestamp);
        let mut stored = Vec::with_capacity(messages.len());

        for mut message in messages {
            message.conversation_id = conversation_id;
            if let Some(prev) = floor {
                message.timestamp = message.timestamp.max(prev);
            }
            floor = Some(message.timestamp);
            stored.push(message);
        }

        let entry = &mut *entry;
        if let Some(last) = stored.last() {
            entry.conversation.last_activity_at =
                entry.conversation.last_activity_at.max(last.timestamp);
        }
        entry.conversation.message_count += stored.len() as i64;
        entry.messages.extend(stored.iter().cloned());

        Ok(stored)
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        last: Option<usize>,
    ) -> Result<Vec<Message>, ApiError> {
        let entry = self
            .conversations
            .get(&conversation_id)
            .ok_or_else(|| Self::not_found(conversation_id))?;

        let start = last.map_or(0, |n| entry.messages.len().saturating_sub(n));
        Ok(entry.messages[start..].to_vec())
    }
}

#[async_trait]
impl MemoryRepository for InMemoryStore {
    async fn insert_memory(
        &self,
        memory: Memory,
        capacity: usize,
        policy: EvictionPolicy,
    ) -> Result<Vec<Uuid>, ApiError> {
        let key = (memory.user_id, memory.character_id);
        let capacity = capacity.max(1);
        let mut entry = self.pairs.entry(key).or_default();

        let mut evicted = Vec::new();
        while entry.memories.len() >= capacity {
            match eviction_index(&entry.memories, policy) {
                Some(idx) => {
                    let gone = entry.memories.remove(idx);
                    self.memory_index.remove(&gone.id);
                    evicted.push(gone.id);
                }
                None => break,
            }
        }

        self.memory_index.insert(memory.id, key);
        entry.memories.push(memory);
        Ok(evicted)
    }

    async fn search_memories(
        &self,
        user_id: Uuid,
        character_id: Uuid,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredMemory>, ApiError> {
        let Some(entry) = self.pairs.get(&(user_id, character_id)) else {
            return Ok(Vec::new());
        };

        let ranked = top_k_by_similarity(
            query_embedding,
            entry.memories.iter().map(|m| (m.embedding.as_slice(), m)),
            limit,
        );

        Ok(ranked
            .into_iter()
            .map(|(memory, similarity)| ScoredMemory {
                memory: memory.clone(),
                similarity,
            })
            .collect())
    }

    async fn mark_accessed(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<(), ApiError> {
        for id in ids {
            let Some(key) = self.memory_index.get(id).map(|k| *k) else {
                continue;
            };
            if let Some(mut entry) = self.pairs.get_mut(&key) {
                if let Some(memory) = entry.memories.iter_mut().find(|m| m.id == *id) {
                    memory.last_accessed_at = at;
                    memory.access_count += 1;
                }
            }
        }
        Ok(())
    }

    async fn list_memories(
        &self,
        user_id: Uuid,
        character_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Memory>, ApiError> {
        Ok(self
            .pairs
            .get(&(user_id, character_id))
            .map(|e| e.memories.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn character_context(
        &self,
        user_id: Uuid,
        character_id: Uuid,
    ) -> Result<CharacterContext, ApiError> {
        let mut entry = self.pairs.entry((user_id, character_id)).or_default();
        Ok(entry
            .context
            .get_or_insert_with(|| CharacterContext::new(user_id, character_id))
            .clone())
    }

    async fn push_shared_memories(
        &self,
        user_id: Uuid,
        character_id: Uuid,
        entries: Vec<String>,
        capacity: usize,
    ) -> Result<CharacterContext, ApiError> {
        let mut entry = self.pairs.entry((user_id, character_id)).or_default();
        let ctx = entry
            .context
            .get_or_insert_with(|| CharacterContext::new(user_id, character_id));
        ctx.push_shared(entries, capacity);
        Ok(ctx.clone())
    }

    async fn bump_relationship(
        &self,
        user_id: Uuid,
        character_id: Uuid,
    ) -> Result<CharacterContext, ApiError> {
        let mut entry = self.pairs.entry((user_id, character_id)).or_default();
        let ctx = entry
            .context
            .get_or_insert_with(|| CharacterContext::new(user_id, character_id));
        ctx.relationship_strength += 1;
        ctx.updated_at = Utc::now();
        Ok(ctx.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ConversationMode, EmotionData, MemoryCategory, MessageMetadata, MessageType,
    };
    use chrono::Duration;
    use std::sync::Arc;

    async fn seeded() -> (InMemoryStore, Conversation) {
        let store = InMemoryStore::new();
        let conv = Conversation::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            ConversationMode::Text,
            ConversationSettings::default(),
        );
        store.insert_conversation(&conv).await.unwrap();
        (store, conv)
    }

    #[tokio::test]
    async fn test_append_counts_and_orders_concurrently() {
        let (store, conv) = seeded().await;
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            let id = conv.id;
            handles.push(tokio::spawn(async move {
                let mut msg = Message::user(id, format!("m{}", i), MessageType::Text);
                // Skewed clocks must not reorder the log.
                if i % 2 == 0 {
                    msg.timestamp = msg.timestamp - Duration::seconds(5);
                }
                store.append_messages(id, vec![msg]).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let stored = store.find_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(stored.message_count, 50);

        let log = store.list_messages(conv.id, None).await.unwrap();
        assert_eq!(log.len(), 50);
        assert!(log.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_list_messages_trailing_window() {
        let (store, conv) = seeded().await;
        let batch = (0..5)
            .map(|i| Message::user(conv.id, format!("m{}", i), MessageType::Text))
            .collect();
        store.append_messages(conv.id, batch).await.unwrap();

        let last = store.list_messages(conv.id, Some(2)).await.unwrap();
        let contents: Vec<_> = last.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn test_end_twice_keeps_ended_at() {
        let (store, conv) = seeded().await;
        let (first, changed) = store
            .transition_status(conv.id, ConversationStatus::Ended)
            .await
            .unwrap();
        assert!(changed);
        let (second, changed) = store
            .transition_status(conv.id, ConversationStatus::Ended)
            .await
            .unwrap();
        assert!(!changed);
        assert_eq!(first.ended_at, second.ended_at);
    }

    #[tokio::test]
    async fn test_append_rejected_once_ended() {
        let (store, conv) = seeded().await;
        store
            .transition_status(conv.id, ConversationStatus::Ended)
            .await
            .unwrap();

        let msg = Message::user(conv.id, "late", MessageType::Text);
        let err = store.append_messages(conv.id, vec![msg]).await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        let stored = store.find_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(stored.message_count, 0);
        assert!(store.list_messages(conv.id, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_conversations_filters_by_start_and_orders() {
        let store = InMemoryStore::new();
        let user = Uuid::new_v4();
        let character = Uuid::new_v4();
        let now = Utc::now();

        let mut ids = Vec::new();
        for days_ago in [30, 10, 1] {
            let mut conv = Conversation::new(
                user,
                character,
                ConversationMode::Text,
                ConversationSettings::default(),
            );
            conv.started_at = now - Duration::days(days_ago);
            conv.last_activity_at = conv.started_at + Duration::hours(1);
            store.insert_conversation(&conv).await.unwrap();
            ids.push(conv.id);
        }
        let other = Conversation::new(
            user,
            Uuid::new_v4(),
            ConversationMode::Text,
            ConversationSettings::default(),
        );
        store.insert_conversation(&other).await.unwrap();

        let filter = ConversationFilter {
            character_id: Some(character),
            started_from: Some(now - Duration::days(20)),
            started_to: Some(now),
            limit: None,
            order: SortOrder::Asc,
        };
        let found = store.list_conversations(user, &filter).await.unwrap();
        let found: Vec<Uuid> = found.iter().map(|c| c.id).collect();
        assert_eq!(found, vec![ids[1], ids[2]]);

        let newest = ConversationFilter {
            limit: Some(1),
            ..Default::default()
        };
        let found = store.list_conversations(user, &newest).await.unwrap();
        assert_eq!(found[0].id, other.id);
        assert!(store
            .list_conversations(Uuid::new_v4(), &ConversationFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_message_breakdown_counts_types_and_assistant_emotions() {
        let (store, conv) = seeded().await;
        let emotion = |label: &str| MessageMetadata {
            emotion: Some(EmotionData {
                primary: label.to_string(),
                intensity: 0.8,
                expression: None,
                scores: Default::default(),
            }),
            ..Default::default()
        };
        let messages = vec![
            Message::user(conv.id, "hello", MessageType::Text),
            Message::assistant(conv.id, "hi!", emotion("happy")),
            Message::user(conv.id, "(audio)", MessageType::Voice),
            Message::assistant(conv.id, "oh no", emotion("sad")),
            Message::assistant(conv.id, "yay", emotion("happy")),
            Message::assistant(conv.id, "plain", MessageMetadata::default()),
        ];
        store.append_messages(conv.id, messages).await.unwrap();

        let breakdown = store
            .message_breakdown(&[conv.id, Uuid::new_v4()])
            .await
            .unwrap();
        assert_eq!(breakdown.by_type["text"], 5);
        assert_eq!(breakdown.by_type["voice"], 1);
        assert_eq!(breakdown.by_emotion["happy"], 2);
        assert_eq!(breakdown.by_emotion["sad"], 1);
        assert_eq!(breakdown.by_emotion.len(), 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_exactly_oldest() {
        let store = InMemoryStore::new();
        let (user, character) = (Uuid::new_v4(), Uuid::new_v4());

        let mut ids = Vec::new();
        for i in 0..3 {
            let m = Memory::new(user, character, format!("m{}", i), vec![1.0, 0.0], MemoryCategory::Fact, 0.9);
            ids.push(m.id);
            let evicted = store.insert_memory(m, 3, EvictionPolicy::Fifo).await.unwrap();
            assert!(evicted.is_empty());
        }

        let extra = Memory::new(user, character, "m3", vec![1.0, 0.0], MemoryCategory::Fact, 0.1);
        let evicted = store.insert_memory(extra, 3, EvictionPolicy::Fifo).await.unwrap();
        assert_eq!(evicted, vec![ids[0]]);

        let remaining = store.list_memories(user, character, 10).await.unwrap();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.iter().all(|m| m.id != ids[0]));
    }

    #[tokio::test]
    async fn test_mark_accessed_touches_only_given_ids() {
        let store = InMemoryStore::new();
        let (user, character) = (Uuid::new_v4(), Uuid::new_v4());
        let a = Memory::new(user, character, "a", vec![1.0, 0.0], MemoryCategory::Fact, 0.5);
        let b = Memory::new(user, character, "b", vec![0.0, 1.0], MemoryCategory::Fact, 0.5);
        let (a_id, b_id) = (a.id, b.id);
        store.insert_memory(a, 10, EvictionPolicy::Fifo).await.unwrap();
        store.insert_memory(b, 10, EvictionPolicy::Fifo).await.unwrap();

        let later = Utc::now() + Duration::seconds(60);
        store.mark_accessed(&[a_id], later).await.unwrap();

        let all = store.list_memories(user, character, 10).await.unwrap();
        let a = all.iter().find(|m| m.id == a_id).unwrap();
        let b = all.iter().find(|m| m.id == b_id).unwrap();
        assert_eq!((a.access_count, a.last_accessed_at), (1, later));
        assert_eq!(b.access_count, 0);
        assert!(b.last_accessed_at < later);
    }

    #[tokio::test]
    async fn test_character_context_lifecycle() {
        let store = InMemoryStore::new();
        let (user, character) = (Uuid::new_v4(), Uuid::new_v4());

        let ctx = store.character_context(user, character).await.unwrap();
        assert_eq!(ctx.relationship_strength, 0);

        store.bump_relationship(user, character).await.unwrap();
        let ctx = store
            .push_shared_memories(user, character, vec!["a".into(), "b".into(), "c".into()], 2)
            .await
            .unwrap();
        assert_eq!(ctx.relationship_strength, 1);
        assert_eq!(ctx.shared_memories, vec!["b", "c"]);
    }
}
