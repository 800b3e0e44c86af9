use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::heuristics::MemoryHeuristics;
use crate::config::MemoryConfig;
use crate::database::{ConversationRepository, MemoryRepository};
use crate::logging::{ActivityLog, ActivityLogger, ActivityType};
use crate::models::{
    CharacterContext, Conversation, Memory, MemoryItem, Message, MessageRole, ScoredMemory,
};
use crate::services::embedding_service::EmbeddingProvider;
use crate::utils::error::ApiError;
use crate::utils::keyed_lock::KeyedLocks;
use crate::utils::limiters::Limiters;

pub struct MemoryService {
    memories: Arc<dyn MemoryRepository>,
    conversations: Arc<dyn ConversationRepository>,
    embedder: Arc<dyn EmbeddingProvider>,
    heuristics: Arc<dyn MemoryHeuristics>,
    config: MemoryConfig,
    limiters: Limiters,
    activity: ActivityLogger,
    /// Serialises writers per (user, character).
    locks: KeyedLocks<(Uuid, Uuid)>,
}

impl MemoryService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        memories: Arc<dyn MemoryRepository>,
        conversations: Arc<dyn ConversationRepository>,
        embedder: Arc<dyn EmbeddingProvider>,
        heuristics: Arc<dyn MemoryHeuristics>,
        config: MemoryConfig,
        limiters: Limiters,
        activity: ActivityLogger,
    ) -> Self {
        Self {
            memories,
            conversations,
            embedder,
            heuristics,
            config,
            limiters,
            activity,
            locks: KeyedLocks::new(),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ApiError> {
        let (_permit, _) = Limiters::acquire_timed(
            self.limiters.embedding.clone(),
            self.limiters.acquire_timeout,
            "embedding",
        )
        .await?;

        self.embedder
            .embed(text)
            .await
            .map_err(|e| ApiError::Internal(format!("Embedding failed: {:#}", e)))
    }

    /// Best-effort extraction from one exchange. Failures are logged and
    /// swallowed; they never reach the caller's turn.
    pub async fn extract(
        &self,
        conversation: &Conversation,
        user_message: &Message,
        assistant_message: &Message,
    ) -> Option<Memory> {
        match self
            .try_extract(conversation, user_message, assistant_message)
            .await
        {
            Ok(memory) => memory,
            Err(e) => {
                warn!(
                    conversation_id = %conversation.id,
                    code = e.code(),
                    "Memory extraction failed: {}",
                    e.detail()
                );
                None
            }
        }
    }

    async fn try_extract(
        &self,
        conversation: &Conversation,
        user_message: &Message,
        assistant_message: &Message,
    ) -> Result<Option<Memory>, ApiError> {
        let Some(candidate) = self
            .heuristics
            .candidate(&user_message.content, &assistant_message.content)
        else {
            debug!(conversation_id = %conversation.id, "Nothing memory-worthy in exchange");
            return Ok(None);
        };

        let (user_id, character_id) = (conversation.user_id, conversation.character_id);
        let _guard = self.locks.lock((user_id, character_id)).await;

        let embedding = self.embed(&candidate.content).await?;
        let memory = Memory::new(
            user_id,
            character_id,
            candidate.content.clone(),
            embedding,
            candidate.category,
            candidate.importance,
        )
        .with_source(conversation.id, Some(user_message.id));

        self.store(memory.clone()).await?;

        self.activity.log(
            ActivityLog::builder(ActivityType::MemoryExtracted)
                .user(user_id)
                .character(character_id)
                .conversation(conversation.id)
                .message(memory.content.clone())
                .custom("category", memory.category.as_str())
                .custom("importance", memory.importance)
                .build(),
        );

        Ok(Some(memory))
    }

    /// Insert under the capacity policy and mirror into the shared-memory list.
    /// Caller holds the pair lock.
    async fn store(&self, memory: Memory) -> Result<(), ApiError> {
        let (user_id, character_id) = (memory.user_id, memory.character_id);
        let content = memory.content.clone();

        let evicted = self
            .memories
            .insert_memory(memory, self.config.capacity, self.config.eviction)
            .await?;

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicted memories over capacity");
            self.activity.log(
                ActivityLog::builder(ActivityType::MemoryEvicted)
                    .user(user_id)
                    .character(character_id)
                    .custom(
                        "evicted",
                        evicted.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
                    )
                    .build(),
            );
        }

        self.memories
            .push_shared_memories(
                user_id,
                character_id,
                vec![content],
                self.config.shared_memory_capacity,
            )
            .await?;

        Ok(())
    }

    /// Nearest memories for the pair. Exactly the returned records get their
    /// access stamp and counter bumped.
    pub async fn retrieve(
        &self,
        user_id: Uuid,
        character_id: Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredMemory>, ApiError> {
        if limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let embedding = self.embed(query).await?;
        let mut found = self
            .memories
            .search_memories(user_id, character_id, &embedding, limit)
            .await?;

        if found.is_empty() {
            return Ok(found);
        }

        let now = Utc::now();
        let ids: Vec<Uuid> = found.iter().map(|m| m.memory.id).collect();
        self.memories.mark_accessed(&ids, now).await?;

        for scored in &mut found {
            scored.memory.last_accessed_at = now;
            scored.memory.access_count += 1;
        }

        debug!(
            count = found.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Retrieved memories"
        );
        Ok(found)
    }

    /// Move high-importance exchanges of a finished conversation into the
    /// shared-memory list. Returns the migrated texts.
    pub async fn consolidate(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Vec<String>, ApiError> {
        let conversation = self
            .conversations
            .find_conversation(conversation_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Conversation {} not found", conversation_id)))?;
        if conversation.user_id != user_id {
            return Err(ApiError::Forbidden(
                "Conversation belongs to another user".to_string(),
            ));
        }

        let messages = self.conversations.list_messages(conversation_id, None).await?;

        let migrated: Vec<String> = messages
            .windows(2)
            .filter(|pair| pair[0].role == MessageRole::User && pair[1].role == MessageRole::Assistant)
            .filter_map(|pair| self.heuristics.candidate(&pair[0].content, &pair[1].content))
            .filter(|c| c.importance > self.config.consolidation_threshold)
            .map(|c| c.content)
            .collect();

        if !migrated.is_empty() {
            let _guard = self.locks.lock((user_id, conversation.character_id)).await;
            self.memories
                .push_shared_memories(
                    user_id,
                    conversation.character_id,
                    migrated.clone(),
                    self.config.shared_memory_capacity,
                )
                .await?;
        }

        info!(
            conversation_id = %conversation_id,
            migrated = migrated.len(),
            "Conversation consolidated"
        );
        self.activity.log(
            ActivityLog::builder(ActivityType::MemoryConsolidated)
                .user(user_id)
                .character(conversation.character_id)
                .conversation(conversation_id)
                .custom("migrated", migrated.len())
                .build(),
        );

        Ok(migrated)
    }

    /// Store client supplied memories.
    pub async fn add_memories(
        &self,
        user_id: Uuid,
        character_id: Uuid,
        items: Vec<MemoryItem>,
    ) -> Result<Vec<Memory>, ApiError> {
        if items.is_empty() {
            return Err(ApiError::Validation("At least one memory is required".to_string()));
        }
        if items.iter().any(|i| i.content.trim().is_empty()) {
            return Err(ApiError::Validation("Memory content must not be blank".to_string()));
        }

        let _guard = self.locks.lock((user_id, character_id)).await;
        let mut stored = Vec::with_capacity(items.len());

        for item in items {
            let content = item.content.trim().to_string();
            let category = item
                .category
                .unwrap_or_else(|| self.heuristics.categorize(&content));
            let importance = item
                .importance
                .unwrap_or_else(|| self.heuristics.importance(&content));

            let embedding = self.embed(&content).await?;
            let memory = Memory::new(user_id, character_id, content, embedding, category, importance);
            self.store(memory.clone()).await?;
            stored.push(memory);
        }

        Ok(stored)
    }

    /// Newest first, no access side effects.
    pub async fn list(
        &self,
        user_id: Uuid,
        character_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Memory>, ApiError> {
        self.memories.list_memories(user_id, character_id, limit).await
    }

    pub async fn character_context(
        &self,
        user_id: Uuid,
        character_id: Uuid,
    ) -> Result<CharacterContext, ApiError> {
        self.memories.character_context(user_id, character_id).await
    }

    /// One completed turn strengthens the relationship by one.
    pub async fn record_turn(
        &self,
        user_id: Uuid,
        character_id: Uuid,
    ) -> Result<CharacterContext, ApiError> {
        self.memories.bump_relationship(user_id, character_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EvictionPolicy, LimitsConfig};
    use crate::database::InMemoryStore;
    use crate::models::{ConversationMode, ConversationSettings, MemoryCategory, MessageMetadata, MessageType};
    use crate::services::embedding_service::{HashingEmbedder, MockEmbeddingProvider};
    use crate::services::memory::KeywordMemoryHeuristics;

    struct Fixture {
        store: Arc<InMemoryStore>,
        service: MemoryService,
        conversation: Conversation,
    }

    async fn fixture_with(config: MemoryConfig, embedder: Arc<dyn EmbeddingProvider>) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let conversation = Conversation::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            ConversationMode::Text,
            ConversationSettings::default(),
        );
        store.insert_conversation(&conversation).await.unwrap();

        let (activity, _rx) = ActivityLogger::detached(1024);
        let service = MemoryService::new(
            store.clone(),
            store.clone(),
            embedder,
            Arc::new(KeywordMemoryHeuristics),
            config,
            Limiters::new(&LimitsConfig::default()),
            activity,
        );
        Fixture {
            store,
            service,
            conversation,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(
            MemoryConfig::default(),
            Arc::new(HashingEmbedder::new(384).unwrap()),
        )
        .await
    }

    async fn exchange(f: &Fixture, user: &str, assistant: &str) -> Option<Memory> {
        let id = f.conversation.id;
        let u = Message::user(id, user, MessageType::Text);
        let a = Message::assistant(id, assistant, MessageMetadata::default());
        f.store.append_messages(id, vec![u.clone(), a.clone()]).await.unwrap();
        f.service.extract(&f.conversation, &u, &a).await
    }

    #[tokio::test]
    async fn test_name_then_preference_scenario() {
        let f = fixture().await;
        let fact = exchange(&f, "My name is Alex", "Nice to meet you, Alex!").await.unwrap();
        let pref = exchange(&f, "I like hiking", "Hiking is wonderful.").await.unwrap();
        assert_eq!(fact.category, MemoryCategory::Fact);
        assert_eq!(pref.category, MemoryCategory::Preference);

        let (user, character) = (f.conversation.user_id, f.conversation.character_id);
        let ranked = f
            .service
            .retrieve(user, character, "What does the user enjoy?", 5)
            .await
            .unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].memory.id, pref.id);
        assert_eq!(ranked[1].memory.id, fact.id);

        let ctx = f.service.character_context(user, character).await.unwrap();
        assert_eq!(
            ctx.shared_memories,
            vec!["User's name: Alex", "User preference: I like hiking"]
        );
    }

    #[tokio::test]
    async fn test_retrieve_touches_only_returned_records() {
        let f = fixture().await;
        let (user, character) = (f.conversation.user_id, f.conversation.character_id);
        f.service
            .add_memories(
                user,
                character,
                vec![
                    MemoryItem { content: "User preference: I like hiking".into(), category: None, importance: None },
                    MemoryItem { content: "User's name: Alex".into(), category: None, importance: None },
                    MemoryItem { content: "Important: we went to Rome".into(), category: None, importance: None },
                ],
            )
            .await
            .unwrap();

        let hits = f.service.retrieve(user, character, "what does the user enjoy", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory.access_count, 1);

        let all = f.service.list(user, character, 10).await.unwrap();
        for m in all {
            let expected = if m.id == hits[0].memory.id { 1 } else { 0 };
            assert_eq!(m.access_count, expected, "{}", m.content);
        }
    }

    #[tokio::test]
    async fn test_capacity_eviction_fifo() {
        let config = MemoryConfig {
            capacity: 2,
            ..Default::default()
        };
        let f = fixture_with(config, Arc::new(HashingEmbedder::new(64).unwrap())).await;
        let a = exchange(&f, "I like tea", "ok").await.unwrap();
        let b = exchange(&f, "I love books, always", "ok").await.unwrap();
        let c = exchange(&f, "I like rain", "ok").await.unwrap();

        let remaining: Vec<Uuid> = f
            .service
            .list(f.conversation.user_id, f.conversation.character_id, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(!remaining.contains(&a.id));
        assert!(remaining.contains(&b.id) && remaining.contains(&c.id));
    }

    #[tokio::test]
    async fn test_capacity_eviction_lowest_importance() {
        let config = MemoryConfig {
            capacity: 2,
            eviction: EvictionPolicy::LowestImportance,
            ..Default::default()
        };
        let f = fixture_with(config, Arc::new(HashingEmbedder::new(64).unwrap())).await;
        let a = exchange(&f, "I love tea, always, never change", "ok").await.unwrap();
        let b = exchange(&f, "I like books", "ok").await.unwrap();
        let c = exchange(&f, "I like rain", "ok").await.unwrap();

        let remaining: Vec<Uuid> = f
            .service
            .list(f.conversation.user_id, f.conversation.character_id, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert!(remaining.contains(&a.id));
        assert!(!remaining.contains(&b.id));
        assert!(remaining.contains(&c.id));
    }

    #[tokio::test]
    async fn test_extraction_failure_is_swallowed() {
        let mut embedder = MockEmbeddingProvider::new();
        embedder
            .expect_embed()
            .returning(|_| Err(anyhow::anyhow!("embedding server down")));
        embedder.expect_dimension().return_const(384usize);

        let f = fixture_with(MemoryConfig::default(), Arc::new(embedder)).await;
        assert!(exchange(&f, "My name is Alex", "Hi").await.is_none());
        let stored = f
            .service
            .list(f.conversation.user_id, f.conversation.character_id, 10)
            .await
            .unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn test_consolidate_migrates_above_threshold() {
        let f = fixture().await;
        let id = f.conversation.id;
        let log = vec![
            Message::user(id, "I love hiking and always will, remember that", MessageType::Text),
            Message::assistant(id, "I will!", MessageMetadata::default()),
            Message::user(id, "I like tea", MessageType::Text),
            Message::assistant(id, "Nice", MessageMetadata::default()),
        ];
        f.store.append_messages(id, log).await.unwrap();

        let migrated = f
            .service
            .consolidate(f.conversation.user_id, id)
            .await
            .unwrap();
        assert_eq!(
            migrated,
            vec!["User preference: I love hiking and always will, remember that"]
        );

        let other_user = f.service.consolidate(Uuid::new_v4(), id).await;
        assert!(matches!(other_user, Err(ApiError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_add_memories_validates_and_clamps() {
        let f = fixture().await;
        let (user, character) = (f.conversation.user_id, f.conversation.character_id);

        let blank = f
            .service
            .add_memories(user, character, vec![MemoryItem { content: "  ".into(), category: None, importance: None }])
            .await;
        assert!(matches!(blank, Err(ApiError::Validation(_))));

        let stored = f
            .service
            .add_memories(
                user,
                character,
                vec![MemoryItem {
                    content: "Allergic to peanuts".into(),
                    category: Some(MemoryCategory::Fact),
                    importance: Some(4.0),
                }],
            )
            .await
            .unwrap();
        assert_eq!(stored[0].importance, 1.0);
        assert_eq!(stored[0].category, MemoryCategory::Fact);
    }
}
