use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::database::ConversationRepository;
use crate::logging::{ActivityLog, ActivityLogger, ActivityType};
use crate::models::{
    CharacterDetails, Conversation, ConversationFilter, ConversationHistory,
    ConversationHistoryRequest, ConversationSettings, ConversationStatistics, ConversationStatus,
    Message, MessageType, StartConversationRequest,
};
use crate::services::character_service::CharacterProfileProvider;
use crate::services::memory::MemoryService;
use crate::utils::error::ApiError;
use crate::utils::keyed_lock::KeyedLocks;

const MAX_LIST_LIMIT: usize = 100;

/// Owns conversation lifecycle and the per-conversation message log.
pub struct ConversationManager {
    conversations: Arc<dyn ConversationRepository>,
    characters: Arc<dyn CharacterProfileProvider>,
    memory: Arc<MemoryService>,
    activity: ActivityLogger,
    max_message_chars: usize,
    /// Serialises log appends per conversation.
    locks: KeyedLocks<Uuid>,
}

impl ConversationManager {
    pub fn new(
        conversations: Arc<dyn ConversationRepository>,
        characters: Arc<dyn CharacterProfileProvider>,
        memory: Arc<MemoryService>,
        activity: ActivityLogger,
        max_message_chars: usize,
    ) -> Self {
        Self {
            conversations,
            characters,
            memory,
            activity,
            max_message_chars,
            locks: KeyedLocks::new(),
        }
    }

    pub fn max_message_chars(&self) -> usize {
        self.max_message_chars
    }

    /// Character profile, `NotFound` when the profile service does not know it.
    pub async fn character(&self, character_id: Uuid) -> Result<CharacterDetails, ApiError> {
        self.characters
            .get_character_details(character_id)
            .await
            .map_err(|e| ApiError::Internal(format!("Character lookup failed: {:#}", e)))?
            .ok_or_else(|| ApiError::NotFound(format!("Character {} not found", character_id)))
    }

    pub async fn voice_id(&self, character_id: Uuid) -> Option<String> {
        match self.characters.get_voice_config(character_id).await {
            Ok(config) => config.map(|c| c.voice_id),
            Err(e) => {
                warn!(%character_id, "Voice config lookup failed: {:#}", e);
                None
            }
        }
    }

    pub async fn start(
        &self,
        user_id: Uuid,
        request: StartConversationRequest,
    ) -> Result<Conversation, ApiError> {
        let settings = request.settings.unwrap_or_default();
        settings.validate()?;

        let initial = request
            .initial_message
            .filter(|m| !m.trim().is_empty());
        if let Some(text) = &initial {
            self.check_length(text)?;
        }

        self.character(request.character_id).await?;

        let mut conversation = Conversation::new(user_id, request.character_id, request.mode, settings);
        self.conversations.insert_conversation(&conversation).await?;
        self.memory
            .character_context(user_id, request.character_id)
            .await?;

        if let Some(text) = initial {
            let message = Message::user(conversation.id, text, MessageType::Text);
            self.record_message(conversation.id, message).await?;
            conversation = self.load(conversation.id).await?;
        }

        info!(
            conversation_id = %conversation.id,
            user_id = %user_id,
            character_id = %conversation.character_id,
            "Conversation started"
        );
        self.activity.log(
            ActivityLog::builder(ActivityType::ConversationStarted)
                .user(user_id)
                .character(conversation.character_id)
                .conversation(conversation.id)
                .custom("mode", conversation.mode.as_str())
                .build(),
        );

        Ok(conversation)
    }

    async fn load(&self, id: Uuid) -> Result<Conversation, ApiError> {
        self.conversations
            .find_conversation(id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Conversation {} not found", id)))
    }

    /// `NotFound` when missing, `Forbidden` when owned by someone else.
    pub async fn get_conversation(&self, user_id: Uuid, id: Uuid) -> Result<Conversation, ApiError> {
        let conversation = self.load(id).await?;
        if conversation.user_id != user_id {
            return Err(ApiError::Forbidden(
                "Conversation belongs to another user".to_string(),
            ));
        }
        Ok(conversation)
    }

    pub async fn list_conversations(
        &self,
        user_id: Uuid,
        character_id: Option<Uuid>,
        limit: Option<usize>,
    ) -> Result<Vec<Conversation>, ApiError> {
        let filter = ConversationFilter {
            character_id,
            limit: Some(limit.unwrap_or(20).clamp(1, MAX_LIST_LIMIT)),
            ..Default::default()
        };
        self.conversations.list_conversations(user_id, &filter).await
    }

    /// Conversations started inside the requested window, with statistics over them.
    pub async fn history(
        &self,
        user_id: Uuid,
        request: ConversationHistoryRequest,
    ) -> Result<ConversationHistory, ApiError> {
        let filter = request.into_filter(MAX_LIST_LIMIT)?;
        let conversations = self.conversations.list_conversations(user_id, &filter).await?;
        let statistics = self.statistics_over(&conversations).await?;

        Ok(ConversationHistory {
            total_conversations: conversations.len() as i64,
            conversations: conversations.iter().map(Conversation::summary).collect(),
            statistics,
        })
    }

    /// Statistics over every conversation the user has had with a character.
    pub async fn statistics(
        &self,
        user_id: Uuid,
        character_id: Uuid,
    ) -> Result<ConversationStatistics, ApiError> {
        let filter = ConversationFilter {
            character_id: Some(character_id),
            ..Default::default()
        };
        let conversations = self.conversations.list_conversations(user_id, &filter).await?;
        self.statistics_over(&conversations).await
    }

    async fn statistics_over(
        &self,
        conversations: &[Conversation],
    ) -> Result<ConversationStatistics, ApiError> {
        let ids: Vec<Uuid> = conversations.iter().map(|c| c.id).collect();
        let breakdown = self.conversations.message_breakdown(&ids).await?;
        Ok(ConversationStatistics::compute(conversations, breakdown))
    }

    pub async fn list_messages(
        &self,
        user_id: Uuid,
        id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, ApiError> {
        self.get_conversation(user_id, id).await?;
        self.conversations.list_messages(id, limit).await
    }

    /// Trailing window for prompt assembly.
    pub async fn recent_messages(&self, id: Uuid, window: usize) -> Result<Vec<Message>, ApiError> {
        if window == 0 {
            return Ok(Vec::new());
        }
        self.conversations.list_messages(id, Some(window)).await
    }

    pub async fn record_message(&self, conversation_id: Uuid, message: Message) -> Result<Message, ApiError> {
        let _guard = self.locks.lock(conversation_id).await;
        let mut stored = self
            .conversations
            .append_messages(conversation_id, vec![message])
            .await?;
        stored
            .pop()
            .ok_or_else(|| ApiError::Internal("Message was not stored".to_string()))
    }

    /// Persist a completed turn as one unit, user message first. Rejected when
    /// the conversation was paused or ended while the reply was generated.
    pub async fn record_exchange(
        &self,
        conversation_id: Uuid,
        user_message: Message,
        assistant_message: Message,
    ) -> Result<(Message, Message), ApiError> {
        let _guard = self.locks.lock(conversation_id).await;
        let mut stored = self
            .conversations
            .append_messages(conversation_id, vec![user_message, assistant_message])
            .await?;

        match (stored.pop(), stored.pop()) {
            (Some(assistant), Some(user)) => Ok((user, assistant)),
            _ => Err(ApiError::Internal("Exchange was not stored".to_string())),
        }
    }

    pub fn check_length(&self, content: &str) -> Result<(), ApiError> {
        let len = content.chars().count();
        if len > self.max_message_chars {
            return Err(ApiError::Validation(format!(
                "Message content is {} characters, the limit is {}",
                len, self.max_message_chars
            )));
        }
        Ok(())
    }

    /// A conversation accepts messages only while active.
    pub fn ensure_active(conversation: &Conversation) -> Result<(), ApiError> {
        conversation.ensure_accepts_messages()
    }

    pub async fn update_settings(
        &self,
        user_id: Uuid,
        id: Uuid,
        settings: ConversationSettings,
    ) -> Result<Conversation, ApiError> {
        settings.validate()?;
        let conversation = self.get_conversation(user_id, id).await?;
        if conversation.status == ConversationStatus::Ended {
            return Err(ApiError::Validation("Conversation has ended".to_string()));
        }
        self.conversations.update_settings(id, &settings).await
    }

    pub async fn pause(&self, user_id: Uuid, id: Uuid) -> Result<Conversation, ApiError> {
        self.transition(user_id, id, ConversationStatus::Paused, ActivityType::ConversationPaused)
            .await
    }

    pub async fn resume(&self, user_id: Uuid, id: Uuid) -> Result<Conversation, ApiError> {
        self.transition(user_id, id, ConversationStatus::Active, ActivityType::ConversationResumed)
            .await
    }

    /// Idempotent. The first end kicks off consolidation in the background.
    pub async fn end(&self, user_id: Uuid, id: Uuid) -> Result<Conversation, ApiError> {
        self.transition(user_id, id, ConversationStatus::Ended, ActivityType::ConversationEnded)
            .await
    }

    async fn transition(
        &self,
        user_id: Uuid,
        id: Uuid,
        target: ConversationStatus,
        activity: ActivityType,
    ) -> Result<Conversation, ApiError> {
        self.get_conversation(user_id, id).await?;
        let (conversation, changed) = self.conversations.transition_status(id, target).await?;

        if changed {
            info!(conversation_id = %id, status = %target, "Conversation status changed");
            self.activity.log(
                ActivityLog::builder(activity)
                    .user(user_id)
                    .character(conversation.character_id)
                    .conversation(id)
                    .custom("message_count", conversation.message_count)
                    .build(),
            );

            if target == ConversationStatus::Ended {
                let memory = self.memory.clone();
                tokio::spawn(async move {
                    if let Err(e) = memory.consolidate(user_id, id).await {
                        warn!(conversation_id = %id, "Consolidation failed: {}", e);
                    }
                });
            }
        }

        Ok(conversation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LimitsConfig, MemoryConfig};
    use crate::database::{InMemoryStore, MemoryRepository};
    use crate::models::{
        CharacterDetails, ConversationMode, EmotionData, MessageMetadata, SortOrder,
    };
    use crate::services::character_service::MockCharacterProfileProvider;
    use crate::services::embedding_service::HashingEmbedder;
    use crate::services::memory::KeywordMemoryHeuristics;
    use crate::utils::limiters::Limiters;

    fn manager_with(store: Arc<InMemoryStore>) -> ConversationManager {
        let mut characters = MockCharacterProfileProvider::new();
        characters.expect_get_character_details().returning(|id| {
            Ok((id != Uuid::nil()).then(|| CharacterDetails {
                name: "Aria".into(),
                description: "a cheerful astronomer".into(),
                personality_traits: vec![],
                backstory: None,
            }))
        });
        characters.expect_get_voice_config().returning(|_| Ok(None));

        let (activity, _rx) = ActivityLogger::detached(1024);
        let memory = Arc::new(MemoryService::new(
            store.clone(),
            store.clone(),
            Arc::new(HashingEmbedder::new(64).unwrap()),
            Arc::new(KeywordMemoryHeuristics),
            MemoryConfig::default(),
            Limiters::new(&LimitsConfig::default()),
            activity.clone(),
        ));
        ConversationManager::new(store, Arc::new(characters), memory, activity, 2000)
    }

    fn start_request(initial: Option<&str>) -> StartConversationRequest {
        StartConversationRequest {
            character_id: Uuid::new_v4(),
            initial_message: initial.map(str::to_string),
            mode: ConversationMode::Text,
            settings: None,
        }
    }

    #[tokio::test]
    async fn test_start_with_initial_message() {
        let store = Arc::new(InMemoryStore::new());
        let manager = manager_with(store.clone());
        let user = Uuid::new_v4();

        let conv = manager.start(user, start_request(Some("Hello there"))).await.unwrap();
        assert_eq!(conv.status, ConversationStatus::Active);
        assert_eq!(conv.message_count, 1);

        let log = manager.list_messages(user, conv.id, None).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].content, "Hello there");

        let ctx = store.character_context(user, conv.character_id).await.unwrap();
        assert_eq!(ctx.relationship_strength, 0);
    }

    #[tokio::test]
    async fn test_start_unknown_character() {
        let manager = manager_with(Arc::new(InMemoryStore::new()));
        let mut req = start_request(None);
        req.character_id = Uuid::nil();
        let err = manager.start(Uuid::new_v4(), req).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_ownership_checks() {
        let manager = manager_with(Arc::new(InMemoryStore::new()));
        let owner = Uuid::new_v4();
        let conv = manager.start(owner, start_request(None)).await.unwrap();

        assert!(matches!(
            manager.get_conversation(Uuid::new_v4(), conv.id).await,
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            manager.get_conversation(owner, Uuid::new_v4()).await,
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(
            manager.end(Uuid::new_v4(), conv.id).await,
            Err(ApiError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_record_message_counts_and_orders() {
        let manager = Arc::new(manager_with(Arc::new(InMemoryStore::new())));
        let user = Uuid::new_v4();
        let conv = manager.start(user, start_request(None)).await.unwrap();

        let conv_id = conv.id;
        let mut handles = Vec::new();
        for i in 0..20 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let user_msg = Message::user(conv_id, format!("u{}", i), MessageType::Text);
                let ai_msg = Message::assistant(conv_id, format!("a{}", i), MessageMetadata::default());
                manager.record_exchange(conv_id, user_msg, ai_msg).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let stored = manager.get_conversation(user, conv.id).await.unwrap();
        assert_eq!(stored.message_count, 40);

        let log = manager.list_messages(user, conv.id, None).await.unwrap();
        assert!(log.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        // Exchanges never interleave.
        for pair in log.chunks(2) {
            assert_eq!(&pair[0].content[1..], &pair[1].content[1..]);
        }
    }

    #[tokio::test]
    async fn test_statistics_for_character() {
        let manager = manager_with(Arc::new(InMemoryStore::new()));
        let user = Uuid::new_v4();
        let req = start_request(Some("Hi"));
        let character = req.character_id;
        let conv = manager.start(user, req).await.unwrap();
        manager.start(user, start_request(Some("Elsewhere"))).await.unwrap();

        let mut metadata = MessageMetadata::default();
        metadata.emotion = Some(EmotionData {
            primary: "happy".into(),
            intensity: 0.7,
            expression: None,
            scores: Default::default(),
        });
        manager
            .record_exchange(
                conv.id,
                Message::user(conv.id, "How are you?", MessageType::Voice),
                Message::assistant(conv.id, "Great!", metadata),
            )
            .await
            .unwrap();

        let stats = manager.statistics(user, character).await.unwrap();
        assert_eq!(stats.total_conversations, 1);
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.average_messages_per_conversation, 3.0);
        assert_eq!(stats.messages_by_type["text"], 2);
        assert_eq!(stats.messages_by_type["voice"], 1);
        assert_eq!(stats.conversations_by_mode["text"], 1);
        assert_eq!(stats.emotion_distribution["happy"], 1.0);

        let empty = manager.statistics(Uuid::new_v4(), character).await.unwrap();
        assert_eq!(empty.total_conversations, 0);
    }

    #[tokio::test]
    async fn test_history_window_and_validation() {
        let manager = manager_with(Arc::new(InMemoryStore::new()));
        let user = Uuid::new_v4();
        let first = manager.start(user, start_request(Some("one"))).await.unwrap();
        let second = manager.start(user, start_request(None)).await.unwrap();

        let history = manager
            .history(
                user,
                ConversationHistoryRequest {
                    start_date: Some(first.started_at),
                    sort_order: SortOrder::Asc,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(history.total_conversations, 2);
        assert_eq!(history.conversations[0].id, first.id);
        assert_eq!(history.conversations[1].id, second.id);
        assert_eq!(history.statistics.total_messages, 1);

        let future = manager
            .history(
                user,
                ConversationHistoryRequest {
                    start_date: Some(chrono::Utc::now() + chrono::Duration::days(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(future.total_conversations, 0);
        assert!(future.conversations.is_empty());

        let inverted = ConversationHistoryRequest {
            start_date: Some(second.started_at),
            end_date: Some(first.started_at - chrono::Duration::seconds(1)),
            ..Default::default()
        };
        assert!(matches!(
            manager.history(user, inverted).await,
            Err(ApiError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let manager = manager_with(Arc::new(InMemoryStore::new()));
        let user = Uuid::new_v4();
        let conv = manager.start(user, start_request(None)).await.unwrap();

        let first = manager.end(user, conv.id).await.unwrap();
        let second = manager.end(user, conv.id).await.unwrap();
        assert_eq!(first.status, ConversationStatus::Ended);
        assert!(first.ended_at.is_some());
        assert_eq!(first.ended_at, second.ended_at);
    }

    #[tokio::test]
    async fn test_pause_resume_and_terminal_end() {
        let manager = manager_with(Arc::new(InMemoryStore::new()));
        let user = Uuid::new_v4();
        let conv = manager.start(user, start_request(None)).await.unwrap();

        let paused = manager.pause(user, conv.id).await.unwrap();
        assert_eq!(paused.status, ConversationStatus::Paused);
        assert!(ConversationManager::ensure_active(&paused).is_err());
        assert_eq!(manager.pause(user, conv.id).await.unwrap().status, ConversationStatus::Paused);

        let resumed = manager.resume(user, conv.id).await.unwrap();
        assert!(ConversationManager::ensure_active(&resumed).is_ok());

        manager.pause(user, conv.id).await.unwrap();
        manager.end(user, conv.id).await.unwrap();
        assert!(matches!(
            manager.resume(user, conv.id).await,
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            manager.update_settings(user, conv.id, ConversationSettings::default()).await,
            Err(ApiError::Validation(_))
        ));
    }
}
