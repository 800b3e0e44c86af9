use anyhow::Result;
use axum::extract::FromRef;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::Settings;
use crate::database::{ConversationRepository, DbPool, InMemoryStore, MemoryRepository, PgStore};
use crate::logging::{ActivityLogger, ActivitySink, LoggerConfig};
use crate::services::memory::{KeywordMemoryHeuristics, MemoryService};
use crate::services::orchestrator::{ResponseOrchestrator, SignalScorers};
use crate::services::{
    build_character_provider, build_embedding_provider, ChatService, ConversationManager,
    LlmService,
};
use crate::streaming::SessionRegistry;
use crate::utils::limiters::Limiters;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub chat: Arc<ChatService>,
    pub registry: Arc<SessionRegistry>,
    pub activity: ActivityLogger,
    /// Present when running against Postgres.
    pub db_pool: Option<DbPool>,
}

impl AppState {
    /// Wire storage, collaborators and services from configuration.
    pub async fn build(settings: Settings) -> Result<Self> {
        let conversations: Arc<dyn ConversationRepository>;
        let memories: Arc<dyn MemoryRepository>;
        let db_pool: Option<DbPool>;
        let sink: ActivitySink;

        if settings.database.url.is_some() {
            let pool = DbPool::new(&settings.database).await?;
            info!("Database connection established");
            let store = Arc::new(PgStore::new(pool.clone()));
            conversations = store.clone();
            memories = store;
            sink = ActivitySink::Postgres(pool.get_pool().clone());
            db_pool = Some(pool);
        } else {
            info!("No database configured, using the in-memory store");
            let store = Arc::new(InMemoryStore::new());
            conversations = store.clone();
            memories = store;
            sink = ActivitySink::Tracing;
            db_pool = None;
        }

        let activity = ActivityLogger::new(sink, LoggerConfig::from(&settings.logging));
        let limiters = Limiters::new(&settings.limits);

        let embedder = build_embedding_provider(&settings.embedding)?;
        let characters = build_character_provider(&settings.characters)?;
        let llm = Arc::new(LlmService::new(settings.llm.clone())?);

        let memory = Arc::new(MemoryService::new(
            memories,
            conversations.clone(),
            embedder,
            Arc::new(KeywordMemoryHeuristics),
            settings.memory.clone(),
            limiters.clone(),
            activity.clone(),
        ));
        let manager = Arc::new(ConversationManager::new(
            conversations,
            characters,
            memory.clone(),
            activity.clone(),
            settings.conversation.max_message_chars,
        ));
        let orchestrator = ResponseOrchestrator::new(
            llm,
            SignalScorers::default(),
            limiters,
            Duration::from_secs(settings.llm.timeout_seconds),
        );
        let chat = Arc::new(ChatService::new(
            manager,
            memory,
            orchestrator,
            activity.clone(),
            settings.conversation.clone(),
            &settings.llm,
            settings.streaming.event_buffer,
        ));

        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(
            settings.streaming.stale_after_seconds,
        )));

        Ok(Self {
            settings: Arc::new(settings),
            chat,
            registry,
            activity,
            db_pool,
        })
    }
}

impl FromRef<AppState> for Arc<ChatService> {
    fn from_ref(state: &AppState) -> Self {
        state.chat.clone()
    }
}

impl FromRef<AppState> for Arc<SessionRegistry> {
    fn from_ref(state: &AppState) -> Self {
        state.registry.clone()
    }
}
