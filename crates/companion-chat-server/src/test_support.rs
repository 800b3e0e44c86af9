//! Shared fixtures: a scripted generative backend and a fully wired
//! `ChatService` over the in-memory store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{ConversationConfig, LimitsConfig, LlmConfig, MemoryConfig};
use crate::database::InMemoryStore;
use crate::logging::{ActivityLog, ActivityLogger};
use crate::models::{
    CharacterDetails, Conversation, ConversationMode, StartConversationRequest, VoiceConfig,
};
use crate::services::character_service::MockCharacterProfileProvider;
use crate::services::chat_service::ChatService;
use crate::services::conversation::ConversationManager;
use crate::services::embedding_service::HashingEmbedder;
use crate::services::llm_service::{ChatMessage, GenerationParams, LlmProvider, TextStream};
use crate::services::memory::{KeywordMemoryHeuristics, MemoryService};
use crate::services::orchestrator::{ResponseOrchestrator, SignalScorers};
use crate::utils::limiters::Limiters;

/// Replies with a fixed text, word by word when streaming. `hang` never
/// answers, `delay` answers late. Every system prompt it receives is recorded.
#[derive(Default)]
pub struct ScriptedLlm {
    pub reply: String,
    pub hang: bool,
    pub delay: Option<Duration>,
    pub prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn generate(
        &self,
        system_prompt: &str,
        _messages: &[ChatMessage],
        _params: &GenerationParams,
    ) -> anyhow::Result<String> {
        self.prompts.lock().push(system_prompt.to_string());
        if self.hang {
            futures::future::pending::<()>().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.reply.clone())
    }

    async fn generate_stream(
        &self,
        system_prompt: &str,
        _messages: &[ChatMessage],
        _params: &GenerationParams,
    ) -> anyhow::Result<TextStream> {
        self.prompts.lock().push(system_prompt.to_string());
        if self.hang {
            return Ok(Box::pin(futures::stream::pending()));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let words: Vec<anyhow::Result<String>> = self
            .reply
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();
        Ok(Box::pin(futures::stream::iter(words)))
    }
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub llm: Arc<ScriptedLlm>,
    pub chat: Arc<ChatService>,
    pub activity: ActivityLogger,
    /// Everything logged through `activity`.
    pub activity_log: flume::Receiver<ActivityLog>,
}

/// Generation times out after 200ms.
pub fn harness(reply: &str, hang: bool) -> Harness {
    harness_with(ScriptedLlm {
        reply: reply.to_string(),
        hang,
        ..Default::default()
    })
}

pub fn harness_with(llm: ScriptedLlm) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let llm = Arc::new(llm);

    let mut characters = MockCharacterProfileProvider::new();
    characters.expect_get_character_details().returning(|id| {
        Ok((id != Uuid::nil()).then(|| CharacterDetails {
            name: "Aria".into(),
            description: "a cheerful astronomer".into(),
            personality_traits: vec!["curious".into()],
            backstory: None,
        }))
    });
    characters.expect_get_voice_config().returning(|_| {
        Ok(Some(VoiceConfig {
            voice_id: "aria-voice".into(),
        }))
    });

    let (activity, activity_log) = ActivityLogger::detached(4096);
    let limiters = Limiters::new(&LimitsConfig::default());
    let memory = Arc::new(MemoryService::new(
        store.clone(),
        store.clone(),
        Arc::new(HashingEmbedder::new(64).expect("valid dimension")),
        Arc::new(KeywordMemoryHeuristics),
        MemoryConfig::default(),
        limiters.clone(),
        activity.clone(),
    ));
    let conversations = Arc::new(ConversationManager::new(
        store.clone(),
        Arc::new(characters),
        memory.clone(),
        activity.clone(),
        2000,
    ));
    let orchestrator = ResponseOrchestrator::new(
        llm.clone(),
        SignalScorers::default(),
        limiters,
        Duration::from_millis(200),
    );
    let chat = Arc::new(ChatService::new(
        conversations,
        memory,
        orchestrator,
        activity.clone(),
        ConversationConfig::default(),
        &LlmConfig::default(),
        16,
    ));

    Harness {
        store,
        llm,
        chat,
        activity,
        activity_log,
    }
}

pub async fn start_conversation(h: &Harness, user: Uuid, mode: ConversationMode) -> Conversation {
    h.chat
        .conversations()
        .start(
            user,
            StartConversationRequest {
                character_id: Uuid::new_v4(),
                initial_message: None,
                mode,
                settings: None,
            },
        )
        .await
        .expect("conversation starts")
}
