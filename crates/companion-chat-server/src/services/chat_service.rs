use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConversationConfig, LlmConfig};
use crate::logging::{ActivityLog, ActivityLogger, ActivityStatus, ActivityType};
use crate::models::{
    Conversation, ConversationMode, Message, MessageMetadata, MessageOptions, SendMessageRequest,
    StreamEvent,
};
use crate::services::conversation::{ContextBuilder, ConversationManager, PromptInputs};
use crate::services::llm_service::GenerationParams;
use crate::services::memory::MemoryService;
use crate::services::orchestrator::{
    GeneratedResponse, GenerationRequest, OrchestratorEvent, ResponseOrchestrator,
};
use crate::utils::error::ApiError;

/// A validated turn, ready for generation. Nothing is persisted yet.
struct PreparedTurn {
    conversation: Conversation,
    user_message: Message,
    request: GenerationRequest,
    voice_id: Option<String>,
    started: Instant,
}

/// Runs one conversational turn end to end: validation, prompt assembly,
/// generation, persistence and post-turn memory work.
pub struct ChatService {
    conversations: Arc<ConversationManager>,
    memory: Arc<MemoryService>,
    orchestrator: ResponseOrchestrator,
    context_builder: ContextBuilder,
    activity: ActivityLogger,
    config: ConversationConfig,
    llm_defaults: GenerationParams,
    event_buffer: usize,
}

impl ChatService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conversations: Arc<ConversationManager>,
        memory: Arc<MemoryService>,
        orchestrator: ResponseOrchestrator,
        activity: ActivityLogger,
        config: ConversationConfig,
        llm: &LlmConfig,
        event_buffer: usize,
    ) -> Self {
        let context_builder =
            ContextBuilder::new(config.response_style.clone(), config.shared_memories_in_prompt);
        Self {
            conversations,
            memory,
            orchestrator,
            context_builder,
            activity,
            config,
            llm_defaults: GenerationParams {
                temperature: llm.temperature,
                max_tokens: llm.max_tokens,
            },
            event_buffer: event_buffer.max(1),
        }
    }

    pub fn conversations(&self) -> &Arc<ConversationManager> {
        &self.conversations
    }

    pub fn memory(&self) -> &Arc<MemoryService> {
        &self.memory
    }

    /// Memories retrieved per turn.
    pub fn retrieval_limit(&self) -> usize {
        self.config.memory_retrieval_limit
    }

    async fn prepare(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        request: SendMessageRequest,
    ) -> Result<PreparedTurn, ApiError> {
        let started = Instant::now();
        request.validate(self.conversations.max_message_chars())?;

        let conversation = self
            .conversations
            .get_conversation(user_id, conversation_id)
            .await?;
        ConversationManager::ensure_active(&conversation)?;

        let character = self.conversations.character(conversation.character_id).await?;
        let character_context = self
            .memory
            .character_context(user_id, conversation.character_id)
            .await?;
        let history = self
            .conversations
            .recent_messages(conversation.id, self.config.history_window)
            .await?;

        let options = request.options.clone().unwrap_or_default();
        let mut user_message =
            Message::user(conversation.id, request.content.trim(), request.message_type);
        if let Some(client) = request.metadata {
            user_message.metadata = Some(MessageMetadata {
                client: Some(client),
                ..Default::default()
            });
        }

        let memories = match self
            .memory
            .retrieve(
                user_id,
                conversation.character_id,
                &user_message.content,
                self.config.memory_retrieval_limit,
            )
            .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    conversation_id = %conversation.id,
                    code = e.code(),
                    "Memory retrieval failed, continuing without: {}",
                    e.detail()
                );
                Vec::new()
            }
        };

        let settings = &conversation.settings;
        let include_emotion = options.include_emotions.unwrap_or(settings.enable_emotions);
        let include_action = options.include_actions.unwrap_or(settings.enable_actions);

        let prompt = self.context_builder.assemble(&PromptInputs {
            character: &character,
            settings,
            character_context: &character_context,
            history: &history,
            current: &user_message,
            memories: &memories,
            preferred_tone: options.preferred_tone.as_deref(),
            include_actions: include_action,
        });

        let voice_id = if wants_voice(&conversation, &options) {
            self.conversations.voice_id(conversation.character_id).await
        } else {
            None
        };

        let request = GenerationRequest {
            prompt,
            params: self.params(&conversation, &options),
            include_emotion,
            include_action,
            user_text: user_message.content.clone(),
        };

        debug!(
            conversation_id = %conversation.id,
            history = history.len(),
            memories = memories.len(),
            "Turn prepared"
        );

        Ok(PreparedTurn {
            conversation,
            user_message,
            request,
            voice_id,
            started,
        })
    }

    fn params(&self, conversation: &Conversation, options: &MessageOptions) -> GenerationParams {
        GenerationParams {
            temperature: conversation
                .settings
                .temperature
                .unwrap_or(self.llm_defaults.temperature),
            max_tokens: options
                .max_response_length
                .or(conversation.settings.max_tokens)
                .unwrap_or(self.llm_defaults.max_tokens),
        }
    }

    /// Persist the exchange and schedule post-turn memory work.
    async fn complete(
        &self,
        turn: PreparedTurn,
        response: GeneratedResponse,
        message_id: Uuid,
    ) -> Result<Message, ApiError> {
        let PreparedTurn {
            conversation,
            user_message,
            voice_id,
            started,
            ..
        } = turn;

        let mut metadata = response.metadata();
        metadata.voice_id = voice_id;
        metadata.processing_time_ms = Some(started.elapsed().as_millis() as u64);

        let mut assistant = Message::assistant(conversation.id, response.text, metadata);
        assistant.id = message_id;

        let (user_message, assistant) = self
            .conversations
            .record_exchange(conversation.id, user_message, assistant)
            .await?;

        if let Err(e) = self
            .memory
            .record_turn(conversation.user_id, conversation.character_id)
            .await
        {
            warn!(conversation_id = %conversation.id, "Relationship update failed: {}", e.detail());
        }

        if !self.memory.config().extract_significant_only || response.significant {
            let memory = self.memory.clone();
            let (conv, user_msg, ai_msg) = (conversation.clone(), user_message, assistant.clone());
            tokio::spawn(async move {
                memory.extract(&conv, &user_msg, &ai_msg).await;
            });
        }

        Ok(assistant)
    }

    fn log_failure(&self, conversation: &Conversation, err: &ApiError, started: Instant) {
        self.activity.log(
            ActivityLog::builder(ActivityType::GenerationFailed)
                .user(conversation.user_id)
                .conversation(conversation.id)
                .character(conversation.character_id)
                .status(ActivityStatus::Error)
                .error(err.code(), err.detail())
                .response_time(started.elapsed().as_millis())
                .build(),
        );
    }

    /// Single-shot turn. Returns the stored assistant message.
    pub async fn send_message(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        request: SendMessageRequest,
    ) -> Result<Message, ApiError> {
        let turn = self.prepare(user_id, conversation_id, request).await?;

        let response = match self.orchestrator.respond(&turn.request).await {
            Ok(response) => response,
            Err(e) => {
                self.log_failure(&turn.conversation, &e, turn.started);
                return Err(e);
            }
        };

        let conversation = turn.conversation.clone();
        let started = turn.started;
        let assistant = self.complete(turn, response, Uuid::new_v4()).await?;

        info!(
            conversation_id = %conversation.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Message answered"
        );
        self.activity.log(
            ActivityLog::builder(ActivityType::MessageSent)
                .user(user_id)
                .conversation(conversation.id)
                .character(conversation.character_id)
                .response_time(started.elapsed().as_millis())
                .build(),
        );

        Ok(assistant)
    }

    /// Incremental turn. Validation, ownership and lookup failures are
    /// returned here; everything after that arrives as events ending in
    /// exactly one `message_end` or `error`. Dropping the receiver cancels
    /// generation and nothing is persisted.
    pub async fn stream_message(
        self: &Arc<Self>,
        user_id: Uuid,
        conversation_id: Uuid,
        request: SendMessageRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, ApiError> {
        let turn = self.prepare(user_id, conversation_id, request).await?;
        let (tx, rx) = mpsc::channel(self.event_buffer);
        let this = self.clone();

        tokio::spawn(async move {
            this.run_stream(turn, tx).await;
        });

        Ok(rx)
    }

    async fn run_stream(&self, turn: PreparedTurn, tx: mpsc::Sender<StreamEvent>) {
        let conversation_id = turn.conversation.id;
        let message_id = Uuid::new_v4();

        for event in [
            StreamEvent::start(conversation_id, message_id),
            StreamEvent::typing(conversation_id, message_id),
        ] {
            if tx.send(event).await.is_err() {
                return;
            }
        }

        let mut events = self
            .orchestrator
            .respond_stream(turn.request.clone(), self.event_buffer);

        loop {
            let event = tokio::select! {
                biased;
                _ = tx.closed() => {
                    debug!(%conversation_id, "Stream consumer went away, cancelling turn");
                    return;
                }
                event = events.recv() => event,
            };

            match event {
                Some(OrchestratorEvent::Chunk { index, text }) => {
                    let chunk = StreamEvent::chunk(conversation_id, message_id, index, text);
                    if tx.send(chunk).await.is_err() {
                        return;
                    }
                }
                Some(OrchestratorEvent::Completed(response)) => {
                    let conversation = turn.conversation.clone();
                    let started = turn.started;
                    let terminal = match self.complete(turn, response, message_id).await {
                        Ok(message) => {
                            self.activity.log(
                                ActivityLog::builder(ActivityType::StreamCompleted)
                                    .user(conversation.user_id)
                                    .conversation(conversation_id)
                                    .character(conversation.character_id)
                                    .response_time(started.elapsed().as_millis())
                                    .build(),
                            );
                            let metadata = message
                                .metadata
                                .as_ref()
                                .and_then(|m| serde_json::to_value(m).ok());
                            StreamEvent::end(conversation_id, message_id, message.content, metadata)
                        }
                        Err(e) => {
                            self.log_failure(&conversation, &e, started);
                            StreamEvent::error(conversation_id, message_id, &e)
                        }
                    };
                    let _ = tx.send(terminal).await;
                    return;
                }
                Some(OrchestratorEvent::Failed(e)) => {
                    self.log_failure(&turn.conversation, &e, turn.started);
                    let _ = tx.send(StreamEvent::error(conversation_id, message_id, &e)).await;
                    return;
                }
                None => {
                    let e = ApiError::Internal("Generation ended without a result".to_string());
                    let _ = tx.send(StreamEvent::error(conversation_id, message_id, &e)).await;
                    return;
                }
            }
        }
    }
}

fn wants_voice(conversation: &Conversation, options: &MessageOptions) -> bool {
    conversation.mode == ConversationMode::Voice || options.request_voice_response == Some(true)
}
