use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::handlers::extract::{ApiJson, ApiPath, ApiQuery};
use crate::models::{
    Conversation, ConversationHistory, ConversationHistoryRequest, ConversationSettings,
    ConversationStatistics, ConversationSummary, ListConversationsQuery, Message, MessagesQuery,
    StartConversationRequest,
};
use crate::services::chat_service::ChatService;
use crate::utils::error::ApiError;

pub async fn start_conversation(
    State(chat): State<Arc<ChatService>>,
    AuthUser(user_id): AuthUser,
    ApiJson(request): ApiJson<StartConversationRequest>,
) -> Result<(StatusCode, Json<ConversationSummary>), ApiError> {
    let conversation = chat.conversations().start(user_id, request).await?;
    info!(conversation_id = %conversation.id, %user_id, "Conversation started via HTTP");
    Ok((StatusCode::CREATED, Json(conversation.summary())))
}

pub async fn list_conversations(
    State(chat): State<Arc<ChatService>>,
    AuthUser(user_id): AuthUser,
    ApiQuery(query): ApiQuery<ListConversationsQuery>,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let conversations = chat
        .conversations()
        .list_conversations(user_id, query.character_id, query.limit)
        .await?;
    Ok(Json(conversations.iter().map(Conversation::summary).collect()))
}

pub async fn conversation_history(
    State(chat): State<Arc<ChatService>>,
    AuthUser(user_id): AuthUser,
    ApiJson(request): ApiJson<ConversationHistoryRequest>,
) -> Result<Json<ConversationHistory>, ApiError> {
    Ok(Json(chat.conversations().history(user_id, request).await?))
}

pub async fn conversation_statistics(
    State(chat): State<Arc<ChatService>>,
    AuthUser(user_id): AuthUser,
    ApiPath(character_id): ApiPath<Uuid>,
) -> Result<Json<ConversationStatistics>, ApiError> {
    Ok(Json(
        chat.conversations()
            .statistics(user_id, character_id)
            .await?,
    ))
}

pub async fn get_conversation(
    State(chat): State<Arc<ChatService>>,
    AuthUser(user_id): AuthUser,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<Conversation>, ApiError> {
    Ok(Json(chat.conversations().get_conversation(user_id, id).await?))
}

pub async fn update_settings(
    State(chat): State<Arc<ChatService>>,
    AuthUser(user_id): AuthUser,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(settings): ApiJson<ConversationSettings>,
) -> Result<Json<Conversation>, ApiError> {
    Ok(Json(
        chat.conversations()
            .update_settings(user_id, id, settings)
            .await?,
    ))
}

pub async fn pause_conversation(
    State(chat): State<Arc<ChatService>>,
    AuthUser(user_id): AuthUser,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<ConversationSummary>, ApiError> {
    Ok(Json(chat.conversations().pause(user_id, id).await?.summary()))
}

pub async fn resume_conversation(
    State(chat): State<Arc<ChatService>>,
    AuthUser(user_id): AuthUser,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<ConversationSummary>, ApiError> {
    Ok(Json(chat.conversations().resume(user_id, id).await?.summary()))
}

pub async fn end_conversation(
    State(chat): State<Arc<ChatService>>,
    AuthUser(user_id): AuthUser,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<StatusCode, ApiError> {
    chat.conversations().end(user_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_messages(
    State(chat): State<Arc<ChatService>>,
    AuthUser(user_id): AuthUser,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<MessagesQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    Ok(Json(
        chat.conversations()
            .list_messages(user_id, id, query.limit)
            .await?,
    ))
}
