use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::handlers::extract::{ApiJson, ApiPath, ApiQuery};
use crate::models::{AddMemoriesRequest, Memory, MemoryQuery, ScoredMemory};
use crate::services::chat_service::ChatService;
use crate::utils::error::ApiError;

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIMIT: usize = 100;

#[derive(Serialize)]
#[serde(untagged)]
pub enum MemoryListing {
    Ranked(Vec<ScoredMemory>),
    Recent(Vec<Memory>),
}

/// With `query`, a ranked retrieval that stamps access on the returned
/// records. Without, the newest memories and no side effects.
pub async fn list_memories(
    State(chat): State<Arc<ChatService>>,
    AuthUser(user_id): AuthUser,
    ApiPath(character_id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<MemoryQuery>,
) -> Result<Json<MemoryListing>, ApiError> {
    let memory = chat.memory();

    match query.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        Some(text) => {
            let limit = query
                .limit
                .unwrap_or(chat.retrieval_limit())
                .clamp(1, MAX_LIMIT);
            let ranked = memory.retrieve(user_id, character_id, text, limit).await?;
            Ok(Json(MemoryListing::Ranked(ranked)))
        }
        None => {
            let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIMIT);
            let recent = memory.list(user_id, character_id, limit).await?;
            Ok(Json(MemoryListing::Recent(recent)))
        }
    }
}

pub async fn add_memories(
    State(chat): State<Arc<ChatService>>,
    AuthUser(user_id): AuthUser,
    ApiPath(character_id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<AddMemoriesRequest>,
) -> Result<(StatusCode, Json<Vec<Memory>>), ApiError> {
    let stored = chat
        .memory()
        .add_memories(user_id, character_id, request.memories)
        .await?;
    Ok((StatusCode::CREATED, Json(stored)))
}
