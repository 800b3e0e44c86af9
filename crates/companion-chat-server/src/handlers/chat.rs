use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::handlers::extract::{ApiJson, ApiPath};
use crate::models::{Message, SendMessageRequest, StreamEvent};
use crate::services::chat_service::ChatService;
use crate::utils::error::ApiError;

pub async fn send_message(
    State(chat): State<Arc<ChatService>>,
    AuthUser(user_id): AuthUser,
    ApiPath(conversation_id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<SendMessageRequest>,
) -> Result<Json<Message>, ApiError> {
    let message = chat.send_message(user_id, conversation_id, request).await?;
    Ok(Json(message))
}

/// Incremental turn over SSE. Event names are the stream event types.
/// Validation and ownership failures are answered before the stream opens;
/// a client that disconnects cancels generation.
pub async fn stream_message(
    State(chat): State<Arc<ChatService>>,
    AuthUser(user_id): AuthUser,
    ApiPath(conversation_id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<SendMessageRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let mut events = chat.stream_message(user_id, conversation_id, request).await?;
    debug!(%conversation_id, "SSE stream opened");

    let stream = async_stream::stream! {
        while let Some(event) = events.recv().await {
            yield Ok(create_sse_event(&event));
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn create_sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.event_type.as_str())
        .data(serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string()))
}
