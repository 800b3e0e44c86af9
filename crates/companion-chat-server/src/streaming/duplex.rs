use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::frames::{ClientFrame, Operation, ServerFrame};
use super::registry::{SessionHandle, SessionRegistry};
use crate::config::StreamingConfig;
use crate::logging::{ActivityLog, ActivityLogger, ActivityStatus, ActivityType};
use crate::models::{Conversation, SendMessageRequest};
use crate::services::chat_service::ChatService;
use crate::utils::error::ApiError;

/// Routes decoded frames of one connection to the services. Every operation
/// runs on its own task under the session's cancellation token and reports
/// back through the connection's outbound queue.
#[derive(Clone)]
pub struct FrameDispatcher {
    chat: Arc<ChatService>,
    activity: ActivityLogger,
    session: Arc<SessionHandle>,
    outbound: mpsc::Sender<ServerFrame>,
}

impl FrameDispatcher {
    pub fn new(
        chat: Arc<ChatService>,
        activity: ActivityLogger,
        session: Arc<SessionHandle>,
        outbound: mpsc::Sender<ServerFrame>,
    ) -> Self {
        Self {
            chat,
            activity,
            session,
            outbound,
        }
    }

    async fn send(&self, frame: ServerFrame) -> bool {
        self.outbound.send(frame).await.is_ok()
    }

    /// Handle one inbound text frame. A frame that cannot be decoded gets
    /// exactly one error frame; the connection stays open.
    pub async fn handle_text(&self, text: &str) {
        self.session.touch();

        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(rejected) => {
                warn!(
                    session_id = %self.session.id,
                    "Rejected duplex frame: {}",
                    rejected.error.detail()
                );
                self.activity.log(
                    ActivityLog::builder(ActivityType::FrameRejected)
                        .user(self.session.user_id)
                        .status(ActivityStatus::Warning)
                        .error(rejected.error.code(), rejected.error.detail())
                        .build(),
                );
                self.send(ServerFrame::error(&rejected.error, rejected.request_id))
                    .await;
                return;
            }
        };

        debug!(
            session_id = %self.session.id,
            operation = frame.operation.name(),
            "Duplex frame received"
        );

        if matches!(frame.operation, Operation::Pong) {
            return;
        }

        let token = self.session.operation_token();
        let claim = match &frame.operation {
            Operation::StreamMessage {
                conversation_id, ..
            } => match self.session.claim_stream(*conversation_id, token.clone()) {
                Some(claim) => Some(claim),
                None => {
                    let err = ApiError::Validation(format!(
                        "A response is already streaming for conversation {}",
                        conversation_id
                    ));
                    self.send(ServerFrame::error(&err, frame.request_id)).await;
                    return;
                }
            },
            _ => None,
        };

        let this = self.clone();
        tokio::spawn(async move {
            let _claim = claim;
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(session_id = %this.session.id, "Operation cancelled with its connection");
                }
                _ = this.run(frame.operation, frame.request_id) => {}
            }
        });
    }

    async fn run(&self, operation: Operation, request_id: Option<String>) {
        let user_id = self.session.user_id;
        let conversations = self.chat.conversations();

        let frame = match operation {
            Operation::Ping => ServerFrame::pong(request_id),
            Operation::Pong => return,
            Operation::StartConversation(request) => match conversations.start(user_id, request).await {
                Ok(conversation) => {
                    ServerFrame::success("conversation_started", conversation.summary(), request_id)
                }
                Err(e) => ServerFrame::error(&e, request_id),
            },
            Operation::SendMessage {
                conversation_id,
                request,
            } => match self.chat.send_message(user_id, conversation_id, request).await {
                Ok(message) => ServerFrame::success("message_response", message, request_id),
                Err(e) => ServerFrame::error(&e, request_id),
            },
            Operation::StreamMessage {
                conversation_id,
                request,
            } => {
                self.forward_stream(conversation_id, request, request_id).await;
                return;
            }
            Operation::EndConversation(id) => {
                status_frame("conversation_ended", conversations.end(user_id, id).await, request_id)
            }
            Operation::PauseConversation(id) => {
                status_frame("conversation_paused", conversations.pause(user_id, id).await, request_id)
            }
            Operation::ResumeConversation(id) => status_frame(
                "conversation_resumed",
                conversations.resume(user_id, id).await,
                request_id,
            ),
        };

        self.send(frame).await;
    }

    async fn forward_stream(
        &self,
        conversation_id: Uuid,
        request: SendMessageRequest,
        request_id: Option<String>,
    ) {
        let mut events = match self
            .chat
            .stream_message(self.session.user_id, conversation_id, request)
            .await
        {
            Ok(events) => events,
            Err(e) => {
                self.send(ServerFrame::error(&e, request_id)).await;
                return;
            }
        };

        while let Some(event) = events.recv().await {
            if !self.send(ServerFrame::stream(&event, request_id.clone())).await {
                return;
            }
        }
    }
}

fn status_frame(
    frame_type: &str,
    result: Result<Conversation, ApiError>,
    request_id: Option<String>,
) -> ServerFrame {
    match result {
        Ok(conversation) => ServerFrame::success(
            frame_type,
            json!({ "conversationId": conversation.id, "status": conversation.status }),
            request_id,
        ),
        Err(e) => ServerFrame::error(&e, request_id),
    }
}

/// Drive one upgraded websocket until the client leaves or the session is
/// reclaimed. Closing cancels every in-flight operation of the connection.
pub async fn serve_connection(
    socket: WebSocket,
    user_id: Uuid,
    chat: Arc<ChatService>,
    registry: Arc<SessionRegistry>,
    activity: ActivityLogger,
    config: StreamingConfig,
) {
    let session = registry.register(user_id);
    let cancel = session.cancel_token().clone();
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerFrame>(config.outbound_buffer.max(1));

    info!(session_id = %session.id, %user_id, "Duplex connection opened");
    activity.log(
        ActivityLog::builder(ActivityType::DuplexConnected)
            .user(user_id)
            .custom("session_id", session.id.to_string())
            .build(),
    );

    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = writer_cancel.cancelled() => break,
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode outbound frame: {}", e);
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let heartbeat_cancel = cancel.clone();
    let heartbeat_tx = outbound_tx.clone();
    let interval = Duration::from_secs(config.keepalive_interval_seconds.max(1));
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = heartbeat_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if heartbeat_tx.send(ServerFrame::ping()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let dispatcher = FrameDispatcher::new(chat, activity.clone(), session.clone(), outbound_tx);

    loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => break,
            inbound = stream.next() => inbound,
        };

        match inbound {
            Some(Ok(WsMessage::Text(text))) => dispatcher.handle_text(text.as_str()).await,
            Some(Ok(WsMessage::Binary(_))) => {
                session.touch();
                let err = ApiError::TransportProtocol("Binary frames are not supported".to_string());
                let _ = dispatcher.send(ServerFrame::error(&err, None)).await;
            }
            Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => session.touch(),
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Err(e)) => {
                debug!(session_id = %session.id, "Websocket receive error: {}", e);
                break;
            }
        }
    }

    let reclaimed = registry.remove(session.id).is_none();
    cancel.cancel();
    heartbeat.abort();
    let _ = writer.await;

    info!(
        session_id = %session.id,
        %user_id,
        reclaimed,
        "Duplex connection closed"
    );
    activity.log(
        ActivityLog::builder(ActivityType::DuplexDisconnected)
            .user(user_id)
            .custom("session_id", session.id.to_string())
            .custom("reclaimed", reclaimed)
            .build(),
    );
}
