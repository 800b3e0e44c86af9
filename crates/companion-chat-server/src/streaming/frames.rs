use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{SendMessageRequest, StartConversationRequest, StreamEvent, StreamEventType};
use crate::utils::error::{ApiError, ErrorInfo};

/// A decoded inbound operation.
#[derive(Debug, Clone)]
pub enum Operation {
    StartConversation(StartConversationRequest),
    SendMessage {
        conversation_id: Uuid,
        request: SendMessageRequest,
    },
    StreamMessage {
        conversation_id: Uuid,
        request: SendMessageRequest,
    },
    EndConversation(Uuid),
    PauseConversation(Uuid),
    ResumeConversation(Uuid),
    Ping,
    Pong,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::StartConversation(_) => "start_conversation",
            Operation::SendMessage { .. } => "send_message",
            Operation::StreamMessage { .. } => "stream_message",
            Operation::EndConversation(_) => "end_conversation",
            Operation::PauseConversation(_) => "pause_conversation",
            Operation::ResumeConversation(_) => "resume_conversation",
            Operation::Ping => "ping",
            Operation::Pong => "pong",
        }
    }
}

/// Inbound frame `{type, conversationId?, requestId?, data}` after decoding.
#[derive(Debug, Clone)]
pub struct ClientFrame {
    pub request_id: Option<String>,
    pub operation: Operation,
}

/// A frame that could not be decoded. Carries the request id when one was
/// readable so the error frame can still be correlated.
#[derive(Debug)]
pub struct RejectedFrame {
    pub request_id: Option<String>,
    pub error: ApiError,
}

fn protocol(msg: impl Into<String>) -> ApiError {
    ApiError::TransportProtocol(msg.into())
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, RejectedFrame> {
        let value: Value = serde_json::from_str(text).map_err(|e| RejectedFrame {
            request_id: None,
            error: protocol(format!("Frame is not valid JSON: {}", e)),
        })?;

        let Value::Object(mut object) = value else {
            return Err(RejectedFrame {
                request_id: None,
                error: protocol("Frame must be a JSON object"),
            });
        };

        let request_id = match object.get("requestId") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let reject = |error: ApiError| RejectedFrame {
            request_id: request_id.clone(),
            error,
        };

        let frame_type = match object.get("type") {
            Some(Value::String(t)) if !t.is_empty() => t.clone(),
            Some(_) => return Err(reject(protocol("Frame field `type` must be a non-empty string"))),
            None => return Err(reject(protocol("Frame is missing `type`"))),
        };

        let data = object.remove("data").unwrap_or(Value::Null);
        let conversation_id = object
            .get("conversationId")
            .or_else(|| data.get("conversationId"))
            .cloned();

        let operation = decode_operation(&frame_type, conversation_id, data).map_err(reject)?;

        Ok(Self {
            request_id,
            operation,
        })
    }
}

fn decode_operation(
    frame_type: &str,
    conversation_id: Option<Value>,
    data: Value,
) -> Result<Operation, ApiError> {
    let conversation = || -> Result<Uuid, ApiError> {
        match &conversation_id {
            Some(Value::String(raw)) => Uuid::parse_str(raw)
                .map_err(|_| protocol(format!("`conversationId` is not a valid id: {}", raw))),
            Some(_) => Err(protocol("`conversationId` must be a string")),
            None => Err(protocol(format!("`{}` requires `conversationId`", frame_type))),
        }
    };

    let operation = match frame_type {
        "start_conversation" => Operation::StartConversation(payload(frame_type, data)?),
        "send_message" => Operation::SendMessage {
            conversation_id: conversation()?,
            request: payload(frame_type, data)?,
        },
        "stream_message" => Operation::StreamMessage {
            conversation_id: conversation()?,
            request: payload(frame_type, data)?,
        },
        "end_conversation" => Operation::EndConversation(conversation()?),
        "pause_conversation" => Operation::PauseConversation(conversation()?),
        "resume_conversation" => Operation::ResumeConversation(conversation()?),
        "ping" => Operation::Ping,
        "pong" => Operation::Pong,
        other => return Err(protocol(format!("Unknown frame type `{}`", other))),
    };
    Ok(operation)
}

fn payload<T: DeserializeOwned>(frame_type: &str, data: Value) -> Result<T, ApiError> {
    serde_json::from_value(data)
        .map_err(|e| protocol(format!("Invalid `data` for `{}`: {}", frame_type, e)))
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FrameStatus {
    Success,
    Error,
    Streaming,
}

/// Outbound frame `{type, status, data|error, timestamp, requestId?}`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<FrameStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ServerFrame {
    fn new(frame_type: &str, status: Option<FrameStatus>, request_id: Option<String>) -> Self {
        Self {
            frame_type: frame_type.to_string(),
            status,
            data: None,
            error: None,
            timestamp: Utc::now(),
            request_id,
        }
    }

    pub fn success(frame_type: &str, data: impl Serialize, request_id: Option<String>) -> Self {
        Self {
            data: serde_json::to_value(data).ok(),
            ..Self::new(frame_type, Some(FrameStatus::Success), request_id)
        }
    }

    pub fn error(err: &ApiError, request_id: Option<String>) -> Self {
        Self {
            error: Some(ErrorInfo::from(err)),
            ..Self::new("error", Some(FrameStatus::Error), request_id)
        }
    }

    /// One incremental event. Typed by the event, `streaming` until terminal.
    pub fn stream(event: &StreamEvent, request_id: Option<String>) -> Self {
        let status = match event.event_type {
            StreamEventType::MessageEnd => FrameStatus::Success,
            StreamEventType::Error => FrameStatus::Error,
            _ => FrameStatus::Streaming,
        };
        Self {
            data: serde_json::to_value(event).ok(),
            error: event.error.clone(),
            ..Self::new(event.event_type.as_str(), Some(status), request_id)
        }
    }

    /// Server liveness ping.
    pub fn ping() -> Self {
        Self::new("ping", None, None)
    }

    pub fn pong(request_id: Option<String>) -> Self {
        Self::new("pong", Some(FrameStatus::Success), request_id)
    }

    pub fn is_error(&self) -> bool {
        self.status == Some(FrameStatus::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_type_is_protocol_error() {
        let rejected = ClientFrame::parse(r#"{"requestId":"r1","data":{}}"#).unwrap_err();
        assert!(matches!(rejected.error, ApiError::TransportProtocol(_)));
        assert_eq!(rejected.request_id.as_deref(), Some("r1"));
    }

    #[test]
    fn test_garbage_and_unknown_type() {
        assert!(ClientFrame::parse("not json").is_err());
        assert!(ClientFrame::parse("[1,2]").is_err());

        let rejected = ClientFrame::parse(r#"{"type":"teleport"}"#).unwrap_err();
        assert!(rejected.error.detail().contains("teleport"));
    }

    #[test]
    fn test_send_message_decodes_conversation_and_payload() {
        let id = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"send_message","conversationId":"{}","requestId":7,"data":{{"content":"hi","options":{{"includeEmotions":false}}}}}}"#,
            id
        );
        let frame = ClientFrame::parse(&raw).unwrap();
        assert_eq!(frame.request_id.as_deref(), Some("7"));
        match frame.operation {
            Operation::SendMessage {
                conversation_id,
                request,
            } => {
                assert_eq!(conversation_id, id);
                assert_eq!(request.content, "hi");
                assert_eq!(request.options.unwrap().include_emotions, Some(false));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_conversation_id_may_live_in_data() {
        let id = Uuid::new_v4();
        let raw = format!(r#"{{"type":"end_conversation","data":{{"conversationId":"{}"}}}}"#, id);
        assert!(matches!(
            ClientFrame::parse(&raw).unwrap().operation,
            Operation::EndConversation(got) if got == id
        ));
    }

    #[test]
    fn test_missing_fields_are_rejected() {
        assert!(ClientFrame::parse(r#"{"type":"send_message","data":{"content":"hi"}}"#).is_err());
        let raw = format!(r#"{{"type":"send_message","conversationId":"{}","data":{{}}}}"#, Uuid::new_v4());
        assert!(ClientFrame::parse(&raw).is_err());
    }

    #[test]
    fn test_server_frame_shapes() {
        let err = ServerFrame::error(&ApiError::NotFound("gone".into()), Some("a".into()));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["code"], "NOT_FOUND");
        assert_eq!(json["requestId"], "a");

        let ping = serde_json::to_value(ServerFrame::ping()).unwrap();
        assert_eq!(ping["type"], "ping");
        assert!(ping.get("status").is_none());

        let chunk = StreamEvent::chunk(Uuid::new_v4(), Uuid::new_v4(), 0, "Hel".into());
        let frame = ServerFrame::stream(&chunk, None);
        assert_eq!(frame.frame_type, "message_chunk");
        assert_eq!(frame.status, Some(FrameStatus::Streaming));
        assert_eq!(frame.data.unwrap()["chunkIndex"], 0);
    }
}
