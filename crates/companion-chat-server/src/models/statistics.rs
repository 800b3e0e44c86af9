use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::conversation::{Conversation, ConversationFilter, ConversationSummary, SortOrder};
use crate::utils::error::ApiError;

/// Message counts over a set of conversations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageBreakdown {
    /// Message type -> count.
    pub by_type: BTreeMap<String, i64>,
    /// Primary emotion label of assistant messages -> count.
    pub by_emotion: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationStatistics {
    pub total_conversations: i64,
    pub total_messages: i64,
    pub average_messages_per_conversation: f64,
    /// Seconds from start to end, or to last activity while still open.
    pub average_conversation_duration: f64,
    pub messages_by_type: BTreeMap<String, i64>,
    pub conversations_by_mode: BTreeMap<String, i64>,
    /// Share of emotion-tagged assistant messages per primary emotion.
    pub emotion_distribution: BTreeMap<String, f64>,
}

impl ConversationStatistics {
    pub fn compute(conversations: &[Conversation], breakdown: MessageBreakdown) -> Self {
        let count = conversations.len() as i64;
        let total_messages: i64 = conversations.iter().map(|c| c.message_count).sum();

        let mut conversations_by_mode = BTreeMap::new();
        for conversation in conversations {
            *conversations_by_mode
                .entry(conversation.mode.as_str().to_string())
                .or_insert(0) += 1;
        }

        let (average_messages_per_conversation, average_conversation_duration) = if count == 0 {
            (0.0, 0.0)
        } else {
            let total_seconds: f64 = conversations
                .iter()
                .map(|c| {
                    let until = c.ended_at.unwrap_or(c.last_activity_at);
                    (until - c.started_at).num_milliseconds().max(0) as f64 / 1000.0
                })
                .sum();
            (
                total_messages as f64 / count as f64,
                total_seconds / count as f64,
            )
        };

        let tagged: i64 = breakdown.by_emotion.values().sum();
        let emotion_distribution = breakdown
            .by_emotion
            .into_iter()
            .filter(|_| tagged > 0)
            .map(|(label, n)| (label, n as f64 / tagged as f64))
            .collect();

        Self {
            total_conversations: count,
            total_messages,
            average_messages_per_conversation,
            average_conversation_duration,
            messages_by_type: breakdown.by_type,
            conversations_by_mode,
            emotion_distribution,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversationHistoryRequest {
    pub character_id: Option<Uuid>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub sort_order: SortOrder,
}

impl ConversationHistoryRequest {
    pub fn into_filter(self, max_limit: usize) -> Result<ConversationFilter, ApiError> {
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(ApiError::Validation(
                    "startDate must not be after endDate".to_string(),
                ));
            }
        }
        // A zero limit means "as many as allowed".
        let limit = self.limit.filter(|n| *n > 0).unwrap_or(max_limit);
        Ok(ConversationFilter {
            character_id: self.character_id,
            started_from: self.start_date,
            started_to: self.end_date,
            limit: Some(limit.min(max_limit)),
            order: self.sort_order,
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationHistory {
    pub conversations: Vec<ConversationSummary>,
    pub total_conversations: i64,
    pub statistics: ConversationStatistics,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConversationMode, ConversationSettings};
    use chrono::Duration;

    fn conversation(mode: ConversationMode, messages: i64, minutes: i64, ended: bool) -> Conversation {
        let mut c = Conversation::new(Uuid::new_v4(), Uuid::new_v4(), mode, ConversationSettings::default());
        c.message_count = messages;
        c.last_activity_at = c.started_at + Duration::minutes(minutes);
        if ended {
            c.ended_at = Some(c.started_at + Duration::minutes(minutes * 2));
        }
        c
    }

    #[test]
    fn test_compute_statistics() {
        let conversations = vec![
            conversation(ConversationMode::Text, 4, 1, false),
            conversation(ConversationMode::Text, 2, 1, true),
            conversation(ConversationMode::Voice, 0, 0, false),
        ];
        let breakdown = MessageBreakdown {
            by_type: BTreeMap::from([("text".to_string(), 5), ("voice".to_string(), 1)]),
            by_emotion: BTreeMap::from([("happy".to_string(), 3), ("sad".to_string(), 1)]),
        };

        let stats = ConversationStatistics::compute(&conversations, breakdown);
        assert_eq!(stats.total_conversations, 3);
        assert_eq!(stats.total_messages, 6);
        assert_eq!(stats.average_messages_per_conversation, 2.0);
        // 60s + 120s + 0s
        assert_eq!(stats.average_conversation_duration, 60.0);
        assert_eq!(stats.conversations_by_mode["text"], 2);
        assert_eq!(stats.conversations_by_mode["voice"], 1);
        assert_eq!(stats.messages_by_type["voice"], 1);
        assert_eq!(stats.emotion_distribution["happy"], 0.75);
        assert_eq!(stats.emotion_distribution["sad"], 0.25);
    }

    #[test]
    fn test_empty_statistics_are_zero() {
        let stats = ConversationStatistics::compute(&[], MessageBreakdown::default());
        assert_eq!(stats.total_conversations, 0);
        assert_eq!(stats.average_messages_per_conversation, 0.0);
        assert_eq!(stats.average_conversation_duration, 0.0);
        assert!(stats.emotion_distribution.is_empty());
    }

    #[test]
    fn test_history_request_validation() {
        let now = Utc::now();
        let inverted = ConversationHistoryRequest {
            start_date: Some(now),
            end_date: Some(now - Duration::days(1)),
            ..Default::default()
        };
        assert!(matches!(inverted.into_filter(100), Err(ApiError::Validation(_))));

        let req: ConversationHistoryRequest =
            serde_json::from_str(r#"{"limit":500,"sortOrder":"asc","startDate":"2026-01-01T00:00:00Z"}"#)
                .unwrap();
        let filter = req.into_filter(100).unwrap();
        assert_eq!(filter.limit, Some(100));
        assert_eq!(filter.order, SortOrder::Asc);
        assert!(filter.started_from.is_some());
    }
}
