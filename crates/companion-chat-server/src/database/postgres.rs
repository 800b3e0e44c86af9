use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::{FromRow, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::pool::DbPool;
use super::repository::{eviction_index, ConversationRepository, MemoryRepository};
use crate::config::settings::EvictionPolicy;
use crate::models::{
    CharacterContext, Conversation, ConversationFilter, ConversationSettings, ConversationStatus,
    Memory, Message, MessageBreakdown, MessageMetadata, ScoredMemory,
};
use crate::utils::error::ApiError;

/// Postgres + pgvector adapter.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn lock_conversation(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Conversation, ApiError> {
        let row = sqlx::query_as::<_, ConversationRow>(
            r#"SELECT id, user_id, character_id, mode, status, settings,
                      started_at, last_activity_at, ended_at, message_count
               FROM conversations WHERE id = $1 FOR UPDATE"#,
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Conversation {} not found", id)))?;

        row.try_into()
    }
}

#[derive(FromRow)]
struct ConversationRow {
    id: Uuid,
    user_id: Uuid,
    character_id: Uuid,
    mode: String,
    status: String,
    settings: sqlx::types::Json<ConversationSettings>,
    started_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    message_count: i64,
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = ApiError;

    fn try_from(row: ConversationRow) -> Result<Self, Self::Error> {
        Ok(Conversation {
            id: row.id,
            user_id: row.user_id,
            character_id: row.character_id,
            mode: row.mode.parse()?,
            status: row.status.parse()?,
            settings: row.settings.0,
            started_at: row.started_at,
            last_activity_at: row.last_activity_at,
            ended_at: row.ended_at,
            message_count: row.message_count,
        })
    }
}

#[derive(FromRow)]
struct MessageRow {
    id: Uuid,
    conversation_id: Uuid,
    role: String,
    content: String,
    message_type: String,
    created_at: DateTime<Utc>,
    metadata: Option<sqlx::types::Json<MessageMetadata>>,
}

impl TryFrom<MessageRow> for Message {
    type Error = ApiError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            id: row.id,
            conversation_id: row.conversation_id,
            role: row.role.parse()?,
            content: row.content,
            message_type: row.message_type.parse()?,
            timestamp: row.created_at,
            metadata: row.metadata.map(|m| m.0),
        })
    }
}

#[derive(FromRow)]
struct MemoryRow {
    id: Uuid,
    user_id: Uuid,
    character_id: Uuid,
    conversation_id: Option<Uuid>,
    message_id: Option<Uuid>,
    content: String,
    embedding: Vector,
    category: String,
    importance: f64,
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    access_count: i64,
}

impl TryFrom<MemoryRow> for Memory {
    type Error = ApiError;

    fn try_from(row: MemoryRow) -> Result<Self, Self::Error> {
        Ok(Memory {
            id: row.id,
            user_id: row.user_id,
            character_id: row.character_id,
            conversation_id: row.conversation_id,
            message_id: row.message_id,
            content: row.content,
            embedding: row.embedding.to_vec(),
            category: row.category.parse()?,
            importance: row.importance,
            created_at: row.created_at,
            last_accessed_at: row.last_accessed_at,
            access_count: row.access_count,
        })
    }
}

#[derive(FromRow)]
struct ContextRow {
    user_id: Uuid,
    character_id: Uuid,
    relationship_strength: i64,
    shared_memories: Vec<String>,
    updated_at: DateTime<Utc>,
}

impl From<ContextRow> for CharacterContext {
    fn from(row: ContextRow) -> Self {
        CharacterContext {
            user_id: row.user_id,
            character_id: row.character_id,
            relationship_strength: row.relationship_strength,
            shared_memories: row.shared_memories,
            updated_at: row.updated_at,
        }
    }
}

const MEMORY_COLUMNS: &str = "id, user_id, character_id, conversation_id, message_id, content, \
     embedding, category, importance, created_at, last_accessed_at, access_count";

#[async_trait]
impl ConversationRepository for PgStore {
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), ApiError> {
        sqlx::query(
            r#"INSERT INTO conversations
               (id, user_id, character_id, mode, status, settings,
                started_at, last_activity_at, ended_at, message_count)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(conversation.id)
        .bind(conversation.user_id)
        .bind(conversation.character_id)
        .bind(conversation.mode.as_str())
        .bind(conversation.status.as_str())
        .bind(sqlx::types::Json(&conversation.settings))
        .bind(conversation.started_at)
        .bind(conversation.last_activity_at)
        .bind(conversation.ended_at)
        .bind(conversation.message_count)
        .execute(self.pool.get_pool())
        .await?;

        Ok(())
    }

    async fn find_conversation(&self, id: Uuid) -> Result<Option<Conversation>, ApiError> {
        let row = sqlx::query_as::<_, ConversationRow>(
            r#"SELECT id, user_id, character_id, mode, status, settings,
                      started_at, last_activity_at, ended_at, message_count
               FROM conversations WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(self.pool.get_pool())
        .await?;

        row.map(Conversation::try_from).transpose()
    }

    async fn list_conversations(
        &self,
        user_id: Uuid,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, ApiError> {
        let sql = format!(
            r#"SELECT id, user_id, character_id, mode, status, settings,
                      started_at, last_activity_at, ended_at, message_count
               FROM conversations
               WHERE user_id = $1
                 AND ($2::uuid IS NULL OR character_id = $2)
                 AND ($3::timestamptz IS NULL OR started_at >= $3)
                 AND ($4::timestamptz IS NULL OR started_at <= $4)
               ORDER BY last_activity_at {}
               LIMIT $5"#,
            filter.order.as_sql()
        );
        let rows = sqlx::query_as::<_, ConversationRow>(&sql)
            .bind(user_id)
            .bind(filter.character_id)
            .bind(filter.started_from)
            .bind(filter.started_to)
            .bind(filter.limit.map(|n| n as i64))
            .fetch_all(self.pool.get_pool())
            .await?;

        rows.into_iter().map(Conversation::try_from).collect()
    }

    async fn message_breakdown(
        &self,
        conversation_ids: &[Uuid],
    ) -> Result<MessageBreakdown, ApiError> {
        if conversation_ids.is_empty() {
            return Ok(MessageBreakdown::default());
        }

        let by_type = sqlx::query_as::<_, (String, i64)>(
            r#"SELECT message_type, COUNT(*)
               FROM messages
               WHERE conversation_id = ANY($1)
               GROUP BY message_type"#,
        )
        .bind(conversation_ids)
        .fetch_all(self.pool.get_pool())
        .await?;

        let by_emotion = sqlx::query_as::<_, (String, i64)>(
            r#"SELECT metadata->'emotion'->>'primary' AS label, COUNT(*)
               FROM messages
               WHERE conversation_id = ANY($1)
                 AND role = 'assistant'
                 AND metadata->'emotion'->>'primary' IS NOT NULL
               GROUP BY label"#,
        )
        .bind(conversation_ids)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(MessageBreakdown {
            by_type: by_type.into_iter().collect(),
            by_emotion: by_emotion.into_iter().collect(),
        })
    }

    async fn transition_status(
        &self,
        id: Uuid,
        target: ConversationStatus,
    ) -> Result<(Conversation, bool), ApiError> {
        let mut tx = self.pool.get_pool().begin().await?;
        let mut conversation = Self::lock_conversation(&mut tx, id).await?;

        let changed = conversation.status.check_transition(target)?;
        if changed {
            let now = Utc::now();
            conversation.status = target;
            conversation.last_activity_at = now.max(conversation.last_activity_at);
            if target == ConversationStatus::Ended {
                conversation.ended_at = Some(now);
            }

            sqlx::query(
                "UPDATE conversations SET status = $2, last_activity_at = $3, ended_at = $4 WHERE id = $1",
            )
            .bind(id)
            .bind(conversation.status.as_str())
            .bind(conversation.last_activity_at)
            .bind(conversation.ended_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok((conversation, changed))
    }

    async fn update_settings(
        &self,
        id: Uuid,
        settings: &ConversationSettings,
    ) -> Result<Conversation, ApiError> {
        let row = sqlx::query_as::<_, ConversationRow>(
            r#"UPDATE conversations SET settings = $2 WHERE id = $1
               RETURNING id, user_id, character_id, mode, status, settings,
                         started_at, last_activity_at, ended_at, message_count"#,
        )
        .bind(id)
        .bind(sqlx::types::Json(settings))
        .fetch_optional(self.pool.get_pool())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Conversation {} not found", id)))?;

        row.try_into()
    }

    async fn append_messages(
        &self,
        conversation_id: Uuid,
        messages: Vec<Message>,
    ) -> Result<Vec<Message>, ApiError> {
        let mut tx = self.pool.get_pool().begin().await?;
        let conversation = Self::lock_conversation(&mut tx, conversation_id).await?;
        conversation.ensure_accepts_messages()?;

        let mut floor: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(created_at) FROM messages WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_one(&mut *tx)
        .await?;

        let mut seq = conversation.message_count;
        let mut stored = Vec::with_capacity(messages.len());

        for mut message in messages {
            message.conversation_id = conversation_id;
            if let Some(prev) = floor {
                message.timestamp = message.timestamp.max(prev);
            }
            floor = Some(message.timestamp);
            seq += 1;

            sqlx::query(
                r#"INSERT INTO messages
                   (id, conversation_id, seq, role, content, message_type, created_at, metadata)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
            )
            .bind(message.id)
            .bind(conversation_id)
            .bind(seq)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(message.message_type.as_str())
            .bind(message.timestamp)
            .bind(message.metadata.as_ref().map(sqlx::types::Json))
            .execute(&mut *tx)
            .await?;

            stored.push(message);
        }

        let last_activity = floor
            .map_or(conversation.last_activity_at, |t| t.max(conversation.last_activity_at));

        sqlx::query(
            "UPDATE conversations SET message_count = $2, last_activity_at = $3 WHERE id = $1",
        )
        .bind(conversation_id)
        .bind(seq)
        .bind(last_activity)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        last: Option<usize>,
    ) -> Result<Vec<Message>, ApiError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"SELECT id, conversation_id, role, content, message_type, created_at, metadata
               FROM (
                   SELECT * FROM messages
                   WHERE conversation_id = $1
                   ORDER BY seq DESC
                   LIMIT $2
               ) tail
               ORDER BY seq ASC"#,
        )
        .bind(conversation_id)
        .bind(last.map(|n| n as i64))
        .fetch_all(self.pool.get_pool())
        .await?;

        rows.into_iter().map(Message::try_from).collect()
    }
}

#[async_trait]
impl MemoryRepository for PgStore {
    async fn insert_memory(
        &self,
        memory: Memory,
        capacity: usize,
        policy: EvictionPolicy,
    ) -> Result<Vec<Uuid>, ApiError> {
        let capacity = capacity.max(1);
        let mut tx = self.pool.get_pool().begin().await?;

        // Serialise writers of the same pair.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::text || $2::text))")
            .bind(memory.user_id)
            .bind(memory.character_id)
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query_as::<_, MemoryRow>(&format!(
            "SELECT {} FROM memories WHERE user_id = $1 AND character_id = $2 ORDER BY created_at ASC",
            MEMORY_COLUMNS
        ))
        .bind(memory.user_id)
        .bind(memory.character_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut existing = existing
            .into_iter()
            .map(Memory::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let mut evicted = Vec::new();
        while existing.len() >= capacity {
            let Some(idx) = eviction_index(&existing, policy) else {
                break;
            };
            evicted.push(existing.remove(idx).id);
        }

        if !evicted.is_empty() {
            sqlx::query("DELETE FROM memories WHERE id = ANY($1)")
                .bind(&evicted)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"INSERT INTO memories
               (id, user_id, character_id, conversation_id, message_id, content, embedding,
                category, importance, created_at, last_accessed_at, access_count)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
        )
        .bind(memory.id)
        .bind(memory.user_id)
        .bind(memory.character_id)
        .bind(memory.conversation_id)
        .bind(memory.message_id)
        .bind(&memory.content)
        .bind(Vector::from(memory.embedding.clone()))
        .bind(memory.category.as_str())
        .bind(memory.importance)
        .bind(memory.created_at)
        .bind(memory.last_accessed_at)
        .bind(memory.access_count)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(evicted)
    }

    async fn search_memories(
        &self,
        user_id: Uuid,
        character_id: Uuid,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredMemory>, ApiError> {
        #[derive(FromRow)]
        struct ScoredRow {
            #[sqlx(flatten)]
            memory: MemoryRow,
            similarity: f64,
        }

        let rows = sqlx::query_as::<_, ScoredRow>(&format!(
            r#"SELECT {}, 1 - (embedding <=> $3) AS similarity
               FROM memories
               WHERE user_id = $1 AND character_id = $2 AND vector_dims(embedding) = $4
               ORDER BY embedding <=> $3, created_at ASC
               LIMIT $5"#,
            MEMORY_COLUMNS
        ))
        .bind(user_id)
        .bind(character_id)
        .bind(Vector::from(query_embedding.to_vec()))
        .bind(query_embedding.len() as i32)
        .bind(limit as i64)
        .fetch_all(self.pool.get_pool())
        .await?;

        debug!("Found {} memories for user {}", rows.len(), user_id);

        rows.into_iter()
            .map(|r| {
                Ok(ScoredMemory {
                    memory: r.memory.try_into()?,
                    similarity: r.similarity as f32,
                })
            })
            .collect()
    }

    async fn mark_accessed(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<(), ApiError> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "UPDATE memories SET last_accessed_at = $2, access_count = access_count + 1 WHERE id = ANY($1)",
        )
        .bind(ids)
        .bind(at)
        .execute(self.pool.get_pool())
        .await?;
        Ok(())
    }

    async fn list_memories(
        &self,
        user_id: Uuid,
        character_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Memory>, ApiError> {
        let rows = sqlx::query_as::<_, MemoryRow>(&format!(
            "SELECT {} FROM memories WHERE user_id = $1 AND character_id = $2 \
             ORDER BY created_at DESC LIMIT $3",
            MEMORY_COLUMNS
        ))
        .bind(user_id)
        .bind(character_id)
        .bind(limit as i64)
        .fetch_all(self.pool.get_pool())
        .await?;

        rows.into_iter().map(Memory::try_from).collect()
    }

    async fn character_context(
        &self,
        user_id: Uuid,
        character_id: Uuid,
    ) -> Result<CharacterContext, ApiError> {
        let row = sqlx::query_as::<_, ContextRow>(
            r#"INSERT INTO character_contexts (user_id, character_id)
               VALUES ($1, $2)
               ON CONFLICT (user_id, character_id) DO UPDATE SET user_id = EXCLUDED.user_id
               RETURNING user_id, character_id, relationship_strength, shared_memories, updated_at"#,
        )
        .bind(user_id)
        .bind(character_id)
        .fetch_one(self.pool.get_pool())
        .await?;

        Ok(row.into())
    }

    async fn push_shared_memories(
        &self,
        user_id: Uuid,
        character_id: Uuid,
        entries: Vec<String>,
        capacity: usize,
    ) -> Result<CharacterContext, ApiError> {
        let mut tx = self.pool.get_pool().begin().await?;

        let row = sqlx::query_as::<_, ContextRow>(
            r#"INSERT INTO character_contexts (user_id, character_id)
               VALUES ($1, $2)
               ON CONFLICT (user_id, character_id) DO UPDATE SET user_id = EXCLUDED.user_id
               RETURNING user_id, character_id, relationship_strength, shared_memories, updated_at"#,
        )
        .bind(user_id)
        .bind(character_id)
        .fetch_one(&mut *tx)
        .await?;

        // Row is locked by the upsert for the rest of the transaction.
        let mut ctx: CharacterContext = row.into();
        ctx.push_shared(entries, capacity);

        sqlx::query(
            r#"UPDATE character_contexts SET shared_memories = $3, updated_at = $4
               WHERE user_id = $1 AND character_id = $2"#,
        )
        .bind(user_id)
        .bind(character_id)
        .bind(&ctx.shared_memories)
        .bind(ctx.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ctx)
    }

    async fn bump_relationship(
        &self,
        user_id: Uuid,
        character_id: Uuid,
    ) -> Result<CharacterContext, ApiError> {
        let row = sqlx::query_as::<_, ContextRow>(
            r#"INSERT INTO character_contexts (user_id, character_id, relationship_strength)
               VALUES ($1, $2, 1)
               ON CONFLICT (user_id, character_id) DO UPDATE
               SET relationship_strength = character_contexts.relationship_strength + 1,
                   updated_at = NOW()
               RETURNING user_id, character_id, relationship_strength, shared_memories, updated_at"#,
        )
        .bind(user_id)
        .bind(character_id)
        .fetch_one(self.pool.get_pool())
        .await?;

        Ok(row.into())
    }
}
