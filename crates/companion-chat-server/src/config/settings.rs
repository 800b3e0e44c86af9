use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::character::CharacterDetails;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub characters: CharactersConfig,
    pub conversation: ConversationConfig,
    pub memory: MemoryConfig,
    pub streaming: StreamingConfig,
    pub limits: LimitsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound for non-streaming HTTP requests.
    pub request_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres URL. When absent the in-memory store is used.
    pub url: Option<String>,
    pub pool_max_size: u32,
    pub pool_timeout_seconds: u64,
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool_max_size: 10,
            pool_timeout_seconds: 5,
            run_migrations: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Bounded upper wait for one generation, enforced by the orchestrator.
    pub timeout_seconds: u64,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".to_string(),
            model: "companion".to_string(),
            api_key: None,
            timeout_seconds: 60,
            temperature: 0.7,
            max_tokens: 500,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    /// Deterministic in-process hashing embedder.
    Local,
    /// llama.cpp / OpenAI compatible embedding server.
    Http,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Local,
            base_url: "http://localhost:8082".to_string(),
            model: "nomic-embed-text".to_string(),
            dimension: 384,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct CharactersConfig {
    /// Character Profile Service. When absent, `catalog` is served instead.
    pub base_url: Option<String>,
    pub catalog: Vec<CatalogCharacter>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CatalogCharacter {
    pub id: Uuid,
    #[serde(flatten)]
    pub details: CharacterDetails,
    #[serde(default)]
    pub voice_id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ConversationConfig {
    /// Trailing messages injected into the prompt.
    pub history_window: usize,
    /// Upper bound on retrieved memories per turn.
    pub memory_retrieval_limit: usize,
    /// Shared memories rendered in the relationship section.
    pub shared_memories_in_prompt: usize,
    pub max_message_chars: usize,
    /// Used when a conversation has no `responseStyle` of its own.
    pub response_style: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            history_window: 20,
            memory_retrieval_limit: 5,
            shared_memories_in_prompt: 5,
            max_message_chars: 2000,
            response_style: "friendly".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Oldest memory goes first, importance ignored.
    #[default]
    Fifo,
    /// Lowest importance goes first, ties broken by age.
    LowestImportance,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct MemoryConfig {
    /// Max memories per (user, character).
    pub capacity: usize,
    /// Max shared-memory strings per character context.
    pub shared_memory_capacity: usize,
    pub consolidation_threshold: f64,
    pub eviction: EvictionPolicy,
    /// Only run per-turn extraction for exchanges flagged significant.
    pub extract_significant_only: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            shared_memory_capacity: 100,
            consolidation_threshold: 0.7,
            eviction: EvictionPolicy::Fifo,
            extract_significant_only: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct StreamingConfig {
    pub keepalive_interval_seconds: u64,
    pub stale_after_seconds: u64,
    /// Outbound frames buffered per duplex connection.
    pub outbound_buffer: usize,
    /// Events buffered per incremental request.
    pub event_buffer: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_seconds: 30,
            stale_after_seconds: 90,
            outbound_buffer: 256,
            event_buffer: 64,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LimitsConfig {
    pub llm_generate_concurrency: usize,
    pub llm_stream_concurrency: usize,
    pub embedding_concurrency: usize,
    pub acquire_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            llm_generate_concurrency: 16,
            llm_stream_concurrency: 16,
            embedding_concurrency: 8,
            acquire_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter directive, overridden by RUST_LOG.
    pub filter: String,
    pub json: bool,
    /// Daily rolling log file directory.
    pub directory: Option<String>,
    pub file_prefix: String,
    pub activity_queue_capacity: usize,
    pub activity_batch_size: usize,
    pub activity_batch_timeout_ms: u64,
    pub activity_workers: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,companion_chat_server=debug".to_string(),
            json: true,
            directory: None,
            file_prefix: "companion-chat-server.log".to_string(),
            activity_queue_capacity: 10_000,
            activity_batch_size: 100,
            activity_batch_timeout_ms: 1000,
            activity_workers: 2,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_runnable() {
        let settings = Settings::default();
        assert!(settings.database.url.is_none());
        assert_eq!(settings.memory.capacity, 100);
        assert_eq!(settings.memory.eviction, EvictionPolicy::Fifo);
        assert_eq!(settings.streaming.keepalive_interval_seconds, 30);
        assert_eq!(settings.embedding.provider, EmbeddingProviderKind::Local);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let raw = r#"
            [server]
            port = 9000

            [memory]
            eviction = "lowest_importance"

            [[characters.catalog]]
            id = "7f1d7a3e-1c84-4d0c-9a55-4b8f0c9b2a11"
            name = "Aria"
            description = "a cheerful astronomer"
            backstory = "Grew up under dark skies."
            voice_id = "aria-voice"
        "#;

        let settings: Settings = Config::builder()
            .add_source(File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.memory.eviction, EvictionPolicy::LowestImportance);
        assert_eq!(settings.memory.capacity, 100);
        assert_eq!(settings.characters.catalog.len(), 1);
        assert_eq!(settings.characters.catalog[0].details.name, "Aria");
        assert_eq!(settings.characters.catalog[0].voice_id.as_deref(), Some("aria-voice"));
    }
}
