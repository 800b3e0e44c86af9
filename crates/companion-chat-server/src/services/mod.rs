pub mod character_service;
pub mod chat_service;
pub mod conversation;
pub mod embedding_service;
pub mod llm_service;
pub mod memory;
pub mod orchestrator;

pub use character_service::{build_character_provider, CharacterProfileProvider};
pub use chat_service::ChatService;
pub use conversation::ConversationManager;
pub use embedding_service::{build_embedding_provider, EmbeddingProvider};
pub use llm_service::{LlmProvider, LlmService};
pub use memory::MemoryService;
pub use orchestrator::ResponseOrchestrator;
