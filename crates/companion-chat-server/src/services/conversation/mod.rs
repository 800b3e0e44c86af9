//! Session Manager and Context Assembler

mod context_builder;
pub mod manager;

pub use context_builder::{AssembledPrompt, ContextBuilder, PromptInputs};
pub use manager::ConversationManager;
