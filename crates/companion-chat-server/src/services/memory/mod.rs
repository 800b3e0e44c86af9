//! Memory Store: extraction, retrieval, consolidation and the character context.

pub mod heuristics;
mod service;

pub use heuristics::{KeywordMemoryHeuristics, MemoryCandidate, MemoryHeuristics};
pub use service::MemoryService;
