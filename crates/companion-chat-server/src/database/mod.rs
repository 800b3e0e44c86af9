pub mod in_memory;
pub mod pool;
pub mod postgres;
pub mod repository;

pub use in_memory::InMemoryStore;
pub use pool::DbPool;
pub use postgres::PgStore;
pub use repository::{ConversationRepository, MemoryRepository};
