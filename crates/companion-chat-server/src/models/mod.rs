pub mod character;
pub mod chat;
pub mod conversation;
pub mod memory;
pub mod message;
pub mod statistics;

pub use character::*;
pub use chat::*;
pub use conversation::*;
pub use memory::*;
pub use message::*;
pub use statistics::*;
