pub mod chat;
pub mod conversations;
pub mod extract;
pub mod health;
pub mod memories;
pub mod ws;
