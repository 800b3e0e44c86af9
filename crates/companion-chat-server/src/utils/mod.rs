pub mod error;
pub mod keyed_lock;
pub mod limiters;
pub mod similarity;

pub use error::ApiError;
pub use keyed_lock::KeyedLocks;
pub use similarity::cosine_similarity;
