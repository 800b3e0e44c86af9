//! Duplex channel: frame codec, session registry and the connection loop.

pub mod duplex;
pub mod frames;
pub mod registry;

pub use duplex::{serve_connection, FrameDispatcher};
pub use frames::{ClientFrame, FrameStatus, Operation, ServerFrame};
pub use registry::{SessionHandle, SessionRegistry, StreamClaim};
