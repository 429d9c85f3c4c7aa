//! Docker host connectivity

pub mod compose;
pub mod connector;
pub mod engine;
pub mod manager;
pub mod session;
pub mod tunnel;

pub use manager::{HostConnectionManager, LogStream, SessionOptions};
pub use session::HostSession;
