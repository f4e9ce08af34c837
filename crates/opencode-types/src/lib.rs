//! Shared types for the OpenCode agent substrate.

mod agent;
mod event;
mod file;
mod flow;
mod message;
mod permission;
mod session;

pub use agent::*;
pub use event::*;
pub use file::*;
pub use flow::*;
pub use message::*;
pub use permission::*;
pub use session::*;

/// Current time as unix seconds.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Generate a new random identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
