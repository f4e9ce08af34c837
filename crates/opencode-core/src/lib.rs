//! Agent and flow execution substrate for OpenCode.
//!
//! Stores for sessions, messages and file history sit behind a [`db::Storage`]
//! backend and publish every change through a [`pubsub::Broker`]. Agents run
//! model turns and tools under a [`permission::PermissionGate`]; flows compose
//! agent runs into a DAG. [`App`] wires it all together.

pub mod agent;
mod app;
pub mod config;
pub mod db;
pub mod diff;
pub mod discovery;
mod error;
pub mod flow;
pub mod history;
pub mod llm;
pub mod lsp;
pub mod message;
pub mod patch;
pub mod permission;
pub mod project;
pub mod pubsub;
pub mod retry;
pub mod session;
pub mod sync;
pub mod tools;

pub use app::App;
pub use config::Config;
pub use error::CoreError;

/// Result type for OpenCode core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
