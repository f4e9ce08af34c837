//! The `opencode` command line: flag handling, logging and the two run modes.

pub mod format;
pub mod logging;
pub mod repl;
pub mod runner;

pub use format::OutputFormat;
