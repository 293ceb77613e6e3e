//! roundtable — multi-agent conversational orchestrator.
//!
//! This library crate re-exports modules so integration tests
//! (under `tests/`) can access them.

pub mod activity;
pub mod agent;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod message;
pub mod models;
pub mod registry;
pub mod router;
pub mod synthesis;
pub mod tokens;
pub mod tools;
pub mod utils;

/// Return the roundtable home directory.
///
/// Resolution order:
/// 1. `ROUNDTABLE_HOME` environment variable
/// 2. `$HOME/.roundtable`
pub fn roundtable_home() -> std::path::PathBuf {
    if let Ok(p) = std::env::var("ROUNDTABLE_HOME") {
        std::path::PathBuf::from(p)
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".roundtable")
    }
}
