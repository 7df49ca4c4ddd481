//! omni_kernel — agentic developer-assistant kernel.
//!
//! This library crate re-exports modules so integration tests
//! (under `tests/`) can access them.

pub mod agent;
pub mod cli;
pub mod config;
pub mod context;
pub mod errors;
pub mod evolution;
pub mod fusion;
pub mod homeostasis;
pub mod kernel;
pub mod logs;
pub mod memory;
pub mod models;
pub mod persistence;
pub mod router;
pub mod search;
pub mod skills;
pub mod utils;
pub mod vector;

/// Return the Omni home directory.
///
/// Resolution order:
/// 1. `OMNI_HOME` environment variable
/// 2. `$PRJ_CONFIG_HOME/omni`
/// 3. `$HOME/.omni`
pub fn omni_home() -> std::path::PathBuf {
    if let Ok(p) = std::env::var("OMNI_HOME") {
        std::path::PathBuf::from(p)
    } else if let Ok(p) = std::env::var("PRJ_CONFIG_HOME") {
        std::path::PathBuf::from(p).join("omni")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".omni")
    }
}
