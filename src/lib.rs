//! PromptCraft Forge: library crate shared by the `promptcraft` binary and
//! the integration tests in `tests/`.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod models;
pub mod store;
pub mod vault;
