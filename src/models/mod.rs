pub mod credential;
pub mod framework;
pub mod generation;
pub mod history;
pub mod provider;
