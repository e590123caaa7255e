pub mod commands;
pub mod config;
pub mod database;
pub mod errors;
pub mod gemini;
pub mod media;
pub mod metadata;
#[cfg(test)]
mod mock_http;
pub mod security;
pub mod single_instance;
pub mod ui;
pub mod uploader;

pub use errors::{AppError, AppResult};
