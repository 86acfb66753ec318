pub mod admin;
pub mod ai;
pub mod audio;
pub mod config;
pub mod db;
pub mod error;
pub mod outbound;
pub mod pool;
pub mod prompt;
pub mod retrieval;
pub mod scheduler;
pub mod session;
pub mod telephony;
pub mod web;

pub use config::AppConfig;
pub use error::{AppError, AppResult};

