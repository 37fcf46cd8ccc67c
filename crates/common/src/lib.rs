//! fedq Common Library
//!
//! Shared code for the fedq services including:
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability

pub mod config;
pub mod errors;
pub mod metrics;

// Re-export commonly used types
pub use errors::{AppError, Result};
pub use config::AppConfig;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
