//! Modpack Core - Foundational Types
//!
//! Error taxonomy and configuration shared by the modpack runtime and CLI.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{LogLevel, PackConfig};
pub use error::{PackError, Result};

/// Modpack version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
