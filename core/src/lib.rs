// Shared building blocks for the narrate native messaging host:
// - Host configuration loading (TOML, defaults, path resolution)
// - Shared error taxonomy

// Export config module - Configuration loading
pub mod config;
pub use config::*;

// Export errors module - Shared error types
pub mod errors;
pub use errors::*;
