use narrate_ipc::ChannelError;
use std::path::PathBuf;
use thiserror::Error;

/// Host errors
#[derive(Error, Debug)]
pub enum HostError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("No recognized start script found in {}", .0.display())]
    LauncherNotFound(PathBuf),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Git clone failed: {0}")]
    CloneFailed(String),

    #[error("Manifest Error: {0}")]
    Manifest(String),

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl HostError {
    /// Whether the error must end the session instead of being reported as a status event.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HostError::Channel(_))
    }
}

/// Result type for host operations
pub type HostResult<T> = Result<T, HostError>;
