use narrate_core::HostConfig;
use std::path::PathBuf;
use tracing::debug;

/// Finds the backend installation among an ordered list of candidate directories.
///
/// Nothing is cached: the backend may be installed or removed while the
/// extension keeps polling.
#[derive(Debug, Clone)]
pub struct BackendLocator {
    candidates: Vec<PathBuf>,
}

impl BackendLocator {
    pub fn new(candidates: Vec<PathBuf>) -> Self {
        Self { candidates }
    }

    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(config.candidate_dirs())
    }

    /// First candidate that exists as a directory.
    pub fn find_backend(&self) -> Option<PathBuf> {
        let found = self.candidates.iter().find(|path| path.is_dir()).cloned();
        match &found {
            Some(path) => debug!("Found server path: {}", path.display()),
            None => debug!("Server path not found"),
        }
        found
    }

    /// Human-readable list of the directory names searched, for diagnostics.
    pub fn searched(&self) -> String {
        self.candidates
            .iter()
            .map(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string())
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}
