use crate::errors::{HostError, HostResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable that overrides the directory holding `config.toml`.
pub const CONFIG_DIR_ENV: &str = "NARRATE_HOST_CONFIG_DIR";

/// Default TCP port of the backend HTTP server.
pub const DEFAULT_PORT: u16 = 8880;

/// Directory name the installer clones the backend into, under `external/`.
pub const BACKEND_DIR_NAME: &str = "narrate-ai-core";

/// Placeholder substituted with [`HostConfig::python`] in provisioning commands.
pub const PYTHON_PLACEHOLDER: &str = "{python}";

/// Script technology used to run a launcher script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LauncherKind {
    /// `powershell.exe -ExecutionPolicy Bypass -File <script>`
    PowerShell,
    /// `cmd /C <script>`
    Batch,
    /// `sh <script>`
    Shell,
}

/// One entry of the launcher preference list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LauncherSpec {
    pub script: String,
    pub kind: LauncherKind,
}

impl LauncherSpec {
    pub fn new(script: &str, kind: LauncherKind) -> Self {
        Self {
            script: script.to_string(),
            kind,
        }
    }
}

/// One step of the generated setup script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionStep {
    /// Printed as `[SETUP] <banner>` before the command runs.
    pub banner: String,
    pub command: String,
}

/// Rewrite rule applied to the backend's dependency manifest before syncing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestPatchConfig {
    pub manifest_file: String,
    pub lock_file: String,
    pub package: String,
    pub keep_features: Vec<String>,
}

impl Default for ManifestPatchConfig {
    fn default() -> Self {
        Self {
            manifest_file: "pyproject.toml".to_string(),
            lock_file: "uv.lock".to_string(),
            package: "misaki".to_string(),
            keep_features: vec!["en".to_string()],
        }
    }
}

/// Configuration struct for the native messaging host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub port: u16,
    pub probe_host: String,
    pub probe_timeout_ms: u64,
    pub repository_url: String,
    /// Root that relative paths are resolved against. Defaults to the parent of the executable's directory.
    pub base_dir: Option<PathBuf>,
    /// Clone target. Always the first backend candidate.
    pub install_dir: Option<PathBuf>,
    pub backend_candidates: Vec<PathBuf>,
    /// Holds the diagnostic log and the transient setup script. Defaults to the executable's directory.
    pub state_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub log_level: Option<String>,
    pub python: String,
    pub launchers: Vec<LauncherSpec>,
    pub provision_steps: Vec<ProvisionStep>,
    pub process_env: BTreeMap<String, String>,
    pub manifest_patch: ManifestPatchConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            probe_host: "localhost".to_string(),
            probe_timeout_ms: 500,
            repository_url: "https://github.com/remsky/Kokoro-FastAPI.git".to_string(),
            base_dir: None,
            install_dir: None,
            backend_candidates: vec![
                PathBuf::from("external/kokoro-engine"),
                PathBuf::from("external/Kokoro-FastAPI"),
                PathBuf::from("external/kokoro-fastapi"),
                // Layout used before the backend moved under external/
                PathBuf::from("backend"),
            ],
            state_dir: None,
            log_file: None,
            log_level: None,
            python: default_python().to_string(),
            launchers: default_launchers(),
            provision_steps: default_provision_steps(),
            process_env: default_process_env(),
            manifest_patch: ManifestPatchConfig::default(),
        }
    }
}

#[cfg(windows)]
fn default_python() -> &'static str {
    "python"
}

#[cfg(not(windows))]
fn default_python() -> &'static str {
    "python3"
}

#[cfg(windows)]
fn default_launchers() -> Vec<LauncherSpec> {
    vec![
        LauncherSpec::new("start-gpu.ps1", LauncherKind::PowerShell),
        LauncherSpec::new("start-cpu.ps1", LauncherKind::PowerShell),
        LauncherSpec::new("start-gpu.bat", LauncherKind::Batch),
        LauncherSpec::new("start-cpu.bat", LauncherKind::Batch),
    ]
}

#[cfg(not(windows))]
fn default_launchers() -> Vec<LauncherSpec> {
    vec![
        LauncherSpec::new("start-gpu.sh", LauncherKind::Shell),
        LauncherSpec::new("start-cpu.sh", LauncherKind::Shell),
    ]
}

fn default_provision_steps() -> Vec<ProvisionStep> {
    [
        ("Updating pip...", "{python} -m pip install --upgrade pip"),
        ("Installing uv...", "{python} -m pip install uv"),
        (
            "Initializing AI environment (this may take a few minutes)...",
            "uv sync --no-dev",
        ),
    ]
    .into_iter()
    .map(|(banner, command)| ProvisionStep {
        banner: banner.to_string(),
        command: command.to_string(),
    })
    .collect()
}

fn default_process_env() -> BTreeMap<String, String> {
    // Unbuffered, plain progress output so the monitor sees lines as they happen
    [
        ("PYTHONUNBUFFERED", "1"),
        ("UV_PROGRESS_MODE", "plain"),
        ("UV_SHOW_PROGRESS", "1"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl HostConfig {
    /// Loads configuration from a file if it exists, otherwise returns the default config
    pub fn load_from_file(path: &Path) -> HostResult<Self> {
        if path.exists() {
            debug!("Loading config from {}", path.display());
            let content = fs::read_to_string(path).map_err(|e| {
                HostError::ConfigError(format!("Failed to read config file: {}", e))
            })?;

            let config: Self = toml::from_str(&content).map_err(|e| {
                HostError::ConfigError(format!("Failed to parse config file: {}", e))
            })?;

            Ok(config)
        } else {
            debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Saves configuration to a file
    pub fn save_to_file(&self, path: &Path) -> HostResult<()> {
        let content = toml::to_string(self).map_err(|e| {
            HostError::ConfigError(format!("Failed to serialize config: {}", e))
        })?;

        // Ensure the directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                HostError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        fs::write(path, content).map_err(|e| {
            HostError::ConfigError(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Directory containing the running executable.
    pub fn host_dir() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn base_dir(&self) -> PathBuf {
        if let Some(dir) = &self.base_dir {
            return dir.clone();
        }
        let host_dir = Self::host_dir();
        host_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or(host_dir)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir().join(path)
        }
    }

    pub fn install_dir(&self) -> PathBuf {
        match &self.install_dir {
            Some(dir) => self.resolve(dir),
            None => self.base_dir().join("external").join(BACKEND_DIR_NAME),
        }
    }

    /// Ordered backend search list: the install target first, then the configured fallbacks.
    pub fn candidate_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.install_dir()];
        for candidate in &self.backend_candidates {
            let resolved = self.resolve(candidate);
            if !dirs.contains(&resolved) {
                dirs.push(resolved);
            }
        }
        dirs
    }

    pub fn state_dir(&self) -> PathBuf {
        match &self.state_dir {
            Some(dir) => self.resolve(dir),
            None => Self::host_dir(),
        }
    }

    pub fn log_file(&self) -> PathBuf {
        match &self.log_file {
            Some(file) => self.resolve(file),
            None => self.state_dir().join("host_debug.log"),
        }
    }
}

/// Helper function to get the directory holding `config.toml`
pub fn get_default_config_dir() -> HostResult<PathBuf> {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }

    let config_dir = dirs::config_dir().ok_or_else(|| {
        HostError::ConfigError("Could not determine config directory".to_string())
    })?;

    Ok(config_dir.join("narrate-host"))
}

/// Helper function to get default config file path
pub fn get_default_config_file() -> HostResult<PathBuf> {
    let config_dir = get_default_config_dir()?;
    Ok(config_dir.join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = HostConfig::load_from_file(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.probe_host, "localhost");
        assert_eq!(config.manifest_patch.package, "misaki");
        assert_eq!(config.provision_steps.len(), 3);
        assert_eq!(config.process_env.get("PYTHONUNBUFFERED"), Some(&"1".to_string()));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
port = 9000
base_dir = "/opt/narrate"

[manifest_patch]
keep_features = ["en", "ja"]
"#,
        )
        .unwrap();

        let config = HostConfig::load_from_file(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.probe_timeout_ms, 500);
        assert_eq!(config.manifest_patch.keep_features, vec!["en", "ja"]);
        assert_eq!(config.manifest_patch.lock_file, "uv.lock");
        assert_eq!(
            config.install_dir(),
            PathBuf::from("/opt/narrate/external/narrate-ai-core")
        );
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(matches!(
            HostConfig::load_from_file(&path),
            Err(HostError::ConfigError(_))
        ));
    }

    #[test]
    fn test_candidate_dirs_order() {
        let config = HostConfig {
            base_dir: Some(PathBuf::from("/srv/app")),
            backend_candidates: vec![
                PathBuf::from("external/narrate-ai-core"),
                PathBuf::from("backend"),
                PathBuf::from("/elsewhere/backend"),
            ],
            ..HostConfig::default()
        };

        assert_eq!(
            config.candidate_dirs(),
            vec![
                PathBuf::from("/srv/app/external/narrate-ai-core"),
                PathBuf::from("/srv/app/backend"),
                PathBuf::from("/elsewhere/backend"),
            ]
        );
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = HostConfig {
            port: 8123,
            log_level: Some("debug".to_string()),
            ..HostConfig::default()
        };
        config.save_to_file(&path).unwrap();

        let loaded = HostConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.port, 8123);
        assert_eq!(loaded.log_level.as_deref(), Some("debug"));
        assert_eq!(loaded.launchers, config.launchers);
    }
}
