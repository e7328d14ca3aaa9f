use crate::launcher::script_command;
use crate::manifest::{patch_manifest, PatchOutcome};
use crate::supervisor::Supervisor;
use narrate_core::{HostConfig, HostError, HostResult, LauncherKind, PYTHON_PLACEHOLDER};
use narrate_ipc::{MessageSender, Status, StatusEvent};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{error, info, warn};

/// Marker line the setup script prints when every step succeeded.
pub const COMPLETE_BANNER: &str = "Installation Complete.";

#[cfg(windows)]
const SETUP_SCRIPT_NAME: &str = "temp_setup.bat";
#[cfg(not(windows))]
const SETUP_SCRIPT_NAME: &str = "temp_setup.sh";

/// Provisions the backend: clone, manifest patch, then a background setup script.
pub struct Installer {
    config: Arc<HostConfig>,
    supervisor: Arc<Supervisor>,
    sender: MessageSender,
}

impl Installer {
    pub fn new(config: Arc<HostConfig>, supervisor: Arc<Supervisor>, sender: MessageSender) -> Self {
        Self {
            config,
            supervisor,
            sender,
        }
    }

    /// Starts an installation and returns as soon as the setup script is running.
    ///
    /// Output of the script streams as `installing` log events; a failing
    /// step ends the script with a non-zero exit, reported as `error`.
    pub async fn install(&self) -> HostResult<StatusEvent> {
        match self.try_install().await {
            Err(e) if !e.is_fatal() => {
                error!("Install error: {}", e);
                Ok(StatusEvent::error(e.to_string()))
            }
            other => other,
        }
    }

    async fn try_install(&self) -> HostResult<StatusEvent> {
        let target_dir = self.config.install_dir();
        info!("Starting backend installation to: {}", target_dir.display());

        if !target_dir.is_dir() {
            self.sender
                .send(&StatusEvent::log_line(
                    Status::Installing,
                    "[SETUP] Cloning Narrate AI Core...",
                ))
                .await?;
            clone_repository(&self.config.repository_url, &target_dir).await?;
        }

        // A running setup shell reads its script incrementally; it must be gone
        // before the manifest or the script change under it.
        if self.supervisor.stop().await {
            info!("Stopped the running process before provisioning");
        }

        match patch_manifest(&target_dir, &self.config.manifest_patch) {
            Ok(PatchOutcome::Patched { lock_removed }) => {
                info!("Manifest patched (lock file removed: {})", lock_removed)
            }
            Ok(outcome) => info!("Manifest left as is: {:?}", outcome),
            Err(e) => warn!("Patching failed, continuing with original manifest: {}", e),
        }

        let script_path = self.write_setup_script(&target_dir)?;
        info!("Running setup script: {}", script_path.display());

        let mut command = script_command(setup_script_kind(), &script_path);
        command.current_dir(&target_dir);
        self.supervisor.launch(command, Status::Installing).await?;

        Ok(StatusEvent::new(Status::Installing).with_message("Installation started"))
    }

    /// Writes the transient setup script into the state directory, replacing any previous one.
    fn write_setup_script(&self, target_dir: &Path) -> HostResult<PathBuf> {
        let state_dir = self.config.state_dir();
        fs::create_dir_all(&state_dir)?;
        let script_path = state_dir.join(SETUP_SCRIPT_NAME);
        fs::write(&script_path, render_setup_script(&self.config, target_dir))?;
        Ok(script_path)
    }
}

/// Clones `url` into `target_dir`, creating its parent first.
async fn clone_repository(url: &str, target_dir: &Path) -> HostResult<()> {
    if let Some(parent) = target_dir.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| HostError::CloneFailed(format!("cannot create {}: {}", parent.display(), e)))?;
    }

    info!("Cloning repo to {}...", target_dir.display());
    // Output is captured: anything the child wrote to our stdout would corrupt the channel
    let output = Command::new("git")
        .arg("clone")
        .arg(url)
        .arg(target_dir)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| HostError::CloneFailed(format!("could not run git: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(HostError::CloneFailed(format!(
            "git exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    info!("Clone successful.");
    Ok(())
}

#[cfg(windows)]
fn setup_script_kind() -> LauncherKind {
    LauncherKind::Batch
}

#[cfg(not(windows))]
fn setup_script_kind() -> LauncherKind {
    LauncherKind::Shell
}

#[cfg(windows)]
pub fn render_setup_script(config: &HostConfig, target_dir: &Path) -> String {
    let python = format!("\"{}\"", config.python);
    let mut script = String::from("@echo off\r\n");
    script.push_str("echo [SETUP] STARTING SETUP PROCESS...\r\n");
    script.push_str(&format!("cd /d \"{}\"\r\n", target_dir.display()));
    for step in &config.provision_steps {
        script.push_str(&format!("echo [SETUP] {}\r\n", step.banner));
        script.push_str(&step.command.replace(PYTHON_PLACEHOLDER, &python));
        script.push_str("\r\nif errorlevel 1 exit /b 1\r\n");
    }
    script.push_str(&format!("echo [SETUP] {}\r\n", COMPLETE_BANNER));
    script
}

#[cfg(not(windows))]
pub fn render_setup_script(config: &HostConfig, target_dir: &Path) -> String {
    let python = shell_quote(&config.python);
    let mut script = String::from("#!/bin/sh\nset -e\n");
    script.push_str("echo '[SETUP] STARTING SETUP PROCESS...'\n");
    script.push_str(&format!(
        "cd {}\n",
        shell_quote(&target_dir.to_string_lossy())
    ));
    for step in &config.provision_steps {
        script.push_str(&format!(
            "echo {}\n",
            shell_quote(&format!("[SETUP] {}", step.banner))
        ));
        script.push_str(&step.command.replace(PYTHON_PLACEHOLDER, &python));
        script.push('\n');
    }
    script.push_str(&format!(
        "echo {}\n",
        shell_quote(&format!("[SETUP] {}", COMPLETE_BANNER))
    ));
    script
}

#[cfg(not(windows))]
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
