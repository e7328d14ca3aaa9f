use narrate_core::{LauncherKind, LauncherSpec};
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// A launcher script that exists in the backend directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launcher {
    pub script: PathBuf,
    pub kind: LauncherKind,
}

impl Launcher {
    /// Interpreter invocation for the script, with `cwd` as working directory.
    pub fn command(&self, cwd: &Path) -> Command {
        let mut cmd = script_command(self.kind, &self.script);
        cmd.current_dir(cwd);
        cmd
    }
}

/// First launcher in `preferences` whose script exists in `backend_dir`.
pub fn select_launcher(backend_dir: &Path, preferences: &[LauncherSpec]) -> Option<Launcher> {
    preferences.iter().find_map(|spec| {
        let script = backend_dir.join(&spec.script);
        script.is_file().then(|| Launcher {
            script,
            kind: spec.kind,
        })
    })
}

pub(crate) fn script_command(kind: LauncherKind, script: &Path) -> Command {
    match kind {
        LauncherKind::PowerShell => {
            let mut cmd = Command::new("powershell.exe");
            cmd.args(["-ExecutionPolicy", "Bypass", "-File"]).arg(script);
            cmd
        }
        LauncherKind::Batch => {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(script);
            cmd
        }
        LauncherKind::Shell => {
            let mut cmd = Command::new("sh");
            cmd.arg(script);
            cmd
        }
    }
}
