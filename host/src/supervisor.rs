use crate::launcher::select_launcher;
use crate::locator::BackendLocator;
use crate::monitor::{self, CombinedOutput, MonitorContext};
use crate::probe::PortProbe;
use narrate_core::{HostConfig, HostError, HostResult};
use narrate_ipc::{MessageSender, Status, StatusEvent};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// How long `stop` waits for a killed process's monitor to drain and exit.
const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The single process the supervisor is responsible for.
#[derive(Debug)]
pub struct ManagedProcess {
    id: u64,
    pid: Option<u32>,
    phase: Status,
    terminated: Arc<AtomicBool>,
    monitor: JoinHandle<()>,
}

impl ManagedProcess {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> Status {
        self.phase
    }

    /// Kills the whole process tree and waits for the monitor to wind down.
    async fn terminate(self) {
        self.terminated.store(true, Ordering::SeqCst);
        match self.pid {
            Some(pid) => {
                info!("Killing process {} (id {})", pid, self.id);
                kill_process_tree(pid).await;
            }
            None => debug!("Managed process {} already reaped", self.id),
        }

        match timeout(MONITOR_JOIN_TIMEOUT, self.monitor).await {
            Ok(Ok(())) => debug!("Monitor for {} finished", self.id),
            Ok(Err(e)) => warn!("Monitor for {} failed: {}", self.id, e),
            Err(_) => warn!(
                "Monitor for {} still running after {:?}, leaving it detached",
                self.id, MONITOR_JOIN_TIMEOUT
            ),
        }
    }
}

/// Shared slot holding the current managed process, if any.
pub type ProcessSlot = Arc<Mutex<Option<ManagedProcess>>>;

/// Owns the single managed process: launching, replacing and killing it.
pub struct Supervisor {
    config: Arc<HostConfig>,
    locator: BackendLocator,
    probe: PortProbe,
    sender: MessageSender,
    slot: ProcessSlot,
    next_id: AtomicU64,
}

impl Supervisor {
    pub fn new(config: Arc<HostConfig>, sender: MessageSender) -> Self {
        Self {
            locator: BackendLocator::from_config(&config),
            probe: PortProbe::from_config(&config),
            config,
            sender,
            slot: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn locator(&self) -> &BackendLocator {
        &self.locator
    }

    pub fn probe(&self) -> &PortProbe {
        &self.probe
    }

    /// Phase of the current managed process, `None` when idle.
    pub async fn current_phase(&self) -> Option<Status> {
        self.slot.lock().await.as_ref().map(ManagedProcess::phase)
    }

    /// Launches the backend's start script unless it is missing or already serving.
    pub async fn start(&self) -> HostResult<StatusEvent> {
        match self.try_start().await {
            Err(e) if !e.is_fatal() => {
                error!("Start server failed: {}", e);
                Ok(StatusEvent::error(e.to_string()))
            }
            other => other,
        }
    }

    async fn try_start(&self) -> HostResult<StatusEvent> {
        let Some(backend_dir) = self.locator.find_backend() else {
            return Ok(StatusEvent::new(Status::BackendMissing)
                .with_message("Narrate AI Core not found. Install required."));
        };

        if self.probe.is_listening().await {
            info!("Server already running on port {}", self.probe.port());
            return Ok(StatusEvent::new(Status::Running)
                .with_message("Server already active")
                .with_port(self.probe.port()));
        }

        let launcher = select_launcher(&backend_dir, &self.config.launchers)
            .ok_or_else(|| HostError::LauncherNotFound(backend_dir.clone()))?;
        info!(
            "Attempting to start via {:?}: {}",
            launcher.kind,
            launcher.script.display()
        );

        self.launch(launcher.command(&backend_dir), Status::Starting)
            .await?;
        Ok(StatusEvent::new(Status::Starting).with_message("Launched server script with monitoring"))
    }

    /// Replaces the managed process with `command` and starts monitoring it.
    ///
    /// The previous process tree is killed before the new one is spawned.
    pub async fn launch(&self, mut command: Command, phase: Status) -> HostResult<Option<u32>> {
        self.stop().await;

        command.envs(&self.config.process_env).stdin(Stdio::null());
        let output = CombinedOutput::attach(&mut command)?;
        isolate_process_tree(&mut command);

        let program = command.as_std().get_program().to_string_lossy().into_owned();
        let mut slot = self.slot.lock().await;
        let child = command
            .spawn()
            .map_err(|source| HostError::Spawn {
                program: program.clone(),
                source,
            })?;
        // Release our copies of the pipe's write ends so the child's exit ends the stream
        drop(command);
        let lines = match output.into_lines() {
            Ok(lines) => lines,
            Err(e) => {
                error!("Cannot monitor {}, killing it: {}", program, e);
                if let Some(pid) = child.id() {
                    kill_process_tree(pid).await;
                }
                return Err(e.into());
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let pid = child.id();
        let terminated = Arc::new(AtomicBool::new(false));
        let ctx = MonitorContext {
            id,
            phase,
            sender: self.sender.clone(),
            slot: Arc::clone(&self.slot),
            terminated: Arc::clone(&terminated),
        };
        // The monitor cannot clear the slot before we fill it: we hold the lock.
        let monitor = tokio::spawn(monitor::run(child, lines, ctx));

        info!("Launched managed process {} (pid {:?}, phase {:?})", id, pid, phase);
        *slot = Some(ManagedProcess {
            id,
            pid,
            phase,
            terminated,
            monitor,
        });
        Ok(pid)
    }

    /// Kills the managed process tree, if any. Returns whether something was running.
    pub async fn stop(&self) -> bool {
        let current = self.slot.lock().await.take();
        match current {
            Some(process) => {
                process.terminate().await;
                true
            }
            None => false,
        }
    }
}

#[cfg(unix)]
fn isolate_process_tree(command: &mut Command) {
    // New process group led by the child, so killpg reaches every descendant
    command.process_group(0);
}

#[cfg(windows)]
fn isolate_process_tree(command: &mut Command) {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    command.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(unix)]
async fn kill_process_tree(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => debug!("Sent SIGKILL to process group {}", pid),
        Err(Errno::ESRCH) => debug!("Process group {} already gone", pid),
        Err(e) => error!("Failed to kill process group {}: {}", pid, e),
    }
}

#[cfg(windows)]
async fn kill_process_tree(pid: u32) {
    let result = Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdin(Stdio::null())
        .output()
        .await;

    match result {
        Ok(output) if output.status.success() => debug!("taskkill removed tree of {}", pid),
        Ok(output) => warn!(
            "taskkill for {} failed: {}",
            pid,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        Err(e) => error!("Failed to run taskkill: {}", e),
    }
}
