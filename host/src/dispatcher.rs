use crate::installer::Installer;
use crate::supervisor::Supervisor;
use narrate_core::{HostConfig, HostResult};
use narrate_ipc::{Command, FrameReader, HostMessage, MessageSender, Status, StatusEvent};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, error, info, warn};

/// Reads commands from the browser and answers each with at most one reply.
///
/// Long running work (server start, installation) is handed to the
/// supervisor so the loop keeps reading while its output streams back.
pub struct Dispatcher {
    sender: MessageSender,
    supervisor: Arc<Supervisor>,
    installer: Installer,
}

impl Dispatcher {
    pub fn new(config: HostConfig, sender: MessageSender) -> Self {
        let config = Arc::new(config);
        let supervisor = Arc::new(Supervisor::new(Arc::clone(&config), sender.clone()));
        let installer = Installer::new(config, Arc::clone(&supervisor), sender.clone());
        Self {
            sender,
            supervisor,
            installer,
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Runs the command loop until the browser closes the channel.
    ///
    /// End of stream returns `Ok` and leaves any managed process running.
    /// A channel failure kills the managed process and is returned.
    pub async fn run<R: AsyncRead + Unpin>(&self, mut reader: FrameReader<R>) -> HostResult<()> {
        info!("Host ready, waiting for commands");
        let result = self.serve(&mut reader).await;

        if let Err(e) = &result {
            error!("Fatal error in command loop: {}", e);
            if let Err(send_err) = self.sender.send(&StatusEvent::error(e.to_string())).await {
                debug!("Could not report fatal error: {}", send_err);
            }
            if self.supervisor.stop().await {
                info!("Killed managed process after fatal error");
            }
        }
        result
    }

    async fn serve<R: AsyncRead + Unpin>(&self, reader: &mut FrameReader<R>) -> HostResult<()> {
        while let Some(message) = reader.receive::<Value>().await? {
            debug!("Received message: {}", message);
            if let Some(reply) = self.handle(&message).await? {
                self.sender.send(&reply).await?;
            }
        }
        info!("Browser closed the channel, shutting down");
        Ok(())
    }

    /// Executes one message and returns the reply to send, if any.
    pub async fn handle(&self, message: &Value) -> HostResult<Option<HostMessage>> {
        let Some(fields) = message.as_object() else {
            warn!("Ignoring non-object message: {}", message);
            return Ok(None);
        };

        let command = match Command::from_message(fields) {
            (_, Some(command)) => command,
            (Some(raw), None) => {
                warn!("Ignoring unknown command: {}", raw);
                return Ok(None);
            }
            (None, None) => {
                warn!("Ignoring message without a command field");
                return Ok(None);
            }
        };

        info!("Processing command: {}", command);
        let reply: HostMessage = match command {
            Command::CheckStatus => self.check_status().await.into(),
            Command::StartServer => self.supervisor.start().await?.into(),
            Command::InstallBackend => self.installer.install().await?.into(),
            Command::Stop => self.stop().await.into(),
            Command::Ping => HostMessage::pong(),
        };
        Ok(Some(reply))
    }

    async fn check_status(&self) -> StatusEvent {
        let locator = self.supervisor.locator();
        if locator.find_backend().is_none() {
            let searched = locator.searched();
            warn!("Backend not found. Searched in: {}", searched);
            return StatusEvent::new(Status::BackendMissing).with_log(format!(
                "[HOST] Backend not found. Searched in: {}. Please check 'external/' folder.",
                searched
            ));
        }

        let probe = self.supervisor.probe();
        if probe.is_listening().await {
            StatusEvent::new(Status::Running).with_port(probe.port())
        } else {
            StatusEvent::new(Status::Stopped)
        }
    }

    async fn stop(&self) -> StatusEvent {
        if self.supervisor.stop().await {
            info!("Managed process stopped on request");
        } else {
            debug!("Stop requested with nothing running");
        }
        StatusEvent::new(Status::Stopped).with_message("Process killed by user")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    fn dispatcher() -> (Dispatcher, TempDir) {
        let dir = tempdir().unwrap();
        let config = HostConfig {
            base_dir: Some(dir.path().to_path_buf()),
            backend_candidates: Vec::new(),
            state_dir: Some(dir.path().join("state")),
            ..HostConfig::default()
        };
        let (writer, _reader) = tokio::io::duplex(64 * 1024);
        (Dispatcher::new(config, MessageSender::new(writer)), dir)
    }

    #[tokio::test]
    async fn test_ping() {
        let (dispatcher, _dir) = dispatcher();
        let reply = dispatcher.handle(&json!({"command": "ping"})).await.unwrap();
        assert_eq!(reply, Some(HostMessage::pong()));
    }

    #[tokio::test]
    async fn test_ignored_messages_get_no_reply() {
        let (dispatcher, _dir) = dispatcher();
        for message in [
            json!({"command": "reboot"}),
            json!({"command": 42}),
            json!({"text": "hello"}),
            json!(["check_status"]),
            json!("ping"),
        ] {
            assert_eq!(dispatcher.handle(&message).await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_check_status_reports_missing_backend() {
        let (dispatcher, dir) = dispatcher();
        let reply = dispatcher
            .handle(&json!({"command": "check_status"}))
            .await
            .unwrap();
        let Some(HostMessage::Event(event)) = reply else {
            panic!("expected status event, got {:?}", reply);
        };
        assert_eq!(event.status, Status::BackendMissing);
        let log = event.log.unwrap();
        assert!(log.starts_with("[HOST] Backend not found. Searched in: "));
        assert!(log.contains("narrate-ai-core"));
        assert!(!log.contains(&dir.path().display().to_string()));
    }

    #[tokio::test]
    async fn test_start_without_backend() {
        let (dispatcher, _dir) = dispatcher();
        let reply = dispatcher
            .handle(&json!({"command": "start_server"}))
            .await
            .unwrap();
        assert_eq!(
            reply,
            Some(HostMessage::Event(
                StatusEvent::new(Status::BackendMissing)
                    .with_message("Narrate AI Core not found. Install required.")
            ))
        );
    }

    #[tokio::test]
    async fn test_stop_when_idle() {
        let (dispatcher, _dir) = dispatcher();
        let reply = dispatcher.handle(&json!({"command": "stop"})).await.unwrap();
        assert_eq!(
            reply,
            Some(HostMessage::Event(
                StatusEvent::new(Status::Stopped).with_message("Process killed by user")
            ))
        );
        assert_eq!(dispatcher.supervisor().current_phase().await, None);
    }
}
