use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Commands the browser extension sends in the `command` field of a request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Report whether the backend is installed and serving.
    CheckStatus,
    /// Launch the backend's start script unless it is already serving.
    StartServer,
    /// Clone and provision the backend in the background.
    InstallBackend,
    /// Kill the managed process tree.
    Stop,
    /// Liveness check, answered with `{"response": "pong"}`.
    Ping,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::CheckStatus => "check_status",
            Command::StartServer => "start_server",
            Command::InstallBackend => "install_backend",
            Command::Stop => "stop",
            Command::Ping => "ping",
        }
    }

    /// Extracts the command from an incoming message.
    ///
    /// Returns the raw `command` value alongside the parse result so callers
    /// can log what they ignored.
    pub fn from_message(message: &Map<String, Value>) -> (Option<&Value>, Option<Command>) {
        let raw = message.get("command");
        let command = raw.and_then(Value::as_str).and_then(|s| s.parse().ok());
        (raw, command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "check_status" => Ok(Command::CheckStatus),
            "start_server" => Ok(Command::StartServer),
            "install_backend" => Ok(Command::InstallBackend),
            "stop" => Ok(Command::Stop),
            "ping" => Ok(Command::Ping),
            other => Err(format!("Unknown command: {}", other)),
        }
    }
}

/// Backend state reported in the `status` field of outgoing events.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    BackendMissing,
    Stopped,
    Running,
    Starting,
    Installing,
    Error,
}

/// `{status, message?, log?, port?}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

// Helper constructors for creating events easily.
impl StatusEvent {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            message: None,
            log: None,
            port: None,
        }
    }

    /// Creates an `error` event with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Status::Error).with_message(message)
    }

    /// Creates a log line event for a streaming phase (`installing` or `starting`).
    pub fn log_line(status: Status, line: impl Into<String>) -> Self {
        Self::new(status).with_log(line)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

/// Anything the host writes to the browser.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum HostMessage {
    Event(StatusEvent),
    Pong { response: String },
}

impl HostMessage {
    pub fn pong() -> Self {
        HostMessage::Pong {
            response: "pong".to_string(),
        }
    }
}

impl From<StatusEvent> for HostMessage {
    fn from(event: StatusEvent) -> Self {
        HostMessage::Event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_event_omits_absent_fields() {
        let value = serde_json::to_value(StatusEvent::new(Status::Stopped)).unwrap();
        assert_eq!(value, json!({"status": "stopped"}));

        let value =
            serde_json::to_value(StatusEvent::new(Status::Running).with_port(8880)).unwrap();
        assert_eq!(value, json!({"status": "running", "port": 8880}));

        let value = serde_json::to_value(StatusEvent::new(Status::BackendMissing)).unwrap();
        assert_eq!(value, json!({"status": "backend_missing"}));
    }

    #[test]
    fn test_pong_shape() {
        let value = serde_json::to_value(HostMessage::pong()).unwrap();
        assert_eq!(value, json!({"response": "pong"}));
    }

    #[test]
    fn test_command_from_message() {
        let message = json!({"command": "install_backend", "extra": true});
        let (raw, command) = Command::from_message(message.as_object().unwrap());
        assert_eq!(raw, Some(&json!("install_backend")));
        assert_eq!(command, Some(Command::InstallBackend));

        let message = json!({"command": "reboot"});
        let (_, command) = Command::from_message(message.as_object().unwrap());
        assert_eq!(command, None);

        let message = json!({"command": 7});
        let (raw, command) = Command::from_message(message.as_object().unwrap());
        assert_eq!(raw, Some(&json!(7)));
        assert_eq!(command, None);

        let message = json!({});
        assert_eq!(Command::from_message(message.as_object().unwrap()), (None, None));
    }

    #[test]
    fn test_command_names_round_trip_through_from_str() {
        for command in [
            Command::CheckStatus,
            Command::StartServer,
            Command::InstallBackend,
            Command::Stop,
            Command::Ping,
        ] {
            assert_eq!(command.as_str().parse::<Command>(), Ok(command));
            assert_eq!(serde_json::to_value(command).unwrap(), json!(command.as_str()));
        }
    }
}
