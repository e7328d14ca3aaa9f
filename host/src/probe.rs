use narrate_core::HostConfig;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// TCP-connect liveness check for the backend's HTTP port.
#[derive(Debug, Clone)]
pub struct PortProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl PortProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(
            config.probe_host.clone(),
            config.port,
            Duration::from_millis(config.probe_timeout_ms),
        )
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn is_listening(&self) -> bool {
        is_listening(&self.host, self.port, self.timeout).await
    }
}

/// True if a TCP connection to `host:port` completes within `limit`.
///
/// Refused, unreachable, unresolvable and timed out all count as not listening.
pub async fn is_listening(host: &str, port: u16, limit: Duration) -> bool {
    match timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!("Port check {}:{} failed: {}", host, port, e);
            false
        }
        Err(_) => {
            debug!("Port check {}:{} timed out after {:?}", host, port, limit);
            false
        }
    }
}
