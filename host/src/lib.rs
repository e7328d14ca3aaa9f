// Native messaging host for the local TTS backend:
// - Backend discovery and port probing
// - Installation (clone, manifest patch, dependency sync)
// - Supervision of the single managed process and its output
// - The command loop that ties them to the framed stdio channel

pub mod dispatcher;
pub mod installer;
pub mod launcher;
pub mod locator;
pub mod logging;
pub mod manifest;
pub mod monitor;
pub mod probe;
pub mod supervisor;

pub use dispatcher::Dispatcher;
pub use installer::Installer;
pub use locator::BackendLocator;
pub use probe::PortProbe;
pub use supervisor::Supervisor;
