// This crate centralizes the native messaging wire format:
// length-prefixed JSON frames over stdio and the messages carried in them.

pub mod channel; // Framing, send/receive halves
pub mod messages; // Browser <-> host command and status messages

pub use channel::{ChannelError, FrameReader, MessageSender};
pub use messages::{Command, HostMessage, Status, StatusEvent};
