//! Streams a managed process's console output to the browser.
//!
//! Progress bars redraw with a bare `\r`, so both `\r` and `\n` end a line.
//! stdout and stderr share one pipe, so lines arrive in the order the child
//! wrote them.

use crate::supervisor::ProcessSlot;
use bytes::BytesMut;
use futures::stream::{BoxStream, StreamExt};
use narrate_ipc::{MessageSender, Status, StatusEvent};
use std::io::{self, PipeReader};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, info, warn};

/// Longest line emitted before a forced break, so an endless progress bar
/// without terminators still fits in one outgoing frame.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Splits a byte stream on `\r` or `\n`, decoding each line lossily.
#[derive(Debug, Default)]
pub struct ProgressLineCodec {
    // Bytes already scanned for a terminator
    next_index: usize,
}

impl ProgressLineCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for ProgressLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        let terminator = buf[self.next_index..]
            .iter()
            .position(|b| *b == b'\n' || *b == b'\r')
            .map(|offset| self.next_index + offset);

        match terminator {
            Some(end) if end < MAX_LINE_BYTES => {
                let line = buf.split_to(end + 1);
                self.next_index = 0;
                Ok(Some(String::from_utf8_lossy(&line[..end]).into_owned()))
            }
            _ if buf.len() >= MAX_LINE_BYTES => {
                let line = buf.split_to(MAX_LINE_BYTES);
                self.next_index = 0;
                Ok(Some(String::from_utf8_lossy(&line).into_owned()))
            }
            _ => {
                self.next_index = buf.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if buf.is_empty() {
            return Ok(None);
        }
        let rest = buf.split_to(buf.len());
        Ok(Some(String::from_utf8_lossy(&rest).into_owned()))
    }
}

/// Everything a monitor task needs besides the child itself.
pub(crate) struct MonitorContext {
    pub id: u64,
    pub phase: Status,
    pub sender: MessageSender,
    pub slot: ProcessSlot,
    /// Set by the supervisor before it kills the process on purpose.
    pub terminated: Arc<AtomicBool>,
}

pub(crate) type OutputLines = BoxStream<'static, io::Result<String>>;

/// Read end of the pipe a child writes both stdout and stderr into.
pub(crate) struct CombinedOutput {
    reader: PipeReader,
}

impl CombinedOutput {
    /// Points the command's stdout and stderr at one fresh pipe.
    ///
    /// The command keeps the write ends until it is dropped; end of stream
    /// is only seen once it and every process holding the pipe are gone.
    pub(crate) fn attach(command: &mut Command) -> io::Result<Self> {
        let (reader, writer) = io::pipe()?;
        command.stdout(writer.try_clone()?).stderr(writer);
        Ok(Self { reader })
    }

    /// Line stream over the pipe. Must be called inside the runtime.
    #[cfg(unix)]
    pub(crate) fn into_lines(self) -> io::Result<OutputLines> {
        use std::os::fd::OwnedFd;
        use tokio::net::unix::pipe::Receiver;

        let file = std::fs::File::from(OwnedFd::from(self.reader));
        let receiver = Receiver::from_file(file)?;
        Ok(FramedRead::new(receiver, ProgressLineCodec::new()).boxed())
    }

    /// Line stream over the pipe, fed by a reader thread since anonymous
    /// pipes cannot be registered with the reactor here.
    #[cfg(windows)]
    pub(crate) fn into_lines(self) -> io::Result<OutputLines> {
        use bytes::Bytes;
        use std::io::Read;
        use tokio::sync::mpsc;
        use tokio_util::io::StreamReader;

        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(16);
        let mut reader = self.reader;
        std::thread::Builder::new()
            .name("output-pipe".to_string())
            .spawn(move || {
                let mut buf = vec![0u8; 8192];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = tx.blocking_send(Err(e));
                            break;
                        }
                    }
                }
            })?;

        let chunks = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        });
        Ok(FramedRead::new(StreamReader::new(chunks), ProgressLineCodec::new()).boxed())
    }
}

pub(crate) fn exit_failure_message(status: &ExitStatus) -> Option<String> {
    if status.success() {
        return None;
    }
    if let Some(code) = status.code() {
        return Some(format!("Process exited with code {}", code));
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(format!("Process terminated by signal {}", signal));
        }
    }
    Some(format!("Process exited abnormally: {}", status))
}

/// Runs until the child's output closes, then reports a failed exit and frees the slot.
pub(crate) async fn run(mut child: Child, mut lines: OutputLines, ctx: MonitorContext) {
    info!(
        "Started monitoring process output (id {}, phase {:?})",
        ctx.id, ctx.phase
    );

    let mut channel_open = true;
    while let Some(item) = lines.next().await {
        match item {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() || !channel_open {
                    continue;
                }
                debug!("{:?} log: {}", ctx.phase, line);
                if let Err(e) = ctx.sender.send(&StatusEvent::log_line(ctx.phase, line)).await {
                    // Keep draining so the child never blocks on a full pipe
                    warn!("Monitor {} could not forward output: {}", ctx.id, e);
                    channel_open = false;
                }
            }
            Err(e) => {
                warn!("Monitor {} read error: {}", ctx.id, e);
                break;
            }
        }
    }
    drop(lines);
    info!("Stopped monitoring process output (id {})", ctx.id);

    match child.wait().await {
        Ok(status) => {
            let terminated = ctx.terminated.load(Ordering::SeqCst);
            match exit_failure_message(&status) {
                Some(message) if !terminated && channel_open => {
                    warn!("Managed process {} failed: {}", ctx.id, message);
                    if let Err(e) = ctx.sender.send(&StatusEvent::error(message)).await {
                        warn!("Monitor {} could not report exit: {}", ctx.id, e);
                    }
                }
                _ => info!(
                    "Managed process {} exited with {} (terminated by host: {})",
                    ctx.id, status, terminated
                ),
            }
        }
        Err(e) => warn!("Failed to wait for managed process {}: {}", ctx.id, e),
    }

    let mut slot = ctx.slot.lock().await;
    if slot.as_ref().map(|p| p.id()) == Some(ctx.id) {
        debug!("Clearing managed process slot for {}", ctx.id);
        *slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn decode_all(input: &[u8]) -> Vec<String> {
        FramedRead::new(input, ProgressLineCodec::new())
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_newline_and_carriage_return_terminate_lines() {
        let lines = decode_all(b"Resolving\nDownloading 10%\rDownloading 55%\rDone\r\n").await;
        assert_eq!(
            lines,
            vec!["Resolving", "Downloading 10%", "Downloading 55%", "Done", ""]
        );
    }

    #[tokio::test]
    async fn test_trailing_partial_line_is_flushed_at_eof() {
        let lines = decode_all(b"first\nno terminator").await;
        assert_eq!(lines, vec!["first", "no terminator"]);
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_decoded_lossily() {
        let lines = decode_all(b"ok \xff\xfe bytes\n").await;
        assert_eq!(lines, vec!["ok \u{FFFD}\u{FFFD} bytes"]);
    }

    #[tokio::test]
    async fn test_overlong_line_is_split() {
        let mut input = vec![b'#'; MAX_LINE_BYTES + 10];
        input.push(b'\n');
        let lines = decode_all(&input).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), MAX_LINE_BYTES);
        assert_eq!(lines[1].len(), 10);
    }

    #[test]
    fn test_decoder_resumes_scan_across_chunks() {
        let mut codec = ProgressLineCodec::new();
        let mut buf = BytesMut::from(&b"partial"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b" line\rnext");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("partial line".to_string()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some("next".to_string()));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_failure_messages() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(exit_failure_message(&ExitStatus::from_raw(0)), None);
        assert_eq!(
            exit_failure_message(&ExitStatus::from_raw(3 << 8)),
            Some("Process exited with code 3".to_string())
        );
        assert_eq!(
            exit_failure_message(&ExitStatus::from_raw(9)),
            Some("Process terminated by signal 9".to_string())
        );
    }
}
