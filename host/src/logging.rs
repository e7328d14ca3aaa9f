//! Diagnostic logging. stdout carries the message channel, so nothing may
//! ever be logged there: records go to an append-only file, or to stderr
//! when the file cannot be opened.

use std::error::Error;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing::Level;

/// Parses a configured level name, case-insensitively.
pub fn parse_level(name: &str) -> Option<Level> {
    name.trim().parse().ok()
}

pub type InitError = Box<dyn Error + Send + Sync + 'static>;

/// Installs the global subscriber writing to `log_file`.
///
/// On success, returns the error that forced the stderr fallback, if any, so
/// the caller can log it once the subscriber is up. Fails when a global
/// subscriber is already installed.
pub fn init(log_file: &Path, level: Level) -> Result<Option<io::Error>, InitError> {
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .with_target(false);

    match open_append(log_file) {
        Ok(file) => {
            builder.with_writer(Mutex::new(file)).try_init()?;
            Ok(None)
        }
        Err(e) => {
            builder.with_writer(io::stderr).try_init()?;
            Ok(Some(e))
        }
    }
}

fn open_append(path: &Path) -> io::Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level(" WARN "), Some(Level::WARN));
        assert_eq!(parse_level("chatty"), None);
    }

    #[test]
    fn test_open_append_creates_parents_and_keeps_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("host_debug.log");

        {
            use std::io::Write;
            let mut file = open_append(&path).unwrap();
            writeln!(file, "first").unwrap();
        }
        {
            use std::io::Write;
            let mut file = open_append(&path).unwrap();
            writeln!(file, "second").unwrap();
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn test_second_init_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("host_debug.log");

        assert!(matches!(init(&path, Level::INFO), Ok(None)));
        tracing::info!("subscriber installed");
        assert!(init(&path, Level::DEBUG).is_err());
        assert!(fs::read_to_string(&path)
            .unwrap()
            .contains("subscriber installed"));
    }
}
