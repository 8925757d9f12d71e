//! Append-only JSON-lines error log.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use camino::Utf8PathBuf;
use cap_std::fs::OpenOptions;

use super::{ErrorLogSink, ErrorRecord};
use crate::error::{BotboxError, Result, io_failure};
use crate::rootfs::open_parent;

/// Writes each [`ErrorRecord`] as one JSON line.
#[derive(Debug)]
pub struct JsonlErrorLog {
    path: Utf8PathBuf,
    lock: Mutex<()>,
}

impl JsonlErrorLog {
    /// Log appending to `path`; parent directories are created on demand.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

impl ErrorLogSink for JsonlErrorLog {
    fn record(&self, record: &ErrorRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).map_err(|error| {
            io_failure(&self.path, &std::io::Error::other(error.to_string()))
        })?;
        line.push('\n');

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let io_err = |error: std::io::Error| -> BotboxError { io_failure(&self.path, &error) };
        let (dir, name) = open_parent(&self.path).map_err(io_err)?;
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        let mut file = dir.open_with(&name, &options).map_err(io_err)?;
        file.write_all(line.as_bytes()).map_err(io_err)
    }
}
