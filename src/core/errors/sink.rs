//! Durable mirror for the in-memory error log.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::entry::ErrorLogEntry;
use crate::core::lock;

pub trait LogSink: Send + Sync {
    fn write(&self, entry: &ErrorLogEntry) -> io::Result<()>;
}

/// Appends one JSON document per line. The file stays open for the sink's
/// lifetime and each entry goes out in a single write.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    /// Opens (creating if needed) the file up front, so an unwritable path is
    /// reported at startup rather than on the first error.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for JsonLinesSink {
    fn write(&self, entry: &ErrorLogEntry) -> io::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        lock(&self.file).write_all(&line)
    }
}
