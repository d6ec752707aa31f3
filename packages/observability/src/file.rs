//! Append-only JSONL log file shared between processes.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;

/// Log file opened in append mode.
///
/// Every event is collected in a [`PendingLine`] and handed to the file in a
/// single `write_all` when the line is dropped. With `O_APPEND` that keeps
/// lines whole even when several server instances share one file.
#[derive(Clone)]
pub struct LogFileWriter {
    path: Arc<PathBuf>,
    file: Arc<Mutex<File>>,
}

impl LogFileWriter {
    /// Open (or create) the log file, creating parent directories first.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: Arc::new(path.to_path_buf()),
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, bytes: &[u8]) -> io::Result<()> {
        self.file.lock().write_all(bytes)
    }
}

/// One event's worth of output, written out on drop.
pub struct PendingLine {
    target: LogFileWriter,
    buf: Vec<u8>,
}

impl Write for PendingLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let result = self.target.append(&self.buf);
        self.buf.clear();
        result
    }
}

impl Drop for PendingLine {
    fn drop(&mut self) {
        // Nowhere left to report a failed log write.
        let _ = self.flush();
    }
}

impl<'a> MakeWriter<'a> for LogFileWriter {
    type Writer = PendingLine;

    fn make_writer(&'a self) -> Self::Writer {
        PendingLine {
            target: self.clone(),
            buf: Vec::with_capacity(256),
        }
    }
}
