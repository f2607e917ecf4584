//! Machine-readable monitor output.
//!
//! When `-monitor` is given, job lifecycle events are appended to a log file
//! that external tools (IDE plugins, dashboards) can tail. One line per
//! event, flushed immediately.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::Result;

/// Remote-job completion status reported on a `FINISH_JOB` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishStatus {
    Success,
    Error,
    Timeout,
}

impl FinishStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Timeout => "TIMEOUT",
        }
    }
}

/// Append-only sink for monitor lines.
pub struct Monitor {
    out: Mutex<File>,
}

impl Monitor {
    /// Default monitor log location: `<tmp>/fbuild/monitor.log`.
    pub fn default_path() -> PathBuf {
        std::env::temp_dir().join("fbuild").join("monitor.log")
    }

    /// Create a monitor writing to the default location.
    pub fn create() -> Result<Self> {
        Self::create_at(&Self::default_path())
    }

    /// Create a monitor writing to the given path, truncating any previous log.
    pub fn create_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            out: Mutex::new(file),
        })
    }

    /// Record that a job was handed to a remote worker.
    pub fn start_job(&self, worker: &str, node: &str) {
        self.write_line(&format!("START_JOB {} \"{}\"", worker, node));
    }

    /// Record the outcome of a remote job.
    pub fn finish_job(&self, status: FinishStatus, worker: &str, node: &str, messages: &str) {
        if messages.is_empty() {
            self.write_line(&format!(
                "FINISH_JOB {} {} \"{}\"",
                status.as_str(),
                worker,
                node
            ));
        } else {
            self.write_line(&format!(
                "FINISH_JOB {} {} \"{}\" \"{}\"",
                status.as_str(),
                worker,
                node,
                messages
            ));
        }
    }

    fn write_line(&self, line: &str) {
        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(_) => return,
        };
        // Monitor output is best-effort; a full disk must not fail the build
        let _ = writeln!(out, "{}", line);
        let _ = out.flush();
    }
}
