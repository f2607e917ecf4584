//! Named system-wide mutex.
//!
//! Backed by an advisory `flock` on a file under the system temp directory,
//! so the lock is visible across unrelated processes and released by the
//! kernel if the holder dies.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{FbuildError, Result};

/// A named mutex shared between processes.
pub struct SystemMutex {
    path: PathBuf,
    guard: Option<Flock<File>>,
}

impl SystemMutex {
    pub fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!("{}.lock", name));
        Self { path, guard: None }
    }

    /// Attempt to acquire without blocking. Returns false when another
    /// process (or another handle in this process) holds the lock.
    pub fn try_lock(&mut self) -> Result<bool> {
        if self.guard.is_some() {
            return Ok(true);
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(guard) => {
                self.guard = Some(guard);
                Ok(true)
            }
            Err((_, Errno::EAGAIN)) => Ok(false),
            Err((_, errno)) => Err(FbuildError::Process(format!(
                "failed to lock {}: {}",
                self.path.display(),
                errno
            ))),
        }
    }

    /// Whether this handle currently holds the lock.
    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }

    /// Release the lock if held.
    pub fn unlock(&mut self) {
        self.guard = None;
    }
}
