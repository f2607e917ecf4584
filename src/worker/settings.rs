//! Persisted worker settings.
//!
//! Stored next to the worker executable as `<executable>.settings`: a 3-byte
//! `FWS` magic, a version byte, then the fields. Version 1 carries mode,
//! CPU count and the start-minimized flag; version 4 appends the grace
//! period, the blocking process-name list and the blocking grace period.
//! Files with an unknown magic or a version outside the supported range are
//! treated as absent.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;
use crate::protocol::wire::{Reader, Writer};
use crate::worker::WorkerMode;

/// Oldest version this build can read.
pub const SETTINGS_MIN_VERSION: u8 = 1;
/// Version this build writes.
pub const SETTINGS_CURRENT_VERSION: u8 = 4;

const MAGIC: &[u8; 3] = b"FWS";

/// Worker settings, persisted across runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub mode: WorkerMode,
    pub num_cpus_to_use: u32,
    pub start_minimized: bool,
    /// Seconds until remaining jobs are killed after a mode change.
    pub grace_period: u32,
    /// Process names whose presence pauses job acceptance.
    pub blocking_process_names: Vec<String>,
    /// Seconds until remaining jobs are killed once a blocking process appears.
    pub blocking_grace_period: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        let num_cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self {
            mode: WorkerMode::WhenIdle,
            // half the CPUs by default
            num_cpus_to_use: (num_cpus / 2).max(1),
            start_minimized: false,
            grace_period: 0,
            blocking_process_names: Vec::new(),
            blocking_grace_period: 30,
        }
    }
}

impl WorkerSettings {
    /// Settings path for a given executable.
    pub fn path_for_executable(exe: &Path) -> PathBuf {
        let mut s = exe.as_os_str().to_owned();
        s.push(".settings");
        PathBuf::from(s)
    }

    /// Load settings from `path`. A missing or unreadable file yields the
    /// defaults; so does a version outside the supported range.
    pub fn load(path: &Path) -> Self {
        match fs::read(path) {
            Ok(data) => Self::parse(&data).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    fn parse(data: &[u8]) -> Option<Self> {
        let mut r = Reader::new(data);
        let header = r.get_bytes(4).ok()?;
        if &header[..3] != MAGIC {
            debug!("settings file has unknown magic, ignoring");
            return None;
        }
        let version = header[3];
        if !(SETTINGS_MIN_VERSION..=SETTINGS_CURRENT_VERSION).contains(&version) {
            debug!(version, "settings file version unsupported, ignoring");
            return None;
        }

        let mode = WorkerMode::from_u32(r.get_u32().ok()?).unwrap_or_default();
        let num_cpus_to_use = r.get_u32().ok()?;
        let start_minimized = r.get_bool().ok()?;

        // Fields appended in version 4; older files leave them empty
        let (grace_period, blocking_process_names, blocking_grace_period) = if version >= 4 {
            (
                r.get_u32().ok()?,
                r.get_str_list().ok()?,
                r.get_u32().ok()?,
            )
        } else {
            (0, Vec::new(), 0)
        };

        Some(Self {
            mode,
            num_cpus_to_use,
            start_minimized,
            grace_period,
            blocking_process_names,
            blocking_grace_period,
        })
    }

    /// Save in the current format.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.save_version(path, SETTINGS_CURRENT_VERSION)
    }

    /// Save in a specific format version. Fields a version does not know
    /// are dropped.
    pub fn save_version(&self, path: &Path, version: u8) -> Result<()> {
        let mut w = Writer::new();
        w.put_bytes(MAGIC);
        w.put_u8(version);
        w.put_u32(self.mode as u32);
        w.put_u32(self.num_cpus_to_use);
        w.put_bool(self.start_minimized);
        if version >= 4 {
            w.put_u32(self.grace_period);
            w.put_str_list(&self.blocking_process_names);
            w.put_u32(self.blocking_grace_period);
        }
        fs::write(path, w.into_vec())?;
        Ok(())
    }
}
