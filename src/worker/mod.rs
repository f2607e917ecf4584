//! Worker-side collaborator surface.
//!
//! The worker process itself is a separate binary; the client only depends
//! on the mode policy, the resource/idle status snapshot a worker reports
//! over ServerInfo, and the persisted settings file format.

#![allow(dead_code)] // Interface surface shared with the worker binary

pub mod settings;

use crate::protocol::CpuDetail;

/// A worker's policy for accepting jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerMode {
    Disabled = 0,
    #[default]
    WhenIdle = 1,
    Dedicated = 2,
    Proportional = 3,
}

impl WorkerMode {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Disabled),
            1 => Some(Self::WhenIdle),
            2 => Some(Self::Dedicated),
            3 => Some(Self::Proportional),
            _ => None,
        }
    }

    /// Name used by `-workercmd setmode` and the info display.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::WhenIdle => "idle",
            Self::Dedicated => "dedicated",
            Self::Proportional => "proportional",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" => Some(Self::Disabled),
            "idle" => Some(Self::WhenIdle),
            "dedicated" => Some(Self::Dedicated),
            "proportional" => Some(Self::Proportional),
            _ => None,
        }
    }

    /// Display name for an arbitrary mode byte off the wire.
    pub fn name_for_wire(mode: u8) -> &'static str {
        match Self::from_u32(mode as u32) {
            Some(m) => m.as_str(),
            None => "unknown",
        }
    }
}

/// Resource/idle snapshot a worker reports to clients.
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub mode: WorkerMode,
    pub num_clients: u16,
    pub num_cpus_total: u16,
    pub num_cpus_idle: u16,
    pub num_cpus_busy: u16,
    pub num_blocking_processes: u16,
    /// CPU percentage consumed by build jobs on the worker.
    pub cpu_usage_self: f32,
    /// Total CPU percentage on the worker machine.
    pub cpu_usage_total: f32,
    /// Per-CPU details, populated when a client asks for them.
    pub slots: Vec<CpuDetail>,
}

/// Interface the worker's idle/resource detector exposes. The client never
/// calls this directly - it sees the result over the wire - but test stubs
/// and the worker binary share the shape.
pub trait ResourceProbe: Send + Sync {
    /// Current status; `details` asks for the per-CPU breakdown.
    fn status(&self, details: bool) -> WorkerStatus;
}
