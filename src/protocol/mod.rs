//! Network protocol between client and workers.
//!
//! Every message is a fixed-layout record: a 4-byte type tag, a 4-byte
//! total-size field, a 1-byte payload flag, three bytes of padding, then
//! message-specific fields. When the payload flag is set, a variable-length
//! blob follows as a separate frame on the same connection.
//!
//! Tags are stable across protocol versions; a version bump changes only the
//! handshake gate. Integer fields travel in host byte order - distribution
//! between machines of different endianness is unsupported.

pub mod wire;

use crate::error::{FbuildError, Result};
use wire::{Reader, Writer};

/// TCP port workers listen on.
pub const PROTOCOL_PORT: u16 = 31264;

/// Current protocol version. A worker receiving a mismatched handshake
/// closes the connection; this is the only version gate.
pub const PROTOCOL_VERSION: u32 = 21;

/// Bytes in the common message header (tag, size, payload flag, padding).
pub const HEADER_SIZE: usize = 12;

/// Platform tag carried in the handshake.
pub const PLATFORM_WINDOWS: u8 = 0;
pub const PLATFORM_LINUX: u8 = 1;
pub const PLATFORM_MACOS: u8 = 2;

/// Platform tag for this build.
pub const CURRENT_PLATFORM: u8 = if cfg!(target_os = "windows") {
    PLATFORM_WINDOWS
} else if cfg!(target_os = "macos") {
    PLATFORM_MACOS
} else {
    PLATFORM_LINUX
};

/// Fixed size of the handshake host-name field.
const HOST_NAME_FIELD: usize = 64;

/// The complete message taxonomy.
///
/// Direction notes: the client sends Connection, Status, NoJobAvailable,
/// Job, Manifest, File and the control messages; workers send RequestJob,
/// JobResult, RequestManifest, RequestFile and ServerInfo.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Initial handshake after TCP connect.
    Connection {
        protocol_version: u32,
        num_jobs_available: u32,
        platform: u8,
        host_name: String,
    },
    /// Advertised job count changed.
    Status { num_jobs_available: u32 },
    /// Worker asks for a job.
    RequestJob,
    /// Negative reply to RequestJob.
    NoJobAvailable,
    /// Positive reply to RequestJob; the serialized job follows as payload.
    Job { tool_id: u64 },
    /// Completed job; the result blob follows as payload.
    JobResult,
    /// Worker asks for the tool manifest; reply is Manifest.
    RequestManifest { tool_id: u64 },
    /// Manifest metadata follows as payload.
    Manifest { tool_id: u64 },
    /// Worker asks for one file of a manifest; reply is File.
    RequestFile { tool_id: u64, file_id: u32 },
    /// File bytes follow as payload.
    File { tool_id: u64, file_id: u32 },
    /// Ask a worker for its status.
    RequestServerInfo { details_level: u8 },
    /// Worker status; per-CPU details follow as payload when requested.
    ServerInfo {
        mode: u8,
        num_clients: u16,
        num_cpus_total: u16,
        num_cpus_idle: u16,
        num_cpus_busy: u16,
        num_blocking_processes: u16,
        cpu_usage_self: f32,
        cpu_usage_total: f32,
    },
    /// Switch worker mode, with a grace period in seconds.
    SetMode { mode: u8, grace_period: u16 },
    /// Pause job acceptance until the given PID terminates.
    AddBlockingProcess { pid: u32, grace_period: u16 },
    /// Undo AddBlockingProcess.
    RemoveBlockingProcess { pid: u32 },
}

impl Message {
    /// Stable wire tag.
    pub fn tag(&self) -> u32 {
        match self {
            Self::Connection { .. } => 1,
            Self::Status { .. } => 2,
            Self::RequestJob => 3,
            Self::NoJobAvailable => 4,
            Self::Job { .. } => 5,
            Self::JobResult => 6,
            Self::RequestManifest { .. } => 7,
            Self::Manifest { .. } => 8,
            Self::RequestFile { .. } => 9,
            Self::File { .. } => 10,
            Self::RequestServerInfo { .. } => 11,
            Self::ServerInfo { .. } => 12,
            Self::SetMode { .. } => 13,
            Self::AddBlockingProcess { .. } => 14,
            Self::RemoveBlockingProcess { .. } => 15,
        }
    }

    /// Debug name for protocol tracing.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "Connection",
            Self::Status { .. } => "Status",
            Self::RequestJob => "RequestJob",
            Self::NoJobAvailable => "NoJobAvailable",
            Self::Job { .. } => "Job",
            Self::JobResult => "JobResult",
            Self::RequestManifest { .. } => "RequestManifest",
            Self::Manifest { .. } => "Manifest",
            Self::RequestFile { .. } => "RequestFile",
            Self::File { .. } => "File",
            Self::RequestServerInfo { .. } => "RequestServerInfo",
            Self::ServerInfo { .. } => "ServerInfo",
            Self::SetMode { .. } => "SetMode",
            Self::AddBlockingProcess { .. } => "AddBlockingProcess",
            Self::RemoveBlockingProcess { .. } => "RemoveBlockingProcess",
        }
    }

    /// Whether this variant always travels with a payload frame.
    ///
    /// ServerInfo is the one dynamic case: its per-CPU details are only
    /// attached when the request asked for them, so the header flag is
    /// decided at send time.
    pub fn always_has_payload(&self) -> bool {
        matches!(
            self,
            Self::Job { .. } | Self::JobResult | Self::Manifest { .. } | Self::File { .. }
        )
    }

    /// Serialize into a single frame, marking whether a payload frame follows.
    pub fn encode(&self, has_payload: bool) -> Vec<u8> {
        let mut w = Writer::with_capacity(HEADER_SIZE + 16);
        w.put_u32(self.tag());
        w.put_u32(0); // total size, patched below
        w.put_bool(has_payload);
        w.put_bytes(&[0u8; 3]);

        match self {
            Self::Connection {
                protocol_version,
                num_jobs_available,
                platform,
                host_name,
            } => {
                w.put_u32(*protocol_version);
                w.put_u32(*num_jobs_available);
                w.put_u8(*platform);
                let mut name = [0u8; HOST_NAME_FIELD];
                let bytes = host_name.as_bytes();
                let n = bytes.len().min(HOST_NAME_FIELD - 1);
                name[..n].copy_from_slice(&bytes[..n]);
                w.put_bytes(&name);
            }
            Self::Status { num_jobs_available } => {
                w.put_u32(*num_jobs_available);
            }
            Self::RequestJob | Self::NoJobAvailable | Self::JobResult => {}
            Self::Job { tool_id }
            | Self::RequestManifest { tool_id }
            | Self::Manifest { tool_id } => {
                w.put_u64(*tool_id);
            }
            Self::RequestFile { tool_id, file_id } | Self::File { tool_id, file_id } => {
                w.put_u64(*tool_id);
                w.put_u32(*file_id);
            }
            Self::RequestServerInfo { details_level } => {
                w.put_u8(*details_level);
            }
            Self::ServerInfo {
                mode,
                num_clients,
                num_cpus_total,
                num_cpus_idle,
                num_cpus_busy,
                num_blocking_processes,
                cpu_usage_self,
                cpu_usage_total,
            } => {
                w.put_u8(*mode);
                w.put_u16(*num_clients);
                w.put_u16(*num_cpus_total);
                w.put_u16(*num_cpus_idle);
                w.put_u16(*num_cpus_busy);
                w.put_u16(*num_blocking_processes);
                w.put_f32(*cpu_usage_self);
                w.put_f32(*cpu_usage_total);
            }
            Self::SetMode { mode, grace_period } => {
                w.put_u8(*mode);
                w.put_u16(*grace_period);
            }
            Self::AddBlockingProcess { pid, grace_period } => {
                w.put_u32(*pid);
                w.put_u16(*grace_period);
            }
            Self::RemoveBlockingProcess { pid } => {
                w.put_u32(*pid);
            }
        }

        let total = w.len() as u32;
        w.patch_u32(4, total);
        w.into_vec()
    }

    /// Parse a received frame. Returns the message and its payload flag.
    pub fn decode(frame: &[u8]) -> Result<(Message, bool)> {
        let mut r = Reader::new(frame);
        if frame.len() < HEADER_SIZE {
            return Err(FbuildError::Decode(format!(
                "frame of {} bytes is smaller than the message header",
                frame.len()
            )));
        }
        let tag = r.get_u32()?;
        let size = r.get_u32()? as usize;
        let has_payload = r.get_bool()?;
        r.get_bytes(3)?; // padding

        if size != frame.len() {
            return Err(FbuildError::Decode(format!(
                "message size field {} does not match frame length {}",
                size,
                frame.len()
            )));
        }

        let msg = match tag {
            1 => {
                let protocol_version = r.get_u32()?;
                let num_jobs_available = r.get_u32()?;
                let platform = r.get_u8()?;
                let raw = r.get_bytes(HOST_NAME_FIELD)?;
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                let host_name = String::from_utf8_lossy(&raw[..end]).into_owned();
                Message::Connection {
                    protocol_version,
                    num_jobs_available,
                    platform,
                    host_name,
                }
            }
            2 => Message::Status {
                num_jobs_available: r.get_u32()?,
            },
            3 => Message::RequestJob,
            4 => Message::NoJobAvailable,
            5 => Message::Job {
                tool_id: r.get_u64()?,
            },
            6 => Message::JobResult,
            7 => Message::RequestManifest {
                tool_id: r.get_u64()?,
            },
            8 => Message::Manifest {
                tool_id: r.get_u64()?,
            },
            9 => Message::RequestFile {
                tool_id: r.get_u64()?,
                file_id: r.get_u32()?,
            },
            10 => Message::File {
                tool_id: r.get_u64()?,
                file_id: r.get_u32()?,
            },
            11 => Message::RequestServerInfo {
                details_level: r.get_u8()?,
            },
            12 => Message::ServerInfo {
                mode: r.get_u8()?,
                num_clients: r.get_u16()?,
                num_cpus_total: r.get_u16()?,
                num_cpus_idle: r.get_u16()?,
                num_cpus_busy: r.get_u16()?,
                num_blocking_processes: r.get_u16()?,
                cpu_usage_self: r.get_f32()?,
                cpu_usage_total: r.get_f32()?,
            },
            13 => Message::SetMode {
                mode: r.get_u8()?,
                grace_period: r.get_u16()?,
            },
            14 => Message::AddBlockingProcess {
                pid: r.get_u32()?,
                grace_period: r.get_u16()?,
            },
            15 => Message::RemoveBlockingProcess {
                pid: r.get_u32()?,
            },
            other => {
                return Err(FbuildError::Protocol(format!(
                    "unknown message tag {}",
                    other
                )))
            }
        };

        if r.remaining() != 0 {
            return Err(FbuildError::Decode(format!(
                "{} bytes of trailing data after {} message",
                r.remaining(),
                msg.name()
            )));
        }

        Ok((msg, has_payload))
    }
}

/// Build the handshake message sent after a successful connect.
pub fn connection_message(num_jobs_available: u32) -> Message {
    let host_name = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    Message::Connection {
        protocol_version: PROTOCOL_VERSION,
        num_jobs_available,
        platform: CURRENT_PLATFORM,
        host_name,
    }
}

/// Per-CPU detail attached to a ServerInfo payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuDetail {
    pub idle: bool,
    pub busy: bool,
    pub host_name: String,
    pub job_status: String,
}

/// Serialize the ServerInfo per-CPU payload (the worker side of the
/// exchange; clients only decode).
#[allow(dead_code)]
pub fn encode_server_info_details(details: &[CpuDetail]) -> Vec<u8> {
    let mut w = Writer::new();
    for d in details {
        w.put_bool(d.idle);
        w.put_bool(d.busy);
        w.put_str(&d.host_name);
        w.put_str(&d.job_status);
    }
    w.into_vec()
}

/// Parse the ServerInfo per-CPU payload; `num_cpus` comes from the header
/// message.
pub fn decode_server_info_details(payload: &[u8], num_cpus: usize) -> Result<Vec<CpuDetail>> {
    let mut r = Reader::new(payload);
    let mut details = Vec::with_capacity(num_cpus);
    for _ in 0..num_cpus {
        details.push(CpuDetail {
            idle: r.get_bool()?,
            busy: r.get_bool()?,
            host_name: r.get_str()?,
            job_status: r.get_str()?,
        });
    }
    Ok(details)
}
