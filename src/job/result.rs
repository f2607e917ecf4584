//! Job-result blob carried as the payload of a JobResult message.

#![allow(dead_code)] // The encoding half runs on the worker

use crate::error::Result;
use crate::protocol::wire::{Reader, Writer};

/// Decoded JobResult payload.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResultBlob {
    pub job_id: u32,
    pub node_name: String,
    pub success: bool,
    pub system_error: bool,
    pub messages: Vec<String>,
    pub build_time_ms: u32,
    /// Packed multi-file output buffer (empty on failure).
    pub output: Vec<u8>,
}

impl JobResultBlob {
    /// Serialize (worker side and test stubs).
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u32(self.job_id);
        w.put_str(&self.node_name);
        w.put_bool(self.success);
        w.put_bool(self.system_error);
        w.put_str_list(&self.messages);
        w.put_u32(self.build_time_ms);
        w.put_u32(self.output.len() as u32);
        w.put_bytes(&self.output);
        w.into_vec()
    }

    /// Parse a received payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let job_id = r.get_u32()?;
        let node_name = r.get_str()?;
        let success = r.get_bool()?;
        let system_error = r.get_bool()?;
        let messages = r.get_str_list()?;
        let build_time_ms = r.get_u32()?;
        let output_size = r.get_u32()? as usize;
        let output = r.get_bytes(output_size)?.to_vec();
        Ok(Self {
            job_id,
            node_name,
            success,
            system_error,
            messages,
            build_time_ms,
            output,
        })
    }
}
