//! Tool manifests.
//!
//! A manifest is the set of files a remote worker needs to execute a tool,
//! identified by a stable 64-bit id derived from the tool's contents. The
//! id derivation happens outside this crate; here a manifest is an id plus
//! the file table the worker can sync from.

#![allow(dead_code)] // Registration is driven by the graph layer

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::protocol::wire::{Reader, Writer};
use crate::error::Result;

/// One file of a tool manifest.
#[derive(Debug, Clone)]
pub struct ManifestFile {
    pub id: u32,
    pub name: String,
    pub data: Vec<u8>,
}

/// The file bundle for one tool.
#[derive(Debug)]
pub struct ToolManifest {
    tool_id: u64,
    files: Vec<ManifestFile>,
}

impl ToolManifest {
    pub fn new(tool_id: u64, files: Vec<ManifestFile>) -> Self {
        Self { tool_id, files }
    }

    pub fn tool_id(&self) -> u64 {
        self.tool_id
    }

    pub fn files(&self) -> &[ManifestFile] {
        &self.files
    }

    /// Raw bytes of a file by id, as requested over RequestFile.
    pub fn file_data(&self, file_id: u32) -> Option<&[u8]> {
        self.files
            .iter()
            .find(|f| f.id == file_id)
            .map(|f| f.data.as_slice())
    }

    /// Serialize the metadata (ids, names, sizes) for a Manifest reply.
    /// File contents are fetched separately via RequestFile.
    pub fn serialize_metadata(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u64(self.tool_id);
        w.put_u32(self.files.len() as u32);
        for f in &self.files {
            w.put_u32(f.id);
            w.put_str(&f.name);
            w.put_u64(f.data.len() as u64);
        }
        w.into_vec()
    }

    /// Parse serialized metadata; file data slots come back empty.
    pub fn deserialize_metadata(data: &[u8]) -> Result<(u64, Vec<(u32, String, u64)>)> {
        let mut r = Reader::new(data);
        let tool_id = r.get_u64()?;
        let count = r.get_u32()? as usize;
        let mut files = Vec::with_capacity(count);
        for _ in 0..count {
            let id = r.get_u32()?;
            let name = r.get_str()?;
            let size = r.get_u64()?;
            files.push((id, name, size));
        }
        Ok((tool_id, files))
    }
}

/// Source of manifests, looked up by tool id when a worker asks.
pub trait ManifestStore: Send + Sync {
    fn manifest(&self, tool_id: u64) -> Option<Arc<ToolManifest>>;
}

/// Simple in-process manifest table.
#[derive(Default)]
pub struct ManifestRegistry {
    manifests: RwLock<HashMap<u64, Arc<ToolManifest>>>,
}

impl ManifestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, manifest: ToolManifest) {
        self.manifests
            .write()
            .expect("manifest registry poisoned")
            .insert(manifest.tool_id(), Arc::new(manifest));
    }
}

impl ManifestStore for ManifestRegistry {
    fn manifest(&self, tool_id: u64) -> Option<Arc<ToolManifest>> {
        self.manifests
            .read()
            .expect("manifest registry poisoned")
            .get(&tool_id)
            .cloned()
    }
}
