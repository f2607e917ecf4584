//! Multi-file output buffer.
//!
//! A successful remote build returns every output file of the node in one
//! blob, in a fixed order: the object file, then (when the node's flags ask
//! for them) the PDB and the static-analysis XML. The layout is a u32 file
//! count followed by each file as a u64 length plus bytes.

#![allow(dead_code)] // The packing half runs on the worker

use std::fs;
use std::path::Path;

use crate::error::{FbuildError, Result};
use crate::protocol::wire::{Reader, Writer};

/// Parsed multi-file buffer; file slices borrow from the result blob.
pub struct MultiBuffer<'a> {
    files: Vec<&'a [u8]>,
}

impl<'a> MultiBuffer<'a> {
    /// Pack files into one blob (worker side and tests).
    pub fn pack(files: &[&[u8]]) -> Vec<u8> {
        let mut w = Writer::with_capacity(4 + files.iter().map(|f| 8 + f.len()).sum::<usize>());
        w.put_u32(files.len() as u32);
        for f in files {
            w.put_u64(f.len() as u64);
            w.put_bytes(f);
        }
        w.into_vec()
    }

    /// Parse a blob received from a worker.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let count = r.get_u32()? as usize;
        let mut files = Vec::with_capacity(count);
        for i in 0..count {
            let len = r.get_u64()? as usize;
            if len > r.remaining() {
                return Err(FbuildError::Decode(format!(
                    "file {} claims {} bytes but only {} remain",
                    i,
                    len,
                    r.remaining()
                )));
            }
            files.push(r.get_bytes(len)?);
        }
        if r.remaining() != 0 {
            return Err(FbuildError::Decode(format!(
                "{} trailing bytes after {} files",
                r.remaining(),
                count
            )));
        }
        Ok(Self { files })
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn file(&self, index: usize) -> Option<&'a [u8]> {
        self.files.get(index).copied()
    }

    /// Write file `index` to disk, creating parent directories.
    pub fn extract_file(&self, index: usize, path: &Path) -> Result<()> {
        let data = self.files.get(index).ok_or_else(|| {
            FbuildError::Decode(format!(
                "result buffer has {} files, index {} requested",
                self.files.len(),
                index
            ))
        })?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, data)?;
        Ok(())
    }
}
