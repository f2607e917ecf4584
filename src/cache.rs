//! Compile-output cache interface.
//!
//! Key derivation and storage layout live outside this crate; the
//! distribution core only needs to know whether reads/writes are enabled
//! and how to hand a successfully built object to the cache backend.

#![allow(dead_code)] // Some hooks exist for the cache backend and tests

use std::sync::atomic::{AtomicUsize, Ordering};

/// Cache read/write enablement, from `-cache[read|write]` or the
/// `FASTBUILD_CACHE_MODE` environment variable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMode {
    pub read: bool,
    pub write: bool,
}

impl CacheMode {
    /// Parse the `FASTBUILD_CACHE_MODE` value (`r`, `w` or `rw`).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "r" => Some(Self {
                read: true,
                write: false,
            }),
            "w" => Some(Self {
                read: false,
                write: true,
            }),
            "rw" => Some(Self {
                read: true,
                write: true,
            }),
            _ => None,
        }
    }
}

/// Backend the core commits remote build outputs to.
///
/// Returns false on a failed store; cache failures never fail the build.
pub trait CompileCache: Send + Sync {
    fn store(&self, node_name: &str, object: &[u8]) -> bool;
}

/// Cache backend that drops everything. Used when cache writes are disabled
/// and as a stand-in where no backend is configured.
#[derive(Default)]
pub struct NullCache {
    stores: AtomicUsize,
}

impl NullCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of store attempts observed (test hook).
    pub fn store_count(&self) -> usize {
        self.stores.load(Ordering::Relaxed)
    }
}

impl CompileCache for NullCache {
    fn store(&self, _node_name: &str, _object: &[u8]) -> bool {
        self.stores.fetch_add(1, Ordering::Relaxed);
        true
    }
}
