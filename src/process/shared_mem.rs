//! Named shared memory between wrapper processes.
//!
//! The main wrapper process creates the segment; the final process opens it
//! and reports its startup and exit status through it. Fields are accessed
//! through atomics since the two processes poll concurrently.

use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

use crate::error::{FbuildError, Result};

/// Size of the wrapper channel: `started` word plus `return_code` word.
const CHANNEL_SIZE: usize = 8;

type CVoid = std::ffi::c_void;

struct SharedMapping {
    ptr: NonNull<CVoid>,
    len: usize,
    shm_name: String,
    owner: bool,
}

// The mapping itself has no thread affinity; all reads/writes go through
// atomics.
unsafe impl Send for SharedMapping {}
unsafe impl Sync for SharedMapping {}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
        if self.owner {
            let _ = shm_unlink(self.shm_name.as_str());
        }
    }
}

fn map_fd(fd: &OwnedFd, len: usize) -> Result<NonNull<CVoid>> {
    let length = NonZeroUsize::new(len)
        .ok_or_else(|| FbuildError::Process("shared memory length must be non-zero".into()))?;
    // SAFETY: mapping a fresh shm fd we own; the mapping outlives all
    // accessors because SharedMapping unmaps it in Drop.
    let ptr = unsafe {
        mmap(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )?
    };
    Ok(ptr)
}

/// The `{ started, return_code }` channel between the wrapper main and
/// final processes.
pub struct BuildResultChannel {
    mapping: SharedMapping,
}

impl BuildResultChannel {
    /// Create the segment (main wrapper process). The return code is
    /// pre-seeded by the caller to the crashed sentinel.
    pub fn create(name: &str) -> Result<Self> {
        let shm_name = format!("/{}", name);
        let fd = shm_open(
            shm_name.as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o600),
        )?;
        ftruncate(&fd, CHANNEL_SIZE as i64)?;
        let ptr = map_fd(&fd, CHANNEL_SIZE)?;
        let channel = Self {
            mapping: SharedMapping {
                ptr,
                len: CHANNEL_SIZE,
                shm_name,
                owner: true,
            },
        };
        // the segment may be left over from a crashed run; start clean
        channel.started_word().store(0, Ordering::SeqCst);
        channel.return_code_word().store(0, Ordering::SeqCst);
        Ok(channel)
    }

    /// Open an existing segment (final wrapper process). Returns `None` when
    /// the main process is gone and the segment no longer exists.
    pub fn open(name: &str) -> Result<Option<Self>> {
        let shm_name = format!("/{}", name);
        let fd = match shm_open(shm_name.as_str(), OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(Errno::ENOENT) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let ptr = map_fd(&fd, CHANNEL_SIZE)?;
        Ok(Some(Self {
            mapping: SharedMapping {
                ptr,
                len: CHANNEL_SIZE,
                shm_name,
                owner: false,
            },
        }))
    }

    fn started_word(&self) -> &AtomicU32 {
        // SAFETY: the mapping is at least CHANNEL_SIZE bytes, page-aligned,
        // and shared read-write by construction.
        unsafe { &*(self.mapping.ptr.as_ptr() as *const AtomicU32) }
    }

    fn return_code_word(&self) -> &AtomicI32 {
        // SAFETY: as above; offset 4 stays within the mapping and is
        // 4-byte aligned.
        unsafe { &*((self.mapping.ptr.as_ptr() as *const u8).add(4) as *const AtomicI32) }
    }

    /// Whether the final process has signalled startup.
    pub fn started(&self) -> bool {
        self.started_word().load(Ordering::SeqCst) != 0
    }

    pub fn set_started(&self) {
        self.started_word().store(1, Ordering::SeqCst);
    }

    pub fn return_code(&self) -> i32 {
        self.return_code_word().load(Ordering::SeqCst)
    }

    pub fn set_return_code(&self, code: i32) {
        self.return_code_word().store(code, Ordering::SeqCst);
    }
}
