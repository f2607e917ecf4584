//! Process-group coordination.
//!
//! Single-instance enforcement per working directory, the wrapper process
//! trio that insulates a build from IDE-initiated termination, and the
//! process-wide cancellation flag.

#![allow(dead_code)] // Some codes and hooks belong to the outer build driver

pub mod shared_mem;
pub mod sys_mutex;
pub mod wrapper;

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, SigHandler, Signal};

use crate::error::Result;

/// Process exit codes.
pub mod exit {
    pub const OK: i32 = 0;
    pub const BUILD_FAILED: i32 = -1;
    pub const ERROR_LOADING_GRAPH: i32 = -2;
    pub const BAD_ARGS: i32 = -3;
    pub const ALREADY_RUNNING: i32 = -4;
    pub const FAILED_TO_SPAWN_WRAPPER: i32 = -5;
    pub const FAILED_TO_SPAWN_WRAPPER_FINAL: i32 = -6;
    pub const WRAPPER_CRASHED: i32 = -7;

    /// The 8-bit value a parent observes after a child exits with `code`.
    pub fn observed(code: i32) -> i32 {
        code & 0xFF
    }

    /// Recover the signed code from an observed 8-bit exit status.
    pub fn signed(observed: i32) -> i32 {
        observed as u8 as i8 as i32
    }
}

/// Process-wide cancellation flag, set by the Ctrl-C handler.
static STOP_BUILD: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_interrupt(_signal: i32) {
    STOP_BUILD.store(true, Ordering::Release);
}

/// Install the SIGINT handler backing [`stop_requested`].
pub fn install_interrupt_handler() -> Result<()> {
    // SAFETY: the handler only stores to a static atomic, which is
    // async-signal-safe.
    unsafe {
        signal::signal(Signal::SIGINT, SigHandler::Handler(handle_interrupt))?;
    }
    Ok(())
}

/// Whether a build cancellation was requested.
pub fn stop_requested() -> bool {
    STOP_BUILD.load(Ordering::Acquire)
}

/// Request cancellation (tests and internal error paths).
pub fn request_stop() {
    STOP_BUILD.store(true, Ordering::Release);
}

/// Walk `levels` steps up the parent chain from `pid`. Zero levels returns
/// `pid` itself; a missing ancestor resolves to the last live pid found.
pub fn nth_parent_pid(pid: u32, levels: u32) -> u32 {
    let mut current = pid;
    for _ in 0..levels {
        match parent_of(current) {
            Some(parent) if parent != 0 => current = parent,
            _ => break,
        }
    }
    current
}

/// Parent pid via /proc. The comm field may contain spaces or parentheses,
/// so fields are taken from after the last ')'.
fn parent_of(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit::observed(exit::OK), 0);
        assert_eq!(exit::observed(exit::BAD_ARGS), 253);
        assert_eq!(exit::observed(exit::FAILED_TO_SPAWN_WRAPPER_FINAL), 250);
        for code in [
            exit::OK,
            exit::BUILD_FAILED,
            exit::ERROR_LOADING_GRAPH,
            exit::BAD_ARGS,
            exit::ALREADY_RUNNING,
            exit::FAILED_TO_SPAWN_WRAPPER,
            exit::FAILED_TO_SPAWN_WRAPPER_FINAL,
            exit::WRAPPER_CRASHED,
        ] {
            assert_eq!(exit::signed(exit::observed(code)), code);
        }
    }

    #[test]
    fn test_nth_parent_zero_is_self() {
        let me = std::process::id();
        assert_eq!(nth_parent_pid(me, 0), me);
    }

    #[test]
    fn test_first_parent_differs() {
        let me = std::process::id();
        let parent = nth_parent_pid(me, 1);
        assert_ne!(parent, me);
        assert!(parent > 0);
    }

    #[test]
    fn test_deep_parent_walk_terminates() {
        let me = std::process::id();
        // More levels than the real process tree is deep; must stop at init
        let ancestor = nth_parent_pid(me, 1000);
        assert!(ancestor >= 1);
    }

    #[test]
    fn test_stop_flag() {
        assert!(!stop_requested() || STOP_BUILD.load(Ordering::Acquire));
        request_stop();
        assert!(stop_requested());
        STOP_BUILD.store(false, Ordering::Release);
    }
}
