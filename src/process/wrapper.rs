//! Wrapper process lifecycle.
//!
//! Three roles let an IDE kill the launcher without killing the build:
//!
//! - the *main* process creates the shared return-code channel, spawns the
//!   intermediate and then watches the final process via the final mutex;
//! - the *intermediate* process spawns the final and exits immediately, so
//!   job-control signals from the IDE cannot propagate to the build;
//! - the *final* process takes the final mutex for the whole build and
//!   reports its exit status through shared memory.

use std::process::Command;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::options::BuildOptions;
use crate::process::exit;
use crate::process::shared_mem::BuildResultChannel;
use crate::process::sys_mutex::SystemMutex;

/// Re-invoke this executable with the original arguments plus `flag`.
fn spawn_self(options: &BuildOptions, flag: &str) -> std::io::Result<std::process::Child> {
    let exe = std::env::current_exe()?;
    Command::new(exe)
        .args(&options.args)
        .arg(flag)
        .current_dir(&options.working_dir)
        .spawn()
}

/// Main wrapper process: create the channel, run the chain, wait for the
/// final process to finish and relay its exit status.
pub fn run_main_process(options: &BuildOptions, final_mutex: &mut SystemMutex) -> i32 {
    let channel = match BuildResultChannel::create(&options.shared_memory_name()) {
        Ok(channel) => channel,
        Err(e) => {
            eprintln!("fbuild: Error: Failed to create shared memory: {}", e);
            return exit::FAILED_TO_SPAWN_WRAPPER;
        }
    };
    // if the final process dies without reporting, this is what we observe
    channel.set_return_code(exit::WRAPPER_CRASHED);

    let mut child = match spawn_self(options, "-wrapperintermediate") {
        Ok(child) => child,
        Err(e) => {
            eprintln!("fbuild: Error: Failed to spawn wrapper process: {}", e);
            return exit::FAILED_TO_SPAWN_WRAPPER;
        }
    };

    // the intermediate exits as soon as it has launched the final process
    let status = match child.wait() {
        Ok(status) => status,
        Err(e) => {
            eprintln!("fbuild: Error: Intermediate process failed: {}", e);
            return exit::FAILED_TO_SPAWN_WRAPPER;
        }
    };
    let observed = status.code().unwrap_or(exit::observed(exit::WRAPPER_CRASHED));
    if observed == exit::observed(exit::FAILED_TO_SPAWN_WRAPPER_FINAL) {
        eprintln!("fbuild: Error: Intermediate process failed to spawn the final process.");
        return exit::FAILED_TO_SPAWN_WRAPPER_FINAL;
    } else if observed != exit::OK {
        let code = exit::signed(observed);
        eprintln!("fbuild: Error: Intermediate process failed ({}).", code);
        return code;
    }

    // wait for the final process to signal startup
    while !channel.started() {
        std::thread::sleep(Duration::from_millis(1));
    }
    debug!("final process started");

    // when the final mutex can be acquired, the final process has exited
    loop {
        match final_mutex.try_lock() {
            Ok(true) => break,
            Ok(false) => std::thread::sleep(Duration::from_millis(1)),
            Err(_) => return exit::WRAPPER_CRASHED,
        }
    }

    channel.return_code()
}

/// Intermediate wrapper process: launch the final process detached and exit.
pub fn run_intermediate_process(options: &BuildOptions) -> i32 {
    match spawn_self(options, "-wrapperfinal") {
        // Deliberately not waited on: exiting reparents the final process,
        // severing it from the IDE's job control.
        Ok(_child) => exit::OK,
        Err(e) => {
            eprintln!("fbuild: Error: Failed to spawn final process: {}", e);
            exit::FAILED_TO_SPAWN_WRAPPER_FINAL
        }
    }
}

/// Final wrapper process startup: take the final mutex (checking the main
/// process is still alive) and open the shared channel.
///
/// Returns `None` when the main process died in the interim; the caller
/// exits with [`exit::FAILED_TO_SPAWN_WRAPPER_FINAL`].
pub fn acquire_final_process(
    options: &BuildOptions,
    main_mutex: &mut SystemMutex,
    final_mutex: &mut SystemMutex,
) -> Result<Option<BuildResultChannel>> {
    loop {
        if final_mutex.try_lock()? {
            break;
        }
        println!("fbuild: Waiting for another build to terminate...");
        if main_mutex.try_lock()? {
            // main process has aborted, terminate
            return Ok(None);
        }
        std::thread::sleep(Duration::from_secs(1));
    }

    let channel = match BuildResultChannel::open(&options.shared_memory_name())? {
        Some(channel) => channel,
        // main process was killed while we were waiting
        None => return Ok(None),
    };

    // signal to the main process that we have started
    channel.set_started();
    Ok(Some(channel))
}
