//! fbuild - distributed build coordination client.

mod cache;
mod distrib;
mod error;
mod job;
mod logging;
mod monitor;
mod net;
mod options;
mod process;
mod protocol;
mod worker;

use std::sync::Arc;
use std::time::{Duration, Instant};

use owo_colors::{OwoColorize, Stream::Stderr};
use tracing::{info, warn, Level};

use distrib::{DistribConfig, DistribContext, Distributor};
use job::manifest::ManifestRegistry;
use job::InMemoryJobQueue;
use monitor::Monitor;
use options::{BuildOptions, ParseOutcome, WorkerCommand, WrapperMode};
use process::exit;
use process::sys_mutex::SystemMutex;
use process::wrapper;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let start = Instant::now();

    if let Err(e) = process::install_interrupt_handler() {
        eprintln!("fbuild: Warning: failed to install Ctrl-C handler: {}", e);
    }

    let argv: Vec<String> = std::env::args().collect();
    let options = match BuildOptions::process_command_line(&argv) {
        Ok(ParseOutcome::Run(options)) => options,
        Ok(ParseOutcome::Quit) => return exit::OK,
        Err(e) => {
            print_error(&e);
            return exit::BAD_ARGS;
        }
    };

    init_logging(&options);

    if options.wrapper_mode == WrapperMode::IntermediateProcess {
        return wrapper::run_intermediate_process(&options);
    }

    // ensure only one instance runs at a time per working directory
    let mut main_mutex = SystemMutex::new(&options.main_mutex_name());

    // in wrapper mode the main process monitors the final process' life
    // through this (when acquirable, the final process has terminated)
    let mut final_mutex = SystemMutex::new(&options.final_mutex_name());

    let needs_instance_lock = options.wrapper_mode == WrapperMode::MainProcess
        || (options.wrapper_mode == WrapperMode::None && options.perform_build);
    if needs_instance_lock {
        match main_mutex.try_lock() {
            Ok(true) => {}
            Ok(false) => {
                if !options.wait_mode {
                    eprintln!(
                        "fbuild: Error: Another instance of fbuild is already running in '{}'.",
                        options.working_dir.display()
                    );
                    return exit::ALREADY_RUNNING;
                }
                println!("fbuild: Waiting for another fbuild to terminate due to -wait option.");
                loop {
                    match main_mutex.try_lock() {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(e) => {
                            print_error(&e);
                            return exit::BUILD_FAILED;
                        }
                    }
                    std::thread::sleep(Duration::from_secs(1));
                    if process::stop_requested() {
                        return exit::BUILD_FAILED;
                    }
                }
            }
            Err(e) => {
                print_error(&e);
                return exit::BUILD_FAILED;
            }
        }
    }

    if options.wrapper_mode == WrapperMode::MainProcess {
        return wrapper::run_main_process(&options, &mut final_mutex);
    }

    debug_assert!(
        options.wrapper_mode == WrapperMode::None
            || options.wrapper_mode == WrapperMode::FinalProcess
    );

    let shared = if options.wrapper_mode == WrapperMode::FinalProcess {
        match wrapper::acquire_final_process(&options, &mut main_mutex, &mut final_mutex) {
            Ok(Some(channel)) => Some(channel),
            Ok(None) => return exit::FAILED_TO_SPAWN_WRAPPER_FINAL,
            Err(e) => {
                print_error(&e);
                return exit::FAILED_TO_SPAWN_WRAPPER_FINAL;
            }
        }
    } else {
        None
    };

    let code = run_build(&options, start);

    if let Some(channel) = &shared {
        channel.set_return_code(code);
    }
    code
}

fn init_logging(options: &BuildOptions) {
    let mut config = logging::LogConfig::new();
    if options.quiet {
        config = config.with_level(Level::WARN);
    } else if options.verbose {
        config = config.with_level(Level::DEBUG);
    }
    if options.dist_verbose {
        // raise only the distribution target, keep the rest at its level
        config.filter = Some(format!(
            "{},dist=debug",
            format!("{}", config.level).to_lowercase()
        ));
    }
    logging::init(config.with_env_overrides());
}

fn run_build(options: &BuildOptions, start: Instant) -> i32 {
    // External collaborators: the dependency graph and its node build logic
    // live outside this core, so the queue and manifest table start empty
    // and are filled by whatever drives the build.
    let queue = Arc::new(InMemoryJobQueue::new());
    let manifests = Arc::new(ManifestRegistry::new());

    tracing::debug!(
        targets = ?options.targets,
        local_threads = options.num_worker_threads,
        force_remote = options.force_remote,
        local_race = options.allow_local_race,
        cache_read = options.cache.read,
        cache_write = options.cache.write,
        "build configuration"
    );

    let monitor = if options.monitor {
        match Monitor::create() {
            Ok(monitor) => Some(Arc::new(monitor)),
            Err(e) => {
                warn!(error = %e, "monitor output unavailable");
                None
            }
        }
    } else {
        None
    };

    // worker lists: build workers from -worker(s); control workers from the
    // command targets, with '*' standing for every configured worker
    let mut build_workers: Vec<String> = Vec::new();
    let mut control_workers: Vec<String> = Vec::new();
    if options.perform_build && options.allow_distributed {
        build_workers = options.workers.clone();
    }
    for cmd in &options.worker_commands {
        if cmd.worker == "*" {
            for worker in &options.workers {
                if !control_workers.contains(worker) {
                    control_workers.push(worker.clone());
                }
            }
        } else if !control_workers.contains(&cmd.worker) {
            control_workers.push(cmd.worker.clone());
        }
    }

    // commands with no resolvable worker still need the distributor (they
    // report trivially rather than panic)
    let want_distributor = !build_workers.is_empty()
        || !control_workers.is_empty()
        || !options.worker_commands.is_empty();
    let distributor = if want_distributor {
        let ctx = DistribContext {
            queue: Arc::clone(&queue) as Arc<dyn job::JobQueue>,
            manifests: Arc::clone(&manifests) as Arc<dyn job::manifest::ManifestStore>,
            cache: Arc::new(cache::NullCache::new()),
            cache_write: options.cache.write,
            monitor: monitor.clone(),
        };
        match Distributor::start(&build_workers, &control_workers, DistribConfig::default(), ctx)
        {
            Ok(distributor) => Some(distributor),
            Err(e) => {
                print_error(&e);
                return exit::BUILD_FAILED;
            }
        }
    } else {
        None
    };

    // worker commands run before the build proper
    if !options.worker_commands.is_empty() {
        let distributor = distributor
            .as_ref()
            .expect("worker commands require the distributor");
        let code = run_worker_commands(options, distributor, &control_workers);
        if code != exit::OK {
            return code;
        }
    }

    let result = if options.perform_build {
        drain_build_queue(&queue, distributor.as_ref())
    } else {
        true
    };

    // final line of output - status of the build
    let total = start.elapsed().as_secs_f64();
    let minutes = (total / 60.0) as u64;
    if minutes > 0 {
        info!("Time: {}m {:.3}s", minutes, total - (minutes as f64) * 60.0);
    } else {
        info!("Time: {:.3}s", total);
    }

    if result {
        exit::OK
    } else {
        exit::BUILD_FAILED
    }
}

fn run_worker_commands(
    options: &BuildOptions,
    distributor: &Distributor,
    control_workers: &[String],
) -> i32 {
    // last requested info level, reused to refresh status while waiting
    let mut info_level = 0;
    for cmd in &options.worker_commands {
        let targets: Vec<String> = if cmd.worker == "*" {
            control_workers.to_vec()
        } else {
            vec![cmd.worker.clone()]
        };

        let mut wait_timeout = 0u32;
        let mut ok = match cmd.command {
            WorkerCommand::Info { level } => {
                info_level = level;
                distributor.workers_display_info(&targets, level)
            }
            WorkerCommand::SetMode { mode } => {
                // non-blocking
                distributor.workers_set_mode(&targets, mode, options.worker_command_grace);
                wait_timeout = options.worker_command_wait;
                true
            }
            WorkerCommand::AddBlocking { pid } => {
                distributor.workers_add_blocking(&targets, pid, options.worker_command_grace);
                wait_timeout = options.worker_command_wait;
                true
            }
            WorkerCommand::RemoveBlocking { pid } => {
                distributor.workers_remove_blocking(&targets, pid);
                true
            }
        };

        if wait_timeout != 0 && ok {
            ok = distributor.workers_wait_idle(&targets, wait_timeout, info_level);
        }
        if ok && !options.worker_command_ignore_failures {
            // check success of the non-blocking commands
            ok = distributor.wait_last_command_result();
        }
        if !ok && !options.worker_command_ignore_failures {
            return exit::BUILD_FAILED;
        }
    }
    exit::OK
}

/// Wait for every queued distributable job to finish. Local execution is
/// owned by the external graph driver; with nothing queued this returns
/// immediately.
fn drain_build_queue(queue: &Arc<InMemoryJobQueue>, distributor: Option<&Distributor>) -> bool {
    loop {
        if process::stop_requested() {
            return false;
        }
        let pending = queue.pending_count();
        let in_flight = distributor
            .map(|d| {
                d.core()
                    .server_states()
                    .iter()
                    .map(|s| s.lock().jobs.len())
                    .sum::<usize>()
            })
            .unwrap_or(0);
        if pending == 0 && in_flight == 0 {
            break;
        }
        if distributor.is_none() {
            // queued distributable work with no workers configured cannot
            // make progress here
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    queue.failed_count() == 0
}

fn print_error(e: &error::FbuildError) {
    eprintln!(
        "{}: {}",
        "error"
            .if_supports_color(Stderr, |text| text.red())
            .if_supports_color(Stderr, |text| text.bold()),
        e
    );
}
