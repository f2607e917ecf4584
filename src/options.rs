//! Command-line options and per-invocation identity.
//!
//! The grammar keeps the single-dash flag spelling the wrapper re-spawn
//! relies on (`fbuild -wrapper` re-invokes itself with the original
//! arguments plus `-wrapperintermediate`), so parsing is hand-rolled rather
//! than delegated to a derive-style parser.
//!
//! The canonical working directory also lives here: its 32-bit hash names
//! the process-group mutexes and the wrapper shared-memory segment.

use std::hash::Hasher;
use std::path::{Path, PathBuf};

use twox_hash::XxHash32;

use crate::cache::CacheMode;
use crate::error::{FbuildError, Result};
use crate::process;
use crate::worker::WorkerMode;

/// Command sent to workers via `-workercmd`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WorkerCommand {
    /// Request and display status; negative levels select JSON output.
    Info { level: i32 },
    SetMode { mode: WorkerMode },
    AddBlocking { pid: u32 },
    RemoveBlocking { pid: u32 },
}

/// One `-workercmd` occurrence: the target worker (`*` = all) plus command.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommandEntry {
    pub worker: String,
    pub command: WorkerCommand,
}

/// Role of this process in the wrapper trio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WrapperMode {
    #[default]
    None,
    MainProcess,
    IntermediateProcess,
    FinalProcess,
}

/// Outcome of command-line processing.
pub enum ParseOutcome {
    /// Proceed with these options.
    Run(Box<BuildOptions>),
    /// `-help` / `-version`: nothing further to do.
    Quit,
}

/// Everything the rest of the program needs to know about this invocation.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub program_name: String,
    /// Raw arguments (without argv[0]), replayed by the wrapper processes.
    pub args: Vec<String>,
    pub targets: Vec<String>,

    pub allow_distributed: bool,
    pub dist_verbose: bool,
    pub workers: Vec<String>,

    pub worker_commands: Vec<WorkerCommandEntry>,
    pub worker_command_grace: i32,
    pub worker_command_wait: u32,
    pub worker_command_ignore_failures: bool,

    pub force_remote: bool,
    pub allow_local_race: bool,

    pub wait_mode: bool,
    pub wrapper_mode: WrapperMode,

    pub num_worker_threads: u32,
    pub cache: CacheMode,
    pub monitor: bool,
    pub quiet: bool,
    pub verbose: bool,

    pub perform_build: bool,

    pub working_dir: PathBuf,
    pub working_dir_hash: u32,
}

impl BuildOptions {
    fn new() -> Result<Self> {
        let working_dir = std::env::current_dir()?;
        let hash = working_dir_hash(&canonical_working_dir(&working_dir));
        Ok(Self {
            program_name: "fbuild".to_string(),
            args: Vec::new(),
            targets: Vec::new(),
            allow_distributed: false,
            dist_verbose: false,
            workers: Vec::new(),
            worker_commands: Vec::new(),
            worker_command_grace: 0,
            worker_command_wait: 0,
            worker_command_ignore_failures: false,
            force_remote: false,
            allow_local_race: true,
            wait_mode: false,
            wrapper_mode: WrapperMode::None,
            num_worker_threads: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            cache: CacheMode::default(),
            monitor: false,
            quiet: false,
            verbose: false,
            perform_build: true,
            working_dir,
            working_dir_hash: hash,
        })
    }

    /// Parse `args` (including argv[0]).
    pub fn process_command_line(argv: &[String]) -> Result<ParseOutcome> {
        let mut options = Self::new()?;

        if let Some(program) = argv.first() {
            if let Some(name) = Path::new(program).file_name() {
                options.program_name = name.to_string_lossy().into_owned();
            }
        }

        let mut build_needed = false;
        let mut build_not_needed = false;

        let args = &argv[1..];
        options.args = args.to_vec();

        let mut i = 0;
        while i < args.len() {
            let arg = args[i].as_str();

            if !arg.starts_with('-') {
                // assume target
                options.targets.push(arg.to_string());
                build_needed = true;
                i += 1;
                continue;
            }

            match arg {
                "-cache" => {
                    options.cache.read = true;
                    options.cache.write = true;
                    build_needed = true;
                }
                "-cacheread" => {
                    options.cache.read = true;
                    build_needed = true;
                }
                "-cachewrite" => {
                    options.cache.write = true;
                }
                "-dist" => {
                    options.allow_distributed = true;
                }
                "-distverbose" => {
                    options.allow_distributed = true;
                    options.dist_verbose = true;
                }
                "-worker" => {
                    let value = take_value(args, &mut i, arg, &options.program_name)?;
                    options.workers.push(value.to_string());
                    options.allow_distributed = true;
                }
                "-workers" => {
                    let value = take_value(args, &mut i, arg, &options.program_name)?;
                    options
                        .workers
                        .extend(value.split(',').map(|s| s.to_string()));
                    options.allow_distributed = true;
                }
                "-workercmd" | "-myworkercmd" | "-allworkerscmd" => {
                    build_not_needed = true;
                    let worker = match arg {
                        "-myworkercmd" => "127.0.0.1".to_string(),
                        "-allworkerscmd" => "*".to_string(),
                        _ => take_value(args, &mut i, arg, &options.program_name)?.to_string(),
                    };
                    let cmd_str = take_value(args, &mut i, arg, &options.program_name)?.to_string();
                    let val_str = take_value(args, &mut i, arg, &options.program_name)?;
                    let command = parse_worker_command(&cmd_str, val_str, arg, &options.program_name)?;
                    options.worker_commands.push(WorkerCommandEntry { worker, command });
                }
                "-workercmdflag" => {
                    let flag = take_value(args, &mut i, arg, &options.program_name)?.to_string();
                    match flag.as_str() {
                        "nofailure" => {
                            options.worker_command_ignore_failures = true;
                        }
                        "grace" => {
                            let value = take_value(args, &mut i, arg, &options.program_name)?;
                            options.worker_command_grace = value.parse().unwrap_or(0);
                        }
                        "wait" => {
                            let value = take_value(args, &mut i, arg, &options.program_name)?;
                            options.worker_command_wait = value.parse().unwrap_or(0);
                        }
                        _ => {
                            return Err(bad_args(
                                format!("Unrecognized <flag> for '{}' argument", arg),
                                &options.program_name,
                            ));
                        }
                    }
                }
                "-forceremote" => {
                    options.allow_distributed = true;
                    options.force_remote = true;
                    options.allow_local_race = false;
                    build_needed = true;
                }
                "-help" => {
                    display_help(&options.program_name);
                    return Ok(ParseOutcome::Quit);
                }
                "-monitor" => {
                    options.monitor = true;
                    build_needed = true;
                }
                "-quiet" => {
                    options.quiet = true;
                }
                "-verbose" => {
                    options.verbose = true;
                }
                "-version" => {
                    display_version();
                    return Ok(ParseOutcome::Quit);
                }
                "-wait" => {
                    options.wait_mode = true;
                    build_needed = true;
                }
                "-wrapper" => {
                    options.wrapper_mode = WrapperMode::MainProcess;
                    build_needed = true;
                }
                // Internal use only: appended by the wrapper itself
                "-wrapperintermediate" => {
                    options.wrapper_mode = WrapperMode::IntermediateProcess;
                }
                "-wrapperfinal" => {
                    options.wrapper_mode = WrapperMode::FinalProcess;
                }
                _ => {
                    if let Some(n) = arg.strip_prefix("-j").and_then(|n| n.parse::<u32>().ok()) {
                        if n <= 256 {
                            options.num_worker_threads = n;
                            i += 1;
                            continue;
                        }
                    }
                    return Err(bad_args(
                        format!("Unknown argument '{}'", arg),
                        &options.program_name,
                    ));
                }
            }
            i += 1;
        }

        // A build happens unless only non-build actions (worker control) were
        // requested
        options.perform_build = build_needed || !build_not_needed;

        if options.targets.is_empty() && options.perform_build {
            options.targets.push("all".to_string());
        }

        // cache mode environment variable (if not supplied on the cmd line)
        if !options.cache.read && !options.cache.write {
            if let Ok(mode) = std::env::var("FASTBUILD_CACHE_MODE") {
                match CacheMode::parse(&mode) {
                    Some(cache) => options.cache = cache,
                    None => {
                        return Err(FbuildError::Options(format!(
                            "FASTBUILD_CACHE_MODE is invalid ({})",
                            mode
                        )));
                    }
                }
            }
        }

        Ok(ParseOutcome::Run(Box::new(options)))
    }

    /// Name of the single-instance mutex for this working directory.
    pub fn main_mutex_name(&self) -> String {
        format!("FASTBuild-0x{:08x}", self.working_dir_hash)
    }

    /// Name of the mutex the final wrapper process holds while building.
    pub fn final_mutex_name(&self) -> String {
        format!("FASTBuild_Final-0x{:08x}", self.working_dir_hash)
    }

    /// Name of the shared-memory segment between wrapper processes.
    pub fn shared_memory_name(&self) -> String {
        format!("FASTBuildSharedMemory_{:08x}", self.working_dir_hash)
    }
}

fn take_value<'a>(
    args: &'a [String],
    i: &mut usize,
    arg: &str,
    program_name: &str,
) -> Result<&'a str> {
    *i += 1;
    match args.get(*i) {
        Some(v) => Ok(v.as_str()),
        None => Err(bad_args(
            format!("Missing value for '{}' argument", arg),
            program_name,
        )),
    }
}

fn bad_args(message: String, program_name: &str) -> FbuildError {
    FbuildError::Options(format!("{}\nTry \"{} -help\"", message, program_name))
}

fn parse_worker_command(
    cmd: &str,
    value: &str,
    arg: &str,
    program_name: &str,
) -> Result<WorkerCommand> {
    match cmd {
        "info" | "json" => {
            let mut level: i32 = value.parse().unwrap_or(0);
            if cmd == "json" {
                // negative info levels select json output internally
                level = -level;
            }
            Ok(WorkerCommand::Info { level })
        }
        "setmode" => match WorkerMode::parse(value) {
            Some(mode) => Ok(WorkerCommand::SetMode { mode }),
            None => Err(bad_args(
                format!("Unrecognized <mode> for '{}' argument", arg),
                program_name,
            )),
        },
        "addblocking" | "removeblocking" => {
            let pid: i32 = value.parse().unwrap_or(0);
            // non-positive values mean this process or its nth parent
            let pid = if pid <= 0 {
                process::nth_parent_pid(std::process::id(), (-pid) as u32)
            } else {
                pid as u32
            };
            if cmd == "addblocking" {
                Ok(WorkerCommand::AddBlocking { pid })
            } else {
                Ok(WorkerCommand::RemoveBlocking { pid })
            }
        }
        _ => Err(bad_args(
            format!("Unrecognized <cmd> for '{}' argument", arg),
            program_name,
        )),
    }
}

/// Canonical form of the working directory used for hashing: no trailing
/// slash, case-folded on the case-insensitive platforms.
pub fn canonical_working_dir(path: &Path) -> String {
    let mut s = path.to_string_lossy().into_owned();
    while s.len() > 1 && s.ends_with('/') {
        s.pop();
    }
    #[cfg(any(target_os = "windows", target_os = "macos"))]
    {
        s = s.to_lowercase();
    }
    s
}

/// 32-bit hash of the canonical working directory; names the process-group
/// mutexes and shared memory.
pub fn working_dir_hash(canonical: &str) -> u32 {
    let mut hasher = XxHash32::with_seed(0);
    hasher.write(canonical.as_bytes());
    hasher.finish() as u32
}

fn display_version() {
    println!(
        "fbuild {} - distributed build coordination client",
        env!("CARGO_PKG_VERSION")
    );
}

fn display_help(program_name: &str) {
    display_version();
    println!(
        "----------------------------------------------------------------------\n\
Usage: {} [options] [target1]..[targetn]\n\
The default action is to perform a build.\n\
----------------------------------------------------------------------\n\
Options:\n\
 -cache[read|write] Control use of the build cache.\n\
 -dist          Allow distributed compilation.\n\
 -distverbose   Print detailed info for distributed compilation.\n\
 -forceremote   Force distributable jobs to only be built remotely.\n\
 -help          Show this help.\n\
 -j[x]          Explicitly set LOCAL worker thread count X.\n\
 -monitor       Emit a machine-readable file while building.\n\
 -quiet         Don't show build output.\n\
 -verbose       Show detailed diagnostic information.\n\
 -version       Print version and exit.\n\
 -wait          Wait for a previous build to complete before starting.\n\
 -worker [name] Add a specific worker. May be used multiple times.\n\
 -workers [names] Comma-separated list of workers.\n\
 -workercmd [worker] [cmd] [value] Send a command to a specific worker.\n\
 -myworkercmd [cmd] [value] Alias for -workercmd 127.0.0.1 cmd value.\n\
 -allworkerscmd [cmd] [value] Send a command to all workers.\n\
   Commands:\n\
    info [level] Request each worker to show their status\n\
                (level = 1 for oneline summary, 2 for per-CPU details)\n\
    json [level] Same as info, with json output\n\
    setmode [mode] mode = disabled | idle | dedicated | proportional\n\
    [add|remove]blocking [pid] Add/Remove a process id that blocks the\n\
                execution of jobs until it terminates.\n\
                pid <= 0 selects this process or its nth parent.\n\
 -workercmdflag [flag] [value] Set a flag for commands to workers.\n\
   Flags: grace [seconds] | wait [seconds] | nofailure\n\
 -wrapper       Spawn a sub-process to gracefully handle termination\n\
                from an IDE.\n\
----------------------------------------------------------------------",
        program_name
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ParseOutcome> {
        let argv: Vec<String> = std::iter::once("fbuild".to_string())
            .chain(args.iter().map(|s| s.to_string()))
            .collect();
        BuildOptions::process_command_line(&argv)
    }

    fn parse_ok(args: &[&str]) -> Box<BuildOptions> {
        match parse(args).unwrap() {
            ParseOutcome::Run(options) => options,
            ParseOutcome::Quit => panic!("expected options, got quit"),
        }
    }

    #[test]
    fn test_default_build_all() {
        let options = parse_ok(&[]);
        assert!(options.perform_build);
        assert_eq!(options.targets, vec!["all"]);
        assert!(!options.allow_distributed);
    }

    #[test]
    fn test_dist_and_workers() {
        let options = parse_ok(&["-dist", "-workers", "w1,w2", "-worker", "w3"]);
        assert!(options.allow_distributed);
        assert_eq!(options.workers, vec!["w1", "w2", "w3"]);
    }

    #[test]
    fn test_worker_implies_distributed() {
        let options = parse_ok(&["-worker", "w1"]);
        assert!(options.allow_distributed);
    }

    #[test]
    fn test_force_remote() {
        let options = parse_ok(&["-forceremote"]);
        assert!(options.allow_distributed);
        assert!(options.force_remote);
        assert!(!options.allow_local_race);
    }

    #[test]
    fn test_thread_count() {
        let options = parse_ok(&["-j12"]);
        assert_eq!(options.num_worker_threads, 12);
        assert!(parse(&["-j257"]).is_err());
        assert!(parse(&["-jx"]).is_err());
    }

    #[test]
    fn test_unknown_argument() {
        assert!(parse(&["-definitely-not-a-flag"]).is_err());
    }

    #[test]
    fn test_workercmd_info() {
        let options = parse_ok(&["-workercmd", "w1", "info", "2"]);
        assert!(!options.perform_build);
        assert_eq!(options.worker_commands.len(), 1);
        assert_eq!(options.worker_commands[0].worker, "w1");
        assert_eq!(
            options.worker_commands[0].command,
            WorkerCommand::Info { level: 2 }
        );
    }

    #[test]
    fn test_workercmd_json_negates_level() {
        let options = parse_ok(&["-allworkerscmd", "json", "2"]);
        assert_eq!(options.worker_commands[0].worker, "*");
        assert_eq!(
            options.worker_commands[0].command,
            WorkerCommand::Info { level: -2 }
        );
    }

    #[test]
    fn test_myworkercmd_setmode() {
        let options = parse_ok(&["-myworkercmd", "setmode", "dedicated"]);
        assert_eq!(options.worker_commands[0].worker, "127.0.0.1");
        assert_eq!(
            options.worker_commands[0].command,
            WorkerCommand::SetMode {
                mode: WorkerMode::Dedicated
            }
        );
    }

    #[test]
    fn test_workercmd_bad_mode() {
        assert!(parse(&["-myworkercmd", "setmode", "turbo"]).is_err());
    }

    #[test]
    fn test_workercmd_addblocking_explicit_pid() {
        let options = parse_ok(&["-workercmd", "w1", "addblocking", "4321"]);
        assert_eq!(
            options.worker_commands[0].command,
            WorkerCommand::AddBlocking { pid: 4321 }
        );
    }

    #[test]
    fn test_workercmd_addblocking_zero_resolves_to_self() {
        let options = parse_ok(&["-workercmd", "w1", "addblocking", "0"]);
        assert_eq!(
            options.worker_commands[0].command,
            WorkerCommand::AddBlocking {
                pid: std::process::id()
            }
        );
    }

    #[test]
    fn test_workercmd_missing_value() {
        assert!(parse(&["-workercmd", "w1", "info"]).is_err());
        assert!(parse(&["-workercmd"]).is_err());
    }

    #[test]
    fn test_workercmdflag() {
        let options = parse_ok(&[
            "-allworkerscmd",
            "setmode",
            "idle",
            "-workercmdflag",
            "grace",
            "10",
            "-workercmdflag",
            "wait",
            "60",
            "-workercmdflag",
            "nofailure",
        ]);
        assert_eq!(options.worker_command_grace, 10);
        assert_eq!(options.worker_command_wait, 60);
        assert!(options.worker_command_ignore_failures);
    }

    #[test]
    fn test_workercmd_alone_suppresses_build() {
        let options = parse_ok(&["-myworkercmd", "info", "1"]);
        assert!(!options.perform_build);
        assert!(options.targets.is_empty());
    }

    #[test]
    fn test_workercmd_plus_target_still_builds() {
        let options = parse_ok(&["-myworkercmd", "info", "1", "mytarget"]);
        assert!(options.perform_build);
        assert_eq!(options.targets, vec!["mytarget"]);
    }

    #[test]
    fn test_wrapper_flags() {
        assert_eq!(parse_ok(&["-wrapper"]).wrapper_mode, WrapperMode::MainProcess);
        assert_eq!(
            parse_ok(&["-wrapperintermediate"]).wrapper_mode,
            WrapperMode::IntermediateProcess
        );
        assert_eq!(
            parse_ok(&["-wrapperfinal"]).wrapper_mode,
            WrapperMode::FinalProcess
        );
    }

    #[test]
    fn test_raw_args_preserved_for_respawn() {
        let options = parse_ok(&["-dist", "-j4", "sometarget"]);
        assert_eq!(options.args, vec!["-dist", "-j4", "sometarget"]);
    }

    #[test]
    fn test_canonical_working_dir_idempotent() {
        let canonical = canonical_working_dir(Path::new("/home/user/project/"));
        assert_eq!(canonical, "/home/user/project");
        assert_eq!(canonical_working_dir(Path::new(&canonical)), canonical);
    }

    #[test]
    fn test_working_dir_hash_stable() {
        let a = working_dir_hash("/home/user/project");
        let b = working_dir_hash("/home/user/project");
        let c = working_dir_hash("/home/user/other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_mutex_names_derive_from_hash() {
        let options = parse_ok(&[]);
        let hash = options.working_dir_hash;
        assert_eq!(
            options.main_mutex_name(),
            format!("FASTBuild-0x{:08x}", hash)
        );
        assert_eq!(
            options.final_mutex_name(),
            format!("FASTBuild_Final-0x{:08x}", hash)
        );
        assert_eq!(
            options.shared_memory_name(),
            format!("FASTBuildSharedMemory_{:08x}", hash)
        );
    }
}
