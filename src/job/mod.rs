//! Job model and the queue collaborator interface.
//!
//! The dependency graph itself lives outside this crate; a [`Job`] carries
//! the narrow slice of node state the distribution core needs: identity,
//! tool manifest id, build-time output paths and compiler-family flags.
//!
//! Ownership is strict: a job lives in exactly one of the pending queue, a
//! server state's in-flight list, or the completed list. Every transfer is a
//! move through the [`JobQueue`] trait.

#![allow(dead_code)] // Parts of this surface are driven by the graph layer

pub mod manifest;
pub mod multibuf;
pub mod result;

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::protocol::wire::{Reader, Writer};
use crate::error::Result;

/// Where a job currently is in its distributed lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistributionState {
    #[default]
    NotDistributed,
    /// Handed to a remote worker.
    Sent,
    /// A local race was also running and the remote result landed first.
    RaceWonRemotely,
    /// Result committed (or failed) and returned to the queue.
    Completed,
}

/// Compiler family, used for warning post-processing on remote results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolchainFamily {
    Msvc,
    ClangGcc,
    #[default]
    Other,
}

impl ToolchainFamily {
    fn to_u8(self) -> u8 {
        match self {
            Self::Msvc => 0,
            Self::ClangGcc => 1,
            Self::Other => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Msvc,
            1 => Self::ClangGcc,
            _ => Self::Other,
        }
    }
}

/// Build-time output paths for a node. The object file is always present;
/// PDB and static-analysis XML only when the node's flags ask for them.
#[derive(Debug, Clone, Default)]
pub struct JobOutputs {
    pub object: PathBuf,
    pub pdb: Option<PathBuf>,
    pub analysis_xml: Option<PathBuf>,
}

/// One distributable build action.
#[derive(Debug)]
pub struct Job {
    id: u32,
    node_name: String,
    tool_id: u64,
    args: String,
    outputs: JobOutputs,
    toolchain: ToolchainFamily,
    warnings_as_errors: bool,
    cacheable: bool,
    system_error_count: u32,
    state: DistributionState,
    messages: Vec<String>,
    build_time_ms: u32,
}

impl Job {
    pub fn new(id: u32, node_name: impl Into<String>, tool_id: u64, outputs: JobOutputs) -> Self {
        Self {
            id,
            node_name: node_name.into(),
            tool_id,
            args: String::new(),
            outputs,
            toolchain: ToolchainFamily::default(),
            warnings_as_errors: false,
            cacheable: true,
            system_error_count: 0,
            state: DistributionState::NotDistributed,
            messages: Vec::new(),
            build_time_ms: 0,
        }
    }

    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = args.into();
        self
    }

    pub fn with_toolchain(mut self, toolchain: ToolchainFamily) -> Self {
        self.toolchain = toolchain;
        self
    }

    pub fn with_warnings_as_errors(mut self, v: bool) -> Self {
        self.warnings_as_errors = v;
        self
    }

    pub fn with_cacheable(mut self, v: bool) -> Self {
        self.cacheable = v;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn tool_id(&self) -> u64 {
        self.tool_id
    }

    pub fn outputs(&self) -> &JobOutputs {
        &self.outputs
    }

    pub fn toolchain(&self) -> ToolchainFamily {
        self.toolchain
    }

    pub fn warnings_as_errors(&self) -> bool {
        self.warnings_as_errors
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn system_error_count(&self) -> u32 {
        self.system_error_count
    }

    /// Record a remote system error against this job.
    pub fn on_system_error(&mut self) {
        self.system_error_count += 1;
    }

    pub fn distribution_state(&self) -> DistributionState {
        self.state
    }

    pub fn set_distribution_state(&mut self, state: DistributionState) {
        self.state = state;
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn set_messages(&mut self, messages: Vec<String>) {
        self.messages = messages;
    }

    pub fn messages_joined(&self) -> String {
        self.messages.join("\n")
    }

    pub fn build_time_ms(&self) -> u32 {
        self.build_time_ms
    }

    pub fn set_build_time_ms(&mut self, ms: u32) {
        self.build_time_ms = ms;
    }

    /// Serialize for the wire (payload of a Job message).
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u32(self.id);
        w.put_str(&self.node_name);
        w.put_u64(self.tool_id);
        w.put_str(&self.args);
        w.put_u8(self.toolchain.to_u8());
        w.put_bool(self.warnings_as_errors);
        w.into_vec()
    }

    /// Parse a serialized job. Used by the worker side (and test stubs).
    pub fn deserialize(data: &[u8]) -> Result<Job> {
        let mut r = Reader::new(data);
        let id = r.get_u32()?;
        let node_name = r.get_str()?;
        let tool_id = r.get_u64()?;
        let args = r.get_str()?;
        let toolchain = ToolchainFamily::from_u8(r.get_u8()?);
        let warnings_as_errors = r.get_bool()?;
        Ok(Job::new(id, node_name, tool_id, JobOutputs::default())
            .with_args(args)
            .with_toolchain(toolchain)
            .with_warnings_as_errors(warnings_as_errors))
    }
}

/// A finished job together with its outcome.
#[derive(Debug)]
pub struct CompletedJob {
    pub job: Job,
    pub success: bool,
}

/// The queue collaborator the distribution core draws jobs from.
pub trait JobQueue: Send + Sync {
    /// How many distributable jobs are currently waiting.
    fn available_distributable_jobs(&self) -> u32;

    /// Move one pending distributable job to the caller, if any.
    fn acquire_distributable_job(&self) -> Option<Job>;

    /// Move an unfinished job back into the pending queue (disconnect or
    /// retry after a remote system error).
    fn return_unfinished_job(&self, job: Job);

    /// Whether a remote result for `job_id` is still wanted. Returns false
    /// when the job was raced locally and cancelled in the interim.
    fn accept_remote_result(&self, job_id: u32) -> bool;

    /// Move a job into the completed list.
    fn finished_job(&self, job: Job, success: bool);
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    cancelled: HashSet<u32>,
    completed: Vec<CompletedJob>,
}

/// In-memory queue implementation backing the binary and the tests.
#[derive(Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a distributable job to the pending queue.
    pub fn push_job(&self, job: Job) {
        self.state.lock().expect("job queue poisoned").pending.push_back(job);
    }

    /// Cancel a job that was raced locally; a later remote result for it is
    /// discarded.
    pub fn cancel_job(&self, job_id: u32) {
        self.state.lock().expect("job queue poisoned").cancelled.insert(job_id);
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().expect("job queue poisoned").pending.len()
    }

    pub fn completed_count(&self) -> usize {
        self.state.lock().expect("job queue poisoned").completed.len()
    }

    pub fn successful_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .completed
            .iter()
            .filter(|c| c.success)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .completed
            .iter()
            .filter(|c| !c.success)
            .count()
    }

    /// Whether a given job id sits in the pending queue.
    pub fn is_pending(&self, job_id: u32) -> bool {
        self.state
            .lock()
            .unwrap()
            .pending
            .iter()
            .any(|j| j.id() == job_id)
    }

    /// Run a closure over the completed list (test hook).
    pub fn with_completed<R>(&self, f: impl FnOnce(&[CompletedJob]) -> R) -> R {
        f(&self.state.lock().expect("job queue poisoned").completed)
    }
}

impl JobQueue for InMemoryJobQueue {
    fn available_distributable_jobs(&self) -> u32 {
        self.state.lock().expect("job queue poisoned").pending.len() as u32
    }

    fn acquire_distributable_job(&self) -> Option<Job> {
        self.state.lock().expect("job queue poisoned").pending.pop_front()
    }

    fn return_unfinished_job(&self, mut job: Job) {
        job.set_distribution_state(DistributionState::NotDistributed);
        self.state.lock().expect("job queue poisoned").pending.push_back(job);
    }

    fn accept_remote_result(&self, job_id: u32) -> bool {
        !self.state.lock().expect("job queue poisoned").cancelled.contains(&job_id)
    }

    fn finished_job(&self, mut job: Job, success: bool) {
        job.set_distribution_state(DistributionState::Completed);
        self.state
            .lock()
            .unwrap()
            .completed
            .push(CompletedJob { job, success });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: u32) -> Job {
        Job::new(id, format!("obj/file{}.o", id), 0x1000 + id as u64, JobOutputs::default())
    }

    #[test]
    fn test_job_serialize_roundtrip() {
        let j = job(7)
            .with_args("-c -O2 file7.cpp")
            .with_toolchain(ToolchainFamily::ClangGcc)
            .with_warnings_as_errors(true);
        let parsed = Job::deserialize(&j.serialize()).unwrap();
        assert_eq!(parsed.id(), 7);
        assert_eq!(parsed.node_name(), "obj/file7.o");
        assert_eq!(parsed.tool_id(), 0x1007);
        assert_eq!(parsed.toolchain(), ToolchainFamily::ClangGcc);
        assert!(parsed.warnings_as_errors());
    }

    #[test]
    fn test_queue_moves() {
        let queue = InMemoryJobQueue::new();
        queue.push_job(job(1));
        queue.push_job(job(2));
        assert_eq!(queue.available_distributable_jobs(), 2);

        let j1 = queue.acquire_distributable_job().unwrap();
        assert_eq!(j1.id(), 1);
        assert_eq!(queue.available_distributable_jobs(), 1);

        queue.return_unfinished_job(j1);
        assert_eq!(queue.available_distributable_jobs(), 2);
        // Returned job goes to the back
        assert_eq!(queue.acquire_distributable_job().unwrap().id(), 2);
        let j1 = queue.acquire_distributable_job().unwrap();
        assert_eq!(j1.id(), 1);

        queue.finished_job(j1, true);
        assert_eq!(queue.completed_count(), 1);
        assert_eq!(queue.successful_count(), 1);
    }

    #[test]
    fn test_cancelled_result_rejected() {
        let queue = InMemoryJobQueue::new();
        queue.push_job(job(9));
        let j = queue.acquire_distributable_job().unwrap();
        queue.cancel_job(j.id());
        assert!(!queue.accept_remote_result(9));
        assert!(queue.accept_remote_result(10));
    }

    #[test]
    fn test_system_error_count() {
        let mut j = job(3);
        assert_eq!(j.system_error_count(), 0);
        j.on_system_error();
        j.on_system_error();
        assert_eq!(j.system_error_count(), 2);
    }
}
