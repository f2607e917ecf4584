//! Per-worker server state.
//!
//! One record per configured worker, created at startup and destroyed at
//! shutdown. The record mutex guards everything except the liveness and
//! build-eligibility flags, which are atomics so the distribution loop can
//! scan the table without taking every record lock. Locking order is always
//! table mutex, then record mutex.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::job::Job;
use crate::net::Connection;
use crate::protocol::{CpuDetail, Message};

/// A configured worker endpoint: `host` or `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEndpoint {
    /// Name as configured (display form).
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl WorkerEndpoint {
    /// Parse a worker name; a bare host uses `default_port`.
    pub fn parse(name: &str, default_port: u16) -> Self {
        if let Some((host, port)) = name.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return Self {
                    name: name.to_string(),
                    host: host.to_string(),
                    port,
                };
            }
        }
        Self {
            name: name.to_string(),
            host: name.to_string(),
            port: default_port,
        }
    }
}

/// Last ServerInfo reply from a worker.
#[derive(Debug, Clone)]
pub struct WorkerInfoSnapshot {
    /// When this snapshot arrived. Displayed by UI layers, not read here.
    #[allow(dead_code)]
    pub timestamp: Instant,
    pub mode: u8,
    pub num_clients: u16,
    pub num_cpus_total: u16,
    pub num_cpus_idle: u16,
    pub num_cpus_busy: u16,
    pub num_blocking_processes: u16,
    pub cpu_usage_self: f32,
    pub cpu_usage_total: f32,
    /// Per-CPU details; empty when not requested.
    pub details: Vec<CpuDetail>,
}

/// Mutable worker record fields, guarded by the record mutex.
#[derive(Default)]
pub struct ServerStateInner {
    /// Display string, empty until connected.
    pub remote_name: String,
    pub connection: Option<Arc<Connection>>,
    /// Framed header awaiting its payload, if any.
    pub current_message: Option<Message>,
    /// Set when a connect attempt fails; None means attempt immediately.
    pub last_connect_failure: Option<Instant>,
    /// Last job count sent to this worker.
    pub num_jobs_advertised: u32,
    /// Jobs currently executing on this worker.
    pub jobs: Vec<Job>,
    pub control_pending_send: bool,
    pub control_pending_response: bool,
    pub control_success: bool,
    pub control_failure: bool,
    pub info: Option<WorkerInfoSnapshot>,
}

/// One worker's record in the server table.
pub struct ServerState {
    pub endpoint: WorkerEndpoint,
    /// Whether this worker may receive control commands. Fixed at startup.
    pub control_enabled: bool,
    /// Whether this worker may receive jobs. Cleared when blacklisted.
    build_enabled: AtomicBool,
    /// Mirror of `inner.connection.is_some()`, readable without the lock.
    connected: AtomicBool,
    inner: Mutex<ServerStateInner>,
}

impl ServerState {
    pub fn new(endpoint: WorkerEndpoint, build_enabled: bool, control_enabled: bool) -> Self {
        Self {
            endpoint,
            control_enabled,
            build_enabled: AtomicBool::new(build_enabled),
            connected: AtomicBool::new(false),
            inner: Mutex::new(ServerStateInner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.endpoint.name
    }

    pub fn build_enabled(&self) -> bool {
        self.build_enabled.load(Ordering::Acquire)
    }

    pub fn set_build_enabled(&self, enabled: bool) {
        self.build_enabled.store(enabled, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Lock the record. Callers must already hold the table mutex or own an
    /// Arc obtained under it.
    pub fn lock(&self) -> MutexGuard<'_, ServerStateInner> {
        self.inner.lock().expect("server state mutex poisoned")
    }

    /// Install a live connection. Called under the record lock by passing
    /// the guard, keeping the atomic mirror consistent.
    pub fn attach_connection(
        &self,
        inner: &mut ServerStateInner,
        connection: Arc<Connection>,
    ) {
        inner.remote_name = self.endpoint.name.clone();
        inner.connection = Some(connection);
        self.connected.store(true, Ordering::Release);
    }

    /// Clear the connection and transient message state.
    pub fn detach_connection(&self, inner: &mut ServerStateInner) {
        inner.remote_name.clear();
        inner.connection = None;
        inner.current_message = None;
        self.connected.store(false, Ordering::Release);
    }
}
