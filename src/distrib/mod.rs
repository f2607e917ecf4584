//! Client-side distribution manager.
//!
//! Owns the per-worker server-state table and a dedicated thread running the
//! three-step loop: look for workers, advertise job availability, pump
//! pending control commands. Job traffic and control replies arrive through
//! the connection pool's callbacks.

pub mod control;
pub mod dispatch;
pub mod info;
pub mod state;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

use crate::cache::CompileCache;
use crate::error::Result;
use crate::job::manifest::ManifestStore;
use crate::job::JobQueue;
use crate::monitor::Monitor;
use crate::net::{Connection, ConnectionPool, PoolListener};
use crate::protocol::{self, Message};
use state::{ServerState, WorkerEndpoint};

/// Tuning knobs for the distribution loop. The defaults match production
/// behavior; tests shrink the intervals.
#[derive(Debug, Clone)]
pub struct DistribConfig {
    /// Port used for workers configured without an explicit one.
    pub port: u16,
    /// Maximum concurrent worker connections.
    pub connection_limit: u32,
    pub connect_timeout: Duration,
    /// Cooldown after a failed connect attempt.
    pub reconnect_delay: Duration,
    /// Minimum interval between Status updates.
    pub status_interval: Duration,
    /// Default timeout waiting for a control command to reach quiescence.
    pub command_timeout: Duration,
}

impl Default for DistribConfig {
    fn default() -> Self {
        Self {
            port: protocol::PROTOCOL_PORT,
            connection_limit: 15,
            connect_timeout: Duration::from_secs(2),
            reconnect_delay: Duration::from_secs(10),
            status_interval: Duration::from_millis(100),
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// The currently pending out-of-band command. Replaced only after the
/// previous command reached quiescence, so the loop thread can read it
/// without coordination beyond the pending counters.
pub struct ControlMessage {
    pub message: Message,
    pub payload: Option<Vec<u8>>,
    pub expect_response: bool,
}

/// External collaborators the distribution core drives.
pub struct DistribContext {
    pub queue: Arc<dyn JobQueue>,
    pub manifests: Arc<dyn ManifestStore>,
    pub cache: Arc<dyn CompileCache>,
    pub cache_write: bool,
    pub monitor: Option<Arc<Monitor>>,
}

/// Shared state between the loop thread, pool callbacks and control callers.
pub struct DistribCore {
    pub(crate) config: DistribConfig,
    /// Table mutex guards iteration and sizing; each entry has its own lock.
    pub(crate) servers: Mutex<Vec<Arc<ServerState>>>,
    pub(crate) pool: ConnectionPool,
    pub(crate) ctx: DistribContext,
    pub(crate) should_exit: AtomicBool,
    pub(crate) pending_send_total: AtomicU32,
    pub(crate) pending_receive_total: AtomicU32,
    pub(crate) control: Mutex<Option<ControlMessage>>,
    status_timer: Mutex<Instant>,
}

/// Handle owning the distribution thread.
pub struct Distributor {
    core: Arc<DistribCore>,
    thread: Option<JoinHandle<()>>,
}

impl Distributor {
    /// Build the server table and start the distribution thread.
    ///
    /// The table holds every build worker first, then every control-only
    /// worker, deduplicated; each entry records which capabilities apply.
    pub fn start(
        build_workers: &[String],
        control_workers: &[String],
        config: DistribConfig,
        ctx: DistribContext,
    ) -> Result<Self> {
        let mut servers: Vec<Arc<ServerState>> = Vec::new();
        for name in build_workers {
            if servers.iter().any(|s| s.name() == name) {
                continue;
            }
            let control = control_workers.contains(name);
            servers.push(Arc::new(ServerState::new(
                WorkerEndpoint::parse(name, config.port),
                true,
                control,
            )));
        }
        for name in control_workers {
            if servers.iter().any(|s| s.name() == name) {
                continue;
            }
            servers.push(Arc::new(ServerState::new(
                WorkerEndpoint::parse(name, config.port),
                false,
                true,
            )));
        }

        let core = Arc::new(DistribCore {
            config,
            servers: Mutex::new(servers),
            pool: ConnectionPool::new(),
            ctx,
            should_exit: AtomicBool::new(false),
            pending_send_total: AtomicU32::new(0),
            pending_receive_total: AtomicU32::new(0),
            control: Mutex::new(None),
            status_timer: Mutex::new(Instant::now()),
        });

        let thread_core = Arc::clone(&core);
        let thread = std::thread::Builder::new()
            .name("distrib".to_string())
            .spawn(move || thread_core.run_loop())
            .map_err(|e| {
                crate::error::FbuildError::Worker(format!(
                    "failed to spawn distribution thread: {}",
                    e
                ))
            })?;

        Ok(Self {
            core,
            thread: Some(thread),
        })
    }

    pub fn core(&self) -> &Arc<DistribCore> {
        &self.core
    }

    /// Stop the loop, close every connection and wait for callback drain.
    pub fn shutdown(&mut self) {
        self.core.should_exit.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.core.pool.shutdown();
    }
}

impl Drop for Distributor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl DistribCore {
    fn run_loop(self: Arc<Self>) {
        loop {
            self.look_for_workers();
            if self.should_exit.load(Ordering::Acquire) {
                break;
            }

            self.communicate_job_availability();
            if self.should_exit.load(Ordering::Acquire) {
                break;
            }

            self.communicate_commands();
            if self.should_exit.load(Ordering::Acquire) {
                break;
            }

            std::thread::sleep(Duration::from_millis(1));
            if self.should_exit.load(Ordering::Acquire) {
                break;
            }
        }
    }

    /// Step 1: attempt at most one connection per pass.
    fn look_for_workers(self: &Arc<Self>) {
        let servers = self.servers.lock().expect("server table poisoned");
        let num_workers = servers.len();
        if num_workers == 0 {
            return;
        }

        let num_connections = servers.iter().filter(|s| s.is_connected()).count();

        // limit maximum concurrent connections
        if num_connections >= self.config.connection_limit as usize {
            return;
        }

        // already connected to every possible worker
        if num_connections == num_workers {
            return;
        }

        // randomize the start index so many clients sharing the same worker
        // list don't all pile onto the same subset
        let start_index = rand::thread_rng().gen_range(0..num_workers);

        for j in 0..num_workers {
            let i = (j + start_index) % num_workers;
            let server = &servers[i];

            if server.is_connected() {
                continue;
            }

            // ignore blacklisted workers
            if !server.build_enabled() && !server.control_enabled {
                continue;
            }

            let mut inner = server.lock();
            debug_assert!(inner.jobs.is_empty());

            if let Some(failed_at) = inner.last_connect_failure {
                if failed_at.elapsed() < self.config.reconnect_delay {
                    continue;
                }
            }

            debug!(target: "dist", worker = server.name(), "connecting");
            let listener: Arc<dyn PoolListener> = Arc::clone(self) as Arc<dyn PoolListener>;
            match self.pool.connect(
                &server.endpoint.host,
                server.endpoint.port,
                self.config.connect_timeout,
                i,
                listener,
            ) {
                Err(e) => {
                    debug!(target: "dist", worker = server.name(), error = %e, "connection failed");
                    inner.last_connect_failure = Some(Instant::now());
                }
                Ok(connection) => {
                    debug!(target: "dist", worker = server.name(), "connection ok");
                    let num_jobs_available = if server.build_enabled() {
                        self.ctx.queue.available_distributable_jobs()
                    } else {
                        0
                    };

                    server.attach_connection(&mut inner, Arc::clone(&connection));
                    inner.num_jobs_advertised = num_jobs_available;

                    let msg = protocol::connection_message(num_jobs_available);
                    self.send_message(&connection, &msg);
                }
            }

            // limit to one connection attempt per iteration
            return;
        }
    }

    /// Step 2: tell connected build workers when the job count changed.
    fn communicate_job_availability(&self) {
        {
            let mut last = self.status_timer.lock().expect("status timer poisoned");
            if last.elapsed() < self.config.status_interval {
                return;
            }
            *last = Instant::now();
        }

        let num_jobs_available = self.ctx.queue.available_distributable_jobs();
        let msg = Message::Status { num_jobs_available };

        let servers = self.servers.lock().expect("server table poisoned");
        for server in servers.iter() {
            if !server.build_enabled() || !server.is_connected() {
                continue;
            }
            let mut inner = server.lock();
            if let Some(connection) = inner.connection.clone() {
                if inner.num_jobs_advertised != num_jobs_available {
                    self.send_message(&connection, &msg);
                    inner.num_jobs_advertised = num_jobs_available;
                }
            }
        }
    }

    /// Step 3: push the pending control command to flagged workers.
    fn communicate_commands(&self) {
        if self.pending_send_total.load(Ordering::Acquire) == 0 {
            return;
        }

        // The control message is stable while any send is pending; clone
        // what we need and release the lock before touching the table.
        let (frame, payload, expect_response) = {
            let control = self.control.lock().expect("control message poisoned");
            match control.as_ref() {
                Some(cm) => (
                    cm.message.encode(cm.payload.is_some()),
                    cm.payload.clone(),
                    cm.expect_response,
                ),
                None => return,
            }
        };

        let servers = self.servers.lock().expect("server table poisoned");
        for server in servers.iter() {
            if !server.is_connected() {
                continue;
            }
            let mut inner = server.lock();
            if !inner.control_pending_send {
                continue;
            }
            if let Some(connection) = inner.connection.clone() {
                let sent = match &payload {
                    Some(payload) => connection.send_with_payload(&frame, payload),
                    None => connection.send(&frame),
                };
                if let Err(e) = sent {
                    debug!(target: "dist", worker = server.name(), error = %e, "command send failed");
                }
                inner.control_pending_send = false;
                if expect_response {
                    inner.control_pending_response = true;
                    self.pending_receive_total.fetch_add(1, Ordering::AcqRel);
                } else {
                    inner.control_success = true;
                }
                self.pending_send_total.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    pub(crate) fn send_message(&self, connection: &Arc<Connection>, msg: &Message) {
        debug_assert!(!msg.always_has_payload());
        if let Err(e) = connection.send(&msg.encode(false)) {
            debug!(
                target: "dist",
                peer = connection.peer(),
                msg = msg.name(),
                error = %e,
                "send failed"
            );
        }
    }

    pub(crate) fn send_message_with_payload(
        &self,
        connection: &Arc<Connection>,
        msg: &Message,
        payload: &[u8],
    ) {
        debug_assert!(msg.always_has_payload());
        if let Err(e) = connection.send_with_payload(&msg.encode(true), payload) {
            debug!(
                target: "dist",
                peer = connection.peer(),
                msg = msg.name(),
                payload_len = payload.len(),
                error = %e,
                "send failed"
            );
        }
    }

    /// Snapshot of the server table (order matches configuration).
    pub fn server_states(&self) -> Vec<Arc<ServerState>> {
        self.servers.lock().expect("server table poisoned").clone()
    }

    /// Current pending-counter values (send, receive).
    pub fn pending_counters(&self) -> (u32, u32) {
        (
            self.pending_send_total.load(Ordering::Acquire),
            self.pending_receive_total.load(Ordering::Acquire),
        )
    }
}
