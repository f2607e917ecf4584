//! Job dispatch and result handling.
//!
//! Runs on the connection pool's reader threads. Handlers take the table
//! mutex only long enough to find the relevant server record, then work
//! under that record's mutex.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::distrib::state::{ServerState, WorkerInfoSnapshot};
use crate::distrib::DistribCore;
use crate::job::multibuf::MultiBuffer;
use crate::job::result::JobResultBlob;
use crate::job::{DistributionState, Job, ToolchainFamily};
use crate::monitor::FinishStatus;
use crate::net::{Connection, PoolListener};
use crate::protocol::{decode_server_info_details, Message};
use std::sync::atomic::Ordering;
use std::time::Instant;

/// Remote system errors are retried on other workers up to this many times
/// before the job is reported failed.
pub const SYSTEM_ERROR_ATTEMPT_COUNT: u32 = 3;

impl PoolListener for DistribCore {
    fn on_receive(&self, connection: &Arc<Connection>, frame: Vec<u8>) {
        let server = match self.server_for(connection) {
            Some(server) => server,
            None => return,
        };

        // Are we expecting a message, or the payload for one?
        let (msg, payload) = {
            let mut inner = server.lock();
            match inner.current_message.take() {
                None => match Message::decode(&frame) {
                    Ok((msg, has_payload)) => {
                        if has_payload {
                            // payload arrives as the next frame
                            inner.current_message = Some(msg);
                            return;
                        }
                        (msg, Vec::new())
                    }
                    Err(e) => {
                        drop(inner);
                        self.protocol_error(&server, connection, &e.to_string());
                        return;
                    }
                },
                Some(msg) => (msg, frame),
            }
        };

        debug!(target: "dist", worker = server.name(), msg = msg.name(), "received");

        match msg {
            Message::RequestJob => self.process_request_job(&server, connection),
            Message::JobResult => self.process_job_result(&server, connection, &payload),
            Message::RequestManifest { tool_id } => {
                self.process_request_manifest(&server, connection, tool_id)
            }
            Message::RequestFile { tool_id, file_id } => {
                self.process_request_file(&server, connection, tool_id, file_id)
            }
            Message::ServerInfo { .. } => {
                self.process_server_info(&server, connection, &msg, &payload)
            }
            other => {
                // a client-bound connection must never see client-side traffic
                self.protocol_error(
                    &server,
                    connection,
                    &format!("unexpected {} message", other.name()),
                );
            }
        }
    }

    fn on_disconnected(&self, connection: &Arc<Connection>) {
        let server = match self.server_for(connection) {
            Some(server) => server,
            None => return,
        };

        let mut inner = server.lock();

        // Ignore a stale notification if this record was already reconnected
        match &inner.connection {
            Some(current) if Arc::ptr_eq(current, connection) => {}
            Some(_) => return,
            None => {}
        }

        debug!(target: "dist", worker = server.name(), "disconnected");

        for job in inner.jobs.drain(..) {
            if let Some(monitor) = &self.ctx.monitor {
                monitor.finish_job(FinishStatus::Timeout, server.name(), job.node_name(), "");
            }
            // not a system error - the worker may simply reconnect elsewhere
            self.ctx.queue.return_unfinished_job(job);
        }

        server.detach_connection(&mut inner);
    }
}

impl DistribCore {
    fn server_for(&self, connection: &Arc<Connection>) -> Option<Arc<ServerState>> {
        let servers = self.servers.lock().expect("server table poisoned");
        servers.get(connection.user_index()).cloned()
    }

    /// A peer broke the protocol: drop the connection. Recovery is the same
    /// as any disconnect (in-flight jobs return to the queue).
    fn protocol_error(&self, server: &Arc<ServerState>, connection: &Arc<Connection>, why: &str) {
        debug_assert!(false, "protocol error from {}: {}", server.name(), why);
        warn!(target: "dist", worker = server.name(), why, "protocol error, disconnecting");
        connection.close();
    }

    fn process_request_job(&self, server: &Arc<ServerState>, connection: &Arc<Connection>) {
        // no jobs for blacklisted or control-only workers
        if !server.build_enabled() {
            self.send_message(connection, &Message::NoJobAvailable);
            return;
        }

        let mut job = match self.ctx.queue.acquire_distributable_job() {
            Some(job) => job,
            None => {
                // nothing right now (or the queue gave the job away already)
                self.send_message(connection, &Message::NoJobAvailable);
                return;
            }
        };

        let serialized = job.serialize();
        let tool_id = job.tool_id();
        job.set_distribution_state(DistributionState::Sent);

        let mut inner = server.lock();
        debug!(
            target: "dist",
            worker = server.name(),
            node = job.node_name(),
            "job sent"
        );
        if let Some(monitor) = &self.ctx.monitor {
            monitor.start_job(server.name(), job.node_name());
        }
        inner.jobs.push(job); // track in-flight job
        drop(inner);

        self.send_message_with_payload(connection, &Message::Job { tool_id }, &serialized);
    }

    fn process_job_result(
        &self,
        server: &Arc<ServerState>,
        connection: &Arc<Connection>,
        payload: &[u8],
    ) {
        let blob = match JobResultBlob::decode(payload) {
            Ok(blob) => blob,
            Err(e) => {
                self.protocol_error(server, connection, &e.to_string());
                return;
            }
        };

        let mut job = {
            let mut inner = server.lock();
            let index = inner.jobs.iter().position(|j| j.id() == blob.job_id);
            match index {
                Some(index) => inner.jobs.remove(index),
                None => {
                    drop(inner);
                    self.protocol_error(
                        server,
                        connection,
                        &format!("result for unknown job {}", blob.job_id),
                    );
                    return;
                }
            }
        };

        // Has the job been cancelled in the interim (raced locally)?
        if !self.ctx.queue.accept_remote_result(blob.job_id) {
            debug!(
                target: "dist",
                worker = server.name(),
                node = job.node_name(),
                "result discarded, job was cancelled"
            );
            return;
        }

        debug!(
            target: "dist",
            worker = server.name(),
            node = job.node_name(),
            success = blob.success,
            "got result"
        );

        job.set_messages(blob.messages.clone());

        let mut success = blob.success;
        if success {
            success = self.commit_outputs(&mut job, &blob);
            if !job.warnings_as_errors() {
                emit_remote_warnings(&job);
            }
        } else {
            // failed - was it a system error?
            if blob.system_error {
                // blacklist the misbehaving worker
                server.set_build_enabled(false);
                job.on_system_error();

                warn!(
                    target: "dist",
                    worker = server.name(),
                    node = job.node_name(),
                    error_count = job.system_error_count(),
                    max = SYSTEM_ERROR_ATTEMPT_COUNT,
                    "remote system failure, worker blacklisted"
                );

                // retry on another worker?
                if job.system_error_count() < SYSTEM_ERROR_ATTEMPT_COUNT {
                    self.ctx.queue.return_unfinished_job(job);
                    return;
                }

                job.set_messages(
                    blob.messages
                        .iter()
                        .cloned()
                        .chain(std::iter::once(format!(
                            "fbuild: Error: Task failed on {} different workers",
                            SYSTEM_ERROR_ATTEMPT_COUNT
                        )))
                        .collect(),
                );
            }

            error!(
                target: "dist",
                node = job.node_name(),
                "{}",
                job.messages_joined()
            );
        }

        if let Some(monitor) = &self.ctx.monitor {
            let status = if success {
                FinishStatus::Success
            } else {
                FinishStatus::Error
            };
            monitor.finish_job(
                status,
                server.name(),
                job.node_name(),
                &job.messages().join(" "),
            );
        }

        self.ctx.queue.finished_job(job, success);
    }

    /// Write the returned output files to disk in their fixed order and
    /// commit to the cache when enabled. Any write failure fails the job.
    fn commit_outputs(&self, job: &mut Job, blob: &JobResultBlob) -> bool {
        let mb = match MultiBuffer::parse(&blob.output) {
            Ok(mb) => mb,
            Err(e) => {
                error!(target: "dist", node = job.node_name(), error = %e, "bad result buffer");
                return false;
            }
        };

        let outputs = job.outputs().clone();
        let mut file_index = 0;

        // 1. Object file
        if let Err(e) = mb.extract_file(file_index, &outputs.object) {
            error!(
                target: "dist",
                file = %outputs.object.display(),
                error = %e,
                "failed to create file"
            );
            return false;
        }
        file_index += 1;

        // 2. PDB file (optional)
        if let Some(pdb) = &outputs.pdb {
            if let Err(e) = mb.extract_file(file_index, pdb) {
                error!(target: "dist", file = %pdb.display(), error = %e, "failed to create file");
                return false;
            }
            file_index += 1;
        }

        // 3. Static-analysis XML (optional)
        if let Some(xml) = &outputs.analysis_xml {
            if let Err(e) = mb.extract_file(file_index, xml) {
                error!(target: "dist", file = %xml.display(), error = %e, "failed to create file");
                return false;
            }
        }

        job.set_build_time_ms(blob.build_time_ms);

        if self.ctx.cache_write && job.is_cacheable() {
            if let Some(object) = mb.file(0) {
                self.ctx.cache.store(job.node_name(), object);
            }
        }

        true
    }

    fn process_request_manifest(
        &self,
        server: &Arc<ServerState>,
        connection: &Arc<Connection>,
        tool_id: u64,
    ) {
        let manifest = self.find_manifest(server, tool_id);
        let manifest = match manifest {
            Some(manifest) => manifest,
            None => {
                // worker asked for a manifest no in-flight job references
                self.protocol_error(
                    server,
                    connection,
                    &format!("manifest request for unknown tool {:#x}", tool_id),
                );
                return;
            }
        };

        let metadata = manifest.serialize_metadata();
        self.send_message_with_payload(connection, &Message::Manifest { tool_id }, &metadata);
    }

    fn process_request_file(
        &self,
        server: &Arc<ServerState>,
        connection: &Arc<Connection>,
        tool_id: u64,
        file_id: u32,
    ) {
        let manifest = self.find_manifest(server, tool_id);
        let manifest = match manifest {
            Some(manifest) => manifest,
            None => {
                self.protocol_error(
                    server,
                    connection,
                    &format!("file request for unknown tool {:#x}", tool_id),
                );
                return;
            }
        };

        let data = match manifest.file_data(file_id) {
            Some(data) => data.to_vec(),
            None => {
                self.protocol_error(
                    server,
                    connection,
                    &format!("file request for unknown file {} of tool {:#x}", file_id, tool_id),
                );
                return;
            }
        };

        self.send_message_with_payload(connection, &Message::File { tool_id, file_id }, &data);
    }

    /// A manifest may only be served to a worker that has an in-flight job
    /// using it; anything else is a protocol violation.
    fn find_manifest(
        &self,
        server: &Arc<ServerState>,
        tool_id: u64,
    ) -> Option<Arc<crate::job::manifest::ToolManifest>> {
        let inner = server.lock();
        let referenced = inner.jobs.iter().any(|j| j.tool_id() == tool_id);
        drop(inner);
        if !referenced {
            return None;
        }
        self.ctx.manifests.manifest(tool_id)
    }

    fn process_server_info(
        &self,
        server: &Arc<ServerState>,
        connection: &Arc<Connection>,
        msg: &Message,
        payload: &[u8],
    ) {
        let (
            mode,
            num_clients,
            num_cpus_total,
            num_cpus_idle,
            num_cpus_busy,
            num_blocking_processes,
            cpu_usage_self,
            cpu_usage_total,
        ) = match msg {
            Message::ServerInfo {
                mode,
                num_clients,
                num_cpus_total,
                num_cpus_idle,
                num_cpus_busy,
                num_blocking_processes,
                cpu_usage_self,
                cpu_usage_total,
            } => (
                *mode,
                *num_clients,
                *num_cpus_total,
                *num_cpus_idle,
                *num_cpus_busy,
                *num_blocking_processes,
                *cpu_usage_self,
                *cpu_usage_total,
            ),
            _ => return,
        };

        let details = if payload.is_empty() {
            Vec::new()
        } else {
            match decode_server_info_details(payload, num_cpus_total as usize) {
                Ok(details) => details,
                Err(e) => {
                    self.protocol_error(server, connection, &e.to_string());
                    return;
                }
            }
        };

        let mut inner = server.lock();
        inner.info = Some(WorkerInfoSnapshot {
            timestamp: Instant::now(),
            mode,
            num_clients,
            num_cpus_total,
            num_cpus_idle,
            num_cpus_busy,
            num_blocking_processes,
            cpu_usage_self,
            cpu_usage_total,
            details,
        });

        if inner.control_pending_response {
            inner.control_pending_response = false;
            inner.control_success = true;
            self.pending_receive_total.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Re-emit compiler warnings from a remote build through the log, following
/// the compiler family's spelling. Only called when warnings-as-errors is
/// off for the node.
fn emit_remote_warnings(job: &Job) {
    let needle = match job.toolchain() {
        ToolchainFamily::Msvc => "warning C",
        ToolchainFamily::ClangGcc => "warning:",
        ToolchainFamily::Other => return,
    };
    for line in job.messages() {
        if line.contains(needle) {
            warn!(target: "dist", node = job.node_name(), "{}", line);
        }
    }
}
