//! Worker control channel.
//!
//! Control commands are issued from arbitrary caller threads but only sent
//! by the distribution loop's command step. Issuing a command always waits
//! for the previous one to reach quiescence first, so the shared
//! [`ControlMessage`](super::ControlMessage) is never read and replaced
//! concurrently.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::distrib::{ControlMessage, DistribCore, Distributor};
use crate::protocol::Message;
use crate::worker::WorkerMode;

impl DistribCore {
    /// Wait for the previous command to be fully sent and answered.
    ///
    /// Spin-waits with exponential back-off until both pending counters
    /// reach zero or the timeout elapses. On timeout, every still-pending
    /// entry is marked failed and the counters are rebalanced. Returns true
    /// when no contacted worker failed or timed out.
    pub fn wait_last_command_result(&self) -> bool {
        self.wait_last_command_result_timeout(self.config.command_timeout)
    }

    pub fn wait_last_command_result_timeout(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let mut wait_ms: u64 = 1;
        while self.pending_counters() != (0, 0) && start.elapsed() < timeout {
            std::thread::sleep(Duration::from_millis(wait_ms));
            // increase wait by ~20%, capped at 100ms
            wait_ms = ((wait_ms * 12 + 9) / 10).min(100);
        }

        let mut count_timeout = 0u32;
        let mut count_success = 0u32;
        let mut count_failure = 0u32;
        {
            let servers = self.servers.lock().expect("server table poisoned");
            for server in servers.iter() {
                if !server.control_enabled {
                    continue;
                }
                let mut inner = server.lock();
                if inner.control_pending_send {
                    // timeout while sending
                    count_timeout += 1;
                    inner.control_pending_send = false;
                    inner.control_failure = true;
                    self.pending_send_total.fetch_sub(1, Ordering::AcqRel);
                } else if inner.control_pending_response {
                    // timeout while waiting for the response
                    count_timeout += 1;
                    inner.control_pending_response = false;
                    inner.control_failure = true;
                    self.pending_receive_total.fetch_sub(1, Ordering::AcqRel);
                } else if inner.control_failure {
                    count_failure += 1;
                } else if inner.control_success {
                    count_success += 1;
                }
            }
        }

        debug!(
            target: "dist",
            success = count_success,
            failures = count_failure,
            timeouts = count_timeout,
            "command result"
        );

        count_failure == 0 && count_timeout == 0
    }

    /// Replace the shared control message. Only valid once the previous
    /// command is quiescent.
    fn replace_control(&self, message: ControlMessage) {
        *self.control.lock().expect("control message poisoned") = Some(message);
    }

    /// Flag the target workers for the pending command and publish the
    /// count to the loop thread.
    fn set_command_pending(&self, workers: &[String]) {
        let servers = self.servers.lock().expect("server table poisoned");

        // reset all success / failure flags
        for server in servers.iter() {
            if !server.control_enabled {
                continue;
            }
            let mut inner = server.lock();
            inner.control_failure = false;
            inner.control_success = false;
            if inner.control_pending_send {
                error!(
                    "Worker {} is still processing the previous command.",
                    server.name()
                );
                inner.control_pending_send = false;
            }
            if inner.control_pending_response {
                error!(
                    "Worker {} is still waiting for the previous command response.",
                    server.name()
                );
                inner.control_pending_response = false;
            }
        }

        // set the pending flags
        let mut count = 0u32;
        for worker in workers {
            let server = servers.iter().find(|s| s.name() == worker);
            let server = match server {
                Some(server) => server,
                None => {
                    error!("Worker {} is not in the initial workers list.", worker);
                    continue;
                }
            };
            if !server.control_enabled {
                error!("Worker {} is not in the control workers list.", worker);
                continue;
            }
            server.lock().control_pending_send = true;
            count += 1;
        }

        // publish the counter, starting the send on the loop thread
        self.pending_send_total.store(count, Ordering::Release);
    }

    /// Switch the given workers' mode, with a grace period in seconds.
    pub fn workers_set_mode(&self, workers: &[String], mode: WorkerMode, grace_period: i32) {
        self.wait_last_command_result();
        self.replace_control(ControlMessage {
            message: Message::SetMode {
                mode: mode as u8,
                grace_period: grace_period.clamp(0, u16::MAX as i32) as u16,
            },
            payload: None,
            expect_response: false,
        });
        self.set_command_pending(workers);
    }

    /// Pause job acceptance on the given workers until `pid` terminates.
    pub fn workers_add_blocking(&self, workers: &[String], pid: u32, grace_period: i32) {
        self.wait_last_command_result();
        self.replace_control(ControlMessage {
            message: Message::AddBlockingProcess {
                pid,
                grace_period: grace_period.clamp(0, u16::MAX as i32) as u16,
            },
            payload: None,
            expect_response: false,
        });
        self.set_command_pending(workers);
    }

    /// Undo a previous blocking-process registration.
    pub fn workers_remove_blocking(&self, workers: &[String], pid: u32) {
        self.wait_last_command_result();
        self.replace_control(ControlMessage {
            message: Message::RemoveBlockingProcess { pid },
            payload: None,
            expect_response: false,
        });
        self.set_command_pending(workers);
    }

    /// Ask the given workers for a status report. The reply is the only
    /// control exchange that expects a response.
    pub fn workers_request_info(&self, workers: &[String], details_level: u8) {
        self.wait_last_command_result();
        self.replace_control(ControlMessage {
            message: Message::RequestServerInfo { details_level },
            payload: None,
            expect_response: true,
        });
        self.set_command_pending(workers);
    }

    /// Request info and render it: bordered table for positive levels, JSON
    /// for negative ones, per-CPU detail when |level| >= 2. Returns true iff
    /// every contacted worker answered within the wait window.
    pub fn workers_display_info(&self, workers: &[String], info_level: i32) -> bool {
        self.workers_request_info(workers, info_level.unsigned_abs().min(255) as u8);
        let res = self.wait_last_command_result();
        let (text, _) = self.render_info(info_level);
        print!("{}", text);
        res
    }

    /// Repeat info round-trips until the aggregated busy-CPU count reaches
    /// zero or the deadline passes. `timeout_secs` of zero means no
    /// deadline; each round still waits at most 30 seconds.
    pub fn workers_wait_idle(&self, workers: &[String], timeout_secs: u32, info_level: i32) -> bool {
        const ROUND_LIMIT: Duration = Duration::from_secs(30);
        let started = Instant::now();

        let first_wait = if timeout_secs == 0 {
            ROUND_LIMIT
        } else {
            ROUND_LIMIT.min(Duration::from_secs(timeout_secs as u64))
        };
        let mut res = self.wait_last_command_result_timeout(first_wait);

        self.replace_control(ControlMessage {
            message: Message::RequestServerInfo {
                details_level: info_level.unsigned_abs().min(255) as u8,
            },
            payload: None,
            expect_response: true,
        });

        let mut busy = 1u32;
        while res
            && busy > 0
            && (timeout_secs == 0 || started.elapsed() < Duration::from_secs(timeout_secs as u64))
        {
            self.set_command_pending(workers);
            let remaining = if timeout_secs == 0 {
                ROUND_LIMIT
            } else {
                Duration::from_secs(timeout_secs as u64)
                    .saturating_sub(started.elapsed())
                    .min(ROUND_LIMIT)
            };
            res = self.wait_last_command_result_timeout(remaining);
            let (_, aggregates) = self.render_info(0);
            busy = aggregates.cpu_busy;
        }
        res
    }
}

impl Distributor {
    pub fn workers_set_mode(&self, workers: &[String], mode: WorkerMode, grace_period: i32) {
        self.core().workers_set_mode(workers, mode, grace_period);
    }

    pub fn workers_add_blocking(&self, workers: &[String], pid: u32, grace_period: i32) {
        self.core().workers_add_blocking(workers, pid, grace_period);
    }

    pub fn workers_remove_blocking(&self, workers: &[String], pid: u32) {
        self.core().workers_remove_blocking(workers, pid);
    }

    pub fn workers_display_info(&self, workers: &[String], info_level: i32) -> bool {
        self.core().workers_display_info(workers, info_level)
    }

    pub fn workers_wait_idle(&self, workers: &[String], timeout_secs: u32, info_level: i32) -> bool {
        self.core().workers_wait_idle(workers, timeout_secs, info_level)
    }

    pub fn wait_last_command_result(&self) -> bool {
        self.core().wait_last_command_result()
    }
}
