//! End-to-end distribution scenarios against scripted stub workers.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::tempdir;

use crate::cache::NullCache;
use crate::distrib::state::WorkerEndpoint;
use crate::distrib::{DistribConfig, DistribContext, DistribCore, Distributor};
use crate::job::manifest::{ManifestFile, ManifestRegistry, ToolManifest};
use crate::job::multibuf::MultiBuffer;
use crate::job::result::JobResultBlob;
use crate::job::{InMemoryJobQueue, Job, JobOutputs, JobQueue};
use crate::monitor::Monitor;
use crate::net::pool::{read_frame, write_frame};
use crate::net::ConnectionPool;
use crate::protocol::{
    encode_server_info_details, CpuDetail, Message, PROTOCOL_PORT, PROTOCOL_VERSION,
};
use crate::worker::{ResourceProbe, WorkerMode, WorkerStatus};

const TOOL_ID: u64 = 0x00C0FFEE;

fn test_config() -> DistribConfig {
    DistribConfig {
        port: PROTOCOL_PORT,
        connection_limit: 15,
        connect_timeout: Duration::from_secs(2),
        reconnect_delay: Duration::from_secs(60),
        status_interval: Duration::from_millis(10),
        command_timeout: Duration::from_secs(5),
    }
}

fn test_ctx(
    queue: Arc<InMemoryJobQueue>,
    manifests: Arc<ManifestRegistry>,
    monitor: Option<Arc<Monitor>>,
) -> DistribContext {
    DistribContext {
        queue,
        manifests,
        cache: Arc::new(NullCache::new()),
        cache_write: false,
        monitor,
    }
}

fn make_queue(count: u32, dir: &std::path::Path) -> Arc<InMemoryJobQueue> {
    let queue = Arc::new(InMemoryJobQueue::new());
    for i in 0..count {
        let outputs = JobOutputs {
            object: dir.join(format!("obj{}.o", i)),
            pdb: None,
            analysis_xml: None,
        };
        queue.push_job(Job::new(i, format!("obj/file{}.o", i), TOOL_ID, outputs));
    }
    queue
}

fn make_manifests() -> Arc<ManifestRegistry> {
    let registry = ManifestRegistry::new();
    registry.register(ToolManifest::new(
        TOOL_ID,
        vec![ManifestFile {
            id: 0,
            name: "cc".into(),
            data: vec![0xAA; 16],
        }],
    ));
    Arc::new(registry)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

// ---- stub worker plumbing -------------------------------------------------

fn recv_message(stream: &mut TcpStream) -> Option<(Message, Option<Vec<u8>>)> {
    let frame = read_frame(stream).ok()??;
    let (msg, has_payload) = Message::decode(&frame).expect("stub received undecodable frame");
    let payload = if has_payload {
        Some(read_frame(stream).ok()??)
    } else {
        None
    };
    Some((msg, payload))
}

/// Receive the next message that is not a Status update.
fn recv_non_status(stream: &mut TcpStream) -> Option<(Message, Option<Vec<u8>>)> {
    loop {
        let (msg, payload) = recv_message(stream)?;
        if !matches!(msg, Message::Status { .. }) {
            return Some((msg, payload));
        }
    }
}

fn send_message(stream: &mut TcpStream, msg: &Message, payload: Option<&[u8]>) {
    write_frame(stream, &msg.encode(payload.is_some())).expect("stub send failed");
    if let Some(payload) = payload {
        write_frame(stream, payload).expect("stub payload send failed");
    }
}

/// Accept a client and validate the handshake; returns the advertised count.
fn expect_handshake(stream: &mut TcpStream) -> u32 {
    match recv_message(stream) {
        Some((
            Message::Connection {
                protocol_version,
                num_jobs_available,
                ..
            },
            None,
        )) => {
            assert_eq!(protocol_version, PROTOCOL_VERSION);
            num_jobs_available
        }
        other => panic!("expected Connection handshake, got {:?}", other),
    }
}

fn success_result(job_id: u32, node_name: &str, object: &[u8]) -> JobResultBlob {
    JobResultBlob {
        job_id,
        node_name: node_name.to_string(),
        success: true,
        system_error: false,
        messages: Vec::new(),
        build_time_ms: 120,
        output: MultiBuffer::pack(&[object]),
    }
}

// ---- scenarios ------------------------------------------------------------

#[test]
fn test_jobs_flow_to_worker_and_outputs_commit() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let dir = tempdir().unwrap();

    let queue = make_queue(3, dir.path());
    let manifests = make_manifests();

    let worker = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        expect_handshake(&mut stream);

        let mut done = 0u32;
        while done < 3 {
            send_message(&mut stream, &Message::RequestJob, None);
            match recv_non_status(&mut stream) {
                Some((Message::Job { tool_id }, Some(payload))) => {
                    assert_eq!(tool_id, TOOL_ID);
                    let job = Job::deserialize(&payload).unwrap();

                    if done == 0 {
                        // sync the toolchain for the first job
                        send_message(&mut stream, &Message::RequestManifest { tool_id }, None);
                        match recv_non_status(&mut stream) {
                            Some((Message::Manifest { tool_id }, Some(meta))) => {
                                assert_eq!(tool_id, TOOL_ID);
                                let (id, files) =
                                    ToolManifest::deserialize_metadata(&meta).unwrap();
                                assert_eq!(id, TOOL_ID);
                                assert_eq!(files.len(), 1);
                            }
                            other => panic!("expected Manifest, got {:?}", other),
                        }
                        send_message(
                            &mut stream,
                            &Message::RequestFile {
                                tool_id,
                                file_id: 0,
                            },
                            None,
                        );
                        match recv_non_status(&mut stream) {
                            Some((Message::File { file_id, .. }, Some(data))) => {
                                assert_eq!(file_id, 0);
                                assert_eq!(data, vec![0xAA; 16]);
                            }
                            other => panic!("expected File, got {:?}", other),
                        }
                    }

                    let object = format!("object-{}", job.id());
                    let result = success_result(job.id(), job.node_name(), object.as_bytes());
                    send_message(&mut stream, &Message::JobResult, Some(&result.encode()));
                    done += 1;
                }
                Some((Message::NoJobAvailable, None)) => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                other => panic!("unexpected message {:?}", other),
            }
        }
        // linger until the client closes
        while recv_message(&mut stream).is_some() {}
    });

    let cache = Arc::new(NullCache::new());
    let ctx = DistribContext {
        queue: Arc::clone(&queue) as Arc<dyn crate::job::JobQueue>,
        manifests,
        cache: Arc::clone(&cache) as Arc<dyn crate::cache::CompileCache>,
        cache_write: true,
        monitor: None,
    };
    let mut distributor =
        Distributor::start(&[format!("127.0.0.1:{}", port)], &[], test_config(), ctx).unwrap();

    assert!(
        wait_until(Duration::from_secs(15), || queue.successful_count() == 3),
        "expected 3 successful jobs, got {} ({} failed)",
        queue.successful_count(),
        queue.failed_count()
    );

    for i in 0..3 {
        let path = dir.path().join(format!("obj{}.o", i));
        assert_eq!(
            std::fs::read(&path).unwrap(),
            format!("object-{}", i).into_bytes()
        );
    }

    // every successful object was offered to the cache
    assert_eq!(cache.store_count(), 3);

    distributor.shutdown();
    worker.join().unwrap();
}

#[test]
fn test_disconnect_returns_inflight_jobs() {
    let l1 = TcpListener::bind("127.0.0.1:0").unwrap();
    let l2 = TcpListener::bind("127.0.0.1:0").unwrap();
    let p1 = l1.local_addr().unwrap().port();
    let p2 = l2.local_addr().unwrap().port();
    let dir = tempdir().unwrap();

    let queue = make_queue(4, dir.path());
    let manifests = make_manifests();
    let monitor_path = dir.path().join("monitor.log");
    let monitor = Arc::new(Monitor::create_at(&monitor_path).unwrap());

    // w2 stays passive until w1 has dropped with a job in flight
    let w1_dropped = Arc::new(AtomicBool::new(false));

    let w1_gate = Arc::clone(&w1_dropped);
    let w1 = std::thread::spawn(move || {
        let (mut stream, _) = l1.accept().unwrap();
        expect_handshake(&mut stream);

        // take two jobs
        let mut jobs = Vec::new();
        while jobs.len() < 2 {
            send_message(&mut stream, &Message::RequestJob, None);
            match recv_non_status(&mut stream) {
                Some((Message::Job { .. }, Some(payload))) => {
                    jobs.push(Job::deserialize(&payload).unwrap());
                }
                Some((Message::NoJobAvailable, None)) => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                other => panic!("unexpected message {:?}", other),
            }
        }

        // finish the first, drop with the second still in flight
        let first = &jobs[0];
        let result = success_result(first.id(), first.node_name(), b"w1-object");
        send_message(&mut stream, &Message::JobResult, Some(&result.encode()));
        drop(stream);
        std::thread::sleep(Duration::from_millis(50));
        w1_gate.store(true, Ordering::Release);
        jobs[1].id()
    });

    let w2_gate = Arc::clone(&w1_dropped);
    let w2 = std::thread::spawn(move || {
        let (mut stream, _) = l2.accept().unwrap();
        expect_handshake(&mut stream);
        while !w2_gate.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(10));
        }
        loop {
            send_message(&mut stream, &Message::RequestJob, None);
            match recv_non_status(&mut stream) {
                Some((Message::Job { .. }, Some(payload))) => {
                    let job = Job::deserialize(&payload).unwrap();
                    let result = success_result(job.id(), job.node_name(), b"w2-object");
                    send_message(&mut stream, &Message::JobResult, Some(&result.encode()));
                }
                Some((Message::NoJobAvailable, None)) => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                _ => return, // client shut down
            }
        }
    });

    let workers = vec![format!("127.0.0.1:{}", p1), format!("127.0.0.1:{}", p2)];
    let mut distributor = Distributor::start(
        &workers,
        &[],
        test_config(),
        test_ctx(Arc::clone(&queue), manifests, Some(monitor)),
    )
    .unwrap();

    let core = Arc::clone(distributor.core());
    assert!(
        wait_until(Duration::from_secs(20), || {
            // at-most-one assignment must hold at every observable instant
            let mut seen = std::collections::HashSet::new();
            for server in core.server_states() {
                for job in server.lock().jobs.iter() {
                    assert!(seen.insert(job.id()), "job {} assigned twice", job.id());
                }
            }
            queue.successful_count() == 4
        }),
        "expected 4 successful jobs, got {}",
        queue.successful_count()
    );

    // the dropped worker's in-flight job went back through the queue
    assert_eq!(queue.pending_count(), 0);
    for server in core.server_states() {
        assert!(server.lock().jobs.is_empty());
    }

    let returned_id = w1.join().unwrap();
    let monitor_text = std::fs::read_to_string(&monitor_path).unwrap();
    assert!(
        monitor_text.contains("FINISH_JOB TIMEOUT"),
        "missing timeout line in monitor output:\n{}",
        monitor_text
    );
    queue.with_completed(|completed| {
        assert!(completed
            .iter()
            .any(|c| c.job.id() == returned_id && c.success));
    });

    distributor.shutdown();
    w2.join().unwrap();
}

#[test]
fn test_system_error_blacklists_and_caps_retries() {
    let dir = tempdir().unwrap();
    let queue = make_queue(1, dir.path());
    let manifests = make_manifests();

    let mut worker_names = Vec::new();
    let mut handles = Vec::new();
    let errors_sent = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        worker_names.push(format!("127.0.0.1:{}", listener.local_addr().unwrap().port()));
        let errors = Arc::clone(&errors_sent);
        handles.push(std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            expect_handshake(&mut stream);
            loop {
                send_message(&mut stream, &Message::RequestJob, None);
                match recv_non_status(&mut stream) {
                    Some((Message::Job { .. }, Some(payload))) => {
                        let job = Job::deserialize(&payload).unwrap();
                        let result = JobResultBlob {
                            job_id: job.id(),
                            node_name: job.node_name().to_string(),
                            success: false,
                            system_error: true,
                            messages: vec!["error: toolchain exploded".into()],
                            build_time_ms: 0,
                            output: Vec::new(),
                        };
                        send_message(&mut stream, &Message::JobResult, Some(&result.encode()));
                        errors.fetch_add(1, Ordering::AcqRel);
                    }
                    Some((Message::NoJobAvailable, None)) => {
                        std::thread::sleep(Duration::from_millis(20));
                    }
                    _ => return,
                }
            }
        }));
    }

    let mut distributor = Distributor::start(
        &worker_names,
        &[],
        test_config(),
        test_ctx(Arc::clone(&queue), manifests, None),
    )
    .unwrap();

    assert!(
        wait_until(Duration::from_secs(20), || queue.failed_count() == 1),
        "expected the job to fail after the retry cap, errors sent: {}",
        errors_sent.load(Ordering::Acquire)
    );

    // reported by three distinct workers, not re-queued
    assert_eq!(errors_sent.load(Ordering::Acquire), 3);
    assert_eq!(queue.pending_count(), 0);
    assert_eq!(queue.successful_count(), 0);
    queue.with_completed(|completed| {
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].job.system_error_count(), 3);
        assert!(completed[0]
            .job
            .messages()
            .iter()
            .any(|m| m.contains("3 different workers")));
    });

    // every offending worker is blacklisted
    for server in distributor.core().server_states() {
        assert!(!server.build_enabled());
    }

    distributor.shutdown();
    for handle in handles {
        handle.join().unwrap();
    }
}

/// Worker-side status source for the control stubs.
struct StubProbe {
    busy: AtomicU32,
}

impl ResourceProbe for StubProbe {
    fn status(&self, details: bool) -> WorkerStatus {
        let busy = self.busy.load(Ordering::Acquire) as u16;
        let total = 8u16;
        let mut status = WorkerStatus {
            mode: WorkerMode::Dedicated,
            num_clients: 1,
            num_cpus_total: total,
            num_cpus_idle: total - busy,
            num_cpus_busy: busy,
            num_blocking_processes: 0,
            cpu_usage_self: busy as f32 * 100.0 / total as f32,
            cpu_usage_total: 55.0,
            slots: Vec::new(),
        };
        if details {
            for i in 0..total {
                status.slots.push(CpuDetail {
                    idle: i >= busy,
                    busy: i < busy,
                    host_name: if i < busy { "clientA".into() } else { String::new() },
                    job_status: if i < busy { "obj/file.o".into() } else { String::new() },
                });
            }
        }
        status
    }
}

fn serve_info(stream: &mut TcpStream, probe: &StubProbe) {
    loop {
        match recv_message(stream) {
            Some((Message::RequestServerInfo { details_level }, None)) => {
                let status = probe.status(details_level >= 2);
                let msg = Message::ServerInfo {
                    mode: status.mode as u8,
                    num_clients: status.num_clients,
                    num_cpus_total: status.num_cpus_total,
                    num_cpus_idle: status.num_cpus_idle,
                    num_cpus_busy: status.num_cpus_busy,
                    num_blocking_processes: status.num_blocking_processes,
                    cpu_usage_self: status.cpu_usage_self,
                    cpu_usage_total: status.cpu_usage_total,
                };
                if status.slots.is_empty() {
                    send_message(stream, &msg, None);
                } else {
                    let details = encode_server_info_details(&status.slots);
                    send_message(stream, &msg, Some(&details));
                }
                // each served request frees a CPU, so wait-idle converges
                let busy = probe.busy.load(Ordering::Acquire);
                if busy > 0 {
                    probe.busy.store(busy - 1, Ordering::Release);
                }
            }
            Some((Message::Status { .. }, _)) => continue,
            Some((Message::SetMode { .. }, None))
            | Some((Message::AddBlockingProcess { .. }, None))
            | Some((Message::RemoveBlockingProcess { .. }, None)) => continue,
            _ => return,
        }
    }
}

#[test]
fn test_control_info_roundtrip() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let name = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    let dir = tempdir().unwrap();

    let worker = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        assert_eq!(expect_handshake(&mut stream), 0); // control-only: no jobs
        let probe = StubProbe {
            busy: AtomicU32::new(2),
        };
        serve_info(&mut stream, &probe);
    });

    let queue = Arc::new(InMemoryJobQueue::new());
    let mut distributor = Distributor::start(
        &[],
        &[name.clone()],
        test_config(),
        test_ctx(queue, make_manifests(), None),
    )
    .unwrap();
    let core = Arc::clone(distributor.core());

    assert!(wait_until(Duration::from_secs(10), || {
        core.server_states()[0].is_connected()
    }));

    core.workers_request_info(&[name.clone()], 2);
    assert!(core.wait_last_command_result());
    assert_eq!(core.pending_counters(), (0, 0));

    let states = core.server_states();
    assert_eq!(states.len(), 1);
    {
        let inner = states[0].lock();
        assert!(inner.control_success);
        let info = inner.info.as_ref().expect("missing info snapshot");
        assert_eq!(info.num_cpus_total, 8);
        assert_eq!(info.details.len(), 8);
    }

    // table render carries the worker row
    let (text, aggregates) = core.render_info(1);
    assert!(text.contains(&name));
    assert!(text.contains("dedicated"));
    assert_eq!(aggregates.reporting, 1);
    assert_eq!(aggregates.cpu_total, 8);

    // json render parses and mirrors the scalars
    let (json_text, _) = core.render_info(-2);
    let rows: serde_json::Value = serde_json::from_str(&json_text).unwrap();
    assert_eq!(rows[0]["worker"], serde_json::json!(name));
    assert_eq!(rows[0]["mode"], serde_json::json!("dedicated"));
    assert_eq!(rows[0]["cpu_total"], serde_json::json!(8));
    assert!(rows[0]["jobs"].as_array().is_some());

    // a second round-trip without details leaves the detail arrays empty
    core.workers_request_info(&[name.clone()], 0);
    assert!(core.wait_last_command_result());
    {
        let states = core.server_states();
        let inner = states[0].lock();
        assert!(inner.info.as_ref().unwrap().details.is_empty());
    }

    distributor.shutdown();
    worker.join().unwrap();
}

#[test]
fn test_wait_idle_polls_until_quiet() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let name = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());

    let worker = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        expect_handshake(&mut stream);
        let probe = StubProbe {
            busy: AtomicU32::new(3),
        };
        serve_info(&mut stream, &probe);
    });

    let queue = Arc::new(InMemoryJobQueue::new());
    let mut distributor = Distributor::start(
        &[],
        &[name.clone()],
        test_config(),
        test_ctx(queue, make_manifests(), None),
    )
    .unwrap();
    let core = Arc::clone(distributor.core());

    assert!(wait_until(Duration::from_secs(10), || {
        core.server_states()[0].is_connected()
    }));

    // three busy CPUs, one freed per info round: converges, returns true
    assert!(core.workers_wait_idle(&[name.clone()], 30, 0));
    let (_, aggregates) = core.render_info(0);
    assert_eq!(aggregates.cpu_busy, 0);

    distributor.shutdown();
    worker.join().unwrap();
}

#[test]
fn test_command_timeout_marks_failure_and_rebalances_counters() {
    // allocate a port with nothing listening on it
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let name = format!("127.0.0.1:{}", dead_port);

    let mut config = test_config();
    config.command_timeout = Duration::from_millis(300);

    let queue = Arc::new(InMemoryJobQueue::new());
    let mut distributor = Distributor::start(
        &[],
        &[name.clone()],
        config,
        test_ctx(queue, make_manifests(), None),
    )
    .unwrap();
    let core = Arc::clone(distributor.core());

    core.workers_set_mode(&[name.clone()], WorkerMode::Disabled, 0);
    // counter integrity: pending equals the flag population while pending
    let states = core.server_states();
    let flagged = states
        .iter()
        .filter(|s| s.lock().control_pending_send)
        .count() as u32;
    assert_eq!(core.pending_counters().0, flagged);

    // the worker never connects, so the command times out as a failure
    assert!(!core.wait_last_command_result());
    assert_eq!(core.pending_counters(), (0, 0));
    {
        let states = core.server_states();
        let inner = states[0].lock();
        assert!(inner.control_failure);
        assert!(!inner.control_pending_send);
        assert!(!inner.control_pending_response);
    }

    distributor.shutdown();
}

#[test]
fn test_status_updates_track_queue_count() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let name = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    let dir = tempdir().unwrap();

    let (status_tx, status_rx) = mpsc::channel();
    let worker = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let advertised = expect_handshake(&mut stream);
        status_tx.send(advertised).unwrap();
        while let Some((msg, _)) = recv_message(&mut stream) {
            if let Message::Status { num_jobs_available } = msg {
                if status_tx.send(num_jobs_available).is_err() {
                    return;
                }
            }
        }
    });

    let queue = Arc::new(InMemoryJobQueue::new());
    let mut distributor = Distributor::start(
        &[name],
        &[],
        test_config(),
        test_ctx(Arc::clone(&queue), make_manifests(), None),
    )
    .unwrap();

    // handshake advertises the (empty) queue
    assert_eq!(status_rx.recv_timeout(Duration::from_secs(10)).unwrap(), 0);

    // new work triggers a Status with the new count
    let outputs = JobOutputs {
        object: dir.path().join("late.o"),
        pdb: None,
        analysis_xml: None,
    };
    queue.push_job(Job::new(50, "obj/late.o", TOOL_ID, outputs));
    queue.push_job(Job::new(51, "obj/later.o", TOOL_ID, JobOutputs::default()));
    // the count may be observed mid-push; the final advertised value is 2
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let count = status_rx.recv_timeout(remaining).expect("no Status update");
        assert!(count <= 2);
        if count == 2 {
            break;
        }
    }

    distributor.shutdown();
    worker.join().unwrap();
}

#[test]
fn test_failed_connect_sets_cooldown() {
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let name = format!("127.0.0.1:{}", dead_port);

    let mut config = test_config();
    config.connect_timeout = Duration::from_millis(300);
    config.reconnect_delay = Duration::from_millis(500);

    // core without a running loop thread, driven by hand
    let queue: Arc<InMemoryJobQueue> = Arc::new(InMemoryJobQueue::new());
    let core = Arc::new(DistribCore {
        config,
        servers: Mutex::new(vec![Arc::new(super::state::ServerState::new(
            WorkerEndpoint::parse(&name, PROTOCOL_PORT),
            true,
            false,
        ))]),
        pool: ConnectionPool::new(),
        ctx: test_ctx(queue, make_manifests(), None),
        should_exit: AtomicBool::new(false),
        pending_send_total: AtomicU32::new(0),
        pending_receive_total: AtomicU32::new(0),
        control: Mutex::new(None),
        status_timer: Mutex::new(Instant::now()),
    });

    // first pass attempts and fails, starting the cooldown
    core.look_for_workers();
    let first_failure = {
        let states = core.server_states();
        let inner = states[0].lock();
        inner.last_connect_failure.expect("no failure recorded")
    };

    // within the cooldown no further attempt happens: the timestamp is
    // untouched by another pass
    core.look_for_workers();
    {
        let states = core.server_states();
        let inner = states[0].lock();
        assert_eq!(inner.last_connect_failure, Some(first_failure));
    }

    // once the cooldown has elapsed the entry is attempted again
    std::thread::sleep(Duration::from_millis(700));
    core.look_for_workers();
    {
        let states = core.server_states();
        let inner = states[0].lock();
        let retried = inner.last_connect_failure.expect("no failure recorded");
        assert!(retried > first_failure);
    }
}

#[test]
fn test_worker_table_order_and_capabilities() {
    let queue: Arc<InMemoryJobQueue> = Arc::new(InMemoryJobQueue::new());
    let mut distributor = Distributor::start(
        &["b1".to_string(), "b2".to_string(), "shared".to_string()],
        &["shared".to_string(), "c1".to_string()],
        test_config(),
        test_ctx(queue, make_manifests(), None),
    )
    .unwrap();

    let states = distributor.core().server_states();
    let names: Vec<&str> = states.iter().map(|s| s.name()).collect();
    // build workers precede control-only workers, deduplicated
    assert_eq!(names, vec!["b1", "b2", "shared", "c1"]);

    assert!(states[0].build_enabled() && !states[0].control_enabled);
    assert!(states[1].build_enabled() && !states[1].control_enabled);
    assert!(states[2].build_enabled() && states[2].control_enabled);
    assert!(!states[3].build_enabled() && states[3].control_enabled);

    distributor.shutdown();
}

/// Paths used by the queue builder are absolute so extraction lands in the
/// tempdir regardless of the test's working directory.
#[test]
fn test_queue_outputs_are_absolute() {
    let dir = tempdir().unwrap();
    let queue = make_queue(1, dir.path());
    let job = queue.acquire_distributable_job().unwrap();
    assert!(job.outputs().object.is_absolute());
}
