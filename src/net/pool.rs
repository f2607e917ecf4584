//! Outgoing TCP connection pool.
//!
//! Each live connection owns one reader thread that reassembles
//! length-prefixed frames and hands them to the pool listener. Frames queued
//! by different threads never interleave: a send locks the connection's
//! writer for the whole frame (or header+payload pair).

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{FbuildError, Result};

/// Upper bound on a single frame; anything larger is treated as a protocol
/// violation and drops the connection.
pub const MAX_FRAME_SIZE: u32 = 256 * 1024 * 1024;

/// Callbacks invoked from reader threads. Implementations must only hold
/// internal locks briefly; the reader thread is the sole delivery path for
/// its connection.
pub trait PoolListener: Send + Sync + 'static {
    fn on_receive(&self, conn: &Arc<Connection>, frame: Vec<u8>);
    fn on_disconnected(&self, conn: &Arc<Connection>);
}

/// One live TCP connection.
pub struct Connection {
    peer: String,
    user_index: usize,
    writer: Mutex<TcpStream>,
    alive: AtomicBool,
}

impl Connection {
    /// Peer display name (`host:port` as configured).
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Opaque index the pool user attached at connect time.
    pub fn user_index(&self) -> usize {
        self.user_index
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Send one frame.
    pub fn send(&self, frame: &[u8]) -> Result<()> {
        self.write_frames(&[frame])
    }

    /// Send a message frame immediately followed by its payload frame.
    /// The pair is written under one lock so no other frame can interleave.
    pub fn send_with_payload(&self, frame: &[u8], payload: &[u8]) -> Result<()> {
        self.write_frames(&[frame, payload])
    }

    fn write_frames(&self, frames: &[&[u8]]) -> Result<()> {
        if !self.is_alive() {
            return Err(FbuildError::Worker(format!(
                "connection to {} is closed",
                self.peer
            )));
        }
        let mut stream = self
            .writer
            .lock()
            .map_err(|_| FbuildError::Worker("connection writer poisoned".into()))?;
        for frame in frames {
            let len = frame.len() as u32;
            stream.write_all(&len.to_ne_bytes())?;
            stream.write_all(frame)?;
        }
        stream.flush()?;
        Ok(())
    }

    /// Close both directions; the reader thread will observe EOF and fire
    /// the disconnect callback.
    pub fn close(&self) {
        self.alive.store(false, Ordering::Release);
        if let Ok(stream) = self.writer.lock() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Pool of outgoing connections with per-connection reader threads.
pub struct ConnectionPool {
    connections: Mutex<Vec<(Arc<Connection>, Option<JoinHandle<()>>)>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Connect to `host:port` with a timeout. On success the connection is
    /// registered and a reader thread starts delivering frames to
    /// `listener`.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
        user_index: usize,
        listener: Arc<dyn PoolListener>,
    ) -> Result<Arc<Connection>> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| FbuildError::Worker(format!("cannot resolve worker '{}'", host)))?;

        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        let read_stream = stream.try_clone()?;

        let conn = Arc::new(Connection {
            peer: format!("{}:{}", host, port),
            user_index,
            writer: Mutex::new(stream),
            alive: AtomicBool::new(true),
        });

        let thread_conn = Arc::clone(&conn);
        let handle = std::thread::Builder::new()
            .name(format!("pool-recv-{}", user_index))
            .spawn(move || {
                receive_loop(read_stream, &thread_conn, &listener);
                thread_conn.alive.store(false, Ordering::Release);
                listener.on_disconnected(&thread_conn);
            })
            .map_err(|e| FbuildError::Worker(format!("failed to spawn reader thread: {}", e)))?;

        let mut connections = self
            .connections
            .lock()
            .map_err(|_| FbuildError::Worker("connection pool poisoned".into()))?;
        // Reap entries whose reader has already exited
        connections.retain_mut(|(c, h)| {
            if !c.is_alive() {
                if let Some(h) = h.take() {
                    let _ = h.join();
                }
                false
            } else {
                true
            }
        });
        connections.push((Arc::clone(&conn), Some(handle)));

        Ok(conn)
    }

    /// Close every connection and wait for all reader threads to drain.
    pub fn shutdown(&self) {
        let entries = {
            let mut connections = match self.connections.lock() {
                Ok(c) => c,
                Err(_) => return,
            };
            std::mem::take(&mut *connections)
        };
        for (conn, _) in &entries {
            conn.close();
        }
        for (_, handle) in entries {
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive_loop(mut stream: TcpStream, conn: &Arc<Connection>, listener: &Arc<dyn PoolListener>) {
    loop {
        let mut len_bytes = [0u8; 4];
        if stream.read_exact(&mut len_bytes).is_err() {
            trace!(peer = conn.peer(), "connection closed");
            return;
        }
        let len = u32::from_ne_bytes(len_bytes);
        if len == 0 || len > MAX_FRAME_SIZE {
            debug!(peer = conn.peer(), len, "invalid frame length, dropping connection");
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        let mut frame = vec![0u8; len as usize];
        if stream.read_exact(&mut frame).is_err() {
            debug!(peer = conn.peer(), "connection dropped mid-frame");
            return;
        }
        listener.on_receive(conn, frame);
    }
}

/// Frame helpers for the peer side of a pool connection. The distribution
/// tests' stub workers speak the same length-prefixed framing over a plain
/// `TcpStream`.
#[cfg(test)]
pub fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    if let Err(e) = stream.read_exact(&mut len_bytes) {
        return match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Ok(None),
            _ => Err(e),
        };
    }
    let len = u32::from_ne_bytes(len_bytes);
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "invalid frame length",
        ));
    }
    let mut frame = vec![0u8; len as usize];
    stream.read_exact(&mut frame)?;
    Ok(Some(frame))
}

/// Write one length-prefixed frame. See [`read_frame`].
#[cfg(test)]
pub fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(frame.len() as u32).to_ne_bytes())?;
    stream.write_all(frame)?;
    stream.flush()
}
