//! Reusable test harness for mhist integration tests.
//!
//! Spawns the real binary in session-runtime mode inside an isolated
//! endpoint directory (via XDG_RUNTIME_DIR) and speaks the framed wire
//! protocol over a Unix socket.

#![allow(dead_code)]

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use tempfile::TempDir;

// ── Message kinds (must match the binary) ───────────────────────────

pub const MSG_DATA: u8 = 0x01;
pub const MSG_RESIZE: u8 = 0x02;
pub const MSG_DETACH: u8 = 0x03;
pub const MSG_KILL: u8 = 0x04;
pub const MSG_HISTORY_REQUEST: u8 = 0x05;
pub const MSG_HISTORY_RESPONSE: u8 = 0x06;

pub const HISTORY_FROM_END: u32 = 0x8000_0000;

pub const CLEAR_SCREEN: &[u8] = b"\x1b[2J\x1b[H";

// ── Frame encoding ──────────────────────────────────────────────────

pub fn encode_message(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.push(kind);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub struct Frame {
    pub kind: u8,
    pub payload: Vec<u8>,
}

// ── SessionHandle ───────────────────────────────────────────────────

/// Handle to a running session process. Kills it and removes the
/// temporary runtime directory on drop.
pub struct SessionHandle {
    pub child: Child,
    pub runtime_dir: TempDir,
    pub socket_path: PathBuf,
    pub info_path: PathBuf,
    pub id: String,
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl SessionHandle {
    /// Wait for the session process to exit on its own.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> Option<std::process::ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Some(status);
            }
            if Instant::now() > deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

/// Spawn a session running `/bin/sh`.
pub fn spawn_session() -> io::Result<SessionHandle> {
    spawn_session_with_shell("/bin/sh")
}

/// Spawn a session whose child is `shell` instead of a real shell.
/// `/bin/cat` is handy: it emits nothing until it is fed input.
pub fn spawn_session_with_shell(shell: &str) -> io::Result<SessionHandle> {
    let bin = PathBuf::from(env!("CARGO_BIN_EXE_mhist"));
    let runtime_dir = tempfile::tempdir()?;
    let id = format!("test{:08x}", rand_u32());

    let endpoint_dir = runtime_dir.path().join("mhist");
    let socket_path = endpoint_dir.join(format!("{}.sock", id));
    let info_path = endpoint_dir.join(format!("{}.json", id));

    let child = Command::new(&bin)
        .arg(format!("--session-id={}", id))
        .arg(format!("--name={}", id))
        .env("XDG_RUNTIME_DIR", runtime_dir.path())
        .env("SHELL", shell)
        .spawn()?;

    // Wait for the socket to appear
    let deadline = Instant::now() + Duration::from_secs(5);
    while !socket_path.exists() {
        if Instant::now() > deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "session socket did not appear within 5 seconds",
            ));
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    // Brief delay to let the acceptor start
    std::thread::sleep(Duration::from_millis(50));

    Ok(SessionHandle {
        child,
        runtime_dir,
        socket_path,
        info_path,
        id,
    })
}

/// Connect to a session's Unix socket.
pub fn connect(socket_path: &Path) -> io::Result<SocketClient> {
    let stream = UnixStream::connect(socket_path)?;
    Ok(SocketClient::new(stream))
}

/// Read and parse the session info JSON file.
pub fn read_info_json(info_path: &Path) -> io::Result<serde_json::Value> {
    let content = fs::read_to_string(info_path)?;
    serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

// ── SocketClient ────────────────────────────────────────────────────

/// Client wrapper for a connected Unix socket with frame-level
/// send/receive.
pub struct SocketClient {
    stream: UnixStream,
    read_buf: Vec<u8>,
}

impl SocketClient {
    pub fn new(stream: UnixStream) -> Self {
        stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }

    pub fn send_message(&mut self, kind: u8, payload: &[u8]) -> io::Result<()> {
        self.stream.write_all(&encode_message(kind, payload))
    }

    /// Send raw terminal input to the shell.
    pub fn send_data(&mut self, data: &[u8]) -> io::Result<()> {
        self.send_message(MSG_DATA, data)
    }

    pub fn send_resize(&mut self, rows: u16, cols: u16) -> io::Result<()> {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&rows.to_be_bytes());
        payload.extend_from_slice(&cols.to_be_bytes());
        self.send_message(MSG_RESIZE, &payload)
    }

    pub fn send_detach(&mut self) -> io::Result<()> {
        self.send_message(MSG_DETACH, &[])
    }

    pub fn send_kill(&mut self) -> io::Result<()> {
        self.send_message(MSG_KILL, &[])
    }

    /// `offset` is sent raw; OR in HISTORY_FROM_END for from-end requests.
    pub fn send_history_request(&mut self, offset: u32, count: u32) -> io::Result<()> {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&offset.to_be_bytes());
        payload.extend_from_slice(&count.to_be_bytes());
        self.send_message(MSG_HISTORY_REQUEST, &payload)
    }

    /// Read the next frame. None on timeout or disconnect.
    pub fn recv_frame(&mut self) -> Option<Frame> {
        self.recv_frame_deadline(Instant::now() + Duration::from_secs(5))
    }

    fn recv_frame_deadline(&mut self, deadline: Instant) -> Option<Frame> {
        loop {
            // Try to parse a complete frame from the buffer
            if self.read_buf.len() >= 5 {
                let length = u32::from_be_bytes([
                    self.read_buf[1],
                    self.read_buf[2],
                    self.read_buf[3],
                    self.read_buf[4],
                ]) as usize;
                if self.read_buf.len() >= 5 + length {
                    let kind = self.read_buf[0];
                    let payload = self.read_buf[5..5 + length].to_vec();
                    self.read_buf.drain(..5 + length);
                    return Some(Frame { kind, payload });
                }
            }

            if Instant::now() > deadline {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.stream
                .set_read_timeout(Some(remaining.max(Duration::from_millis(50))))
                .ok();

            let mut buf = [0u8; 65536];
            match self.stream.read(&mut buf) {
                Ok(0) => return None, // disconnected
                Ok(n) => self.read_buf.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(_) => return None,
            }
        }
    }

    /// Wait for a frame of a specific kind, discarding others.
    pub fn wait_for(&mut self, kind: u8, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.recv_frame_deadline(deadline) {
                Some(frame) if frame.kind == kind => return Some(frame),
                Some(_) => continue,
                None => return None,
            }
        }
    }

    /// Collect every frame that arrives within `timeout`.
    pub fn collect_frames(&mut self, timeout: Duration) -> Vec<Frame> {
        let deadline = Instant::now() + timeout;
        let mut frames = Vec::new();
        while let Some(frame) = self.recv_frame_deadline(deadline) {
            frames.push(frame);
        }
        frames
    }

    /// Concatenated DATA payloads received within `timeout`.
    pub fn collect_data(&mut self, timeout: Duration) -> Vec<u8> {
        self.collect_frames(timeout)
            .iter()
            .filter(|f| f.kind == MSG_DATA)
            .flat_map(|f| f.payload.clone())
            .collect()
    }

    /// Keep reading until the collected DATA contains `needle`.
    pub fn wait_for_output(&mut self, needle: &[u8], timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut data = Vec::new();
        loop {
            if data
                .windows(needle.len().max(1))
                .any(|w| w == needle)
            {
                return Some(data);
            }
            match self.recv_frame_deadline(deadline) {
                Some(frame) if frame.kind == MSG_DATA => data.extend_from_slice(&frame.payload),
                Some(_) => continue,
                None => return None,
            }
        }
    }
}

/// HISTORY_RESPONSE payload split into `(start, total, data)`.
pub fn split_history_response(payload: &[u8]) -> (u32, u32, Vec<u8>) {
    assert!(payload.len() >= 8, "history response shorter than header");
    let start = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let total = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    (start, total, payload[8..].to_vec())
}

/// Simple random u32 for unique session ids.
fn rand_u32() -> u32 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    Instant::now().hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);
    hasher.finish() as u32
}
