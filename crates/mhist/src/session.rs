//! Session runtime: the detached process that owns the PTY, the child
//! shell, and both scrollback structures, and serves at most one attached
//! front-end over a Unix socket.
//!
//! Three activities run concurrently until the shell exits or a
//! termination signal fires: the PTY reader (fans output into the
//! scrollback and to the attached front-end), the socket acceptor, and
//! the per-connection message reader. All frames to the front-end go
//! through a single mutex so they are never interleaved byte-wise.

use std::env;
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::process;
use std::ptr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::io::Ready;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::buffer::{ReplayRing, Scrollback, LINE_CAPACITY, REPLAY_CAPACITY};
use crate::protocol::{
    self, Message, HISTORY_FROM_END, MSG_DATA, MSG_DETACH, MSG_HISTORY_REQUEST, MSG_KILL,
    MSG_RESIZE,
};
use crate::terminal::CLEAR_SCREEN;

/// Upper bound on a single PTY read.
const PTY_CHUNK: usize = 4096;

// ── Errors ──────────────────────────────────────────────────────────

/// Setup failures. Each start step that fails unwinds the earlier ones
/// before this is returned.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("start pty: {0}")]
    StartPty(#[source] io::Error),

    #[error("create socket dir: {0}")]
    CreateDir(#[source] io::Error),

    #[error("listen socket: {0}")]
    Listen(#[source] io::Error),

    #[error("write info file: {0}")]
    WriteInfo(#[source] io::Error),
}

// ── Metadata ────────────────────────────────────────────────────────

/// Session metadata persisted next to the socket so `ls`/`attach` can
/// enumerate sessions and probe liveness.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub pid: i32,
    pub created: String,
    pub socket: PathBuf,
}

/// Directory holding session sockets, info files, and logs.
pub fn socket_dir() -> PathBuf {
    match env::var("XDG_RUNTIME_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir).join("mhist"),
        _ => PathBuf::from(format!("/tmp/mhist-{}", unsafe { libc::getuid() })),
    }
}

/// Create the endpoint directory with owner-only access.
pub fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
}

// ── Shared state ────────────────────────────────────────────────────

struct Shared {
    scrollback: Scrollback,
    replay: ReplayRing,
    /// Last rows received in a RESIZE; 0 until the first one arrives.
    last_rows: u16,
}

struct ActiveClient {
    writer: OwnedWriteHalf,
    conn_id: u64,
}

/// The at-most-one front-end slot. Holding the lock while writing keeps
/// frames atomic across the PTY reader and the history handler.
type ClientSlot = Arc<Mutex<Option<ActiveClient>>>;

// ── Session ─────────────────────────────────────────────────────────

pub struct Session {
    id: String,
    master: OwnedFd,
    child_pid: libc::pid_t,
    listener: UnixListener,
    socket_path: PathBuf,
    info_path: PathBuf,
}

impl Session {
    /// Spawn the shell under a fresh PTY, bind the socket, and write the
    /// metadata file. Call from inside a tokio runtime; the listener
    /// registers with the reactor.
    pub fn start(id: &str, name: &str, shell: Option<&str>) -> Result<Session, SessionError> {
        let shell = shell
            .map(str::to_owned)
            .filter(|s| !s.is_empty())
            .or_else(|| env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/sh".to_string());

        let (master, child_pid) = spawn_shell(&shell).map_err(SessionError::StartPty)?;

        let dir = socket_dir();
        if let Err(err) = create_private_dir(&dir) {
            kill_and_reap(child_pid);
            return Err(SessionError::CreateDir(err));
        }

        let socket_path = dir.join(format!("{id}.sock"));
        let info_path = dir.join(format!("{id}.json"));

        // A stale socket from a crashed predecessor would fail the bind
        let _ = fs::remove_file(&socket_path);

        let listener = match bind_listener(&socket_path) {
            Ok(listener) => listener,
            Err(err) => {
                kill_and_reap(child_pid);
                return Err(SessionError::Listen(err));
            }
        };

        let info = SessionInfo {
            id: id.to_string(),
            name: name.to_string(),
            pid: process::id() as i32,
            created: iso8601_now(),
            socket: socket_path.clone(),
        };
        if let Err(err) = write_info_file(&info_path, &info) {
            kill_and_reap(child_pid);
            drop(listener);
            let _ = fs::remove_file(&socket_path);
            return Err(SessionError::WriteInfo(err));
        }

        Ok(Session {
            id: id.to_string(),
            master,
            child_pid,
            listener,
            socket_path,
            info_path,
        })
    }

    /// Run the session event loop until the shell exits or a termination
    /// signal arrives, then tear everything down.
    pub async fn run(self) {
        let Session {
            id,
            master,
            child_pid,
            listener,
            socket_path,
            info_path,
        } = self;

        // Non-blocking master so AsyncFd can drive it
        let raw = master.as_raw_fd();
        unsafe {
            let flags = libc::fcntl(raw, libc::F_GETFL);
            libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        let master = match AsyncFd::new(master) {
            Ok(fd) => Arc::new(fd),
            Err(err) => {
                error!("session {id}: register pty with reactor: {err}");
                kill_and_reap(child_pid);
                let _ = fs::remove_file(&socket_path);
                let _ = fs::remove_file(&info_path);
                return;
            }
        };

        let shared = Arc::new(Mutex::new(Shared {
            scrollback: Scrollback::new(LINE_CAPACITY),
            replay: ReplayRing::new(REPLAY_CAPACITY),
            last_rows: 0,
        }));
        let client: ClientSlot = Arc::new(Mutex::new(None));

        // Fatal PTY write failures reported by connection handlers
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<()>(1);

        let mut pty_task = tokio::spawn(read_pty(
            Arc::clone(&master),
            Arc::clone(&shared),
            Arc::clone(&client),
        ));

        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");

        let mut next_conn_id: u64 = 0;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let Ok((stream, _)) = result else { continue };
                    next_conn_id += 1;
                    accept_front_end(
                        stream,
                        next_conn_id,
                        &shared,
                        &client,
                        &master,
                        child_pid,
                        &fatal_tx,
                        &id,
                    )
                    .await;
                }
                _ = sigterm.recv() => {
                    info!("session {id}: received SIGTERM, shutting down");
                    unsafe { libc::kill(child_pid, libc::SIGKILL) };
                    break;
                }
                _ = sigint.recv() => {
                    info!("session {id}: received SIGINT, shutting down");
                    unsafe { libc::kill(child_pid, libc::SIGKILL) };
                    break;
                }
                _ = fatal_rx.recv() => {
                    error!("session {id}: pty write failed, shutting down");
                    unsafe { libc::kill(child_pid, libc::SIGKILL) };
                    break;
                }
                _ = &mut pty_task => {
                    info!("session {id}: shell exited");
                    break;
                }
            }
        }

        pty_task.abort();

        // Shutdown order: front-end, listener, PTY, reap, metadata files.
        client.lock().await.take();
        drop(listener);
        drop(master);
        unsafe {
            let mut status: libc::c_int = 0;
            libc::waitpid(child_pid, &mut status, 0);
        }
        let _ = fs::remove_file(&socket_path);
        let _ = fs::remove_file(&info_path);
        info!("session {id}: cleaned up");
    }
}

// ── PTY reader ──────────────────────────────────────────────────────

/// Read the PTY until EOF, feeding the scrollback structures and the
/// attached front-end. Returning signals the main loop to shut down.
async fn read_pty(
    master: Arc<AsyncFd<OwnedFd>>,
    shared: Arc<Mutex<Shared>>,
    client: ClientSlot,
) {
    let mut buf = vec![0u8; PTY_CHUNK];
    loop {
        let mut guard = match master.readable().await {
            Ok(guard) => guard,
            Err(_) => return,
        };

        let n = unsafe {
            libc::read(
                master.get_ref().as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                guard.clear_ready_matching(Ready::READABLE);
                continue;
            }
            // EIO: the slave side closed because the shell exited
            return;
        }
        if n == 0 {
            return;
        }

        let chunk = &buf[..n as usize];
        {
            let mut sh = shared.lock().await;
            sh.scrollback.write(chunk);
            sh.replay.append(chunk);
        }
        send_to_front_end(&client, &Message::data(chunk.to_vec())).await;
    }
}

// ── Acceptor ────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn accept_front_end(
    stream: UnixStream,
    conn_id: u64,
    shared: &Arc<Mutex<Shared>>,
    client: &ClientSlot,
    master: &Arc<AsyncFd<OwnedFd>>,
    child_pid: libc::pid_t,
    fatal_tx: &mpsc::Sender<()>,
    id: &str,
) {
    let (reader, mut writer) = stream.into_split();

    {
        let mut slot = client.lock().await;
        if slot.is_some() {
            // First front-end wins; tell the newcomer why and hang up
            drop(slot);
            let reject = Message::data(b"session already attached\r\n".to_vec());
            let _ = protocol::write_message(&mut writer, &reject).await;
            info!("session {id}: rejected second front-end");
            return;
        }

        // The redraw goes out before the slot is published so no live
        // DATA can be fanned out ahead of it
        if let Some(redraw) = redraw_message(shared).await {
            if protocol::write_message(&mut writer, &redraw).await.is_err() {
                return;
            }
        }
        *slot = Some(ActiveClient { writer, conn_id });
    }

    info!("session {id}: client connected");

    tokio::spawn(handle_front_end(
        reader,
        conn_id,
        Arc::clone(shared),
        Arc::clone(client),
        Arc::clone(master),
        child_pid,
        fatal_tx.clone(),
        id.to_string(),
    ));
}

/// The attach redraw: clear-screen + home followed by the raw replay
/// snapshot, as one DATA frame, so the attaching front-end's terminal
/// reconstructs the exact screen state. None while the ring is empty.
async fn redraw_message(shared: &Arc<Mutex<Shared>>) -> Option<Message> {
    let snapshot = shared.lock().await.replay.snapshot();
    if snapshot.is_empty() {
        return None;
    }
    let mut payload = Vec::with_capacity(CLEAR_SCREEN.len() + snapshot.len());
    payload.extend_from_slice(CLEAR_SCREEN);
    payload.extend_from_slice(&snapshot);
    Some(Message::data(payload))
}

/// Write a frame to the attached front-end, dropping it on failure; the
/// session itself keeps running.
async fn send_to_front_end(client: &ClientSlot, msg: &Message) {
    let mut slot = client.lock().await;
    if let Some(active) = slot.as_mut() {
        if let Err(err) = protocol::write_message(&mut active.writer, msg).await {
            warn!("dropping front-end after failed write: {err}");
            *slot = None;
        }
    }
}

// ── Per-connection reader ───────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn handle_front_end(
    mut reader: OwnedReadHalf,
    conn_id: u64,
    shared: Arc<Mutex<Shared>>,
    client: ClientSlot,
    master: Arc<AsyncFd<OwnedFd>>,
    child_pid: libc::pid_t,
    fatal_tx: mpsc::Sender<()>,
    id: String,
) {
    loop {
        let msg = match protocol::read_message(&mut reader).await {
            Ok(msg) => msg,
            Err(_) => break,
        };

        match msg.kind {
            MSG_DATA => {
                if write_pty(&master, &msg.payload).await.is_err() {
                    let _ = fatal_tx.try_send(());
                    break;
                }
            }
            MSG_RESIZE => {
                // Malformed payloads are dropped on the floor
                if let Some((rows, cols)) = protocol::parse_resize(&msg.payload) {
                    shared.lock().await.last_rows = rows;
                    resize_pty(master.get_ref().as_raw_fd(), rows, cols);
                    debug!("session {id}: resized to {rows}x{cols}");
                }
            }
            MSG_DETACH => break,
            MSG_KILL => {
                info!("session {id}: kill requested");
                unsafe { libc::kill(child_pid, libc::SIGKILL) };
                break;
            }
            MSG_HISTORY_REQUEST => {
                if let Some((offset, count)) = protocol::parse_history_request(&msg.payload) {
                    let payload = {
                        let sh = shared.lock().await;
                        history_response(&sh.scrollback, offset, count)
                    };
                    send_to_front_end(
                        &client,
                        &Message::new(protocol::MSG_HISTORY_RESPONSE, payload),
                    )
                    .await;
                }
            }
            // HISTORY_RESPONSE and unknown kinds are not expected here
            _ => {}
        }
    }

    let mut slot = client.lock().await;
    if slot.as_ref().map(|c| c.conn_id) == Some(conn_id) {
        *slot = None;
        info!("session {id}: client disconnected");
    }
}

// ── History windows ─────────────────────────────────────────────────

/// Build a HISTORY_RESPONSE payload.
///
/// A set high bit in `offset` makes its low 31 bits a distance from the
/// newest line, so `start = total - distance - count` clamped to zero.
/// Lines are joined with CRLF; the pending partial line is appended when
/// the window reaches the newest complete line (`start + count >= total`),
/// which is what puts the in-progress prompt into history views.
fn history_response(scrollback: &Scrollback, offset: u32, count: u32) -> Vec<u8> {
    let total = scrollback.line_count();
    let start = if offset & HISTORY_FROM_END != 0 {
        let from_end = (offset & !HISTORY_FROM_END) as i64;
        (total as i64 - from_end - count as i64).max(0) as usize
    } else {
        offset as usize
    };

    let lines = scrollback.get_range(start, count as usize);

    let mut payload = Vec::new();
    payload.extend_from_slice(&(start as u32).to_be_bytes());
    payload.extend_from_slice(&(total as u32).to_be_bytes());
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            payload.extend_from_slice(b"\r\n");
        }
        payload.extend_from_slice(line);
    }

    if start + count as usize >= total {
        let partial = scrollback.partial();
        if !partial.is_empty() {
            if !lines.is_empty() {
                payload.extend_from_slice(b"\r\n");
            }
            payload.extend_from_slice(partial);
        }
    }

    payload
}

// ── PTY plumbing ────────────────────────────────────────────────────

/// Fork the shell under a fresh PTY with the inherited environment.
fn spawn_shell(shell: &str) -> io::Result<(OwnedFd, libc::pid_t)> {
    // Prepared before forking; the child may only make async-signal-safe
    // calls between fork and exec.
    let c_shell = CString::new(shell)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "shell path contains NUL"))?;
    let argv: [*const libc::c_char; 2] = [c_shell.as_ptr(), ptr::null()];

    let mut master_fd: libc::c_int = -1;
    let pid = unsafe {
        libc::forkpty(
            &mut master_fd as *mut libc::c_int,
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null_mut(),
        )
    };

    if pid < 0 {
        return Err(io::Error::last_os_error());
    }

    if pid == 0 {
        unsafe {
            libc::execvp(c_shell.as_ptr(), argv.as_ptr());
        }
        process::exit(127);
    }

    // SAFETY: forkpty handed us ownership of the master fd
    Ok((unsafe { OwnedFd::from_raw_fd(master_fd) }, pid))
}

fn resize_pty(master_fd: RawFd, rows: u16, cols: u16) {
    let ws = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe {
        libc::ioctl(master_fd, libc::TIOCSWINSZ, &ws);
    }
}

/// Write front-end input to the PTY master, waiting out short writes.
async fn write_pty(master: &AsyncFd<OwnedFd>, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        let mut guard = master.writable().await?;
        let n = unsafe {
            libc::write(
                master.get_ref().as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                guard.clear_ready_matching(Ready::WRITABLE);
                continue;
            }
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        data = &data[n as usize..];
    }
    Ok(())
}

fn kill_and_reap(pid: libc::pid_t) {
    unsafe {
        libc::kill(pid, libc::SIGKILL);
        let mut status: libc::c_int = 0;
        libc::waitpid(pid, &mut status, 0);
    }
}

fn bind_listener(path: &Path) -> io::Result<UnixListener> {
    let std_listener = StdUnixListener::bind(path)?;
    std_listener.set_nonblocking(true)?;
    UnixListener::from_std(std_listener)
}

fn write_info_file(path: &Path, info: &SessionInfo) -> io::Result<()> {
    use std::io::Write;
    let json = serde_json::to_string(info)?;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(json.as_bytes())
}

// ── Timestamps ──────────────────────────────────────────────────────

fn iso8601_now() -> String {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = dur.as_secs();
    let (year, month, day) = civil_from_days((secs / 86400) as i64);
    let time = secs % 86400;
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        day,
        time / 3600,
        (time % 3600) / 60,
        time % 60
    )
}

/// Gregorian date from days since the Unix epoch.
/// Algorithm from http://howardhinnant.github.io/date_algorithms.html
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

// ── Unit tests ──────────────────────────────────────────────────────
