//! Front-end: relays the controlling terminal to a session process.
//!
//! Three modes drive input handling. LIVE forwards keystrokes to the
//! session one octet per DATA frame; Ctrl-A arms PREFIX_PENDING for one
//! byte; HISTORY intercepts everything and turns scroll keys into
//! history requests. Live session output is written to the terminal only
//! in LIVE mode so it cannot corrupt an on-screen history view.
//!
//! The byte interpretation lives in [`InputState`], which is pure: it
//! consumes stdin bytes and emits [`Action`]s for the relay to execute.

use std::io::{self, Write};
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::io::Ready;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;

use crate::mouse::{self, MouseEvent, BUTTON_WHEEL_DOWN, BUTTON_WHEEL_UP};
use crate::protocol::{self, Message, HISTORY_FROM_END, MSG_DATA, MSG_HISTORY_RESPONSE};
use crate::terminal;

/// Lines scrolled per wheel notch or vim key.
const SCROLL_STEP: i64 = 3;

/// The prefix key, Ctrl-A.
const PREFIX_KEY: u8 = 0x01;

/// Ctrl-S toggles history mode.
const HISTORY_KEY: u8 = 0x13;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect to session: {0}")]
    Connect(#[source] io::Error),

    #[error("enable raw mode: {0}")]
    RawMode(#[source] io::Error),
}

// ── Input state machine ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Live,
    PrefixPending,
    History,
}

/// An externally visible effect of feeding bytes to the state machine.
#[derive(Debug, PartialEq, Eq)]
enum Action {
    /// Frame to send to the session.
    Send(Message),
    /// Bytes for the local terminal (mouse-mode toggles).
    Local(&'static [u8]),
    /// The user detached; stop the input relay.
    Exit,
}

struct InputState {
    mode: Mode,
    /// History offset in lines from the end; 0 means live.
    offset: i64,
    rows: u16,
    cols: u16,
}

impl InputState {
    fn new(rows: u16, cols: u16) -> Self {
        Self {
            mode: Mode::Live,
            offset: 0,
            rows,
            cols,
        }
    }

    fn rows_or_default(&self) -> i64 {
        if self.rows == 0 {
            24
        } else {
            i64::from(self.rows)
        }
    }

    /// Interpret a chunk of raw stdin bytes. Stops consuming once a
    /// detach has been emitted.
    fn feed(&mut self, buf: &[u8], actions: &mut Vec<Action>) {
        let mut i = 0;
        while i < buf.len() {
            i += self.step(&buf[i..], actions);
            if matches!(actions.last(), Some(Action::Exit)) {
                return;
            }
        }
    }

    /// Handle the byte(s) at the start of `input`; returns how many were
    /// consumed (escape sequences span several).
    fn step(&mut self, input: &[u8], actions: &mut Vec<Action>) -> usize {
        match self.mode {
            Mode::PrefixPending => {
                self.mode = Mode::Live;
                match input[0] {
                    b'd' => {
                        actions.push(Action::Send(Message::detach()));
                        actions.push(Action::Exit);
                    }
                    PREFIX_KEY => {
                        // Ctrl-A Ctrl-A passes a literal prefix byte through
                        actions.push(Action::Send(Message::data(vec![PREFIX_KEY])));
                    }
                    b'[' => self.enter_history(SCROLL_STEP, actions),
                    _ => {} // unknown prefix command: discarded
                }
                1
            }
            Mode::History => self.history_step(input, actions),
            Mode::Live => self.live_step(input, actions),
        }
    }

    fn live_step(&mut self, input: &[u8], actions: &mut Vec<Action>) -> usize {
        let b = input[0];

        if b == PREFIX_KEY {
            self.mode = Mode::PrefixPending;
            return 1;
        }
        if b == HISTORY_KEY {
            self.enter_history(SCROLL_STEP, actions);
            return 1;
        }

        if b == 0x1b && input.len() >= 3 && input[1] == b'[' {
            if input[2] == b'<' {
                if let Some((ev, consumed)) = mouse::parse_sgr_mouse(input) {
                    self.handle_mouse(ev, actions);
                    return consumed;
                }
            }
            if input.len() >= 4 && input[3] == b'~' {
                if input[2] == b'5' {
                    // PageUp opens history a full page back
                    self.enter_history(self.rows_or_default(), actions);
                    return 4;
                }
                if input[2] == b'6' {
                    // PageDown has nothing to page; swallowed
                    return 4;
                }
            }
        }

        // Ordinary input: forward immediately, one octet per frame
        actions.push(Action::Send(Message::data(vec![b])));
        1
    }

    fn history_step(&mut self, input: &[u8], actions: &mut Vec<Action>) -> usize {
        let b = input[0];

        if b == 0x1b && input.len() >= 3 && input[1] == b'[' {
            if input[2] == b'<' {
                if let Some((ev, consumed)) = mouse::parse_sgr_mouse(input) {
                    self.handle_mouse(ev, actions);
                    return consumed;
                }
            }
            if input.len() >= 4 && input[3] == b'~' {
                if input[2] == b'5' {
                    self.offset += self.rows_or_default();
                    self.push_request(actions);
                    return 4;
                }
                if input[2] == b'6' {
                    self.scroll_down(self.rows_or_default(), actions);
                    return 4;
                }
            }
            if input[2] == b'A' {
                self.offset += SCROLL_STEP;
                self.push_request(actions);
                return 3;
            }
            if input[2] == b'B' {
                self.scroll_down(SCROLL_STEP, actions);
                return 3;
            }
        }

        match b {
            b'k' => {
                self.offset += SCROLL_STEP;
                self.push_request(actions);
            }
            b'j' => self.scroll_down(SCROLL_STEP, actions),
            b'u' => {
                self.offset += self.rows_or_default() / 2;
                self.push_request(actions);
            }
            b'd' => self.scroll_down(self.rows_or_default() / 2, actions),
            // q, Escape, Ctrl-S, and anything unrecognised all leave history
            _ => self.exit_history(actions),
        }
        1
    }

    fn handle_mouse(&mut self, ev: MouseEvent, actions: &mut Vec<Action>) {
        match ev.button {
            BUTTON_WHEEL_UP => {
                if self.mode == Mode::History {
                    self.offset += SCROLL_STEP;
                    self.push_request(actions);
                } else {
                    self.enter_history(SCROLL_STEP, actions);
                }
            }
            BUTTON_WHEEL_DOWN => {
                if self.mode == Mode::History {
                    self.scroll_down(SCROLL_STEP, actions);
                }
            }
            _ => {
                if self.mode == Mode::History && ev.press {
                    self.exit_history(actions);
                }
            }
        }
    }

    fn scroll_down(&mut self, step: i64, actions: &mut Vec<Action>) {
        self.offset -= step;
        if self.offset <= 0 {
            self.exit_history(actions);
        } else {
            self.push_request(actions);
        }
    }

    fn enter_history(&mut self, offset: i64, actions: &mut Vec<Action>) {
        self.mode = Mode::History;
        self.offset = offset;
        actions.push(Action::Local(terminal::MOUSE_MODE_ON));
        self.push_request(actions);
    }

    fn exit_history(&mut self, actions: &mut Vec<Action>) {
        self.mode = Mode::Live;
        self.offset = 0;
        actions.push(Action::Local(terminal::MOUSE_MODE_OFF));
        // From-end offset 0 makes the session resend the tail: a clean
        // redraw over whatever the history view left on screen
        self.push_request(actions);
    }

    fn push_request(&self, actions: &mut Vec<Action>) {
        let offset = HISTORY_FROM_END | self.offset.clamp(0, 0x7fff_ffff) as u32;
        let count = self.rows_or_default() as u32;
        actions.push(Action::Send(Message::history_request(offset, count)));
    }
}

// ── Attach / relay ──────────────────────────────────────────────────

/// Attach to the session listening at `socket_path` and relay until the
/// user detaches or the session goes away. Returns true for a user
/// detach, false when the stream ended first.
pub async fn attach(socket_path: &Path) -> Result<bool, ClientError> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(ClientError::Connect)?;

    let stdin_fd = libc::STDIN_FILENO;
    let saved = terminal::enable_raw_mode(stdin_fd).map_err(ClientError::RawMode)?;
    let saved_flags = unsafe { libc::fcntl(stdin_fd, libc::F_GETFL) };
    unsafe {
        libc::fcntl(stdin_fd, libc::F_SETFL, saved_flags | libc::O_NONBLOCK);
    }

    let detached = relay(stream).await;

    // Total restoration: mouse reporting off, original fd flags, cooked mode
    let mut stdout = io::stdout();
    let _ = stdout.write_all(terminal::MOUSE_MODE_OFF);
    let _ = stdout.flush();
    unsafe {
        libc::fcntl(stdin_fd, libc::F_SETFL, saved_flags);
    }
    terminal::restore_mode(stdin_fd, &saved);

    Ok(detached)
}

async fn relay(stream: UnixStream) -> bool {
    let (rows, cols) = terminal::window_size(libc::STDIN_FILENO).unwrap_or((24, 80));
    let state = Arc::new(Mutex::new(InputState::new(rows, cols)));

    let (reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));

    // Sent before any input so the PTY has the right size from the start
    if send(&writer, &Message::resize(rows, cols)).await.is_err() {
        return false;
    }

    let winch = tokio::spawn(watch_window_size(
        Arc::clone(&state),
        Arc::clone(&writer),
    ));
    let mut input = tokio::spawn(relay_stdin(Arc::clone(&state), Arc::clone(&writer)));
    let mut output = tokio::spawn(relay_session(reader, Arc::clone(&state)));

    let detached = tokio::select! {
        res = &mut input => res.unwrap_or(false),
        _ = &mut output => false,
    };

    winch.abort();
    input.abort();
    output.abort();
    detached
}

async fn send(writer: &Arc<Mutex<OwnedWriteHalf>>, msg: &Message) -> io::Result<()> {
    let mut w = writer.lock().await;
    protocol::write_message(&mut *w, msg).await
}

/// Re-query the terminal size on every window-change signal and tell the
/// session, which resizes the PTY in turn.
async fn watch_window_size(state: Arc<Mutex<InputState>>, writer: Arc<Mutex<OwnedWriteHalf>>) {
    let Ok(mut winch) = signal(SignalKind::window_change()) else {
        return;
    };
    while winch.recv().await.is_some() {
        let Ok((rows, cols)) = terminal::window_size(libc::STDIN_FILENO) else {
            continue;
        };
        {
            let mut st = state.lock().await;
            st.rows = rows;
            st.cols = cols;
        }
        if send(&writer, &Message::resize(rows, cols)).await.is_err() {
            return;
        }
    }
}

/// Read raw stdin and run it through the state machine. Returns true
/// when the user detached.
async fn relay_stdin(state: Arc<Mutex<InputState>>, writer: Arc<Mutex<OwnedWriteHalf>>) -> bool {
    // attach() switched stdin to O_NONBLOCK for the reactor
    let stdin = match AsyncFd::new(unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) }) {
        Ok(fd) => fd,
        Err(_) => return false,
    };

    let mut buf = vec![0u8; 4096];
    let mut actions = Vec::new();

    loop {
        let mut guard = match stdin.readable().await {
            Ok(guard) => guard,
            Err(_) => return false,
        };

        let n = unsafe {
            libc::read(
                libc::STDIN_FILENO,
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
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return false;
        }
        if n == 0 {
            return false; // stdin closed
        }

        actions.clear();
        state.lock().await.feed(&buf[..n as usize], &mut actions);

        for action in &actions {
            match action {
                Action::Send(msg) => {
                    if send(&writer, msg).await.is_err() {
                        return false;
                    }
                }
                Action::Local(bytes) => {
                    let mut stdout = io::stdout();
                    let _ = stdout.write_all(bytes);
                    let _ = stdout.flush();
                }
                Action::Exit => return true,
            }
        }
    }
}

/// Decode frames from the session. Live DATA reaches the terminal only
/// in LIVE mode; history responses are always rendered, because the
/// answer to an exit-history request is the tail redraw.
async fn relay_session(mut reader: OwnedReadHalf, state: Arc<Mutex<InputState>>) {
    loop {
        let msg = match protocol::read_message(&mut reader).await {
            Ok(msg) => msg,
            Err(_) => return,
        };

        match msg.kind {
            MSG_DATA => {
                let live = state.lock().await.mode == Mode::Live;
                if live {
                    let mut stdout = io::stdout();
                    let _ = stdout.write_all(&msg.payload);
                    let _ = stdout.flush();
                }
            }
            MSG_HISTORY_RESPONSE => {
                let st = state.lock().await;
                let mut stdout = io::stdout();
                let _ = render_history(&msg.payload, &st, &mut stdout);
            }
            _ => {}
        }
    }
}

/// Clear the screen, write the history window, and (while still in
/// history mode) draw a right-aligned reverse-video `[line S/T]`
/// indicator on the top line without disturbing the cursor.
fn render_history(payload: &[u8], state: &InputState, out: &mut impl Write) -> io::Result<()> {
    let Some((start, total, data)) = protocol::parse_history_response(payload) else {
        return Ok(());
    };

    out.write_all(terminal::CLEAR_SCREEN)?;
    out.write_all(data)?;

    if state.mode == Mode::History && total > 0 {
        let indicator = format!("[line {}/{}]", start + 1, total);
        let col = (i32::from(state.cols) - indicator.len() as i32 + 1).max(1) as u16;
        out.write_all(terminal::SAVE_CURSOR)?;
        out.write_all(terminal::cursor_position(1, col).as_bytes())?;
        out.write_all(terminal::REVERSE_VIDEO)?;
        out.write_all(indicator.as_bytes())?;
        out.write_all(terminal::REVERSE_VIDEO_OFF)?;
        out.write_all(terminal::RESTORE_CURSOR)?;
    }
    out.flush()
}

// ── Unit tests ──────────────────────────────────────────────────────
