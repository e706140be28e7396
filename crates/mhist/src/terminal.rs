//! Controlling-terminal helpers for the front-end: raw mode, size
//! queries, and the escape sequences used for redraw and the history
//! overlay.

use std::io;
use std::mem;
use std::os::fd::RawFd;

/// Clear the screen and home the cursor.
pub const CLEAR_SCREEN: &[u8] = b"\x1b[2J\x1b[H";

/// DECSET 1006: SGR mouse reporting on/off.
pub const MOUSE_MODE_ON: &[u8] = b"\x1b[?1006h";
pub const MOUSE_MODE_OFF: &[u8] = b"\x1b[?1006l";

pub const SAVE_CURSOR: &[u8] = b"\x1b7";
pub const RESTORE_CURSOR: &[u8] = b"\x1b8";
pub const REVERSE_VIDEO: &[u8] = b"\x1b[7m";
pub const REVERSE_VIDEO_OFF: &[u8] = b"\x1b[27m";

/// Cursor position escape, 1-based row and column.
pub fn cursor_position(row: u16, col: u16) -> String {
    format!("\x1b[{};{}H", row, col)
}

/// Saved terminal attributes, returned by [`enable_raw_mode`] and passed
/// back to [`restore_mode`]. Opaque to callers.
pub struct TermState(libc::termios);

/// Put the terminal into raw mode: byte-at-a-time reads, no echo, no
/// signal generation. Returns the prior state for restoration.
pub fn enable_raw_mode(fd: RawFd) -> io::Result<TermState> {
    let mut orig: libc::termios = unsafe { mem::zeroed() };
    if unsafe { libc::tcgetattr(fd, &mut orig) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut raw = orig;
    unsafe { libc::cfmakeraw(&mut raw) };
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &raw) } != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(TermState(orig))
}

/// Restore attributes saved by [`enable_raw_mode`].
pub fn restore_mode(fd: RawFd, state: &TermState) {
    unsafe {
        libc::tcsetattr(fd, libc::TCSANOW, &state.0);
    }
}

/// Current terminal dimensions as `(rows, cols)`.
pub fn window_size(fd: RawFd) -> io::Result<(u16, u16)> {
    let mut ws: libc::winsize = unsafe { mem::zeroed() };
    if unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((ws.ws_row, ws.ws_col))
}
