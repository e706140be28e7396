//! SGR mouse report parsing.
//!
//! Terminals in SGR mouse mode (DECSET 1006) report events as
//! `ESC [ < button ; col ; row M` for press and `... m` for release.

/// A parsed SGR mouse report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseEvent {
    pub button: u32,
    pub col: u32,
    pub row: u32,
    /// true for `M` (press), false for `m` (release).
    pub press: bool,
}

/// Wheel-up button code in SGR reports.
pub const BUTTON_WHEEL_UP: u32 = 64;
/// Wheel-down button code in SGR reports.
pub const BUTTON_WHEEL_DOWN: u32 = 65;

/// Parse an SGR mouse sequence at the start of `data`.
///
/// Returns the event and the number of bytes consumed, or None when the
/// prefix does not match, the sequence is truncated, a non-digit
/// non-semicolon byte appears before the terminator, or the parameter
/// count is not exactly three. Failure is in-band so callers can fall
/// back to treating the bytes as ordinary input.
pub fn parse_sgr_mouse(data: &[u8]) -> Option<(MouseEvent, usize)> {
    // Shortest possible report: ESC [ < d ; d ; d M
    if data.len() < 9 {
        return None;
    }
    if data[0] != 0x1b || data[1] != b'[' || data[2] != b'<' {
        return None;
    }

    let mut term_idx = None;
    for (i, &b) in data.iter().enumerate().skip(3) {
        if b == b'M' || b == b'm' {
            term_idx = Some(i);
            break;
        }
        if b != b';' && !b.is_ascii_digit() {
            return None;
        }
    }
    let term_idx = term_idx?;

    let params = &data[3..term_idx];
    let mut fields = params.split(|&b| b == b';');
    let button = parse_decimal(fields.next()?)?;
    let col = parse_decimal(fields.next()?)?;
    let row = parse_decimal(fields.next()?)?;
    if fields.next().is_some() {
        return None;
    }

    let event = MouseEvent {
        button,
        col,
        row,
        press: data[term_idx] == b'M',
    };
    Some((event, term_idx + 1))
}

fn parse_decimal(field: &[u8]) -> Option<u32> {
    std::str::from_utf8(field).ok()?.parse().ok()
}
