//! PS/2 keyboard front end.
//!
//! The IRQ handler pulls one scancode, decodes it to a byte and hands it to
//! the foreground TTY's line discipline. The decode table is deliberately
//! minimal: the keyboard is only a character source for the TTY layer.

use crate::tty;
use crate::x86;

const PORT_DATA: u16 = 0x60;
const PORT_STATUS: u16 = 0x64;
const STATUS_DATA_IN_BUFFER: u8 = 0x01;

const BACKSPACE: u8 = 0x08;
const ESC: u8 = 0x1b;

// Scancode set 1, unshifted.
#[rustfmt::skip]
static NORMAL_MAP: [u8; 64] = [
    0, ESC, b'1', b'2', b'3', b'4', b'5', b'6',
    b'7', b'8', b'9', b'0', b'-', b'=', BACKSPACE, b'\t',
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i',
    b'o', b'p', b'[', b']', b'\n', 0, b'a', b's',
    b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';',
    b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v',
    b'b', b'n', b'm', b',', b'.', b'/', 0, b'*',
    0, b' ', 0, 0, 0, 0, 0, 0,
];

fn kbd_getc() -> Option<u8> {
    let st = x86::inb(PORT_STATUS);
    if st & STATUS_DATA_IN_BUFFER == 0 {
        return None;
    }
    let data = x86::inb(PORT_DATA);
    if data & 0x80 != 0 {
        // Key release.
        return None;
    }
    match NORMAL_MAP.get(data as usize) {
        Some(&c) if c != 0 => Some(c),
        _ => None,
    }
}

/// Keyboard IRQ: feed the decoded byte to the foreground TTY.
pub fn kbd_intr() {
    if let Some(c) = kbd_getc() {
        tty::tty_input(c);
    }
}
