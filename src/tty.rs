//! Virtual terminals.
//!
//! Each TTY pairs a screen buffer (everything ever written, replayed on
//! `tty_switch`) with a keyboard stream and a canonical line buffer, driven
//! by termios flags. The keyboard IRQ feeds the foreground TTY one byte at
//! a time through `tty_input`; readers drain either the canonical buffer
//! (line at a time) or the raw stream (VMIN/VTIME).

use crate::err::{Errno, KResult};
use crate::iostream::{IoStream, IoStreamRef};
use crate::sched;
use crate::vga_buffer::{vga_text_backspace, vga_text_putc, vga_text_redraw, DEFAULT_ATTR};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::{Mutex, Once};

pub const NTTYS: usize = 3;

bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Iflag: u32 {
        const BRKINT = 0x0002;
        const ISTRIP = 0x0020;
        const INLCR  = 0x0040;
        const IGNCR  = 0x0080;
        const ICRNL  = 0x0100;
    }
}

bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Oflag: u32 {
        const OPOST = 0x0001;
        const ONLCR = 0x0004;
    }
}

bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Lflag: u32 {
        const ISIG   = 0x0001;
        const ICANON = 0x0002;
        const ECHO   = 0x0008;
        const ECHOE  = 0x0010;
        const ECHOK  = 0x0020;
        const ECHONL = 0x0040;
        const IEXTEN = 0x8000;
    }
}

bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cflag: u32 {
        const CREAD = 0x0080;
    }
}

pub const VINTR: usize = 0;
pub const VQUIT: usize = 1;
pub const VERASE: usize = 2;
pub const VKILL: usize = 3;
pub const VEOF: usize = 4;
pub const VTIME: usize = 5;
pub const VMIN: usize = 6;
pub const VSTART: usize = 8;
pub const VSTOP: usize = 9;
pub const VSUSP: usize = 10;
pub const NCCS: usize = 11;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termios {
    pub c_iflag: Iflag,
    pub c_oflag: Oflag,
    pub c_lflag: Lflag,
    pub c_cflag: Cflag,
    pub c_cc: [u8; NCCS],
}

impl Default for Termios {
    fn default() -> Termios {
        let mut cc = [0u8; NCCS];
        cc[VEOF] = 4;
        cc[VERASE] = 8;
        cc[VINTR] = 3;
        cc[VKILL] = 21;
        cc[VMIN] = 1;
        cc[VQUIT] = 28;
        cc[VSTART] = 17;
        cc[VSTOP] = 19;
        cc[VSUSP] = 26;
        cc[VTIME] = 0;
        Termios {
            c_iflag: Iflag::ICRNL | Iflag::BRKINT,
            c_oflag: Oflag::OPOST | Oflag::ONLCR,
            c_lflag: Lflag::ECHO
                | Lflag::ECHOE
                | Lflag::ECHOK
                | Lflag::ICANON
                | Lflag::ISIG
                | Lflag::IEXTEN,
            c_cflag: Cflag::CREAD,
            c_cc: cc,
        }
    }
}

pub enum TryRead {
    Done(usize),
    WouldBlock,
    Unsupported,
}

pub struct Tty {
    pub name: String,
    /// Screen history; the console replays it on switch.
    buffer: Vec<u8>,
    keyboard_stream: IoStreamRef,
    canon: Vec<u8>,
    pub termios: Termios,
    attr: u8,
}

impl Tty {
    pub fn new(name: &str) -> Tty {
        Tty {
            name: name.to_string(),
            buffer: Vec::with_capacity(1024),
            keyboard_stream: IoStream::alloc(),
            canon: Vec::new(),
            termios: Termios::default(),
            attr: DEFAULT_ATTR,
        }
    }

    pub fn screen(&self) -> &[u8] {
        &self.buffer
    }

    /// Appends to the screen buffer; a foreground TTY forwards every byte
    /// to the text console with the active attribute.
    pub fn write(&mut self, buf: &[u8], foreground: bool) -> usize {
        self.buffer.extend_from_slice(buf);
        if foreground {
            for b in buf {
                vga_text_putc(*b, self.attr);
            }
        }
        buf.len()
    }

    /// One keyboard byte through the input side of the line discipline.
    pub fn input(&mut self, c: u8, foreground: bool) {
        let mut c = c;
        let iflag = self.termios.c_iflag;
        let lflag = self.termios.c_lflag;

        if iflag.contains(Iflag::ISTRIP) {
            c &= 0x7f;
        }
        if iflag.contains(Iflag::INLCR) && c == b'\n' {
            c = b'\r';
        }
        if iflag.contains(Iflag::IGNCR) && c == b'\r' {
            return;
        }
        if iflag.contains(Iflag::ICRNL) && c == b'\r' {
            c = b'\n';
        }

        if c == self.termios.c_cc[VERASE]
            && lflag.contains(Lflag::ICANON)
            && lflag.contains(Lflag::ECHOE)
            && !self.canon.is_empty()
        {
            self.canon.pop();
            self.buffer.pop();
            if lflag.contains(Lflag::ECHO) && foreground {
                vga_text_backspace();
            }
            return;
        }

        if lflag.contains(Lflag::ECHO) {
            self.write(&[c], foreground);
        } else if c == b'\n' && lflag.contains(Lflag::ECHONL) && lflag.contains(Lflag::ICANON) {
            self.write(&[c], foreground);
        }

        if lflag.contains(Lflag::ICANON) {
            self.canon.push(c);
        }
        self.keyboard_stream.lock().putch(c);
    }

    pub fn try_read(&mut self, buf: &mut [u8]) -> TryRead {
        let lflag = self.termios.c_lflag;
        if lflag.contains(Lflag::ICANON) {
            let lf = match self.canon.iter().position(|&c| c == b'\n') {
                Some(i) => i,
                None => return TryRead::WouldBlock,
            };
            let n = core::cmp::min(buf.len(), lf + 1);
            buf[..n].copy_from_slice(&self.canon[..n]);
            for slot in buf[n..].iter_mut() {
                *slot = 0;
            }
            self.canon.drain(..=lf);
            // The raw stream carried the same line; discard it.
            let mut stream = self.keyboard_stream.lock();
            while let Some(c) = stream.getch() {
                if c == b'\n' {
                    break;
                }
            }
            return TryRead::Done(n);
        }

        let vmin = self.termios.c_cc[VMIN] as usize;
        let vtime = self.termios.c_cc[VTIME];
        if vtime > 0 {
            return TryRead::Unsupported;
        }
        let mut stream = self.keyboard_stream.lock();
        if vmin == 0 {
            return TryRead::Done(stream.read(buf));
        }
        if stream.count() >= core::cmp::min(vmin, buf.len()) {
            TryRead::Done(stream.read(buf))
        } else {
            TryRead::WouldBlock
        }
    }
}

static TTYS: Once<[Mutex<Tty>; NTTYS]> = Once::new();
static CURRENT: Mutex<usize> = Mutex::new(0);

fn ttys() -> &'static [Mutex<Tty>; NTTYS] {
    TTYS.call_once(|| {
        [
            Mutex::new(Tty::new("tty1")),
            Mutex::new(Tty::new("tty2")),
            Mutex::new(Tty::new("tty3")),
        ]
    })
}

/// Brings the TTYs up and registers `tty1..tty3` under the devfs root.
pub fn tty_init(
    devfs: &alloc::sync::Arc<crate::vfs::FileSystem>,
    devfs_root: &crate::vfs::NodeRef,
) -> KResult<()> {
    for (i, tty) in ttys().iter().enumerate() {
        let foreground = i == *CURRENT.lock();
        let name = tty.lock().name.clone();
        let banner = alloc::format!("VK 0.0-indev ({})\n", name);
        tty.lock().write(banner.as_bytes(), foreground);
        crate::devfs::register_device(devfs, devfs_root, &name, crate::devfs::Device::Tty(i))?;
        log::info!("initialized {}", name);
    }
    Ok(())
}

pub fn tty_write(idx: usize, buf: &[u8]) -> KResult<usize> {
    if idx >= NTTYS {
        return Err(Errno::NoDevice);
    }
    let foreground = *CURRENT.lock() == idx;
    Ok(ttys()[idx].lock().write(buf, foreground))
}

/// Blocking read honoring the TTY's termios configuration.
pub fn tty_read(idx: usize, buf: &mut [u8]) -> KResult<usize> {
    if idx >= NTTYS {
        return Err(Errno::NoDevice);
    }
    loop {
        match ttys()[idx].lock().try_read(buf) {
            TryRead::Done(n) => return Ok(n),
            TryRead::Unsupported => return Err(Errno::Unknown),
            TryRead::WouldBlock => {}
        }
        sched::sleep_on_io(idx as u32);
    }
}

/// Keyboard IRQ entry: one byte into the foreground TTY.
pub fn tty_input(c: u8) {
    let idx = *CURRENT.lock();
    ttys()[idx].lock().input(c, true);
    sched::io_wakeup(idx as u32);
}

/// Makes `idx` the foreground TTY and redraws the console from its screen
/// buffer.
pub fn tty_switch(idx: usize) {
    if idx >= NTTYS {
        return;
    }
    let mut cur = CURRENT.lock();
    if *cur != idx {
        *cur = idx;
        let tty = ttys()[idx].lock();
        vga_text_redraw(tty.screen());
    }
}

pub const TCGETS: u32 = 0x5401;
pub const TCSETS: u32 = 0x5402;

/// Terminal control. The dispatcher owns the user-space copies; this only
/// moves settings between the TTY and a kernel-side `Termios`.
pub fn tty_ioctl(idx: usize, cmd: u32, arg: &mut Termios) -> KResult<u32> {
    if idx >= NTTYS {
        return Err(Errno::NoDevice);
    }
    match cmd {
        TCGETS => {
            *arg = ttys()[idx].lock().termios;
            Ok(0)
        }
        TCSETS => {
            ttys()[idx].lock().termios = *arg;
            Ok(0)
        }
        _ => Err(Errno::Unknown),
    }
}

/// Snapshot of a TTY's screen buffer (statistics and tests).
pub fn screen_snapshot(idx: usize) -> Vec<u8> {
    ttys()[idx].lock().screen().to_vec()
}
