//! Text-mode console sink.
//!
//! The TTY layer forwards foreground bytes here. On the kernel target this
//! drives the VGA text buffer at 0xb8000; on a host build the bytes land in
//! a captured buffer so tests can observe what would have reached the
//! screen. The console itself is a collaborator: everything above it only
//! relies on `putc`/`backspace`/`redraw`.

pub const DEFAULT_ATTR: u8 = 0x07;

#[cfg(target_arch = "x86")]
mod sink {
    use super::DEFAULT_ATTR;
    use core::fmt;
    use core::ptr;
    use spin::Mutex;

    const BUFFER_HEIGHT: usize = 25;
    const BUFFER_WIDTH: usize = 80;
    const VGA_BASE: *mut u16 = 0xc00b_8000 as *mut u16;

    struct Writer {
        row: usize,
        col: usize,
    }

    static WRITER: Mutex<Writer> = Mutex::new(Writer { row: 0, col: 0 });

    impl Writer {
        fn cell(&self) -> *mut u16 {
            unsafe { VGA_BASE.add(self.row * BUFFER_WIDTH + self.col) }
        }

        fn put(&mut self, byte: u8, attr: u8) {
            match byte {
                b'\n' => {
                    self.col = 0;
                    self.advance_row();
                }
                byte => {
                    if self.col >= BUFFER_WIDTH {
                        self.col = 0;
                        self.advance_row();
                    }
                    unsafe { ptr::write_volatile(self.cell(), (attr as u16) << 8 | byte as u16) };
                    self.col += 1;
                }
            }
        }

        fn advance_row(&mut self) {
            if self.row + 1 < BUFFER_HEIGHT {
                self.row += 1;
                return;
            }
            // Scroll everything up one line.
            for row in 1..BUFFER_HEIGHT {
                for col in 0..BUFFER_WIDTH {
                    unsafe {
                        let c = ptr::read_volatile(VGA_BASE.add(row * BUFFER_WIDTH + col));
                        ptr::write_volatile(VGA_BASE.add((row - 1) * BUFFER_WIDTH + col), c);
                    }
                }
            }
            for col in 0..BUFFER_WIDTH {
                unsafe {
                    ptr::write_volatile(
                        VGA_BASE.add((BUFFER_HEIGHT - 1) * BUFFER_WIDTH + col),
                        (DEFAULT_ATTR as u16) << 8 | b' ' as u16,
                    )
                };
            }
        }

        fn backspace(&mut self) {
            if self.col > 0 {
                self.col -= 1;
                unsafe {
                    ptr::write_volatile(self.cell(), (DEFAULT_ATTR as u16) << 8 | b' ' as u16)
                };
            }
        }

        fn clear(&mut self) {
            for row in 0..BUFFER_HEIGHT {
                for col in 0..BUFFER_WIDTH {
                    unsafe {
                        ptr::write_volatile(
                            VGA_BASE.add(row * BUFFER_WIDTH + col),
                            (DEFAULT_ATTR as u16) << 8 | b' ' as u16,
                        )
                    };
                }
            }
            self.row = 0;
            self.col = 0;
        }
    }

    pub fn vga_text_putc(byte: u8, attr: u8) {
        WRITER.lock().put(byte, attr);
    }

    pub fn vga_text_backspace() {
        WRITER.lock().backspace();
    }

    pub fn vga_text_redraw(history: &[u8]) {
        let mut w = WRITER.lock();
        w.clear();
        for b in history {
            w.put(*b, DEFAULT_ATTR);
        }
    }

    pub struct ConsoleWriter;

    impl fmt::Write for ConsoleWriter {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                vga_text_putc(b, DEFAULT_ATTR);
            }
            Ok(())
        }
    }
}

#[cfg(not(target_arch = "x86"))]
mod sink {
    use alloc::vec::Vec;
    use core::fmt;
    use spin::Mutex;

    static CAPTURED: Mutex<Vec<u8>> = Mutex::new(Vec::new());

    pub fn vga_text_putc(byte: u8, _attr: u8) {
        CAPTURED.lock().push(byte);
    }

    pub fn vga_text_backspace() {
        CAPTURED.lock().pop();
    }

    pub fn vga_text_redraw(history: &[u8]) {
        let mut c = CAPTURED.lock();
        c.clear();
        c.extend_from_slice(history);
    }

    /// What the screen would show; test hook.
    pub fn captured() -> Vec<u8> {
        CAPTURED.lock().clone()
    }

    pub struct ConsoleWriter;

    impl fmt::Write for ConsoleWriter {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                vga_text_putc(b, super::DEFAULT_ATTR);
            }
            Ok(())
        }
    }
}

pub use sink::*;
