//! Timer tick bookkeeping.
//!
//! The PIT fires `HZ` times a second; the tick counter drives scheduler
//! quanta and timed sleeps.

use crate::x86;
use core::sync::atomic::{AtomicU32, Ordering};

pub const HZ: u32 = 100;

static TICKS: AtomicU32 = AtomicU32::new(0);

pub fn ticks() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

/// Called from the timer IRQ.
pub fn tick() -> u32 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

pub fn ms_to_ticks(ms: u32) -> u32 {
    (ms * HZ).div_ceil(1000).max(1)
}

/// Programs the PIT for `HZ` interrupts a second.
pub fn pit_init() {
    const PIT_FREQ: u32 = 1_193_182;
    let divisor = (PIT_FREQ / HZ) as u16;
    x86::outb(0x43, 0x36);
    x86::outb(0x40, (divisor & 0xff) as u8);
    x86::outb(0x40, (divisor >> 8) as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millisecond_conversion_rounds_up() {
        assert_eq!(ms_to_ticks(10), 1);
        assert_eq!(ms_to_ticks(15), 2);
        assert_eq!(ms_to_ticks(1000), HZ);
        // Sub-tick sleeps still wait at least one tick.
        assert_eq!(ms_to_ticks(1), 1);
        assert_eq!(ms_to_ticks(0), 1);
    }
}
