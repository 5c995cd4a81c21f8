//! Scheduler.
//!
//! Cooperative plus timer-preempted round-robin. Each process serves a
//! quantum of ticks for its active thread; a process with several runnable
//! threads is multiplexed internally before the next process gets the CPU.
//! The only code path that changes `current` is the switch performed here.

use crate::constants::SCHEDULER_QUANTUM;
use crate::process::{self, Pid, ProcessStatus, Thread, ThreadStatus};
use crate::time;
use crate::x86;
use core::sync::atomic::{AtomicU32, Ordering};

static QUANTUM_LEFT: AtomicU32 = AtomicU32::new(SCHEDULER_QUANTUM);

/// Timer IRQ bookkeeping: advance the clock, wake expired sleepers, and
/// burn down the running thread's quantum. Returns true when the quantum
/// is spent and the trap path should reschedule.
pub fn on_timer() -> bool {
    let now = time::tick();
    process::table().lock().wake_threads(|status, data| {
        status == ThreadStatus::AsleepTime && data[0] <= now
    });
    if QUANTUM_LEFT.fetch_sub(1, Ordering::Relaxed) <= 1 {
        QUANTUM_LEFT.store(SCHEDULER_QUANTUM, Ordering::Relaxed);
        return true;
    }
    false
}

/// IRQ-driven wakeup: any thread sleeping on this IRQ line becomes
/// runnable again.
pub fn irq_wakeup(irq: u32) {
    process::table().lock().wake_threads(move |status, data| {
        status == ThreadStatus::AsleepIrq && data[0] == irq
    });
}

/// A byte arrived on an IO channel (TTY keyboard stream index).
pub fn io_wakeup(chan: u32) {
    process::table().lock().wake_threads(move |status, data| {
        status == ThreadStatus::AsleepIo && data[0] == chan
    });
}

/// Blocks the current thread on an IO channel and yields.
pub fn sleep_on_io(chan: u32) {
    wait_current(ThreadStatus::AsleepIo, chan, 0);
}

/// Blocks the current thread until `irq` fires.
pub fn sleep_on_irq(irq: u32) {
    wait_current(ThreadStatus::AsleepIrq, irq, 0);
}

/// Timed sleep; the wake tick is computed from the delta now.
pub fn sleep_ms(ms: u32) {
    let target = time::ticks() + time::ms_to_ticks(ms);
    wait_current(ThreadStatus::AsleepTime, target, 0);
}

/// Blocks the current thread in wait() until a child changes state.
pub fn sleep_on_child() {
    wait_current(ThreadStatus::AsleepChild, 0, 0);
}

/// Blocks the current thread on a contended kernel mutex.
pub fn sleep_on_mutex(mutex_id: u32) {
    wait_current(ThreadStatus::AsleepMutex, mutex_id, 0);
}

/// Called by the owning release path when a kernel mutex frees up.
pub fn mutex_wakeup(mutex_id: u32) {
    process::table().lock().wake_threads(move |status, data| {
        status == ThreadStatus::AsleepMutex && data[0] == mutex_id
    });
}

fn wait_current(status: ThreadStatus, d1: u32, d2: u32) {
    {
        let mut table = process::table().lock();
        let pid = table.current;
        if let Some(p) = table.get(pid) {
            let tid = p.active_thread;
            table.wait_thread(pid, tid, status, d1, d2);
        }
    }
    schedule();
}

/// Picks the next runnable process, rotating the run queue and, within a
/// process, its thread queue. Returns the chosen pid.
pub fn pick_next(table: &mut process::ProcessTable) -> Option<Pid> {
    let served = table.threads_served;
    table.threads_served += 1;
    // Serve each runnable thread of the current process one quantum
    // before handing the CPU to the next process.
    if let Some(p) = table.get_mut(table.current) {
        if p.status == ProcessStatus::Running && p.running_threads.len() > 1 {
            if (served as usize) < p.running_threads.len() - 1 {
                if let Some(front) = p.running_threads.pop_front() {
                    p.running_threads.push_back(front);
                }
                if let Some(&next) = p.running_threads.front() {
                    p.active_thread = next;
                }
                return Some(table.current);
            }
        }
    }
    table.threads_served = 0;

    let len = table.run_queue.len();
    let mut current_still_runnable = false;
    for _ in 0..len {
        let pid = match table.run_queue.pop_front() {
            Some(p) => p,
            None => break,
        };
        let runnable = matches!(
            table.get(pid).map(|p| p.status),
            Some(ProcessStatus::Running) | Some(ProcessStatus::Init)
        );
        if !runnable {
            // Fell asleep or died: drop it from the queue.
            continue;
        }
        table.run_queue.push_back(pid);
        if pid == table.current {
            // Its turn just ended; prefer somebody else if there is one.
            current_still_runnable = true;
            continue;
        }
        if let Some(p) = table.get_mut(pid) {
            if let Some(&tid) = p.running_threads.front() {
                p.active_thread = tid;
            }
            p.status = ProcessStatus::Running;
        }
        return Some(pid);
    }
    if current_still_runnable {
        return Some(table.current);
    }
    None
}

/// Selects the next thread and switches to it. With nothing runnable the
/// CPU idles until an interrupt delivers new work.
pub fn schedule() {
    loop {
        let next = {
            let mut table = process::table().lock();
            pick_next(&mut table).map(|pid| {
                table.current = pid;
                switch_args(&mut table, pid)
            })
        };
        match next {
            Some(args) => {
                arch_switch(args);
                return;
            }
            None => idle_once(),
        }
    }
}

struct SwitchArgs {
    #[allow(dead_code)]
    cr3: u32,
    #[allow(dead_code)]
    kesp: u32,
}

fn switch_args(table: &mut process::ProcessTable, pid: Pid) -> SwitchArgs {
    let p = table.get(pid).expect("scheduled a missing process");
    SwitchArgs {
        cr3: p.space.as_ref().map(|s| s.dir_phys()).unwrap_or(0),
        kesp: p.active_thread().kesp,
    }
}

#[cfg(target_arch = "x86")]
extern "C" {
    fn context_switch(save: *mut u32, load: u32);
    fn trap_return() -> !;
}

#[cfg(target_arch = "x86")]
fn arch_switch(args: SwitchArgs) {
    // The outgoing thread's kernel stack pointer lands in a scratch slot;
    // the trap path saved its register file already.
    static mut SCRATCH_KESP: u32 = 0;
    if args.cr3 != 0 {
        x86::lcr3(args.cr3);
    }
    unsafe {
        context_switch(core::ptr::addr_of_mut!(SCRATCH_KESP), args.kesp);
    }
}

#[cfg(not(target_arch = "x86"))]
fn arch_switch(_args: SwitchArgs) {
    // Host builds only pick; there is no register state to swap.
}

fn idle_once() {
    x86::sti();
    x86::hlt();
    #[cfg(not(target_arch = "x86"))]
    panic!("schedule: nothing runnable and no interrupts to wait for");
}

/// Builds a fresh kernel stack for a forked thread so its very first
/// schedule pops a full trap frame and irets straight into user mode with
/// the registers the fork snapshot dictates (eax already 0).
#[cfg(target_arch = "x86")]
pub fn forge_fork_kstack(t: &Thread) -> u32 {
    use crate::constants::PROCESS_KSTACK_SIZE_DEFAULT;
    use crate::trap::Trapframe;
    use core::mem;

    unsafe {
        let top = t.base_kstack + PROCESS_KSTACK_SIZE_DEFAULT;
        let tf_addr = top - mem::size_of::<Trapframe>() as u32;
        let tf = tf_addr as *mut Trapframe;
        (*tf) = Trapframe::from_thread(t);

        // context_switch pops edi/esi/ebx/ebp then rets into trap_return,
        // which unwinds the forged trap frame.
        let mut sp = tf_addr as *mut u32;
        sp = sp.sub(1);
        *sp = trap_return as usize as u32;
        for _ in 0..4 {
            sp = sp.sub(1);
            *sp = 0;
        }
        sp as u32
    }
}

#[cfg(not(target_arch = "x86"))]
pub fn forge_fork_kstack(_t: &Thread) -> u32 {
    0
}
