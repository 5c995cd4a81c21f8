//! Signals.
//!
//! Signals are posted as bits in the target's pending mask and acted on at
//! the next return to user mode: a registered handler gets a trampoline
//! frame on the user stack, everything else takes the default action.
//! SIGKILL and SIGSTOP cannot be overridden, and a SIGKILL aimed at a
//! sleeping process turns it into a zombie the moment it is next scheduled,
//! without executing another user instruction.

use crate::constants::NSIG;
use crate::err::{Errno, KResult};
use crate::process::{
    Pid, Process, ProcessStatus, ProcessTable, ThreadStatus, EXIT_CONDITION_SIGNAL,
};
use crate::usermem;

pub const SIGHUP: usize = 1;
pub const SIGINT: usize = 2;
pub const SIGQUIT: usize = 3;
pub const SIGILL: usize = 4;
pub const SIGKILL: usize = 9;
pub const SIGSEGV: usize = 11;
pub const SIGTERM: usize = 15;
pub const SIGCHLD: usize = 17;
pub const SIGCONT: usize = 18;
pub const SIGSTOP: usize = 19;
pub const SIGTSTP: usize = 20;
pub const SIGURG: usize = 23;
pub const SIGWINCH: usize = 28;

/// System call number of sigreturn, baked into the trampoline code.
const SIGRET_CALL: u32 = 39;
/// Words of context saved in the signal frame: eip, esp and 7 registers.
const SAVED_WORDS: u32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    Stop,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Handler(u32),
    Default(DefaultAction),
}

pub fn default_action(sig: usize) -> DefaultAction {
    match sig {
        SIGCHLD | SIGCONT | SIGURG | SIGWINCH => DefaultAction::Ignore,
        SIGSTOP | SIGTSTP => DefaultAction::Stop,
        _ => DefaultAction::Terminate,
    }
}

fn valid(sig: usize) -> KResult<()> {
    if sig == 0 || sig >= NSIG {
        Err(Errno::InvalidSignal)
    } else {
        Ok(())
    }
}

/// Marks `sig` pending on `pid`. SIGKILL additionally yanks every sleeping
/// thread back into the rotation so the death is processed promptly; the
/// interrupted syscall never completes.
pub fn post_signal(table: &mut ProcessTable, pid: Pid, sig: usize) -> KResult<()> {
    valid(sig)?;
    {
        let target = table.get_mut(pid).ok_or(Errno::InvalidPid)?;
        if target.status == ProcessStatus::Zombie {
            return Ok(());
        }
        target.pending_signals |= 1 << sig;
    }
    if sig == SIGKILL || sig == SIGCONT {
        let requeue = {
            let target = table.get_mut(pid).ok_or(Errno::InvalidPid)?;
            for tid in core::mem::take(&mut target.waiting_threads) {
                target.threads[tid].status = ThreadStatus::Running;
                target.running_threads.push_back(tid);
            }
            match target.status {
                ProcessStatus::AsleepThreads | ProcessStatus::AsleepSignal => {
                    target.status = ProcessStatus::Running;
                    true
                }
                _ => !target.running_threads.is_empty(),
            }
        };
        if requeue && !table.run_queue.contains(&pid) {
            table.run_queue.push_back(pid);
        }
    }
    Ok(())
}

/// Broadcast to every member of a process group.
pub fn post_signal_group(table: &mut ProcessTable, gid: i32, sig: usize) -> KResult<()> {
    valid(sig)?;
    let members = match table.groups.get(&gid) {
        Some(g) => g.members.clone(),
        None => return Err(Errno::InvalidPid),
    };
    for pid in members {
        post_signal(table, pid, sig).ok();
    }
    Ok(())
}

/// Takes the lowest pending signal off the mask and resolves what to do
/// with it. SIGKILL and SIGSTOP ignore any installed handler.
pub fn next_pending(proc: &mut Process) -> Option<(usize, Disposition)> {
    if proc.pending_signals == 0 {
        return None;
    }
    let sig = proc.pending_signals.trailing_zeros() as usize;
    proc.pending_signals &= !(1 << sig);
    let handler = proc.signal_handlers[sig];
    if handler != 0 && sig != SIGKILL && sig != SIGSTOP {
        Some((sig, Disposition::Handler(handler)))
    } else {
        Some((sig, Disposition::Default(default_action(sig))))
    }
}

/// Runs on the return path to user mode: drains defaults, and for the
/// first handled signal rewrites the thread state so user execution
/// resumes in the handler with a sigreturn trampoline frame below it.
pub fn check_pending(table: &mut ProcessTable, pid: Pid) {
    loop {
        let (sig, disposition) = {
            let proc = match table.get_mut(pid) {
                Some(p) => p,
                None => return,
            };
            match next_pending(proc) {
                Some(x) => x,
                None => return,
            }
        };
        match disposition {
            Disposition::Default(DefaultAction::Ignore) => continue,
            Disposition::Default(DefaultAction::Terminate) => {
                table.exit_process(pid, EXIT_CONDITION_SIGNAL | sig as u32);
                return;
            }
            Disposition::Default(DefaultAction::Stop) => {
                if let Some(p) = table.get_mut(pid) {
                    p.status = ProcessStatus::AsleepSignal;
                }
                table.run_queue.retain(|&q| q != pid);
                return;
            }
            Disposition::Handler(handler) => {
                if deliver_to_handler(table, pid, sig, handler).is_err() {
                    // A stack we cannot write is fatal for the target.
                    table.exit_process(pid, EXIT_CONDITION_SIGNAL | SIGSEGV as u32);
                }
                return;
            }
        }
    }
}

/// Signal frame, built downwards from the interrupted esp:
///
/// ```text
///   [int $0x30 trampoline code]              <- code
///   [eip esp eax ebx ecx edx esi edi ebp]    <- saved context
///   [sig]                                 handler argument
///   [&code]                               handler return address <- new esp
/// ```
fn deliver_to_handler(
    table: &mut ProcessTable,
    pid: Pid,
    sig: usize,
    handler: u32,
) -> KResult<()> {
    let ProcessTable { frames, slots, .. } = table;
    let proc = slots
        .get_mut(pid as usize)
        .and_then(|s| s.as_mut())
        .ok_or(Errno::InvalidPid)?;
    let space = proc.space.as_ref().ok_or(Errno::Unknown)?;
    let t = &proc.threads[proc.active_thread];

    // mov eax, SIGRET_CALL ; int 0x30
    let mut code = [0u8; 8];
    code[0] = 0xb8;
    code[1..5].copy_from_slice(&SIGRET_CALL.to_le_bytes());
    code[5] = 0xcd;
    code[6] = 0x30;
    code[7] = 0x90;

    let mut sp = t.esp;
    sp -= code.len() as u32;
    let code_addr = sp;
    usermem::copy_to_user(space, frames.as_mut(), sp, &code)?;

    let saved = [
        t.eip, t.esp, t.gregs.eax, t.gregs.ebx, t.gregs.ecx, t.gregs.edx, t.gregs.esi,
        t.gregs.edi, t.ebp,
    ];
    for word in saved.iter().rev() {
        sp -= 4;
        usermem::copy_to_user(space, frames.as_mut(), sp, &word.to_le_bytes())?;
    }
    sp -= 4;
    usermem::copy_to_user(space, frames.as_mut(), sp, &(sig as u32).to_le_bytes())?;
    sp -= 4;
    usermem::copy_to_user(space, frames.as_mut(), sp, &code_addr.to_le_bytes())?;

    let t = &mut proc.threads[proc.active_thread];
    t.eip = handler;
    t.esp = sp;
    Ok(())
}

/// The sigreturn system call: unwind the frame `deliver_to_handler` built
/// and resume the interrupted context.
pub fn sigreturn(table: &mut ProcessTable, pid: Pid) -> KResult<()> {
    let ProcessTable { frames, slots, .. } = table;
    let proc = slots
        .get_mut(pid as usize)
        .and_then(|s| s.as_mut())
        .ok_or(Errno::InvalidPid)?;
    let space = proc.space.as_ref().ok_or(Errno::Unknown)?;
    let t = &proc.threads[proc.active_thread];

    // After the handler returned into the trampoline, esp points at the
    // signal number; the saved context sits right above it.
    let saved_base = t.esp + 4;
    let mut saved = [0u32; SAVED_WORDS as usize];
    for (i, word) in saved.iter_mut().enumerate() {
        let mut raw = [0u8; 4];
        usermem::copy_from_user(space, frames.as_mut(), saved_base + (i as u32) * 4, &mut raw)?;
        *word = u32::from_le_bytes(raw);
    }

    let t = &mut proc.threads[proc.active_thread];
    t.eip = saved[0];
    t.esp = saved[1];
    t.gregs.eax = saved[2];
    t.gregs.ebx = saved[3];
    t.gregs.ecx = saved[4];
    t.gregs.edx = saved[5];
    t.gregs.esi = saved[6];
    t.gregs.edi = saved[7];
    t.ebp = saved[8];
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PGSIZE;
    use crate::paging::tests::ArenaFrames;
    use crate::paging::AddressSpace;
    use crate::pmm::BlockKind;
    use crate::process::{GRegs, INVALID_PID};
    use alloc::boxed::Box;

    fn table_with_user_stack() -> (ProcessTable, Pid) {
        let mut t = ProcessTable::new(Box::new(ArenaFrames::new()));
        let space = AddressSpace::new(t.frames.as_mut()).unwrap();
        let pid = t.create_process(INVALID_PID, space, 0);
        {
            let ProcessTable { frames, slots, .. } = &mut t;
            let proc = slots[pid as usize].as_mut().unwrap();
            proc.space
                .as_mut()
                .unwrap()
                .map_memory(frames.as_mut(), 2 * PGSIZE, 0x0bff_e000, BlockKind::User)
                .unwrap();
            let thread = proc.active_thread_mut();
            thread.esp = 0x0c00_0000;
            thread.eip = 0x0804_8123;
            thread.gregs = GRegs {
                eax: 0x11,
                ebx: 0x22,
                ecx: 0x33,
                edx: 0x44,
                esi: 0x55,
                edi: 0x66,
            };
        }
        t.current = pid;
        (t, pid)
    }

    #[test]
    fn handled_signal_runs_exactly_once_then_sigreturn_restores() {
        let (mut t, pid) = table_with_user_stack();
        t.get_mut(pid).unwrap().signal_handlers[SIGTERM] = 0x0804_9000;
        post_signal(&mut t, pid, SIGTERM).unwrap();

        check_pending(&mut t, pid);
        {
            let p = t.get(pid).unwrap();
            assert_eq!(p.active_thread().eip, 0x0804_9000);
            assert_eq!(p.pending_signals, 0);
        }
        // A second boundary crossing delivers nothing more.
        let before = t.get(pid).unwrap().active_thread().clone();
        check_pending(&mut t, pid);
        assert_eq!(t.get(pid).unwrap().active_thread().eip, before.eip);

        // Simulate the handler returning into the trampoline: esp has the
        // return address popped off.
        {
            let p = t.get_mut(pid).unwrap();
            let esp = p.active_thread().esp;
            p.active_thread_mut().esp = esp + 4;
        }
        sigreturn(&mut t, pid).unwrap();
        let p = t.get(pid).unwrap();
        let thread = p.active_thread();
        assert_eq!(thread.eip, 0x0804_8123);
        assert_eq!(thread.esp, 0x0c00_0000);
        assert_eq!(
            thread.gregs,
            GRegs {
                eax: 0x11,
                ebx: 0x22,
                ecx: 0x33,
                edx: 0x44,
                esi: 0x55,
                edi: 0x66,
            }
        );
    }

    #[test]
    fn default_terminate_encodes_the_signal_in_the_exit_code() {
        let (mut t, pid) = table_with_user_stack();
        post_signal(&mut t, pid, SIGTERM).unwrap();
        check_pending(&mut t, pid);
        let p = t.get(pid).unwrap();
        assert_eq!(p.status, ProcessStatus::Zombie);
        assert_eq!(
            p.active_thread().gregs.eax,
            EXIT_CONDITION_SIGNAL | SIGTERM as u32
        );
    }

    #[test]
    fn sigkill_on_a_sleeper_means_zombie_without_user_code() {
        let (mut t, pid) = table_with_user_stack();
        // Even an installed handler cannot catch it.
        t.get_mut(pid).unwrap().signal_handlers[SIGKILL] = 0x0804_9000;
        t.wait_thread(pid, 0, ThreadStatus::AsleepIo, 1, 0);
        assert_eq!(t.get(pid).unwrap().status, ProcessStatus::AsleepThreads);

        post_signal(&mut t, pid, SIGKILL).unwrap();
        // Back in the rotation so the kill can be acted on...
        assert_eq!(t.get(pid).unwrap().status, ProcessStatus::Running);
        // ...and the next schedule boundary finishes it without touching
        // the saved eip.
        let eip_before = t.get(pid).unwrap().active_thread().eip;
        check_pending(&mut t, pid);
        let p = t.get(pid).unwrap();
        assert_eq!(p.status, ProcessStatus::Zombie);
        assert_eq!(p.active_thread().eip, eip_before);
    }

    #[test]
    fn sigstop_stops_and_sigchld_is_ignored_by_default() {
        let (mut t, pid) = table_with_user_stack();
        post_signal(&mut t, pid, SIGCHLD).unwrap();
        check_pending(&mut t, pid);
        assert_eq!(t.get(pid).unwrap().status, ProcessStatus::Running);

        post_signal(&mut t, pid, SIGSTOP).unwrap();
        check_pending(&mut t, pid);
        assert_eq!(t.get(pid).unwrap().status, ProcessStatus::AsleepSignal);
        assert!(!t.run_queue.contains(&pid));
    }

    #[test]
    fn pending_signals_deliver_lowest_number_first() {
        let (mut t, pid) = table_with_user_stack();
        t.get_mut(pid).unwrap().signal_handlers[SIGINT] = 0x1;
        t.get_mut(pid).unwrap().signal_handlers[SIGTERM] = 0x2;
        post_signal(&mut t, pid, SIGTERM).unwrap();
        post_signal(&mut t, pid, SIGINT).unwrap();
        let proc = t.get_mut(pid).unwrap();
        let (first, _) = next_pending(proc).unwrap();
        let (second, _) = next_pending(proc).unwrap();
        assert_eq!((first, second), (SIGINT, SIGTERM));
    }

    #[test]
    fn group_broadcast_reaches_every_member() {
        let (mut t, pid) = table_with_user_stack();
        let child = t.fork_current().unwrap();
        let gid = t.get(pid).unwrap().group;
        post_signal_group(&mut t, gid, SIGTERM).unwrap();
        assert_ne!(t.get(pid).unwrap().pending_signals & (1 << SIGTERM), 0);
        assert_ne!(t.get(child).unwrap().pending_signals & (1 << SIGTERM), 0);
    }

    #[test]
    fn invalid_signals_are_rejected() {
        let (mut t, pid) = table_with_user_stack();
        assert_eq!(post_signal(&mut t, pid, 0).unwrap_err(), Errno::InvalidSignal);
        assert_eq!(post_signal(&mut t, pid, NSIG).unwrap_err(), Errno::InvalidSignal);
        assert_eq!(post_signal(&mut t, 99, SIGTERM).unwrap_err(), Errno::InvalidPid);
    }
}
