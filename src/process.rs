//! Processes, threads, groups and sessions.
//!
//! The process table is the kernel's central record: slots indexed by pid,
//! the run queue, the group/session registry and the frame source every
//! address space draws from. Parent links are pids (weak handles); the
//! children list is owned by the parent and entries disappear on reap.

use crate::constants::*;
use crate::elf;
use crate::err::{Errno, KResult};
use crate::paging::{AddressSpace, FrameSource};
use crate::pmm::BlockKind;
use crate::sched;
use crate::usermem;
use crate::vfs::{self, FdRef, OpenMode};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use spin::{Mutex, Once};

pub type Pid = i32;

pub const INVALID_PID: Pid = -1;
pub const INIT_PID: Pid = 1;

pub const EXIT_CONDITION_USER: u32 = 1 << 8;
pub const EXIT_CONDITION_SIGNAL: u32 = 2 << 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Init,
    Running,
    /// Every thread is asleep.
    AsleepThreads,
    /// Stopped by a signal (SIGSTOP).
    AsleepSignal,
    Zombie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Init,
    Running,
    AsleepTime,
    AsleepIrq,
    AsleepIo,
    AsleepChild,
    AsleepMutex,
    Zombie,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GRegs {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SRegs {
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
}

impl Default for SRegs {
    fn default() -> SRegs {
        // User-mode selectors with RPL 3; the boot GDT lays segments out
        // kernel code, kernel data, user code, user data.
        SRegs {
            cs: 0x18 | 3,
            ss: 0x20 | 3,
            ds: 0x20 | 3,
            es: 0x20 | 3,
            fs: 0x20 | 3,
            gs: 0x20 | 3,
        }
    }
}

/// Register snapshot plus the two stacks; exclusively owned by its process.
#[derive(Debug, Clone)]
pub struct Thread {
    pub gregs: GRegs,
    pub sregs: SRegs,
    pub eip: u32,
    pub esp: u32,
    pub ebp: u32,
    pub kesp: u32,
    pub base_stack: u32,
    pub base_kstack: u32,
    pub status: ThreadStatus,
    /// Reason-specific payload: IRQ number, wake tick, IO channel.
    pub sleep_data: [u32; 2],
}

impl Thread {
    pub fn new() -> Thread {
        Thread {
            gregs: GRegs::default(),
            sregs: SRegs::default(),
            eip: 0,
            esp: 0,
            ebp: 0,
            kesp: 0,
            base_stack: 0,
            base_kstack: 0,
            status: ThreadStatus::Init,
            sleep_data: [0; 2],
        }
    }
}

pub struct Group {
    pub gid: i32,
    pub members: Vec<Pid>,
    pub session: u32,
}

pub struct Session {
    pub id: u32,
    pub groups: Vec<i32>,
    pub controlling_tty: Option<usize>,
}

pub struct Process {
    pub pid: Pid,
    pub parent: Pid,
    pub children: Vec<Pid>,
    pub group: i32,
    pub session: u32,
    pub status: ProcessStatus,
    pub space: Option<AddressSpace>,
    /// ELF segment ranges, freed again at exit.
    pub data_loc: Vec<(u32, u32)>,
    pub heap_addr: u32,
    pub heap_size: u32,
    pub files: Vec<Option<FdRef>>,
    pub tty: usize,
    /// User handler entry points; 0 means default action.
    pub signal_handlers: [u32; NSIG],
    /// Pending signal bitmask, delivered lowest-number-first.
    pub pending_signals: u32,
    pub current_dir: String,
    pub threads: Vec<Thread>,
    pub active_thread: usize,
    pub running_threads: VecDeque<usize>,
    pub waiting_threads: Vec<usize>,
}

impl Process {
    /// Finds a free descriptor slot, scanning from 3 (0..2 are reserved)
    /// and doubling the table when it is full.
    pub fn fd_alloc(&mut self, fd: FdRef) -> usize {
        loop {
            for i in 3..self.files.len() {
                if self.files[i].is_none() {
                    self.files[i] = Some(fd);
                    return i;
                }
            }
            let grown = self.files.len() * 2;
            self.files.resize(grown, None);
        }
    }

    pub fn fd_get(&self, n: u32) -> KResult<FdRef> {
        self.files
            .get(n as usize)
            .and_then(|f| f.clone())
            .ok_or(Errno::FileNotFound)
    }

    pub fn fd_take(&mut self, n: u32) -> Option<FdRef> {
        self.files.get_mut(n as usize).and_then(|f| f.take())
    }

    pub fn active_thread(&self) -> &Thread {
        &self.threads[self.active_thread]
    }

    pub fn active_thread_mut(&mut self) -> &mut Thread {
        &mut self.threads[self.active_thread]
    }
}

pub struct ProcessTable {
    pub frames: Box<dyn FrameSource + Send>,
    pub(crate) slots: Vec<Option<Process>>,
    pub current: Pid,
    pub run_queue: VecDeque<Pid>,
    pub groups: BTreeMap<i32, Group>,
    pub sessions: BTreeMap<u32, Session>,
    /// Quanta served to the current process since it got the CPU; drives
    /// the internal thread rotation before the process yields.
    pub threads_served: u32,
    next_session: u32,
}

impl ProcessTable {
    pub fn new(frames: Box<dyn FrameSource + Send>) -> ProcessTable {
        ProcessTable {
            frames,
            slots: Vec::new(),
            current: INVALID_PID,
            run_queue: VecDeque::new(),
            groups: BTreeMap::new(),
            sessions: BTreeMap::new(),
            threads_served: 0,
            next_session: 1,
        }
    }

    fn alloc_pid(&mut self) -> Pid {
        for (i, slot) in self.slots.iter().enumerate().skip(1) {
            if slot.is_none() {
                return i as Pid;
            }
        }
        if self.slots.is_empty() {
            self.slots.push(None); // pid 0 stays unused
        }
        self.slots.push(None);
        (self.slots.len() - 1) as Pid
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        if pid <= 0 {
            return None;
        }
        self.slots.get(pid as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        if pid <= 0 {
            return None;
        }
        self.slots.get_mut(pid as usize).and_then(|s| s.as_mut())
    }

    pub fn current_mut(&mut self) -> KResult<&mut Process> {
        let pid = self.current;
        self.get_mut(pid).ok_or(Errno::InvalidPid)
    }

    pub fn pid_limit(&self) -> Pid {
        self.slots.len() as Pid
    }

    /// Creates a process in its own fresh group (and, for parentless
    /// processes, a fresh session). Children made by `fork_current`
    /// inherit group and session instead.
    pub fn create_process(&mut self, parent: Pid, space: AddressSpace, tty: usize) -> Pid {
        let pid = self.alloc_pid();
        let (group, session) = match self.get(parent) {
            Some(p) => (p.group, p.session),
            None => {
                let sid = self.next_session;
                self.next_session += 1;
                self.sessions.insert(
                    sid,
                    Session {
                        id: sid,
                        groups: Vec::new(),
                        controlling_tty: Some(tty),
                    },
                );
                self.groups.insert(
                    pid,
                    Group {
                        gid: pid,
                        members: Vec::new(),
                        session: sid,
                    },
                );
                self.sessions.get_mut(&sid).unwrap().groups.push(pid);
                (pid, sid)
            }
        };

        let mut thread = Thread::new();
        thread.status = ThreadStatus::Running;
        let process = Process {
            pid,
            parent,
            children: Vec::new(),
            group,
            session,
            status: ProcessStatus::Running,
            space: Some(space),
            data_loc: Vec::new(),
            heap_addr: 0,
            heap_size: 0,
            files: {
                let mut v = Vec::new();
                v.resize(8, None);
                v
            },
            tty,
            signal_handlers: [0; NSIG],
            pending_signals: 0,
            current_dir: "/".to_string(),
            threads: alloc::vec![thread],
            active_thread: 0,
            running_threads: VecDeque::from([0]),
            waiting_threads: Vec::new(),
        };

        self.groups.get_mut(&group).unwrap().members.push(pid);
        self.slots[pid as usize] = Some(process);
        if let Some(p) = self.get_mut(parent) {
            p.children.push(pid);
        }
        self.run_queue.push_back(pid);
        pid
    }

    /// Forks the current process: cloned address space, shared descriptors
    /// with bumped instance counts, inherited group/session, and a child
    /// thread whose saved registers make `fork` return 0 there.
    pub fn fork_current(&mut self) -> KResult<Pid> {
        let parent_pid = self.current;
        let pid = self.alloc_pid();

        let child = {
            let ProcessTable { frames, slots, .. } = self;
            let parent = slots
                .get(parent_pid as usize)
                .and_then(|s| s.as_ref())
                .ok_or(Errno::InvalidPid)?;
            let space = parent
                .space
                .as_ref()
                .ok_or(Errno::Unknown)?
                .copy_address_space(frames.as_mut())?;

            let mut files: Vec<Option<FdRef>> = Vec::with_capacity(parent.files.len());
            for slot in &parent.files {
                match slot {
                    Some(fd) => {
                        fd.write().instances += 1;
                        files.push(Some(fd.clone()));
                    }
                    None => files.push(None),
                }
            }

            let mut thread = parent.active_thread().clone();
            thread.gregs.eax = 0; // fork() returns 0 in the child
            thread.status = ThreadStatus::Running;
            thread.base_kstack = alloc_kstack();
            thread.kesp = sched::forge_fork_kstack(&thread);

            Process {
                pid,
                parent: parent_pid,
                children: Vec::new(),
                group: parent.group,
                session: parent.session,
                status: ProcessStatus::Running,
                space: Some(space),
                data_loc: parent.data_loc.clone(),
                heap_addr: parent.heap_addr,
                heap_size: parent.heap_size,
                files,
                tty: parent.tty,
                signal_handlers: parent.signal_handlers,
                pending_signals: 0,
                current_dir: parent.current_dir.clone(),
                threads: alloc::vec![thread],
                active_thread: 0,
                running_threads: VecDeque::from([0]),
                waiting_threads: Vec::new(),
            }
        };

        self.groups
            .get_mut(&child.group)
            .ok_or(Errno::Unknown)?
            .members
            .push(pid);
        self.slots[pid as usize] = Some(child);
        if let Some(p) = self.get_mut(parent_pid) {
            p.children.push(pid);
        }
        self.run_queue.push_back(pid);
        Ok(pid)
    }

    /// Replaces the current image with the executable behind `fd`.
    /// Returns the new entry point; the caller re-enters user mode there.
    pub fn exec_current(
        &mut self,
        fd: &FdRef,
        argv: Vec<String>,
        env: Vec<String>,
    ) -> KResult<u32> {
        elf::elf_check(fd)?;

        let pid = self.current;
        let ProcessTable { frames, slots, .. } = self;
        let proc = slots
            .get_mut(pid as usize)
            .and_then(|s| s.as_mut())
            .ok_or(Errno::InvalidPid)?;
        let space = proc.space.as_mut().ok_or(Errno::Unknown)?;

        // Tear the old image down: segments, heap, stack, close-on-exec
        // descriptors. argv/env already live in kernel memory.
        for (va, size) in core::mem::take(&mut proc.data_loc) {
            space.unmap_memory_if_mapped(frames.as_mut(), size, va);
        }
        if proc.heap_size > 0 {
            space.unmap_memory_if_mapped(frames.as_mut(), proc.heap_size, proc.heap_addr);
            proc.heap_size = 0;
        }
        space.unmap_memory_if_mapped(
            frames.as_mut(),
            PROCESS_STACK_SIZE_DEFAULT,
            USER_STACK_TOP - PROCESS_STACK_SIZE_DEFAULT,
        );
        for slot in proc.files.iter_mut().skip(3) {
            let close = matches!(slot, Some(fd) if fd.read().mode.contains(OpenMode::CLOEXEC));
            if close {
                if let Some(fd) = slot.take() {
                    vfs::close_file(&fd);
                }
            }
        }

        let (entry, data_loc) = elf::elf_load(fd, space, frames.as_mut())?;
        proc.data_loc = data_loc;
        proc.heap_addr = proc
            .data_loc
            .iter()
            .map(|(va, sz)| page_round_up(va + sz))
            .max()
            .unwrap_or(0x1000_0000);
        proc.heap_size = 0;

        space.map_memory(
            frames.as_mut(),
            PROCESS_STACK_SIZE_DEFAULT,
            USER_STACK_TOP - PROCESS_STACK_SIZE_DEFAULT,
            BlockKind::User,
        )?;
        let esp = build_user_stack(space, frames.as_mut(), &argv, &env)?;

        // Handlers a previous image installed are meaningless now.
        proc.signal_handlers = [0; NSIG];

        let thread = proc.active_thread_mut();
        thread.gregs = GRegs::default();
        thread.sregs = SRegs::default();
        thread.eip = entry;
        thread.esp = esp;
        thread.ebp = esp;
        thread.base_stack = USER_STACK_TOP - PROCESS_STACK_SIZE_DEFAULT;
        Ok(entry)
    }

    /// Turns `pid` into a zombie: user memory is released (the directory
    /// itself stays for the parent to reap), descriptors close, children
    /// are reparented to init, and the parent learns via SIGCHLD.
    pub fn exit_process(&mut self, pid: Pid, code: u32) {
        let parent_pid;
        let orphans;
        {
            let ProcessTable { frames, slots, .. } = self;
            let proc = match slots.get_mut(pid as usize).and_then(|s| s.as_mut()) {
                Some(p) => p,
                None => return,
            };
            if proc.status == ProcessStatus::Zombie {
                return;
            }
            proc.status = ProcessStatus::Zombie;
            if let Some(space) = proc.space.as_mut() {
                space.release_user(frames.as_mut());
            }
            for slot in proc.files.iter_mut() {
                if let Some(fd) = slot.take() {
                    vfs::close_file(&fd);
                }
            }
            // The exit code rides in the saved eax until wait() reads it.
            let active = proc.active_thread;
            proc.threads[active].gregs.eax = code;
            for t in proc.threads.iter_mut() {
                t.status = ThreadStatus::Zombie;
                free_kstack(t.base_kstack);
                t.base_kstack = 0;
            }
            proc.running_threads.clear();
            proc.waiting_threads.clear();
            parent_pid = proc.parent;
            orphans = core::mem::take(&mut proc.children);
        }

        self.run_queue.retain(|&p| p != pid);

        for orphan in orphans {
            if let Some(o) = self.get_mut(orphan) {
                o.parent = INIT_PID;
            }
            if let Some(init) = self.get_mut(INIT_PID) {
                init.children.push(orphan);
            }
        }

        crate::signal::post_signal(self, parent_pid, crate::signal::SIGCHLD).ok();
        self.wake_child_waiters(parent_pid);
    }

    /// Wakes any of `parent`'s threads blocked in wait().
    pub fn wake_child_waiters(&mut self, parent: Pid) {
        let mut wake = false;
        if let Some(p) = self.get_mut(parent) {
            let mut still_waiting = Vec::new();
            for tid in core::mem::take(&mut p.waiting_threads) {
                if p.threads[tid].status == ThreadStatus::AsleepChild {
                    p.threads[tid].status = ThreadStatus::Running;
                    p.running_threads.push_back(tid);
                    wake = true;
                } else {
                    still_waiting.push(tid);
                }
            }
            p.waiting_threads = still_waiting;
            if wake {
                p.status = ProcessStatus::Running;
            }
        }
        if wake && !self.run_queue.contains(&parent) {
            self.run_queue.push_back(parent);
        }
    }

    /// One scan of the children for something reapable. `Ok(None)` means
    /// "nothing yet, sleep and retry"; the syscall layer loops.
    pub fn wait_scan(&mut self, waiter: Pid, sel: i32) -> KResult<Option<(Pid, u32)>> {
        let (children, waiter_group) = {
            let w = self.get(waiter).ok_or(Errno::InvalidPid)?;
            (w.children.clone(), w.group)
        };
        if children.is_empty() {
            return Err(Errno::HasNoChild);
        }
        if sel > 0 && !children.contains(&sel) {
            return Err(Errno::Permission);
        }

        for &child in &children {
            let matched = {
                let c = match self.get(child) {
                    Some(c) => c,
                    None => continue,
                };
                if c.status != ProcessStatus::Zombie {
                    continue;
                }
                match sel {
                    s if s < -1 => c.group == -s,
                    -1 => true,
                    0 => c.group == waiter_group,
                    s => c.pid == s,
                }
            };
            if matched {
                let code = self.reap(child);
                return Ok(Some((child, code)));
            }
        }
        Ok(None)
    }

    /// Frees everything the zombie still holds and unlinks it.
    fn reap(&mut self, pid: Pid) -> u32 {
        let code;
        let parent;
        let group;
        {
            let ProcessTable { frames, slots, .. } = self;
            let proc = slots
                .get_mut(pid as usize)
                .and_then(|s| s.take())
                .expect("reaping a missing process");
            code = proc.threads[proc.active_thread].gregs.eax;
            parent = proc.parent;
            group = proc.group;
            if let Some(space) = proc.space {
                space.release(frames.as_mut());
            }
        }
        if let Some(p) = self.get_mut(parent) {
            p.children.retain(|&c| c != pid);
        }
        if let Some(g) = self.groups.get_mut(&group) {
            g.members.retain(|&m| m != pid);
        }
        self.run_queue.retain(|&p| p != pid);
        code
    }

    /// Grows the current process heap by `incr` bytes and returns the old
    /// break.
    pub fn sbrk_current(&mut self, incr: u32) -> KResult<u32> {
        let pid = self.current;
        let ProcessTable { frames, slots, .. } = self;
        let proc = slots
            .get_mut(pid as usize)
            .and_then(|s| s.as_mut())
            .ok_or(Errno::InvalidPid)?;
        let old_break = proc.heap_addr + proc.heap_size;
        if incr > 0 {
            let space = proc.space.as_mut().ok_or(Errno::Unknown)?;
            space.map_memory_if_not_mapped(frames.as_mut(), incr, old_break, BlockKind::User)?;
            proc.heap_size += incr;
        }
        Ok(old_break)
    }

    /// Removes `tid` from the run queue of `pid`, tagging it with a sleep
    /// reason. When the last runnable thread goes, the whole process leaves
    /// the scheduler rotation.
    pub fn wait_thread(&mut self, pid: Pid, tid: usize, status: ThreadStatus, d1: u32, d2: u32) {
        let all_asleep = {
            let p = match self.get_mut(pid) {
                Some(p) => p,
                None => return,
            };
            p.threads[tid].status = status;
            p.threads[tid].sleep_data = [d1, d2];
            p.running_threads.retain(|&t| t != tid);
            if !p.waiting_threads.contains(&tid) {
                p.waiting_threads.push(tid);
            }
            p.running_threads.is_empty()
        };
        if all_asleep {
            if let Some(p) = self.get_mut(pid) {
                if p.status == ProcessStatus::Running {
                    p.status = ProcessStatus::AsleepThreads;
                }
            }
            self.run_queue.retain(|&q| q != pid);
        }
    }

    /// Moves every waiting thread matching the predicate back to its run
    /// queue, re-enqueueing the owning process.
    pub fn wake_threads(&mut self, matches: impl Fn(ThreadStatus, [u32; 2]) -> bool) {
        let pids: Vec<Pid> = (1..=self.pid_limit()).collect();
        for pid in pids {
            let woke = {
                let p = match self.get_mut(pid) {
                    Some(p) => p,
                    None => continue,
                };
                let mut woke = false;
                let mut still = Vec::new();
                for tid in core::mem::take(&mut p.waiting_threads) {
                    if matches(p.threads[tid].status, p.threads[tid].sleep_data) {
                        p.threads[tid].status = ThreadStatus::Running;
                        p.threads[tid].sleep_data = [0, 0];
                        p.running_threads.push_back(tid);
                        woke = true;
                    } else {
                        still.push(tid);
                    }
                }
                p.waiting_threads = still;
                if woke && p.status == ProcessStatus::AsleepThreads {
                    p.status = ProcessStatus::Running;
                }
                woke
            };
            if woke && !self.run_queue.contains(&pid) {
                self.run_queue.push_back(pid);
            }
        }
    }

    /// Moves `pid` into group `gid`, creating the group in the process's
    /// session on first use.
    pub fn setgroup(&mut self, gid: i32, pid: Pid) -> KResult<()> {
        let (old_group, session) = {
            let p = self.get(pid).ok_or(Errno::InvalidPid)?;
            (p.group, p.session)
        };
        if old_group == gid {
            return Ok(());
        }
        if let Some(g) = self.groups.get_mut(&old_group) {
            g.members.retain(|&m| m != pid);
        }
        let group = self.groups.entry(gid).or_insert_with(|| Group {
            gid,
            members: Vec::new(),
            session,
        });
        group.members.push(pid);
        let session_groups = &mut self.sessions.get_mut(&session).ok_or(Errno::Unknown)?.groups;
        if !session_groups.contains(&gid) {
            session_groups.push(gid);
        }
        let p = self.get_mut(pid).ok_or(Errno::InvalidPid)?;
        p.group = gid;
        Ok(())
    }
}

fn build_user_stack(
    space: &AddressSpace,
    fs: &mut dyn FrameSource,
    argv: &[String],
    env: &[String],
) -> KResult<u32> {
    let mut sp = USER_STACK_TOP;
    let mut push_str = |sp: &mut u32, s: &str| -> KResult<u32> {
        *sp -= s.len() as u32 + 1;
        usermem::copy_to_user(space, fs, *sp, s.as_bytes())?;
        usermem::copy_to_user(space, fs, *sp + s.len() as u32, &[0])?;
        Ok(*sp)
    };

    let mut env_ptrs = Vec::with_capacity(env.len());
    for s in env.iter().rev() {
        env_ptrs.push(push_str(&mut sp, s)?);
    }
    env_ptrs.reverse();
    let mut arg_ptrs = Vec::with_capacity(argv.len());
    for s in argv.iter().rev() {
        arg_ptrs.push(push_str(&mut sp, s)?);
    }
    arg_ptrs.reverse();

    sp &= !3;
    let mut push_word = |sp: &mut u32, w: u32| -> KResult<()> {
        *sp -= 4;
        usermem::copy_to_user(space, fs, *sp, &w.to_le_bytes())
    };

    push_word(&mut sp, 0)?;
    for &p in env_ptrs.iter().rev() {
        push_word(&mut sp, p)?;
    }
    let envp = sp;
    push_word(&mut sp, 0)?;
    for &p in arg_ptrs.iter().rev() {
        push_word(&mut sp, p)?;
    }
    let argvp = sp;

    push_word(&mut sp, envp)?;
    push_word(&mut sp, argvp)?;
    push_word(&mut sp, argv.len() as u32)?;
    Ok(sp)
}

#[cfg(target_arch = "x86")]
fn alloc_kstack() -> u32 {
    crate::kheap::kmalloc(PROCESS_KSTACK_SIZE_DEFAULT as usize) as u32
}

#[cfg(not(target_arch = "x86"))]
fn alloc_kstack() -> u32 {
    0
}

#[cfg(target_arch = "x86")]
fn free_kstack(base: u32) {
    if base != 0 {
        crate::kheap::kfree(base as *mut u8);
    }
}

#[cfg(not(target_arch = "x86"))]
fn free_kstack(_base: u32) {}

static PROCS: Once<Mutex<ProcessTable>> = Once::new();

/// Installs the process table with a specific frame source (boot does this
/// with the physical allocator; tests hand in an arena).
pub fn init_table(frames: Box<dyn FrameSource + Send>) {
    PROCS.call_once(|| Mutex::new(ProcessTable::new(frames)));
}

pub fn table() -> &'static Mutex<ProcessTable> {
    PROCS.call_once(|| Mutex::new(ProcessTable::new(Box::new(crate::paging::PhysFrames))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::tests::ArenaFrames;
    use crate::paging::AddressSpace;

    pub(crate) fn fresh_table() -> ProcessTable {
        ProcessTable::new(Box::new(ArenaFrames::new()))
    }

    pub(crate) fn spawn(table: &mut ProcessTable, parent: Pid) -> Pid {
        let space = AddressSpace::new(table.frames.as_mut()).unwrap();
        table.create_process(parent, space, 0)
    }

    #[test]
    fn fork_shares_descriptors_with_bumped_instances() {
        let mut t = fresh_table();
        let init = spawn(&mut t, INVALID_PID);
        t.current = init;

        // Give the parent something mapped and an open descriptor.
        {
            let proc = t.current_mut().unwrap();
            let fd = alloc::sync::Arc::new(spin::RwLock::new(vfs::Fd {
                file: dummy_node(),
                offset: 5,
                mode: OpenMode::READ,
                instances: 1,
                path: "/x".to_string(),
            }));
            assert_eq!(proc.fd_alloc(fd), 3);
        }
        {
            let ProcessTable { frames, slots, .. } = &mut t;
            let proc = slots[init as usize].as_mut().unwrap();
            proc.space
                .as_mut()
                .unwrap()
                .map_memory(frames.as_mut(), PGSIZE, 0x0800_0000, BlockKind::User)
                .unwrap();
        }

        let child = t.fork_current().unwrap();
        assert_ne!(child, init);

        let parent_fd = t.get(init).unwrap().fd_get(3).unwrap();
        let child_fd = t.get(child).unwrap().fd_get(3).unwrap();
        assert!(alloc::sync::Arc::ptr_eq(&parent_fd, &child_fd));
        assert_eq!(parent_fd.read().instances, 2);

        // The child's saved registers answer 0 from fork.
        assert_eq!(t.get(child).unwrap().active_thread().gregs.eax, 0);
        // Inherited group and session, child listed under the parent.
        assert_eq!(t.get(child).unwrap().group, t.get(init).unwrap().group);
        assert!(t.get(init).unwrap().children.contains(&child));
        // Address spaces are distinct directories.
        let ppd = t.get(init).unwrap().space.as_ref().unwrap().dir_phys();
        let cpd = t.get(child).unwrap().space.as_ref().unwrap().dir_phys();
        assert_ne!(ppd, cpd);
    }

    #[test]
    fn exit_then_wait_reaps_with_user_condition() {
        let mut t = fresh_table();
        let init = spawn(&mut t, INVALID_PID);
        t.current = init;
        let child = t.fork_current().unwrap();

        t.exit_process(child, EXIT_CONDITION_USER | 7);
        assert_eq!(t.get(child).unwrap().status, ProcessStatus::Zombie);
        // SIGCHLD is pending on the parent.
        assert_ne!(t.get(init).unwrap().pending_signals & (1 << crate::signal::SIGCHLD), 0);

        let (pid, code) = t.wait_scan(init, -1).unwrap().expect("zombie to reap");
        assert_eq!(pid, child);
        assert_eq!(code, EXIT_CONDITION_USER | 7);
        // Fully unlinked.
        assert!(t.get(child).is_none());
        assert!(!t.get(init).unwrap().children.contains(&child));
    }

    #[test]
    fn wait_selectors_filter_by_pid_and_group() {
        let mut t = fresh_table();
        let init = spawn(&mut t, INVALID_PID);
        t.current = init;
        let a = t.fork_current().unwrap();
        let b = t.fork_current().unwrap();

        // Move b into its own group.
        t.setgroup(100, b).unwrap();
        t.exit_process(b, EXIT_CONDITION_USER | 1);

        // Waiting specifically for a: nothing yet.
        assert_eq!(t.wait_scan(init, a).unwrap(), None);
        // Waiting for group 100 via the negative selector finds b.
        let (pid, _) = t.wait_scan(init, -100).unwrap().unwrap();
        assert_eq!(pid, b);
        // Waiting for a pid that is not a child at all is refused.
        assert_eq!(t.wait_scan(init, 4242).unwrap_err(), Errno::Permission);
    }

    #[test]
    fn wait_without_children_reports_has_no_child() {
        let mut t = fresh_table();
        let lone = spawn(&mut t, INVALID_PID);
        assert_eq!(t.wait_scan(lone, -1).unwrap_err(), Errno::HasNoChild);
    }

    #[test]
    fn orphans_are_reparented_to_init() {
        let mut t = fresh_table();
        let init = spawn(&mut t, INVALID_PID);
        assert_eq!(init, INIT_PID);
        t.current = init;
        let middle = t.fork_current().unwrap();
        t.current = middle;
        let grandchild = t.fork_current().unwrap();

        t.exit_process(middle, EXIT_CONDITION_USER);
        assert_eq!(t.get(grandchild).unwrap().parent, INIT_PID);
        assert!(t.get(init).unwrap().children.contains(&grandchild));
    }

    #[test]
    fn sbrk_maps_pages_and_returns_the_old_break() {
        let mut t = fresh_table();
        let p = spawn(&mut t, INVALID_PID);
        t.current = p;
        {
            let proc = t.current_mut().unwrap();
            proc.heap_addr = 0x0900_0000;
        }
        let old = t.sbrk_current(3 * PGSIZE).unwrap();
        assert_eq!(old, 0x0900_0000);
        let old2 = t.sbrk_current(0).unwrap();
        assert_eq!(old2, 0x0900_0000 + 3 * PGSIZE);

        let ProcessTable { frames, slots, .. } = &mut t;
        let proc = slots[p as usize].as_ref().unwrap();
        let space = proc.space.as_ref().unwrap();
        assert!(space.is_mapped(frames.as_mut(), 0x0900_2fff));
        assert!(!space.is_mapped(frames.as_mut(), 0x0900_3000));
    }

    #[test]
    fn exec_replaces_the_image_and_builds_the_stack() {
        use crate::ext2::{mkfs, Ext2Fs};
        use crate::vfs::{FileAttributes, Vfs};

        let mut t = fresh_table();
        let p = spawn(&mut t, INVALID_PID);
        t.current = p;

        let fsys = Ext2Fs::mount(mkfs::ram_image(256, 16)).unwrap().into_filesystem();
        let mut v = Vfs::new();
        v.mount("/", fsys).unwrap();
        v.create_file("/prog", FileAttributes::empty()).unwrap();
        let fd = v.open_file("/prog", OpenMode::READ | OpenMode::WRITE).unwrap();
        let img = crate::elf::mkelf::image(0x0804_8000, b"\xb8\x01\x00\x00\x00", 0x1000, 0x0804_8000);
        vfs::write_file(&fd, &img).unwrap();

        let entry = t
            .exec_current(&fd, alloc::vec!["prog".to_string(), "-v".to_string()], alloc::vec!["TERM=vk".to_string()])
            .unwrap();
        assert_eq!(entry, 0x0804_8000);

        let ProcessTable { frames, slots, .. } = &mut t;
        let proc = slots[p as usize].as_ref().unwrap();
        let space = proc.space.as_ref().unwrap();
        let thread = proc.active_thread();
        assert_eq!(thread.eip, 0x0804_8000);

        // esp points at argc; argv strings are readable through the array.
        let mut word = [0u8; 4];
        usermem::copy_from_user(space, frames.as_mut(), thread.esp, &mut word).unwrap();
        assert_eq!(u32::from_le_bytes(word), 2); // argc
        usermem::copy_from_user(space, frames.as_mut(), thread.esp + 4, &mut word).unwrap();
        let argv_base = u32::from_le_bytes(word);
        usermem::copy_from_user(space, frames.as_mut(), argv_base, &mut word).unwrap();
        let argv0 = u32::from_le_bytes(word);
        assert_eq!(
            usermem::str_from_user(space, frames.as_mut(), argv0, 32).unwrap(),
            "prog"
        );
        usermem::copy_from_user(space, frames.as_mut(), argv_base + 4, &mut word).unwrap();
        let argv1 = u32::from_le_bytes(word);
        assert_eq!(
            usermem::str_from_user(space, frames.as_mut(), argv1, 32).unwrap(),
            "-v"
        );
        // Terminating NULL after argv[1].
        usermem::copy_from_user(space, frames.as_mut(), argv_base + 8, &mut word).unwrap();
        assert_eq!(u32::from_le_bytes(word), 0);

        // Heap starts above the loaded segment.
        assert_eq!(proc.heap_addr, 0x0804_9000);
    }

    fn dummy_node() -> crate::vfs::NodeRef {
        use crate::vfs::*;
        let fs = crate::devfs::DevFs::new_filesystem();
        match &fs.specific {
            FsSpec::Devfs(d) => d.root(&fs).unwrap(),
            _ => unreachable!(),
        }
    }
}
