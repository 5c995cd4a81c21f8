//! Trap handling: the IDT, the trap frame, and the dispatch glue between
//! hardware events and the kernel proper.
//!
//! The assembly stubs push a `Trapframe` and call `trap`; on the way back
//! out pending signals are resolved and the (possibly rewritten) thread
//! state is reloaded into the frame, so exec and signal delivery take
//! effect at the iret. Handlers never touch registers themselves: the
//! system-call dispatcher returns a `(value, status)` pair and this glue
//! writes it into eax/ecx.

#![allow(dead_code)]

use crate::process::{GRegs, ProcessStatus, Thread};
use crate::x86;

pub(crate) mod consts {
    // CPU-defined vectors.
    pub(crate) const T_DIVIDE: u32 = 0;
    pub(crate) const T_DEBUG: u32 = 1;
    pub(crate) const T_NMI: u32 = 2;
    pub(crate) const T_BRKPT: u32 = 3;
    pub(crate) const T_OFLOW: u32 = 4;
    pub(crate) const T_BOUND: u32 = 5;
    pub(crate) const T_ILLOP: u32 = 6;
    pub(crate) const T_DEVICE: u32 = 7;
    pub(crate) const T_DBLFLT: u32 = 8;
    pub(crate) const T_TSS: u32 = 10;
    pub(crate) const T_SEGNP: u32 = 11;
    pub(crate) const T_STACK: u32 = 12;
    pub(crate) const T_GPFLT: u32 = 13;
    pub(crate) const T_PGFLT: u32 = 14;
    pub(crate) const T_FPERR: u32 = 16;

    /// Software interrupt vector for system calls (`int $0x30`).
    pub(crate) const T_SYSCALL: u32 = 48;

    /// Hardware IRQs arrive at `IRQ_OFFSET + n`.
    pub(crate) const IRQ_OFFSET: u32 = 32;
    pub(crate) const IRQ_TIMER: u32 = 0;
    pub(crate) const IRQ_KBD: u32 = 1;
    pub(crate) const IRQ_IDE: u32 = 14;

    pub(crate) const GDT_KERNEL_CODE: u16 = 0x08;
    pub(crate) const GDT_KERNEL_DATA: u16 = 0x10;
}

use consts::*;

/// Registers as pushed by pusha.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct PushRegs {
    pub reg_edi: u32,
    pub reg_esi: u32,
    pub reg_ebp: u32,
    pub reg_oesp: u32, // useless
    pub reg_ebx: u32,
    pub reg_edx: u32,
    pub reg_ecx: u32,
    pub reg_eax: u32,
}

/// Everything the entry stub pushes, plus what the CPU pushed before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct Trapframe {
    pub tf_regs: PushRegs,
    pub tf_es: u16,
    pub tf_padding1: u16,
    pub tf_ds: u16,
    pub tf_padding2: u16,
    pub tf_trapno: u32,
    // Pushed by the hardware (and the error-code stubs).
    pub tf_err: u32,
    pub tf_eip: u32,
    pub tf_cs: u16,
    pub tf_padding3: u16,
    pub tf_eflags: u32,
    // Only present when crossing rings.
    pub tf_esp: u32,
    pub tf_ss: u16,
    pub tf_padding4: u16,
}

impl Trapframe {
    /// Rebuilds a user-mode frame from saved thread state; used both on the
    /// trap return path and when forging a forked thread's first frame.
    pub fn from_thread(t: &Thread) -> Trapframe {
        Trapframe {
            tf_regs: PushRegs {
                reg_edi: t.gregs.edi,
                reg_esi: t.gregs.esi,
                reg_ebp: t.ebp,
                reg_oesp: 0,
                reg_ebx: t.gregs.ebx,
                reg_edx: t.gregs.edx,
                reg_ecx: t.gregs.ecx,
                reg_eax: t.gregs.eax,
            },
            tf_es: t.sregs.es,
            tf_padding1: 0,
            tf_ds: t.sregs.ds,
            tf_padding2: 0,
            tf_trapno: 0,
            tf_err: 0,
            tf_eip: t.eip,
            tf_cs: t.sregs.cs,
            tf_padding3: 0,
            tf_eflags: x86::FL_IF,
            tf_esp: t.esp,
            tf_ss: t.sregs.ss,
            tf_padding4: 0,
        }
    }

    /// Stores this frame into a thread record (trap-entry snapshot).
    pub fn save_into(&self, t: &mut Thread) {
        t.gregs = GRegs {
            eax: self.tf_regs.reg_eax,
            ebx: self.tf_regs.reg_ebx,
            ecx: self.tf_regs.reg_ecx,
            edx: self.tf_regs.reg_edx,
            esi: self.tf_regs.reg_esi,
            edi: self.tf_regs.reg_edi,
        };
        t.eip = self.tf_eip;
        t.esp = self.tf_esp;
        t.ebp = self.tf_regs.reg_ebp;
        t.sregs.cs = self.tf_cs;
        t.sregs.ss = self.tf_ss;
        t.sregs.ds = self.tf_ds;
        t.sregs.es = self.tf_es;
    }
}

fn trapname(trapno: u32) -> &'static str {
    match trapno {
        T_DIVIDE => "Divide error",
        T_DEBUG => "Debug",
        T_NMI => "Non-Maskable Interrupt",
        T_BRKPT => "Breakpoint",
        T_OFLOW => "Overflow",
        T_BOUND => "BOUND Range Exceeded",
        T_ILLOP => "Invalid Opcode",
        T_DEVICE => "Device Not Available",
        T_DBLFLT => "Double Fault",
        T_TSS => "Invalid TSS",
        T_SEGNP => "Segment Not Present",
        T_STACK => "Stack Fault",
        T_GPFLT => "General Protection",
        T_PGFLT => "Page Fault",
        T_FPERR => "x87 FPU Floating-Point Error",
        T_SYSCALL => "System call",
        _ => "(unknown trap)",
    }
}

#[cfg(target_arch = "x86")]
mod idt {
    use super::consts::*;
    use crate::x86;
    use core::mem;

    // System segment type bits: 32-bit interrupt / trap gates.
    const STS_IG32: u8 = 0xe;
    const STS_TG32: u8 = 0xf;

    #[repr(C, align(8))]
    #[derive(Clone, Copy)]
    struct GateDesc {
        offsetl: u16,
        selector: u16,
        count: u8,
        typ: u8,
        offseth: u16,
    }

    impl GateDesc {
        const fn empty() -> GateDesc {
            GateDesc {
                offsetl: 0,
                selector: 0,
                count: 0,
                typ: 0,
                offseth: 0,
            }
        }

        fn new(istrap: bool, sel: u16, off: u32, dpl: u8) -> GateDesc {
            let typ = if istrap { STS_TG32 } else { STS_IG32 };
            GateDesc {
                offsetl: (off & 0xffff) as u16,
                selector: sel,
                count: 0,
                typ: typ | (dpl << 5) | (1 << 7),
                offseth: (off >> 16) as u16,
            }
        }
    }

    #[repr(C, packed)]
    struct DescriptorTablePointer {
        limit: u16,
        base: u32,
    }

    #[repr(align(4096))]
    struct InterruptDescriptorTable([GateDesc; 256]);

    static mut IDT: InterruptDescriptorTable = InterruptDescriptorTable([GateDesc::empty(); 256]);

    extern "C" {
        static vectors: [u32; 49];
    }

    pub(super) unsafe fn init() {
        for i in 0..20 {
            IDT.0[i] = GateDesc::new(false, GDT_KERNEL_CODE, vectors[i], 0);
        }
        for irq in 32..48 {
            IDT.0[irq] = GateDesc::new(false, GDT_KERNEL_CODE, vectors[irq], 0);
        }
        // The system call gate is reachable from ring 3.
        IDT.0[T_SYSCALL as usize] = GateDesc::new(false, GDT_KERNEL_CODE, vectors[T_SYSCALL as usize], 3);

        let ptr = DescriptorTablePointer {
            limit: (mem::size_of::<InterruptDescriptorTable>() - 1) as u16,
            base: core::ptr::addr_of!(IDT) as u32,
        };
        core::arch::asm!("lidt [{}]", in(reg) &ptr, options(nostack));
        let _ = x86::read_eflags();
    }
}

/// 8259A programmable interrupt controller glue.
mod pic {
    use crate::x86;

    const PIC1_CMD: u16 = 0x20;
    const PIC1_DATA: u16 = 0x21;
    const PIC2_CMD: u16 = 0xa0;
    const PIC2_DATA: u16 = 0xa1;

    /// Remaps IRQs 0..15 onto vectors 32..47 and unmasks the lines the
    /// kernel cares about (timer, keyboard, cascade, IDE).
    pub(super) fn init() {
        x86::outb(PIC1_CMD, 0x11);
        x86::outb(PIC2_CMD, 0x11);
        x86::outb(PIC1_DATA, 32);
        x86::outb(PIC2_DATA, 40);
        x86::outb(PIC1_DATA, 1 << 2);
        x86::outb(PIC2_DATA, 2);
        x86::outb(PIC1_DATA, 0x01);
        x86::outb(PIC2_DATA, 0x01);

        x86::outb(PIC1_DATA, !((1 << 0) | (1 << 1) | (1 << 2)) as u8);
        x86::outb(PIC2_DATA, !(1 << 6) as u8);
    }

    pub(super) fn eoi(irq: u32) {
        if irq >= 8 {
            x86::outb(PIC2_CMD, 0x20);
        }
        x86::outb(PIC1_CMD, 0x20);
    }
}

/// Installs the IDT and brings the interrupt controller up.
pub fn trap_init() {
    #[cfg(target_arch = "x86")]
    unsafe {
        idt::init();
    }
    pic::init();
}

/// One trap, start to finish. Runs with interrupts disabled.
fn trap_dispatch(tf: &mut Trapframe) {
    let mut reschedule = false;
    let trapno = tf.tf_trapno;
    match trapno {
        n if n == IRQ_OFFSET + IRQ_TIMER => {
            pic::eoi(IRQ_TIMER);
            reschedule = crate::sched::on_timer();
        }
        n if n == IRQ_OFFSET + IRQ_KBD => {
            crate::kbd::kbd_intr();
            pic::eoi(IRQ_KBD);
        }
        n if n == IRQ_OFFSET + IRQ_IDE => {
            crate::sched::irq_wakeup(IRQ_IDE);
            pic::eoi(IRQ_IDE);
        }
        T_SYSCALL => {
            let (value, status) = crate::syscall::syscall(
                tf.tf_regs.reg_eax,
                tf.tf_regs.reg_ebx,
                tf.tf_regs.reg_ecx,
                tf.tf_regs.reg_edx,
            );
            tf.tf_regs.reg_eax = value;
            tf.tf_regs.reg_ecx = status as u32;
        }
        n => {
            let trapno = n;
            let eip = tf.tf_eip;
            log::error!("unexpected trap {} ({}) at {:#x}", trapno, trapname(trapno), eip);
            if tf.tf_cs & 3 == 0 {
                panic!("unhandled trap in kernel");
            }
            // A faulting user process does not get to continue.
            let mut table = crate::process::table().lock();
            let pid = table.current;
            table.exit_process(pid, crate::process::EXIT_CONDITION_SIGNAL | 11);
            reschedule = true;
        }
    }

    // Signals fire on the way back to user mode; the handler may rewrite
    // the thread state or turn the process into a zombie.
    let stopped = {
        let mut table = crate::process::table().lock();
        let pid = table.current;
        if tf.tf_cs & 3 == 3 {
            crate::signal::check_pending(&mut table, pid);
        }
        !matches!(
            table.get(pid).map(|p| p.status),
            Some(ProcessStatus::Running) | Some(ProcessStatus::Init)
        )
    };
    if stopped || reschedule {
        crate::sched::schedule();
    }
}

/// Entry from the assembly stub.
#[no_mangle]
pub extern "C" fn trap(orig_tf: *mut Trapframe) {
    let tf = unsafe { orig_tf.as_mut().expect("null trap frame") };

    // A trap from user mode snapshots the register file into the thread
    // record first, so fork and signal delivery observe the trap moment.
    if tf.tf_cs & 3 == 3 {
        let mut table = crate::process::table().lock();
        if let Ok(proc) = table.current_mut() {
            let tid = proc.active_thread;
            tf.save_into(&mut proc.threads[tid]);
        }
    }

    trap_dispatch(tf);

    // Reload the frame from the thread: exec and signal delivery work by
    // editing the saved state, and this is where the edit takes effect.
    if tf.tf_cs & 3 == 3 {
        let trapno = tf.tf_trapno;
        let mut table = crate::process::table().lock();
        if let Ok(proc) = table.current_mut() {
            let thread = proc.active_thread().clone();
            let eax = tf.tf_regs.reg_eax;
            let ecx = tf.tf_regs.reg_ecx;
            let eip_moved = thread.eip != tf.tf_eip;
            *tf = Trapframe::from_thread(&thread);
            if trapno == T_SYSCALL && !eip_moved {
                // The return pair wins over the snapshot.
                tf.tf_regs.reg_eax = eax;
                tf.tf_regs.reg_ecx = ecx;
            }
        }
    }
}
