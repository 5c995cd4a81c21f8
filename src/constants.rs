//! Memory layout and kernel-wide constants.

pub(crate) const KERNEL_BASE: u32 = 0xc0000000;
pub(crate) const PGSIZE: u32 = 4096;
pub(crate) const PGSHIFT: u32 = 12;
pub(crate) const NPDENTRIES: usize = 1024;
pub(crate) const NPTENTRIES: usize = 1024;
/// Virtual span covered by one page table.
pub(crate) const PTSIZE: u32 = (NPTENTRIES as u32) * PGSIZE;

/// First directory slot of the kernel quarter (virtual >= KERNEL_BASE).
pub(crate) const KERNEL_PDX: usize = (KERNEL_BASE / PTSIZE) as usize;

/// Kernel heap window: starts right above the kernel image mapping and may
/// grow up to the limit, one page at a time.
pub(crate) const KHEAP_BASE_START: u32 = 0xc0800000;
pub(crate) const KHEAP_BASE_SIZE: u32 = 0x0040_0000; // 4 MiB
pub(crate) const KHEAP_LIMIT: u32 = 0xe0000000;

/// Transient kernel virtual mappings are handed out above this address.
pub(crate) const FREE_KVM_START: u32 = 0xe0800000;
pub(crate) const FREE_KVM_END: u32 = 0xff000000;

/// Top of a user address space; everything above belongs to the kernel.
pub(crate) const USER_TOP: u32 = KERNEL_BASE;
pub(crate) const USER_STACK_TOP: u32 = USER_TOP;

pub(crate) const PROCESS_STACK_SIZE_DEFAULT: u32 = 8192;
pub(crate) const PROCESS_KSTACK_SIZE_DEFAULT: u32 = 8192;

/// Timer ticks a thread may run before the scheduler rotates.
pub(crate) const SCHEDULER_QUANTUM: u32 = 4;

pub(crate) const NSIG: usize = 32;

pub(crate) const fn page_round_up(v: u32) -> u32 {
    (v + PGSIZE - 1) & !(PGSIZE - 1)
}

pub(crate) const fn page_round_down(v: u32) -> u32 {
    v & !(PGSIZE - 1)
}
