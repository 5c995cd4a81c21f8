//! Paging layer.
//!
//! Owns the kernel page directory and the per-process directories. A
//! directory is an array of 1024 entries; each entry is empty, a mapped
//! large page, or a reference to a page table. The top quarter of every
//! directory (virtual >= `KERNEL_BASE`) aliases the kernel directory's
//! tables by reference, so kernel mappings are visible in every address
//! space; everything below is owned by the individual space.
//!
//! Frames (for both payload pages and page tables) come through the
//! [`FrameSource`] seam: the real kernel hands out physical blocks and
//! reaches them through the linear map, unit tests substitute an in-memory
//! arena.

use crate::constants::*;
use crate::err::{Errno, KResult};
use crate::pmm::{self, BlockKind};
use crate::x86;
use bitflags::bitflags;
use core::ptr;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
        /// 4 MiB page (directory entries only).
        const LARGE    = 1 << 7;
    }
}

const FRAME_MASK: u32 = 0xffff_f000;
const LARGE_MASK: u32 = 0xffc0_0000;

pub(crate) fn pdx(va: u32) -> usize {
    (va >> 22) as usize
}

pub(crate) fn ptx(va: u32) -> usize {
    ((va >> 12) & 0x3ff) as usize
}

/// Where page frames come from and how the kernel touches their contents.
pub trait FrameSource {
    fn alloc_frame(&mut self, kind: BlockKind) -> Option<u32>;
    fn free_frame(&mut self, pa: u32);
    /// Pointer through which the calling context can access the frame.
    fn frame_ptr(&mut self, pa: u32) -> *mut u8;

    fn copy_frame(&mut self, dst: u32, src: u32) {
        let s = self.frame_ptr(src);
        let d = self.frame_ptr(dst);
        unsafe { ptr::copy_nonoverlapping(s, d, PGSIZE as usize) };
    }
}

/// The kernel's frame source: physical blocks from the block list, reached
/// through the linear map of low RAM at `KERNEL_BASE`.
pub struct PhysFrames;

impl FrameSource for PhysFrames {
    fn alloc_frame(&mut self, kind: BlockKind) -> Option<u32> {
        let pa = pmm::physical().reserve_block(PGSIZE, kind);
        if pa == 0 {
            None
        } else {
            Some(pa)
        }
    }

    fn free_frame(&mut self, pa: u32) {
        pmm::physical().free_block(pa);
    }

    fn frame_ptr(&mut self, pa: u32) -> *mut u8 {
        (pa + KERNEL_BASE) as *mut u8
    }
}

fn read_entry(fs: &mut dyn FrameSource, table_pa: u32, idx: usize) -> u32 {
    unsafe { *(fs.frame_ptr(table_pa) as *const u32).add(idx) }
}

fn write_entry(fs: &mut dyn FrameSource, table_pa: u32, idx: usize, val: u32) {
    unsafe { *(fs.frame_ptr(table_pa) as *mut u32).add(idx) = val };
}

fn zero_frame(fs: &mut dyn FrameSource, pa: u32) {
    unsafe { ptr::write_bytes(fs.frame_ptr(pa), 0, PGSIZE as usize) };
}

/// A page directory and the tables it owns.
pub struct AddressSpace {
    dir: u32,
}

impl AddressSpace {
    /// Allocates an empty directory.
    pub fn new(fs: &mut dyn FrameSource) -> KResult<AddressSpace> {
        let dir = fs.alloc_frame(BlockKind::Kernel).ok_or(Errno::Unknown)?;
        zero_frame(fs, dir);
        Ok(AddressSpace { dir })
    }

    pub fn dir_phys(&self) -> u32 {
        self.dir
    }

    /// Loads this directory into CR3.
    pub fn switch(&self) {
        x86::lcr3(self.dir);
    }

    /// Copies the kernel-quarter entries of `kernel` into this directory,
    /// aliasing the kernel's page tables. The kernel directory populates all
    /// of its quarter's tables at boot, so the aliases never go stale.
    pub fn adopt_kernel_quarter(&mut self, fs: &mut dyn FrameSource, kernel: &AddressSpace) {
        for i in KERNEL_PDX..NPDENTRIES {
            let e = read_entry(fs, kernel.dir, i);
            write_entry(fs, self.dir, i, e);
        }
    }

    /// Installs a 4 MiB large-page mapping (boot linear map).
    pub fn map_large(&mut self, fs: &mut dyn FrameSource, phys: u32, va: u32) {
        let e = (phys & LARGE_MASK)
            | (PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::LARGE).bits();
        write_entry(fs, self.dir, pdx(va), e);
    }

    /// Pre-creates empty page tables for `[from, to)` so that later
    /// fine-grained kernel mappings never add a directory entry that
    /// existing address spaces would miss.
    pub fn ensure_tables(&mut self, fs: &mut dyn FrameSource, from: u32, to: u32) -> KResult<()> {
        let mut va = from & !(PTSIZE - 1);
        while va < to {
            self.table_for(fs, va, true)?;
            match va.checked_add(PTSIZE) {
                Some(next) => va = next,
                None => break,
            }
        }
        Ok(())
    }

    /// Physical address of the page table covering `va`, creating it when
    /// `create` is set.
    fn table_for(&mut self, fs: &mut dyn FrameSource, va: u32, create: bool) -> KResult<u32> {
        let pde = read_entry(fs, self.dir, pdx(va));
        if pde & PteFlags::PRESENT.bits() != 0 {
            if pde & PteFlags::LARGE.bits() != 0 {
                return Err(Errno::Unknown);
            }
            return Ok(pde & FRAME_MASK);
        }
        if !create {
            return Err(Errno::Unknown);
        }
        let table = fs.alloc_frame(BlockKind::Kernel).ok_or(Errno::Unknown)?;
        zero_frame(fs, table);
        let flags = PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER;
        write_entry(fs, self.dir, pdx(va), table | flags.bits());
        Ok(table)
    }

    fn install(&mut self, fs: &mut dyn FrameSource, va: u32, pa: u32, flags: PteFlags) -> KResult<()> {
        let table = self.table_for(fs, va, true)?;
        write_entry(fs, table, ptx(va), (pa & FRAME_MASK) | flags.bits());
        Ok(())
    }

    /// Maps `[va, va + size)` to freshly allocated frames of the given
    /// kind, present and writable. Frame exhaustion surfaces as an error so
    /// ordinary syscall paths (sbrk, exec) can fail back to the caller;
    /// pages mapped before the failure stay in place and are reclaimed by
    /// the usual teardown (or reused by an idempotent retry).
    pub fn map_memory(
        &mut self,
        fs: &mut dyn FrameSource,
        size: u32,
        va: u32,
        kind: BlockKind,
    ) -> KResult<()> {
        let start = page_round_down(va);
        let end = page_round_up(va + size);
        let mut page = start;
        while page < end {
            let frame = fs.alloc_frame(kind).ok_or(Errno::Unknown)?;
            zero_frame(fs, frame);
            let mut flags = PteFlags::PRESENT | PteFlags::WRITABLE;
            if kind == BlockKind::User {
                flags |= PteFlags::USER;
            }
            self.install(fs, page, frame, flags)?;
            page += PGSIZE;
        }
        Ok(())
    }

    /// Idempotent variant: pages that already have a present entry are left
    /// untouched.
    pub fn map_memory_if_not_mapped(
        &mut self,
        fs: &mut dyn FrameSource,
        size: u32,
        va: u32,
        kind: BlockKind,
    ) -> KResult<()> {
        let start = page_round_down(va);
        let end = page_round_up(va + size);
        let mut page = start;
        while page < end {
            if !self.is_mapped(fs, page) {
                let frame = fs.alloc_frame(kind).ok_or(Errno::Unknown)?;
                zero_frame(fs, frame);
                let mut flags = PteFlags::PRESENT | PteFlags::WRITABLE;
                if kind == BlockKind::User {
                    flags |= PteFlags::USER;
                }
                self.install(fs, page, frame, flags)?;
            }
            page += PGSIZE;
        }
        Ok(())
    }

    /// Maps `[va, va + size)` onto a caller-chosen physical range (MMIO,
    /// framebuffer, shared windows). The frames are not owned by this
    /// space and are never freed by it.
    pub fn map_flexible(
        &mut self,
        fs: &mut dyn FrameSource,
        size: u32,
        phys: u32,
        va: u32,
    ) -> KResult<()> {
        let end = page_round_up(va + size);
        let mut page = page_round_down(va);
        let mut pa = page_round_down(phys);
        while page < end {
            self.install(
                fs,
                page,
                pa,
                PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER,
            )?;
            page += PGSIZE;
            pa += PGSIZE;
        }
        Ok(())
    }

    /// Removes mappings without releasing the backing frames.
    pub fn unmap_flexible(&mut self, fs: &mut dyn FrameSource, size: u32, va: u32) {
        let end = page_round_up(va + size);
        let mut page = page_round_down(va);
        while page < end {
            if let Ok(table) = self.table_for(fs, page, false) {
                write_entry(fs, table, ptx(page), 0);
                x86::invlpg(page);
            }
            page += PGSIZE;
        }
    }

    /// Unmaps `[va, va + size)`, freeing the backing frames and any page
    /// table left empty.
    pub fn unmap_memory_if_mapped(&mut self, fs: &mut dyn FrameSource, size: u32, va: u32) {
        let end = page_round_up(va + size);
        let mut page = page_round_down(va);
        while page < end {
            if let Ok(table) = self.table_for(fs, page, false) {
                let pte = read_entry(fs, table, ptx(page));
                if pte & PteFlags::PRESENT.bits() != 0 {
                    fs.free_frame(pte & FRAME_MASK);
                    write_entry(fs, table, ptx(page), 0);
                    x86::invlpg(page);
                }
                // Drop the table once its last entry is gone.
                if (0..NPTENTRIES).all(|i| read_entry(fs, table, i) == 0) {
                    write_entry(fs, self.dir, pdx(page), 0);
                    fs.free_frame(table);
                }
            }
            page += PGSIZE;
        }
    }

    pub fn is_mapped(&self, fs: &mut dyn FrameSource, va: u32) -> bool {
        let pde = read_entry(fs, self.dir, pdx(va));
        if pde & PteFlags::PRESENT.bits() == 0 {
            return false;
        }
        if pde & PteFlags::LARGE.bits() != 0 {
            return true;
        }
        read_entry(fs, pde & FRAME_MASK, ptx(va)) & PteFlags::PRESENT.bits() != 0
    }

    pub fn get_physical(&self, fs: &mut dyn FrameSource, va: u32) -> Option<u32> {
        let pde = read_entry(fs, self.dir, pdx(va));
        if pde & PteFlags::PRESENT.bits() == 0 {
            return None;
        }
        if pde & PteFlags::LARGE.bits() != 0 {
            return Some((pde & LARGE_MASK) | (va & !LARGE_MASK));
        }
        let pte = read_entry(fs, pde & FRAME_MASK, ptx(va));
        if pte & PteFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some((pte & FRAME_MASK) | (va & (PGSIZE - 1)))
    }

    /// Deep-copies every user mapping into a new address space; kernel
    /// mappings are aliased. Interrupts stay off for the duration so no
    /// schedule can observe the half-built directory.
    pub fn copy_address_space(&self, fs: &mut dyn FrameSource) -> KResult<AddressSpace> {
        x86::without_interrupts(|| {
            let mut new = AddressSpace::new(fs)?;
            new.adopt_kernel_quarter(fs, self);
            for i in 0..KERNEL_PDX {
                let pde = read_entry(fs, self.dir, i);
                if pde & PteFlags::PRESENT.bits() == 0 {
                    continue;
                }
                let table = pde & FRAME_MASK;
                for j in 0..NPTENTRIES {
                    let pte = read_entry(fs, table, j);
                    if pte & PteFlags::PRESENT.bits() == 0 {
                        continue;
                    }
                    let frame = fs.alloc_frame(BlockKind::User).ok_or(Errno::Unknown)?;
                    fs.copy_frame(frame, pte & FRAME_MASK);
                    let va = ((i as u32) << 22) | ((j as u32) << 12);
                    new.install(fs, va, frame, PteFlags::from_bits_truncate(pte & 0xfff))?;
                }
            }
            Ok(new)
        })
    }

    /// A directory containing only the kernel mappings.
    pub fn kernel_clone(&self, fs: &mut dyn FrameSource) -> KResult<AddressSpace> {
        let mut new = AddressSpace::new(fs)?;
        new.adopt_kernel_quarter(fs, self);
        Ok(new)
    }

    /// Frees every user frame and page table still mapped. The directory
    /// itself survives so a parent can still inspect the zombie; `release`
    /// finishes the job at reap time.
    pub fn release_user(&mut self, fs: &mut dyn FrameSource) {
        for i in 0..KERNEL_PDX {
            let pde = read_entry(fs, self.dir, i);
            if pde & PteFlags::PRESENT.bits() == 0 {
                continue;
            }
            let table = pde & FRAME_MASK;
            for j in 0..NPTENTRIES {
                let pte = read_entry(fs, table, j);
                if pte & PteFlags::PRESENT.bits() != 0 {
                    fs.free_frame(pte & FRAME_MASK);
                }
            }
            fs.free_frame(table);
            write_entry(fs, self.dir, i, 0);
        }
    }

    /// Frees the directory frame. User mappings must already be gone.
    pub fn release(self, fs: &mut dyn FrameSource) {
        fs.free_frame(self.dir);
    }
}

static KERNEL_SPACE: spin::Once<spin::Mutex<AddressSpace>> = spin::Once::new();

/// Publishes the boot-built kernel address space.
pub fn init_kernel_space(space: AddressSpace) {
    KERNEL_SPACE.call_once(|| spin::Mutex::new(space));
}

pub fn kernel_space() -> &'static spin::Mutex<AddressSpace> {
    KERNEL_SPACE.get().expect("kernel address space not initialized")
}
