//! Physical memory manager.
//!
//! Physical RAM is described by a doubly linked list of typed blocks that
//! tile the detected address space: at any time the union of the block
//! ranges equals physical memory, with no overlap, and only `Free` blocks
//! satisfy allocation requests. The list nodes live in a fixed pool linked
//! by index, because the manager must run before the kernel heap exists.

use crate::constants::PGSIZE;
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Free,
    /// Reserved by the hardware / firmware; never allocatable.
    Hard,
    Kernel,
    /// Kernel image and boot structures.
    KernelF,
    User,
}

const NIL: u16 = u16::MAX;
const MAX_PHYS_BLOCKS: usize = 512;

#[derive(Clone, Copy)]
struct Block {
    base: u32,
    size: u32,
    kind: BlockKind,
    prev: u16,
    next: u16,
    live: bool,
}

impl Block {
    const fn empty() -> Block {
        Block {
            base: 0,
            size: 0,
            kind: BlockKind::Free,
            prev: NIL,
            next: NIL,
            live: false,
        }
    }
}

/// Summary of one block, as reported by `get_block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub base: u32,
    pub size: u32,
    pub kind: BlockKind,
}

pub struct PhysicalMemory {
    pool: [Block; MAX_PHYS_BLOCKS],
    head: u16,
}

impl PhysicalMemory {
    pub const fn new() -> PhysicalMemory {
        PhysicalMemory {
            pool: [Block::empty(); MAX_PHYS_BLOCKS],
            head: NIL,
        }
    }

    /// Appends a region to the map. Regions must be fed in ascending,
    /// gap-free order (the boot code walks the firmware memory map that
    /// way); violating that breaks the tiling invariant.
    pub fn add_region(&mut self, base: u32, size: u32, kind: BlockKind) {
        if size == 0 {
            return;
        }
        let idx = self.alloc_node();
        self.pool[idx as usize] = Block {
            base,
            size,
            kind,
            prev: NIL,
            next: NIL,
            live: true,
        };
        // Link at the tail.
        if self.head == NIL {
            self.head = idx;
            return;
        }
        let mut cur = self.head;
        while self.pool[cur as usize].next != NIL {
            cur = self.pool[cur as usize].next;
        }
        self.pool[cur as usize].next = idx;
        self.pool[idx as usize].prev = cur;
    }

    fn alloc_node(&mut self) -> u16 {
        for (i, b) in self.pool.iter().enumerate() {
            if !b.live {
                return i as u16;
            }
        }
        panic!("physical block pool exhausted");
    }

    fn release_node(&mut self, idx: u16) {
        self.pool[idx as usize] = Block::empty();
    }

    /// First-fit allocation. The chosen free block is split so that its
    /// suffix becomes the allocation and the prefix stays free. Returns the
    /// base of the allocated range, or 0 when nothing satisfies the request.
    pub fn reserve_block(&mut self, size: u32, kind: BlockKind) -> u32 {
        if size == 0 {
            return 0;
        }
        let size = align_up(size);
        let mut cur = self.head;
        while cur != NIL {
            let b = self.pool[cur as usize];
            if b.kind == BlockKind::Free && b.size >= size {
                if b.size == size {
                    self.pool[cur as usize].kind = kind;
                    return b.base;
                }
                // Shrink the free prefix, append the typed suffix.
                let alloc_base = b.base + b.size - size;
                self.pool[cur as usize].size = b.size - size;
                let idx = self.alloc_node();
                self.pool[idx as usize] = Block {
                    base: alloc_base,
                    size,
                    kind,
                    prev: cur,
                    next: b.next,
                    live: true,
                };
                if b.next != NIL {
                    self.pool[b.next as usize].prev = idx;
                }
                self.pool[cur as usize].next = idx;
                return alloc_base;
            }
            cur = b.next;
        }
        0
    }

    /// Claims exactly `[addr, addr + size)`. Succeeds only if the range lies
    /// entirely within a single free block, splitting it up to three ways.
    pub fn reserve_specific(&mut self, addr: u32, size: u32, kind: BlockKind) -> bool {
        if size == 0 {
            return false;
        }
        let end = match addr.checked_add(size) {
            Some(e) => e,
            None => return false,
        };
        let mut cur = self.head;
        while cur != NIL {
            let b = self.pool[cur as usize];
            if addr >= b.base && end <= b.base + b.size {
                if b.kind != BlockKind::Free {
                    return false;
                }
                // Middle piece first, so node indexes stay coherent.
                self.pool[cur as usize].kind = kind;
                if end < b.base + b.size {
                    let idx = self.alloc_node();
                    let next = self.pool[cur as usize].next;
                    self.pool[idx as usize] = Block {
                        base: end,
                        size: b.base + b.size - end,
                        kind: BlockKind::Free,
                        prev: cur,
                        next,
                        live: true,
                    };
                    if next != NIL {
                        self.pool[next as usize].prev = idx;
                    }
                    self.pool[cur as usize].next = idx;
                    self.pool[cur as usize].size = end - b.base;
                }
                if addr > b.base {
                    let idx = self.alloc_node();
                    let prev = self.pool[cur as usize].prev;
                    self.pool[idx as usize] = Block {
                        base: b.base,
                        size: addr - b.base,
                        kind: BlockKind::Free,
                        prev,
                        next: cur,
                        live: true,
                    };
                    if prev != NIL {
                        self.pool[prev as usize].next = idx;
                    } else {
                        self.head = idx;
                    }
                    self.pool[cur as usize].prev = idx;
                    self.pool[cur as usize].base = addr;
                    self.pool[cur as usize].size -= addr - b.base;
                }
                return true;
            }
            cur = b.next;
        }
        false
    }

    /// Releases the block starting at `base`, merging it with free
    /// neighbors on both sides.
    pub fn free_block(&mut self, base: u32) {
        let mut cur = self.head;
        while cur != NIL {
            let b = self.pool[cur as usize];
            if b.base == base {
                if b.kind == BlockKind::Free {
                    return;
                }
                self.pool[cur as usize].kind = BlockKind::Free;
                // Forward merge.
                let next = self.pool[cur as usize].next;
                if next != NIL {
                    let n = self.pool[next as usize];
                    if n.kind == BlockKind::Free && b.base + self.pool[cur as usize].size == n.base
                    {
                        self.pool[cur as usize].size += n.size;
                        self.pool[cur as usize].next = n.next;
                        if n.next != NIL {
                            self.pool[n.next as usize].prev = cur;
                        }
                        self.release_node(next);
                    }
                }
                // Backward merge.
                let prev = self.pool[cur as usize].prev;
                if prev != NIL {
                    let p = self.pool[prev as usize];
                    if p.kind == BlockKind::Free && p.base + p.size == self.pool[cur as usize].base
                    {
                        self.pool[prev as usize].size += self.pool[cur as usize].size;
                        let next = self.pool[cur as usize].next;
                        self.pool[prev as usize].next = next;
                        if next != NIL {
                            self.pool[next as usize].prev = prev;
                        }
                        self.release_node(cur);
                    }
                }
                return;
            }
            cur = b.next;
        }
    }

    /// Returns the block containing `addr`.
    pub fn get_block(&self, addr: u32) -> Option<BlockInfo> {
        let mut cur = self.head;
        while cur != NIL {
            let b = self.pool[cur as usize];
            if addr >= b.base && addr < b.base + b.size {
                return Some(BlockInfo {
                    base: b.base,
                    size: b.size,
                    kind: b.kind,
                });
            }
            cur = b.next;
        }
        None
    }

    /// Total free physical memory in bytes.
    pub fn free_physical(&self) -> u64 {
        let mut total = 0u64;
        let mut cur = self.head;
        while cur != NIL {
            let b = self.pool[cur as usize];
            if b.kind == BlockKind::Free {
                total += b.size as u64;
            }
            cur = b.next;
        }
        total
    }

    #[cfg(test)]
    fn snapshot(&self) -> alloc::vec::Vec<BlockInfo> {
        let mut v = alloc::vec::Vec::new();
        let mut cur = self.head;
        while cur != NIL {
            let b = self.pool[cur as usize];
            v.push(BlockInfo {
                base: b.base,
                size: b.size,
                kind: b.kind,
            });
            cur = b.next;
        }
        v
    }
}

fn align_up(size: u32) -> u32 {
    (size + PGSIZE - 1) & !(PGSIZE - 1)
}

static PHYSICAL: Mutex<PhysicalMemory> = Mutex::new(PhysicalMemory::new());

pub fn physical() -> spin::MutexGuard<'static, PhysicalMemory> {
    PHYSICAL.lock()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> PhysicalMemory {
        let mut pm = PhysicalMemory::new();
        pm.add_region(0, 0x100000, BlockKind::Hard);
        pm.add_region(0x100000, 0x300000, BlockKind::KernelF);
        pm.add_region(0x400000, 0xc00000, BlockKind::Free);
        pm
    }

    fn assert_tiling(pm: &PhysicalMemory) {
        let blocks = pm.snapshot();
        for w in blocks.windows(2) {
            assert_eq!(w[0].base + w[0].size, w[1].base);
            assert!(
                !(w[0].kind == BlockKind::Free && w[1].kind == BlockKind::Free),
                "two consecutive free blocks"
            );
        }
    }

    #[test]
    fn reserve_takes_suffix_and_keeps_tiling() {
        let mut pm = fresh();
        let base = pm.reserve_block(PGSIZE, BlockKind::Kernel);
        assert_eq!(base, 0x1000000 - PGSIZE);
        assert_eq!(pm.get_block(base).unwrap().kind, BlockKind::Kernel);
        assert_tiling(&pm);
    }

    #[test]
    fn reserve_rounds_to_page_granularity() {
        let mut pm = fresh();
        let base = pm.reserve_block(10, BlockKind::User);
        assert_eq!(pm.get_block(base).unwrap().size, PGSIZE);
    }

    #[test]
    fn reserve_fails_with_zero_sentinel() {
        let mut pm = fresh();
        assert_eq!(pm.reserve_block(0x10000000, BlockKind::User), 0);
    }

    #[test]
    fn free_coalesces_both_sides() {
        let mut pm = fresh();
        let a = pm.reserve_block(PGSIZE, BlockKind::User);
        let b = pm.reserve_block(PGSIZE, BlockKind::User);
        let c = pm.reserve_block(PGSIZE, BlockKind::User);
        // b sits between a and c; freeing a and c first leaves free islands
        // around b, and freeing b must fold all three into the main block.
        pm.free_block(c);
        assert_tiling(&pm);
        pm.free_block(a);
        assert_tiling(&pm);
        pm.free_block(b);
        assert_tiling(&pm);
        assert_eq!(pm.get_block(a).unwrap().kind, BlockKind::Free);
        assert_eq!(pm.free_physical(), 0xc00000);
    }

    #[test]
    fn reserve_specific_splits_three_ways() {
        let mut pm = fresh();
        assert!(pm.reserve_specific(0x500000, 0x2000, BlockKind::Kernel));
        let mid = pm.get_block(0x500000).unwrap();
        assert_eq!((mid.base, mid.size, mid.kind), (0x500000, 0x2000, BlockKind::Kernel));
        assert_eq!(pm.get_block(0x4ff000).unwrap().kind, BlockKind::Free);
        assert_eq!(pm.get_block(0x502000).unwrap().kind, BlockKind::Free);
        assert_tiling(&pm);
    }

    #[test]
    fn reserve_specific_rejects_reserved_ranges() {
        let mut pm = fresh();
        assert!(!pm.reserve_specific(0x100000, PGSIZE, BlockKind::User));
        // Straddling a block boundary also fails.
        assert!(!pm.reserve_specific(0x3ff000, 2 * PGSIZE, BlockKind::User));
    }
}
