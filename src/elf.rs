//! ELF loader.
//!
//! Accepts 32-bit little-endian ET_EXEC images for instruction set 0 or 3
//! (None / x86) and eagerly maps every PT_LOAD segment into the target
//! address space. Early reads are retried up to three times to tolerate
//! transient IO errors from the boot medium.

use crate::constants::page_round_up;
use crate::err::{Errno, KResult};
use crate::paging::{AddressSpace, FrameSource};
use crate::pmm::BlockKind;
use crate::usermem;
use crate::vfs::{self, FdRef};
use crate::x86;
use alloc::vec;
use alloc::vec::Vec;
use core::mem;

const ET_EXEC: u16 = 2;
const PT_LOAD: u32 = 1;
const EM_NONE: u16 = 0;
const EM_386: u16 = 3;

/// ELF header, with e_ident spelled out the way the checks read it.
#[repr(C)]
#[derive(Clone, Copy)]
struct ElfHeader {
    magic: [u8; 4],
    bits: u8,
    endianness: u8,
    header_version: u8,
    unused: [u8; 9],
    e_type: u16,
    instruction_set: u16,
    version: u32,
    program_entry: u32,
    program_header_table: u32,
    section_header_table: u32,
    flags: u32,
    header_size: u16,
    ph_entry_size: u16,
    ph_entry_nbr: u16,
    sh_entry_size: u16,
    sh_entry_nbr: u16,
    sh_index: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ProgramHeader {
    segment_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_paddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    flags: u32,
    align: u32,
}

fn read_retried(fd: &FdRef, buf: &mut [u8]) -> KResult<usize> {
    let mut last = Errno::Io;
    for _ in 0..3 {
        match vfs::read_file(fd, buf) {
            Ok(n) => return Ok(n),
            Err(e) => last = e,
        }
    }
    Err(last)
}

fn header_of(raw: &[u8]) -> KResult<ElfHeader> {
    if raw.len() < mem::size_of::<ElfHeader>() {
        return Err(Errno::IsNotElf);
    }
    let eh = unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const ElfHeader) };
    if eh.magic != [0x7f, b'E', b'L', b'F'] {
        return Err(Errno::IsNotElf);
    }
    if eh.bits != 1 {
        return Err(Errno::Is64Bits);
    }
    if eh.e_type != ET_EXEC {
        return Err(Errno::IsNotExecutable);
    }
    if eh.instruction_set != EM_NONE && eh.instruction_set != EM_386 {
        return Err(Errno::WrongInstructionSet);
    }
    Ok(eh)
}

/// Validates the image behind `fd` without disturbing its offset.
pub fn elf_check(fd: &FdRef) -> KResult<()> {
    let old_offset = fd.read().offset;
    fd.write().offset = 0;
    let mut raw = [0u8; mem::size_of::<ElfHeader>()];
    let res = read_retried(fd, &mut raw);
    fd.write().offset = old_offset;
    res?;
    header_of(&raw).map(|_| ())
}

/// Loads every PT_LOAD segment into `space` and returns the entry point
/// plus the mapped ranges (recorded for teardown at exit).
pub fn elf_load(
    fd: &FdRef,
    space: &mut AddressSpace,
    fs: &mut dyn FrameSource,
) -> KResult<(u32, Vec<(u32, u32)>)> {
    let length = vfs::flength(fd) as usize;
    let mut image = vec![0u8; length];
    let old_offset = fd.read().offset;
    fd.write().offset = 0;
    let res = read_retried(fd, &mut image);
    fd.write().offset = old_offset;
    res?;

    let eh = header_of(&image)?;
    let mut data_loc = Vec::new();
    for i in 0..eh.ph_entry_nbr as usize {
        let off = eh.program_header_table as usize + i * mem::size_of::<ProgramHeader>();
        if off + mem::size_of::<ProgramHeader>() > image.len() {
            return Err(Errno::IsNotElf);
        }
        let ph = unsafe {
            core::ptr::read_unaligned(image.as_ptr().add(off) as *const ProgramHeader)
        };
        if ph.segment_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }
        let file_end = ph.p_offset as usize + ph.p_filesz as usize;
        if file_end > image.len() {
            return Err(Errno::IsNotElf);
        }

        space.map_memory(fs, ph.p_memsz, ph.p_vaddr, BlockKind::User)?;
        data_loc.push((ph.p_vaddr, page_round_up(ph.p_memsz)));

        // Fresh frames are zeroed by map_memory, so only the file image
        // needs copying; the p_memsz tail stays zero. Interrupts are off
        // while a foreign directory is being populated.
        x86::without_interrupts(|| {
            usermem::copy_to_user(
                space,
                fs,
                ph.p_vaddr,
                &image[ph.p_offset as usize..file_end],
            )
        })?;
    }
    Ok((eh.program_entry, data_loc))
}

#[cfg(test)]
pub(crate) mod mkelf {
    use super::*;

    /// A minimal ET_EXEC image with one PT_LOAD segment.
    pub(crate) fn image(vaddr: u32, payload: &[u8], memsz: u32, entry: u32) -> Vec<u8> {
        let mut eh: ElfHeader = unsafe { mem::zeroed() };
        eh.magic = [0x7f, b'E', b'L', b'F'];
        eh.bits = 1;
        eh.endianness = 1;
        eh.header_version = 1;
        eh.e_type = ET_EXEC;
        eh.instruction_set = EM_386;
        eh.version = 1;
        eh.program_entry = entry;
        eh.program_header_table = mem::size_of::<ElfHeader>() as u32;
        eh.ph_entry_size = mem::size_of::<ProgramHeader>() as u16;
        eh.ph_entry_nbr = 1;

        let payload_off = mem::size_of::<ElfHeader>() + mem::size_of::<ProgramHeader>();
        let ph = ProgramHeader {
            segment_type: PT_LOAD,
            p_offset: payload_off as u32,
            p_vaddr: vaddr,
            p_paddr: 0,
            p_filesz: payload.len() as u32,
            p_memsz: memsz,
            flags: 7,
            align: 0x1000,
        };

        let mut out = Vec::new();
        out.extend_from_slice(unsafe {
            core::slice::from_raw_parts(&eh as *const _ as *const u8, mem::size_of::<ElfHeader>())
        });
        out.extend_from_slice(unsafe {
            core::slice::from_raw_parts(&ph as *const _ as *const u8, mem::size_of::<ProgramHeader>())
        });
        out.extend_from_slice(payload);
        out
    }
}
