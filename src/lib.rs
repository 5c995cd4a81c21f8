//! VK: a small x86 monolithic kernel.
//!
//! Processes with fork/exec/wait and signals, eager-mapped virtual memory
//! with per-process page directories, and a POSIX-flavored VFS dispatching
//! to ext2, iso9660 and devfs, all behind a trap-table system call surface.
//!
//! The crate builds for the kernel target and, thanks to the hardware
//! seams (frame source, block device, console sink), for the host as well,
//! where the test suite exercises the portable core.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod console;

pub mod args;
pub mod constants;
pub mod devfs;
pub mod elf;
pub mod err;
pub mod ext2;
pub mod iostream;
pub mod iso9660;
pub mod kbd;
pub mod kheap;
pub mod kvmheap;
pub mod paging;
pub mod pmm;
pub mod process;
pub mod sched;
pub mod signal;
pub mod storage;
pub mod syscall;
pub mod time;
pub mod trap;
pub mod tty;
pub mod usermem;
pub mod vfs;
pub mod vga_buffer;
pub mod x86;

use crate::constants::*;
use crate::err::KResult;
use crate::paging::{AddressSpace, PhysFrames};
use crate::pmm::BlockKind;
use crate::storage::DeviceRef;
use alloc::boxed::Box;

/// What the boot stub hands over: the command line, the firmware memory
/// map, and the discovered boot devices (drivers are collaborators).
pub struct BootInfo<'a> {
    pub cmdline: &'a str,
    /// `(base, size, usable)` regions in ascending order.
    pub regions: &'a [(u32, u32, bool)],
    pub root_disk: Option<DeviceRef>,
    pub cdrom: Option<DeviceRef>,
}

fn kheap_grow(at: u32, len: u32) -> bool {
    let mut frames = PhysFrames;
    let mut space = paging::kernel_space().lock();
    space
        .map_memory_if_not_mapped(&mut frames, len, at, BlockKind::Kernel)
        .is_ok()
}

/// Brings the whole kernel up and never returns.
pub fn kernel_main(boot: BootInfo) -> ! {
    let bootargs = args::args_parse(boot.cmdline);
    args::set_boot_args(bootargs);
    console::init(bootargs.asilent);

    // Physical memory map.
    {
        let mut pm = pmm::physical();
        for &(base, size, usable) in boot.regions {
            let kind = if usable { BlockKind::Free } else { BlockKind::Hard };
            pm.add_region(base, size, kind);
        }
        // The kernel image and boot structures live in low memory.
        pm.reserve_specific(0x0010_0000, 0x0030_0000, BlockKind::KernelF);
    }

    // Kernel address space: a large-page linear map of low RAM plus
    // pre-created tables for the heap and transient-mapping windows, so
    // kernel-quarter aliases in process directories never go stale.
    {
        let mut frames = PhysFrames;
        let mut space = AddressSpace::new(&mut frames).expect("no memory for the kernel directory");
        let mut pa = 0;
        while pa < 0x1000_0000 {
            space.map_large(&mut frames, pa, KERNEL_BASE + pa);
            pa += PTSIZE;
        }
        space
            .ensure_tables(&mut frames, KHEAP_BASE_START, KHEAP_LIMIT)
            .and_then(|_| space.ensure_tables(&mut frames, FREE_KVM_START, FREE_KVM_END))
            .expect("no memory for kernel page tables");
        space.switch();
        paging::init_kernel_space(space);
    }

    {
        // Boot cannot back out of a missing heap window; this one stays
        // fatal.
        let mut frames = PhysFrames;
        paging::kernel_space()
            .lock()
            .map_memory_if_not_mapped(
                &mut frames,
                KHEAP_BASE_SIZE,
                KHEAP_BASE_START,
                BlockKind::Kernel,
            )
            .expect("no memory for the kernel heap window");
    }
    kheap::kheap_install(kheap_grow);
    process::init_table(Box::new(PhysFrames));

    trap::trap_init();
    time::pit_init();

    mount_boot_filesystems(&boot).expect("cannot mount the root file system");
    log::info!("VK is up; free memory: {} KiB", pmm::physical().free_physical() / 1024);

    spawn_init_process().expect("cannot start init");
    sched::schedule();
    unreachable!("the scheduler returned");
}

fn mount_boot_filesystems(boot: &BootInfo) -> KResult<()> {
    let live = args::boot_args().alive;
    let mut v = vfs::vfs();
    if live {
        let dev = boot.cdrom.clone().ok_or(err::Errno::NoDevice)?;
        v.mount("/", iso9660::Iso9660Fs::mount(dev)?.into_filesystem())?;
    } else {
        let dev = boot.root_disk.clone().ok_or(err::Errno::NoDevice)?;
        v.mount("/", ext2::Ext2Fs::mount(dev)?.into_filesystem())?;
    }

    let devfs_fs = devfs::DevFs::new_filesystem();
    let root = match &devfs_fs.specific {
        vfs::FsSpec::Devfs(d) => d.root(&devfs_fs)?,
        _ => unreachable!(),
    };
    tty::tty_init(&devfs_fs, &root)?;
    v.mount("/dev", devfs_fs)?;
    Ok(())
}

/// Loads `/sys/init` into a fresh address space as pid 1.
fn spawn_init_process() -> KResult<()> {
    let mut frames = PhysFrames;
    let space = paging::kernel_space().lock().kernel_clone(&mut frames)?;

    let init_fd = vfs::vfs().open_file("/sys/init", vfs::OpenMode::READ)?;
    let mut table = process::table().lock();
    let pid = table.create_process(process::INVALID_PID, space, 0);
    table.current = pid;
    table.exec_current(
        &init_fd,
        alloc::vec!["/sys/init".into()],
        alloc::vec![],
    )?;
    log::info!("init is pid {}", pid);
    Ok(())
}

#[cfg(all(not(test), target_arch = "x86"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    x86::cli();
    println!("kernel panic: {}", info);
    loop {
        x86::hlt();
    }
}
