//! System call dispatch.
//!
//! A fixed table indexed by call number; every handler receives three
//! 32-bit argument words and produces a `(value, status)` pair that the
//! trap glue writes back into eax/ecx. Pointer arguments are validated
//! against the caller's page directory before anything dereferences them;
//! relative paths are joined onto the caller's working directory.

use crate::devfs;
use crate::err::Errno;
use crate::process::{self, Pid, ProcessTable, EXIT_CONDITION_USER};
use crate::sched;
use crate::signal;
use crate::tty::{self, Termios};
use crate::usermem;
use crate::vfs::{self, FdRef, FileAttributes, OpenMode};
use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

pub const SYS_OPEN: u32 = 1;
pub const SYS_CLOSE: u32 = 2;
pub const SYS_READ: u32 = 3;
pub const SYS_WRITE: u32 = 4;
pub const SYS_LINK: u32 = 5;
pub const SYS_UNLINK: u32 = 6;
pub const SYS_SEEK: u32 = 7;
pub const SYS_STAT: u32 = 8;
pub const SYS_RENAME: u32 = 9;
pub const SYS_FINFO: u32 = 10;
pub const SYS_MOUNT: u32 = 11;
pub const SYS_UMOUNT: u32 = 12;
pub const SYS_MKDIR: u32 = 13;
pub const SYS_READDIR: u32 = 14;
pub const SYS_OPENIO: u32 = 15;
pub const SYS_DUP: u32 = 16;
pub const SYS_FSINFO: u32 = 17;
pub const SYS_FORK: u32 = 31;
pub const SYS_EXIT: u32 = 32;
pub const SYS_EXEC: u32 = 33;
pub const SYS_WAIT: u32 = 34;
pub const SYS_GETPINFO: u32 = 35;
pub const SYS_SETPINFO: u32 = 36;
pub const SYS_SIG: u32 = 37;
pub const SYS_SIGACTION: u32 = 38;
pub const SYS_SIGRET: u32 = 39;
pub const SYS_SBRK: u32 = 40;
pub const SYS_IOCTL: u32 = 51;

pub const VK_FINFO_DEVICE_TYPE: u32 = 1;
pub const VK_FINFO_PATH: u32 = 2;
pub const VK_NOT_A_DEVICE: u32 = 0;

pub const VK_FSINFO_MOUNTED_FS_NUMBER: u32 = 1;
pub const VK_FSINFO_MOUNTED_FS_ALL: u32 = 2;

pub const VK_PINFO_PID: u32 = 1;
pub const VK_PINFO_PPID: u32 = 2;
pub const VK_PINFO_WORKING_DIRECTORY: u32 = 3;
pub const VK_PINFO_GID: u32 = 4;

const PATH_MAX: usize = 1024;

/// Stat structure as user space sees it.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Stat {
    pub st_dev: u32,
    pub st_ino: u32,
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_rdev: u32,
    pub st_size: u32,
    pub st_atime: u32,
    pub st_mtime: u32,
    pub st_ctime: u32,
    pub st_blksize: u32,
    pub st_blocks: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Statfs {
    pub f_type: u32,
    pub f_flags: u32,
    pub f_bsize: u32,
    pub f_blocks: u32,
    pub f_bfree: u32,
    pub f_bavail: u32,
    pub f_files: u32,
    pub f_ffree: u32,
    pub f_fsid: u32,
    pub mount_path: [u8; 100],
}

type SysResult = (u32, Errno);

fn ok(value: u32) -> SysResult {
    (value, Errno::None)
}

fn fail(err: Errno) -> SysResult {
    (0, err)
}

/// Dispatches one trap. Unknown numbers (the table's zero-filled gaps)
/// report `Unknown`.
pub fn syscall(num: u32, ebx: u32, ecx: u32, edx: u32) -> SysResult {
    match num {
        SYS_OPEN => sys_open(ebx, ecx),
        SYS_CLOSE => sys_close(ebx),
        SYS_READ => sys_read(ebx, ecx, edx),
        SYS_WRITE => sys_write(ebx, ecx, edx),
        SYS_LINK => sys_link(ebx, ecx),
        SYS_UNLINK => sys_unlink(ebx),
        SYS_SEEK => sys_seek(ebx, ecx, edx),
        SYS_STAT => sys_stat(ebx, edx),
        SYS_RENAME => sys_rename(ebx, ecx),
        SYS_FINFO => sys_finfo(ebx, ecx, edx),
        SYS_MOUNT | SYS_UMOUNT => fail(Errno::Unknown),
        SYS_MKDIR => sys_mkdir(ebx),
        SYS_READDIR => sys_readdir(ebx, ecx, edx),
        SYS_OPENIO => sys_openio(),
        SYS_DUP => sys_dup(ebx, ecx),
        SYS_FSINFO => sys_fsinfo(ebx, ecx),
        SYS_FORK => sys_fork(),
        SYS_EXIT => sys_exit(ebx),
        SYS_EXEC => sys_exec(ebx, ecx, edx),
        SYS_WAIT => sys_wait(ebx, ecx),
        SYS_GETPINFO => sys_getpinfo(ebx, ecx, edx),
        SYS_SETPINFO => sys_setpinfo(ebx, ecx, edx),
        SYS_SIG => sys_sig(ebx, ecx),
        SYS_SIGACTION => sys_sigaction(ebx, ecx),
        SYS_SIGRET => sys_sigret(),
        SYS_SBRK => sys_sbrk(ebx),
        SYS_IOCTL => sys_ioctl(ebx, ecx, edx),
        _ => fail(Errno::Unknown),
    }
}

/// Checks `ptr` against the calling process's page directory.
fn validate_ptr(table: &mut ProcessTable, ptr: u32) -> Result<(), Errno> {
    let pid = table.current;
    let ProcessTable { frames, slots, .. } = table;
    let proc = slots
        .get(pid as usize)
        .and_then(|s| s.as_ref())
        .ok_or(Errno::InvalidPid)?;
    let space = proc.space.as_ref().ok_or(Errno::InvalidPtr)?;
    if usermem::ptr_validate(ptr, space, frames.as_mut()) {
        Ok(())
    } else {
        Err(Errno::InvalidPtr)
    }
}

fn copy_in(table: &mut ProcessTable, ptr: u32, buf: &mut [u8]) -> Result<(), Errno> {
    let pid = table.current;
    let ProcessTable { frames, slots, .. } = table;
    let proc = slots
        .get(pid as usize)
        .and_then(|s| s.as_ref())
        .ok_or(Errno::InvalidPid)?;
    let space = proc.space.as_ref().ok_or(Errno::InvalidPtr)?;
    usermem::copy_from_user(space, frames.as_mut(), ptr, buf)
}

fn copy_out(table: &mut ProcessTable, ptr: u32, bytes: &[u8]) -> Result<(), Errno> {
    let pid = table.current;
    let ProcessTable { frames, slots, .. } = table;
    let proc = slots
        .get(pid as usize)
        .and_then(|s| s.as_ref())
        .ok_or(Errno::InvalidPid)?;
    let space = proc.space.as_ref().ok_or(Errno::InvalidPtr)?;
    usermem::copy_to_user(space, frames.as_mut(), ptr, bytes)
}

/// Reads a path argument, joining relative paths onto the caller's
/// working directory as `dir + '/' + rel`. No normalization happens here;
/// resolution handles `.` and `..`.
fn user_path(table: &mut ProcessTable, ptr: u32) -> Result<String, Errno> {
    validate_ptr(table, ptr)?;
    let raw = {
        let pid = table.current;
        let ProcessTable { frames, slots, .. } = table;
        let proc = slots
            .get(pid as usize)
            .and_then(|s| s.as_ref())
            .ok_or(Errno::InvalidPid)?;
        let space = proc.space.as_ref().ok_or(Errno::InvalidPtr)?;
        usermem::str_from_user(space, frames.as_mut(), ptr, PATH_MAX)?
    };
    if raw.starts_with('/') {
        return Ok(raw);
    }
    let dir = table.current_mut()?.current_dir.clone();
    Ok(format!("{}/{}", dir, raw))
}

fn current_fd(table: &mut ProcessTable, n: u32) -> Result<FdRef, Errno> {
    table.current_mut()?.fd_get(n)
}

fn sys_open(path_ptr: u32, mode: u32) -> SysResult {
    let (path, mode) = {
        let mut table = process::table().lock();
        let path = match user_path(&mut table, path_ptr) {
            Ok(p) => p,
            Err(e) => return fail(e),
        };
        (path, OpenMode::from_bits_truncate(mode))
    };
    let fd = match vfs::vfs().open_file(&path, mode) {
        Ok(fd) => fd,
        Err(e) => return fail(e),
    };
    let mut table = process::table().lock();
    let proc = match table.current_mut() {
        Ok(p) => p,
        Err(e) => return fail(e),
    };
    let n = proc.fd_alloc(fd);
    log::debug!("SYS_OPEN({}, {:?}) = {}", path, mode, n);
    ok(n as u32)
}

fn sys_close(fd: u32) -> SysResult {
    if fd < 3 {
        return ok(0);
    }
    let taken = {
        let mut table = process::table().lock();
        match table.current_mut() {
            Ok(p) => p.fd_take(fd),
            Err(e) => return fail(e),
        }
    };
    if let Some(fd) = taken {
        vfs::close_file(&fd);
    }
    ok(0)
}

fn sys_read(fd: u32, buf_ptr: u32, count: u32) -> SysResult {
    let fdref = {
        let mut table = process::table().lock();
        let fdref = match current_fd(&mut table, fd) {
            Ok(f) => f,
            Err(e) => return fail(e),
        };
        if let Err(e) = validate_ptr(&mut table, buf_ptr) {
            return fail(e);
        }
        fdref
    };
    // The transfer happens without the table lock: a TTY read may block.
    let mut buf = vec![0u8; count as usize];
    match vfs::read_file(&fdref, &mut buf) {
        Ok(n) => {
            let mut table = process::table().lock();
            match copy_out(&mut table, buf_ptr, &buf[..n]) {
                Ok(()) => ok(n as u32),
                Err(e) => fail(e),
            }
        }
        Err(e) => fail(e),
    }
}

fn sys_write(fd: u32, buf_ptr: u32, count: u32) -> SysResult {
    let (fdref, buf) = {
        let mut table = process::table().lock();
        let fdref = match current_fd(&mut table, fd) {
            Ok(f) => f,
            Err(e) => return fail(e),
        };
        if let Err(e) = validate_ptr(&mut table, buf_ptr) {
            return fail(e);
        }
        let mut buf = vec![0u8; count as usize];
        if let Err(e) = copy_in(&mut table, buf_ptr, &mut buf) {
            return fail(e);
        }
        (fdref, buf)
    };
    match vfs::write_file(&fdref, &buf) {
        Ok(n) => ok(n as u32),
        Err(e) => fail(e),
    }
}

fn sys_link(old_ptr: u32, new_ptr: u32) -> SysResult {
    let (old, new) = {
        let mut table = process::table().lock();
        match (user_path(&mut table, old_ptr), user_path(&mut table, new_ptr)) {
            (Ok(o), Ok(n)) => (o, n),
            (Err(e), _) | (_, Err(e)) => return fail(e),
        }
    };
    match vfs::vfs().link(&old, &new) {
        Ok(()) => ok(0),
        Err(e) => fail(e),
    }
}

fn sys_unlink(path_ptr: u32) -> SysResult {
    let path = {
        let mut table = process::table().lock();
        match user_path(&mut table, path_ptr) {
            Ok(p) => p,
            Err(e) => return fail(e),
        }
    };
    match vfs::vfs().unlink(&path) {
        Ok(()) => ok(0),
        Err(e) => fail(e),
    }
}

fn sys_seek(fd: u32, offset: u32, whence: u32) -> SysResult {
    let fdref = {
        let mut table = process::table().lock();
        match current_fd(&mut table, fd) {
            Ok(f) => f,
            Err(e) => return fail(e),
        }
    };
    match vfs::seek(&fdref, offset, whence) {
        Ok(n) => ok(n as u32),
        Err(e) => fail(e),
    }
}

fn sys_stat(fd: u32, stat_ptr: u32) -> SysResult {
    let mut table = process::table().lock();
    let fdref = match current_fd(&mut table, fd) {
        Ok(f) => f,
        Err(e) => return fail(e),
    };
    if let Err(e) = validate_ptr(&mut table, stat_ptr) {
        return fail(e);
    }
    let stat = {
        let node = fdref.read().file.clone();
        let node = node.read();
        Stat {
            st_dev: 0,
            st_ino: node.inode_number(),
            st_mode: if node.is_dir() { 0o040000 } else { 0o100000 },
            st_nlink: node.hard_links,
            st_uid: 0,
            st_gid: 0,
            st_rdev: 0,
            st_size: node.length as u32,
            st_atime: node.last_access_time,
            st_mtime: node.last_modification_time,
            st_ctime: node.last_modification_time,
            st_blksize: 512,
            st_blocks: (node.length / 512) as u32,
        }
    };
    let raw = unsafe {
        core::slice::from_raw_parts(&stat as *const Stat as *const u8, core::mem::size_of::<Stat>())
    };
    match copy_out(&mut table, stat_ptr, raw) {
        Ok(()) => ok(0),
        Err(e) => fail(e),
    }
}

fn sys_rename(old_ptr: u32, new_ptr: u32) -> SysResult {
    let (old, new) = {
        let mut table = process::table().lock();
        match (user_path(&mut table, old_ptr), user_path(&mut table, new_ptr)) {
            (Ok(o), Ok(n)) => (o, n),
            (Err(e), _) | (_, Err(e)) => return fail(e),
        }
    };
    match vfs::vfs().rename(&old, &new) {
        Ok(()) => ok(0),
        Err(e) => fail(e),
    }
}

fn sys_finfo(fd: u32, cmd: u32, out_ptr: u32) -> SysResult {
    let mut table = process::table().lock();
    let fdref = match current_fd(&mut table, fd) {
        Ok(f) => f,
        Err(e) => return fail(e),
    };
    if let Err(e) = validate_ptr(&mut table, out_ptr) {
        return fail(e);
    }
    match cmd {
        VK_FINFO_DEVICE_TYPE => {
            let node = fdref.read().file.clone();
            let dt = devfs::device_type(&node).unwrap_or(VK_NOT_A_DEVICE);
            match copy_out(&mut table, out_ptr, &dt.to_le_bytes()) {
                Ok(()) => ok(0),
                Err(e) => fail(e),
            }
        }
        VK_FINFO_PATH => {
            let mut path = fdref.read().path.clone().into_bytes();
            path.push(0);
            match copy_out(&mut table, out_ptr, &path) {
                Ok(()) => ok(0),
                Err(e) => fail(e),
            }
        }
        _ => fail(Errno::Unknown),
    }
}

fn sys_mkdir(path_ptr: u32) -> SysResult {
    let path = {
        let mut table = process::table().lock();
        match user_path(&mut table, path_ptr) {
            Ok(p) => p,
            Err(e) => return fail(e),
        }
    };
    match vfs::vfs().create_file(&path, FileAttributes::DIR) {
        Ok(_) => ok(0),
        Err(e) => fail(e),
    }
}

fn sys_readdir(fd: u32, index: u32, out_ptr: u32) -> SysResult {
    let mut table = process::table().lock();
    let fdref = match current_fd(&mut table, fd) {
        Ok(f) => f,
        Err(e) => return fail(e),
    };
    if let Err(e) = validate_ptr(&mut table, out_ptr) {
        return fail(e);
    }
    let entries = match vfs::read_directory(&fdref) {
        Ok(e) => e,
        Err(e) => return fail(e),
    };
    let entry = match entries.get(index as usize) {
        Some(e) => e,
        None => return fail(Errno::FileOut),
    };
    // POSIX-shaped dirent: u32 inode, then the name with a trailing NUL.
    let mut raw = Vec::with_capacity(4 + 256);
    raw.extend_from_slice(&entry.inode.to_le_bytes());
    let name = entry.name.as_bytes();
    let n = core::cmp::min(name.len(), 255);
    raw.extend_from_slice(&name[..n]);
    raw.push(0);
    match copy_out(&mut table, out_ptr, &raw) {
        Ok(()) => ok(0),
        Err(e) => fail(e),
    }
}

fn sys_openio() -> SysResult {
    let node = devfs::anonymous_stream_node();
    let fd = alloc::sync::Arc::new(spin::RwLock::new(vfs::Fd {
        file: node,
        offset: 0,
        mode: OpenMode::READ | OpenMode::WRITE,
        instances: 1,
        path: String::from("io:"),
    }));
    let mut table = process::table().lock();
    match table.current_mut() {
        Ok(p) => ok(p.fd_alloc(fd) as u32),
        Err(e) => fail(e),
    }
}

fn sys_dup(old: u32, new: u32) -> SysResult {
    let mut table = process::table().lock();
    let fdref = match current_fd(&mut table, old) {
        Ok(f) => f,
        Err(e) => return fail(e),
    };
    let proc = match table.current_mut() {
        Ok(p) => p,
        Err(e) => return fail(e),
    };
    if new != 0 {
        if new < 3 {
            return fail(Errno::Unknown);
        }
        let evicted = proc.fd_take(new);
        fdref.write().instances += 1;
        while proc.files.len() <= new as usize {
            let grown = proc.files.len() * 2;
            proc.files.resize(grown, None);
        }
        proc.files[new as usize] = Some(fdref);
        drop(table);
        if let Some(old_fd) = evicted {
            vfs::close_file(&old_fd);
        }
        ok(new)
    } else {
        fdref.write().instances += 1;
        ok(proc.fd_alloc(fdref) as u32)
    }
}

fn sys_fsinfo(cmd: u32, out_ptr: u32) -> SysResult {
    let mut table = process::table().lock();
    if let Err(e) = validate_ptr(&mut table, out_ptr) {
        return fail(e);
    }
    let infos = vfs::vfs().statfs_all();
    match cmd {
        VK_FSINFO_MOUNTED_FS_NUMBER => {
            let n = infos.len() as u32;
            match copy_out(&mut table, out_ptr, &n.to_le_bytes()) {
                Ok(()) => ok(n),
                Err(e) => fail(e),
            }
        }
        VK_FSINFO_MOUNTED_FS_ALL => {
            let mut out = out_ptr;
            for info in &infos {
                let mut stat = Statfs {
                    f_type: info.f_type,
                    f_flags: info.f_flags,
                    f_bsize: 512,
                    f_blocks: info.f_blocks,
                    f_bfree: info.f_bfree,
                    f_bavail: info.f_bfree,
                    f_files: info.f_files,
                    f_ffree: info.f_ffree,
                    f_fsid: info.f_fsid,
                    mount_path: [0; 100],
                };
                let n = core::cmp::min(info.mount_path.len(), 99);
                stat.mount_path[..n].copy_from_slice(&info.mount_path.as_bytes()[..n]);
                let raw = unsafe {
                    core::slice::from_raw_parts(
                        &stat as *const Statfs as *const u8,
                        core::mem::size_of::<Statfs>(),
                    )
                };
                if let Err(e) = copy_out(&mut table, out, raw) {
                    return fail(e);
                }
                out += core::mem::size_of::<Statfs>() as u32;
            }
            ok(infos.len() as u32)
        }
        _ => fail(Errno::Unknown),
    }
}

fn sys_fork() -> SysResult {
    let mut table = process::table().lock();
    match table.fork_current() {
        Ok(pid) => ok(pid as u32),
        Err(e) => fail(e),
    }
}

fn sys_exit(code: u32) -> SysResult {
    {
        let mut table = process::table().lock();
        let pid = table.current;
        table.exit_process(pid, EXIT_CONDITION_USER | (code & 0xff));
    }
    sched::schedule();
    ok(0)
}

fn sys_exec(fd: u32, env_ptr: u32, argv_ptr: u32) -> SysResult {
    let (fdref, argv, env) = {
        let mut table = process::table().lock();
        let fdref = match current_fd(&mut table, fd) {
            Ok(f) => f,
            Err(e) => return fail(e),
        };
        // argv/env must move to kernel memory before the old image dies.
        let argv = match user_string_vec(&mut table, argv_ptr) {
            Ok(v) => v,
            Err(e) => return fail(e),
        };
        let env = match user_string_vec(&mut table, env_ptr) {
            Ok(v) => v,
            Err(e) => return fail(e),
        };
        (fdref, argv, env)
    };

    if let Err(e) = crate::elf::elf_check(&fdref) {
        return fail(e);
    }

    let res = {
        let mut table = process::table().lock();
        table.exec_current(&fdref, argv, env)
    };
    match res {
        Ok(_entry) => {
            // The thread state now points at the fresh image; the trap
            // return path reloads it. Nothing of the old image survives to
            // receive a value.
            ok(0)
        }
        Err(_) => {
            // The old address space is already gone; the process cannot
            // continue.
            let mut table = process::table().lock();
            let pid = table.current;
            table.exit_process(pid, 3 << 8);
            drop(table);
            sched::schedule();
            fail(Errno::Unknown)
        }
    }
}

fn user_string_vec(table: &mut ProcessTable, ptr: u32) -> Result<Vec<String>, Errno> {
    if ptr == 0 {
        return Ok(Vec::new());
    }
    validate_ptr(table, ptr)?;
    let pid = table.current;
    let ProcessTable { frames, slots, .. } = table;
    let proc = slots
        .get(pid as usize)
        .and_then(|s| s.as_ref())
        .ok_or(Errno::InvalidPid)?;
    let space = proc.space.as_ref().ok_or(Errno::InvalidPtr)?;
    let ptrs = usermem::ptr_vec_from_user(space, frames.as_mut(), ptr, 64)?;
    let mut out = Vec::with_capacity(ptrs.len());
    for p in ptrs {
        out.push(usermem::str_from_user(space, frames.as_mut(), p, PATH_MAX)?);
    }
    Ok(out)
}

fn sys_wait(pid_sel: u32, wstatus_ptr: u32) -> SysResult {
    let sel = pid_sel as i32;
    if wstatus_ptr != 0 {
        let mut table = process::table().lock();
        if let Err(e) = validate_ptr(&mut table, wstatus_ptr) {
            return fail(e);
        }
    }
    loop {
        let scanned = {
            let mut table = process::table().lock();
            let waiter = table.current;
            table.wait_scan(waiter, sel)
        };
        match scanned {
            Err(e) => return fail(e),
            Ok(Some((pid, code))) => {
                if wstatus_ptr != 0 {
                    let mut table = process::table().lock();
                    if let Err(e) = copy_out(&mut table, wstatus_ptr, &code.to_le_bytes()) {
                        return fail(e);
                    }
                }
                return ok(pid as u32);
            }
            Ok(None) => sched::sleep_on_child(),
        }
    }
}

fn sys_getpinfo(pid: u32, cmd: u32, out_ptr: u32) -> SysResult {
    let mut table = process::table().lock();
    if let Err(e) = validate_ptr(&mut table, out_ptr) {
        return fail(e);
    }
    let target = match pick_pinfo_target(&mut table, pid) {
        Ok(t) => t,
        Err(e) => return fail(e),
    };
    let bytes: Vec<u8> = {
        let p = match table.get(target) {
            Some(p) => p,
            None => return fail(Errno::InvalidPid),
        };
        match cmd {
            VK_PINFO_PID => p.pid.to_le_bytes().to_vec(),
            VK_PINFO_PPID => {
                let ppid = if table.get(p.parent).is_some() { p.parent } else { -1 };
                ppid.to_le_bytes().to_vec()
            }
            VK_PINFO_WORKING_DIRECTORY => {
                let mut b = p.current_dir.clone().into_bytes();
                b.push(0);
                b
            }
            VK_PINFO_GID => p.group.to_le_bytes().to_vec(),
            _ => return fail(Errno::Unknown),
        }
    };
    match copy_out(&mut table, out_ptr, &bytes) {
        Ok(()) => ok(0),
        Err(e) => fail(e),
    }
}

fn sys_setpinfo(pid: u32, cmd: u32, arg: u32) -> SysResult {
    let mut table = process::table().lock();
    let target = match pick_pinfo_target(&mut table, pid) {
        Ok(t) => t,
        Err(e) => return fail(e),
    };
    match cmd {
        VK_PINFO_WORKING_DIRECTORY => {
            let path = match user_path(&mut table, arg) {
                Ok(p) => p,
                Err(e) => return fail(e),
            };
            if path.len() >= 99 {
                return fail(Errno::FileOut);
            }
            drop(table);
            // The directory must actually resolve.
            let probe = match vfs::vfs().open_file(&path, OpenMode::READ) {
                Ok(f) => f,
                Err(e) => return fail(e),
            };
            vfs::close_file(&probe);
            let mut table = process::table().lock();
            match table.get_mut(target) {
                Some(p) => {
                    p.current_dir = path;
                    ok(0)
                }
                None => fail(Errno::InvalidPid),
            }
        }
        VK_PINFO_GID => match table.setgroup(arg as i32, target) {
            Ok(()) => ok(0),
            Err(e) => fail(e),
        },
        _ => fail(Errno::Unknown),
    }
}

/// pinfo targets are the caller itself (pid 0) or one of its children.
fn pick_pinfo_target(table: &mut ProcessTable, pid: u32) -> Result<Pid, Errno> {
    let pid = pid as i32;
    if pid < 0 || pid > table.pid_limit() {
        return Err(Errno::InvalidPid);
    }
    let current = table.current;
    if pid == 0 || pid == current {
        return Ok(current);
    }
    let target = table.get(pid).ok_or(Errno::Permission)?;
    if target.parent != current {
        return Err(Errno::Permission);
    }
    Ok(pid)
}

fn sys_sig(pid: u32, sig: u32) -> SysResult {
    let pid = pid as i32;
    let mut table = process::table().lock();
    if pid == 0 || pid > table.pid_limit() {
        return fail(Errno::InvalidPid);
    }
    let res = if pid < 0 {
        signal::post_signal_group(&mut table, -pid, sig as usize)
    } else {
        signal::post_signal(&mut table, pid, sig as usize)
    };
    match res {
        Ok(()) => ok(0),
        Err(e) => fail(e),
    }
}

fn sys_sigaction(sig: u32, handler: u32) -> SysResult {
    let sig = sig as usize;
    if sig == 0 || sig >= crate::constants::NSIG {
        return fail(Errno::InvalidSignal);
    }
    if sig == signal::SIGKILL || sig == signal::SIGSTOP {
        return fail(Errno::InvalidSignal);
    }
    let mut table = process::table().lock();
    match table.current_mut() {
        Ok(p) => {
            let old = p.signal_handlers[sig];
            p.signal_handlers[sig] = handler;
            ok(old)
        }
        Err(e) => fail(e),
    }
}

fn sys_sigret() -> SysResult {
    let mut table = process::table().lock();
    let pid = table.current;
    match signal::sigreturn(&mut table, pid) {
        Ok(()) => ok(0),
        Err(e) => fail(e),
    }
}

fn sys_sbrk(incr: u32) -> SysResult {
    let mut table = process::table().lock();
    match table.sbrk_current(incr) {
        Ok(old) => ok(old),
        Err(e) => fail(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devfs::DevFs;
    use crate::ext2::{mkfs, Ext2Fs};
    use crate::paging::tests::ArenaFrames;
    use crate::paging::AddressSpace;
    use crate::pmm::BlockKind;
    use crate::process::{ProcessStatus, ThreadStatus, INVALID_PID};
    use crate::vfs::FsSpec;
    use alloc::boxed::Box;
    use spin::{Mutex, Once};

    const SCRATCH: u32 = 0x1000_0000;

    // The scenario tests drive the kernel-global tables, so they take
    // turns.
    static SCENARIO: Mutex<()> = Mutex::new(());

    fn setup() {
        static SETUP: Once<()> = Once::new();
        SETUP.call_once(|| {
            process::init_table(Box::new(ArenaFrames::new()));
            let mut v = vfs::vfs();
            let root_fs = Ext2Fs::mount(mkfs::ram_image(512, 64)).unwrap().into_filesystem();
            v.mount("/", root_fs).unwrap();

            let devfs_fs = DevFs::new_filesystem();
            let droot = match &devfs_fs.specific {
                FsSpec::Devfs(d) => d.root(&devfs_fs).unwrap(),
                _ => unreachable!(),
            };
            crate::tty::tty_init(&devfs_fs, &droot).unwrap();
            v.mount("/dev", devfs_fs).unwrap();
        });
    }

    /// A runnable process with a scratch window mapped for user pointers.
    fn fresh_process() -> Pid {
        let mut table = process::table().lock();
        let space = AddressSpace::new(table.frames.as_mut()).unwrap();
        let pid = table.create_process(INVALID_PID, space, 0);
        {
            let ProcessTable { frames, slots, .. } = &mut *table;
            let proc = slots_mut(slots, pid);
            proc.space
                .as_mut()
                .unwrap()
                .map_memory(
                    frames.as_mut(),
                    4 * crate::constants::PGSIZE,
                    SCRATCH,
                    BlockKind::User,
                )
                .unwrap();
        }
        table.current = pid;
        pid
    }

    fn slots_mut(
        slots: &mut alloc::vec::Vec<Option<crate::process::Process>>,
        pid: Pid,
    ) -> &mut crate::process::Process {
        slots[pid as usize].as_mut().unwrap()
    }

    fn put_bytes(at: u32, bytes: &[u8]) {
        let mut table = process::table().lock();
        copy_out(&mut table, at, bytes).unwrap();
    }

    fn put_cstr(at: u32, s: &str) {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        put_bytes(at, &bytes);
    }

    fn get_bytes(at: u32, n: usize) -> Vec<u8> {
        let mut table = process::table().lock();
        let mut buf = vec![0u8; n];
        copy_in(&mut table, at, &mut buf).unwrap();
        buf
    }

    #[test]
    fn tty_descriptor_starts_at_3_and_reaches_the_screen() {
        let _guard = SCENARIO.lock();
        setup();
        fresh_process();

        put_cstr(SCRATCH, "/dev/tty1");
        let (fd, err) = syscall(
            SYS_OPEN,
            SCRATCH,
            (OpenMode::READ | OpenMode::WRITE).bits(),
            0,
        );
        assert_eq!((fd, err), (3, Errno::None));

        put_bytes(SCRATCH + 64, b"Hi");
        let (n, err) = syscall(SYS_WRITE, 3, SCRATCH + 64, 2);
        assert_eq!((n, err), (2, Errno::None));
        assert!(crate::tty::screen_snapshot(0).ends_with(b"Hi"));
    }

    #[test]
    fn created_file_round_trips_through_the_descriptor_table() {
        let _guard = SCENARIO.lock();
        setup();
        fresh_process();

        put_cstr(SCRATCH, "/a");
        assert_eq!(syscall(SYS_MKDIR, SCRATCH, 0, 0), (0, Errno::None));

        put_cstr(SCRATCH + 32, "/a/f");
        let (fd, err) = syscall(
            SYS_OPEN,
            SCRATCH + 32,
            (OpenMode::WRITE | OpenMode::CREATE).bits(),
            0,
        );
        assert_eq!(err, Errno::None);
        put_bytes(SCRATCH + 64, b"xyz");
        assert_eq!(syscall(SYS_WRITE, fd, SCRATCH + 64, 3), (3, Errno::None));
        syscall(SYS_CLOSE, fd, 0, 0);

        let (fd2, err) = syscall(SYS_OPEN, SCRATCH + 32, OpenMode::READ.bits(), 0);
        assert_eq!(err, Errno::None);
        let (n, err) = syscall(SYS_READ, fd2, SCRATCH + 128, 3);
        assert_eq!((n, err), (3, Errno::None));
        assert_eq!(get_bytes(SCRATCH + 128, 3), b"xyz");
    }

    #[test]
    fn relative_paths_resolve_against_the_working_directory() {
        let _guard = SCENARIO.lock();
        setup();
        fresh_process();

        put_cstr(SCRATCH, "/sub");
        assert_eq!(syscall(SYS_MKDIR, SCRATCH, 0, 0), (0, Errno::None));
        {
            let mut table = process::table().lock();
            table.current_mut().unwrap().current_dir = String::from("/sub");
        }
        put_cstr(SCRATCH + 32, "rel.txt");
        let (_, err) = syscall(
            SYS_OPEN,
            SCRATCH + 32,
            (OpenMode::WRITE | OpenMode::CREATE).bits(),
            0,
        );
        assert_eq!(err, Errno::None);
        assert!(vfs::vfs().resolve("/sub/rel.txt").is_ok());
    }

    #[test]
    fn invalid_pointers_are_rejected_before_any_work() {
        let _guard = SCENARIO.lock();
        setup();
        fresh_process();

        // Kernel-space and unmapped pointers both bounce.
        assert_eq!(syscall(SYS_OPEN, 0xc000_0000, 0, 0), (0, Errno::InvalidPtr));
        assert_eq!(syscall(SYS_OPEN, 0x7fff_0000, 0, 0), (0, Errno::InvalidPtr));
        put_cstr(SCRATCH, "/dev/tty1");
        let (fd, _) = syscall(SYS_OPEN, SCRATCH, OpenMode::READ.bits(), 0);
        assert_eq!(
            syscall(SYS_READ, fd, 0xdead_0000, 4),
            (0, Errno::InvalidPtr)
        );
    }

    #[test]
    fn fork_shares_the_descriptor_and_close_is_local() {
        let _guard = SCENARIO.lock();
        setup();
        let parent = fresh_process();

        put_cstr(SCRATCH, "/dev/tty1");
        let (fd, err) = syscall(
            SYS_OPEN,
            SCRATCH,
            (OpenMode::READ | OpenMode::WRITE).bits(),
            0,
        );
        assert_eq!(err, Errno::None);

        let (child, err) = syscall(SYS_FORK, 0, 0, 0);
        assert_eq!(err, Errno::None);
        let child = child as Pid;
        assert_ne!(child, parent);

        {
            let table = process::table().lock();
            let pfd = table.get(parent).unwrap().fd_get(fd).unwrap();
            let cfd = table.get(child).unwrap().fd_get(fd).unwrap();
            assert!(alloc::sync::Arc::ptr_eq(&pfd, &cfd));
            assert_eq!(pfd.read().instances, 2);
            // The child's saved eax answers 0.
            assert_eq!(table.get(child).unwrap().active_thread().gregs.eax, 0);
        }

        // Close in the child; the parent's descriptor keeps working.
        process::table().lock().current = child;
        syscall(SYS_CLOSE, fd, 0, 0);
        process::table().lock().current = parent;
        put_bytes(SCRATCH + 64, b"!");
        assert_eq!(syscall(SYS_WRITE, fd, SCRATCH + 64, 1), (1, Errno::None));
        assert_eq!(
            process::table().lock().get(parent).unwrap().fd_get(fd).unwrap().read().instances,
            1
        );
    }

    #[test]
    fn exited_child_is_reaped_with_the_user_condition() {
        let _guard = SCENARIO.lock();
        setup();
        let parent = fresh_process();

        let (child, err) = syscall(SYS_FORK, 0, 0, 0);
        assert_eq!(err, Errno::None);
        let child = child as Pid;

        // The child runs exit(7).
        process::table().lock().current = child;
        syscall(SYS_EXIT, 7, 0, 0);
        assert_eq!(
            process::table().lock().get(child).unwrap().status,
            ProcessStatus::Zombie
        );

        process::table().lock().current = parent;
        let (reaped, err) = syscall(SYS_WAIT, -1i32 as u32, SCRATCH + 200, 0);
        assert_eq!(err, Errno::None);
        assert_eq!(reaped as Pid, child);
        let status = u32::from_le_bytes(get_bytes(SCRATCH + 200, 4).try_into().unwrap());
        assert_eq!(status, process::EXIT_CONDITION_USER | 7);
        assert!(process::table().lock().get(child).is_none());
    }

    #[test]
    fn sigkill_finishes_a_sleeping_child_before_it_runs_again() {
        let _guard = SCENARIO.lock();
        setup();
        let parent = fresh_process();
        let (child, _) = syscall(SYS_FORK, 0, 0, 0);
        let child = child as Pid;

        {
            let mut table = process::table().lock();
            table.wait_thread(child, 0, ThreadStatus::AsleepIo, 0, 0);
            assert_eq!(table.get(child).unwrap().status, ProcessStatus::AsleepThreads);
        }

        assert_eq!(
            syscall(SYS_SIG, child as u32, signal::SIGKILL as u32, 0),
            (0, Errno::None)
        );
        // The next schedule boundary of the child resolves the kill; no
        // user instruction runs in between.
        {
            let mut table = process::table().lock();
            signal::check_pending(&mut table, child);
            assert_eq!(table.get(child).unwrap().status, ProcessStatus::Zombie);
        }
        let _ = parent;
    }

    #[test]
    fn sigaction_registers_and_rejects_the_unblockables() {
        let _guard = SCENARIO.lock();
        setup();
        fresh_process();

        assert_eq!(
            syscall(SYS_SIGACTION, signal::SIGTERM as u32, 0x0804_9000, 0),
            (0, Errno::None)
        );
        // Old handler comes back on replacement.
        assert_eq!(
            syscall(SYS_SIGACTION, signal::SIGTERM as u32, 0x0804_9004, 0),
            (0x0804_9000, Errno::None)
        );
        assert_eq!(
            syscall(SYS_SIGACTION, signal::SIGKILL as u32, 0x1, 0),
            (0, Errno::InvalidSignal)
        );
        assert_eq!(
            syscall(SYS_SIGACTION, signal::SIGSTOP as u32, 0x1, 0),
            (0, Errno::InvalidSignal)
        );
    }

    #[test]
    fn sbrk_returns_the_old_break_and_grows() {
        let _guard = SCENARIO.lock();
        setup();
        fresh_process();
        {
            let mut table = process::table().lock();
            table.current_mut().unwrap().heap_addr = 0x2000_0000;
        }
        let (old, err) = syscall(SYS_SBRK, 0x2000, 0, 0);
        assert_eq!((old, err), (0x2000_0000, Errno::None));
        let (now, _) = syscall(SYS_SBRK, 0, 0, 0);
        assert_eq!(now, 0x2000_2000);
        // The fresh heap pages are usable user memory.
        put_bytes(0x2000_0000, b"heap");
        assert_eq!(get_bytes(0x2000_0000, 4), b"heap");
    }

    #[test]
    fn readdir_stat_and_fsinfo_describe_the_tree() {
        let _guard = SCENARIO.lock();
        setup();
        fresh_process();

        put_cstr(SCRATCH, "/");
        let (fd, err) = syscall(SYS_OPEN, SCRATCH, OpenMode::READ.bits(), 0);
        assert_eq!(err, Errno::None);

        // Entry 0 is ".".
        assert_eq!(syscall(SYS_READDIR, fd, 0, SCRATCH + 256), (0, Errno::None));
        let raw = get_bytes(SCRATCH + 256, 8);
        assert_eq!(u32::from_le_bytes(raw[..4].try_into().unwrap()), crate::ext2::ROOT_INODE);
        assert_eq!(raw[4], b'.');
        assert_eq!(raw[5], 0);
        // Indexing past the end is out of bounds.
        let (_, err) = syscall(SYS_READDIR, fd, 64, SCRATCH + 256);
        assert_eq!(err, Errno::FileOut);

        assert_eq!(syscall(SYS_STAT, fd, 0, SCRATCH + 300), (0, Errno::None));
        let raw = get_bytes(SCRATCH + 300, core::mem::size_of::<Stat>());
        let stat = unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const Stat) };
        assert_eq!(stat.st_mode, 0o040000);
        assert_eq!(stat.st_ino, crate::ext2::ROOT_INODE);
        assert_eq!(stat.st_blksize, 512);
        assert_eq!((stat.st_uid, stat.st_gid), (0, 0));

        let (mounted, err) = syscall(SYS_FSINFO, VK_FSINFO_MOUNTED_FS_NUMBER, SCRATCH + 400, 0);
        assert_eq!(err, Errno::None);
        assert_eq!(mounted, 2); // root ext2 + devfs

        // Unimplemented table slots answer Unknown.
        assert_eq!(syscall(SYS_MOUNT, 0, 0, 0), (0, Errno::Unknown));
        assert_eq!(syscall(18, 0, 0, 0), (0, Errno::Unknown));
    }

    #[test]
    fn dup_duplicates_into_chosen_and_free_slots() {
        let _guard = SCENARIO.lock();
        setup();
        fresh_process();

        put_cstr(SCRATCH, "/dev/tty1");
        let (fd, _) = syscall(SYS_OPEN, SCRATCH, (OpenMode::READ | OpenMode::WRITE).bits(), 0);
        let (dup1, err) = syscall(SYS_DUP, fd, 0, 0);
        assert_eq!(err, Errno::None);
        assert_ne!(dup1, fd);
        let (dup2, err) = syscall(SYS_DUP, fd, 9, 0);
        assert_eq!((dup2, err), (9, Errno::None));
        // All three share the descriptor object.
        let table = process::table().lock();
        let proc = table.get(table.current).unwrap();
        let a = proc.fd_get(fd).unwrap();
        let b = proc.fd_get(dup1).unwrap();
        let c = proc.fd_get(9).unwrap();
        assert!(alloc::sync::Arc::ptr_eq(&a, &b));
        assert!(alloc::sync::Arc::ptr_eq(&a, &c));
        assert_eq!(a.read().instances, 3);
        // Slots below 3 stay reserved.
        drop(table);
        assert_eq!(syscall(SYS_DUP, fd, 2, 0), (0, Errno::Unknown));
    }

    #[test]
    fn ioctl_round_trips_termios_on_a_tty() {
        let _guard = SCENARIO.lock();
        setup();
        fresh_process();

        put_cstr(SCRATCH, "/dev/tty2");
        let (fd, _) = syscall(SYS_OPEN, SCRATCH, (OpenMode::READ | OpenMode::WRITE).bits(), 0);
        assert_eq!(
            syscall(SYS_IOCTL, fd, crate::tty::TCGETS, SCRATCH + 512),
            (0, Errno::None)
        );
        let raw = get_bytes(SCRATCH + 512, core::mem::size_of::<Termios>());
        let mut t = unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const Termios) };
        assert_eq!(t, Termios::default());

        t.c_lflag.remove(crate::tty::Lflag::ECHO);
        let raw = unsafe {
            core::slice::from_raw_parts(
                &t as *const Termios as *const u8,
                core::mem::size_of::<Termios>(),
            )
        };
        put_bytes(SCRATCH + 512, raw);
        assert_eq!(
            syscall(SYS_IOCTL, fd, crate::tty::TCSETS, SCRATCH + 512),
            (0, Errno::None)
        );
        assert_eq!(
            syscall(SYS_IOCTL, fd, crate::tty::TCGETS, SCRATCH + 600),
            (0, Errno::None)
        );
        let raw = get_bytes(SCRATCH + 600, core::mem::size_of::<Termios>());
        let back = unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const Termios) };
        assert!(!back.c_lflag.contains(crate::tty::Lflag::ECHO));

        // ioctl on a non-device is refused.
        put_cstr(SCRATCH + 32, "/plain");
        let (pfd, _) = syscall(
            SYS_OPEN,
            SCRATCH + 32,
            (OpenMode::WRITE | OpenMode::CREATE).bits(),
            0,
        );
        assert_eq!(
            syscall(SYS_IOCTL, pfd, crate::tty::TCGETS, SCRATCH + 512),
            (0, Errno::NoDevice)
        );
    }

    #[test]
    fn finfo_reports_device_type_and_path() {
        let _guard = SCENARIO.lock();
        setup();
        fresh_process();

        put_cstr(SCRATCH, "/dev/tty3");
        let (fd, _) = syscall(SYS_OPEN, SCRATCH, OpenMode::READ.bits(), 0);
        assert_eq!(
            syscall(SYS_FINFO, fd, VK_FINFO_DEVICE_TYPE, SCRATCH + 700),
            (0, Errno::None)
        );
        let dt = u32::from_le_bytes(get_bytes(SCRATCH + 700, 4).try_into().unwrap());
        assert_eq!(dt, crate::devfs::DEVFS_TYPE_TTY);

        assert_eq!(
            syscall(SYS_FINFO, fd, VK_FINFO_PATH, SCRATCH + 704),
            (0, Errno::None)
        );
        let path = get_bytes(SCRATCH + 704, 10);
        assert_eq!(&path[..9], b"/dev/tty3");
        assert_eq!(path[9], 0);
    }

    #[test]
    fn openio_descriptors_queue_bytes() {
        let _guard = SCENARIO.lock();
        setup();
        fresh_process();

        let (fd, err) = syscall(SYS_OPENIO, 0, 0, 0);
        assert_eq!(err, Errno::None);
        put_bytes(SCRATCH + 800, b"pipe-ish");
        assert_eq!(syscall(SYS_WRITE, fd, SCRATCH + 800, 8), (8, Errno::None));
        assert_eq!(syscall(SYS_READ, fd, SCRATCH + 820, 8), (8, Errno::None));
        assert_eq!(get_bytes(SCRATCH + 820, 8), b"pipe-ish");
    }

    #[test]
    fn getpinfo_is_limited_to_self_and_children() {
        let _guard = SCENARIO.lock();
        setup();
        let parent = fresh_process();
        let (child, _) = syscall(SYS_FORK, 0, 0, 0);
        let child = child as Pid;

        assert_eq!(
            syscall(SYS_GETPINFO, 0, VK_PINFO_PID, SCRATCH + 900),
            (0, Errno::None)
        );
        let pid = i32::from_le_bytes(get_bytes(SCRATCH + 900, 4).try_into().unwrap());
        assert_eq!(pid, parent);

        assert_eq!(
            syscall(SYS_GETPINFO, child as u32, VK_PINFO_PPID, SCRATCH + 900),
            (0, Errno::None)
        );
        let ppid = i32::from_le_bytes(get_bytes(SCRATCH + 900, 4).try_into().unwrap());
        assert_eq!(ppid, parent);

        // A stranger (the child's perspective on the parent's parent) is
        // not inspectable.
        process::table().lock().current = child;
        let other = fresh_process(); // new unrelated process, current now
        assert_eq!(
            syscall(SYS_GETPINFO, child as u32, VK_PINFO_PID, SCRATCH + 900),
            (0, Errno::Permission)
        );
        let _ = other;
    }
}

fn sys_ioctl(fd: u32, cmd: u32, arg_ptr: u32) -> SysResult {
    let mut table = process::table().lock();
    let fdref = match current_fd(&mut table, fd) {
        Ok(f) => f,
        Err(e) => return fail(e),
    };
    let node = fdref.read().file.clone();
    let idx = match devfs::tty_index(&node) {
        Some(i) => i,
        None => return fail(Errno::NoDevice),
    };
    if let Err(e) = validate_ptr(&mut table, arg_ptr) {
        return fail(e);
    }
    let mut termios = Termios::default();
    if cmd == tty::TCSETS {
        let mut raw = [0u8; core::mem::size_of::<Termios>()];
        if let Err(e) = copy_in(&mut table, arg_ptr, &mut raw) {
            return fail(e);
        }
        termios = unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const Termios) };
    }
    match tty::tty_ioctl(idx, cmd, &mut termios) {
        Ok(v) => {
            if cmd == tty::TCGETS {
                let raw = unsafe {
                    core::slice::from_raw_parts(
                        &termios as *const Termios as *const u8,
                        core::mem::size_of::<Termios>(),
                    )
                };
                if let Err(e) = copy_out(&mut table, arg_ptr, raw) {
                    return fail(e);
                }
            }
            ok(v)
        }
        Err(e) => fail(e),
    }
}
