//! Virtual file system.
//!
//! The VFS owns the mount table and the generic file-node/descriptor
//! abstractions. Everything below it is a file-system variant: ext2,
//! iso9660 or devfs, selected by the `specific` sum type carried by each
//! node. Path resolution walks from the root of the mount point with the
//! longest matching prefix; mount points shadow the directory contents of
//! their host.

use crate::devfs::{self, DevFs, DevfsNode};
use crate::err::{Errno, KResult};
use crate::ext2::{Ext2Fs, Ext2Node};
use crate::iso9660::{Iso9660Fs, Iso9660Node};
use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::{Mutex, RwLock};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u32 {
        const READ    = 0x01;
        const WRITE   = 0x02;
        /// Pinned descriptors survive last-close node eviction (mount roots,
        /// kernel-held TTY handles).
        const PINNED  = 0x04;
        const CREATE  = 0x08;
        const CLOEXEC = 0x10;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileAttributes: u32 {
        const DIR    = 0x01;
        const HIDDEN = 0x02;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Ext2,
    Iso9660,
    Devfs,
}

impl FsType {
    pub fn as_u32(self) -> u32 {
        match self {
            FsType::Ext2 => 1,
            FsType::Iso9660 => 2,
            FsType::Devfs => 3,
        }
    }
}

/// Per-mount statistics, reported by the `fsinfo` system call.
#[derive(Debug, Clone)]
pub struct StatfsInfo {
    pub f_type: u32,
    pub f_flags: u32,
    pub f_blocks: u32,
    pub f_bfree: u32,
    pub f_files: u32,
    pub f_ffree: u32,
    pub f_fsid: u32,
    pub mount_path: String,
}

#[derive(Debug)]
pub struct FileSystem {
    pub fs_type: FsType,
    pub read_only: bool,
    pub specific: FsSpec,
}

#[derive(Debug)]
pub enum FsSpec {
    Ext2(Ext2Fs),
    Iso9660(Iso9660Fs),
    Devfs(DevFs),
}

/// In-memory representation of a file-system object.
#[derive(Debug)]
pub struct FsNode {
    pub name: String,
    pub parent: Option<Weak<RwLock<FsNode>>>,
    pub fs: Arc<FileSystem>,
    pub length: u64,
    pub attributes: FileAttributes,
    pub hard_links: u32,
    pub creation_time: u32,
    pub last_access_time: u32,
    pub last_modification_time: u32,
    pub specific: NodeSpec,
}

#[derive(Debug)]
pub enum NodeSpec {
    Ext2(Ext2Node),
    Iso9660(Iso9660Node),
    Devfs(DevfsNode),
}

pub type NodeRef = Arc<RwLock<FsNode>>;

impl FsNode {
    pub fn is_dir(&self) -> bool {
        self.attributes.contains(FileAttributes::DIR)
    }

    /// The variant-specific inode number reported by stat: the on-disk
    /// inode for ext2, the extent start LBA for iso9660.
    pub fn inode_number(&self) -> u32 {
        match &self.specific {
            NodeSpec::Ext2(e) => e.inode,
            NodeSpec::Iso9660(i) => i.extent_start,
            NodeSpec::Devfs(_) => 0x20,
        }
    }
}

/// Handle held by a process into an fsnode, with its own offset and mode.
#[derive(Debug)]
pub struct Fd {
    pub file: NodeRef,
    pub offset: u64,
    pub mode: OpenMode,
    /// Cross-process reference count: fork and dup increment it, close
    /// decrements; the node is released when the last instance goes.
    pub instances: u32,
    pub path: String,
}

pub type FdRef = Arc<RwLock<Fd>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u32,
    pub name: String,
}

pub struct MountPoint {
    pub path: String,
    pub fs: Arc<FileSystem>,
    pub root: NodeRef,
}

pub struct Vfs {
    mounts: Vec<MountPoint>,
}

impl Vfs {
    pub const fn new() -> Vfs {
        Vfs { mounts: Vec::new() }
    }

    /// Attaches a file system under `path`. The first mount must be `/`.
    pub fn mount(&mut self, path: &str, fs: Arc<FileSystem>) -> KResult<()> {
        if self.mounts.is_empty() && path != "/" {
            return Err(Errno::Unknown);
        }
        let root = root_of(&fs)?;
        self.mounts.push(MountPoint {
            path: path.to_string(),
            fs,
            root,
        });
        Ok(())
    }

    pub fn mounts(&self) -> &[MountPoint] {
        &self.mounts
    }

    pub fn statfs_all(&self) -> Vec<StatfsInfo> {
        self.mounts
            .iter()
            .enumerate()
            .map(|(i, mp)| {
                let (blocks, bfree, files, ffree) = match &mp.fs.specific {
                    FsSpec::Ext2(e) => e.stats(),
                    FsSpec::Iso9660(fs) => fs.stats(),
                    FsSpec::Devfs(_) => (0, 0, 0, 0),
                };
                StatfsInfo {
                    f_type: mp.fs.fs_type.as_u32(),
                    f_flags: if mp.fs.read_only { 1 } else { 0 },
                    f_blocks: blocks,
                    f_bfree: bfree,
                    f_files: files,
                    f_ffree: ffree,
                    f_fsid: i as u32,
                    mount_path: mp.path.clone(),
                }
            })
            .collect()
    }

    /// The mount point with the longest prefix of `path`, plus the
    /// remainder of the path inside that mount.
    fn mount_for<'p>(&self, path: &'p str) -> KResult<(&MountPoint, &'p str)> {
        let mut best: Option<(&MountPoint, &'p str)> = None;
        for mp in &self.mounts {
            let rest = match strip_mount_prefix(path, &mp.path) {
                Some(r) => r,
                None => continue,
            };
            if best.map(|(b, _)| mp.path.len() > b.path.len()).unwrap_or(true) {
                best = Some((mp, rest));
            }
        }
        best.ok_or(Errno::FileNotFound)
    }

    /// Resolves an absolute path to a node.
    pub fn resolve(&self, path: &str) -> KResult<NodeRef> {
        if !path.starts_with('/') {
            return Err(Errno::FileNotFound);
        }
        let (mp, rest) = self.mount_for(path)?;
        let mut cur = mp.root.clone();
        for comp in rest.split('/').filter(|c| !c.is_empty()) {
            match comp {
                "." => {}
                ".." => {
                    let up = cur.read().parent.as_ref().and_then(|w| w.upgrade());
                    if let Some(parent) = up {
                        cur = parent;
                    }
                }
                name => {
                    if !cur.read().is_dir() {
                        return Err(Errno::FileNotFound);
                    }
                    cur = child_of(&cur, name)?;
                }
            }
        }
        Ok(cur)
    }

    /// Resolves the parent directory of `path` and returns it with the
    /// final component.
    pub fn resolve_parent<'p>(&self, path: &'p str) -> KResult<(NodeRef, &'p str)> {
        let trimmed = path.trim_end_matches('/');
        let (dir, name) = match trimmed.rfind('/') {
            Some(0) => ("/", &trimmed[1..]),
            Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
            None => return Err(Errno::FileNotFound),
        };
        if name.is_empty() {
            return Err(Errno::FileNotFound);
        }
        let node = self.resolve(dir)?;
        if !node.read().is_dir() {
            return Err(Errno::FileNotFound);
        }
        Ok((node, name))
    }

    /// Opens `path`, creating it first when the mode asks for it.
    pub fn open_file(&self, path: &str, mode: OpenMode) -> KResult<FdRef> {
        let node = match self.resolve(path) {
            Ok(node) => node,
            Err(Errno::FileNotFound) if mode.contains(OpenMode::CREATE) => {
                self.create_file(path, FileAttributes::empty())?
            }
            Err(e) => return Err(e),
        };
        if mode.contains(OpenMode::WRITE) && node.read().fs.read_only {
            return Err(Errno::Permission);
        }
        Ok(Arc::new(RwLock::new(Fd {
            file: node,
            offset: 0,
            mode,
            instances: 1,
            path: path.to_string(),
        })))
    }

    /// Creates a file or directory node.
    pub fn create_file(&self, path: &str, attrs: FileAttributes) -> KResult<NodeRef> {
        let (dir, name) = self.resolve_parent(path)?;
        if child_of(&dir, name).is_ok() {
            return Err(Errno::Unknown);
        }
        let fs = dir.read().fs.clone();
        if fs.read_only {
            return Err(Errno::Permission);
        }
        match &fs.specific {
            FsSpec::Ext2(e) => e.create(&fs, &dir, name, attrs),
            FsSpec::Iso9660(_) => Err(Errno::Permission),
            FsSpec::Devfs(_) => Err(Errno::Permission),
        }
    }

    /// Removes a directory entry; directories must be empty.
    pub fn unlink(&self, path: &str) -> KResult<()> {
        let (dir, name) = self.resolve_parent(path)?;
        if name == "." || name == ".." {
            return Err(Errno::Permission);
        }
        let node = child_of(&dir, name)?;
        let fs = dir.read().fs.clone();
        if fs.read_only {
            return Err(Errno::Permission);
        }
        match &fs.specific {
            FsSpec::Ext2(e) => e.unlink(&dir, &node, name),
            _ => Err(Errno::Permission),
        }
    }

    /// Creates `new` as a hard link to the inode behind `old`.
    pub fn link(&self, old: &str, new: &str) -> KResult<()> {
        let node = self.resolve(old)?;
        if node.read().is_dir() {
            return Err(Errno::Permission);
        }
        let (dir, name) = self.resolve_parent(new)?;
        if child_of(&dir, name).is_ok() {
            return Err(Errno::Unknown);
        }
        let dir_fs = dir.read().fs.clone();
        if !Arc::ptr_eq(&dir_fs, &node.read().fs) {
            return Err(Errno::Permission);
        }
        match &dir_fs.specific {
            FsSpec::Ext2(e) => e.add_link(&dir, &node, name),
            _ => Err(Errno::Permission),
        }
    }

    /// Moves `old` to `new` within one file system.
    pub fn rename(&self, old: &str, new: &str) -> KResult<()> {
        let node = self.resolve(old)?;
        if node.read().is_dir() {
            return Err(Errno::Permission);
        }
        self.link(old, new)?;
        // The new entry points at the same inode; dropping the old name
        // leaves link counts balanced.
        self.unlink(old)
    }
}

fn strip_mount_prefix<'p>(path: &'p str, mount: &str) -> Option<&'p str> {
    if mount == "/" {
        return Some(path);
    }
    let rest = path.strip_prefix(mount)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

/// Looks `name` up in `dir` through the owning file-system variant.
pub fn child_of(dir: &NodeRef, name: &str) -> KResult<NodeRef> {
    let fs = dir.read().fs.clone();
    match &fs.specific {
        FsSpec::Ext2(e) => e.lookup(&fs, dir, name),
        FsSpec::Iso9660(i) => i.lookup(&fs, dir, name),
        FsSpec::Devfs(d) => d.lookup(dir, name),
    }
}

fn root_of(fs: &Arc<FileSystem>) -> KResult<NodeRef> {
    match &fs.specific {
        FsSpec::Ext2(e) => e.root(fs),
        FsSpec::Iso9660(i) => i.root(fs),
        FsSpec::Devfs(d) => d.root(fs),
    }
}

/// Reads from the descriptor at its current offset, advancing it by the
/// byte count actually transferred.
pub fn read_file(fd: &FdRef, buf: &mut [u8]) -> KResult<usize> {
    let (node, offset, mode) = {
        let fd = fd.read();
        (fd.file.clone(), fd.offset, fd.mode)
    };
    if !mode.contains(OpenMode::READ) {
        return Err(Errno::Permission);
    }
    let fs = node.read().fs.clone();
    let n = match &fs.specific {
        FsSpec::Devfs(_) => devfs::read_device(&node, buf)?,
        FsSpec::Ext2(e) => {
            let len = node.read().length;
            let n = clamp_span(offset, len, buf.len())?;
            e.read(&node, offset, &mut buf[..n])?
        }
        FsSpec::Iso9660(i) => {
            let len = node.read().length;
            let n = clamp_span(offset, len, buf.len())?;
            i.read(&node, offset, &mut buf[..n])?
        }
    };
    fd.write().offset += n as u64;
    Ok(n)
}

/// Writes through the descriptor, extending regular files as needed.
pub fn write_file(fd: &FdRef, buf: &[u8]) -> KResult<usize> {
    let (node, offset, mode) = {
        let fd = fd.read();
        (fd.file.clone(), fd.offset, fd.mode)
    };
    if !mode.contains(OpenMode::WRITE) {
        return Err(Errno::Permission);
    }
    let fs = node.read().fs.clone();
    if fs.read_only {
        return Err(Errno::Permission);
    }
    let n = match &fs.specific {
        FsSpec::Devfs(_) => devfs::write_device(&node, buf)?,
        FsSpec::Ext2(e) => e.write(&node, offset, buf)?,
        FsSpec::Iso9660(_) => return Err(Errno::Permission),
    };
    fd.write().offset += n as u64;
    Ok(n)
}

pub const SEEK_SET: u32 = 0;
pub const SEEK_CUR: u32 = 1;
pub const SEEK_END: u32 = 2;

pub fn seek(fd: &FdRef, offset: u32, whence: u32) -> KResult<u64> {
    let mut fd = fd.write();
    let new = match whence {
        SEEK_SET => offset as u64,
        SEEK_CUR => fd.offset + offset as u64,
        SEEK_END => fd.file.read().length + offset as u64,
        _ => return Err(Errno::Unknown),
    };
    fd.offset = new;
    Ok(new)
}

pub fn flength(fd: &FdRef) -> u64 {
    fd.read().file.read().length
}

/// Enumerates a directory through its file-system variant.
pub fn read_directory(fd: &FdRef) -> KResult<Vec<DirEntry>> {
    let node = fd.read().file.clone();
    if !node.read().is_dir() {
        return Err(Errno::Unknown);
    }
    let fs = node.read().fs.clone();
    match &fs.specific {
        FsSpec::Ext2(e) => e.readdir(&node),
        FsSpec::Iso9660(i) => i.readdir(&node),
        FsSpec::Devfs(d) => d.readdir(&node),
    }
}

/// Drops one instance of the descriptor; on the last one the node is given
/// back to its file system so cold cache entries can go away.
pub fn close_file(fd: &FdRef) {
    let node = {
        let mut fd = fd.write();
        if fd.instances > 1 {
            fd.instances -= 1;
            return;
        }
        fd.instances = 0;
        fd.file.clone()
    };
    let fs = node.read().fs.clone();
    if let FsSpec::Ext2(e) = &fs.specific {
        e.release_node(&node);
    }
}

fn clamp_span(offset: u64, length: u64, want: usize) -> KResult<usize> {
    if want == 0 {
        return Ok(0);
    }
    if offset >= length {
        return Err(Errno::FileOut);
    }
    Ok(core::cmp::min(want as u64, length - offset) as usize)
}

static VFS: Mutex<Vfs> = Mutex::new(Vfs::new());

pub fn vfs() -> spin::MutexGuard<'static, Vfs> {
    VFS.lock()
}
