//! ext2 driver (revision 0).
//!
//! Only as deep as the VFS node contract requires: 1 KiB blocks, 128-byte
//! inodes, direct plus single-indirect addressing. Reads and writes go
//! through the block-device seam byte-granularly; the superblock and group
//! descriptor are kept in memory and written back whenever an allocation
//! changes them.

use crate::err::{Errno, KResult};
use crate::storage::{read_flexible, write_flexible, DeviceRef};
use crate::vfs::{
    DirEntry, FileAttributes, FileSystem, FsNode, FsSpec, FsType, NodeRef, NodeSpec,
};
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::mem;
use spin::{Mutex, RwLock};

pub const EXT2_MAGIC: u16 = 0xef53;
pub const ROOT_INODE: u32 = 2;
const FIRST_FREE_INODE: u32 = 11;

const MODE_DIR: u16 = 0x4000;
const MODE_REG: u16 = 0x8000;

const FTYPE_REG: u8 = 1;
const FTYPE_DIR: u8 = 2;

const NDIRECT: usize = 12;
const INODE_SIZE: u32 = 128;

#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
struct Superblock {
    inodes_count: u32,
    blocks_count: u32,
    r_blocks_count: u32,
    free_blocks_count: u32,
    free_inodes_count: u32,
    first_data_block: u32,
    log_block_size: u32,
    log_frag_size: u32,
    blocks_per_group: u32,
    frags_per_group: u32,
    inodes_per_group: u32,
    mtime: u32,
    wtime: u32,
    mnt_count: u16,
    max_mnt_count: u16,
    magic: u16,
    state: u16,
    errors: u16,
    minor_rev_level: u16,
    lastcheck: u32,
    checkinterval: u32,
    creator_os: u32,
    rev_level: u32,
    def_resuid: u16,
    def_resgid: u16,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
struct GroupDesc {
    block_bitmap: u32,
    inode_bitmap: u32,
    inode_table: u32,
    free_blocks_count: u16,
    free_inodes_count: u16,
    used_dirs_count: u16,
    pad: u16,
    reserved: [u8; 12],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct DiskInode {
    mode: u16,
    uid: u16,
    size: u32,
    atime: u32,
    ctime: u32,
    mtime: u32,
    dtime: u32,
    gid: u16,
    links_count: u16,
    blocks: u32,
    flags: u32,
    osd1: u32,
    block: [u32; 15],
    generation: u32,
    file_acl: u32,
    dir_acl: u32,
    faddr: u32,
    osd2: [u8; 12],
}

impl DiskInode {
    fn zeroed() -> DiskInode {
        unsafe { mem::zeroed() }
    }

    fn is_dir(&self) -> bool {
        self.mode & 0xf000 == MODE_DIR
    }
}

/// Per-node payload carried in `NodeSpec::Ext2`.
#[derive(Debug)]
pub struct Ext2Node {
    pub inode: u32,
}

pub struct Ext2Fs {
    dev: DeviceRef,
    state: Mutex<State>,
    nodes: Mutex<BTreeMap<u32, NodeRef>>,
}

impl core::fmt::Debug for Ext2Fs {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ext2Fs")
            .field("state", &self.state)
            .field("nodes", &self.nodes)
            .finish()
    }
}

#[derive(Debug)]
struct State {
    sb: Superblock,
    group: GroupDesc,
}

fn read_struct<T: Copy>(dev: &DeviceRef, offset: u64) -> KResult<T> {
    let mut buf = vec![0u8; mem::size_of::<T>()];
    read_flexible(dev, offset, &mut buf)?;
    Ok(unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const T) })
}

fn write_struct<T: Copy>(dev: &DeviceRef, offset: u64, value: &T) -> KResult<()> {
    let buf = unsafe {
        core::slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>())
    };
    write_flexible(dev, offset, buf)
}

impl Ext2Fs {
    /// Reads the superblock and group descriptor; fails on a bad magic.
    pub fn mount(dev: DeviceRef) -> KResult<Ext2Fs> {
        let sb: Superblock = read_struct(&dev, 1024)?;
        if sb.magic != EXT2_MAGIC {
            return Err(Errno::Unknown);
        }
        let bs = 1024u64 << sb.log_block_size;
        let group_block = if bs == 1024 { 2 } else { 1 };
        let group: GroupDesc = read_struct(&dev, group_block * bs)?;
        Ok(Ext2Fs {
            dev,
            state: Mutex::new(State { sb, group }),
            nodes: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn into_filesystem(self) -> Arc<FileSystem> {
        Arc::new(FileSystem {
            fs_type: FsType::Ext2,
            read_only: false,
            specific: FsSpec::Ext2(self),
        })
    }

    fn block_size(&self) -> u32 {
        1024 << self.state.lock().sb.log_block_size
    }

    fn flush_meta(&self) -> KResult<()> {
        let st = self.state.lock();
        let bs = 1024u64 << st.sb.log_block_size;
        let group_block = if bs == 1024 { 2 } else { 1 };
        write_struct(&self.dev, 1024, &st.sb)?;
        write_struct(&self.dev, group_block * bs, &st.group)
    }

    fn inode_offset(&self, ino: u32) -> u64 {
        let st = self.state.lock();
        let bs = 1024u64 << st.sb.log_block_size;
        let table = st.group.inode_table as u64;
        table * bs + ((ino - 1) as u64) * INODE_SIZE as u64
    }

    fn read_inode(&self, ino: u32) -> KResult<DiskInode> {
        read_struct(&self.dev, self.inode_offset(ino))
    }

    fn write_inode(&self, ino: u32, inode: &DiskInode) -> KResult<()> {
        write_struct(&self.dev, self.inode_offset(ino), inode)
    }

    /// Scans the block bitmap for a clear bit, claims it and zeroes the
    /// block. Returns an absolute block number.
    fn alloc_block(&self) -> KResult<u32> {
        let bs = self.block_size();
        let (bitmap_block, first_data) = {
            let st = self.state.lock();
            (st.group.block_bitmap, st.sb.first_data_block)
        };
        let mut bitmap = vec![0u8; bs as usize];
        read_flexible(&self.dev, bitmap_block as u64 * bs as u64, &mut bitmap)?;
        let limit = {
            let st = self.state.lock();
            st.sb.blocks_count - st.sb.first_data_block
        };
        for bit in 0..limit {
            let (byte, mask) = ((bit / 8) as usize, 1u8 << (bit % 8));
            if bitmap[byte] & mask == 0 {
                bitmap[byte] |= mask;
                write_flexible(&self.dev, bitmap_block as u64 * bs as u64, &bitmap)?;
                {
                    let mut st = self.state.lock();
                    st.sb.free_blocks_count -= 1;
                    st.group.free_blocks_count -= 1;
                }
                self.flush_meta()?;
                let block = first_data + bit;
                write_flexible(&self.dev, block as u64 * bs as u64, &vec![0u8; bs as usize])?;
                return Ok(block);
            }
        }
        Err(Errno::Io)
    }

    fn free_block(&self, block: u32) -> KResult<()> {
        let bs = self.block_size();
        let (bitmap_block, first_data) = {
            let st = self.state.lock();
            (st.group.block_bitmap, st.sb.first_data_block)
        };
        let bit = block - first_data;
        let mut bitmap = vec![0u8; bs as usize];
        read_flexible(&self.dev, bitmap_block as u64 * bs as u64, &mut bitmap)?;
        bitmap[(bit / 8) as usize] &= !(1u8 << (bit % 8));
        write_flexible(&self.dev, bitmap_block as u64 * bs as u64, &bitmap)?;
        let mut st = self.state.lock();
        st.sb.free_blocks_count += 1;
        st.group.free_blocks_count += 1;
        drop(st);
        self.flush_meta()
    }

    fn alloc_inode(&self) -> KResult<u32> {
        let bs = self.block_size();
        let (bitmap_block, count) = {
            let st = self.state.lock();
            (st.group.inode_bitmap, st.sb.inodes_count)
        };
        let mut bitmap = vec![0u8; bs as usize];
        read_flexible(&self.dev, bitmap_block as u64 * bs as u64, &mut bitmap)?;
        for bit in (FIRST_FREE_INODE - 1)..count {
            let (byte, mask) = ((bit / 8) as usize, 1u8 << (bit % 8));
            if bitmap[byte] & mask == 0 {
                bitmap[byte] |= mask;
                write_flexible(&self.dev, bitmap_block as u64 * bs as u64, &bitmap)?;
                let mut st = self.state.lock();
                st.sb.free_inodes_count -= 1;
                st.group.free_inodes_count -= 1;
                drop(st);
                self.flush_meta()?;
                return Ok(bit + 1);
            }
        }
        Err(Errno::Io)
    }

    fn free_inode(&self, ino: u32) -> KResult<()> {
        let bs = self.block_size();
        let bitmap_block = self.state.lock().group.inode_bitmap;
        let bit = ino - 1;
        let mut bitmap = vec![0u8; bs as usize];
        read_flexible(&self.dev, bitmap_block as u64 * bs as u64, &mut bitmap)?;
        bitmap[(bit / 8) as usize] &= !(1u8 << (bit % 8));
        write_flexible(&self.dev, bitmap_block as u64 * bs as u64, &bitmap)?;
        let mut st = self.state.lock();
        st.sb.free_inodes_count += 1;
        st.group.free_inodes_count += 1;
        drop(st);
        self.flush_meta()
    }

    /// Absolute block number of file block `idx`, optionally allocating it
    /// (and the indirect block) on the way.
    fn nth_block(&self, inode: &mut DiskInode, idx: usize, alloc: bool) -> KResult<u32> {
        let per_indirect = (self.block_size() / 4) as usize;
        if idx < NDIRECT {
            if inode.block[idx] == 0 {
                if !alloc {
                    return Ok(0);
                }
                inode.block[idx] = self.alloc_block()?;
            }
            return Ok(inode.block[idx]);
        }
        let idx = idx - NDIRECT;
        if idx >= per_indirect {
            return Err(Errno::FileOut);
        }
        if inode.block[NDIRECT] == 0 {
            if !alloc {
                return Ok(0);
            }
            inode.block[NDIRECT] = self.alloc_block()?;
        }
        let ind = inode.block[NDIRECT] as u64 * self.block_size() as u64;
        let mut entry = [0u8; 4];
        read_flexible(&self.dev, ind + idx as u64 * 4, &mut entry)?;
        let mut block = u32::from_le_bytes(entry);
        if block == 0 {
            if !alloc {
                return Ok(0);
            }
            block = self.alloc_block()?;
            write_flexible(&self.dev, ind + idx as u64 * 4, &block.to_le_bytes())?;
        }
        Ok(block)
    }

    fn inode_read(&self, inode: &mut DiskInode, off: u64, buf: &mut [u8]) -> KResult<usize> {
        let bs = self.block_size() as u64;
        let mut done = 0;
        while done < buf.len() {
            let pos = off + done as u64;
            let block = self.nth_block(inode, (pos / bs) as usize, false)?;
            let in_block = (pos % bs) as usize;
            let take = core::cmp::min(buf.len() - done, bs as usize - in_block);
            if block == 0 {
                // Hole: reads as zeroes.
                buf[done..done + take].fill(0);
            } else {
                read_flexible(
                    &self.dev,
                    block as u64 * bs + in_block as u64,
                    &mut buf[done..done + take],
                )?;
            }
            done += take;
        }
        Ok(done)
    }

    fn inode_write(&self, ino: u32, inode: &mut DiskInode, off: u64, buf: &[u8]) -> KResult<usize> {
        let bs = self.block_size() as u64;
        let mut done = 0;
        while done < buf.len() {
            let pos = off + done as u64;
            let block = self.nth_block(inode, (pos / bs) as usize, true)?;
            let in_block = (pos % bs) as usize;
            let take = core::cmp::min(buf.len() - done, bs as usize - in_block);
            write_flexible(
                &self.dev,
                block as u64 * bs + in_block as u64,
                &buf[done..done + take],
            )?;
            done += take;
        }
        let end = off + buf.len() as u64;
        if end > inode.size as u64 {
            inode.size = end as u32;
        }
        self.write_inode(ino, inode)?;
        Ok(done)
    }

    fn free_inode_blocks(&self, inode: &mut DiskInode) -> KResult<()> {
        for i in 0..NDIRECT {
            if inode.block[i] != 0 {
                self.free_block(inode.block[i])?;
                inode.block[i] = 0;
            }
        }
        if inode.block[NDIRECT] != 0 {
            let per_indirect = self.block_size() / 4;
            let ind = inode.block[NDIRECT] as u64 * self.block_size() as u64;
            for i in 0..per_indirect {
                let mut entry = [0u8; 4];
                read_flexible(&self.dev, ind + i as u64 * 4, &mut entry)?;
                let block = u32::from_le_bytes(entry);
                if block != 0 {
                    self.free_block(block)?;
                }
            }
            self.free_block(inode.block[NDIRECT])?;
            inode.block[NDIRECT] = 0;
        }
        inode.size = 0;
        Ok(())
    }

    /// Walks a directory inode, yielding `(entry_offset, inode, name)`.
    fn dir_entries(&self, inode: &mut DiskInode) -> KResult<Vec<(u64, u32, String)>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; inode.size as usize];
        self.inode_read(inode, 0, &mut buf)?;
        let mut off = 0usize;
        while off + 8 <= buf.len() {
            let ino = u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
            let rec_len = u16::from_le_bytes([buf[off + 4], buf[off + 5]]) as usize;
            let name_len = buf[off + 6] as usize;
            if rec_len < 8 {
                return Err(Errno::Io);
            }
            if ino != 0 && off + 8 + name_len <= buf.len() {
                let name = String::from_utf8_lossy(&buf[off + 8..off + 8 + name_len]).into_owned();
                out.push((off as u64, ino, name));
            }
            off += rec_len;
        }
        Ok(out)
    }

    /// Adds `name -> ino` to a directory, splitting an existing entry's
    /// slack or appending a fresh block.
    fn dir_add(&self, dir_ino: u32, dir: &mut DiskInode, name: &str, ino: u32, ftype: u8) -> KResult<()> {
        let bs = self.block_size() as usize;
        let needed = dirent_len(name.len());
        let mut buf = vec![0u8; dir.size as usize];
        self.inode_read(dir, 0, &mut buf)?;

        let mut off = 0usize;
        while off + 8 <= buf.len() {
            let cur_ino = u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
            let rec_len = u16::from_le_bytes([buf[off + 4], buf[off + 5]]) as usize;
            let name_len = buf[off + 6] as usize;
            if rec_len < 8 {
                return Err(Errno::Io);
            }
            let used = if cur_ino == 0 { 0 } else { dirent_len(name_len) };
            if rec_len - used >= needed {
                let (entry_off, entry_len) = if used == 0 {
                    (off, rec_len)
                } else {
                    // Shrink the current entry to its real size and take
                    // over the slack.
                    buf[off + 4..off + 6].copy_from_slice(&(used as u16).to_le_bytes());
                    (off + used, rec_len - used)
                };
                write_dirent(&mut buf, entry_off, ino, entry_len, name, ftype);
                return self.inode_write(dir_ino, dir, 0, &buf).map(|_| ());
            }
            off += rec_len;
        }
        // No room: the new entry gets a block of its own.
        let mut block = vec![0u8; bs];
        write_dirent(&mut block, 0, ino, bs, name, ftype);
        let end = dir.size as u64;
        self.inode_write(dir_ino, dir, end, &block).map(|_| ())
    }

    /// Clears the entry for `name`, folding its space into the predecessor.
    fn dir_remove(&self, dir_ino: u32, dir: &mut DiskInode, name: &str) -> KResult<()> {
        let mut buf = vec![0u8; dir.size as usize];
        self.inode_read(dir, 0, &mut buf)?;
        let bs = self.block_size() as usize;
        let mut off = 0usize;
        let mut prev: Option<usize> = None;
        while off + 8 <= buf.len() {
            let cur_ino = u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
            let rec_len = u16::from_le_bytes([buf[off + 4], buf[off + 5]]) as usize;
            let name_len = buf[off + 6] as usize;
            if rec_len < 8 {
                return Err(Errno::Io);
            }
            if cur_ino != 0 && &buf[off + 8..off + 8 + name_len] == name.as_bytes() {
                match prev {
                    Some(p) if p / bs == off / bs => {
                        let prev_len = u16::from_le_bytes([buf[p + 4], buf[p + 5]]) as usize;
                        let merged = (prev_len + rec_len) as u16;
                        buf[p + 4..p + 6].copy_from_slice(&merged.to_le_bytes());
                    }
                    _ => {
                        buf[off..off + 4].copy_from_slice(&0u32.to_le_bytes());
                    }
                }
                return self.inode_write(dir_ino, dir, 0, &buf).map(|_| ());
            }
            prev = Some(off);
            off += rec_len;
        }
        Err(Errno::FileNotFound)
    }

    fn build_node(
        &self,
        fs: &Arc<FileSystem>,
        parent: Option<&NodeRef>,
        name: &str,
        ino: u32,
        inode: &DiskInode,
    ) -> NodeRef {
        let mut attrs = FileAttributes::empty();
        if inode.is_dir() {
            attrs |= FileAttributes::DIR;
        }
        if name.starts_with('.') && name != "." && name != ".." {
            attrs |= FileAttributes::HIDDEN;
        }
        let node = Arc::new(RwLock::new(FsNode {
            name: name.to_string(),
            parent: parent.map(Arc::downgrade),
            fs: fs.clone(),
            length: inode.size as u64,
            attributes: attrs,
            hard_links: inode.links_count as u32,
            creation_time: inode.ctime,
            last_access_time: inode.atime,
            last_modification_time: inode.mtime,
            specific: NodeSpec::Ext2(Ext2Node { inode: ino }),
        }));
        self.nodes.lock().insert(ino, node.clone());
        node
    }

    pub fn root(&self, fs: &Arc<FileSystem>) -> KResult<NodeRef> {
        if let Some(n) = self.nodes.lock().get(&ROOT_INODE) {
            return Ok(n.clone());
        }
        let inode = self.read_inode(ROOT_INODE)?;
        Ok(self.build_node(fs, None, "/", ROOT_INODE, &inode))
    }

    pub fn lookup(&self, fs: &Arc<FileSystem>, dir: &NodeRef, name: &str) -> KResult<NodeRef> {
        let dir_ino = ext2_ino(dir)?;
        let mut dinode = self.read_inode(dir_ino)?;
        if !dinode.is_dir() {
            return Err(Errno::FileNotFound);
        }
        let ino = self
            .dir_entries(&mut dinode)?
            .into_iter()
            .find(|(_, _, n)| n == name)
            .map(|(_, i, _)| i)
            .ok_or(Errno::FileNotFound)?;
        if let Some(n) = self.nodes.lock().get(&ino) {
            return Ok(n.clone());
        }
        let inode = self.read_inode(ino)?;
        Ok(self.build_node(fs, Some(dir), name, ino, &inode))
    }

    pub fn read(&self, node: &NodeRef, off: u64, buf: &mut [u8]) -> KResult<usize> {
        let ino = ext2_ino(node)?;
        let mut inode = self.read_inode(ino)?;
        self.inode_read(&mut inode, off, buf)
    }

    pub fn write(&self, node: &NodeRef, off: u64, buf: &[u8]) -> KResult<usize> {
        let ino = ext2_ino(node)?;
        let mut inode = self.read_inode(ino)?;
        let n = self.inode_write(ino, &mut inode, off, buf)?;
        let mut node = node.write();
        node.length = inode.size as u64;
        Ok(n)
    }

    pub fn create(
        &self,
        fs: &Arc<FileSystem>,
        dir: &NodeRef,
        name: &str,
        attrs: FileAttributes,
    ) -> KResult<NodeRef> {
        let dir_ino = ext2_ino(dir)?;
        let mut dinode = self.read_inode(dir_ino)?;
        let is_dir = attrs.contains(FileAttributes::DIR);

        let ino = self.alloc_inode()?;
        let mut inode = DiskInode::zeroed();
        inode.mode = if is_dir { MODE_DIR | 0o755 } else { MODE_REG | 0o644 };
        inode.links_count = if is_dir { 2 } else { 1 };
        self.write_inode(ino, &inode)?;

        if is_dir {
            let mut block = vec![0u8; self.block_size() as usize];
            let dotdot_at = dirent_len(1);
            write_dirent(&mut block, 0, ino, dotdot_at, ".", FTYPE_DIR);
            write_dirent(
                &mut block,
                dotdot_at,
                dir_ino,
                self.block_size() as usize - dotdot_at,
                "..",
                FTYPE_DIR,
            );
            self.inode_write(ino, &mut inode, 0, &block)?;
            // ".." references the parent.
            dinode.links_count += 1;
            self.write_inode(dir_ino, &dinode)?;
            dir.write().hard_links += 1;
        }

        self.dir_add(dir_ino, &mut dinode, name, ino, if is_dir { FTYPE_DIR } else { FTYPE_REG })?;
        dir.write().length = dinode.size as u64;
        Ok(self.build_node(fs, Some(dir), name, ino, &inode))
    }

    pub fn add_link(&self, dir: &NodeRef, node: &NodeRef, name: &str) -> KResult<()> {
        let dir_ino = ext2_ino(dir)?;
        let ino = ext2_ino(node)?;
        let mut dinode = self.read_inode(dir_ino)?;
        self.dir_add(dir_ino, &mut dinode, name, ino, FTYPE_REG)?;
        dir.write().length = dinode.size as u64;
        let mut inode = self.read_inode(ino)?;
        inode.links_count += 1;
        self.write_inode(ino, &inode)?;
        node.write().hard_links += 1;
        Ok(())
    }

    pub fn unlink(&self, dir: &NodeRef, node: &NodeRef, name: &str) -> KResult<()> {
        let dir_ino = ext2_ino(dir)?;
        let ino = ext2_ino(node)?;
        let mut dinode = self.read_inode(dir_ino)?;
        let mut inode = self.read_inode(ino)?;

        if inode.is_dir() {
            let listed = self
                .dir_entries(&mut inode)?
                .into_iter()
                .filter(|(_, _, n)| n != "." && n != "..")
                .count();
            if listed != 0 {
                return Err(Errno::Unknown);
            }
            self.dir_remove(dir_ino, &mut dinode, name)?;
            dinode.links_count -= 1; // the ".." back reference
            self.write_inode(dir_ino, &dinode)?;
            dir.write().hard_links -= 1;
            self.free_inode_blocks(&mut inode)?;
            self.write_inode(ino, &DiskInode::zeroed())?;
            self.free_inode(ino)?;
            self.nodes.lock().remove(&ino);
            return Ok(());
        }

        self.dir_remove(dir_ino, &mut dinode, name)?;
        inode.links_count -= 1;
        node.write().hard_links -= 1;
        if inode.links_count == 0 {
            self.free_inode_blocks(&mut inode)?;
            self.write_inode(ino, &DiskInode::zeroed())?;
            self.free_inode(ino)?;
            self.nodes.lock().remove(&ino);
        } else {
            self.write_inode(ino, &inode)?;
        }
        Ok(())
    }

    pub fn readdir(&self, node: &NodeRef) -> KResult<Vec<DirEntry>> {
        let ino = ext2_ino(node)?;
        let mut inode = self.read_inode(ino)?;
        Ok(self
            .dir_entries(&mut inode)?
            .into_iter()
            .map(|(_, inode, name)| DirEntry { inode, name })
            .collect())
    }

    /// `(blocks, free blocks, inodes, free inodes)` for statfs.
    pub fn stats(&self) -> (u32, u32, u32, u32) {
        let st = self.state.lock();
        (
            st.sb.blocks_count,
            st.sb.free_blocks_count,
            st.sb.inodes_count,
            st.sb.free_inodes_count,
        )
    }

    /// Evicts the cache entry once nothing but the cache and the closing
    /// descriptor hold the node. Mount roots keep an extra reference in the
    /// mount table, which pins them here.
    pub fn release_node(&self, node: &NodeRef) {
        let ino = match ext2_ino(node) {
            Ok(i) => i,
            Err(_) => return,
        };
        let mut nodes = self.nodes.lock();
        if let Some(cached) = nodes.get(&ino) {
            if Arc::strong_count(cached) <= 3 {
                nodes.remove(&ino);
            }
        }
    }
}

fn ext2_ino(node: &NodeRef) -> KResult<u32> {
    match &node.read().specific {
        NodeSpec::Ext2(e) => Ok(e.inode),
        _ => Err(Errno::Unknown),
    }
}

/// On-disk length of an entry with an `n`-byte name, 4-aligned.
fn dirent_len(n: usize) -> usize {
    (8 + n + 3) & !3
}

fn write_dirent(buf: &mut [u8], off: usize, ino: u32, rec_len: usize, name: &str, ftype: u8) {
    buf[off..off + 4].copy_from_slice(&ino.to_le_bytes());
    buf[off + 4..off + 6].copy_from_slice(&(rec_len as u16).to_le_bytes());
    buf[off + 6] = name.len() as u8;
    buf[off + 7] = ftype;
    buf[off + 8..off + 8 + name.len()].copy_from_slice(name.as_bytes());
}

/// Test image builder: a single-group file system with an empty root.
#[cfg(test)]
pub(crate) mod mkfs {
    use super::*;
    use crate::storage::RamDisk;

    pub(crate) fn ram_image(blocks: u32, inodes: u32) -> DeviceRef {
        let bs = 1024usize;
        let mut data = vec![0u8; blocks as usize * bs];

        let inode_table_blocks = (inodes * INODE_SIZE + 1023) / 1024;
        let first_free_block = 5 + inode_table_blocks; // 0 boot, 1 sb, 2 group, 3/4 bitmaps
        let root_dir_block = first_free_block;

        let mut sb = Superblock {
            inodes_count: inodes,
            blocks_count: blocks,
            r_blocks_count: 0,
            free_blocks_count: blocks - first_free_block - 1,
            free_inodes_count: inodes - FIRST_FREE_INODE + 1,
            first_data_block: 1,
            log_block_size: 0,
            log_frag_size: 0,
            blocks_per_group: blocks,
            frags_per_group: blocks,
            inodes_per_group: inodes,
            mtime: 0,
            wtime: 0,
            mnt_count: 0,
            max_mnt_count: 0xffff,
            magic: EXT2_MAGIC,
            state: 1,
            errors: 1,
            minor_rev_level: 0,
            lastcheck: 0,
            checkinterval: 0,
            creator_os: 0,
            rev_level: 0,
            def_resuid: 0,
            def_resgid: 0,
        };

        let group = GroupDesc {
            block_bitmap: 3,
            inode_bitmap: 4,
            inode_table: 5,
            free_blocks_count: sb.free_blocks_count as u16,
            free_inodes_count: sb.free_inodes_count as u16,
            used_dirs_count: 1,
            pad: 0,
            reserved: [0; 12],
        };

        // Block bitmap: bit i covers block first_data_block + i.
        {
            let bitmap = &mut data[3 * bs..4 * bs];
            for block in 1..=root_dir_block {
                let bit = block - sb.first_data_block;
                bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
            }
        }
        // Inode bitmap: the reserved inodes 1..=10 plus root (2) are taken.
        {
            let bitmap = &mut data[4 * bs..5 * bs];
            for ino in 1..FIRST_FREE_INODE {
                let bit = ino - 1;
                bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
            }
        }
        // Root inode.
        {
            let mut root = DiskInode::zeroed();
            root.mode = MODE_DIR | 0o755;
            root.links_count = 2; // "." and the mount itself
            root.size = bs as u32;
            root.block[0] = root_dir_block;
            let off = 5 * bs + (ROOT_INODE as usize - 1) * INODE_SIZE as usize;
            let raw = unsafe {
                core::slice::from_raw_parts(
                    &root as *const DiskInode as *const u8,
                    mem::size_of::<DiskInode>(),
                )
            };
            data[off..off + raw.len()].copy_from_slice(raw);
        }
        // Root directory data: "." and "..", both pointing at the root.
        {
            let off = root_dir_block as usize * bs;
            let dot_len = dirent_len(1);
            let block = &mut data[off..off + bs];
            write_dirent(block, 0, ROOT_INODE, dot_len, ".", FTYPE_DIR);
            write_dirent(block, dot_len, ROOT_INODE, bs - dot_len, "..", FTYPE_DIR);
        }

        sb.wtime = 0;
        let raw_sb = unsafe {
            core::slice::from_raw_parts(&sb as *const Superblock as *const u8, mem::size_of::<Superblock>())
        };
        data[1024..1024 + raw_sb.len()].copy_from_slice(raw_sb);
        let raw_group = unsafe {
            core::slice::from_raw_parts(&group as *const GroupDesc as *const u8, mem::size_of::<GroupDesc>())
        };
        data[2 * bs..2 * bs + raw_group.len()].copy_from_slice(raw_group);

        Arc::new(Mutex::new(RamDisk::from_bytes(512, data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{self, OpenMode, Vfs};

    fn mounted() -> Vfs {
        let dev = mkfs::ram_image(256, 32);
        let fs = Ext2Fs::mount(dev).unwrap().into_filesystem();
        let mut v = Vfs::new();
        v.mount("/", fs).unwrap();
        v
    }

    #[test]
    fn mount_rejects_bad_magic() {
        let dev: DeviceRef = Arc::new(Mutex::new(crate::storage::RamDisk::new(512, 64)));
        assert!(Ext2Fs::mount(dev).is_err());
    }

    #[test]
    fn written_bytes_read_back() {
        let v = mounted();
        v.create_file("/f", FileAttributes::empty()).unwrap();
        let fd = v.open_file("/f", OpenMode::READ | OpenMode::WRITE).unwrap();
        assert_eq!(vfs::write_file(&fd, b"xyz").unwrap(), 3);
        vfs::seek(&fd, 0, vfs::SEEK_SET).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(vfs::read_file(&fd, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"xyz");
        assert_eq!(vfs::flength(&fd), 3);
    }

    #[test]
    fn large_files_spill_into_the_indirect_block() {
        let v = mounted();
        v.create_file("/big", FileAttributes::empty()).unwrap();
        let fd = v.open_file("/big", OpenMode::READ | OpenMode::WRITE).unwrap();
        let chunk = [7u8; 1024];
        // 14 blocks: 12 direct + 2 via the indirect block.
        for _ in 0..14 {
            vfs::write_file(&fd, &chunk).unwrap();
        }
        vfs::seek(&fd, 12 * 1024, vfs::SEEK_SET).unwrap();
        let mut buf = [0u8; 16];
        vfs::read_file(&fd, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 16]);
    }

    #[test]
    fn mkdir_then_create_inside() {
        let v = mounted();
        v.create_file("/a", FileAttributes::DIR).unwrap();
        v.create_file("/a/f", FileAttributes::empty()).unwrap();
        let fd = v.open_file("/a/f", OpenMode::WRITE).unwrap();
        vfs::write_file(&fd, b"nested").unwrap();
        vfs::close_file(&fd);

        let fd = v.open_file("/a/f", OpenMode::READ).unwrap();
        let mut buf = [0u8; 6];
        vfs::read_file(&fd, &mut buf).unwrap();
        assert_eq!(&buf, b"nested");

        let dir = v.open_file("/a", OpenMode::READ).unwrap();
        let names: Vec<String> = vfs::read_directory(&dir)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, [".", "..", "f"]);
    }

    #[test]
    fn same_path_opens_share_one_node() {
        let v = mounted();
        v.create_file("/shared", FileAttributes::empty()).unwrap();
        let a = v.open_file("/shared", OpenMode::READ).unwrap();
        let b = v.open_file("/shared", OpenMode::READ).unwrap();
        assert!(Arc::ptr_eq(&a.read().file, &b.read().file));
    }

    #[test]
    fn unlink_removes_and_frees() {
        let v = mounted();
        v.create_file("/doomed", FileAttributes::empty()).unwrap();
        let fd = v.open_file("/doomed", OpenMode::WRITE).unwrap();
        vfs::write_file(&fd, &[1u8; 2048]).unwrap();
        vfs::close_file(&fd);
        v.unlink("/doomed").unwrap();
        assert_eq!(v.resolve("/doomed").unwrap_err(), Errno::FileNotFound);
        // The entry's blocks went back to the allocator.
        v.create_file("/next", FileAttributes::empty()).unwrap();
    }

    #[test]
    fn unlink_refuses_populated_directories() {
        let v = mounted();
        v.create_file("/d", FileAttributes::DIR).unwrap();
        v.create_file("/d/inner", FileAttributes::empty()).unwrap();
        assert!(v.unlink("/d").is_err());
        v.unlink("/d/inner").unwrap();
        v.unlink("/d").unwrap();
        assert!(v.resolve("/d").is_err());
    }

    #[test]
    fn links_share_the_inode() {
        let v = mounted();
        v.create_file("/orig", FileAttributes::empty()).unwrap();
        let fd = v.open_file("/orig", OpenMode::WRITE).unwrap();
        vfs::write_file(&fd, b"once").unwrap();
        v.link("/orig", "/alias").unwrap();

        let alias = v.open_file("/alias", OpenMode::READ).unwrap();
        let mut buf = [0u8; 4];
        vfs::read_file(&alias, &mut buf).unwrap();
        assert_eq!(&buf, b"once");
        assert_eq!(alias.read().file.read().hard_links, 2);

        // Dropping one name keeps the other alive.
        v.unlink("/orig").unwrap();
        assert!(v.resolve("/alias").is_ok());
    }

    #[test]
    fn rename_moves_between_directories() {
        let v = mounted();
        v.create_file("/sub", FileAttributes::DIR).unwrap();
        v.create_file("/f", FileAttributes::empty()).unwrap();
        v.rename("/f", "/sub/g").unwrap();
        assert!(v.resolve("/f").is_err());
        assert!(v.resolve("/sub/g").is_ok());
    }
}
