//! iso9660 driver (read-only).
//!
//! Mounts from the primary volume descriptor at LBA 16 and exposes extents
//! behind the VFS node contract. Directory records never cross sector
//! boundaries; a zero length byte means "skip to the next sector". Extent
//! start LBAs double as inode numbers.

use crate::err::{Errno, KResult};
use crate::storage::{read_flexible, DeviceRef};
use crate::vfs::{
    DirEntry, FileAttributes, FileSystem, FsNode, FsSpec, FsType, NodeRef, NodeSpec,
};
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::{Mutex, RwLock};

const SECTOR: u64 = 2048;
const PVD_LBA: u64 = 16;

const FLAG_HIDDEN: u8 = 1 << 0;
const FLAG_DIR: u8 = 1 << 1;

/// Per-node payload carried in `NodeSpec::Iso9660`.
#[derive(Debug)]
pub struct Iso9660Node {
    pub extent_start: u32,
    pub extent_size: u32,
}

/// One directory record, decoded from its raw on-disk form.
#[derive(Debug)]
struct DirRecord {
    extent_start: u32,
    extent_size: u32,
    flags: u8,
    name: String,
}

pub struct Iso9660Fs {
    dev: DeviceRef,
    root_extent: u32,
    root_size: u32,
    nodes: Mutex<BTreeMap<u32, NodeRef>>,
}

impl core::fmt::Debug for Iso9660Fs {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Iso9660Fs")
            .field("root_extent", &self.root_extent)
            .field("root_size", &self.root_size)
            .field("nodes", &self.nodes)
            .finish()
    }
}

impl Iso9660Fs {
    /// Reads and validates the primary volume descriptor. Early-boot reads
    /// from optical media fail transiently, so the PVD read is retried up
    /// to three times before the error surfaces.
    pub fn mount(dev: DeviceRef) -> KResult<Iso9660Fs> {
        let mut pvd = vec![0u8; SECTOR as usize];
        let mut last = Errno::Io;
        let mut ok = false;
        for _ in 0..3 {
            match read_flexible(&dev, PVD_LBA * SECTOR, &mut pvd) {
                Ok(()) => {
                    ok = true;
                    break;
                }
                Err(e) => last = e,
            }
        }
        if !ok {
            return Err(last);
        }
        if pvd[0] != 1 || &pvd[1..6] != b"CD001" {
            return Err(Errno::Unknown);
        }
        // The root directory record is embedded in the PVD.
        let root = decode_record(&pvd[156..]).ok_or(Errno::Unknown)?;
        Ok(Iso9660Fs {
            dev,
            root_extent: root.extent_start,
            root_size: root.extent_size,
            nodes: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn into_filesystem(self) -> Arc<FileSystem> {
        Arc::new(FileSystem {
            fs_type: FsType::Iso9660,
            read_only: true,
            specific: FsSpec::Iso9660(self),
        })
    }

    fn records_of(&self, extent: u32, size: u32) -> KResult<Vec<DirRecord>> {
        let mut data = vec![0u8; size as usize];
        read_flexible(&self.dev, extent as u64 * SECTOR, &mut data)?;
        let mut out = Vec::new();
        let mut off = 0usize;
        while off < data.len() {
            let len = data[off] as usize;
            if len == 0 {
                // Records never straddle sectors; skip the padding.
                off = (off / SECTOR as usize + 1) * SECTOR as usize;
                continue;
            }
            if let Some(rec) = decode_record(&data[off..off + len]) {
                out.push(rec);
            }
            off += len;
        }
        Ok(out)
    }

    fn build_node(
        &self,
        fs: &Arc<FileSystem>,
        parent: Option<&NodeRef>,
        rec: &DirRecord,
    ) -> NodeRef {
        let mut attrs = FileAttributes::empty();
        if rec.flags & FLAG_DIR != 0 {
            attrs |= FileAttributes::DIR;
        }
        if rec.flags & FLAG_HIDDEN != 0 {
            attrs |= FileAttributes::HIDDEN;
        }
        let node = Arc::new(RwLock::new(FsNode {
            name: rec.name.clone(),
            parent: parent.map(Arc::downgrade),
            fs: fs.clone(),
            length: rec.extent_size as u64,
            attributes: attrs,
            hard_links: 1,
            creation_time: 0,
            last_access_time: 0,
            last_modification_time: 0,
            specific: NodeSpec::Iso9660(Iso9660Node {
                extent_start: rec.extent_start,
                extent_size: rec.extent_size,
            }),
        }));
        self.nodes.lock().insert(rec.extent_start, node.clone());
        node
    }

    pub fn root(&self, fs: &Arc<FileSystem>) -> KResult<NodeRef> {
        if let Some(n) = self.nodes.lock().get(&self.root_extent) {
            return Ok(n.clone());
        }
        let rec = DirRecord {
            extent_start: self.root_extent,
            extent_size: self.root_size,
            flags: FLAG_DIR,
            name: "/".to_string(),
        };
        Ok(self.build_node(fs, None, &rec))
    }

    pub fn lookup(&self, fs: &Arc<FileSystem>, dir: &NodeRef, name: &str) -> KResult<NodeRef> {
        let (extent, size) = iso_extent(dir)?;
        let rec = self
            .records_of(extent, size)?
            .into_iter()
            .find(|r| r.name == name)
            .ok_or(Errno::FileNotFound)?;
        if let Some(n) = self.nodes.lock().get(&rec.extent_start) {
            return Ok(n.clone());
        }
        Ok(self.build_node(fs, Some(dir), &rec))
    }

    pub fn read(&self, node: &NodeRef, off: u64, buf: &mut [u8]) -> KResult<usize> {
        let (extent, _) = iso_extent(node)?;
        read_flexible(&self.dev, extent as u64 * SECTOR + off, buf)?;
        Ok(buf.len())
    }

    /// `(blocks, free blocks, inodes, free inodes)` for statfs; a mastered
    /// volume has nothing free.
    pub fn stats(&self) -> (u32, u32, u32, u32) {
        let blocks = self.dev.lock().sector_count() as u32;
        (blocks, 0, u32::MAX - 1, 0)
    }

    pub fn readdir(&self, node: &NodeRef) -> KResult<Vec<DirEntry>> {
        let (extent, size) = iso_extent(node)?;
        Ok(self
            .records_of(extent, size)?
            .into_iter()
            .map(|r| DirEntry {
                inode: r.extent_start,
                name: r.name,
            })
            .collect())
    }
}

fn iso_extent(node: &NodeRef) -> KResult<(u32, u32)> {
    match &node.read().specific {
        NodeSpec::Iso9660(i) => Ok((i.extent_start, i.extent_size)),
        _ => Err(Errno::Unknown),
    }
}

fn decode_record(raw: &[u8]) -> Option<DirRecord> {
    if raw.len() < 34 {
        return None;
    }
    let name_len = raw[32] as usize;
    if raw.len() < 33 + name_len {
        return None;
    }
    let name = match &raw[33..33 + name_len] {
        [0x00] => ".".to_string(),
        [0x01] => "..".to_string(),
        bytes => {
            // Strip the ";1" version suffix and a trailing dot from
            // extensionless names.
            let mut s = String::from_utf8_lossy(bytes).into_owned();
            if let Some(i) = s.find(';') {
                s.truncate(i);
            }
            if s.ends_with('.') {
                s.pop();
            }
            s
        }
    };
    Some(DirRecord {
        extent_start: u32::from_le_bytes([raw[2], raw[3], raw[4], raw[5]]),
        extent_size: u32::from_le_bytes([raw[10], raw[11], raw[12], raw[13]]),
        flags: raw[25],
        name,
    })
}

#[cfg(test)]
pub(crate) mod mkiso {
    use super::*;
    use crate::storage::RamDisk;

    pub(crate) fn record(buf: &mut [u8], off: usize, name: &[u8], extent: u32, size: u32, flags: u8) -> usize {
        let len = 33 + name.len() + (name.len() + 1) % 2;
        buf[off] = len as u8;
        buf[off + 2..off + 6].copy_from_slice(&extent.to_le_bytes());
        buf[off + 6..off + 10].copy_from_slice(&extent.to_be_bytes());
        buf[off + 10..off + 14].copy_from_slice(&size.to_le_bytes());
        buf[off + 14..off + 18].copy_from_slice(&size.to_be_bytes());
        buf[off + 25] = flags;
        buf[off + 32] = name.len() as u8;
        buf[off + 33..off + 33 + name.len()].copy_from_slice(name);
        off + len
    }

    /// A tiny volume: root at LBA 20 containing `HELLO.TXT;1` at LBA 21.
    pub(crate) fn ram_image() -> DeviceRef {
        let mut data = vec![0u8; 2048 * 24];

        // PVD.
        let pvd = 16 * 2048;
        data[pvd] = 1;
        data[pvd + 1..pvd + 6].copy_from_slice(b"CD001");
        data[pvd + 6] = 1;
        record(&mut data, pvd + 156, &[0x00], 20, 2048, FLAG_DIR);

        // Root directory extent.
        let root = 20 * 2048;
        let mut off = record(&mut data, root, &[0x00], 20, 2048, FLAG_DIR);
        off = record(&mut data, off, &[0x01], 20, 2048, FLAG_DIR);
        record(&mut data, off, b"HELLO.TXT;1", 21, 13, 0);

        // File payload.
        data[21 * 2048..21 * 2048 + 13].copy_from_slice(b"hello from cd");

        Arc::new(Mutex::new(RamDisk::from_bytes(2048, data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{self, OpenMode, Vfs};

    fn mounted() -> Vfs {
        let fs = Iso9660Fs::mount(mkiso::ram_image()).unwrap().into_filesystem();
        let mut v = Vfs::new();
        v.mount("/", fs).unwrap();
        v
    }

    #[test]
    fn pvd_must_carry_the_standard_identifier() {
        let dev: DeviceRef = Arc::new(Mutex::new(crate::storage::RamDisk::new(2048, 24)));
        assert!(Iso9660Fs::mount(dev).is_err());
    }

    #[test]
    fn version_suffix_is_stripped_from_names() {
        let v = mounted();
        let root = v.open_file("/", OpenMode::READ).unwrap();
        let names: Vec<String> = vfs::read_directory(&root)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, [".", "..", "HELLO.TXT"]);
    }

    #[test]
    fn file_contents_come_from_the_extent() {
        let v = mounted();
        let fd = v.open_file("/HELLO.TXT", OpenMode::READ).unwrap();
        let mut buf = [0u8; 13];
        assert_eq!(vfs::read_file(&fd, &mut buf).unwrap(), 13);
        assert_eq!(&buf, b"hello from cd");
        // The extent start LBA doubles as the inode number.
        assert_eq!(fd.read().file.read().inode_number(), 21);
    }

    #[test]
    fn writes_are_refused() {
        let v = mounted();
        assert_eq!(
            v.open_file("/HELLO.TXT", OpenMode::WRITE).unwrap_err(),
            Errno::Permission
        );
        assert_eq!(
            v.create_file("/new", FileAttributes::empty()).unwrap_err(),
            Errno::Permission
        );
    }
}
