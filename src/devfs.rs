//! Device file system.
//!
//! A pure in-memory tree, conventionally mounted at `/dev`. Device nodes
//! carry what kind of device they front; reads and writes are forwarded to
//! the owning driver (the TTY layer, or a plain byte stream).

use crate::err::{Errno, KResult};
use crate::iostream::IoStreamRef;
use crate::tty;
use crate::vfs::{
    DirEntry, FileAttributes, FileSystem, FsNode, FsSpec, FsType, NodeRef, NodeSpec,
};
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Once, RwLock};

pub const DEVFS_TYPE_TTY: u32 = 1;
pub const DEVFS_TYPE_IOSTREAM: u32 = 2;

#[derive(Debug)]
pub enum Device {
    /// Index into the kernel TTY table.
    Tty(usize),
    /// Anonymous byte queue (`openio` descriptors).
    Stream(IoStreamRef),
}

impl Device {
    pub fn device_type(&self) -> u32 {
        match self {
            Device::Tty(_) => DEVFS_TYPE_TTY,
            Device::Stream(_) => DEVFS_TYPE_IOSTREAM,
        }
    }
}

#[derive(Debug)]
pub enum DevfsNode {
    Dir(Vec<NodeRef>),
    Device(Device),
}

#[derive(Debug)]
pub struct DevFs {
    root: Once<NodeRef>,
}

impl DevFs {
    pub fn new_filesystem() -> Arc<FileSystem> {
        Arc::new(FileSystem {
            fs_type: FsType::Devfs,
            read_only: false,
            specific: FsSpec::Devfs(DevFs { root: Once::new() }),
        })
    }

    pub fn root(&self, fs: &Arc<FileSystem>) -> KResult<NodeRef> {
        Ok(self
            .root
            .call_once(|| {
                Arc::new(RwLock::new(FsNode {
                    name: "/".to_string(),
                    parent: None,
                    fs: fs.clone(),
                    length: 0,
                    attributes: FileAttributes::DIR,
                    hard_links: 1,
                    creation_time: 0,
                    last_access_time: 0,
                    last_modification_time: 0,
                    specific: NodeSpec::Devfs(DevfsNode::Dir(Vec::new())),
                }))
            })
            .clone())
    }

    pub fn lookup(&self, dir: &NodeRef, name: &str) -> KResult<NodeRef> {
        let dir = dir.read();
        match &dir.specific {
            NodeSpec::Devfs(DevfsNode::Dir(children)) => children
                .iter()
                .find(|c| c.read().name == name)
                .cloned()
                .ok_or(Errno::FileNotFound),
            _ => Err(Errno::FileNotFound),
        }
    }

    pub fn readdir(&self, dir: &NodeRef) -> KResult<Vec<DirEntry>> {
        let dir = dir.read();
        match &dir.specific {
            NodeSpec::Devfs(DevfsNode::Dir(children)) => Ok(children
                .iter()
                .map(|c| DirEntry {
                    inode: c.read().inode_number(),
                    name: c.read().name.clone(),
                })
                .collect()),
            _ => Err(Errno::Unknown),
        }
    }
}

/// Adds a device node under `parent` (a devfs directory node).
pub fn register_device(
    fs: &Arc<FileSystem>,
    parent: &NodeRef,
    name: &str,
    device: Device,
) -> KResult<NodeRef> {
    let node = Arc::new(RwLock::new(FsNode {
        name: name.to_string(),
        parent: Some(Arc::downgrade(parent)),
        fs: fs.clone(),
        length: 0,
        attributes: FileAttributes::empty(),
        hard_links: 1,
        creation_time: 0,
        last_access_time: 0,
        last_modification_time: 0,
        specific: NodeSpec::Devfs(DevfsNode::Device(device)),
    }));
    match &mut parent.write().specific {
        NodeSpec::Devfs(DevfsNode::Dir(children)) => {
            children.push(node.clone());
            Ok(node)
        }
        _ => Err(Errno::NoDevice),
    }
}

static ANON_FS: Once<Arc<FileSystem>> = Once::new();

/// Node backing an `openio` descriptor: a byte stream that lives outside
/// the visible tree.
pub fn anonymous_stream_node() -> NodeRef {
    let fs = ANON_FS.call_once(DevFs::new_filesystem).clone();
    Arc::new(RwLock::new(FsNode {
        name: "io".to_string(),
        parent: None,
        fs,
        length: 0,
        attributes: FileAttributes::empty(),
        hard_links: 1,
        creation_time: 0,
        last_access_time: 0,
        last_modification_time: 0,
        specific: NodeSpec::Devfs(DevfsNode::Device(Device::Stream(
            crate::iostream::IoStream::alloc(),
        ))),
    }))
}

/// The device type a node fronts, for the `finfo` query.
pub fn device_type(node: &NodeRef) -> Option<u32> {
    match &node.read().specific {
        NodeSpec::Devfs(DevfsNode::Device(d)) => Some(d.device_type()),
        _ => None,
    }
}

/// The TTY table index behind a node, when it fronts a TTY.
pub fn tty_index(node: &NodeRef) -> Option<usize> {
    match &node.read().specific {
        NodeSpec::Devfs(DevfsNode::Device(Device::Tty(idx))) => Some(*idx),
        _ => None,
    }
}

pub fn read_device(node: &NodeRef, buf: &mut [u8]) -> KResult<usize> {
    let device = {
        let node = node.read();
        match &node.specific {
            NodeSpec::Devfs(DevfsNode::Device(Device::Tty(idx))) => Ok(*idx),
            NodeSpec::Devfs(DevfsNode::Device(Device::Stream(s))) => {
                return Ok(s.lock().read(buf));
            }
            _ => Err(Errno::NoDevice),
        }
    }?;
    tty::tty_read(device, buf)
}

pub fn write_device(node: &NodeRef, buf: &[u8]) -> KResult<usize> {
    let device = {
        let node = node.read();
        match &node.specific {
            NodeSpec::Devfs(DevfsNode::Device(Device::Tty(idx))) => Ok(*idx),
            NodeSpec::Devfs(DevfsNode::Device(Device::Stream(s))) => {
                let mut s = s.lock();
                for c in buf {
                    s.putch(*c);
                }
                return Ok(buf.len());
            }
            _ => Err(Errno::NoDevice),
        }
    }?;
    tty::tty_write(device, buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iostream::IoStream;
    use crate::vfs::{self, OpenMode, Vfs};

    fn mounted() -> Vfs {
        let ext2 = crate::ext2::Ext2Fs::mount(crate::ext2::mkfs::ram_image(64, 16))
            .unwrap()
            .into_filesystem();
        let mut v = Vfs::new();
        v.mount("/", ext2).unwrap();

        let devfs = DevFs::new_filesystem();
        let root = match &devfs.specific {
            FsSpec::Devfs(d) => d.root(&devfs).unwrap(),
            _ => unreachable!(),
        };
        register_device(&devfs, &root, "null", Device::Stream(IoStream::alloc())).unwrap();
        v.mount("/dev", devfs).unwrap();
        v
    }

    #[test]
    fn mounts_shadow_the_host_directory() {
        let v = mounted();
        let node = v.resolve("/dev/null").unwrap();
        assert_eq!(device_type(&node), Some(DEVFS_TYPE_IOSTREAM));
    }

    #[test]
    fn stream_devices_queue_bytes() {
        let v = mounted();
        let fd = v.open_file("/dev/null", OpenMode::READ | OpenMode::WRITE).unwrap();
        assert_eq!(vfs::write_file(&fd, b"ping").unwrap(), 4);
        let mut buf = [0u8; 8];
        assert_eq!(vfs::read_file(&fd, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn devfs_rejects_file_creation() {
        let v = mounted();
        assert_eq!(
            v.create_file("/dev/f", FileAttributes::empty()).unwrap_err(),
            Errno::Permission
        );
    }
}
