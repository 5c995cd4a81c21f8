//! Block-device seam.
//!
//! Concrete disk drivers live outside the kernel core; the file systems only
//! ever see this trait. `read_flexible`/`write_flexible` translate the
//! byte-granular accesses the FS code wants into whole-sector transfers.

use crate::err::{Errno, KResult};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

pub trait BlockDevice: Send {
    fn sector_size(&self) -> usize;
    fn sector_count(&self) -> u64;
    fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> KResult<()>;
    fn write_sectors(&mut self, lba: u64, buf: &[u8]) -> KResult<()>;
}

pub type DeviceRef = Arc<Mutex<dyn BlockDevice>>;

/// Reads `buf.len()` bytes starting at byte `offset`.
pub fn read_flexible(dev: &DeviceRef, offset: u64, buf: &mut [u8]) -> KResult<()> {
    let mut dev = dev.lock();
    let ssize = dev.sector_size() as u64;
    let mut sector = vec![0u8; ssize as usize];
    let mut lba = offset / ssize;
    let mut skip = (offset % ssize) as usize;
    let mut done = 0;
    while done < buf.len() {
        dev.read_sectors(lba, &mut sector)?;
        let take = core::cmp::min(buf.len() - done, ssize as usize - skip);
        buf[done..done + take].copy_from_slice(&sector[skip..skip + take]);
        done += take;
        skip = 0;
        lba += 1;
    }
    Ok(())
}

/// Writes `buf` at byte `offset`, read-modify-writing partial sectors.
pub fn write_flexible(dev: &DeviceRef, offset: u64, buf: &[u8]) -> KResult<()> {
    let mut dev = dev.lock();
    let ssize = dev.sector_size() as u64;
    let mut sector = vec![0u8; ssize as usize];
    let mut lba = offset / ssize;
    let mut skip = (offset % ssize) as usize;
    let mut done = 0;
    while done < buf.len() {
        let take = core::cmp::min(buf.len() - done, ssize as usize - skip);
        if take != ssize as usize {
            dev.read_sectors(lba, &mut sector)?;
        }
        sector[skip..skip + take].copy_from_slice(&buf[done..done + take]);
        dev.write_sectors(lba, &sector)?;
        done += take;
        skip = 0;
        lba += 1;
    }
    Ok(())
}

/// RAM-backed block device, used for boot images and for exercising the file
/// systems without real hardware.
pub struct RamDisk {
    sector_size: usize,
    data: Vec<u8>,
}

impl RamDisk {
    pub fn new(sector_size: usize, sectors: usize) -> RamDisk {
        RamDisk {
            sector_size,
            data: vec![0; sector_size * sectors],
        }
    }

    pub fn from_bytes(sector_size: usize, data: Vec<u8>) -> RamDisk {
        assert_eq!(data.len() % sector_size, 0);
        RamDisk { sector_size, data }
    }
}

impl BlockDevice for RamDisk {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        (self.data.len() / self.sector_size) as u64
    }

    fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> KResult<()> {
        let start = lba as usize * self.sector_size;
        let end = start + buf.len();
        if buf.len() % self.sector_size != 0 || end > self.data.len() {
            return Err(Errno::Io);
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_sectors(&mut self, lba: u64, buf: &[u8]) -> KResult<()> {
        let start = lba as usize * self.sector_size;
        let end = start + buf.len();
        if buf.len() % self.sector_size != 0 || end > self.data.len() {
            return Err(Errno::Io);
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flexible_io_crosses_sector_boundaries() {
        let dev: DeviceRef = Arc::new(Mutex::new(RamDisk::new(512, 8)));
        let msg = b"straddles two sectors";
        write_flexible(&dev, 500, msg).unwrap();
        let mut back = [0u8; 21];
        read_flexible(&dev, 500, &mut back).unwrap();
        assert_eq!(&back, msg);

        // The bytes around the write are untouched.
        let mut before = [0u8; 4];
        read_flexible(&dev, 496, &mut before).unwrap();
        assert_eq!(before, [0; 4]);
    }

    #[test]
    fn out_of_range_access_reports_io() {
        let dev: DeviceRef = Arc::new(Mutex::new(RamDisk::new(512, 2)));
        let mut buf = [0u8; 512];
        assert_eq!(
            dev.lock().read_sectors(2, &mut buf).unwrap_err(),
            Errno::Io
        );
    }
}
