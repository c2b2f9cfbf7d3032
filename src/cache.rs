//! Per-volume sector window.
//!
//! Every metadata sector a volume touches is brought into one owned sector
//! buffer, poked in place and marked dirty; displacing the window flushes
//! it first. A dirty sector that lies inside the primary FAT is mirrored
//! to the second FAT copy on flush, which is what keeps the two copies in
//! lockstep without any extra bookkeeping above this layer.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::device::BlockDevice;
use crate::{read_le_u16, read_le_u32, write_le_u16, write_le_u32, Error, Result};

/// Resident-LBA value meaning "nothing loaded".
pub(crate) const INVALID_SECTOR: u64 = u64::MAX;

pub struct SectorWindow {
    device: Arc<dyn BlockDevice>,
    buf: Vec<u8>,
    /// LBA of the resident sector, `INVALID_SECTOR` when empty.
    sector: u64,
    dirty: bool,
    // Primary-FAT extent for the mirror-on-flush policy; zero sized until
    // the volume geometry is known.
    fat_base: u64,
    fat_size: u32,
    n_fats: u8,
}

impl SectorWindow {
    pub fn new(device: Arc<dyn BlockDevice>, sector_size: usize) -> Self {
        Self {
            device,
            buf: vec![0u8; sector_size],
            sector: INVALID_SECTOR,
            dirty: false,
            fat_base: 0,
            fat_size: 0,
            n_fats: 1,
        }
    }

    pub fn sector_size(&self) -> usize {
        self.buf.len()
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Install the FAT area bounds once the BPB has been parsed.
    pub(crate) fn set_fat_region(&mut self, fat_base: u64, fat_size: u32, n_fats: u8) {
        self.fat_base = fat_base;
        self.fat_size = fat_size;
        self.n_fats = n_fats;
    }

    /// Forget the resident sector without writing it back.
    pub(crate) fn invalidate(&mut self) {
        self.sector = INVALID_SECTOR;
        self.dirty = false;
    }

    /// LBA of the resident sector (`INVALID_SECTOR` when empty).
    pub(crate) fn resident(&self) -> u64 {
        self.sector
    }

    /// Write the resident sector back if it has pending modifications.
    ///
    /// A sector inside the primary FAT is also written to the second copy.
    /// The mirror write is best-effort: its failure is logged but does not
    /// fail the flush, matching the behavior mounting tools expect from a
    /// degraded second FAT.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.device
            .write_blocks(&self.buf, self.sector, 1)
            .map_err(|_| Error::DiskErr)?;
        self.dirty = false;
        if self.n_fats == 2
            && self.sector >= self.fat_base
            && self.sector - self.fat_base < self.fat_size as u64
        {
            let mirror = self.sector + self.fat_size as u64;
            if self.device.write_blocks(&self.buf, mirror, 1).is_err() {
                log::warn!("FAT mirror write failed at sector {}", mirror);
            }
        }
        Ok(())
    }

    /// Bring `sector` into the window, flushing the previous occupant.
    pub fn move_to(&mut self, sector: u64) -> Result<()> {
        if sector == self.sector {
            return Ok(());
        }
        self.flush()?;
        if self.device.read_blocks(&mut self.buf, sector, 1).is_err() {
            self.sector = INVALID_SECTOR;
            return Err(Error::DiskErr);
        }
        self.sector = sector;
        Ok(())
    }

    /// Read through the window.
    ///
    /// The closure sees the whole resident sector; no reference escapes, so
    /// a later window move cannot invalidate anything the caller holds.
    pub fn with<R>(&mut self, sector: u64, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.move_to(sector)?;
        Ok(f(&self.buf))
    }

    /// Modify through the window; the sector is marked dirty.
    pub fn update<R>(&mut self, sector: u64, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.move_to(sector)?;
        self.dirty = true;
        Ok(f(&mut self.buf))
    }

    // Raw accessors against the resident sector, used by the FAT accessor
    // where one logical entry may straddle two sectors.

    pub(crate) fn byte(&self, off: usize) -> u8 {
        self.buf[off]
    }

    pub(crate) fn set_byte(&mut self, off: usize, v: u8) {
        self.buf[off] = v;
        self.dirty = true;
    }

    pub(crate) fn u16_at(&self, off: usize) -> u16 {
        read_le_u16(&self.buf[off..])
    }

    pub(crate) fn set_u16(&mut self, off: usize, v: u16) {
        write_le_u16(&mut self.buf[off..], v);
        self.dirty = true;
    }

    pub(crate) fn u32_at(&self, off: usize) -> u32 {
        read_le_u32(&self.buf[off..])
    }

    pub(crate) fn set_u32(&mut self, off: usize, v: u32) {
        write_le_u32(&mut self.buf[off..], v);
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::RamDisk;

    #[test]
    fn window_moves_lazily() {
        let disk = RamDisk::new(16, 512);
        disk.patch(3, 0, &[0xAB, 0xCD]);
        let mut win = SectorWindow::new(disk.clone(), 512);

        let v = win.with(3, |b| b[0]).unwrap();
        assert_eq!(v, 0xAB);
        // Same sector again must not reload (mutate the disk behind the
        // window's back and observe the stale copy).
        disk.patch(3, 0, &[0x11]);
        assert_eq!(win.with(3, |b| b[0]).unwrap(), 0xAB);
        assert_eq!(win.with(4, |b| b[0]).unwrap(), 0);
    }

    #[test]
    fn dirty_sector_flushes_on_displacement() {
        let disk = RamDisk::new(16, 512);
        let mut win = SectorWindow::new(disk.clone(), 512);

        win.update(5, |b| b[10] = 0x5A).unwrap();
        assert_eq!(disk.sector(5)[10], 0, "write-back must be deferred");
        win.move_to(6).unwrap();
        assert_eq!(disk.sector(5)[10], 0x5A);
    }

    #[test]
    fn fat_sectors_mirror_to_second_copy() {
        let disk = RamDisk::new(64, 512);
        let mut win = SectorWindow::new(disk.clone(), 512);
        win.set_fat_region(8, 4, 2);

        // Inside the primary FAT: mirrored fat_size sectors later.
        win.update(9, |b| b[0] = 0xF7).unwrap();
        win.flush().unwrap();
        assert_eq!(disk.sector(9)[0], 0xF7);
        assert_eq!(disk.sector(13)[0], 0xF7);

        // Outside the FAT area: untouched mirror.
        win.update(20, |b| b[0] = 0x42).unwrap();
        win.flush().unwrap();
        assert_eq!(disk.sector(24)[0], 0);
    }
}
