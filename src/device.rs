//! Block device interface
//!
//! The engine talks to storage exclusively in whole sectors. Everything a
//! volume needs from its medium is behind this trait: data transfer, a
//! cheap status query, geometry, and the control operations (cache flush
//! and trim) that map onto driver ioctls.

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    ReadError,
    WriteError,
    NotReady,
    WriteProtected,
}

impl From<DeviceError> for Error {
    fn from(e: DeviceError) -> Error {
        match e {
            DeviceError::ReadError | DeviceError::WriteError => Error::DiskErr,
            DeviceError::NotReady => Error::NotReady,
            DeviceError::WriteProtected => Error::WriteProtected,
        }
    }
}

/// Result of the cheap status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    pub ready: bool,
    pub write_protected: bool,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        DeviceStatus {
            ready: true,
            write_protected: false,
        }
    }
}

pub trait BlockDevice: Send + Sync {
    /// Read `cnt` sectors starting at `start_sector`.
    ///
    /// - `buf.len()` must be `cnt * sector_size()`
    fn read_blocks(
        &self,
        buf: &mut [u8],
        start_sector: u64,
        cnt: usize,
    ) -> core::result::Result<(), DeviceError>;

    /// Write `cnt` sectors starting at `start_sector`.
    ///
    /// - `buf.len()` must be `cnt * sector_size()`
    fn write_blocks(
        &self,
        buf: &[u8],
        start_sector: u64,
        cnt: usize,
    ) -> core::result::Result<(), DeviceError>;

    /// Total number of sectors on the medium.
    fn sector_count(&self) -> u64;

    /// Sector size in bytes; constant for the lifetime of the device.
    fn sector_size(&self) -> usize {
        512
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus::default()
    }

    /// Erase-block size in sectors, for data-area alignment when
    /// formatting. 1 means no alignment preference.
    fn erase_block_size(&self) -> usize {
        1
    }

    /// Flush any write-back cache below the engine.
    fn sync(&self) -> core::result::Result<(), DeviceError> {
        Ok(())
    }

    /// Hint that the sector range `first..=last` no longer holds live data.
    fn trim(&self, _first: u64, _last: u64) -> core::result::Result<(), DeviceError> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! RAM-backed device used throughout the crate's tests.

    use super::*;
    use alloc::sync::Arc;
    use alloc::vec;
    use alloc::vec::Vec;
    use spin::RwLock;

    pub struct RamDisk {
        data: RwLock<Vec<u8>>,
        sector_size: usize,
        write_protected: bool,
    }

    impl RamDisk {
        pub fn new(sectors: usize, sector_size: usize) -> Arc<Self> {
            Arc::new(RamDisk {
                data: RwLock::new(vec![0u8; sectors * sector_size]),
                sector_size,
                write_protected: false,
            })
        }

        /// Copy of a raw sector, for inspecting on-disk state in tests.
        pub fn sector(&self, idx: u64) -> Vec<u8> {
            let data = self.data.read();
            let off = idx as usize * self.sector_size;
            data[off..off + self.sector_size].to_vec()
        }

        pub fn patch(&self, idx: u64, offset: usize, bytes: &[u8]) {
            let mut data = self.data.write();
            let off = idx as usize * self.sector_size + offset;
            data[off..off + bytes.len()].copy_from_slice(bytes);
        }
    }

    impl BlockDevice for RamDisk {
        fn read_blocks(
            &self,
            buf: &mut [u8],
            start_sector: u64,
            cnt: usize,
        ) -> core::result::Result<(), DeviceError> {
            let data = self.data.read();
            let off = start_sector as usize * self.sector_size;
            let len = cnt * self.sector_size;
            if off + len > data.len() {
                return Err(DeviceError::ReadError);
            }
            buf[..len].copy_from_slice(&data[off..off + len]);
            Ok(())
        }

        fn write_blocks(
            &self,
            buf: &[u8],
            start_sector: u64,
            cnt: usize,
        ) -> core::result::Result<(), DeviceError> {
            if self.write_protected {
                return Err(DeviceError::WriteProtected);
            }
            let mut data = self.data.write();
            let off = start_sector as usize * self.sector_size;
            let len = cnt * self.sector_size;
            if off + len > data.len() {
                return Err(DeviceError::WriteError);
            }
            data[off..off + len].copy_from_slice(&buf[..len]);
            Ok(())
        }

        fn sector_count(&self) -> u64 {
            (self.data.read().len() / self.sector_size) as u64
        }

        fn sector_size(&self) -> usize {
            self.sector_size
        }

        fn status(&self) -> DeviceStatus {
            DeviceStatus {
                ready: true,
                write_protected: self.write_protected,
            }
        }
    }
}
