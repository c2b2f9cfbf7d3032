//! BIOS Parameter Block (BPB), boot sector and FSInfo.
//!
//! The first sector of a FAT volume is the VBR ("volume boot record"); the
//! BPB inside it describes the whole geometry of the volume: sector and
//! cluster sizes, the number and size of the FAT copies, the size of the
//! static root directory (FAT12/16 only) and the total sector count. Every
//! derived location — FAT base, data base, root base — comes from these
//! fields and nothing else.
//!
//! FAT type determination
//!
//! The FAT sub-type is decided by exactly one rule: the count of data
//! clusters. A volume with fewer than 4085 clusters is FAT12, one with
//! fewer than 65525 clusters is FAT16, anything larger is FAT32. The
//! "FAT32   " string in the boot sector is informational only and is never
//! used for the decision; writing format code that violates the cluster
//! rule produces volumes other implementations will misread.
//!
//! A FAT32 FAT entry is a 28-bit value. The high 4 bits are reserved, are
//! zeroed when the volume is formatted, and must be preserved by any later
//! entry update.
//!
//! On FAT32 volumes an FSInfo sector (usually sector 1 of the volume)
//! caches the free-cluster count and the most recently allocated cluster.
//! Both fields are hints: 0xFFFFFFFF means "unknown", and even a present
//! value may be stale, so it is range-checked at mount and the authoritative
//! number is recomputed lazily from the FAT itself when needed.

use crate::{
    read_le_u16, read_le_u32, write_le_u16, write_le_u32, Error, Result, LEAD_SIGNATURE,
    MAX_CLUSTER_FAT12, MAX_CLUSTER_FAT16, MAX_SECTOR_SIZE, MIN_SECTOR_SIZE, STRUCT_SIGNATURE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

/// Parsed form of the BPB plus the extended fields of both boot-sector
/// layouts. Offsets are those of the on-disk structure; the FAT32 variant
/// moves the tail fields (drive number, label, fs-type string) from 0x24
/// up to 0x40.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiosParameterBlock {
    /// Bytes per sector: 512, 1024, 2048 or 4096.
    pub bytes_per_sector: u16,
    /// Sectors per allocation unit; a power of two, 1..=128.
    pub sectors_per_cluster: u8,
    /// Sectors before the first FAT, including the VBR itself. Never 0.
    pub reserved_sectors: u16,
    /// Number of FAT copies, 1 or 2.
    pub num_fats: u8,
    /// Root directory entry count; 0 on FAT32.
    pub root_entries: u16,
    /// Total sector count if it fits 16 bits, else 0 and `total_sectors_32`.
    pub total_sectors_16: u16,
    /// Media descriptor; mirrored into the low byte of FAT\[0\].
    pub media: u8,
    /// Sectors per FAT for FAT12/16; 0 on FAT32.
    pub fat_size_16: u16,
    pub sectors_per_track: u16,
    pub num_heads: u16,
    /// Sectors preceding this volume on the medium.
    pub hidden_sectors: u32,
    pub total_sectors_32: u32,

    // FAT32 extension, valid only when `fat_size_16` is 0.
    pub fat_size_32: u32,
    pub ext_flags: u16,
    /// Filesystem version; must be 0.0.
    pub fs_version: u16,
    /// First cluster of the root directory, normally 2.
    pub root_cluster: u32,
    /// Sector number of the FSInfo sector within the reserved area.
    pub fsinfo_sector: u16,
    /// Sector number of the boot-sector backup, normally 6.
    pub backup_boot_sector: u16,

    pub drive_number: u8,
    /// 0x29 when the id/label/type fields below are present.
    pub boot_signature: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub fs_type_label: [u8; 8],
}

impl BiosParameterBlock {
    pub fn parse(sector: &[u8]) -> Self {
        let fat32 = read_le_u16(&sector[0x16..]) == 0;
        let (ext, tail) = if fat32 { (true, 0x40) } else { (false, 0x24) };
        Self {
            bytes_per_sector: read_le_u16(&sector[0x0B..]),
            sectors_per_cluster: sector[0x0D],
            reserved_sectors: read_le_u16(&sector[0x0E..]),
            num_fats: sector[0x10],
            root_entries: read_le_u16(&sector[0x11..]),
            total_sectors_16: read_le_u16(&sector[0x13..]),
            media: sector[0x15],
            fat_size_16: read_le_u16(&sector[0x16..]),
            sectors_per_track: read_le_u16(&sector[0x18..]),
            num_heads: read_le_u16(&sector[0x1A..]),
            hidden_sectors: read_le_u32(&sector[0x1C..]),
            total_sectors_32: read_le_u32(&sector[0x20..]),
            fat_size_32: if ext { read_le_u32(&sector[0x24..]) } else { 0 },
            ext_flags: if ext { read_le_u16(&sector[0x28..]) } else { 0 },
            fs_version: if ext { read_le_u16(&sector[0x2A..]) } else { 0 },
            root_cluster: if ext { read_le_u32(&sector[0x2C..]) } else { 0 },
            fsinfo_sector: if ext { read_le_u16(&sector[0x30..]) } else { 0 },
            backup_boot_sector: if ext { read_le_u16(&sector[0x32..]) } else { 0 },
            drive_number: sector[tail],
            boot_signature: sector[tail + 2],
            volume_id: read_le_u32(&sector[tail + 3..]),
            volume_label: sector[tail + 7..tail + 18].try_into().unwrap(),
            fs_type_label: sector[tail + 18..tail + 26].try_into().unwrap(),
        }
    }

    /// Serialize into a zeroed boot sector, including the jump stub, OEM
    /// name and the 0xAA55 signature. Used by the formatter.
    pub fn encode(&self, sector: &mut [u8]) {
        sector[..3].copy_from_slice(&[0xEB, 0xFE, 0x90]);
        sector[3..11].copy_from_slice(b"MSDOS5.0");
        write_le_u16(&mut sector[0x0B..], self.bytes_per_sector);
        sector[0x0D] = self.sectors_per_cluster;
        write_le_u16(&mut sector[0x0E..], self.reserved_sectors);
        sector[0x10] = self.num_fats;
        write_le_u16(&mut sector[0x11..], self.root_entries);
        write_le_u16(&mut sector[0x13..], self.total_sectors_16);
        sector[0x15] = self.media;
        write_le_u16(&mut sector[0x16..], self.fat_size_16);
        write_le_u16(&mut sector[0x18..], self.sectors_per_track);
        write_le_u16(&mut sector[0x1A..], self.num_heads);
        write_le_u32(&mut sector[0x1C..], self.hidden_sectors);
        write_le_u32(&mut sector[0x20..], self.total_sectors_32);
        let tail = if self.fat_size_16 == 0 {
            write_le_u32(&mut sector[0x24..], self.fat_size_32);
            write_le_u16(&mut sector[0x28..], self.ext_flags);
            write_le_u16(&mut sector[0x2A..], self.fs_version);
            write_le_u32(&mut sector[0x2C..], self.root_cluster);
            write_le_u16(&mut sector[0x30..], self.fsinfo_sector);
            write_le_u16(&mut sector[0x32..], self.backup_boot_sector);
            0x40
        } else {
            0x24
        };
        sector[tail] = self.drive_number;
        sector[tail + 2] = self.boot_signature;
        write_le_u32(&mut sector[tail + 3..], self.volume_id);
        sector[tail + 7..tail + 18].copy_from_slice(&self.volume_label);
        sector[tail + 18..tail + 26].copy_from_slice(&self.fs_type_label);
        write_le_u16(&mut sector[510..], 0xAA55);
    }

    /// Sectors per FAT, whichever field carries it.
    pub fn fat_size(&self) -> u32 {
        if self.fat_size_16 != 0 {
            self.fat_size_16 as u32
        } else {
            self.fat_size_32
        }
    }

    /// Total sector count, whichever field carries it.
    pub fn total_sectors(&self) -> u32 {
        if self.total_sectors_16 != 0 {
            self.total_sectors_16 as u32
        } else {
            self.total_sectors_32
        }
    }

    /// Sectors occupied by the static root directory; always 0 on FAT32.
    /// Rounds up.
    pub fn root_dir_sectors(&self) -> u32 {
        let ss = self.bytes_per_sector as u32;
        (self.root_entries as u32 * 32 + ss - 1) / ss
    }

    /// Reserved area + FAT copies + static root, i.e. everything before the
    /// first data cluster, relative to the volume start.
    pub fn system_sectors(&self) -> u32 {
        self.reserved_sectors as u32 + self.num_fats as u32 * self.fat_size() + self.root_dir_sectors()
    }

    /// The count of data clusters, rounding down. Cluster numbering starts
    /// at 2, so the highest valid cluster number is this count + 1.
    pub fn cluster_count(&self) -> u32 {
        (self.total_sectors() - self.system_sectors()) / self.sectors_per_cluster as u32
    }

    pub fn fat_type(&self) -> FatType {
        let n = self.cluster_count();
        if n < MAX_CLUSTER_FAT12 {
            FatType::Fat12
        } else if n < MAX_CLUSTER_FAT16 {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    /// Structural validation of a candidate VBR against the mounted sector
    /// size. Returns `NoFilesystem` on any violated constraint.
    pub fn validate(&self, sector_size: usize) -> Result<()> {
        if self.bytes_per_sector as usize != sector_size {
            return Err(Error::NoFilesystem);
        }
        if self.sectors_per_cluster == 0 || !self.sectors_per_cluster.is_power_of_two() {
            return Err(Error::NoFilesystem);
        }
        if self.num_fats != 1 && self.num_fats != 2 {
            return Err(Error::NoFilesystem);
        }
        if self.reserved_sectors == 0 {
            return Err(Error::NoFilesystem);
        }
        if self.fat_size() == 0 {
            return Err(Error::NoFilesystem);
        }
        if self.root_entries as usize % (sector_size / 32) != 0 {
            return Err(Error::NoFilesystem);
        }
        let total = self.total_sectors();
        if total < self.system_sectors() {
            return Err(Error::NoFilesystem);
        }
        if self.cluster_count() == 0 {
            return Err(Error::NoFilesystem);
        }
        match self.fat_type() {
            FatType::Fat32 => {
                if self.fs_version != 0 || self.root_entries != 0 {
                    return Err(Error::NoFilesystem);
                }
            }
            _ => {
                if self.root_entries == 0 {
                    return Err(Error::NoFilesystem);
                }
            }
        }
        // The FAT must be large enough for every entry in the cluster range.
        let n_fatent = self.cluster_count() + 2;
        let needed_bytes = match self.fat_type() {
            FatType::Fat32 => n_fatent * 4,
            FatType::Fat16 => n_fatent * 2,
            FatType::Fat12 => n_fatent * 3 / 2 + (n_fatent & 1),
        };
        let ss = sector_size as u32;
        if self.fat_size() < (needed_bytes + ss - 1) / ss {
            return Err(Error::NoFilesystem);
        }
        Ok(())
    }
}

/// Check whether a sector could be a FAT VBR.
///
/// Early MS-DOS volumes lack the boot signature and the fs-type string, so
/// a plausible jump opcode plus a self-consistent BPB is accepted as well.
pub fn looks_like_vbr(sector: &[u8]) -> bool {
    let jmp = sector[0];
    if jmp != 0xEB && jmp != 0xE9 && jmp != 0xE8 {
        return false;
    }
    let sign_ok = read_le_u16(&sector[510..]) == 0xAA55;
    if sign_ok && &sector[0x52..0x5A] == b"FAT32   " {
        return true;
    }
    let ss = read_le_u16(&sector[0x0B..]);
    if !(ss as usize >= MIN_SECTOR_SIZE && ss as usize <= MAX_SECTOR_SIZE && ss.is_power_of_two()) {
        return false;
    }
    let spc = sector[0x0D];
    spc != 0
        && spc.is_power_of_two()
        && (sector[0x10] == 1 || sector[0x10] == 2)
        && read_le_u16(&sector[0x11..]) != 0
        && read_le_u16(&sector[0x16..]) != 0
}

/// The two live fields of the FAT32 FSInfo sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsInfo {
    /// Last known free cluster count; 0xFFFFFFFF if unknown.
    pub free_count: u32,
    /// Cluster number allocation should resume from; 0xFFFFFFFF if none.
    pub next_free: u32,
}

impl FsInfo {
    /// Returns `None` when any of the three signatures is missing.
    pub fn parse(sector: &[u8]) -> Option<Self> {
        if read_le_u32(&sector[0..]) != LEAD_SIGNATURE
            || read_le_u32(&sector[484..]) != STRUCT_SIGNATURE
            || read_le_u16(&sector[510..]) != 0xAA55
        {
            return None;
        }
        Some(Self {
            free_count: read_le_u32(&sector[488..]),
            next_free: read_le_u32(&sector[492..]),
        })
    }

    /// Build a complete FSInfo sector in `sector` (expected zeroed).
    pub fn encode(&self, sector: &mut [u8]) {
        write_le_u32(&mut sector[0..], LEAD_SIGNATURE);
        write_le_u32(&mut sector[484..], STRUCT_SIGNATURE);
        write_le_u32(&mut sector[488..], self.free_count);
        write_le_u32(&mut sector[492..], self.next_free);
        write_le_u16(&mut sector[510..], 0xAA55);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fat32() -> BiosParameterBlock {
        BiosParameterBlock {
            bytes_per_sector: 512,
            sectors_per_cluster: 8,
            reserved_sectors: 32,
            num_fats: 2,
            root_entries: 0,
            total_sectors_16: 0,
            media: 0xF8,
            fat_size_16: 0,
            sectors_per_track: 63,
            num_heads: 255,
            hidden_sectors: 0,
            total_sectors_32: 1_048_576, // 512 MiB
            fat_size_32: 1024,
            ext_flags: 0,
            fs_version: 0,
            root_cluster: 2,
            fsinfo_sector: 1,
            backup_boot_sector: 6,
            drive_number: 0x80,
            boot_signature: 0x29,
            volume_id: 0x1234_5678,
            volume_label: *b"NO NAME    ",
            fs_type_label: *b"FAT32   ",
        }
    }

    #[test]
    fn encode_parse_round_trip() {
        let bpb = sample_fat32();
        let mut sector = [0u8; 512];
        bpb.encode(&mut sector);
        assert!(looks_like_vbr(&sector));
        let parsed = BiosParameterBlock::parse(&sector);
        assert_eq!(parsed, bpb);
    }

    #[test]
    fn type_derivation_follows_cluster_count() {
        let mut bpb = sample_fat32();
        assert_eq!(bpb.fat_type(), FatType::Fat32);
        bpb.validate(512).unwrap();

        // Shrink below the FAT16 boundary.
        bpb.fat_size_16 = 64;
        bpb.fat_size_32 = 0;
        bpb.root_entries = 512;
        bpb.total_sectors_16 = 0;
        bpb.total_sectors_32 = 65536; // 32 MiB, 8191 clusters at 8 spc
        assert_eq!(bpb.fat_type(), FatType::Fat16);

        bpb.sectors_per_cluster = 4;
        bpb.total_sectors_32 = 8192; // 4 MiB -> about 2k clusters
        assert_eq!(bpb.fat_type(), FatType::Fat12);
    }

    #[test]
    fn validation_rejects_broken_geometry() {
        let mut bpb = sample_fat32();
        bpb.sectors_per_cluster = 3;
        assert_eq!(bpb.validate(512), Err(Error::NoFilesystem));

        let mut bpb = sample_fat32();
        bpb.reserved_sectors = 0;
        assert_eq!(bpb.validate(512), Err(Error::NoFilesystem));

        let mut bpb = sample_fat32();
        bpb.num_fats = 3;
        assert_eq!(bpb.validate(512), Err(Error::NoFilesystem));

        // FAT too small for the cluster range.
        let mut bpb = sample_fat32();
        bpb.fat_size_32 = 10;
        assert_eq!(bpb.validate(512), Err(Error::NoFilesystem));
    }

    #[test]
    fn fsinfo_needs_all_signatures() {
        let mut sector = [0u8; 512];
        FsInfo {
            free_count: 1000,
            next_free: 7,
        }
        .encode(&mut sector);
        let fsi = FsInfo::parse(&sector).unwrap();
        assert_eq!(fsi.free_count, 1000);
        assert_eq!(fsi.next_free, 7);

        sector[484] = 0;
        assert!(FsInfo::parse(&sector).is_none());
    }
}
