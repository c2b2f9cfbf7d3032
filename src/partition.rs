//! Partition search: MBR, EBR chains and GPT.
//!
//! Locating a volume follows one fixed order: if sector 0 is itself a FAT
//! VBR and no particular partition was requested, the medium is treated as
//! a "super floppy" with the volume at LBA 0. Otherwise sector 0 is read
//! as an MBR; a protective entry of type 0xEE routes the search through
//! the GPT, primary slots 1..4 are addressed directly, and higher
//! partition numbers walk the EBR chain inside the extended partition.

use alloc::sync::Arc;
use alloc::vec;

use crate::bpb::looks_like_vbr;
use crate::cache::SectorWindow;
use crate::device::BlockDevice;
use crate::{read_le_u16, read_le_u32, read_le_u64, write_le_u16, write_le_u32, Error, Result};

/// Offset of the partition table inside an MBR or EBR.
pub const MBR_TABLE: usize = 446;
/// Size of one partition table entry.
pub const PTE_SIZE: usize = 16;

const PTE_SYSTEM: usize = 4;
const PTE_START_LBA: usize = 8;
const PTE_SIZE_LBA: usize = 12;

/// Partition type of the GPT protective entry.
const MBR_TYPE_GPT_PROTECTIVE: u8 = 0xEE;
/// Partition types introducing an extended partition.
const MBR_TYPE_EXTENDED: u8 = 0x05;
const MBR_TYPE_EXTENDED_LBA: u8 = 0x0F;

/// Microsoft basic data partition type GUID, in on-disk byte order.
const GUID_BASIC_DATA: [u8; 16] = [
    0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44, 0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7,
];

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Probe {
    /// The sector is a FAT volume boot record.
    FatVbr,
    /// A valid boot sector, but not a FAT VBR (e.g. an MBR).
    ValidBoot,
    /// Not a boot sector at all.
    Invalid,
}

pub(crate) fn probe(win: &mut SectorWindow, sector: u64) -> Result<Probe> {
    win.with(sector, |buf| {
        if looks_like_vbr(buf) {
            Probe::FatVbr
        } else if read_le_u16(&buf[510..]) == 0xAA55 {
            Probe::ValidBoot
        } else {
            Probe::Invalid
        }
    })
}

#[derive(Debug, Clone, Copy, Default)]
struct MbrEntry {
    system: u8,
    start: u32,
    size: u32,
}

fn load_mbr_table(win: &mut SectorWindow, sector: u64) -> Result<[MbrEntry; 4]> {
    win.with(sector, |buf| {
        let mut table = [MbrEntry::default(); 4];
        for (i, e) in table.iter_mut().enumerate() {
            let pte = &buf[MBR_TABLE + i * PTE_SIZE..MBR_TABLE + (i + 1) * PTE_SIZE];
            e.system = pte[PTE_SYSTEM];
            e.start = read_le_u32(&pte[PTE_START_LBA..]);
            e.size = read_le_u32(&pte[PTE_SIZE_LBA..]);
        }
        table
    })
}

/// Locate the base LBA of the requested FAT volume.
///
/// `partition` 0 searches: a VBR at sector 0 first, then the first usable
/// MBR/GPT partition. 1..=4 select a primary slot, larger numbers select
/// logical partitions through the EBR chain. With GPT, `partition` counts
/// basic-data entries from 1.
pub(crate) fn find_fat_volume(win: &mut SectorWindow, partition: usize) -> Result<u64> {
    match probe(win, 0)? {
        Probe::FatVbr if partition == 0 => return Ok(0),
        Probe::Invalid => return Err(Error::NoFilesystem),
        _ => {}
    }

    let table = load_mbr_table(win, 0)?;
    let base = if table[0].system == MBR_TYPE_GPT_PROTECTIVE {
        gpt_find(win, partition)?
    } else if partition > 4 {
        ebr_find(win, &table, partition - 4)?
    } else if partition != 0 {
        let e = &table[partition - 1];
        if e.system == 0 {
            return Err(Error::NoFilesystem);
        }
        e.start as u64
    } else {
        let e = table
            .iter()
            .find(|e| e.system != 0)
            .ok_or(Error::NoFilesystem)?;
        e.start as u64
    };

    match probe(win, base)? {
        Probe::FatVbr => Ok(base),
        _ => Err(Error::NoFilesystem),
    }
}

/// Walk the EBR chain to the `nth` logical partition (1-based).
fn ebr_find(win: &mut SectorWindow, table: &[MbrEntry; 4], nth: usize) -> Result<u64> {
    let ext = table
        .iter()
        .find(|e| e.system == MBR_TYPE_EXTENDED || e.system == MBR_TYPE_EXTENDED_LBA)
        .ok_or(Error::NoFilesystem)?;
    let ext_base = ext.start as u64;
    let mut ebr = ext_base;
    let mut remaining = nth;
    loop {
        let slots = load_mbr_table(win, ebr)?;
        if remaining == 1 {
            if slots[0].system == 0 {
                return Err(Error::NoFilesystem);
            }
            // Logical partition start is relative to its own EBR.
            return Ok(ebr + slots[0].start as u64);
        }
        // Next EBR is relative to the extended partition base.
        if slots[1].system == 0 || slots[1].start == 0 {
            return Err(Error::NoFilesystem);
        }
        ebr = ext_base + slots[1].start as u64;
        remaining -= 1;
    }
}

/// Find the `nth` (1-based, 0 = first) basic-data partition in the GPT.
fn gpt_find(win: &mut SectorWindow, partition: usize) -> Result<u64> {
    let ss = win.sector_size();
    let header = win.with(1, |buf| {
        let mut h = [0u8; 92];
        h.copy_from_slice(&buf[..92]);
        h
    })?;
    if &header[0..8] != GPT_SIGNATURE {
        return Err(Error::NoFilesystem);
    }
    let header_size = read_le_u32(&header[12..]) as usize;
    if header_size < 92 || header_size > ss {
        return Err(Error::NoFilesystem);
    }
    let stored_bcc = read_le_u32(&header[16..]);
    let mut check = vec![0u8; header_size];
    win.with(1, |buf| check.copy_from_slice(&buf[..header_size]))?;
    check[16..20].fill(0);
    if crc::crc32::checksum_ieee(&check) != stored_bcc {
        return Err(Error::NoFilesystem);
    }

    let pt_ofs = read_le_u64(&header[72..]);
    let pt_num = read_le_u32(&header[80..]) as usize;
    let pte_size = read_le_u32(&header[84..]) as usize;
    if pte_size < 128 || pte_size % 128 != 0 {
        return Err(Error::NoFilesystem);
    }

    let wanted = if partition == 0 { 1 } else { partition };
    let mut seen = 0usize;
    for i in 0..pt_num {
        let byte_ofs = i * pte_size;
        let sector = pt_ofs + (byte_ofs / ss) as u64;
        let ofs = byte_ofs % ss;
        let (type_guid, first_lba) = win.with(sector, |buf| {
            let mut g = [0u8; 16];
            g.copy_from_slice(&buf[ofs..ofs + 16]);
            (g, read_le_u64(&buf[ofs + 32..]))
        })?;
        if type_guid == GUID_BASIC_DATA {
            seen += 1;
            if seen == wanted {
                return Ok(first_lba);
            }
        }
    }
    Err(Error::NoFilesystem)
}

/// Write an MBR with a single partition entry covering
/// `part_start..part_start + part_size`, including the legacy CHS fields.
pub(crate) fn write_mbr(
    device: &Arc<dyn BlockDevice>,
    part_start: u32,
    part_size: u32,
    system: u8,
) -> Result<()> {
    let ss = device.sector_size();
    let mut buf = vec![0u8; ss];

    // CHS geometry is synthesized the way legacy tools do: 63 sectors per
    // track, the smallest head count that keeps the cylinder number sane.
    let n_sc = 63u32;
    let total = device.sector_count() as u32;
    let mut n_hd = 8u32;
    while n_hd != 0 && total / n_hd / n_sc > 1024 {
        n_hd = n_hd.wrapping_mul(2) & 0xFF;
    }
    if n_hd == 0 {
        n_hd = 255;
    }

    let chs = |lba: u32, pte: &mut [u8]| {
        let cy = lba / n_sc / n_hd;
        let hd = (lba / n_sc % n_hd) as u8;
        let sc = (lba % n_sc + 1) as u8;
        pte[0] = hd;
        pte[1] = ((cy >> 2) as u8 & 0xC0) | sc;
        pte[2] = cy as u8;
    };

    {
        let pte = &mut buf[MBR_TABLE..MBR_TABLE + PTE_SIZE];
        pte[PTE_SYSTEM] = system;
        write_le_u32(&mut pte[PTE_START_LBA..], part_start);
        write_le_u32(&mut pte[PTE_SIZE_LBA..], part_size);
    }
    chs(part_start, &mut buf[MBR_TABLE + 1..MBR_TABLE + 4]);
    chs(
        part_start + part_size - 1,
        &mut buf[MBR_TABLE + 5..MBR_TABLE + 8],
    );
    write_le_u16(&mut buf[510..], 0xAA55);
    device
        .write_blocks(&buf, 0, 1)
        .map_err(|_| Error::DiskErr)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::RamDisk;

    fn vbr_stub() -> [u8; 512] {
        let mut s = [0u8; 512];
        s[0] = 0xEB;
        write_le_u16(&mut s[0x0B..], 512);
        s[0x0D] = 4;
        s[0x10] = 2;
        write_le_u16(&mut s[0x11..], 512);
        write_le_u16(&mut s[0x16..], 32);
        write_le_u16(&mut s[510..], 0xAA55);
        s
    }

    #[test]
    fn super_floppy_is_found_at_sector_zero() {
        let disk = RamDisk::new(64, 512);
        disk.patch(0, 0, &vbr_stub());
        let mut win = SectorWindow::new(disk, 512);
        assert_eq!(find_fat_volume(&mut win, 0).unwrap(), 0);
    }

    #[test]
    fn mbr_primary_partition_is_followed() {
        let disk = RamDisk::new(256, 512);
        let dev: alloc::sync::Arc<dyn BlockDevice> = disk.clone();
        write_mbr(&dev, 63, 128, 0x06).unwrap();
        disk.patch(63, 0, &vbr_stub());
        let mut win = SectorWindow::new(disk, 512);
        assert_eq!(find_fat_volume(&mut win, 0).unwrap(), 63);
        assert_eq!(find_fat_volume(&mut win, 1).unwrap(), 63);
        assert_eq!(find_fat_volume(&mut win, 2), Err(Error::NoFilesystem));
    }

    #[test]
    fn missing_volume_reports_no_filesystem() {
        let disk = RamDisk::new(64, 512);
        let mut win = SectorWindow::new(disk, 512);
        assert_eq!(find_fat_volume(&mut win, 0), Err(Error::NoFilesystem));
    }

    #[test]
    fn gpt_basic_data_partition_is_located() {
        use crate::write_le_u32 as w32;
        let disk = RamDisk::new(256, 512);

        // Protective MBR.
        let mut mbr = [0u8; 512];
        mbr[MBR_TABLE + PTE_SYSTEM] = 0xEE;
        w32(&mut mbr[MBR_TABLE + PTE_START_LBA..], 1);
        write_le_u16(&mut mbr[510..], 0xAA55);
        disk.patch(0, 0, &mbr);

        // One basic-data entry at LBA 96.
        let mut entries = [0u8; 512];
        entries[0..16].copy_from_slice(&GUID_BASIC_DATA);
        entries[32..40].copy_from_slice(&96u64.to_le_bytes());
        disk.patch(2, 0, &entries);

        // Header at LBA 1 pointing at the entry array.
        let mut header = [0u8; 512];
        header[0..8].copy_from_slice(GPT_SIGNATURE);
        w32(&mut header[12..], 92);
        header[72..80].copy_from_slice(&2u64.to_le_bytes());
        w32(&mut header[80..], 4);
        w32(&mut header[84..], 128);
        let bcc = crc::crc32::checksum_ieee(&header[..92]);
        w32(&mut header[16..], bcc);
        disk.patch(1, 0, &header);

        disk.patch(96, 0, &vbr_stub());

        let mut win = SectorWindow::new(disk, 512);
        assert_eq!(find_fat_volume(&mut win, 0).unwrap(), 96);
        assert_eq!(find_fat_volume(&mut win, 1).unwrap(), 96);
        assert_eq!(find_fat_volume(&mut win, 2), Err(Error::NoFilesystem));
    }
}
