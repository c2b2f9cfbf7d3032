//! Directory table handling.
//!
//! On-disk layout of an object with a long name (low offsets first):
//!
//!     lfn fragment n (ordinal n | 0x40)
//!     lfn fragment n-1
//!     ...
//!     lfn fragment 1
//!     short entry
//!
//! A forward scan therefore meets the highest ordinal first and counts
//! down to 1 immediately before the short entry; the running checksum
//! couples the fragments to exactly that short entry. Any break in the
//! sequence orphans the fragments and the short name alone is used.
//!
//! The root directory of a FAT12/16 volume is a fixed sector range with a
//! fixed entry count; everywhere else a directory is an ordinary cluster
//! chain that is stretched (and the new cluster zeroed) when a scan with
//! `stretch` enabled runs off the end.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::RwLock;

use crate::entry::{DateTime, LongDirEntry, ShortDirEntry};
use crate::fat::FatEntry;
use crate::fs::FatVolume;
use crate::name::{
    self, SegName, NS_BODY, NS_DOT, NS_EXT, NS_LFN, NS_LOSS, NS_NOLFN,
};
use crate::{
    Error, Result, ATTR_ARCHIVE, ATTR_LONG_NAME, ATTR_MASK, ATTR_VOLUME_ID, DIRENT_SIZE,
    DIR_ENTRY_DELETED, DIR_ENTRY_FREE, LAST_LONG_ENTRY, MAX_DIR_BYTES,
};

/// Offset value meaning "no LFN block precedes the current entry".
pub(crate) const NO_LFN_BLOCK: u32 = u32::MAX;

/// Position state of a directory scan.
#[derive(Debug, Clone, Copy)]
pub struct DirCursor {
    /// Start cluster of the directory; 0 means the root directory.
    pub(crate) sclust: u32,
    /// Cluster the cursor currently sits in (0 inside the static root).
    pub(crate) clust: u32,
    /// Sector holding the current entry; 0 once the scan is exhausted.
    pub(crate) sect: u64,
    /// Byte offset of the current entry from the directory start.
    pub(crate) dptr: u32,
    /// Offset of the first LFN fragment of the current object.
    pub(crate) blk_ofs: u32,
}

impl DirCursor {
    pub(crate) fn new(sclust: u32) -> Self {
        Self {
            sclust,
            clust: 0,
            sect: 0,
            dptr: 0,
            blk_ofs: NO_LFN_BLOCK,
        }
    }
}

/// Decoded directory entry as surfaced by `readdir` and `stat`.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    /// Long name when present, otherwise the short name with its case
    /// hints applied.
    pub name: String,
    /// The 8.3 name, always uppercase.
    pub alt_name: String,
    pub attr: u8,
    pub size: u32,
    pub modified: DateTime,
    pub created: DateTime,
    pub start_cluster: u32,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.attr & crate::ATTR_DIRECTORY != 0
    }
}

impl FatVolume {
    /// Set the cursor to byte offset `ofs`, following the cluster chain
    /// as needed. Offsets must be entry aligned and below the runaway cap.
    pub(crate) fn dir_seek(&mut self, dp: &mut DirCursor, ofs: u32) -> Result<()> {
        if ofs >= MAX_DIR_BYTES || ofs % DIRENT_SIZE as u32 != 0 {
            return Err(Error::IntErr);
        }
        dp.dptr = ofs;
        let mut clst = dp.sclust;
        if clst == 0 && self.fat_type == crate::FatType::Fat32 {
            clst = self.dir_base as u32;
        }

        let in_sector_ofs;
        if clst == 0 {
            // Static root directory with a fixed entry count.
            if ofs as usize / DIRENT_SIZE >= self.n_rootdir as usize {
                return Err(Error::IntErr);
            }
            dp.sect = self.dir_base;
            in_sector_ofs = ofs;
        } else {
            let csz = self.cluster_bytes();
            let mut rem = ofs;
            while rem >= csz {
                clst = self.next_cluster(clst)?.ok_or(Error::IntErr)?;
                rem -= csz;
            }
            dp.sect = self.cluster_to_sector(clst).ok_or(Error::IntErr)?;
            in_sector_ofs = rem;
        }
        dp.clust = clst;
        dp.sect += (in_sector_ofs as usize / self.sector_size) as u64;
        Ok(())
    }

    /// Advance the cursor by one entry.
    ///
    /// At the end of the table: with `stretch` a fresh zeroed cluster is
    /// linked in, otherwise `NoFile` reports end-of-directory and the
    /// cursor is disabled.
    pub(crate) fn dir_next(&mut self, dp: &mut DirCursor, stretch: bool) -> Result<()> {
        let ofs = dp.dptr + DIRENT_SIZE as u32;
        if ofs >= MAX_DIR_BYTES {
            dp.sect = 0;
        }
        if dp.sect == 0 {
            return Err(Error::NoFile);
        }

        if ofs as usize % self.sector_size == 0 {
            dp.sect += 1;
            if dp.clust == 0 {
                // Static root table.
                if ofs as usize / DIRENT_SIZE >= self.n_rootdir as usize {
                    dp.sect = 0;
                    return Err(Error::NoFile);
                }
            } else if (ofs as usize / self.sector_size) % self.csize as usize == 0 {
                match self.get_fat(dp.clust)? {
                    FatEntry::Next(n) => {
                        dp.clust = n;
                        dp.sect = self.cluster_to_sector(n).ok_or(Error::IntErr)?;
                    }
                    FatEntry::EndOfChain => {
                        if !stretch {
                            dp.sect = 0;
                            return Err(Error::NoFile);
                        }
                        let n = self.create_chain(dp.clust)?;
                        self.dir_clear(n)?;
                        dp.clust = n;
                        dp.sect = self.cluster_to_sector(n).ok_or(Error::IntErr)?;
                    }
                    FatEntry::Free | FatEntry::Bad => return Err(Error::IntErr),
                }
            }
        }
        dp.dptr = ofs;
        Ok(())
    }

    /// Zero-fill a freshly allocated directory cluster.
    pub(crate) fn dir_clear(&mut self, clst: u32) -> Result<()> {
        self.win.flush()?;
        let sect = self.cluster_to_sector(clst).ok_or(Error::IntErr)?;
        let zero = vec![0u8; self.sector_size];
        for n in 0..self.csize as u64 {
            self.device
                .write_blocks(&zero, sect + n, 1)
                .map_err(|_| Error::DiskErr)?;
        }
        // A stale copy of one of these sectors may still be resident.
        if self.win.resident() >= sect && self.win.resident() < sect + self.csize as u64 {
            self.win.invalidate();
        }
        Ok(())
    }

    /// Raw 32 bytes of the entry under the cursor.
    pub(crate) fn dir_entry_bytes(&mut self, dp: &DirCursor) -> Result<[u8; DIRENT_SIZE]> {
        let off = dp.dptr as usize % self.sector_size;
        self.win.with(dp.sect, |buf| {
            let mut e = [0u8; DIRENT_SIZE];
            e.copy_from_slice(&buf[off..off + DIRENT_SIZE]);
            e
        })
    }

    /// Modify the entry under the cursor in place.
    pub(crate) fn dir_entry_update(
        &mut self,
        dp: &DirCursor,
        f: impl FnOnce(&mut [u8]),
    ) -> Result<()> {
        let off = dp.dptr as usize % self.sector_size;
        self.win
            .update(dp.sect, |buf| f(&mut buf[off..off + DIRENT_SIZE]))
    }

    /// Find `name` in the directory, leaving the cursor at its short
    /// entry (with `blk_ofs` marking the LFN block when one matched).
    pub(crate) fn dir_find(&mut self, dp: &mut DirCursor, name: &SegName) -> Result<ShortDirEntry> {
        self.dir_seek(dp, 0)?;
        let nolfn = name.flags & NS_NOLFN != 0;
        let lossy = name.flags & NS_LOSS != 0;
        let mut ord: u8 = 0xFF;
        let mut sum: u8 = 0xFF;
        dp.blk_ofs = NO_LFN_BLOCK;

        loop {
            let raw = self.dir_entry_bytes(dp)?;
            let c = raw[0];
            if c == DIR_ENTRY_FREE {
                return Err(Error::NoFile);
            }
            let sde = ShortDirEntry::from_bytes(&raw);
            let a = sde.attr & ATTR_MASK;
            if c == DIR_ENTRY_DELETED || (a & ATTR_VOLUME_ID != 0 && a != ATTR_LONG_NAME) {
                ord = 0xFF;
                dp.blk_ofs = NO_LFN_BLOCK;
            } else if a == ATTR_LONG_NAME {
                if !nolfn {
                    let lde = LongDirEntry::from_bytes(&raw);
                    if lde.is_last_fragment() {
                        sum = lde.checksum;
                        ord = lde.index();
                        dp.blk_ofs = dp.dptr;
                    }
                    ord = if lde.index() == ord
                        && sum == lde.checksum
                        && name::fragment_matches(&name.lfn, &lde)
                    {
                        ord.wrapping_sub(1)
                    } else {
                        0xFF
                    };
                }
            } else {
                if ord == 0 && sum == sde.checksum() {
                    return Ok(sde); // long name matched in full
                }
                if !lossy && sde.name == name.sfn {
                    // An immediately preceding LFN block (whatever name it
                    // spelled) belongs to this entry; keep blk_ofs so a
                    // removal sweeps it too.
                    return Ok(sde); // short name matched
                }
                ord = 0xFF;
                dp.blk_ofs = NO_LFN_BLOCK;
            }
            self.dir_next(dp, false)?;
        }
    }

    /// Reserve `n_ent` contiguous free entries, stretching the directory
    /// if permitted. Leaves the cursor at the last entry of the block.
    pub(crate) fn dir_alloc(&mut self, dp: &mut DirCursor, n_ent: u32) -> Result<()> {
        self.dir_seek(dp, 0)?;
        let mut n = 0;
        loop {
            let first = self.dir_entry_bytes(dp)?[0];
            if first == DIR_ENTRY_DELETED || first == DIR_ENTRY_FREE {
                n += 1;
                if n == n_ent {
                    return Ok(());
                }
            } else {
                n = 0;
            }
            match self.dir_next(dp, true) {
                Ok(()) => {}
                Err(Error::NoFile) => return Err(Error::Denied),
                Err(e) => return Err(e),
            }
        }
    }

    /// Register `name` as a new object: resolve short-name numbering,
    /// reserve the entry block, emit the LFN fragments in reverse ordinal
    /// order and finally the zeroed short entry. The cursor ends at the
    /// short entry.
    pub(crate) fn dir_register(&mut self, dp: &mut DirCursor, name: &SegName) -> Result<()> {
        if name.flags & NS_DOT != 0 {
            return Err(Error::InvalidName);
        }

        let mut sfn = name.sfn;
        let n_ent;
        if name.flags & NS_LFN != 0 {
            if name.flags & NS_LOSS != 0 {
                // The short form lost information; make it unique with a
                // numeric (or, past 5, hashed) tail.
                let mut chosen = None;
                for seq in 1..100u32 {
                    let cand = name::gen_numbered_sfn(&name.sfn, &name.lfn, seq);
                    let probe = SegName {
                        sfn: cand,
                        flags: NS_NOLFN,
                        lfn: Vec::new(),
                    };
                    match self.dir_find(dp, &probe) {
                        Ok(_) => continue,
                        Err(Error::NoFile) => {
                            chosen = Some(cand);
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
                sfn = chosen.ok_or(Error::Denied)?;
            }
            n_ent = name.lfn_entries() + 1;
        } else {
            n_ent = 1;
        }

        self.dir_alloc(dp, n_ent)?;

        if n_ent > 1 {
            let first_ofs = dp.dptr - (n_ent - 1) * DIRENT_SIZE as u32;
            self.dir_seek(dp, first_ofs)?;
            let sum = name::sfn_checksum(&sfn);
            let total = n_ent - 1;
            let mut i = total;
            loop {
                let mut ord = i as u8;
                if i == total {
                    ord |= LAST_LONG_ENTRY;
                }
                let lde = LongDirEntry::new(ord, sum, name::lfn_chunk(&name.lfn, i as usize - 1));
                self.dir_entry_update(dp, |b| lde.write_to(b))?;
                self.dir_next(dp, false)?;
                i -= 1;
                if i == 0 {
                    break;
                }
            }
            dp.blk_ofs = first_ofs;
        } else {
            dp.blk_ofs = NO_LFN_BLOCK;
        }

        let nt = name.flags & (NS_BODY | NS_EXT);
        self.dir_entry_update(dp, |b| {
            b.fill(0);
            b[0..11].copy_from_slice(&sfn);
            b[12] = nt;
        })?;
        Ok(())
    }

    /// Mark the object under the cursor deleted, LFN block included.
    pub(crate) fn dir_remove(&mut self, dp: &mut DirCursor) -> Result<()> {
        let last = dp.dptr;
        if dp.blk_ofs != NO_LFN_BLOCK {
            self.dir_seek(dp, dp.blk_ofs)?;
        }
        loop {
            self.dir_entry_update(dp, |b| b[0] = DIR_ENTRY_DELETED)?;
            if dp.dptr >= last {
                break;
            }
            self.dir_next(dp, false)?;
        }
        Ok(())
    }

    /// Scan forward to the next live object and decode it.
    ///
    /// `label` selects volume-label entries instead of files/directories.
    /// Unlike the classic readdir this surfaces the dot entries; callers
    /// that need "real" children filter them. Returns with the cursor on
    /// the entry; `NoFile` means the end of the table.
    pub(crate) fn dir_read_entry(
        &mut self,
        dp: &mut DirCursor,
        label: bool,
    ) -> Result<(ShortDirEntry, Option<String>)> {
        let mut ord: u8 = 0xFF;
        let mut sum: u8 = 0xFF;
        dp.blk_ofs = NO_LFN_BLOCK;

        loop {
            if dp.sect == 0 {
                return Err(Error::NoFile);
            }
            let raw = self.dir_entry_bytes(dp)?;
            let c = raw[0];
            if c == DIR_ENTRY_FREE {
                return Err(Error::NoFile);
            }
            let sde = ShortDirEntry::from_bytes(&raw);
            let a = sde.attr & ATTR_MASK;
            if c == DIR_ENTRY_DELETED {
                ord = 0xFF;
            } else if a == ATTR_LONG_NAME {
                let lde = LongDirEntry::from_bytes(&raw);
                if lde.is_last_fragment() {
                    sum = lde.checksum;
                    ord = lde.index();
                    dp.blk_ofs = dp.dptr;
                }
                let picked = lde.index() == ord
                    && sum == lde.checksum
                    && name::pick_fragment(&mut self.lfn_buf, &lde);
                ord = if picked { ord.wrapping_sub(1) } else { 0xFF };
            } else {
                let is_label = (a & !ATTR_ARCHIVE) == ATTR_VOLUME_ID;
                if is_label == label {
                    let lfn_name = if ord == 0 && sum == sde.checksum() {
                        let len = name::lfn_buf_len(&self.lfn_buf);
                        Some(String::from_utf16_lossy(&self.lfn_buf[..len]))
                    } else {
                        dp.blk_ofs = NO_LFN_BLOCK;
                        None
                    };
                    return Ok((sde, lfn_name));
                }
                ord = 0xFF;
            }
            self.dir_next(dp, false)?;
        }
    }

    pub(crate) fn fileinfo(&self, sde: &ShortDirEntry, lfn: Option<String>) -> FileInfo {
        let alt_name = name::sfn_to_string(&sde.name, 0, false);
        let name = match lfn {
            Some(n) => n,
            None => name::sfn_to_string(&sde.name, sde.nt_res, true),
        };
        FileInfo {
            name,
            alt_name,
            attr: sde.attr & ATTR_MASK,
            size: if sde.is_dir() { 0 } else { sde.file_size },
            modified: sde.modified(),
            created: sde.created(),
            start_cluster: sde.first_cluster(self.fat_type == crate::FatType::Fat32),
        }
    }
}

/// An open directory handle, as produced by `opendir`.
pub struct Dir {
    pub(crate) fs: Arc<RwLock<FatVolume>>,
    pub(crate) fsid: u32,
    pub(crate) cursor: DirCursor,
    pub(crate) share: Option<usize>,
}

impl Dir {
    /// Read the next entry; `None` at the end of the directory.
    pub fn read(&mut self) -> Result<Option<FileInfo>> {
        let mut vol = self.fs.write();
        if vol.fsid != self.fsid {
            return Err(Error::InvalidObject);
        }
        if self.cursor.sect == 0 {
            return Ok(None);
        }
        match vol.dir_read_entry(&mut self.cursor, false) {
            Ok((sde, lfn)) => {
                let info = vol.fileinfo(&sde, lfn);
                match vol.dir_next(&mut self.cursor, false) {
                    Ok(()) => {}
                    Err(Error::NoFile) => self.cursor.sect = 0,
                    Err(e) => return Err(e),
                }
                Ok(Some(info))
            }
            Err(Error::NoFile) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Restart the scan from the first entry.
    pub fn rewind(&mut self) -> Result<()> {
        let mut vol = self.fs.write();
        if vol.fsid != self.fsid {
            return Err(Error::InvalidObject);
        }
        let sclust = self.cursor.sclust;
        self.cursor = DirCursor::new(sclust);
        vol.dir_seek(&mut self.cursor, 0)
    }
}

impl Drop for Dir {
    fn drop(&mut self) {
        if let Some(idx) = self.share.take() {
            crate::share::release(idx, self.fsid);
        }
    }
}
