//! Volume objects, mounting, formatting and the path-level API.
//!
//! A [`FatVolume`] is created by [`FatVolume::mount`]: the partition
//! search locates the VBR, the BPB is validated, the geometry derived and
//! (on FAT32) the FSInfo hints captured. Every mount bumps a global
//! generation counter; handles remember the generation they were opened
//! under and refuse to operate once it no longer matches, which is what
//! makes unmount safe while files are still open.
//!
//! [`VolumeManager`] owns up to [`crate::MAX_VOLUMES`] mounted volumes and
//! implements the drive-prefix path scheme (`"1:/dir/file"`); paths
//! without a prefix go to the current drive, paths without a leading
//! separator resolve against the volume's current directory.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::RwLock;

use crate::bpb::{BiosParameterBlock, FatType, FsInfo};
use crate::cache::SectorWindow;
use crate::device::BlockDevice;
use crate::dir::{Dir, DirCursor, FileInfo, NO_LFN_BLOCK};
use crate::entry::{NullTimeSource, ShortDirEntry, TimeSource};
use crate::file::{File, FileState, MODE_CREATE_ALWAYS, MODE_CREATE_NEW, MODE_OPEN_ALWAYS, MODE_READ, MODE_WRITE};
use crate::path::{split_drive, Located};
use crate::share::{self, Access};
use crate::{
    Error, Result, ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_VOLUME_ID, DIRENT_SIZE, MAX_LFN,
    MAX_SECTOR_SIZE, MAX_VOLUMES, MIN_SECTOR_SIZE, SPACE,
};

/// Mount-generation counter; ids start at 1 so 0 can mean "dead volume".
static FSID: AtomicU32 = AtomicU32::new(0);

/// Sentinel for "free cluster count not known yet".
const FREE_UNKNOWN: u32 = u32::MAX;

pub struct FatVolume {
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) time: Arc<dyn TimeSource>,
    /// Generation id; compared by handles, zeroed on unmount.
    pub(crate) fsid: u32,
    pub(crate) fat_type: FatType,
    pub(crate) sector_size: usize,
    /// Sectors per cluster.
    pub(crate) csize: u32,
    pub(crate) n_fats: u8,
    /// Sectors per FAT copy.
    pub(crate) fat_size: u32,
    /// Entries in the static root directory (0 on FAT32).
    pub(crate) n_rootdir: u16,
    /// Cluster count + 2; FAT entries live in `[2, n_fatent)`.
    pub(crate) n_fatent: u32,
    pub(crate) vol_base: u64,
    pub(crate) fat_base: u64,
    /// Root directory: first sector (FAT12/16) or cluster (FAT32).
    pub(crate) dir_base: u64,
    pub(crate) data_base: u64,
    /// Absolute LBA of the FSInfo sector, 0 when absent.
    pub(crate) fsinfo_sector: u64,
    pub(crate) serial: u32,
    /// Allocation hint: the most recently allocated cluster.
    pub(crate) last_clst: u32,
    /// Cached free cluster count, `FREE_UNKNOWN` until first computed.
    pub(crate) free_clst: u32,
    pub(crate) fsi_dirty: bool,
    /// Current directory for relative paths (cluster, 0 = root).
    pub(crate) cwd: u32,
    /// Working buffer for long-name assembly during directory scans.
    pub(crate) lfn_buf: Vec<u16>,
    pub(crate) win: SectorWindow,
}

impl FatVolume {
    pub fn mount(device: Arc<dyn BlockDevice>, partition: usize) -> Result<Arc<RwLock<Self>>> {
        Self::mount_with_time(device, Arc::new(NullTimeSource), partition)
    }

    pub fn mount_with_time(
        device: Arc<dyn BlockDevice>,
        time: Arc<dyn TimeSource>,
        partition: usize,
    ) -> Result<Arc<RwLock<Self>>> {
        let st = device.status();
        if !st.ready {
            return Err(Error::NotReady);
        }
        let ss = device.sector_size();
        if !(MIN_SECTOR_SIZE..=MAX_SECTOR_SIZE).contains(&ss) || !ss.is_power_of_two() {
            return Err(Error::DiskErr);
        }

        let mut win = SectorWindow::new(device.clone(), ss);
        let base = crate::partition::find_fat_volume(&mut win, partition)?;
        let bpb = win.with(base, |b| BiosParameterBlock::parse(b))?;
        bpb.validate(ss)?;

        let fat_type = bpb.fat_type();
        let n_fatent = bpb.cluster_count() + 2;
        let fat_base = base + bpb.reserved_sectors as u64;
        let data_base = base + bpb.system_sectors() as u64;
        let dir_base = match fat_type {
            FatType::Fat32 => bpb.root_cluster as u64,
            _ => fat_base + bpb.num_fats as u64 * bpb.fat_size() as u64,
        };
        win.set_fat_region(fat_base, bpb.fat_size(), bpb.num_fats);

        let mut last_clst = FREE_UNKNOWN;
        let mut free_clst = FREE_UNKNOWN;
        let mut fsinfo_sector = 0u64;
        if fat_type == FatType::Fat32 && bpb.fsinfo_sector == 1 {
            fsinfo_sector = base + 1;
            if let Some(fsi) = win.with(fsinfo_sector, |b| FsInfo::parse(b))? {
                // Hints only; anything out of range stays unknown and is
                // recomputed lazily from the FAT.
                if fsi.free_count <= n_fatent - 2 {
                    free_clst = fsi.free_count;
                }
                if fsi.next_free >= 2 && fsi.next_free < n_fatent {
                    last_clst = fsi.next_free;
                }
            }
        }

        let fsid = FSID.fetch_add(1, Ordering::Relaxed) + 1;
        log::info!(
            "mounted {:?} volume at LBA {}: {} clusters of {} sectors",
            fat_type,
            base,
            n_fatent - 2,
            bpb.sectors_per_cluster
        );

        Ok(Arc::new(RwLock::new(Self {
            device,
            time,
            fsid,
            fat_type,
            sector_size: ss,
            csize: bpb.sectors_per_cluster as u32,
            n_fats: bpb.num_fats,
            fat_size: bpb.fat_size(),
            n_rootdir: bpb.root_entries,
            n_fatent,
            vol_base: base,
            fat_base,
            dir_base,
            data_base,
            fsinfo_sector,
            serial: bpb.volume_id,
            last_clst,
            free_clst,
            fsi_dirty: false,
            cwd: 0,
            lfn_buf: vec![0u16; MAX_LFN + 1],
            win,
        })))
    }

    pub fn fat_type(&self) -> FatType {
        self.fat_type
    }

    pub fn id(&self) -> u32 {
        self.fsid
    }

    /// Flush the sector window, rewrite FSInfo if the hints changed and
    /// push the device cache out.
    pub fn sync_fs(&mut self) -> Result<()> {
        self.win.flush()?;
        if self.fsi_dirty && self.fsinfo_sector != 0 {
            let fsi = FsInfo {
                free_count: self.free_clst,
                next_free: self.last_clst,
            };
            let sect = self.fsinfo_sector;
            self.win.update(sect, |b| {
                b.fill(0);
                fsi.encode(b);
            })?;
            self.win.flush()?;
            self.fsi_dirty = false;
        }
        self.device.sync().map_err(|_| Error::DiskErr)?;
        Ok(())
    }

    /// Free cluster count; the first query on a volume without a valid
    /// FSInfo hint walks the whole FAT once and caches the result.
    pub fn free_clusters(&mut self) -> Result<u32> {
        if self.free_clst != FREE_UNKNOWN && self.free_clst <= self.n_fatent - 2 {
            return Ok(self.free_clst);
        }
        let n = self.count_free_clusters()?;
        self.free_clst = n;
        self.fsi_dirty = true;
        Ok(n)
    }

    pub fn total_clusters(&self) -> u32 {
        self.n_fatent - 2
    }

    /// Volume label from the root directory plus the VBR serial number.
    pub fn get_label(&mut self) -> Result<(String, u32)> {
        let mut dp = DirCursor::new(0);
        self.dir_seek(&mut dp, 0)?;
        let label = match self.dir_read_entry(&mut dp, true) {
            Ok((sde, _)) => {
                let mut end = 11;
                while end > 0 && sde.name[end - 1] == SPACE {
                    end -= 1;
                }
                String::from_utf8_lossy(&sde.name[..end]).into_owned()
            }
            Err(Error::NoFile) => String::new(),
            Err(e) => return Err(e),
        };
        Ok((label, self.serial))
    }

    /// Create, change or (with an empty string) remove the volume label.
    pub fn set_label(&mut self, label: &str) -> Result<()> {
        let mut name = [SPACE; 11];
        let mut len = 0;
        for ch in label.chars() {
            let c = ch as u32;
            if !(0x20..0x7F).contains(&c)
                || matches!(
                    ch,
                    '"' | '*' | '+' | ',' | '.' | '/' | ':' | ';' | '<' | '=' | '>' | '?' | '['
                        | '\\' | ']' | '|'
                )
            {
                return Err(Error::InvalidName);
            }
            if len >= 11 {
                return Err(Error::InvalidName);
            }
            name[len] = (ch as u8).to_ascii_uppercase();
            len += 1;
        }
        while len > 0 && name[len - 1] == SPACE {
            len -= 1;
        }

        let now = self.time.now();
        let mut dp = DirCursor::new(0);
        self.dir_seek(&mut dp, 0)?;
        match self.dir_read_entry(&mut dp, true) {
            Ok(_) => {
                if len == 0 {
                    self.dir_entry_update(&dp, |b| b[0] = crate::DIR_ENTRY_DELETED)?;
                } else {
                    self.dir_entry_update(&dp, |b| {
                        let mut sde = ShortDirEntry::from_bytes(b);
                        sde.name = name;
                        sde.set_modified(now);
                        sde.write_to(b);
                    })?;
                }
            }
            Err(Error::NoFile) => {
                if len > 0 {
                    let mut root = DirCursor::new(0);
                    self.dir_alloc(&mut root, 1)?;
                    self.dir_entry_update(&root, |b| {
                        b.fill(0);
                        let mut sde = ShortDirEntry::empty();
                        sde.name = name;
                        sde.attr = ATTR_VOLUME_ID;
                        sde.set_modified(now);
                        sde.write_to(b);
                    })?;
                }
            }
            Err(e) => return Err(e),
        }
        self.sync_fs()
    }

    // ---- path-level operations, called under the volume lock ----

    pub(crate) fn open_inner(&mut self, path: &str, mode: u8) -> Result<FileState> {
        let fat32 = self.fat_type == FatType::Fat32;
        let mut dp = DirCursor::new(0);
        let exclusive = mode & !MODE_READ != 0;
        match self.follow_path(&mut dp, path)? {
            Located::Origin => Err(Error::InvalidName),
            Located::Found(sde) => {
                if mode & MODE_CREATE_NEW != 0 {
                    return Err(Error::Exist);
                }
                if sde.is_dir() {
                    return Err(Error::IsDir);
                }
                if sde.is_read_only() && mode & (MODE_WRITE | MODE_CREATE_ALWAYS) != 0 {
                    return Err(Error::Denied);
                }
                let share_idx = share::acquire(self.fsid, dp.sclust, dp.dptr, exclusive)?;
                let mut start = sde.first_cluster(fat32);
                let mut size = sde.file_size;
                if mode & MODE_CREATE_ALWAYS != 0 {
                    // Re-create in place: drop the old chain, zero the entry.
                    let res = (|| -> Result<()> {
                        if start != 0 {
                            self.remove_chain(start, 0)?;
                        }
                        let now = self.time.now();
                        self.dir_entry_update(&dp, |b| {
                            let mut e = ShortDirEntry::from_bytes(b);
                            e.attr |= ATTR_ARCHIVE;
                            e.set_first_cluster(0, fat32);
                            e.file_size = 0;
                            e.set_created(now);
                            e.set_modified(now);
                            e.write_to(b);
                        })
                    })();
                    if let Err(e) = res {
                        share::release(share_idx, self.fsid);
                        return Err(e);
                    }
                    start = 0;
                    size = 0;
                }
                Ok(FileState {
                    flags: mode,
                    dir_sclust: dp.sclust,
                    dir_dptr: dp.dptr,
                    start_cluster: start,
                    size,
                    share: share_idx,
                })
            }
            Located::NotFound(name) => {
                if mode & (MODE_CREATE_NEW | MODE_CREATE_ALWAYS | MODE_OPEN_ALWAYS) == 0 {
                    return Err(Error::NoFile);
                }
                // A sharing slot must be available before the entry is
                // created, or a failed open would leave an orphan behind.
                share::ensure_slot()?;
                self.dir_register(&mut dp, &name)?;
                let now = self.time.now();
                self.dir_entry_update(&dp, |b| {
                    let mut e = ShortDirEntry::from_bytes(b);
                    e.attr = ATTR_ARCHIVE;
                    e.set_created(now);
                    e.set_modified(now);
                    e.write_to(b);
                })?;
                let share_idx = share::acquire(self.fsid, dp.sclust, dp.dptr, exclusive)?;
                Ok(FileState {
                    flags: mode,
                    dir_sclust: dp.sclust,
                    dir_dptr: dp.dptr,
                    start_cluster: 0,
                    size: 0,
                    share: share_idx,
                })
            }
        }
    }

    pub(crate) fn opendir_inner(&mut self, path: &str) -> Result<(DirCursor, Option<usize>)> {
        let fat32 = self.fat_type == FatType::Fat32;
        let mut dp = DirCursor::new(0);
        match self.follow_path(&mut dp, path)? {
            Located::Origin => {
                let mut c = DirCursor::new(dp.sclust);
                self.dir_seek(&mut c, 0)?;
                Ok((c, None))
            }
            Located::Found(sde) => {
                if !sde.is_dir() {
                    return Err(Error::NoDir);
                }
                let idx = share::acquire(self.fsid, dp.sclust, dp.dptr, false)?;
                let mut c = DirCursor::new(sde.first_cluster(fat32));
                if let Err(e) = self.dir_seek(&mut c, 0) {
                    share::release(idx, self.fsid);
                    return Err(e);
                }
                Ok((c, Some(idx)))
            }
            Located::NotFound(_) => Err(Error::NoPath),
        }
    }

    pub(crate) fn stat_inner(&mut self, path: &str) -> Result<FileInfo> {
        let mut dp = DirCursor::new(0);
        match self.follow_path(&mut dp, path)? {
            Located::Origin => Ok(FileInfo {
                name: String::from("/"),
                alt_name: String::from("/"),
                attr: ATTR_DIRECTORY,
                size: 0,
                modified: crate::DateTime::EPOCH,
                created: crate::DateTime::EPOCH,
                start_cluster: dp.sclust,
            }),
            Located::Found(sde) => {
                if dp.blk_ofs != NO_LFN_BLOCK {
                    // Re-read the LFN block to recover the long name.
                    let blk = dp.blk_ofs;
                    let mut c = dp;
                    self.dir_seek(&mut c, blk)?;
                    let (sde2, lfn) = self.dir_read_entry(&mut c, false)?;
                    Ok(self.fileinfo(&sde2, lfn))
                } else {
                    Ok(self.fileinfo(&sde, None))
                }
            }
            Located::NotFound(_) => Err(Error::NoFile),
        }
    }

    pub(crate) fn mkdir_inner(&mut self, path: &str) -> Result<()> {
        let fat32 = self.fat_type == FatType::Fat32;
        let mut dp = DirCursor::new(0);
        let name = match self.follow_path(&mut dp, path)? {
            Located::Origin | Located::Found(_) => return Err(Error::Exist),
            Located::NotFound(name) => name,
        };

        let dcl = self.create_chain(0)?;
        let res = (|| -> Result<()> {
            self.dir_clear(dcl)?;
            let now = self.time.now();
            let pcl = dp.sclust;
            let sect = self.cluster_to_sector(dcl).ok_or(Error::IntErr)?;
            self.win.update(sect, |b| {
                let mut dot = ShortDirEntry::empty();
                dot.name = *b".          ";
                dot.attr = ATTR_DIRECTORY;
                dot.set_first_cluster(dcl, fat32);
                dot.set_created(now);
                dot.set_modified(now);
                dot.write_to(&mut b[0..DIRENT_SIZE]);
                dot.name = *b"..         ";
                dot.set_first_cluster(pcl, fat32);
                dot.write_to(&mut b[DIRENT_SIZE..2 * DIRENT_SIZE]);
            })?;

            self.dir_register(&mut dp, &name)?;
            self.dir_entry_update(&dp, |b| {
                let mut e = ShortDirEntry::from_bytes(b);
                e.attr = ATTR_DIRECTORY;
                e.set_first_cluster(dcl, fat32);
                e.set_created(now);
                e.set_modified(now);
                e.write_to(b);
            })?;
            Ok(())
        })();
        if let Err(e) = res {
            // Creation failed after the cluster was taken; give it back.
            let _ = self.remove_chain(dcl, 0);
            return Err(e);
        }
        self.sync_fs()
    }

    pub(crate) fn unlink_inner(&mut self, path: &str) -> Result<()> {
        let fat32 = self.fat_type == FatType::Fat32;
        let mut dp = DirCursor::new(0);
        let sde = match self.follow_path(&mut dp, path)? {
            Located::Origin => return Err(Error::InvalidName),
            Located::NotFound(_) => return Err(Error::NoFile),
            Located::Found(sde) => sde,
        };
        share::check(self.fsid, dp.sclust, dp.dptr, Access::Exclusive)?;
        if sde.is_read_only() {
            return Err(Error::Denied);
        }
        let dclst = sde.first_cluster(fat32);
        if sde.is_dir() {
            if dclst == self.cwd {
                return Err(Error::Denied);
            }
            let mut sub = DirCursor::new(dclst);
            self.dir_seek(&mut sub, 0)?;
            loop {
                match self.dir_read_entry(&mut sub, false) {
                    Ok((s, _)) => {
                        if s.name[0] != b'.' {
                            return Err(Error::NoEmptyDir);
                        }
                        match self.dir_next(&mut sub, false) {
                            Ok(()) => {}
                            Err(Error::NoFile) => break,
                            Err(e) => return Err(e),
                        }
                    }
                    Err(Error::NoFile) => break,
                    Err(e) => return Err(e),
                }
            }
        }
        self.dir_remove(&mut dp)?;
        if dclst >= 2 {
            self.remove_chain(dclst, 0)?;
        }
        self.sync_fs()
    }

    pub(crate) fn rename_inner(&mut self, old: &str, new: &str) -> Result<()> {
        let fat32 = self.fat_type == FatType::Fat32;
        let mut djo = DirCursor::new(0);
        let old_sde = match self.follow_path(&mut djo, old)? {
            Located::Origin => return Err(Error::InvalidName),
            Located::NotFound(_) => return Err(Error::NoFile),
            Located::Found(sde) => sde,
        };
        share::check(self.fsid, djo.sclust, djo.dptr, Access::Exclusive)?;
        let old_dp = djo;

        let mut djn = DirCursor::new(0);
        let new_name = match self.follow_path(&mut djn, new)? {
            Located::Origin => return Err(Error::InvalidName),
            Located::Found(_) => return Err(Error::Exist),
            Located::NotFound(name) => name,
        };

        self.dir_register(&mut djn, &new_name)?;
        self.dir_entry_update(&djn, |b| {
            let mut e = ShortDirEntry::from_bytes(b);
            e.attr = old_sde.attr;
            e.crt_time_tenth = old_sde.crt_time_tenth;
            e.crt_time = old_sde.crt_time;
            e.crt_date = old_sde.crt_date;
            e.acc_date = old_sde.acc_date;
            e.wrt_time = old_sde.wrt_time;
            e.wrt_date = old_sde.wrt_date;
            e.file_size = old_sde.file_size;
            e.set_first_cluster(old_sde.first_cluster(fat32), fat32);
            e.write_to(b);
        })?;

        if old_sde.is_dir() && old_dp.sclust != djn.sclust {
            // The directory moved: its dot-dot entry must name the new
            // parent (cluster 0 when that parent is the root).
            let dcl = old_sde.first_cluster(fat32);
            let sect = self.cluster_to_sector(dcl).ok_or(Error::IntErr)?;
            let newp = djn.sclust;
            self.win.update(sect, |b| {
                let mut dd = ShortDirEntry::from_bytes(&b[DIRENT_SIZE..2 * DIRENT_SIZE]);
                dd.set_first_cluster(newp, fat32);
                dd.write_to(&mut b[DIRENT_SIZE..2 * DIRENT_SIZE]);
            })?;
        }

        let mut odp = old_dp;
        self.dir_remove(&mut odp)?;
        self.sync_fs()
    }

    pub(crate) fn chdir_inner(&mut self, path: &str) -> Result<()> {
        let fat32 = self.fat_type == FatType::Fat32;
        let mut dp = DirCursor::new(0);
        match self.follow_path(&mut dp, path)? {
            Located::Origin => {
                self.cwd = dp.sclust;
                Ok(())
            }
            Located::Found(sde) => {
                if !sde.is_dir() {
                    return Err(Error::NoPath);
                }
                self.cwd = sde.first_cluster(fat32);
                Ok(())
            }
            Located::NotFound(_) => Err(Error::NoPath),
        }
    }
}

/// Which FAT family `mkfs` may choose from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    /// FAT12/16, or FAT32 when the volume is too large for FAT16.
    Any,
    /// FAT12/16 only.
    Fat,
    /// FAT32 only.
    Fat32,
}

#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    pub kind: FormatKind,
    /// Number of FAT copies, 1 or 2.
    pub n_fats: u8,
    /// Cluster size in sectors (power of two, <= 128); 0 selects from the
    /// volume-size table.
    pub au_sectors: u32,
    /// Root directory entries for FAT12/16; 0 = 512.
    pub n_root: u32,
    /// Lay the volume into a single MBR partition instead of formatting
    /// the whole medium ("super floppy").
    pub create_mbr: bool,
    /// Data-area alignment in sectors; 0 uses the device erase block.
    pub align: u32,
    /// Volume serial; derived from the geometry when absent.
    pub serial: Option<u32>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions {
            kind: FormatKind::Any,
            n_fats: 2,
            au_sectors: 0,
            n_root: 0,
            create_mbr: true,
            align: 0,
            serial: None,
        }
    }
}

/// Cluster-size selection tables, indexed by volume size. FAT12/16 steps
/// at multiples of 4K sectors, FAT32 at multiples of 128K sectors.
const CST: [u32; 6] = [1, 4, 16, 64, 256, 512];
const CST32: [u32; 6] = [1, 2, 4, 8, 16, 32];

/// Create a FAT volume on the device.
///
/// Returns the FAT sub-type actually chosen. `MkfsAborted` means no valid
/// cluster configuration exists for the requested parameters.
pub fn mkfs(device: &Arc<dyn BlockDevice>, opts: &FormatOptions) -> Result<FatType> {
    let ss = device.sector_size();
    if !(MIN_SECTOR_SIZE..=MAX_SECTOR_SIZE).contains(&ss) || !ss.is_power_of_two() {
        return Err(Error::DiskErr);
    }
    let st = device.status();
    if !st.ready {
        return Err(Error::NotReady);
    }
    if st.write_protected {
        return Err(Error::WriteProtected);
    }

    let mut sz_blk = opts.align;
    if sz_blk == 0 {
        sz_blk = device.erase_block_size() as u32;
    }
    if sz_blk == 0 || sz_blk > 0x8000 || !sz_blk.is_power_of_two() {
        sz_blk = 1;
    }
    let n_fat = if opts.n_fats == 1 { 1u32 } else { 2u32 };
    let n_root = if opts.n_root >= 1 && opts.n_root <= 32768 && opts.n_root % (ss as u32 / 32) == 0
    {
        opts.n_root
    } else {
        512
    };
    if opts.au_sectors != 0 && (opts.au_sectors > 128 || !opts.au_sectors.is_power_of_two()) {
        return Err(Error::InvalidParameter);
    }
    let sz_au = opts.au_sectors;

    let total = device.sector_count();
    let b_vol: u64 = if opts.create_mbr { 63 } else { 0 };
    if total <= b_vol {
        return Err(Error::MkfsAborted);
    }
    let sz_vol = (total - b_vol).min(u32::MAX as u64) as u32;
    if sz_vol < 128 {
        return Err(Error::MkfsAborted);
    }

    let mut fsty = match opts.kind {
        FormatKind::Fat32 => FatType::Fat32,
        _ => FatType::Fat16,
    };

    // Determine the cluster configuration, retrying with adjusted cluster
    // sizes (and, for `Any`, falling over to FAT32) until it is valid.
    let mut sz_au_cur = sz_au;
    let pau;
    let n_clst;
    let sz_fat;
    let sz_rsv;
    let sz_dir;
    let mut b_fat;
    loop {
        let mut pau_try = sz_au_cur;
        let n_clst_try;
        let sz_fat_try;
        let mut sz_rsv_try;
        let sz_dir_try;
        if fsty == FatType::Fat32 {
            if pau_try == 0 {
                let n = sz_vol / 0x20000;
                pau_try = 1;
                for &c in CST32.iter() {
                    if c > n {
                        break;
                    }
                    pau_try <<= 1;
                }
            }
            n_clst_try = sz_vol / pau_try;
            sz_fat_try = (n_clst_try * 4 + 8 + ss as u32 - 1) / ss as u32;
            sz_rsv_try = 32;
            sz_dir_try = 0;
            if n_clst_try < crate::MAX_CLUSTER_FAT16 || n_clst_try > crate::MAX_CLUSTER_FAT32 {
                return Err(Error::MkfsAborted);
            }
        } else {
            if pau_try == 0 {
                let n = sz_vol / 0x1000;
                pau_try = 1;
                for &c in CST.iter() {
                    if c > n {
                        break;
                    }
                    pau_try <<= 1;
                }
            }
            n_clst_try = sz_vol / pau_try;
            let fat_bytes = if n_clst_try > crate::MAX_CLUSTER_FAT12 - 1 {
                n_clst_try * 2 + 4
            } else {
                fsty = FatType::Fat12;
                (n_clst_try * 3 + 1) / 2 + 3
            };
            sz_fat_try = (fat_bytes + ss as u32 - 1) / ss as u32;
            sz_rsv_try = 1;
            sz_dir_try = n_root * DIRENT_SIZE as u32 / ss as u32;
        }
        b_fat = b_vol + sz_rsv_try as u64;
        let mut sz_fat_adj = sz_fat_try;
        let b_data_raw = b_fat + (sz_fat_adj * n_fat) as u64 + sz_dir_try as u64;

        // Align the data area to the erase block.
        let aligned = (b_data_raw + sz_blk as u64 - 1) & !(sz_blk as u64 - 1);
        let mut gap = (aligned - b_data_raw) as u32;
        if fsty == FatType::Fat32 {
            sz_rsv_try += gap;
            b_fat += gap as u64;
        } else if gap != 0 {
            if gap % n_fat != 0 {
                gap -= 1;
                sz_rsv_try += 1;
                b_fat += 1;
            }
            sz_fat_adj += gap / n_fat;
        }
        let b_data = b_fat + (sz_fat_adj * n_fat) as u64 + sz_dir_try as u64;

        if (sz_vol as u64) < b_data + pau_try as u64 * 16 - b_vol {
            return Err(Error::MkfsAborted);
        }
        let n_clst_final =
            (sz_vol - sz_rsv_try - sz_fat_adj * n_fat - sz_dir_try) / pau_try;

        if fsty == FatType::Fat32 && n_clst_final < crate::MAX_CLUSTER_FAT16 {
            if sz_au == 0 && pau_try / 2 != 0 {
                sz_au_cur = pau_try / 2;
                continue;
            }
            return Err(Error::MkfsAborted);
        }
        if fsty == FatType::Fat16 {
            if n_clst_final >= crate::MAX_CLUSTER_FAT16 {
                if sz_au == 0 && pau_try * 2 <= 64 {
                    sz_au_cur = pau_try * 2;
                    continue;
                }
                if opts.kind == FormatKind::Any {
                    fsty = FatType::Fat32;
                    sz_au_cur = sz_au;
                    continue;
                }
                if sz_au == 0 && pau_try * 2 <= 128 {
                    sz_au_cur = pau_try * 2;
                    continue;
                }
                return Err(Error::MkfsAborted);
            }
            if n_clst_final < crate::MAX_CLUSTER_FAT12 {
                if sz_au == 0 && pau_try * 2 <= 128 {
                    sz_au_cur = pau_try * 2;
                    continue;
                }
                return Err(Error::MkfsAborted);
            }
        }
        if fsty == FatType::Fat12 && n_clst_final >= crate::MAX_CLUSTER_FAT12 {
            return Err(Error::MkfsAborted);
        }

        pau = pau_try;
        n_clst = n_clst_final;
        sz_fat = sz_fat_adj;
        sz_rsv = sz_rsv_try;
        sz_dir = sz_dir_try;
        break;
    }

    let _ = device.trim(b_vol, b_vol + sz_vol as u64 - 1);

    let fat32 = fsty == FatType::Fat32;
    let serial = opts.serial.unwrap_or(0xA5C3_9600 ^ sz_vol);
    let bpb = BiosParameterBlock {
        bytes_per_sector: ss as u16,
        sectors_per_cluster: pau as u8,
        reserved_sectors: sz_rsv as u16,
        num_fats: n_fat as u8,
        root_entries: if fat32 { 0 } else { n_root as u16 },
        total_sectors_16: if sz_vol < 0x10000 { sz_vol as u16 } else { 0 },
        media: 0xF8,
        fat_size_16: if fat32 { 0 } else { sz_fat as u16 },
        sectors_per_track: 63,
        num_heads: 255,
        hidden_sectors: b_vol as u32,
        total_sectors_32: if sz_vol < 0x10000 { 0 } else { sz_vol },
        fat_size_32: if fat32 { sz_fat } else { 0 },
        ext_flags: 0,
        fs_version: 0,
        root_cluster: if fat32 { 2 } else { 0 },
        fsinfo_sector: if fat32 { 1 } else { 0 },
        backup_boot_sector: if fat32 { 6 } else { 0 },
        drive_number: 0x80,
        boot_signature: 0x29,
        volume_id: serial,
        volume_label: *b"NO NAME    ",
        fs_type_label: if fat32 { *b"FAT32   " } else { *b"FAT     " },
    };

    let mut buf = vec![0u8; ss];
    bpb.encode(&mut buf);
    device
        .write_blocks(&buf, b_vol, 1)
        .map_err(|_| Error::DiskErr)?;

    if fat32 {
        // Backup VBR, then the FSInfo sector and its backup.
        device
            .write_blocks(&buf, b_vol + 6, 1)
            .map_err(|_| Error::DiskErr)?;
        buf.fill(0);
        FsInfo {
            free_count: n_clst - 1,
            next_free: 2,
        }
        .encode(&mut buf);
        device
            .write_blocks(&buf, b_vol + 7, 1)
            .map_err(|_| Error::DiskErr)?;
        device
            .write_blocks(&buf, b_vol + 1, 1)
            .map_err(|_| Error::DiskErr)?;
    }

    // FAT area: reserved entries 0 and 1, cluster 2 pre-allocated for the
    // FAT32 root, everything else free.
    let mut sect = b_fat;
    for _ in 0..n_fat {
        buf.fill(0);
        match fsty {
            FatType::Fat32 => {
                crate::write_le_u32(&mut buf[0..], 0xFFFF_FFF8);
                crate::write_le_u32(&mut buf[4..], 0xFFFF_FFFF);
                crate::write_le_u32(&mut buf[8..], 0x0FFF_FFFF);
            }
            FatType::Fat16 => crate::write_le_u32(&mut buf[0..], 0xFFFF_FFF8),
            FatType::Fat12 => crate::write_le_u32(&mut buf[0..], 0x00FF_FFF8),
        }
        for n in 0..sz_fat as u64 {
            device
                .write_blocks(&buf, sect + n, 1)
                .map_err(|_| Error::DiskErr)?;
            if n == 0 {
                buf.fill(0);
            }
        }
        sect += sz_fat as u64;
    }

    // Root directory region (one cluster on FAT32).
    buf.fill(0);
    let root_sectors = if fat32 { pau } else { sz_dir };
    for n in 0..root_sectors as u64 {
        device
            .write_blocks(&buf, sect + n, 1)
            .map_err(|_| Error::DiskErr)?;
    }

    if opts.create_mbr {
        let sys = if fat32 {
            0x0C
        } else if sz_vol >= 0x10000 {
            0x06
        } else if fsty == FatType::Fat16 {
            0x04
        } else {
            0x01
        };
        crate::partition::write_mbr(device, b_vol as u32, sz_vol, sys)?;
    }

    device.sync().map_err(|_| Error::DiskErr)?;
    log::info!(
        "formatted {:?}: {} clusters of {} sectors at LBA {}",
        fsty,
        n_clst,
        pau,
        b_vol
    );
    Ok(fsty)
}

/// The drive table and the public path API.
#[derive(Default)]
pub struct VolumeManager {
    slots: [Option<Arc<RwLock<FatVolume>>>; MAX_VOLUMES],
    current: usize,
}

impl VolumeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(
        &mut self,
        drive: usize,
        device: Arc<dyn BlockDevice>,
        partition: usize,
    ) -> Result<()> {
        self.mount_with_time(drive, device, Arc::new(NullTimeSource), partition)
    }

    pub fn mount_with_time(
        &mut self,
        drive: usize,
        device: Arc<dyn BlockDevice>,
        time: Arc<dyn TimeSource>,
        partition: usize,
    ) -> Result<()> {
        if drive >= MAX_VOLUMES {
            return Err(Error::InvalidDrive);
        }
        if let Some(old) = self.slots[drive].take() {
            let mut v = old.write();
            let _ = v.sync_fs();
            share::purge_volume(v.fsid);
            v.fsid = 0;
        }
        let vol = FatVolume::mount_with_time(device, time, partition)?;
        self.slots[drive] = Some(vol);
        Ok(())
    }

    /// Flush and detach a volume. Handles still open against it start
    /// failing with `InvalidObject`.
    pub fn unmount(&mut self, drive: usize) -> Result<()> {
        let slot = self.slots.get_mut(drive).ok_or(Error::InvalidDrive)?;
        let vol = slot.take().ok_or(Error::NotEnabled)?;
        let mut v = vol.write();
        let res = v.sync_fs();
        share::purge_volume(v.fsid);
        v.fsid = 0;
        res
    }

    pub fn set_current_drive(&mut self, drive: usize) -> Result<()> {
        if drive >= MAX_VOLUMES {
            return Err(Error::InvalidDrive);
        }
        self.current = drive;
        Ok(())
    }

    fn volume<'p>(&self, path: &'p str) -> Result<(Arc<RwLock<FatVolume>>, &'p str)> {
        let (drv, rest) = split_drive(path)?;
        let d = drv.unwrap_or(self.current);
        let arc = self
            .slots
            .get(d)
            .ok_or(Error::InvalidDrive)?
            .as_ref()
            .ok_or(Error::NotEnabled)?
            .clone();
        Ok((arc, rest))
    }

    /// Open a file. `mode` is a combination of the `MODE_*` flags.
    pub fn open(&self, path: &str, mode: u8) -> Result<File> {
        if mode & (MODE_READ | MODE_WRITE) == 0 {
            return Err(Error::InvalidParameter);
        }
        let (arc, rest) = self.volume(path)?;
        let (state, fsid, ss) = {
            let mut vol = arc.write();
            if mode & !MODE_READ != 0 && vol.device.status().write_protected {
                return Err(Error::WriteProtected);
            }
            let st = vol.open_inner(rest, mode)?;
            (st, vol.fsid, vol.sector_size)
        };
        let mut f = File::new(arc, fsid, state, ss);
        if mode & crate::file::SEEK_END_BIT != 0 {
            let end = f.size();
            f.seek(end)?;
        }
        Ok(f)
    }

    pub fn opendir(&self, path: &str) -> Result<Dir> {
        let (arc, rest) = self.volume(path)?;
        let (cursor, share, fsid) = {
            let mut vol = arc.write();
            let (c, s) = vol.opendir_inner(rest)?;
            (c, s, vol.fsid)
        };
        Ok(Dir {
            fs: arc,
            fsid,
            cursor,
            share,
        })
    }

    pub fn stat(&self, path: &str) -> Result<FileInfo> {
        let (arc, rest) = self.volume(path)?;
        let mut vol = arc.write();
        vol.stat_inner(rest)
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        let (arc, rest) = self.volume(path)?;
        let mut vol = arc.write();
        if vol.device.status().write_protected {
            return Err(Error::WriteProtected);
        }
        vol.mkdir_inner(rest)
    }

    /// Remove a file or an empty directory.
    pub fn unlink(&self, path: &str) -> Result<()> {
        let (arc, rest) = self.volume(path)?;
        let mut vol = arc.write();
        if vol.device.status().write_protected {
            return Err(Error::WriteProtected);
        }
        vol.unlink_inner(rest)
    }

    /// Rename or move an object within one volume.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let (arc_old, rest_old) = self.volume(old)?;
        let (arc_new, rest_new) = self.volume(new)?;
        if !Arc::ptr_eq(&arc_old, &arc_new) {
            return Err(Error::InvalidDrive);
        }
        let mut vol = arc_old.write();
        if vol.device.status().write_protected {
            return Err(Error::WriteProtected);
        }
        vol.rename_inner(rest_old, rest_new)
    }

    /// Change the volume's current directory.
    pub fn chdir(&self, path: &str) -> Result<()> {
        let (arc, rest) = self.volume(path)?;
        let mut vol = arc.write();
        vol.chdir_inner(rest)
    }

    /// Current directory of the volume addressed by `path`, as a
    /// drive-prefixed absolute path (e.g. `"0:/logs/today"`).
    pub fn getcwd(&self, path: &str) -> Result<String> {
        let (drv, _) = split_drive(path)?;
        let d = drv.unwrap_or(self.current);
        let arc = self
            .slots
            .get(d)
            .ok_or(Error::InvalidDrive)?
            .as_ref()
            .ok_or(Error::NotEnabled)?
            .clone();
        let mut vol = arc.write();
        let cwd = vol.getcwd_inner()?;
        Ok(format!("{}:{}", d, cwd))
    }

    /// `(free, total)` clusters of the volume addressed by `path`.
    pub fn getfree(&self, path: &str) -> Result<(u32, u32)> {
        let (arc, _) = self.volume(path)?;
        let mut vol = arc.write();
        let free = vol.free_clusters()?;
        Ok((free, vol.total_clusters()))
    }

    pub fn get_label(&self, path: &str) -> Result<(String, u32)> {
        let (arc, _) = self.volume(path)?;
        let mut vol = arc.write();
        vol.get_label()
    }

    pub fn set_label(&self, path: &str, label: &str) -> Result<()> {
        let (arc, _) = self.volume(path)?;
        let mut vol = arc.write();
        vol.set_label(label)
    }

    /// Flush a volume's pending metadata.
    pub fn sync(&self, path: &str) -> Result<()> {
        let (arc, _) = self.volume(path)?;
        let mut vol = arc.write();
        vol.sync_fs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::RamDisk;
    use crate::fat::FatEntry;
    use crate::{ATTR_DIRECTORY, MODE_APPEND};

    fn format_and_mount(
        sectors: usize,
        kind: FormatKind,
        create_mbr: bool,
    ) -> (Arc<RamDisk>, VolumeManager) {
        let disk = RamDisk::new(sectors, 512);
        let dev: Arc<dyn BlockDevice> = disk.clone();
        mkfs(
            &dev,
            &FormatOptions {
                kind,
                create_mbr,
                ..FormatOptions::default()
            },
        )
        .unwrap();
        let mut mgr = VolumeManager::new();
        mgr.mount(0, dev, 0).unwrap();
        (disk, mgr)
    }

    fn vol_of(mgr: &VolumeManager) -> Arc<RwLock<FatVolume>> {
        mgr.slots[0].as_ref().unwrap().clone()
    }

    #[test]
    fn format_then_mount_fat16() {
        // 64 MiB, FAT12/16 family, one MBR partition.
        let (_disk, mgr) = format_and_mount(131072, FormatKind::Fat, true);
        let vol = vol_of(&mgr);
        assert_eq!(vol.read().fat_type(), FatType::Fat16);

        // A fresh FAT16 volume has every data cluster free.
        let (free, total) = mgr.getfree("0:").unwrap();
        assert_eq!(free, total);

        let root = mgr.stat("/").unwrap();
        assert_ne!(root.attr & ATTR_DIRECTORY, 0);
    }

    #[test]
    fn format_then_mount_fat32() {
        let (_disk, mgr) = format_and_mount(131072, FormatKind::Fat32, false);
        let vol = vol_of(&mgr);
        assert_eq!(vol.read().fat_type(), FatType::Fat32);

        // The root directory occupies one cluster on FAT32.
        let (free, total) = mgr.getfree("0:").unwrap();
        assert_eq!(free, total - 1);
    }

    #[test]
    fn format_then_mount_fat12() {
        let (_disk, mgr) = format_and_mount(2048, FormatKind::Any, false);
        let vol = vol_of(&mgr);
        assert_eq!(vol.read().fat_type(), FatType::Fat12);
    }

    #[test]
    fn fat12_entries_survive_sector_straddle() {
        let (_disk, mgr) = format_and_mount(2048, FormatKind::Any, false);
        let vol = vol_of(&mgr);
        let mut v = vol.write();
        // Entry 341 begins at FAT byte 511, crossing into the next sector.
        for &(clst, val) in &[(2u32, 0x234u32), (3, 0x571), (341, 0x2A5), (342, 0x15A)] {
            v.put_fat(clst, val).unwrap();
        }
        for &(clst, val) in &[(2u32, 0x234u32), (3, 0x571), (341, 0x2A5), (342, 0x15A)] {
            assert_eq!(v.get_fat(clst).unwrap(), FatEntry::Next(val));
        }
        // Neighbouring entries must be untouched by the packed updates.
        assert_eq!(v.get_fat(4).unwrap(), FatEntry::Free);
        assert_eq!(v.get_fat(340).unwrap(), FatEntry::Free);
        assert_eq!(v.get_fat(343).unwrap(), FatEntry::Free);

        let eoc = v.eoc_value();
        v.put_fat(341, eoc).unwrap();
        assert_eq!(v.get_fat(341).unwrap(), FatEntry::EndOfChain);
        v.put_fat(341, 0).unwrap();
        assert_eq!(v.get_fat(341).unwrap(), FatEntry::Free);
    }

    #[test]
    fn write_close_reopen_read_round_trip() {
        let (_disk, mgr) = format_and_mount(2048, FormatKind::Any, false);
        let data: Vec<u8> = (0..5000u32).map(|i| (i * 7) as u8).collect();

        let mut f = mgr
            .open("/data.bin", MODE_WRITE | MODE_CREATE_NEW)
            .unwrap();
        assert_eq!(f.write(&data).unwrap(), data.len());
        f.close().unwrap();

        let mut f = mgr.open("/data.bin", MODE_READ).unwrap();
        assert_eq!(f.size(), 5000);
        let mut back = vec![0u8; 6000];
        assert_eq!(f.read(&mut back).unwrap(), 5000);
        assert_eq!(&back[..5000], &data[..]);
        f.close().unwrap();

        let info = mgr.stat("/data.bin").unwrap();
        assert_eq!(info.size, 5000);
    }

    #[test]
    fn long_name_create_and_readdir() {
        let (_disk, mgr) = format_and_mount(2048, FormatKind::Any, false);
        let mut f = mgr
            .open("/file with spaces.txt", MODE_WRITE | MODE_CREATE_NEW)
            .unwrap();
        f.write(&[0xAA; 100]).unwrap();
        f.close().unwrap();

        let mut dir = mgr.opendir("/").unwrap();
        let info = dir.read().unwrap().expect("one entry in the root");
        assert_eq!(info.name, "file with spaces.txt");
        assert_eq!(info.alt_name, "FILEWI~1.TXT");
        assert_eq!(info.size, 100);
        assert!(dir.read().unwrap().is_none());

        // Lookup works by long name regardless of case, and by the alias.
        assert!(mgr.stat("/FILE WITH SPACES.TXT").is_ok());
        assert!(mgr.stat("/FILEWI~1.TXT").is_ok());
    }

    #[test]
    fn short_name_collisions_get_numeric_tails() {
        let (_disk, mgr) = format_and_mount(2048, FormatKind::Any, false);
        for name in ["/LongName1.TXT", "/LongName2.TXT", "/LongName3.TXT"] {
            mgr.open(name, MODE_WRITE | MODE_CREATE_NEW)
                .unwrap()
                .close()
                .unwrap();
        }
        assert_eq!(mgr.stat("/LongName1.TXT").unwrap().alt_name, "LONGNA~1.TXT");
        assert_eq!(mgr.stat("/LongName2.TXT").unwrap().alt_name, "LONGNA~2.TXT");
        assert_eq!(mgr.stat("/LongName3.TXT").unwrap().alt_name, "LONGNA~3.TXT");
    }

    #[test]
    fn mkdir_gets_dot_entries() {
        let (_disk, mgr) = format_and_mount(2048, FormatKind::Any, false);
        mgr.mkdir("/sub").unwrap();

        let sub = mgr.stat("/sub").unwrap();
        assert!(sub.is_dir());

        let mut dir = mgr.opendir("/sub").unwrap();
        let dot = dir.read().unwrap().unwrap();
        assert_eq!(dot.name, ".");
        assert_eq!(dot.start_cluster, sub.start_cluster);
        let dotdot = dir.read().unwrap().unwrap();
        assert_eq!(dotdot.name, "..");
        assert_eq!(dotdot.start_cluster, 0, "the root is cluster 0 in ..");
        assert!(dir.read().unwrap().is_none());
        drop(dir);

        mgr.open("/sub/inner.txt", MODE_WRITE | MODE_CREATE_NEW)
            .unwrap()
            .close()
            .unwrap();
        assert_eq!(mgr.unlink("/sub"), Err(Error::NoEmptyDir));
        mgr.unlink("/sub/inner.txt").unwrap();
        mgr.unlink("/sub").unwrap();
        assert_eq!(mgr.stat("/sub"), Err(Error::NoFile));
    }

    #[test]
    fn unlink_removes_object_and_chain() {
        let (_disk, mgr) = format_and_mount(2048, FormatKind::Any, false);
        let (free0, _) = mgr.getfree("0:").unwrap();

        let mut f = mgr
            .open("/victim with long name.bin", MODE_WRITE | MODE_CREATE_NEW)
            .unwrap();
        f.write(&[1u8; 2048]).unwrap();
        f.close().unwrap();
        assert_eq!(mgr.getfree("0:").unwrap().0, free0 - 4);

        mgr.unlink("/victim with long name.bin").unwrap();
        assert_eq!(mgr.stat("/victim with long name.bin"), Err(Error::NoFile));
        assert_eq!(mgr.getfree("0:").unwrap().0, free0);

        // No live entries remain in the root.
        let mut dir = mgr.opendir("/").unwrap();
        assert!(dir.read().unwrap().is_none());
    }

    #[test]
    fn truncate_releases_tail_clusters() {
        let (_disk, mgr) = format_and_mount(2048, FormatKind::Any, false);
        let mut f = mgr.open("/t.bin", MODE_WRITE | MODE_CREATE_NEW).unwrap();
        f.write(&[0x5Au8; 5120]).unwrap(); // 10 clusters of 512 bytes
        f.close().unwrap();
        let (free0, _) = mgr.getfree("0:").unwrap();

        let mut f = mgr.open("/t.bin", MODE_READ | MODE_WRITE).unwrap();
        f.seek(768).unwrap();
        f.truncate().unwrap();
        f.close().unwrap();

        let (free1, _) = mgr.getfree("0:").unwrap();
        assert_eq!(free1, free0 + 8, "two clusters remain for 768 bytes");

        let mut f = mgr.open("/t.bin", MODE_READ).unwrap();
        assert_eq!(f.size(), 768);
        let mut buf = vec![0u8; 1024];
        assert_eq!(f.read(&mut buf).unwrap(), 768);
        assert!(buf[..768].iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn disk_full_reports_partial_write() {
        let (_disk, mgr) = format_and_mount(2048, FormatKind::Any, false);
        let mut f = mgr.open("/big.bin", MODE_WRITE | MODE_CREATE_NEW).unwrap();
        let (free, _) = mgr.getfree("0:").unwrap();

        // Leave exactly one free cluster.
        let chunk = vec![0xEEu8; 512];
        for _ in 0..free - 1 {
            assert_eq!(f.write(&chunk).unwrap(), 512);
        }
        assert_eq!(mgr.getfree("0:").unwrap().0, 1);

        // Two clusters requested, one available.
        let big = vec![0xEEu8; 1024];
        assert_eq!(f.write(&big).unwrap(), 512);
        assert_eq!(f.last_error(), Some(Error::NoSpaceLeft));
        assert_eq!(f.write(&big), Err(Error::NoSpaceLeft));
        f.close().unwrap();

        assert_eq!(mgr.getfree("0:").unwrap().0, 0);
        let info = mgr.stat("/big.bin").unwrap();
        assert_eq!(info.size, (free) * 512);
    }

    #[test]
    fn fat_copies_stay_identical() {
        let (disk, mgr) = format_and_mount(2048, FormatKind::Any, false);
        for name in ["/one.txt", "/two.txt", "/three.txt"] {
            let mut f = mgr.open(name, MODE_WRITE | MODE_CREATE_NEW).unwrap();
            f.write(&[7u8; 1500]).unwrap();
            f.close().unwrap();
        }
        mgr.unlink("/two.txt").unwrap();
        mgr.sync("0:").unwrap();

        let vol = vol_of(&mgr);
        let (fat_base, fat_size) = {
            let v = vol.read();
            (v.fat_base, v.fat_size as u64)
        };
        for i in 0..fat_size {
            assert_eq!(
                disk.sector(fat_base + i),
                disk.sector(fat_base + fat_size + i),
                "FAT copies differ at sector {}",
                i
            );
        }
    }

    #[test]
    fn sharing_rejects_conflicting_opens() {
        let (_disk, mgr) = format_and_mount(2048, FormatKind::Any, false);
        mgr.open("/shared.txt", MODE_WRITE | MODE_CREATE_NEW)
            .unwrap()
            .close()
            .unwrap();

        let w = mgr.open("/shared.txt", MODE_READ | MODE_WRITE).unwrap();
        assert_eq!(mgr.open("/shared.txt", MODE_READ).err(), Some(Error::Locked));
        drop(w);

        let r1 = mgr.open("/shared.txt", MODE_READ).unwrap();
        let r2 = mgr.open("/shared.txt", MODE_READ).unwrap();
        assert_eq!(
            mgr.open("/shared.txt", MODE_READ | MODE_WRITE).err(),
            Some(Error::Locked)
        );
        // Unlink and rename need the object fully closed.
        assert_eq!(mgr.unlink("/shared.txt"), Err(Error::Locked));
        assert_eq!(mgr.rename("/shared.txt", "/other.txt"), Err(Error::Locked));
        drop(r1);
        drop(r2);
        mgr.unlink("/shared.txt").unwrap();
    }

    #[test]
    fn rename_moves_between_directories() {
        let (_disk, mgr) = format_and_mount(2048, FormatKind::Any, false);
        let mut f = mgr.open("/a.txt", MODE_WRITE | MODE_CREATE_NEW).unwrap();
        f.write(b"payload").unwrap();
        f.close().unwrap();
        mgr.mkdir("/d").unwrap();

        mgr.rename("/a.txt", "/d/b with long name.txt").unwrap();
        assert_eq!(mgr.stat("/a.txt"), Err(Error::NoFile));

        let info = mgr.stat("/d/b with long name.txt").unwrap();
        assert_eq!(info.size, 7);

        let mut f = mgr.open("/d/b with long name.txt", MODE_READ).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(f.read(&mut buf).unwrap(), 7);
        assert_eq!(&buf[..7], b"payload");
        f.close().unwrap();

        // Moving a directory rewrites its dot-dot entry.
        mgr.mkdir("/outer").unwrap();
        mgr.rename("/d", "/outer/moved").unwrap();
        let moved = mgr.stat("/outer/moved").unwrap();
        let mut dir = mgr.opendir("/outer/moved").unwrap();
        let dot = dir.read().unwrap().unwrap();
        assert_eq!(dot.start_cluster, moved.start_cluster);
        let dotdot = dir.read().unwrap().unwrap();
        assert_eq!(
            dotdot.start_cluster,
            mgr.stat("/outer").unwrap().start_cluster
        );
        drop(dir);
        assert!(mgr.stat("/outer/moved/b with long name.txt").is_ok());
    }

    #[test]
    fn rename_to_existing_name_is_rejected() {
        let (_disk, mgr) = format_and_mount(2048, FormatKind::Any, false);
        for name in ["/x.txt", "/y.txt"] {
            mgr.open(name, MODE_WRITE | MODE_CREATE_NEW)
                .unwrap()
                .close()
                .unwrap();
        }
        assert_eq!(mgr.rename("/x.txt", "/y.txt"), Err(Error::Exist));
        assert_eq!(mgr.rename("/missing.txt", "/z.txt"), Err(Error::NoFile));
    }

    #[test]
    fn seek_extension_reads_back_zeros() {
        let (_disk, mgr) = format_and_mount(2048, FormatKind::Any, false);
        let mut f = mgr.open("/gap.bin", MODE_WRITE | MODE_CREATE_NEW).unwrap();
        f.write(&[0xFFu8; 10]).unwrap();
        f.seek(3000).unwrap();
        f.write(&[0xEEu8; 10]).unwrap();
        f.close().unwrap();

        let mut f = mgr.open("/gap.bin", MODE_READ).unwrap();
        assert_eq!(f.size(), 3010);
        let mut buf = vec![0xA5u8; 3010];
        assert_eq!(f.read(&mut buf).unwrap(), 3010);
        assert!(buf[..10].iter().all(|&b| b == 0xFF));
        assert!(buf[10..3000].iter().all(|&b| b == 0), "gap must read as zeros");
        assert!(buf[3000..].iter().all(|&b| b == 0xEE));

        // Read-only handles clamp instead of extending.
        f.seek(100_000).unwrap();
        assert_eq!(f.tell(), 3010);
    }

    #[test]
    fn append_mode_continues_at_eof() {
        let (_disk, mgr) = format_and_mount(2048, FormatKind::Any, false);
        let mut f = mgr
            .open("/log.txt", MODE_WRITE | MODE_CREATE_NEW)
            .unwrap();
        f.write(b"abc").unwrap();
        f.close().unwrap();

        let mut f = mgr.open("/log.txt", MODE_WRITE | MODE_APPEND).unwrap();
        assert_eq!(f.tell(), 3);
        f.write(b"def").unwrap();
        f.close().unwrap();

        let mut f = mgr.open("/log.txt", MODE_READ).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(f.read(&mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"abcdef");
    }

    #[test]
    fn open_mode_semantics() {
        let (_disk, mgr) = format_and_mount(2048, FormatKind::Any, false);
        assert!(matches!(mgr.open("/nope.txt", MODE_READ), Err(Error::NoFile)));

        mgr.open("/f.txt", MODE_WRITE | MODE_CREATE_NEW)
            .unwrap()
            .close()
            .unwrap();
        assert!(matches!(
            mgr.open("/f.txt", MODE_WRITE | MODE_CREATE_NEW),
            Err(Error::Exist)
        ));

        // CREATE_ALWAYS truncates.
        let mut f = mgr.open("/f.txt", MODE_WRITE | MODE_CREATE_ALWAYS).unwrap();
        assert_eq!(f.size(), 0);
        f.close().unwrap();

        // Directories cannot be opened as files.
        mgr.mkdir("/dir").unwrap();
        assert!(matches!(mgr.open("/dir", MODE_READ), Err(Error::IsDir)));
        assert!(matches!(mgr.opendir("/f.txt"), Err(Error::NoDir)));
        assert!(matches!(mgr.open("/f.txt", 0), Err(Error::InvalidParameter)));
    }

    #[test]
    fn getcwd_reconstructs_the_path() {
        let (_disk, mgr) = format_and_mount(2048, FormatKind::Any, false);
        assert_eq!(mgr.getcwd("0:").unwrap(), "0:/");

        mgr.mkdir("/x").unwrap();
        mgr.mkdir("/x/Sub Dir Two").unwrap();
        mgr.chdir("/x/Sub Dir Two").unwrap();
        // Both the plain 8.3 name and the long name survive the walk.
        assert_eq!(mgr.getcwd("0:").unwrap(), "0:/x/Sub Dir Two");

        mgr.chdir("..").unwrap();
        assert_eq!(mgr.getcwd("0:").unwrap(), "0:/x");
        mgr.chdir("/").unwrap();
        assert_eq!(mgr.getcwd("0:").unwrap(), "0:/");
    }

    #[test]
    fn chdir_resolves_relative_paths() {
        let (_disk, mgr) = format_and_mount(2048, FormatKind::Any, false);
        mgr.mkdir("/x").unwrap();
        mgr.chdir("/x").unwrap();
        mgr.open("y.txt", MODE_WRITE | MODE_CREATE_NEW)
            .unwrap()
            .close()
            .unwrap();
        assert!(mgr.stat("/x/y.txt").is_ok());
        assert!(mgr.stat("y.txt").is_ok());

        mgr.chdir("..").unwrap();
        assert!(mgr.stat("x/y.txt").is_ok());
        assert_eq!(mgr.chdir("/x/y.txt"), Err(Error::NoPath));

        // The current directory cannot be unlinked.
        mgr.chdir("/x").unwrap();
        assert_eq!(mgr.unlink("0:/x"), Err(Error::Denied));
        mgr.chdir("/").unwrap();
    }

    #[test]
    fn nt_case_hints_round_trip_without_lfn() {
        let (_disk, mgr) = format_and_mount(2048, FormatKind::Any, false);
        mgr.open("/lower.txt", MODE_WRITE | MODE_CREATE_NEW)
            .unwrap()
            .close()
            .unwrap();
        let info = mgr.stat("/lower.txt").unwrap();
        assert_eq!(info.name, "lower.txt");
        assert_eq!(info.alt_name, "LOWER.TXT");

        // Mixed case keeps its exact spelling through an LFN.
        mgr.open("/MixedCase.txt", MODE_WRITE | MODE_CREATE_NEW)
            .unwrap()
            .close()
            .unwrap();
        let info = mgr.stat("/mixedcase.TXT").unwrap();
        assert_eq!(info.name, "MixedCase.txt");
    }

    #[test]
    fn label_set_get_and_remove() {
        let (_disk, mgr) = format_and_mount(2048, FormatKind::Any, false);
        assert_eq!(mgr.get_label("0:").unwrap().0, "");
        mgr.set_label("0:", "MyVol").unwrap();
        assert_eq!(mgr.get_label("0:").unwrap().0, "MYVOL");

        // The label is not visible through readdir.
        let mut dir = mgr.opendir("/").unwrap();
        assert!(dir.read().unwrap().is_none());
        drop(dir);

        mgr.set_label("0:", "").unwrap();
        assert_eq!(mgr.get_label("0:").unwrap().0, "");
        assert_eq!(mgr.set_label("0:", "BAD.DOT"), Err(Error::InvalidName));
    }

    #[test]
    fn stale_handles_fail_after_unmount() {
        let disk = RamDisk::new(2048, 512);
        let dev: Arc<dyn BlockDevice> = disk.clone();
        mkfs(
            &dev,
            &FormatOptions {
                create_mbr: false,
                ..FormatOptions::default()
            },
        )
        .unwrap();
        let mut mgr = VolumeManager::new();
        mgr.mount(0, dev.clone(), 0).unwrap();

        let mut f = mgr
            .open("/stale.txt", MODE_WRITE | MODE_CREATE_NEW)
            .unwrap();
        f.write(b"x").unwrap();
        f.sync().unwrap();
        mgr.unmount(0).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(f.seek(0), Err(Error::InvalidObject));
        assert_eq!(f.read(&mut buf), Err(Error::InvalidObject));

        // Remount sees the synced file; the old handle stays dead.
        mgr.mount(0, dev, 0).unwrap();
        assert_eq!(mgr.stat("/stale.txt").unwrap().size, 1);
        assert_eq!(f.read(&mut buf), Err(Error::InvalidObject));
    }

    #[test]
    fn fsinfo_hints_persist_across_remount() {
        let disk = RamDisk::new(131072, 512);
        let dev: Arc<dyn BlockDevice> = disk.clone();
        mkfs(
            &dev,
            &FormatOptions {
                kind: FormatKind::Fat32,
                create_mbr: false,
                ..FormatOptions::default()
            },
        )
        .unwrap();
        let mut mgr = VolumeManager::new();
        mgr.mount(0, dev.clone(), 0).unwrap();

        let (free0, total) = mgr.getfree("0:").unwrap();
        let mut f = mgr.open("/grow.bin", MODE_WRITE | MODE_CREATE_NEW).unwrap();
        f.write(&vec![3u8; 4096]).unwrap();
        f.close().unwrap();
        let (free1, _) = mgr.getfree("0:").unwrap();
        assert!(free1 < free0);
        mgr.unmount(0).unwrap();

        // The remount reads the maintained FSInfo instead of rescanning.
        mgr.mount(0, dev, 0).unwrap();
        let vol = vol_of(&mgr);
        assert_eq!(vol.write().free_clusters().unwrap(), free1);
        assert_eq!(vol.read().total_clusters(), total);
    }
}
