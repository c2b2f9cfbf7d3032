//! Open file handles.
//!
//! A handle keeps its own sector-sized buffer for partial-sector
//! transfers; whole sectors move directly between the caller's buffer and
//! the device. The handle tracks the cluster containing the file pointer
//! so sequential access never rewalks the chain, and it remembers the
//! location of its directory entry so `sync` can write back size, start
//! cluster and timestamps.
//!
//! Error latch: once an operation on a handle fails with a disk or
//! structural error, the error is stored and every following operation
//! short-circuits with it until the handle is closed (or the latch is
//! cleared after a partial-write condition was observed).

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::RwLock;

use crate::fs::FatVolume;
use crate::share;
use crate::{Error, Result, ATTR_ARCHIVE};

pub const MODE_READ: u8 = 0x01;
pub const MODE_WRITE: u8 = 0x02;
/// Fail with `Exist` if the object is already there.
pub const MODE_CREATE_NEW: u8 = 0x04;
/// Create or truncate.
pub const MODE_CREATE_ALWAYS: u8 = 0x08;
/// Create if missing, open otherwise.
pub const MODE_OPEN_ALWAYS: u8 = 0x10;
/// Open (creating if missing) and continue at end of file.
pub const MODE_APPEND: u8 = 0x30;

pub(crate) const SEEK_END_BIT: u8 = 0x20;

/// Everything `FatVolume::open_inner` resolves about the object; the
/// public handle adds the volume reference on top.
pub(crate) struct FileState {
    pub flags: u8,
    pub dir_sclust: u32,
    pub dir_dptr: u32,
    pub start_cluster: u32,
    pub size: u32,
    pub share: usize,
}

pub struct File {
    pub(crate) fs: Arc<RwLock<FatVolume>>,
    pub(crate) fsid: u32,
    flags: u8,
    err: Option<Error>,
    /// Location of the short entry: containing directory + entry offset.
    dir_sclust: u32,
    dir_dptr: u32,
    start_cluster: u32,
    /// Cluster holding the file pointer (lags one cluster when the
    /// pointer sits exactly on a cluster boundary).
    cluster: u32,
    /// Sector resident in `buf`; 0 = nothing buffered.
    sector: u64,
    buf: Vec<u8>,
    buf_dirty: bool,
    fptr: u32,
    size: u32,
    modified: bool,
    share: Option<usize>,
}

impl File {
    pub(crate) fn new(fs: Arc<RwLock<FatVolume>>, fsid: u32, st: FileState, ss: usize) -> Self {
        File {
            fs,
            fsid,
            flags: st.flags,
            err: None,
            dir_sclust: st.dir_sclust,
            dir_dptr: st.dir_dptr,
            start_cluster: st.start_cluster,
            cluster: 0,
            sector: 0,
            buf: vec![0u8; ss],
            buf_dirty: false,
            fptr: 0,
            size: st.size,
            modified: false,
            share: Some(st.share),
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn tell(&self) -> u32 {
        self.fptr
    }

    pub fn is_eof(&self) -> bool {
        self.fptr >= self.size
    }

    /// Error latched by a previous failed operation, if any.
    pub fn last_error(&self) -> Option<Error> {
        self.err
    }

    pub fn clear_error(&mut self) {
        self.err = None;
    }

    fn check(&self, vol: &FatVolume) -> Result<()> {
        if vol.fsid != self.fsid {
            return Err(Error::InvalidObject);
        }
        if let Some(e) = self.err {
            return Err(e);
        }
        Ok(())
    }

    fn latch(&mut self, e: Error) -> Error {
        self.err = Some(e);
        e
    }

    /// Read up to `buf.len()` bytes at the file pointer. Short counts
    /// happen only at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let fs = self.fs.clone();
        let mut vol = fs.write();
        self.check(&vol)?;
        if self.flags & MODE_READ == 0 {
            return Err(Error::Denied);
        }
        let remain = (self.size - self.fptr) as usize;
        let btr = buf.len().min(remain);
        let ss = self.buf.len();
        let mut rd = 0usize;

        while rd < btr {
            if self.fptr as usize % ss == 0 {
                let csect = (self.fptr as usize / ss) % vol.csize as usize;
                if csect == 0 {
                    let clst = if self.fptr == 0 {
                        self.start_cluster
                    } else {
                        match vol.next_cluster(self.cluster) {
                            Ok(Some(n)) => n,
                            Ok(None) => return Err(self.latch(Error::IntErr)),
                            Err(e) => return Err(self.latch(e)),
                        }
                    };
                    if clst < 2 {
                        return Err(self.latch(Error::IntErr));
                    }
                    self.cluster = clst;
                }
                let sect = match vol.cluster_to_sector(self.cluster) {
                    Some(s) => s + csect as u64,
                    None => return Err(self.latch(Error::IntErr)),
                };
                let mut cc = (btr - rd) / ss;
                if cc > 0 {
                    // Whole sectors go straight to the caller's buffer.
                    if csect + cc > vol.csize as usize {
                        cc = vol.csize as usize - csect;
                    }
                    if vol
                        .device
                        .read_blocks(&mut buf[rd..rd + cc * ss], sect, cc)
                        .is_err()
                    {
                        return Err(self.latch(Error::DiskErr));
                    }
                    // The buffered sector may be newer than the medium.
                    if self.buf_dirty && self.sector >= sect && self.sector - sect < cc as u64 {
                        let o = (self.sector - sect) as usize * ss;
                        buf[rd + o..rd + o + ss].copy_from_slice(&self.buf);
                    }
                    let n = cc * ss;
                    rd += n;
                    self.fptr += n as u32;
                    continue;
                }
                if self.sector != sect {
                    if self.buf_dirty {
                        if vol.device.write_blocks(&self.buf, self.sector, 1).is_err() {
                            return Err(self.latch(Error::DiskErr));
                        }
                        self.buf_dirty = false;
                    }
                    if vol.device.read_blocks(&mut self.buf, sect, 1).is_err() {
                        return Err(self.latch(Error::DiskErr));
                    }
                    self.sector = sect;
                }
            }
            let off = self.fptr as usize % ss;
            let rcnt = (ss - off).min(btr - rd);
            buf[rd..rd + rcnt].copy_from_slice(&self.buf[off..off + rcnt]);
            rd += rcnt;
            self.fptr += rcnt as u32;
        }
        Ok(rd)
    }

    /// Write `buf` at the file pointer, extending the chain as needed.
    ///
    /// When the volume fills mid-write the short count is returned and
    /// `NoSpaceLeft` is latched into the handle; `sync` may still be
    /// retried to persist what was written.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let fs = self.fs.clone();
        let mut vol = fs.write();
        self.check(&vol)?;
        if self.flags & MODE_WRITE == 0 {
            return Err(Error::Denied);
        }
        let ss = self.buf.len();
        let btw = buf.len();
        let mut wr = 0usize;

        while wr < btw {
            if self.fptr as usize % ss == 0 {
                let csect = (self.fptr as usize / ss) % vol.csize as usize;
                if csect == 0 {
                    let res = if self.fptr == 0 {
                        if self.start_cluster == 0 {
                            vol.create_chain(0).map(|c| {
                                self.start_cluster = c;
                                c
                            })
                        } else {
                            Ok(self.start_cluster)
                        }
                    } else {
                        vol.create_chain(self.cluster)
                    };
                    match res {
                        Ok(c) => self.cluster = c,
                        Err(Error::NoSpaceLeft) => {
                            self.err = Some(Error::NoSpaceLeft);
                            break;
                        }
                        Err(e) => return Err(self.latch(e)),
                    }
                }
                let sect = match vol.cluster_to_sector(self.cluster) {
                    Some(s) => s + csect as u64,
                    None => return Err(self.latch(Error::IntErr)),
                };
                let mut cc = (btw - wr) / ss;
                if cc > 0 {
                    if csect + cc > vol.csize as usize {
                        cc = vol.csize as usize - csect;
                    }
                    if vol
                        .device
                        .write_blocks(&buf[wr..wr + cc * ss], sect, cc)
                        .is_err()
                    {
                        return Err(self.latch(Error::DiskErr));
                    }
                    // Keep the sector cache coherent with the burst.
                    if self.sector >= sect && self.sector - sect < cc as u64 {
                        let o = (self.sector - sect) as usize * ss;
                        self.buf.copy_from_slice(&buf[wr + o..wr + o + ss]);
                        self.buf_dirty = false;
                    }
                    let n = cc * ss;
                    wr += n;
                    self.fptr += n as u32;
                    continue;
                }
                if self.sector != sect {
                    if self.buf_dirty {
                        if vol.device.write_blocks(&self.buf, self.sector, 1).is_err() {
                            return Err(self.latch(Error::DiskErr));
                        }
                        self.buf_dirty = false;
                    }
                    if self.fptr < self.size {
                        if vol.device.read_blocks(&mut self.buf, sect, 1).is_err() {
                            return Err(self.latch(Error::DiskErr));
                        }
                    } else {
                        // Appending: nothing valid on the medium yet.
                        self.buf.fill(0);
                    }
                    self.sector = sect;
                }
            }
            let off = self.fptr as usize % ss;
            let wcnt = (ss - off).min(btw - wr);
            self.buf[off..off + wcnt].copy_from_slice(&buf[wr..wr + wcnt]);
            self.buf_dirty = true;
            wr += wcnt;
            self.fptr += wcnt as u32;
        }

        if wr > 0 {
            self.modified = true;
            if self.fptr > self.size {
                self.size = self.fptr;
            }
        }
        Ok(wr)
    }

    /// Move the file pointer. Seeking past the end in write mode extends
    /// the file with zero-filled clusters; read-only handles are clamped
    /// to the file size.
    pub fn seek(&mut self, ofs: u32) -> Result<()> {
        let fs = self.fs.clone();
        let mut vol = fs.write();
        self.check(&vol)?;

        let mut ofs = ofs;
        if ofs > self.size && self.flags & MODE_WRITE == 0 {
            ofs = self.size;
        }
        let ifptr = self.fptr;
        let bcs = vol.cluster_bytes();
        let ss = self.buf.len();
        self.fptr = 0;
        let mut nsect = 0u64;

        if ofs > 0 {
            let mut clst;
            let mut rem = ofs;
            if ifptr > 0 && (ofs - 1) / bcs >= (ifptr - 1) / bcs {
                // Same or later cluster: resume from the current one.
                self.fptr = (ifptr - 1) & !(bcs - 1);
                rem = ofs - self.fptr;
                clst = self.cluster;
            } else {
                clst = self.start_cluster;
                if clst == 0 {
                    if self.flags & MODE_WRITE == 0 {
                        return Err(self.latch(Error::IntErr));
                    }
                    match vol.create_chain(0) {
                        Ok(c) => {
                            if vol.dir_clear(c).is_err() {
                                return Err(self.latch(Error::DiskErr));
                            }
                            self.start_cluster = c;
                            self.modified = true;
                            clst = c;
                        }
                        Err(Error::NoSpaceLeft) => {
                            self.err = Some(Error::NoSpaceLeft);
                            return Ok(());
                        }
                        Err(e) => return Err(self.latch(e)),
                    }
                }
                self.cluster = clst;
            }
            while rem > bcs {
                rem -= bcs;
                self.fptr += bcs;
                if self.flags & MODE_WRITE != 0 {
                    match vol.create_chain(clst) {
                        Ok(c) => {
                            if self.fptr >= self.size && vol.dir_clear(c).is_err() {
                                return Err(self.latch(Error::DiskErr));
                            }
                            clst = c;
                        }
                        Err(Error::NoSpaceLeft) => {
                            // Disk full: clip the seek at what exists.
                            self.err = Some(Error::NoSpaceLeft);
                            rem = 0;
                            break;
                        }
                        Err(e) => return Err(self.latch(e)),
                    }
                } else {
                    match vol.next_cluster(clst) {
                        Ok(Some(n)) => clst = n,
                        Ok(None) => return Err(self.latch(Error::IntErr)),
                        Err(e) => return Err(self.latch(e)),
                    }
                }
                self.cluster = clst;
            }
            self.fptr += rem;
            if rem as usize % ss != 0 {
                nsect = match vol.cluster_to_sector(clst) {
                    Some(s) => s + (rem as usize / ss) as u64,
                    None => return Err(self.latch(Error::IntErr)),
                };
            }
        }

        if self.fptr > self.size {
            self.size = self.fptr;
            self.modified = true;
        }
        if self.fptr as usize % ss != 0 && nsect != self.sector {
            if self.buf_dirty {
                if vol.device.write_blocks(&self.buf, self.sector, 1).is_err() {
                    return Err(self.latch(Error::DiskErr));
                }
                self.buf_dirty = false;
            }
            if vol.device.read_blocks(&mut self.buf, nsect, 1).is_err() {
                return Err(self.latch(Error::DiskErr));
            }
            self.sector = nsect;
        }
        Ok(())
    }

    /// Cut the file off at the current file pointer.
    pub fn truncate(&mut self) -> Result<()> {
        let fs = self.fs.clone();
        let mut vol = fs.write();
        self.check(&vol)?;
        if self.flags & MODE_WRITE == 0 {
            return Err(Error::Denied);
        }
        if self.fptr >= self.size {
            return Ok(());
        }

        if self.fptr == 0 {
            if self.start_cluster != 0 {
                if let Err(e) = vol.remove_chain(self.start_cluster, 0) {
                    return Err(self.latch(e));
                }
                self.start_cluster = 0;
            }
        } else {
            match vol.next_cluster(self.cluster) {
                Ok(Some(n)) => {
                    if let Err(e) = vol.remove_chain(n, self.cluster) {
                        return Err(self.latch(e));
                    }
                }
                Ok(None) => {}
                Err(e) => return Err(self.latch(e)),
            }
        }
        self.size = self.fptr;
        self.modified = true;
        Ok(())
    }

    /// Flush buffered data and write the directory entry back.
    pub fn sync(&mut self) -> Result<()> {
        let fs = self.fs.clone();
        let mut vol = fs.write();
        if vol.fsid != self.fsid {
            return Err(Error::InvalidObject);
        }
        // A latched NoSpaceLeft does not block persisting what was
        // written; other latched errors do.
        match self.err {
            None | Some(Error::NoSpaceLeft) => {}
            Some(e) => return Err(e),
        }
        if !self.modified {
            return Ok(());
        }
        if self.buf_dirty {
            if vol.device.write_blocks(&self.buf, self.sector, 1).is_err() {
                return Err(self.latch(Error::DiskErr));
            }
            self.buf_dirty = false;
        }
        let now = vol.time.now();
        let fat32 = vol.fat_type == crate::FatType::Fat32;
        let mut dp = crate::dir::DirCursor::new(self.dir_sclust);
        let dptr = self.dir_dptr;
        let start = self.start_cluster;
        let size = self.size;
        if let Err(e) = vol.dir_seek(&mut dp, dptr) {
            return Err(self.latch(e));
        }
        let res = vol.dir_entry_update(&dp, |b| {
            let mut sde = crate::entry::ShortDirEntry::from_bytes(b);
            sde.attr |= ATTR_ARCHIVE;
            sde.set_first_cluster(start, fat32);
            sde.file_size = size;
            sde.set_modified(now);
            sde.write_to(b);
        });
        if let Err(e) = res {
            return Err(self.latch(e));
        }
        if let Err(e) = vol.sync_fs() {
            return Err(self.latch(e));
        }
        self.modified = false;
        Ok(())
    }

    /// Sync and release the handle's sharing slot.
    pub fn close(mut self) -> Result<()> {
        let res = if self.modified { self.sync() } else { Ok(()) };
        self.release_share();
        // Drop still runs but has nothing left to do.
        self.modified = false;
        res
    }

    fn release_share(&mut self) {
        if let Some(idx) = self.share.take() {
            share::release(idx, self.fsid);
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if self.modified {
            let _ = self.sync();
        }
        self.release_share();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::RamDisk;
    use crate::device::BlockDevice;
    use crate::fs::{mkfs, FormatOptions};

    // A 512-sector FAT12 volume with one-sector clusters.
    fn volume() -> Arc<RwLock<FatVolume>> {
        let disk = RamDisk::new(512, 512);
        let dev: Arc<dyn BlockDevice> = disk;
        mkfs(
            &dev,
            &FormatOptions {
                create_mbr: false,
                ..FormatOptions::default()
            },
        )
        .unwrap();
        FatVolume::mount(dev, 0).unwrap()
    }

    fn open_new(arc: &Arc<RwLock<FatVolume>>, path: &str) -> File {
        let (state, fsid, ss) = {
            let mut v = arc.write();
            let st = v
                .open_inner(path, MODE_READ | MODE_WRITE | MODE_CREATE_NEW)
                .unwrap();
            (st, v.fsid, v.sector_size)
        };
        File::new(arc.clone(), fsid, state, ss)
    }

    #[test]
    fn burst_write_patches_the_buffered_sector() {
        let vol = volume();
        let mut f = open_new(&vol, "/patch.bin");
        // Leave a dirty partial sector in the handle's buffer, then
        // overwrite the same sector with a whole-sector burst.
        f.write(&[0xAA; 10]).unwrap();
        f.seek(0).unwrap();
        assert_eq!(f.write(&[0xBB; 512]).unwrap(), 512);

        // A partial read of that sector is served from the buffer, which
        // must reflect the burst, not the stale bytes.
        f.seek(2).unwrap();
        let mut back = [0u8; 4];
        assert_eq!(f.read(&mut back).unwrap(), 4);
        assert_eq!(back, [0xBB; 4]);
        assert_eq!(f.size(), 512);
    }

    #[test]
    fn burst_read_sees_the_unflushed_buffer() {
        let vol = volume();
        let mut f = open_new(&vol, "/overlay.bin");
        f.write(&[0xCC; 512]).unwrap();
        f.seek(0).unwrap();
        // Dirty the first sector in the buffer without flushing it.
        f.write(&[0xDD; 10]).unwrap();
        f.seek(0).unwrap();

        // The whole-sector read comes from the medium, which still holds
        // the old bytes; the dirty buffer must be laid over the result.
        let mut back = [0u8; 512];
        assert_eq!(f.read(&mut back).unwrap(), 512);
        assert!(back[..10].iter().all(|&b| b == 0xDD));
        assert!(back[10..].iter().all(|&b| b == 0xCC));
    }

    #[test]
    fn seek_extension_clips_on_a_full_volume() {
        let vol = volume();
        let capacity = {
            let v = vol.read();
            v.total_clusters() * v.cluster_bytes()
        };
        let mut f = open_new(&vol, "/fill.bin");
        f.seek(capacity + 4096).unwrap();
        assert_eq!(f.last_error(), Some(Error::NoSpaceLeft));
        assert_eq!(f.tell(), capacity, "clipped at what could be allocated");
        assert_eq!(f.size(), f.tell());

        // The latch holds until it is cleared.
        let mut buf = [0u8; 4];
        assert_eq!(f.read(&mut buf), Err(Error::NoSpaceLeft));
        f.clear_error();
        f.seek(0).unwrap();
        assert_eq!(f.read(&mut buf).unwrap(), 4);
        assert_eq!(buf, [0u8; 4], "extension clusters are zero-filled");
    }
}
