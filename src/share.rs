//! Process-wide open-object sharing control.
//!
//! Open objects are identified by the volume's mount id plus the start
//! cluster of the containing directory and the entry offset inside it.
//! The counter of an entry is the number of readers, or the writer mark
//! `0x100` for an exclusive open; unlink and rename additionally demand
//! that no handle at all refers to the object.
//!
//! The table is shared by every volume so that cross-volume operations
//! observe each other. The original engine left this table unguarded and
//! documented the resulting race for multi-volume builds; here the whole
//! table sits behind one global lock instead.

use lazy_static::lazy_static;
use spin::Mutex;

use crate::{Error, Result, MAX_OPEN_SHARES};

const WRITER: u16 = 0x100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    /// Open for reading: shared with other readers.
    Read,
    /// Open for writing: requires no other opens.
    Write,
    /// Unlink/rename: requires no opens, creates no entry.
    Exclusive,
}

#[derive(Debug, Clone, Copy)]
struct ShareEntry {
    /// 0 marks a free slot; mount ids start at 1.
    fsid: u32,
    dir_clust: u32,
    entry_ofs: u32,
    ctr: u16,
}

const EMPTY: ShareEntry = ShareEntry {
    fsid: 0,
    dir_clust: 0,
    entry_ofs: 0,
    ctr: 0,
};

lazy_static! {
    static ref SHARES: Mutex<[ShareEntry; MAX_OPEN_SHARES]> = Mutex::new([EMPTY; MAX_OPEN_SHARES]);
}

fn find(table: &[ShareEntry], fsid: u32, dir_clust: u32, entry_ofs: u32) -> Option<usize> {
    table
        .iter()
        .position(|e| e.fsid == fsid && e.dir_clust == dir_clust && e.entry_ofs == entry_ofs)
}

/// Check whether the object can be accessed in the requested mode.
pub(crate) fn check(fsid: u32, dir_clust: u32, entry_ofs: u32, acc: Access) -> Result<()> {
    let table = SHARES.lock();
    match find(&*table, fsid, dir_clust, entry_ofs) {
        None => {
            // Opening a new object needs a free slot; exclusivity checks
            // of unopened objects always pass.
            if acc != Access::Exclusive && !table.iter().any(|e| e.fsid == 0) {
                Err(Error::TooManyOpenFiles)
            } else {
                Ok(())
            }
        }
        Some(i) => {
            if acc == Access::Read && table[i].ctr != WRITER {
                Ok(())
            } else {
                Err(Error::Locked)
            }
        }
    }
}

/// Check that a slot is available for a new object without taking it.
pub(crate) fn ensure_slot() -> Result<()> {
    let table = SHARES.lock();
    if table.iter().any(|e| e.fsid == 0) {
        Ok(())
    } else {
        Err(Error::TooManyOpenFiles)
    }
}

/// Register an open of the object, returning the slot index.
pub(crate) fn acquire(fsid: u32, dir_clust: u32, entry_ofs: u32, write: bool) -> Result<usize> {
    let mut table = SHARES.lock();
    let i = match find(&*table, fsid, dir_clust, entry_ofs) {
        Some(i) => i,
        None => {
            let i = table
                .iter()
                .position(|e| e.fsid == 0)
                .ok_or(Error::TooManyOpenFiles)?;
            table[i] = ShareEntry {
                fsid,
                dir_clust,
                entry_ofs,
                ctr: 0,
            };
            i
        }
    };
    if write {
        if table[i].ctr != 0 {
            return Err(Error::Locked);
        }
        table[i].ctr = WRITER;
    } else {
        if table[i].ctr == WRITER {
            return Err(Error::Locked);
        }
        if table[i].ctr == WRITER - 1 {
            return Err(Error::TooManyOpenFiles);
        }
        table[i].ctr += 1;
    }
    Ok(i)
}

/// Drop one open of the slot; the slot is freed when the count hits zero.
/// `fsid` guards against stale handles whose slot was purged and reused.
pub(crate) fn release(idx: usize, fsid: u32) {
    let mut table = SHARES.lock();
    if idx >= table.len() || table[idx].fsid != fsid {
        return;
    }
    let e = &mut table[idx];
    e.ctr = match e.ctr {
        WRITER => 0,
        0 => 0,
        n => n - 1,
    };
    if e.ctr == 0 {
        *e = EMPTY;
    }
}

/// Forget every entry of a volume, used on unmount.
pub(crate) fn purge_volume(fsid: u32) {
    let mut table = SHARES.lock();
    for e in table.iter_mut() {
        if e.fsid == fsid {
            *e = EMPTY;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The table is process-global; tests use distinct fsids to stay
    // independent of each other and of the integration suite.

    #[test]
    fn readers_share_and_writers_exclude() {
        let fsid = 0xF000_0001;
        let a = acquire(fsid, 2, 64, false).unwrap();
        let b = acquire(fsid, 2, 64, false).unwrap();
        assert_eq!(a, b, "same object shares one slot");
        assert_eq!(acquire(fsid, 2, 64, true), Err(Error::Locked));
        release(a, fsid);
        assert_eq!(acquire(fsid, 2, 64, true), Err(Error::Locked));
        release(b, fsid);
        let w = acquire(fsid, 2, 64, true).unwrap();
        assert_eq!(acquire(fsid, 2, 64, false), Err(Error::Locked));
        release(w, fsid);
    }

    #[test]
    fn exclusive_check_rejects_any_open() {
        let fsid = 0xF000_0002;
        assert!(check(fsid, 5, 0, Access::Exclusive).is_ok());
        let r = acquire(fsid, 5, 0, false).unwrap();
        assert_eq!(check(fsid, 5, 0, Access::Exclusive), Err(Error::Locked));
        assert_eq!(check(fsid, 5, 0, Access::Write), Err(Error::Locked));
        assert!(check(fsid, 5, 0, Access::Read).is_ok());
        release(r, fsid);
        assert!(check(fsid, 5, 0, Access::Exclusive).is_ok());
    }

    #[test]
    fn purge_drops_only_the_given_volume() {
        let a = 0xF000_0003;
        let b = 0xF000_0004;
        let ia = acquire(a, 2, 0, false).unwrap();
        let ib = acquire(b, 2, 0, false).unwrap();
        purge_volume(a);
        // Slot of `a` is reusable, slot of `b` still counted.
        assert_eq!(acquire(b, 2, 0, true), Err(Error::Locked));
        release(ia, a); // stale release of a purged slot is a no-op
        release(ib, b);
        purge_volume(b);
    }
}
