//! Path resolution.
//!
//! Paths may carry a `N:` drive prefix (N a decimal number) and use `/`
//! and `\` interchangeably. A leading separator anchors resolution at the
//! root directory; everything else starts at the volume's current
//! directory. The empty remainder names the origin directory itself.
//!
//! `.` and `..` are resolved structurally: `.` stays, `..` follows the
//! on-disk dot-dot entry of the current directory (whose cluster number 0
//! denotes the root); `..` at the root stays at the root.

use alloc::string::String;

use crate::dir::DirCursor;
use crate::entry::ShortDirEntry;
use crate::fs::FatVolume;
use crate::name::{self, SegName, NS_DOT};
use crate::{Error, Result, SPACE};

pub(crate) fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// Split an optional `N:` drive prefix off a path.
pub(crate) fn split_drive(path: &str) -> Result<(Option<usize>, &str)> {
    let bytes = path.as_bytes();
    let mut i = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i > 0 && i < bytes.len() && bytes[i] == b':' {
        let n = path[..i].parse::<usize>().map_err(|_| Error::InvalidDrive)?;
        return Ok((Some(n), &path[i + 1..]));
    }
    // A colon anywhere else cannot be part of a FAT name.
    Ok((None, path))
}

/// What a path resolved to.
pub(crate) enum Located {
    /// The path named the origin directory itself (root or cwd).
    Origin,
    /// The final segment exists; the cursor sits on its short entry.
    Found(ShortDirEntry),
    /// Every parent exists but the final segment does not; the cursor is
    /// rewound into the parent, ready for `dir_register`.
    NotFound(SegName),
}

impl FatVolume {
    /// Walk `path` from the root or the current directory.
    ///
    /// `dp.sclust` ends at the containing directory of the result, which
    /// together with `dp.dptr` forms the identity open files are keyed by.
    pub(crate) fn follow_path(&mut self, dp: &mut DirCursor, path: &str) -> Result<Located> {
        let mut rest = path;
        if rest.starts_with(is_separator) {
            rest = rest.trim_start_matches(is_separator);
            dp.sclust = 0;
        } else {
            dp.sclust = self.cwd;
        }

        if rest.is_empty() {
            self.dir_seek(dp, 0)?;
            return Ok(Located::Origin);
        }

        loop {
            let (seg, remaining) = next_segment(rest);
            let name = name::create_name(seg, remaining.is_empty())?;

            if name.flags & NS_DOT != 0 {
                if name.sfn[1] == b'.' {
                    self.ascend(dp)?;
                } // a single dot stays where it is
                if name.is_last() {
                    self.dir_seek(dp, 0)?;
                    return Ok(Located::Origin);
                }
                rest = remaining;
                continue;
            }

            match self.dir_find(dp, &name) {
                Ok(sde) => {
                    if name.is_last() {
                        return Ok(Located::Found(sde));
                    }
                    if !sde.is_dir() {
                        return Err(Error::NoPath);
                    }
                    dp.sclust = sde.first_cluster(self.fat_type == crate::FatType::Fat32);
                }
                Err(Error::NoFile) => {
                    return if name.is_last() {
                        Ok(Located::NotFound(name))
                    } else {
                        Err(Error::NoPath)
                    };
                }
                Err(e) => return Err(e),
            }
            rest = remaining;
        }
    }

    /// Move `dp` to the parent of its current directory via the on-disk
    /// dot-dot entry.
    pub(crate) fn ascend(&mut self, dp: &mut DirCursor) -> Result<()> {
        if dp.sclust == 0 {
            return Ok(()); // the root is its own parent
        }
        let mut dotdot = [SPACE; 11];
        dotdot[0] = b'.';
        dotdot[1] = b'.';
        let probe = SegName {
            sfn: dotdot,
            flags: crate::name::NS_NOLFN,
            lfn: alloc::vec::Vec::new(),
        };
        let sde = self.dir_find(dp, &probe).map_err(|e| match e {
            Error::NoFile => Error::IntErr, // every subdirectory stores ".."
            other => other,
        })?;
        dp.sclust = sde.first_cluster(self.fat_type == crate::FatType::Fat32);
        Ok(())
    }

    /// Rebuild the absolute (volume-relative) path of the current
    /// directory by walking dot-dot entries back to the root and looking
    /// each directory up by start cluster in its parent.
    pub(crate) fn getcwd_inner(&mut self) -> Result<String> {
        let fat32 = self.fat_type == crate::FatType::Fat32;
        let mut path = String::new();
        let mut ccl = self.cwd;
        while ccl != 0 {
            let mut dp = DirCursor::new(ccl);
            self.ascend(&mut dp)?;
            let pcl = dp.sclust;

            let mut scan = DirCursor::new(pcl);
            self.dir_seek(&mut scan, 0)?;
            loop {
                // Running off the parent's table means the child is not
                // listed in it, which no consistent volume allows.
                let (sde, lfn) = self.dir_read_entry(&mut scan, false).map_err(|e| match e {
                    Error::NoFile => Error::IntErr,
                    other => other,
                })?;
                if sde.is_dir() && sde.name[0] != b'.' && sde.first_cluster(fat32) == ccl {
                    let info = self.fileinfo(&sde, lfn);
                    path.insert(0, '/');
                    path.insert_str(1, &info.name);
                    break;
                }
                self.dir_next(&mut scan, false).map_err(|e| match e {
                    Error::NoFile => Error::IntErr,
                    other => other,
                })?;
            }
            ccl = pcl;
        }
        if path.is_empty() {
            path.push('/');
        }
        Ok(path)
    }
}

/// First segment of `rest` and the remainder with separators stripped.
fn next_segment(rest: &str) -> (&str, &str) {
    match rest.find(is_separator) {
        Some(pos) => {
            let seg = &rest[..pos];
            let remaining = rest[pos..].trim_start_matches(is_separator);
            (seg, remaining)
        }
        None => (rest, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_prefixes_are_split() {
        assert_eq!(split_drive("0:/a/b").unwrap(), (Some(0), "/a/b"));
        assert_eq!(split_drive("12:x").unwrap(), (Some(12), "x"));
        assert_eq!(split_drive("/plain").unwrap(), (None, "/plain"));
        assert_eq!(split_drive("name.txt").unwrap(), (None, "name.txt"));
    }

    #[test]
    fn segments_split_on_both_separators() {
        assert_eq!(next_segment("a/b/c"), ("a", "b/c"));
        assert_eq!(next_segment("a\\b"), ("a", "b"));
        assert_eq!(next_segment("a//b"), ("a", "b"));
        assert_eq!(next_segment("leaf"), ("leaf", ""));
        assert_eq!(next_segment("dir/"), ("dir", ""));
    }
}
