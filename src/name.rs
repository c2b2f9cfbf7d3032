//! File name handling: path segments, 8.3 short names and long names.
//!
//! Parsing a segment yields both representations at once: the long name as
//! UTF-16 units and a candidate short name in directory form (11 bytes,
//! space padded, uppercase), plus a status byte describing what happened
//! on the way. A lossy conversion (dropped spaces, replaced characters,
//! field overflow) or a case mix inside one field forces a long-name
//! chain; a name whose body or extension is uniformly lowercase can
//! round-trip through the two NT hint bits with no LFN at all.
//!
//! Short names store no case and no embedded spaces. The characters
//! `" * : < > ? |` and controls are rejected outright; `+ , ; = [ ]` are
//! legal in long names only and are replaced by `_` in the short form.

use alloc::string::String;
use alloc::vec::Vec;

use crate::entry::{LongDirEntry, NT_BODY_LOWER, NT_EXT_LOWER};
use crate::{Error, Result, DIR_ENTRY_DELETED, DIR_ENTRY_KANJI, MAX_LFN, SPACE};

/// Name status flags, kept alongside the 11-byte short name.
pub(crate) const NS_LOSS: u8 = 0x01; // out of 8.3 format
pub(crate) const NS_LFN: u8 = 0x02; // an LFN chain must be created
pub(crate) const NS_LAST: u8 = 0x04; // last segment of the path
pub(crate) const NS_BODY: u8 = 0x08; // body is uniformly lowercase
pub(crate) const NS_EXT: u8 = 0x10; // extension is uniformly lowercase
pub(crate) const NS_DOT: u8 = 0x20; // dot entry (`.` or `..`)
pub(crate) const NS_NOLFN: u8 = 0x40; // match against the short name only

/// A parsed path segment: SFN in directory form, status flags and the
/// long name as UTF-16 units (no terminator).
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SegName {
    pub sfn: [u8; 11],
    pub flags: u8,
    pub lfn: Vec<u16>,
}

impl SegName {
    /// Whether this is the terminal segment of its path.
    pub(crate) fn is_last(&self) -> bool {
        self.flags & NS_LAST != 0
    }

    /// Number of LFN fragments this name needs on disk.
    pub(crate) fn lfn_entries(&self) -> u32 {
        ((self.lfn.len() + 12) / 13) as u32
    }
}

/// Parse one path segment (no separators) into [`SegName`].
pub(crate) fn create_name(segment: &str, last: bool) -> Result<SegName> {
    let mut cf: u8 = if last { NS_LAST } else { 0 };

    if segment == "." || segment == ".." {
        let mut sfn = [SPACE; 11];
        sfn[0] = b'.';
        if segment == ".." {
            sfn[1] = b'.';
        }
        return Ok(SegName {
            sfn,
            flags: cf | NS_DOT,
            lfn: Vec::new(),
        });
    }

    let mut lfn: Vec<u16> = Vec::with_capacity(segment.len());
    for wc in segment.encode_utf16() {
        if wc < 0x20 {
            return Err(Error::InvalidName);
        }
        if wc < 0x80 && matches!(wc as u8, b'"' | b'*' | b':' | b'<' | b'>' | b'?' | b'|' | 0x7F) {
            return Err(Error::InvalidName);
        }
        if lfn.len() >= MAX_LFN {
            return Err(Error::InvalidName);
        }
        lfn.push(wc);
    }

    // Trailing spaces and dots cannot be stored and are snipped off.
    while let Some(&wc) = lfn.last() {
        if wc != SPACE as u16 && wc != b'.' as u16 {
            break;
        }
        lfn.pop();
    }
    if lfn.is_empty() {
        return Err(Error::InvalidName);
    }

    // Short name in directory form.
    let mut si = 0usize;
    while lfn[si] == SPACE as u16 {
        si += 1;
    }
    if si > 0 || lfn[si] == b'.' as u16 {
        cf |= NS_LOSS | NS_LFN;
    }
    // Position just past the last dot; 0 when there is no extension.
    let mut di = lfn.len();
    while di > 0 && lfn[di - 1] != b'.' as u16 {
        di -= 1;
    }

    let mut sfn = [SPACE; 11];
    let mut i = 0usize;
    let mut ni = 8usize;
    let mut b: u8 = 0;
    loop {
        if si >= lfn.len() {
            break;
        }
        let mut wc = lfn[si];
        si += 1;
        if wc == SPACE as u16 || (wc == b'.' as u16 && si != di) {
            // Embedded spaces and dots are dropped from the short form.
            cf |= NS_LOSS | NS_LFN;
            continue;
        }
        if i >= ni || si == di {
            if ni == 11 {
                cf |= NS_LOSS | NS_LFN;
                break;
            }
            if si != di {
                cf |= NS_LOSS | NS_LFN;
            }
            if si > di {
                break;
            }
            si = di;
            i = 8;
            ni = 11;
            b <<= 2;
            continue;
        }
        if wc >= 0x80 {
            // No OEM code page tables: anything outside ASCII needs the
            // long name and loses its short-form character.
            cf |= NS_LFN | NS_LOSS;
            wc = b'_' as u16;
        } else {
            let c = wc as u8;
            if matches!(c, b'+' | b',' | b';' | b'=' | b'[' | b']') {
                wc = b'_' as u16;
                cf |= NS_LOSS | NS_LFN;
            } else {
                if c.is_ascii_uppercase() {
                    b |= 0x02;
                }
                if c.is_ascii_lowercase() {
                    b |= 0x01;
                    wc -= 0x20;
                }
            }
        }
        sfn[i] = wc as u8;
        i += 1;
    }
    if i == 0 {
        // Nothing usable reached the short form (e.g. a name of dots only).
        return Err(Error::InvalidName);
    }

    if sfn[0] == DIR_ENTRY_DELETED {
        sfn[0] = DIR_ENTRY_KANJI;
    }
    if ni == 8 {
        b <<= 2;
    }
    if b & 0x0C == 0x0C || b & 0x03 == 0x03 {
        // A case mix inside one field cannot round-trip via NT hints.
        cf |= NS_LFN;
    }
    if cf & NS_LFN == 0 {
        if b & 0x01 != 0 {
            cf |= NS_EXT;
        }
        if b & 0x04 != 0 {
            cf |= NS_BODY;
        }
    }

    Ok(SegName {
        sfn,
        flags: cf,
        lfn,
    })
}

/// Fold-and-add checksum over the 11 short-name bytes; every LFN fragment
/// of a chain carries it.
pub(crate) fn sfn_checksum(name: &[u8; 11]) -> u8 {
    let mut sum: u8 = 0;
    for &c in name {
        sum = (sum >> 1).wrapping_add(sum << 7).wrapping_add(c);
    }
    sum
}

/// Derive the numbered short name for collision `seq` (1-based).
///
/// Sequences above 5 switch from `~N` to `~` + a hash of the long name,
/// computed with a 16-bit feedback register (polynomial 0x11021), so that
/// heavily colliding directories do not degenerate into a linear probe
/// over the whole numbering space.
pub(crate) fn gen_numbered_sfn(src: &[u8; 11], lfn: &[u16], seq: u32) -> [u8; 11] {
    let mut dst = *src;
    let mut seq = seq;

    if seq > 5 {
        let mut sreg: u32 = seq;
        for &unit in lfn {
            let mut wc = unit;
            for _ in 0..16 {
                sreg = (sreg << 1) + (wc & 1) as u32;
                wc >>= 1;
                if sreg & 0x10000 != 0 {
                    sreg ^= 0x11021;
                }
            }
        }
        seq = sreg;
    }

    // Build the `~`-prefixed suffix, hexadecimal, right aligned.
    let mut ns = [0u8; 8];
    let mut i = 7usize;
    loop {
        let mut c = (seq % 16) as u8 + b'0';
        if c > b'9' {
            c += 7;
        }
        ns[i] = c;
        i -= 1;
        seq /= 16;
        if i == 0 || seq == 0 {
            break;
        }
    }
    ns[i] = b'~';

    // Append to the body, overwriting its tail.
    let mut j = 0usize;
    while j < i && dst[j] != SPACE {
        j += 1;
    }
    loop {
        dst[j] = if i < 8 {
            let v = ns[i];
            i += 1;
            v
        } else {
            SPACE
        };
        j += 1;
        if j >= 8 {
            break;
        }
    }
    dst
}

/// Uppercase fold used for long-name comparison. Surrogate halves are
/// compared as stored.
pub(crate) fn uni_upper(c: u16) -> u16 {
    if c < 0x80 {
        return (c as u8).to_ascii_uppercase() as u16;
    }
    match char::from_u32(c as u32) {
        Some(ch) => {
            let mut up = ch.to_uppercase();
            let first = up.next().unwrap_or(ch);
            if up.next().is_none() && (first as u32) <= 0xFFFF {
                first as u16
            } else {
                c
            }
        }
        None => c,
    }
}

/// The 13 units of fragment `idx` (0-based from the name start), with the
/// terminator and 0xFFFF fill applied.
pub(crate) fn lfn_chunk(lfn: &[u16], idx: usize) -> [u16; 13] {
    let mut out = [0xFFFFu16; 13];
    let base = idx * 13;
    for (k, slot) in out.iter_mut().enumerate() {
        let p = base + k;
        if p < lfn.len() {
            *slot = lfn[p];
        } else if p == lfn.len() {
            *slot = 0;
        } else {
            break;
        }
    }
    out
}

/// Compare one stored LFN fragment against the candidate name.
pub(crate) fn fragment_matches(candidate: &[u16], lde: &LongDirEntry) -> bool {
    if lde.clus_lo != 0 || lde.index() == 0 {
        return false;
    }
    let mut i = (lde.index() as usize - 1) * 13;
    let mut wc: u16 = 1;
    for s in 0..13 {
        let uc = lde.units[s];
        if wc != 0 {
            if i > MAX_LFN {
                return false;
            }
            let cand = candidate.get(i).copied().unwrap_or(0);
            if uni_upper(uc) != uni_upper(cand) {
                return false;
            }
            wc = uc;
            i += 1;
        } else if uc != 0xFFFF {
            return false;
        }
    }
    if lde.is_last_fragment() && wc != 0 && candidate.get(i).copied().unwrap_or(0) != 0 {
        // Stored chain ended but the candidate continues.
        return false;
    }
    true
}

/// Extract one fragment into the working buffer (`MAX_LFN + 1` units).
/// Returns false when the fragment is malformed.
pub(crate) fn pick_fragment(buf: &mut [u16], lde: &LongDirEntry) -> bool {
    if lde.clus_lo != 0 || lde.index() == 0 {
        return false;
    }
    let mut i = (lde.index() as usize - 1) * 13;
    let mut wc: u16 = 1;
    for s in 0..13 {
        let uc = lde.units[s];
        if wc != 0 {
            if i > MAX_LFN {
                return false;
            }
            buf[i] = uc;
            wc = uc;
            i += 1;
        } else if uc != 0xFFFF {
            return false;
        }
    }
    if lde.is_last_fragment() && wc != 0 {
        if i > MAX_LFN {
            return false;
        }
        buf[i] = 0;
    }
    true
}

/// Length of the name currently held in the LFN working buffer.
pub(crate) fn lfn_buf_len(buf: &[u16]) -> usize {
    buf.iter().position(|&c| c == 0).unwrap_or(buf.len())
}

/// Render an 11-byte short name as `NAME.EXT`, optionally applying the NT
/// lowercase hints.
pub(crate) fn sfn_to_string(name: &[u8; 11], nt_res: u8, apply_case: bool) -> String {
    let mut out = String::with_capacity(12);
    let mut first = name[0];
    if first == DIR_ENTRY_KANJI {
        first = DIR_ENTRY_DELETED;
    }
    let body_lower = apply_case && nt_res & NT_BODY_LOWER != 0;
    let ext_lower = apply_case && nt_res & NT_EXT_LOWER != 0;
    for (k, &c) in core::iter::once(&first).chain(name[1..8].iter()).enumerate() {
        let c = if k == 0 { first } else { c };
        if c == SPACE {
            break;
        }
        out.push(if body_lower {
            c.to_ascii_lowercase() as char
        } else {
            c as char
        });
    }
    if name[8] != SPACE {
        out.push('.');
        for &c in &name[8..11] {
            if c == SPACE {
                break;
            }
            out.push(if ext_lower {
                c.to_ascii_lowercase() as char
            } else {
                c as char
            });
        }
    }
    out
}
