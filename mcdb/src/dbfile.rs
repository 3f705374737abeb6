//! Constant database file format
//!
//! A database file is:
//!
//! HEADER (256 slots * 16 bytes = 4096 bytes)
//! RECORDS (variable)
//! INDEX (one bucket of 16-byte entries per non-empty slot)
//!
//! Each header slot holds the file offset of its bucket (8 bytes BE) and the
//! number of entries in the bucket (4 bytes BE, 4 bytes unused). A key is
//! dispatched to the slot matching the low byte of its hash; within the
//! bucket its preferred entry is `(hash >> 8) % count`, and colliding
//! entries were placed by linear probing at build time, wrapping inside the
//! bucket.
//!
//! A record is (klen: 4 bytes BE, vlen: 4 bytes BE, key bytes, value bytes).
//! klen counts the optional leading tag byte. An index entry is
//! (key hash: 4 bytes BE, klen: 4 bytes BE, record offset: 8 bytes BE), so a
//! scan can reject non-matching entries without touching the record region.
//!
//! The whole file is mapped read-only and never modified; replacement is a
//! whole-file atomic rename handled by `make`/`remap`. Everything read out
//! of the map is bounds-checked here so the layers above can borrow value
//! bytes straight out of the map.

use memmap2::Mmap;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use crate::hash;
use crate::utils::error::{Error, Result};
use crate::utils::serialize::{read_offset, read_size, Offset, Size};

pub const SLOTS: usize = 256;
pub const SLOT_SIZE: usize = 16;
pub const HEADER_SIZE: usize = SLOTS * SLOT_SIZE;
pub const ENTRY_SIZE: usize = 16;

/// One immutable, memory-mapped version of a database file.
pub struct Db {
    map: Mmap,
    mtime: SystemTime,
}

/// Lookup state threaded through `find_start`/`find_next`.
///
/// A cursor does not borrow the map; it only carries offsets, so callers can
/// keep one alive across calls while holding the `Db` behind an `Arc`.
#[derive(Clone, Debug, Default)]
pub struct Cursor {
    khash: u32,
    hpos: Offset,
    hslots: Size,
    kpos: Offset,
    seen: Size,
    dpos: Offset,
    dlen: Size,
}

impl Cursor {
    pub fn new() -> Cursor {
        Cursor::default()
    }

    /// Offset and length of the last value yielded by `find_next`.
    pub fn value_span(&self) -> (Offset, Size) {
        (self.dpos, self.dlen)
    }
}

impl Db {
    /// Open and map a database file read-only.
    ///
    /// A missing file reports `Unavailable`; a file too short for the slot
    /// header or with a bucket extending past the end of the file is
    /// rejected as corrupt.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Db> {
        let file = fs::File::open(path)?;
        let meta = file.metadata()?;
        if meta.len() < HEADER_SIZE as u64 {
            return Err(Error::HeaderTooShort(meta.len()));
        }
        let map = unsafe { Mmap::map(&file)? };
        let db = Db {
            map,
            mtime: meta.modified()?,
        };
        db.validate()?;
        Ok(db)
    }

    fn validate(&self) -> Result<()> {
        let len = self.map.len() as u64;
        for slot in 0..SLOTS as u32 {
            let (hpos, hslots) = self.slot(slot as u8);
            if hslots == 0 {
                continue;
            }
            let end = hpos.checked_add(u64::from(hslots) * ENTRY_SIZE as u64);
            match end {
                Some(end) if hpos >= HEADER_SIZE as u64 && end <= len => (),
                _ => return Err(Error::SlotOutOfRange(slot as u8)),
            }
        }
        Ok(())
    }

    fn slot(&self, slot: u8) -> (Offset, Size) {
        let at = usize::from(slot) * SLOT_SIZE;
        (
            read_offset(&self.map[at..at + 8]),
            read_size(&self.map[at + 8..at + 12]),
        )
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        // header-only file: no records were ever added
        self.map.len() == HEADER_SIZE
    }

    /// Modification time of the file captured when it was mapped; `remap`
    /// compares it against a fresh stat to detect replacement.
    pub fn mtime(&self) -> SystemTime {
        self.mtime
    }

    /// Ask the OS to fault the whole mapping in ahead of a burst of
    /// queries. Purely advisory; only worth it when the file fits in the
    /// page cache.
    #[cfg(unix)]
    pub fn prefault(&self) -> Result<()> {
        self.map.advise(memmap2::Advice::WillNeed)?;
        Ok(())
    }

    /// Seed `cur` for a lookup of `key` under `tag` (0 = untagged).
    ///
    /// Returns false when the slot for the key's hash is empty; otherwise
    /// the cursor points at the preferred bucket position and `find_next`
    /// scans from there.
    pub fn find_start(&self, cur: &mut Cursor, tag: u8, key: &[u8]) -> bool {
        let khash = hash::tagged(tag, key);
        let (hpos, hslots) = self.slot(khash as u8);
        cur.khash = khash;
        cur.hpos = hpos;
        cur.hslots = hslots;
        cur.seen = 0;
        cur.dpos = 0;
        cur.dlen = 0;
        if hslots == 0 {
            return false;
        }
        cur.kpos = hpos + u64::from((khash >> 8) % hslots) * ENTRY_SIZE as u64;
        true
    }

    /// Advance to the next entry matching (tag, key), wrapping once within
    /// the bucket, and return the value bytes in place (zero copy).
    ///
    /// Entries are compared by stored hash, then stored key length, then the
    /// tag byte and key bytes read from the record. Returns `None` once
    /// `count` entries have been examined; a record offset pointing outside
    /// the file (corrupt) also ends the scan.
    pub fn find_next<'a>(&'a self, cur: &mut Cursor, tag: u8, key: &[u8]) -> Option<&'a [u8]> {
        let tlen = usize::from(tag != 0);
        let klen = (key.len() + tlen) as u32;
        let bucket_end = cur.hpos + u64::from(cur.hslots) * ENTRY_SIZE as u64;
        while cur.seen < cur.hslots {
            let at = cur.kpos as usize;
            let entry = self.map.get(at..at + ENTRY_SIZE)?;
            cur.kpos += ENTRY_SIZE as u64;
            if cur.kpos == bucket_end {
                cur.kpos = cur.hpos;
            }
            cur.seen += 1;

            if read_size(&entry[0..4]) != cur.khash || read_size(&entry[4..8]) != klen {
                continue;
            }
            let rpos = read_offset(&entry[8..16]) as usize;
            let hdr = self.map.get(rpos..rpos + 8)?;
            if read_size(&hdr[0..4]) != klen {
                continue;
            }
            let vlen = read_size(&hdr[4..8]);
            let kbytes = self.map.get(rpos + 8..rpos + 8 + klen as usize)?;
            if tlen == 1 && kbytes[0] != tag {
                continue;
            }
            if &kbytes[tlen..] != key {
                continue;
            }
            let dpos = rpos + 8 + klen as usize;
            let value = self.map.get(dpos..dpos + vlen as usize)?;
            cur.dpos = dpos as Offset;
            cur.dlen = vlen;
            return Some(value);
        }
        None
    }

    /// First matching value for (tag, key), if any.
    pub fn find<'a>(&'a self, tag: u8, key: &[u8]) -> Option<&'a [u8]> {
        let mut cur = Cursor::new();
        if !self.find_start(&mut cur, tag, key) {
            return None;
        }
        self.find_next(&mut cur, tag, key)
    }

    /// Value bytes recorded by the last successful `find_next` on `cur`.
    pub fn value<'a>(&'a self, cur: &Cursor) -> &'a [u8] {
        &self.map[cur.dpos as usize..cur.dpos as usize + cur.dlen as usize]
    }

    /// Bounds-checked copy of the current value into `out`; fails with
    /// `Range` when `out` is too small. Returns the number of bytes copied.
    pub fn read_value(&self, cur: &Cursor, out: &mut [u8]) -> Result<usize> {
        let dlen = cur.dlen as usize;
        if out.len() < dlen {
            return Err(Error::Range);
        }
        out[..dlen].copy_from_slice(self.value(cur));
        Ok(dlen)
    }
}
