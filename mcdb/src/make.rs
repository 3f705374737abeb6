//! Database builder
//!
//! A new database is always written out of line: records stream into a
//! sibling temporary file while (hash, klen, offset) triples accumulate in
//! 256 in-memory slot lists; `finish` serializes one index bucket per slot,
//! rewrites the 4096-byte header, and renames the temporary over the
//! destination. Readers observe either the old file or the complete new one,
//! never an intermediate state. Databases are never edited in place.

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::dbfile::{ENTRY_SIZE, HEADER_SIZE, SLOTS, SLOT_SIZE};
use crate::hash;
use crate::utils::error::{Error, Result};
use crate::utils::serialize::{write_offset, write_size, Offset, Size};
use crate::utils::tmpfile::TmpFile;

#[derive(Clone, Copy, Default)]
struct Pending {
    khash: u32,
    klen: Size,
    rpos: Offset,
}

/// Builder for one new database file.
///
/// Dropping a `Maker` without calling `finish` removes the temporary file
/// and leaves any previous database untouched.
pub struct Maker {
    tmpfile: TmpFile,
    dest: PathBuf,
    slots: Vec<Vec<Pending>>,
    pos: Offset,
}

impl Maker {
    /// Start a build that will atomically replace `dest` on `finish`.
    pub fn create<P: AsRef<Path>>(dest: P) -> Result<Maker> {
        let dest = dest.as_ref().to_path_buf();
        let dir = match dest.parent() {
            Some(d) if d != Path::new("") => d.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmpfile = TmpFile::create(dir)?;
        // reserve the header; slot descriptors are rewritten by finish()
        tmpfile.write_all(&[0u8; HEADER_SIZE])?;
        Ok(Maker {
            tmpfile,
            dest,
            slots: vec![Vec::new(); SLOTS],
            pos: HEADER_SIZE as Offset,
        })
    }

    /// Append one record. The tag byte (0 = none) is stored as part of the
    /// key and participates in its hash. The same key may be added several
    /// times; lookups replay duplicates in insertion order.
    pub fn add(&mut self, tag: u8, key: &[u8], value: &[u8]) -> Result<()> {
        let tlen = usize::from(tag != 0);
        if key.len() + tlen > u32::max_value() as usize
            || value.len() > u32::max_value() as usize
        {
            return Err(Error::RecordTooLarge);
        }
        let klen = (key.len() + tlen) as Size;
        let vlen = value.len() as Size;
        let khash = hash::tagged(tag, key);

        let mut lenbuf = [0u8; 8];
        write_size(&mut lenbuf[0..4], klen);
        write_size(&mut lenbuf[4..8], vlen);
        self.tmpfile.write_all(&lenbuf)?;
        if tlen == 1 {
            self.tmpfile.write_all(&[tag])?;
        }
        self.tmpfile.write_all(key)?;
        self.tmpfile.write_all(value)?;

        self.slots[khash as u8 as usize].push(Pending {
            khash,
            klen,
            rpos: self.pos,
        });
        self.pos += 8 + Offset::from(klen) + Offset::from(vlen);
        Ok(())
    }

    pub fn record_count(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }

    /// Write the index buckets and header, then rename into place.
    ///
    /// Each bucket holds exactly `count` entries; every pending pair lands
    /// on `(hash >> 8) % count` or, when that position is taken, on the next
    /// free position wrapping within the bucket. Placing pairs in insertion
    /// order keeps duplicate keys in insertion order for the scan.
    pub fn finish(mut self) -> Result<()> {
        let mut header = [0u8; HEADER_SIZE];
        for slot in 0..SLOTS {
            let pending = &self.slots[slot];
            let count = pending.len() as Size;
            write_offset(&mut header[slot * SLOT_SIZE..], self.pos);
            write_size(&mut header[slot * SLOT_SIZE + 8..], count);
            if count == 0 {
                continue;
            }

            // rpos is never 0 (records start after the header), so a zeroed
            // entry marks a free table position during distribution
            let mut table = vec![Pending::default(); count as usize];
            for p in pending {
                let mut at = ((p.khash >> 8) % count) as usize;
                while table[at].rpos != 0 {
                    at += 1;
                    if at == count as usize {
                        at = 0;
                    }
                }
                table[at] = *p;
            }

            let mut bucket = vec![0u8; count as usize * ENTRY_SIZE];
            for (i, p) in table.iter().enumerate() {
                let at = i * ENTRY_SIZE;
                write_size(&mut bucket[at..], p.khash);
                write_size(&mut bucket[at + 4..], p.klen);
                write_offset(&mut bucket[at + 8..], p.rpos);
            }
            self.tmpfile.write_all(&bucket)?;
            self.pos += bucket.len() as Offset;
        }

        self.tmpfile.seek(SeekFrom::Start(0))?;
        self.tmpfile.write_all(&header)?;

        // adopt the permissions of the database being replaced; without a
        // previous file default to owner-only (the file may carry shadow
        // entries)
        match fs::metadata(&self.dest) {
            Ok(meta) => self.tmpfile.set_permissions(meta.permissions())?,
            Err(_) => {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    self.tmpfile
                        .set_permissions(fs::Permissions::from_mode(0o600))?;
                }
            }
        }

        self.tmpfile.render_permanent(&self.dest)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dbfile::{Cursor, Db};

    pub fn tmpdir(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        let r: u64 = rand::random();
        dir.push(format!("mcdb-make.{}.{}", name, r));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn roundtrip_first_match_and_duplicates() {
        let dir = tmpdir("roundtrip");
        let path = dir.join("basic.mcdb");

        let mut maker = Maker::create(&path).unwrap();
        maker.add(b'=', b"alpha", b"1").unwrap();
        maker.add(b'=', b"beta", b"2").unwrap();
        maker.add(b'=', b"alpha", b"3").unwrap();
        maker.finish().unwrap();

        let db = Db::open(&path).unwrap();
        let mut cur = Cursor::new();
        assert!(db.find_start(&mut cur, b'=', b"alpha"));
        assert_eq!(db.find_next(&mut cur, b'=', b"alpha"), Some(&b"1"[..]));
        assert_eq!(db.find_next(&mut cur, b'=', b"alpha"), Some(&b"3"[..]));
        assert_eq!(db.find_next(&mut cur, b'=', b"alpha"), None);

        assert_eq!(db.find(b'=', b"beta"), Some(&b"2"[..]));
        assert_eq!(db.find(b'=', b"gamma"), None);
        // same bytes under a different tag, or untagged, are distinct keys
        assert_eq!(db.find(b'~', b"alpha"), None);
        assert_eq!(db.find(0, b"alpha"), None);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn read_value_copies_and_bounds_checks() {
        let dir = tmpdir("readv");
        let path = dir.join("readv.mcdb");

        let mut maker = Maker::create(&path).unwrap();
        maker.add(0, b"k", b"some value").unwrap();
        maker.finish().unwrap();

        let db = Db::open(&path).unwrap();
        let mut cur = Cursor::new();
        assert!(db.find_start(&mut cur, 0, b"k"));
        assert!(db.find_next(&mut cur, 0, b"k").is_some());

        let mut small = [0u8; 4];
        match db.read_value(&cur, &mut small) {
            Err(Error::Range) => (),
            other => panic!("expected Range, got {:?}", other),
        }
        let mut buf = [0u8; 32];
        let n = db.read_value(&cur, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"some value");
        assert_eq!(db.value(&cur), b"some value");

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn many_keys_across_all_slots() {
        let dir = tmpdir("spread");
        let path = dir.join("spread.mcdb");

        let mut maker = Maker::create(&path).unwrap();
        for i in 0..2000u32 {
            let key = format!("key-{}", i);
            let value = format!("value-{}", i);
            maker.add(b'=', key.as_bytes(), value.as_bytes()).unwrap();
        }
        assert_eq!(maker.record_count(), 2000);
        maker.finish().unwrap();

        let db = Db::open(&path).unwrap();
        #[cfg(unix)]
        db.prefault().unwrap();
        for i in 0..2000u32 {
            let key = format!("key-{}", i);
            let value = format!("value-{}", i);
            assert_eq!(db.find(b'=', key.as_bytes()), Some(value.as_bytes()));
        }
        assert_eq!(db.find(b'=', b"key-2000"), None);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn single_entry_bucket_still_wraps() {
        let dir = tmpdir("single");
        let path = dir.join("single.mcdb");

        // hand-picked single key: its slot holds one entry, so the scan
        // starts at (hash >> 8) % 1 == 0 and must terminate after one probe
        let mut maker = Maker::create(&path).unwrap();
        maker.add(b'x', b"lone", b"v").unwrap();
        maker.finish().unwrap();

        let db = Db::open(&path).unwrap();
        assert_eq!(db.find(b'x', b"lone"), Some(&b"v"[..]));
        // a missing key hashing anywhere must not loop
        for i in 0..512u32 {
            let k = format!("absent-{}", i);
            assert_eq!(db.find(b'x', k.as_bytes()), None);
        }

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn aborted_build_leaves_no_trace() {
        let dir = tmpdir("abort");
        let path = dir.join("abort.mcdb");

        let mut maker = Maker::create(&path).unwrap();
        maker.add(b'=', b"old", b"1").unwrap();
        maker.finish().unwrap();
        let before = fs::read(&path).unwrap();

        {
            let mut maker = Maker::create(&path).unwrap();
            maker.add(b'=', b"new", b"2").unwrap();
            // dropped without finish: simulated crash mid-build
        }

        assert_eq!(fs::read(&path).unwrap(), before);
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|n| n.to_string_lossy().starts_with(".tmp."))
            .collect();
        assert!(leftovers.is_empty(), "stray temp files: {:?}", leftovers);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn permissions_are_preserved_on_replace() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tmpdir("perm");
        let path = dir.join("perm.mcdb");

        let maker = Maker::create(&path).unwrap();
        maker.finish().unwrap();
        assert_eq!(
            fs::metadata(&path).unwrap().permissions().mode() & 0o777,
            0o600
        );

        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        let mut maker = Maker::create(&path).unwrap();
        maker.add(0, b"k", b"v").unwrap();
        maker.finish().unwrap();
        assert_eq!(
            fs::metadata(&path).unwrap().permissions().mode() & 0o777,
            0o644
        );

        fs::remove_dir_all(&dir).unwrap();
    }
}
