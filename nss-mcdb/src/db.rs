//! Query session layer.
//!
//! An `NssDb` wraps one constant database file behind a `Monitor`, so every
//! lookup transparently picks up an atomically replaced file: the lookup
//! stats the path (lock-free), refreshes the mapping when the file changed,
//! and then runs entirely on one immutable snapshot. A refresh failure is
//! logged and the previous snapshot keeps serving.
//!
//! Key tags multiplex several indexes over one file: one record is inserted
//! under its canonical name (`=`), once per alias (`~`), under printable
//! hex renderings of its numeric ids (`x`), and under raw binary addresses
//! (`b`). A `~`-tagged entry with an empty key is also written once per
//! logical record; those sentinels all collide on one key, so walking them
//! with find-next replays the database in insertion order. That walk is
//! the get-next enumeration.

use std::path::Path;
use std::sync::Arc;

use mcdb::dbfile::{Cursor, Db};
use mcdb::remap::Monitor;

use crate::error::{NssError, Result};

/// canonical name key
pub const TAG_CANONICAL: u8 = b'=';
/// alias keys, and with an empty key the enumeration sentinel
pub const TAG_ALIAS: u8 = b'~';
/// numeric ids rendered as fixed-width uppercase hex
pub const TAG_HEX: u8 = b'x';
/// raw binary address keys
pub const TAG_BINARY: u8 = b'b';
pub const TAG_NONE: u8 = 0;

pub struct NssDb {
    monitor: Monitor,
}

impl NssDb {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<NssDb> {
        Ok(NssDb {
            monitor: Monitor::open(path)?,
        })
    }

    /// Newest snapshot, refreshing first when the file changed on disk.
    pub fn snapshot(&self) -> Arc<Db> {
        let snap = self.monitor.current();
        if self.monitor.refresh_check(&snap) {
            match self.monitor.refresh() {
                Ok(()) => {
                    debug!("mapped replacement of {:?}", self.monitor.path());
                    return self.monitor.current();
                }
                Err(e) => warn!(
                    "refresh of {:?} failed, keeping mapped version: {}",
                    self.monitor.path(),
                    e
                ),
            }
        }
        snap
    }

    /// Drive one lookup: position on the first matching record and hand the
    /// snapshot, cursor and value to the decoder. Decoders doing secondary
    /// filtering keep advancing the cursor themselves.
    pub(crate) fn lookup<'b, T, F>(
        &self,
        tag: u8,
        key: &[u8],
        buf: &'b mut [u8],
        decode: F,
    ) -> Result<T>
    where
        F: for<'v> FnOnce(&'v Db, &mut Cursor, &'v [u8], &'b mut [u8]) -> Result<T>,
    {
        let snap = self.snapshot();
        let db: &Db = &snap;
        let mut cur = Cursor::new();
        if !db.find_start(&mut cur, tag, key) {
            return Err(NssError::NotFound);
        }
        match db.find_next(&mut cur, tag, key) {
            Some(value) => decode(db, &mut cur, value, buf),
            None => Err(NssError::NotFound),
        }
    }

    /// Start a get-next enumeration over the whole database.
    ///
    /// The iterator pins the snapshot it started on: a replacement renamed
    /// in mid-walk does not disturb it, and the walk order is the insertion
    /// order of the build.
    pub fn entries(&self) -> Entries {
        let snap = self.snapshot();
        let mut cur = Cursor::new();
        let live = snap.find_start(&mut cur, TAG_ALIAS, b"");
        Entries { snap, cur, live }
    }
}

pub struct Entries {
    snap: Arc<Db>,
    cur: Cursor,
    live: bool,
}

impl Entries {
    /// Decode the next record into the caller's scratch buffer; `Ok(None)`
    /// at the end. A `Range` failure does not advance past the record: the
    /// caller may retry it with a larger buffer.
    pub fn next_with<'b, T, F>(&mut self, buf: &'b mut [u8], decode: F) -> Result<Option<T>>
    where
        F: for<'v> FnOnce(&'v [u8], &'b mut [u8]) -> Result<T>,
    {
        if !self.live {
            return Ok(None);
        }
        let db: &Db = &self.snap;
        let mut probe = self.cur.clone();
        match db.find_next(&mut probe, TAG_ALIAS, b"") {
            Some(value) => {
                let decoded = decode(value, buf)?;
                self.cur = probe;
                Ok(Some(decoded))
            }
            None => {
                self.live = false;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::acct::{add_passwd, next_passwd, passwd_by_name, Passwd};
    use crate::error::NssError;
    use mcdb::make::Maker;
    use std::fs;
    use std::path::PathBuf;
    use std::thread;
    use std::time::Duration;

    fn tmpdir(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        let r: u64 = rand::random();
        dir.push(format!("nss-db.{}.{}", name, r));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn build_passwd(path: &std::path::Path, names: &[&str], uid_base: u32) {
        let mut maker = Maker::create(path).unwrap();
        for (i, name) in names.iter().enumerate() {
            add_passwd(
                &mut maker,
                &Passwd {
                    name,
                    passwd: "x",
                    uid: uid_base + i as u32,
                    gid: uid_base + i as u32,
                    gecos: "",
                    dir: "/",
                    shell: "/bin/sh",
                },
            )
            .unwrap();
        }
        maker.finish().unwrap();
    }

    fn mtime_of(path: &std::path::Path) -> std::time::SystemTime {
        fs::metadata(path).unwrap().modified().unwrap()
    }

    #[test]
    fn lookups_follow_atomic_replacement() {
        let dir = tmpdir("replace");
        let path = dir.join("passwd.mcdb");
        build_passwd(&path, &["u"], 100);

        let db = NssDb::open(&path).unwrap();
        let mut buf = [0u8; 256];
        assert_eq!(passwd_by_name(&db, "u", &mut buf).unwrap().uid, 100);

        let old = mtime_of(&path);
        loop {
            build_passwd(&path, &["u"], 200);
            if mtime_of(&path) != old {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }

        // next query stats the path and picks the replacement up by itself
        let mut buf = [0u8; 256];
        assert_eq!(passwd_by_name(&db, "u", &mut buf).unwrap().uid, 200);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn enumeration_is_pinned_to_its_snapshot() {
        let dir = tmpdir("pinned");
        let path = dir.join("passwd.mcdb");
        build_passwd(&path, &["a", "b", "c"], 0);

        let db = NssDb::open(&path).unwrap();
        let mut entries = db.entries();
        let mut buf = [0u8; 256];
        assert_eq!(next_passwd(&mut entries, &mut buf).unwrap().unwrap().name, "a");

        let old = mtime_of(&path);
        loop {
            build_passwd(&path, &["x"], 50);
            if mtime_of(&path) != old {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }

        // the walk continues over the version it started on
        let mut buf = [0u8; 256];
        assert_eq!(next_passwd(&mut entries, &mut buf).unwrap().unwrap().name, "b");
        let mut buf = [0u8; 256];
        assert_eq!(next_passwd(&mut entries, &mut buf).unwrap().unwrap().name, "c");
        let mut buf = [0u8; 256];
        assert!(next_passwd(&mut entries, &mut buf).unwrap().is_none());

        // a fresh walk sees the replacement
        let mut entries = db.entries();
        let mut buf = [0u8; 256];
        assert_eq!(next_passwd(&mut entries, &mut buf).unwrap().unwrap().name, "x");

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn enumeration_does_not_advance_past_a_range_failure() {
        let dir = tmpdir("retry");
        let path = dir.join("passwd.mcdb");
        build_passwd(&path, &["first", "second"], 0);

        let db = NssDb::open(&path).unwrap();
        let mut entries = db.entries();
        let mut small = [0u8; 2];
        match next_passwd(&mut entries, &mut small) {
            Err(NssError::Range) => (),
            other => panic!("expected Range, got {:?}", other),
        }
        // the failed record is replayed, not skipped
        let mut buf = [0u8; 256];
        assert_eq!(
            next_passwd(&mut entries, &mut buf).unwrap().unwrap().name,
            "first"
        );
        let mut buf = [0u8; 256];
        assert_eq!(
            next_passwd(&mut entries, &mut buf).unwrap().unwrap().name,
            "second"
        );

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn concurrent_lookups_never_observe_a_torn_database() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let dir = tmpdir("threads");
        let path = dir.join("passwd.mcdb");
        let names = ["a", "b", "c", "d"];
        build_passwd(&path, &names, 100);

        let db = Arc::new(NssDb::open(&path).unwrap());
        let stop = Arc::new(AtomicBool::new(false));

        let mut readers = Vec::new();
        for _ in 0..2 {
            let db = db.clone();
            let stop = stop.clone();
            readers.push(thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    for (i, name) in names.iter().enumerate() {
                        let mut buf = [0u8; 256];
                        let pw = passwd_by_name(&db, name, &mut buf).unwrap();
                        // every answer comes from one complete build
                        assert_eq!(pw.uid, pw.gid);
                        let base = pw.uid - i as u32;
                        assert!(base >= 100 && base <= 140 && base % 10 == 0);
                    }
                }
            }));
        }

        let writer = {
            let path = path.clone();
            thread::spawn(move || {
                for round in 0..5u32 {
                    let old = mtime_of(&path);
                    loop {
                        build_passwd(&path, &names, 100 + round * 10);
                        if mtime_of(&path) != old {
                            break;
                        }
                        thread::sleep(Duration::from_millis(10));
                    }
                }
            })
        };

        writer.join().unwrap();
        stop.store(true, Ordering::Relaxed);
        for r in readers {
            r.join().unwrap();
        }

        // once the dust settles every lookup answers from the final build
        let mut buf = [0u8; 256];
        assert_eq!(passwd_by_name(&db, "a", &mut buf).unwrap().uid, 140);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_database_is_unavailable() {
        let dir = tmpdir("missing");
        match NssDb::open(dir.join("nope.mcdb")) {
            Err(NssError::Unavailable) => (),
            other => panic!("expected Unavailable, got {:?}", other.map(|_| ())),
        }
        fs::remove_dir_all(&dir).unwrap();
    }
}
