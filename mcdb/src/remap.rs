//! Concurrent snapshot hand-off
//!
//! A `Monitor` owns the path of a database and publishes the current mapped
//! version (`Db`) behind a lock. Readers register by cloning the published
//! `Arc`; from then on their queries touch only mapped bytes and never take
//! the lock. When the builder renames a new file into place, any reader (or
//! a maintenance thread) notices via `refresh_check`, a lock-free stat and
//! mtime compare, and calls `refresh` to map and publish the replacement.
//!
//! Lifetimes fall out of the reference counts: a superseded snapshot stays
//! mapped until the last registered reader drops its `Arc`, so in-flight
//! lookups keep a valid borrow across any number of replacements, and the
//! mapping is released exactly once, when the count reaches zero. The lock
//! is held only to publish or replace the pointer (release on store,
//! acquire on clone), never during lookups.
//!
//! A failed `refresh` (say the file vanished mid-swap) leaves the previous
//! snapshot published: readers degrade to stale data instead of losing
//! service.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::dbfile::Db;
use crate::utils::error::Result;

pub struct Monitor {
    path: PathBuf,
    current: Mutex<Arc<Db>>,
}

impl Monitor {
    /// Map the file at `path` and publish it as the initial snapshot.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Monitor> {
        let path = path.as_ref().to_path_buf();
        let db = Db::open(&path)?;
        Ok(Monitor {
            path,
            current: Mutex::new(Arc::new(db)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register against the newest published snapshot.
    pub fn current(&self) -> Arc<Db> {
        self.lock().clone()
    }

    /// True when the on-disk file changed since `db` was mapped (or a stat
    /// is now possible where the snapshot predates the file). A failing
    /// stat reports false: the held snapshot remains the best available.
    pub fn refresh_check(&self, db: &Db) -> bool {
        match fs::metadata(&self.path) {
            Ok(meta) => match meta.modified() {
                Ok(mtime) => mtime != db.mtime(),
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    /// Map the file again and publish the new snapshot.
    ///
    /// Concurrent refreshers serialize on the lock; whoever enters second
    /// sees the fresh snapshot already published and skips the remap. On
    /// error nothing is published and readers keep the previous version.
    pub fn refresh(&self) -> Result<()> {
        let mut current = self.lock();
        if !self.refresh_check(&current) {
            return Ok(());
        }
        let db = Db::open(&self.path)?;
        *current = Arc::new(db);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<Arc<Db>> {
        // a poisoned lock only means another thread panicked after a fully
        // published swap; the pointer itself is always consistent
        match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dbfile::Cursor;
    use crate::make::Maker;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    fn tmpdir(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        let r: u64 = rand::random();
        dir.push(format!("mcdb-remap.{}.{}", name, r));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn build(path: &Path, pairs: &[(&[u8], &[u8])]) {
        let mut maker = Maker::create(path).unwrap();
        for (k, v) in pairs {
            maker.add(b'=', k, v).unwrap();
        }
        maker.finish().unwrap();
    }

    // some filesystems round mtime coarsely; callers spin until it moves
    fn mtime_of(path: &Path) -> std::time::SystemTime {
        fs::metadata(path).unwrap().modified().unwrap()
    }

    #[test]
    fn reader_keeps_old_snapshot_until_refresh() {
        let dir = tmpdir("swap");
        let path = dir.join("db.mcdb");
        build(&path, &[(b"alpha", b"v1")]);

        let monitor = Monitor::open(&path).unwrap();
        let snap = monitor.current();
        assert_eq!(snap.find(b'=', b"alpha"), Some(&b"v1"[..]));

        // replace the file; wait out coarse mtime granularity first
        let old_mtime = mtime_of(&path);
        loop {
            build(&path, &[(b"alpha", b"v2")]);
            if mtime_of(&path) != old_mtime {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }

        // the held snapshot still answers from the old version
        assert_eq!(snap.find(b'=', b"alpha"), Some(&b"v1"[..]));
        assert!(monitor.refresh_check(&snap));

        monitor.refresh().unwrap();
        let fresh = monitor.current();
        assert_eq!(fresh.find(b'=', b"alpha"), Some(&b"v2"[..]));
        // and the stale snapshot is still valid for its holder
        assert_eq!(snap.find(b'=', b"alpha"), Some(&b"v1"[..]));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn stale_snapshot_released_only_after_last_reader() {
        let dir = tmpdir("refcnt");
        let path = dir.join("db.mcdb");
        build(&path, &[(b"k", b"v1")]);

        let monitor = Monitor::open(&path).unwrap();
        let reader = monitor.current();
        let observe = Arc::downgrade(&reader);

        let old_mtime = mtime_of(&path);
        loop {
            build(&path, &[(b"k", b"v2")]);
            if mtime_of(&path) != old_mtime {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        monitor.refresh().unwrap();

        // superseded but still referenced: the mapping must remain live
        assert!(observe.upgrade().is_some());
        assert_eq!(reader.find(b'=', b"k"), Some(&b"v1"[..]));
        drop(reader);
        assert!(observe.upgrade().is_none());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn failed_refresh_keeps_previous_snapshot() {
        let dir = tmpdir("failrefresh");
        let path = dir.join("db.mcdb");
        build(&path, &[(b"k", b"v1")]);

        let monitor = Monitor::open(&path).unwrap();
        fs::remove_file(&path).unwrap();

        // the file is gone: stat fails, so the snapshot does not look stale
        let snap = monitor.current();
        assert!(!monitor.refresh_check(&snap));
        assert_eq!(snap.find(b'=', b"k"), Some(&b"v1"[..]));

        // a truncated replacement fails validation; the old snapshot stays
        fs::write(&path, &[0u8; 16]).unwrap();
        assert!(monitor.refresh().is_err());
        assert_eq!(monitor.current().find(b'=', b"k"), Some(&b"v1"[..]));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn concurrent_readers_during_replacement() {
        let dir = tmpdir("threads");
        let path = dir.join("db.mcdb");

        let keys: Vec<String> = (0..64).map(|i| format!("key-{}", i)).collect();
        let v1: Vec<(&[u8], &[u8])> = keys.iter().map(|k| (k.as_bytes(), &b"one"[..])).collect();
        let v2: Vec<(Vec<u8>, Vec<u8>)> = keys
            .iter()
            .map(|k| (k.as_bytes().to_vec(), b"two".to_vec()))
            .collect();
        build(&path, &v1);

        let monitor = Arc::new(Monitor::open(&path).unwrap());
        let stop = Arc::new(AtomicBool::new(false));

        let mut readers = Vec::new();
        for _ in 0..2 {
            let monitor = monitor.clone();
            let stop = stop.clone();
            let keys = keys.clone();
            readers.push(thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let snap = monitor.current();
                    // within one snapshot every key answers from one version
                    let mut seen = Vec::with_capacity(keys.len());
                    for k in &keys {
                        let mut cur = Cursor::new();
                        assert!(snap.find_start(&mut cur, b'=', k.as_bytes()));
                        let v = snap.find_next(&mut cur, b'=', k.as_bytes()).unwrap();
                        seen.push(v.to_vec());
                    }
                    assert!(
                        seen.iter().all(|v| v == &seen[0]),
                        "mixed versions within one snapshot"
                    );
                }
            }));
        }

        let writer = {
            let monitor = monitor.clone();
            let path = path.clone();
            thread::spawn(move || {
                for _ in 0..5 {
                    let old = fs::metadata(&path).unwrap().modified().unwrap();
                    loop {
                        let mut maker = Maker::create(&path).unwrap();
                        for (k, v) in &v2 {
                            maker.add(b'=', k, v).unwrap();
                        }
                        maker.finish().unwrap();
                        if fs::metadata(&path).unwrap().modified().unwrap() != old {
                            break;
                        }
                        thread::sleep(Duration::from_millis(10));
                    }
                    monitor.refresh().unwrap();
                }
            })
        };

        writer.join().unwrap();
        stop.store(true, Ordering::Relaxed);
        for r in readers {
            r.join().unwrap();
        }

        // after the writer finished and refreshed, new registrations see v2
        let snap = monitor.current();
        assert_eq!(snap.find(b'=', b"key-0"), Some(&b"two"[..]));

        fs::remove_dir_all(&dir).unwrap();
    }
}
