use rand;
use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Temporary file created next to its final destination.
///
/// The file is created with a random name in the target directory so the
/// final `rename` stays within one filesystem and is atomic (POSIX). If the
/// `TmpFile` is dropped without having been renamed into place, the file is
/// unlinked, so an aborted build never leaves a partial file behind.
pub struct TmpFile {
    file: fs::File,
    path: PathBuf,
    renamed: bool,
}

fn template_create_temp(prefix: &str, suffix: &str) -> String {
    let v1: u64 = rand::random();
    let v2: u64 = rand::random();
    format!("{}{}{}{}", prefix, v1, v2, suffix)
}

impl TmpFile {
    pub fn create(mut path: PathBuf) -> io::Result<Self> {
        let filename = template_create_temp(".tmp.", "");
        path.push(filename);

        OpenOptions::new()
            .write(true)
            .read(true)
            .create_new(true)
            .open(&path)
            .map(|file| TmpFile {
                file,
                path,
                renamed: false,
            })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_permissions(&self, perm: fs::Permissions) -> io::Result<()> {
        self.file.set_permissions(perm)
    }

    /// Atomically move the temporary over `path`. On error the temporary is
    /// removed (by `Drop`) and the previous content of `path` is untouched.
    pub fn render_permanent(mut self, path: &Path) -> io::Result<()> {
        self.file.flush()?;
        fs::rename(&self.path, path)?;
        self.renamed = true;
        Ok(())
    }
}

impl Drop for TmpFile {
    fn drop(&mut self) {
        if !self.renamed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

impl io::Seek for TmpFile {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}
impl io::Read for TmpFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}
impl io::Write for TmpFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
