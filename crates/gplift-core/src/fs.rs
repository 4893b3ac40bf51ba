//! Filesystem capability.
//!
//! The directory protocol only touches the disk through [`FileSystem`], so
//! tests can interrupt it at any operation with [`FakeFs`] and then resume
//! against the real disk to prove idempotence.

use std::fmt;
use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Filesystem operations used by gplift.
pub trait FileSystem: Send + Sync {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn stat(&self, path: &Path) -> io::Result<Metadata>;

    /// Creates a new file, failing with `AlreadyExists` if it is present.
    fn create_exclusive(&self, path: &Path) -> io::Result<File>;

    /// Removes a file or directory tree. A missing path is not an error.
    fn remove_all(&self, path: &Path) -> io::Result<()>;

    /// Removes an empty directory.
    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// `Ok(false)` only for `NotFound`; other stat failures propagate.
    fn exists(&self, path: &Path) -> io::Result<bool> {
        match self.stat(path) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// The real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFs;

impl FileSystem for OsFs {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn stat(&self, path: &Path) -> io::Result<Metadata> {
        fs::metadata(path)
    }

    fn create_exclusive(&self, path: &Path) -> io::Result<File> {
        OpenOptions::new().write(true).create_new(true).open(path)
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };

        let result = if meta.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };

        match result {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<Vec<_>>>()?;
        entries.sort();
        Ok(entries)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }
}

/// Replaces `path` with `data` so that readers see either the old or the
/// new contents in full.
///
/// The bytes go to a sibling temporary file which is synced and then renamed
/// over the destination.
pub fn atomically_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;

    let mut tmp_name = name.to_os_string();
    tmp_name.push(format!(".{}.tmp", std::process::id()));
    let tmp = dir.join(tmp_name);

    let result = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        // Persist the rename itself.
        File::open(dir)?.sync_all()
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

// ── Fake ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOp {
    Rename,
    Stat,
    CreateExclusive,
    RemoveAll,
    RemoveDir,
    ReadDir,
    CreateDirAll,
}

struct Fault {
    op: FsOp,
    path: PathBuf,
    kind: io::ErrorKind,
}

/// Delegates to the real filesystem, recording calls and failing the
/// operations it has been told to fail.
///
/// A fault fires once, on the first matching call whose primary path equals
/// the registered path.
#[derive(Default)]
pub struct FakeFs {
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<Vec<(FsOp, PathBuf)>>,
}

impl FakeFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, op: FsOp, path: impl Into<PathBuf>, kind: io::ErrorKind) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push(Fault {
                op,
                path: path.into(),
                kind,
            });
        }
    }

    pub fn calls(&self) -> Vec<(FsOp, PathBuf)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_of(&self, op: FsOp) -> Vec<PathBuf> {
        self.calls()
            .into_iter()
            .filter(|(o, _)| *o == op)
            .map(|(_, p)| p)
            .collect()
    }

    fn check(&self, op: FsOp, path: &Path) -> io::Result<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((op, path.to_path_buf()));
        }

        let mut faults = self
            .faults
            .lock()
            .map_err(|_| io::Error::other("fault table poisoned"))?;
        if let Some(pos) = faults.iter().position(|f| f.op == op && f.path == path) {
            let fault = faults.remove(pos);
            return Err(io::Error::new(
                fault.kind,
                format!("injected {op:?} failure on {}", path.display()),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for FakeFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeFs")
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

impl FileSystem for FakeFs {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.check(FsOp::Rename, from)?;
        OsFs.rename(from, to)
    }

    fn stat(&self, path: &Path) -> io::Result<Metadata> {
        self.check(FsOp::Stat, path)?;
        OsFs.stat(path)
    }

    fn create_exclusive(&self, path: &Path) -> io::Result<File> {
        self.check(FsOp::CreateExclusive, path)?;
        OsFs.create_exclusive(path)
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        self.check(FsOp::RemoveAll, path)?;
        OsFs.remove_all(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        self.check(FsOp::RemoveDir, path)?;
        OsFs.remove_dir(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        self.check(FsOp::ReadDir, path)?;
        OsFs.read_dir(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.check(FsOp::CreateDirAll, path)?;
        OsFs.create_dir_all(path)
    }
}
