//! Target-side tablespace directories.
//!
//! Layouts under a tablespace location `<tsloc>`:
//!
//! ```text
//! 5-series:  <tsloc>/<dbOID>/<relfilenode>           (PG_VERSION inside <dbOID>)
//! 6 and up:  <tsloc>/<dbid>/GPDB_<major>_<catalog>/<dbOID>/<relfilenode>
//! ```
//!
//! A legacy `<dbOID>` may collide with a target `<dbid>` (template1 has oid
//! 1), so a `<dbid>` directory is only removed once it is empty.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use gplift_core::{ErrorList, FileSystem, OutStreams};
use tracing::debug;

use crate::directories::PG_VERSION;
use crate::error::{UpgradeError, UpgradeResult};

pub const TABLESPACE_DIR_PREFIX: &str = "GPDB_";

/// `<location>/<dbid>/GPDB_<major>_<catalog_version>`.
pub fn tablespace_path(location: &Path, dbid: i32, major: u64, catalog_version: &str) -> PathBuf {
    location
        .join(dbid.to_string())
        .join(format!("{TABLESPACE_DIR_PREFIX}{major}_{catalog_version}"))
}

fn has_prefix(dir: &Path) -> bool {
    dir.file_name()
        .map(|name| name.to_string_lossy().starts_with(TABLESPACE_DIR_PREFIX))
        .unwrap_or(false)
}

/// Deletes target tablespace directories and, when left empty, their
/// `<dbid>` parents.
///
/// Every directory is checked for the `GPDB_` prefix before anything is
/// removed. Directories and parents that are already gone are skipped.
pub fn delete_tablespace_directories(
    fs: &dyn FileSystem,
    dirs: &[PathBuf],
    host: &str,
    streams: &dyn OutStreams,
) -> UpgradeResult<()> {
    if let Some(bad) = dirs.iter().find(|d| !has_prefix(d)) {
        return Err(UpgradeError::InvalidTablespaceDirectory(bad.clone()));
    }

    let mut out = streams.stdout();
    for dir in dirs {
        if !fs.exists(dir)? {
            debug!(dir = %dir.display(), "tablespace directory already deleted");
            continue;
        }
        writeln!(
            out,
            "Deleting directory: {:?} on host {host:?}",
            dir.display().to_string()
        )?;
        fs.remove_all(dir).map_err(UpgradeError::fs("remove", dir))?;
    }

    for dir in dirs {
        let Some(parent) = dir.parent() else { continue };
        let entries = match fs.read_dir(parent) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(UpgradeError::fs("read", parent)(err)),
        };
        if !entries.is_empty() {
            debug!(dir = %parent.display(), "keeping non-empty tablespace directory");
            continue;
        }
        match fs.remove_dir(parent) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(UpgradeError::fs("remove", parent)(err)),
        }
    }
    Ok(())
}

/// Checks that every subdirectory of each tablespace location has either
/// the legacy or the `GPDB_` layout.
///
/// An empty or unreadable location fails immediately; bad subdirectories
/// are reported together.
pub fn verify_tablespace_directories(fs: &dyn FileSystem, locations: &[PathBuf]) -> UpgradeResult<()> {
    let mut errors = Vec::new();

    for location in locations {
        let entries = fs
            .read_dir(location)
            .map_err(UpgradeError::fs("read tablespace location", location))?;
        if entries.is_empty() {
            return Err(UpgradeError::UnrecognizedTablespaceDirectory(location.clone()));
        }

        for entry in entries {
            if !is_dir(fs, &entry)? {
                continue;
            }
            match classify(fs, &entry) {
                Ok(true) => {}
                Ok(false) => errors.push(UpgradeError::UnrecognizedTablespaceDirectory(entry)),
                Err(err) => errors.push(err),
            }
        }
    }

    ErrorList::fold(errors)
}

fn is_dir(fs: &dyn FileSystem, path: &Path) -> UpgradeResult<bool> {
    let meta = fs.stat(path).map_err(UpgradeError::fs("stat", path))?;
    Ok(meta.is_dir())
}

/// `Ok(true)` for a recognized layout. A first subdirectory without the
/// `GPDB_` prefix is an error naming it.
fn classify(fs: &dyn FileSystem, dir: &Path) -> UpgradeResult<bool> {
    if fs.exists(&dir.join(PG_VERSION))? {
        return Ok(true);
    }

    let entries = fs
        .read_dir(dir)
        .map_err(UpgradeError::fs("read tablespace directory", dir))?;
    for entry in entries {
        if !is_dir(fs, &entry)? {
            continue;
        }
        if !has_prefix(&entry) {
            return Err(UpgradeError::InvalidTablespaceDirectory(entry));
        }
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use gplift_core::{BufferedStreams, FakeFs, FsOp, OsFs};

    use super::*;

    #[test]
    fn path_layout() {
        assert_eq!(
            tablespace_path(Path::new("/ts/demoDataDir0/16386"), 2, 6, "301908232"),
            PathBuf::from("/ts/demoDataDir0/16386/2/GPDB_6_301908232")
        );
    }

    #[test]
    fn delete_refuses_unprefixed_directories_before_touching_anything() {
        let root = tempfile::tempdir().unwrap();
        let good = root.path().join("16386/1/GPDB_7_302307241");
        let bad = root.path().join("16386/2/pg_data");
        fs::create_dir_all(&good).unwrap();
        fs::create_dir_all(&bad).unwrap();

        let err = delete_tablespace_directories(
            &OsFs,
            &[good.clone(), bad.clone()],
            "sdw1",
            &BufferedStreams::new(),
        )
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            format!(
                "Invalid tablespace directory. Expected {} to start with 'GPDB_'.",
                bad.display()
            )
        );
        assert!(good.exists());
    }

    #[test]
    fn delete_removes_empty_parent_and_keeps_legacy_content() {
        let root = tempfile::tempdir().unwrap();
        let lone = root.path().join("16386/2/GPDB_7_302307241");
        let shared = root.path().join("16386/1/GPDB_7_302307241");
        fs::create_dir_all(lone.join("12812")).unwrap();
        fs::create_dir_all(&shared).unwrap();
        // A 5-series database directory sharing the dbid 1 parent.
        fs::write(root.path().join("16386/1/PG_VERSION"), "5").unwrap();

        let dirs = [lone.clone(), shared.clone()];
        let streams = BufferedStreams::new();
        delete_tablespace_directories(&OsFs, &dirs, "sdw1", &streams).unwrap();

        assert!(!lone.exists());
        assert!(!root.path().join("16386/2").exists());
        assert!(!shared.exists());
        assert!(root.path().join("16386/1/PG_VERSION").exists());
        assert!(streams.stdout_string().contains("GPDB_7_302307241"));

        // Re-running finds nothing to do.
        delete_tablespace_directories(&OsFs, &dirs, "sdw1", &BufferedStreams::new()).unwrap();
    }

    #[test]
    fn delete_resumes_after_failed_parent_removal() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("16386/3/GPDB_7_302307241");
        fs::create_dir_all(&dir).unwrap();
        let parent = root.path().join("16386/3");

        let fake = FakeFs::new();
        fake.fail(FsOp::RemoveDir, &parent, io::ErrorKind::Other);
        assert!(
            delete_tablespace_directories(&fake, &[dir.clone()], "sdw1", &BufferedStreams::new())
                .is_err()
        );
        assert!(!dir.exists());
        assert!(parent.exists());

        delete_tablespace_directories(&OsFs, &[dir], "sdw1", &BufferedStreams::new()).unwrap();
        assert!(!parent.exists());
    }

    #[test]
    fn verify_accepts_legacy_and_current_layouts() {
        let root = tempfile::tempdir().unwrap();
        let location = root.path().join("16385");
        fs::create_dir_all(location.join("12094/16384")).unwrap();
        fs::write(location.join("12094/PG_VERSION"), "5").unwrap();
        fs::create_dir_all(location.join("1/GPDB_6_301908232/12812")).unwrap();
        fs::write(location.join("stray-file"), "").unwrap();

        verify_tablespace_directories(&OsFs, &[location]).unwrap();
    }

    #[test]
    fn verify_reports_unknown_shapes() {
        let root = tempfile::tempdir().unwrap();
        let location = root.path().join("16385");
        fs::create_dir_all(location.join("1/not_gpdb")).unwrap();
        fs::create_dir_all(location.join("2")).unwrap();

        let err = verify_tablespace_directories(&OsFs, &[location.clone()]).unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("2 errors occurred:"), "{text}");
        assert!(text.contains("to start with 'GPDB_'"), "{text}");
        assert!(
            text.contains(&format!("Invalid tablespace directory {}", location.join("2").display())),
            "{text}"
        );
    }

    #[test]
    fn verify_rejects_empty_location() {
        let root = tempfile::tempdir().unwrap();
        let err = verify_tablespace_directories(&OsFs, &[root.path().to_path_buf()]).unwrap_err();
        assert!(matches!(err, UpgradeError::UnrecognizedTablespaceDirectory(_)));
    }
}
