//! Renaming, archiving and deleting segment data directories.
//!
//! Every operation here may be interrupted at any point and re-run; each
//! checks for the state a previous partial run leaves behind before acting.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone};
use gplift_core::{ErrorList, FileSystem, OutStreams, UpgradeId};
use tracing::debug;

use crate::error::{UpgradeError, UpgradeResult};

/// Appended to a target directory path to name the source's archive.
pub const OLD_SUFFIX: &str = ".old";

pub const PG_VERSION: &str = "PG_VERSION";

/// Files whose presence marks a postgres data directory.
pub const POSTGRES_FILES: [&str; 2] = ["postgresql.conf", PG_VERSION];

/// Files whose presence marks a gplift state directory.
pub const STATE_DIRECTORY_FILES: [&str; 2] = ["config.json", "status.json"];

/// Whether a move to `archive` has already happened: the archive exists and
/// the target it was made from does not.
pub fn already_renamed(fs: &dyn FileSystem, archive: &Path, target: &Path) -> io::Result<bool> {
    Ok(fs.exists(archive)? && !fs.exists(target)?)
}

/// Moves `source` to `archive` and, when `rename_target` is set, `target`
/// into `source`'s place.
///
/// A missing `source` means a previous run already archived it.
pub fn rename_data_directory(
    fs: &dyn FileSystem,
    source: &Path,
    archive: &Path,
    target: &Path,
    rename_target: bool,
) -> UpgradeResult<()> {
    if already_renamed(fs, archive, target)? {
        debug!(archive = %archive.display(), "data directory already renamed");
        return Ok(());
    }

    match fs.rename(source, archive) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(
                source = %source.display(),
                archive = %archive.display(),
                "source already archived by a previous run"
            );
        }
        Err(err) => return Err(UpgradeError::fs("archive", source)(err)),
    }

    if rename_target {
        fs.rename(target, source)
            .map_err(UpgradeError::fs("rename", target))?;
    }
    Ok(())
}

/// Archives `source` as `<target>.old` and, when `rename_target` is set,
/// moves `target` into `source`'s place.
///
/// For example `/data/primary/seg0` becomes `/data/primary/seg.ID.0.old` and
/// `/data/primary/seg.ID.0` becomes `/data/primary/seg0`. Without
/// `rename_target` only the archive is made, for segments whose upgraded
/// copy lives elsewhere.
pub fn archive_source(
    fs: &dyn FileSystem,
    source: &Path,
    target: &Path,
    rename_target: bool,
) -> UpgradeResult<()> {
    let archive = archive_path(target);
    if already_renamed(fs, &archive, target)? {
        debug!(archive = %archive.display(), "data directory already archived");
        return Ok(());
    }

    if fs.exists(source)? {
        verify_data_directory(fs, [source])?;
    }
    if rename_target {
        verify_data_directory(fs, [target])?;
    }

    rename_data_directory(fs, source, &archive, target, rename_target)
}

/// `<target>.old`.
pub fn archive_path(target: &Path) -> PathBuf {
    let mut archive = target.as_os_str().to_os_string();
    archive.push(OLD_SUFFIX);
    PathBuf::from(archive)
}

/// A temporary data directory for the upgraded copy of `datadir`, placed
/// next to it.
///
/// When the basename starts with `prefix` the rest is kept as a suffix:
/// `/data/seg-1` becomes `/data/seg.<id>.-1`. Other basenames, such as a
/// standby's, become `<basename>.<id>`.
pub fn temp_data_dir(datadir: &Path, prefix: &str, id: UpgradeId) -> PathBuf {
    let base = datadir
        .file_name()
        .map(|b| b.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = datadir.parent().unwrap_or_else(|| Path::new("/"));

    let name = match base.strip_prefix(prefix) {
        Some(suffix) if !prefix.is_empty() => format!("{prefix}.{id}.{suffix}"),
        _ => format!("{base}.{id}"),
    };
    parent.join(name)
}

/// Checks that each directory contains `postgresql.conf` and `PG_VERSION`,
/// reporting every missing file.
pub fn verify_data_directory<I, P>(fs: &dyn FileSystem, dirs: I) -> UpgradeResult<()>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut errors = Vec::new();
    for dir in dirs {
        let dir = dir.as_ref();
        for file in POSTGRES_FILES {
            if !fs.exists(&dir.join(file))? {
                errors.push(UpgradeError::InvalidDataDirectory {
                    path: dir.to_path_buf(),
                    file,
                });
            }
        }
    }
    ErrorList::fold(errors)
}

/// Removes each directory that contains every one of `required_paths`.
///
/// Missing directories are reported and skipped. Directories that fail
/// verification are left in place and reported together at the end.
pub fn delete_directories(
    fs: &dyn FileSystem,
    dirs: &[PathBuf],
    required_paths: &[&str],
    host: &str,
    streams: &dyn OutStreams,
) -> UpgradeResult<()> {
    let mut out = streams.stdout();
    let mut errors = Vec::new();

    for dir in dirs {
        debug!(dir = %dir.display(), host, "deleting directory");
        writeln!(out, "Deleting directory: {:?} on host {host:?}", dir.display().to_string())?;

        if !fs.exists(dir)? {
            writeln!(
                out,
                "directory: {:?} does not exist on host {host:?}",
                dir.display().to_string()
            )?;
            continue;
        }

        let mut verified = true;
        for required in required_paths {
            let path = dir.join(required);
            if let Err(err) = fs.stat(&path) {
                errors.push(UpgradeError::fs("stat", path)(err));
                verified = false;
            }
        }
        if !verified {
            continue;
        }

        if let Err(err) = fs.remove_all(dir) {
            errors.push(UpgradeError::fs("remove", dir)(err));
        }
    }

    ErrorList::fold(errors)
}

/// `gplift-<id>-<YYYY-MM-DDTHH:MM>`, the name log directories are archived
/// under.
pub fn archive_directory_name<Tz>(id: UpgradeId, time: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!("gplift-{id}-{}", time.format("%Y-%m-%dT%H:%M"))
}
