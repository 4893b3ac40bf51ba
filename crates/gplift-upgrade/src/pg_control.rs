//! Restoring `global/pg_control` after a link-mode upgrade.
//!
//! `pg_upgrade --link` renames the source's control file to
//! `pg_control.old` so the source cannot be started by accident. Reverting
//! puts it back.

use std::io::Write;
use std::path::Path;

use gplift_core::{FileSystem, OutStreams};
use tracing::debug;

use crate::directories::already_renamed;
use crate::error::{UpgradeError, UpgradeResult};

/// Renames `<datadir>/global/pg_control.old` to `<datadir>/global/pg_control`.
pub fn restore_pg_control(fs: &dyn FileSystem, datadir: &Path, streams: &dyn OutStreams) -> UpgradeResult<()> {
    let global = datadir.join("global");
    let src = global.join("pg_control.old");
    let dst = global.join("pg_control");
    let (src_text, dst_text) = (src.display().to_string(), dst.display().to_string());
    let mut out = streams.stdout();

    // The destination plays the archive's part: present with the source gone.
    if already_renamed(fs, &dst, &src)? {
        debug!(src = %src_text, dst = %dst_text, "pg_control already restored");
        write!(out, "already renamed {src_text:?} to {dst_text:?}")?;
        return Ok(());
    }

    debug!(src = %src_text, dst = %dst_text, "restoring pg_control");
    write!(out, "renaming {src_text:?} to {dst_text:?}")?;
    fs.rename(&src, &dst).map_err(UpgradeError::fs("rename", &src))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use gplift_core::{BufferedStreams, OsFs};

    use super::*;

    #[test]
    fn restores_once_then_reports_done() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global");
        fs::create_dir_all(&global).unwrap();
        fs::write(global.join("pg_control.old"), "control").unwrap();

        let streams = BufferedStreams::new();
        restore_pg_control(&OsFs, dir.path(), &streams).unwrap();
        assert_eq!(fs::read_to_string(global.join("pg_control")).unwrap(), "control");
        assert!(!global.join("pg_control.old").exists());
        assert!(streams.stdout_string().starts_with("renaming "));

        let streams = BufferedStreams::new();
        restore_pg_control(&OsFs, dir.path(), &streams).unwrap();
        assert!(streams.stdout_string().starts_with("already renamed "));
    }

    #[test]
    fn missing_control_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("global")).unwrap();

        let err = restore_pg_control(&OsFs, dir.path(), &BufferedStreams::new()).unwrap_err();
        assert!(matches!(err, UpgradeError::Fs { action: "rename", .. }));
    }
}
