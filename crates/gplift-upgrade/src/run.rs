//! Invoking `pg_upgrade` for one segment.
//!
//! The argument order is fixed so that logged command lines are stable
//! across runs and hosts.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use gplift_core::{Command, Launcher, SharedStreams};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{UpgradeError, UpgradeResult};

/// Library search path forwarded to `pg_upgrade`; nothing else is.
const FORWARDED_ENV: &str = "LD_LIBRARY_PATH";

/// One side of a segment upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeSegment {
    pub bin_dir: PathBuf,
    pub data_dir: PathBuf,
    pub dbid: i32,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentPair {
    pub source: UpgradeSegment,
    pub target: UpgradeSegment,
}

/// `--mode`: dispatcher for the coordinator, segment for everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Dispatcher,
    Segment,
    Unknown,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Dispatcher => "dispatcher",
            Mode::Segment => "segment",
            Mode::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeOptions {
    pub mode: Mode,
    pub check_only: bool,
    pub link_mode: bool,
    pub old_options: Option<String>,
    pub tablespace_file: Option<PathBuf>,
    /// Decides whether `--old-gp-dbid`/`--new-gp-dbid` are passed; 7.0 and
    /// later read the dbid from the data directory.
    pub target_version: Version,
}

impl UpgradeOptions {
    pub fn new(mode: Mode, target_version: Version) -> Self {
        Self {
            mode,
            check_only: false,
            link_mode: false,
            old_options: None,
            tablespace_file: None,
            target_version,
        }
    }
}

/// `<state_dir>/pg_upgrade/seg<content>`.
pub fn segment_working_directory(state_dir: &Path, content_id: i32) -> PathBuf {
    state_dir
        .join("pg_upgrade")
        .join(format!("seg{content_id}"))
}

/// Arguments for `pg_upgrade`, in invocation order.
pub fn pg_upgrade_args(pair: &SegmentPair, opts: &UpgradeOptions) -> Vec<String> {
    let path = |p: &Path| p.to_string_lossy().into_owned();

    let mut args = vec![
        "--retain".to_string(),
        "--progress".to_string(),
        "--old-bindir".to_string(),
        path(&pair.source.bin_dir),
        "--new-bindir".to_string(),
        path(&pair.target.bin_dir),
        "--old-datadir".to_string(),
        path(&pair.source.data_dir),
        "--new-datadir".to_string(),
        path(&pair.target.data_dir),
        "--old-port".to_string(),
        pair.source.port.to_string(),
        "--new-port".to_string(),
        pair.target.port.to_string(),
        "--mode".to_string(),
        opts.mode.to_string(),
    ];

    if opts.check_only {
        args.push("--check".into());
    }
    if opts.link_mode {
        args.push("--link".into());
    }
    if let Some(old_options) = &opts.old_options {
        args.push("--old-options".into());
        args.push(old_options.clone());
    }
    if let Some(file) = opts.tablespace_file.as_deref().filter(|_| !opts.check_only) {
        args.push("--old-tablespaces-file".into());
        args.push(path(file));
    }
    if opts.target_version.major < 7 {
        args.push("--old-gp-dbid".into());
        args.push(pair.source.dbid.to_string());
        args.push("--new-gp-dbid".into());
        args.push(pair.target.dbid.to_string());
    }
    args
}

pub fn pg_upgrade_command(pair: &SegmentPair, opts: &UpgradeOptions, work_dir: &Path) -> Command {
    let mut cmd = Command::new(pair.target.bin_dir.join("pg_upgrade"))
        .args(pg_upgrade_args(pair, opts))
        .current_dir(work_dir)
        .env_clear();
    if let Some(value) = env::var_os(FORWARDED_ENV) {
        cmd = cmd.env(FORWARDED_ENV, value.to_string_lossy());
    }
    cmd
}

/// Runs `pg_upgrade` for `pair` from its per-segment working directory,
/// creating that directory if needed.
///
/// A non-zero exit is returned as [`gplift_core::CoreError::Exit`] with the
/// child's code intact.
pub async fn run(
    launcher: &dyn Launcher,
    state_dir: &Path,
    content_id: i32,
    pair: &SegmentPair,
    opts: &UpgradeOptions,
    streams: SharedStreams,
) -> UpgradeResult<()> {
    let work_dir = segment_working_directory(state_dir, content_id);
    std::fs::create_dir_all(&work_dir).map_err(UpgradeError::fs("create working directory", &work_dir))?;

    let cmd = pg_upgrade_command(pair, opts, &work_dir);
    info!(content = content_id, mode = %opts.mode, check = opts.check_only, "running pg_upgrade");
    launcher.run_checked(&cmd, streams).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gplift_core::{BufferedStreams, CoreError, Env, FakeLauncher, FakeResponse};

    use super::*;

    fn pair() -> SegmentPair {
        SegmentPair {
            source: UpgradeSegment {
                bin_dir: "/usr/local/gpdb6/bin".into(),
                data_dir: "/data/qddir/seg-1".into(),
                dbid: 1,
                port: 15432,
            },
            target: UpgradeSegment {
                bin_dir: "/usr/local/gpdb7/bin".into(),
                data_dir: "/data/qddir/seg.AAAAAAAAAAA.-1".into(),
                dbid: 1,
                port: 6000,
            },
        }
    }

    #[test]
    fn dispatcher_args_for_6x_target_include_dbids() {
        let opts = UpgradeOptions {
            link_mode: true,
            old_options: Some("-c gp_role=utility".into()),
            tablespace_file: Some("/home/gpadmin/.gplift/tablespaces.txt".into()),
            ..UpgradeOptions::new(Mode::Dispatcher, Version::new(6, 20, 0))
        };

        assert_eq!(
            pg_upgrade_args(&pair(), &opts).join(" "),
            "--retain --progress \
             --old-bindir /usr/local/gpdb6/bin --new-bindir /usr/local/gpdb7/bin \
             --old-datadir /data/qddir/seg-1 --new-datadir /data/qddir/seg.AAAAAAAAAAA.-1 \
             --old-port 15432 --new-port 6000 --mode dispatcher \
             --link --old-options -c gp_role=utility \
             --old-tablespaces-file /home/gpadmin/.gplift/tablespaces.txt \
             --old-gp-dbid 1 --new-gp-dbid 1"
        );
    }

    #[test]
    fn check_mode_omits_tablespace_file_and_7x_omits_dbids() {
        let opts = UpgradeOptions {
            check_only: true,
            tablespace_file: Some("/ts.txt".into()),
            ..UpgradeOptions::new(Mode::Segment, Version::new(7, 0, 0))
        };
        let args = pg_upgrade_args(&pair(), &opts);

        assert_eq!(&args[14..], ["--mode", "segment", "--check"]);
        assert!(!args.iter().any(|a| a == "--old-tablespaces-file"));
        assert!(!args.iter().any(|a| a.contains("gp-dbid")));
    }

    #[test]
    fn working_directory_is_per_content() {
        assert_eq!(
            segment_working_directory(Path::new("/home/gpadmin/.gplift"), -1),
            PathBuf::from("/home/gpadmin/.gplift/pg_upgrade/seg-1")
        );
    }

    #[tokio::test]
    async fn run_creates_work_dir_and_clears_environment() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::new();
        launcher.push("pg_upgrade", FakeResponse::success().with_stdout("Upgrade Complete\n"));
        let streams = BufferedStreams::new();

        let opts = UpgradeOptions::new(Mode::Segment, Version::new(7, 0, 0));
        run(&launcher, dir.path(), 2, &pair(), &opts, Arc::new(streams.clone()))
            .await
            .unwrap();

        let work_dir = dir.path().join("pg_upgrade/seg2");
        assert!(work_dir.is_dir());
        assert_eq!(streams.stdout_string(), "Upgrade Complete\n");

        let call = &launcher.calls()[0];
        assert_eq!(call.current_dir.as_deref(), Some(work_dir.as_path()));
        assert!(call.program.ends_with("pg_upgrade"));
        let Env::Replace(vars) = &call.env else {
            panic!("environment must be replaced");
        };
        assert!(vars.iter().all(|(k, _)| k == FORWARDED_ENV));
        assert!(call.env_var("PGPORT").is_none());

        // Re-running tolerates the existing working directory.
        run(&launcher, dir.path(), 2, &pair(), &opts, Arc::new(streams.clone()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn nonzero_exit_keeps_code() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::new();
        launcher.push("pg_upgrade", FakeResponse::exit(3));

        let opts = UpgradeOptions::new(Mode::Dispatcher, Version::new(7, 0, 0));
        let err = run(&launcher, dir.path(), -1, &pair(), &opts, Arc::new(BufferedStreams::new()))
            .await
            .unwrap_err();
        let UpgradeError::Core(core) = err else {
            panic!("expected a process error, got {err:?}");
        };
        assert!(matches!(core, CoreError::Exit { .. }));
        assert_eq!(core.exit_code(), Some(3));
    }
}
