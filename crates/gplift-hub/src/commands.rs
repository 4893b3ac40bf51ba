//! External tools driven from the hub: `rsync`, `gpinitsystem`,
//! `pg_controldata`, the coordinator's `pg_upgrade`, and in-place rewrites
//! of configuration files.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use gplift_cluster::{Cluster, ClusterRunner};
use gplift_core::{
    BufferedStreams, Command, ErrorList, Launcher, NextActionError, OutStreams, SharedBuf, SharedStreams,
    atomically_write, bin_path,
};
use gplift_upgrade::run as pg_upgrade;
use gplift_upgrade::{Mode, SegmentPair, UpgradeOptions, UpgradeSegment, segment_working_directory};
use regex::Regex;
use semver::Version;
use tracing::{debug, info};

use crate::error::{HubError, HubResult};

/// Copy of the freshly initialized target coordinator, taken before any
/// upgrade touches it.
pub const COORDINATOR_BACKUP: &str = "coordinator.bak";

/// Copy of the upgraded coordinator shipped to every segment host.
pub const UPGRADED_COORDINATOR_BACKUP: &str = "upgraded-coordinator.bak";

/// Coordinator tablespaces and the mapping file, shipped to segment hosts.
pub const TABLESPACES_DIR: &str = "tablespaces";

/// Files a primary keeps when its data directory is overwritten from the
/// upgraded coordinator.
pub const COORDINATOR_BACKUP_EXCLUDES: [&str; 7] = [
    "internal.auto.conf",
    "postgresql.conf",
    "pg_hba.conf",
    "postmaster.opts",
    "gp_dbid",
    "gpssh.conf",
    "gpperfmon",
];

const UPGRADE_NEXT_ACTION: &str = "If you haven't run pre-initialize data migration scripts at the start, please run them.\n\
Consult the gplift documentation for details on the pg_upgrade check error.";

// ── rsync ──────────────────────────────────────────────────────────

/// `dir/`, so that rsync copies the contents rather than the directory.
pub fn contents_of(dir: &Path) -> String {
    let text = dir.to_string_lossy();
    format!("{}/", text.trim_end_matches('/'))
}

pub fn rsync_command(sources: &[String], destination: &str, options: &[&str], excludes: &[&str]) -> Command {
    let mut cmd = Command::new("rsync").args(options.iter().copied());
    for exclude in excludes {
        cmd = cmd.arg("--exclude").arg(*exclude);
    }
    cmd.args(sources.iter().cloned()).arg(destination)
}

pub async fn rsync(
    launcher: &dyn Launcher,
    streams: SharedStreams,
    sources: &[String],
    destination: &str,
    options: &[&str],
    excludes: &[&str],
) -> HubResult<()> {
    let cmd = rsync_command(sources, destination, options, excludes);
    info!(command = %cmd, "running rsync");
    launcher
        .run_checked(&cmd, streams)
        .await
        .map_err(|err| HubError::from(err).context(format!("rsync {sources:?} to {destination:?}")))
}

/// Mirrors one coordinator data directory onto another, leaving server logs
/// behind.
pub async fn rsync_coordinator_data_dir(
    launcher: &dyn Launcher,
    streams: SharedStreams,
    source: &Path,
    target: &Path,
) -> HubResult<()> {
    rsync(
        launcher,
        streams,
        &[contents_of(source)],
        &target.to_string_lossy(),
        &["--archive", "--delete"],
        &["pg_log/*"],
    )
    .await
}

/// Copies `sources` to `destination` on every host in parallel. Each host's
/// output is written to `streams` once all copies finish.
pub async fn copy_to_hosts(
    launcher: &dyn Launcher,
    streams: &dyn OutStreams,
    sources: &[String],
    destination: &Path,
    hosts: &[String],
) -> HubResult<()> {
    let copies = hosts.iter().map(|host| async move {
        let buffered = BufferedStreams::new();
        let remote = format!("{host}:{}", destination.display());
        let result = rsync(
            launcher,
            Arc::new(buffered.clone()),
            sources,
            &remote,
            &["--archive", "--compress", "--delete", "--stats"],
            &[],
        )
        .await
        .map_err(|err| {
            err.context(format!(
                "copying {sources:?} to {} on host {host}",
                destination.display()
            ))
        });
        (buffered, result)
    });

    let mut errors = Vec::new();
    let (mut out, mut err_out) = (streams.stdout(), streams.stderr());
    for (buffered, result) in join_all(copies).await {
        out.write_all(&buffered.stdout_bytes())?;
        err_out.write_all(&buffered.stderr_bytes())?;
        if let Err(err) = result {
            errors.push(err);
        }
    }
    ErrorList::fold(errors)
}

// ── Target cluster creation ────────────────────────────────────────

/// Runs `gpinitsystem` against `config_path`. Only `HOME`, `USER` and
/// `LOGNAME` are carried over from the hub's environment.
pub async fn init_target_cluster(
    launcher: &dyn Launcher,
    streams: SharedStreams,
    gphome: &Path,
    coordinator_datadir: &Path,
    coordinator_port: u16,
    config_path: &Path,
    version: &Version,
) -> HubResult<()> {
    let config = config_path.to_string_lossy();
    let mut args = vec!["-a", "-I", &*config];
    if version.major < 7 {
        // 7 and later already exit 0 on warnings.
        args.push("--ignore-warnings");
    }

    let forwarded: Vec<(&str, String)> = ["HOME", "USER", "LOGNAME"]
        .into_iter()
        .filter_map(|key| std::env::var(key).ok().map(|value| (key, value)))
        .collect();
    let env: Vec<(&str, &str)> = forwarded.iter().map(|(k, v)| (*k, v.as_str())).collect();

    let runner = ClusterRunner::new(launcher, gphome, coordinator_datadir, coordinator_port, streams);
    runner
        .run_with_env("gpinitsystem", &args, &env)
        .await
        .map_err(|err| HubError::from(err).context("initialize target cluster"))
}

/// The catalog version recorded in a data directory's control file.
pub async fn catalog_version(launcher: &dyn Launcher, gphome: &Path, datadir: &Path) -> HubResult<String> {
    let cmd = Command::new(bin_path(gphome, "pg_controldata"))
        .arg(datadir.to_string_lossy())
        .env_clear();
    let output = launcher.output_checked(&cmd).await?;
    let version = parse_catalog_version(&output.stdout_string())?;
    debug!(datadir = %datadir.display(), %version, "read catalog version");
    Ok(version)
}

pub fn parse_catalog_version(output: &str) -> HubResult<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("Catalog version number:"))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(HubError::UnknownCatalogVersion)
}

// ── Coordinator upgrade ────────────────────────────────────────────

/// Forwards stdout to an inner pair while keeping a copy.
struct TeeStreams {
    inner: SharedStreams,
    copy: SharedBuf,
}

struct TeeWriter {
    inner: Box<dyn Write + Send>,
    copy: SharedBuf,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write_all(buf)?;
        self.copy.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl OutStreams for TeeStreams {
    fn stdout(&self) -> Box<dyn Write + Send> {
        Box::new(TeeWriter {
            inner: self.inner.stdout(),
            copy: self.copy.clone(),
        })
    }

    fn stderr(&self) -> Box<dyn Write + Send> {
        self.inner.stderr()
    }
}

pub struct CoordinatorUpgrade<'a> {
    pub state_dir: &'a Path,
    pub source: &'a Cluster,
    pub intermediate: &'a Cluster,
    pub check_only: bool,
    pub link_mode: bool,
    pub tablespace_file: Option<PathBuf>,
}

impl CoordinatorUpgrade<'_> {
    fn action(&self) -> &'static str {
        if self.check_only { "check" } else { "upgrade" }
    }

    fn pair(&self) -> SegmentPair {
        let (source, target) = (self.source.coordinator(), self.intermediate.coordinator());
        SegmentPair {
            source: UpgradeSegment {
                bin_dir: self.source.bin_dir(),
                data_dir: source.datadir.clone(),
                dbid: source.dbid,
                port: source.port,
            },
            target: UpgradeSegment {
                bin_dir: self.intermediate.bin_dir(),
                data_dir: target.datadir.clone(),
                dbid: target.dbid,
                port: target.port,
            },
        }
    }

    fn options(&self) -> UpgradeOptions {
        // A 5-series coordinator needs its standby's dbid to keep WAL in sync.
        let old_options = match self.source.standby() {
            Some(standby) if self.source.version.major == 5 => Some(format!("-x {}", standby.dbid)),
            _ => None,
        };
        UpgradeOptions {
            check_only: self.check_only,
            link_mode: self.link_mode,
            old_options,
            tablespace_file: self.tablespace_file.clone(),
            ..UpgradeOptions::new(Mode::Dispatcher, self.intermediate.version.clone())
        }
    }

    /// Restores the pristine target coordinator from its backup, then runs
    /// `pg_upgrade` in dispatcher mode.
    ///
    /// When the output reports a fatal problem the error carries everything
    /// from that line on, with pg_upgrade's report files named by full path.
    pub async fn run(&self, launcher: &dyn Launcher, streams: SharedStreams) -> HubResult<()> {
        rsync_coordinator_data_dir(
            launcher,
            streams.clone(),
            &self.state_dir.join(COORDINATOR_BACKUP),
            self.intermediate.coordinator_datadir(),
        )
        .await?;

        let copy = SharedBuf::default();
        let tee: SharedStreams = Arc::new(TeeStreams {
            inner: streams,
            copy: copy.clone(),
        });

        let pair = self.pair();
        let opts = self.options();
        let Err(err) = pg_upgrade::run(launcher, self.state_dir, -1, &pair, &opts, tee).await else {
            return Ok(());
        };

        let stdout = match copy.0.lock() {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(poisoned) => String::from_utf8_lossy(&poisoned.into_inner()).into_owned(),
        };
        let Some(mut details) = fatal_context(&stdout) else {
            return Err(HubError::from(err).context(format!("{} coordinator", self.action())));
        };

        let work_dir = segment_working_directory(self.state_dir, -1);
        let mut problems = vec![HubError::from(err)];
        match fs::read_dir(&work_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    details = details.replace(&name, &work_dir.join(&name).to_string_lossy());
                }
            }
            Err(err) => problems.push(err.into()),
        }
        let summary = match ErrorList::fold(problems) {
            Ok(()) => String::new(),
            Err(err) => err.to_string(),
        };

        Err(NextActionError::new(
            format!("{} coordinator: {summary}\n\n{details}", self.action()),
            UPGRADE_NEXT_ACTION,
        )
        .into())
    }
}

/// Output from the first line mentioning `fatal` to the end.
fn fatal_context(stdout: &str) -> Option<String> {
    let lines: Vec<&str> = stdout
        .lines()
        .skip_while(|line| !line.contains("fatal"))
        .collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

// ── Configuration files ────────────────────────────────────────────

/// Pattern matching a `port = <port>` line in `postgresql.conf`.
pub fn port_pattern(port: u16) -> String {
    format!(r"(?m)(^port[ \t]*=[ \t]*){port}([^0-9]|$)")
}

pub fn port_replacement(port: u16) -> String {
    format!("${{1}}{port}${{2}}")
}

/// Rewrites `path` with every match of `pattern` replaced. The previous
/// contents are kept as `<path>.bak`.
pub fn update_configuration_file(path: &Path, pattern: &str, replacement: &str) -> HubResult<()> {
    let regex = Regex::new(pattern)?;
    let original = fs::read_to_string(path)
        .map_err(|err| HubError::from(err).context(format!("update {}", path.display())))?;
    let updated = regex.replace_all(&original, replacement);

    let mut backup = path.as_os_str().to_os_string();
    backup.push(".bak");
    fs::write(PathBuf::from(backup), &original)?;
    atomically_write(path, updated.as_bytes())?;
    debug!(path = %path.display(), pattern, "updated configuration file");
    Ok(())
}
