//! Agent-side work: what `gplift agent <command>` does on a segment host.
//!
//! Handlers write progress to a buffer that is returned to the hub as the
//! agent's output. Per-segment work runs concurrently; every failure is
//! reported.

use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use gplift_cluster::tablespace::{coordinator_tablespace_location, location_for_dbid};
use gplift_core::{BufferedStreams, ErrorList, FileSystem, Launcher, OutStreams, SharedStreams};
use gplift_upgrade::run as pg_upgrade;
use gplift_upgrade::{
    Mode, POSTGRES_FILES, STATE_DIRECTORY_FILES, SegmentPair, UpgradeOptions, UpgradeSegment, archive_source,
    delete_directories, delete_tablespace_directories, restore_pg_control,
};
use tracing::{debug, info};

use crate::agents::{AgentRequest, AgentSegment, ConfUpdate, RenameDirectories, UpgradePrimaries};
use crate::commands::{COORDINATOR_BACKUP_EXCLUDES, contents_of, rsync, update_configuration_file};
use crate::error::{HubError, HubResult};

/// What an agent needs to serve requests on its host.
#[derive(Clone)]
pub struct AgentContext {
    pub launcher: Arc<dyn Launcher>,
    pub fs: Arc<dyn FileSystem>,
    /// This host's gplift state directory.
    pub state_dir: PathBuf,
    /// This host's gplift log directory.
    pub log_dir: PathBuf,
    pub hostname: String,
}

/// Serves one request, returning everything it printed.
pub async fn handle(ctx: &AgentContext, request: AgentRequest) -> HubResult<String> {
    let buffered = BufferedStreams::new();
    let streams: SharedStreams = Arc::new(buffered.clone());
    info!(host = %ctx.hostname, command = request.command(), "serving agent request");

    let result = match request {
        AgentRequest::UpgradePrimaries(req) => upgrade_primaries(ctx, &req, streams).await,
        AgentRequest::RenameDirectories { dirs } => rename_directories(ctx, &dirs),
        AgentRequest::DeleteDataDirectories { datadirs } => {
            delete_directories(ctx.fs.as_ref(), &datadirs, &POSTGRES_FILES, &ctx.hostname, streams.as_ref())
                .map_err(HubError::from)
        }
        AgentRequest::DeleteTablespaces { dirs } => {
            delete_tablespace_directories(ctx.fs.as_ref(), &dirs, &ctx.hostname, streams.as_ref())
                .map_err(HubError::from)
        }
        AgentRequest::RestorePgControl { datadirs } => restore_pg_controls(ctx, &datadirs, streams.as_ref()),
        AgentRequest::UpdateConfiguration { files } => update_configuration(&files),
        AgentRequest::DeleteStateDirectory => delete_directories(
            ctx.fs.as_ref(),
            std::slice::from_ref(&ctx.state_dir),
            &STATE_DIRECTORY_FILES,
            &ctx.hostname,
            streams.as_ref(),
        )
        .map_err(HubError::from),
        AgentRequest::ArchiveLogDirectory { new_dir } => archive_log_directory(ctx.fs.as_ref(), &ctx.log_dir, &new_dir),
    };

    let mut output = buffered.stdout_string();
    output.push_str(&buffered.stderr_string());
    result.map(|()| output)
}

// ── Upgrade primaries ──────────────────────────────────────────────

async fn upgrade_primaries(ctx: &AgentContext, req: &UpgradePrimaries, streams: SharedStreams) -> HubResult<()> {
    let action = if req.check_only { "check" } else { "upgrade" };
    let upgrades = req.segments.iter().map(|seg| {
        let streams = streams.clone();
        async move {
            upgrade_segment(ctx, req, seg, streams).await.map_err(|err| {
                err.context(format!(
                    "{action} primary on host {} with content {}",
                    ctx.hostname, seg.content
                ))
            })
        }
    });

    let errors = join_all(upgrades).await.into_iter().filter_map(Result::err);
    ErrorList::fold(errors)
}

async fn upgrade_segment(
    ctx: &AgentContext,
    req: &UpgradePrimaries,
    seg: &AgentSegment,
    streams: SharedStreams,
) -> HubResult<()> {
    if !req.check_only {
        if let Some(backup) = &req.coordinator_backup_dir {
            rsync(
                ctx.launcher.as_ref(),
                streams.clone(),
                &[contents_of(backup)],
                &seg.target_datadir.to_string_lossy(),
                &["--archive", "--delete"],
                &COORDINATOR_BACKUP_EXCLUDES,
            )
            .await
            .map_err(|err| err.context("restore coordinator data directory backup"))?;
        }
        if let Some(mapping_file) = &req.tablespaces_mapping_file {
            restore_tablespaces(ctx, mapping_file, seg, streams.clone())
                .await
                .map_err(|err| err.context("restore tablespaces"))?;
        }
    }

    let pair = SegmentPair {
        source: UpgradeSegment {
            bin_dir: req.source_bin_dir.clone(),
            data_dir: seg.source_datadir.clone(),
            dbid: seg.dbid,
            port: seg.source_port,
        },
        target: UpgradeSegment {
            bin_dir: req.target_bin_dir.clone(),
            data_dir: seg.target_datadir.clone(),
            dbid: seg.dbid,
            port: seg.target_port,
        },
    };
    let opts = UpgradeOptions {
        check_only: req.check_only,
        link_mode: req.link_mode,
        tablespace_file: req.tablespaces_mapping_file.clone(),
        ..UpgradeOptions::new(Mode::Segment, req.target_version.clone())
    };
    pg_upgrade::run(ctx.launcher.as_ref(), &ctx.state_dir, seg.content, &pair, &opts, streams).await?;
    Ok(())
}

/// Copies the upgraded coordinator's user-defined tablespaces into this
/// segment's tablespace locations and points `pg_tblspc` at them.
async fn restore_tablespaces(
    ctx: &AgentContext,
    mapping_file: &Path,
    seg: &AgentSegment,
    streams: SharedStreams,
) -> HubResult<()> {
    let base = mapping_file.parent().unwrap_or_else(|| Path::new("/"));

    for (oid, info) in seg.tablespaces.iter().filter(|(_, info)| info.user_defined) {
        let target = location_for_dbid(info, seg.dbid);
        let source = coordinator_tablespace_location(base, *oid);
        rsync(
            ctx.launcher.as_ref(),
            streams.clone(),
            &[contents_of(&source)],
            &target.to_string_lossy(),
            &["--archive", "--delete"],
            &[],
        )
        .await?;

        let link = seg.target_datadir.join("pg_tblspc").join(oid.to_string());
        recreate_symlink(&target, &link)?;
    }
    Ok(())
}

fn recreate_symlink(original: &Path, link: &Path) -> HubResult<()> {
    match std::fs::symlink_metadata(link) {
        Ok(_) => std::fs::remove_file(link)
            .map_err(|err| HubError::from(err).context(format!("unlink {:?}", link.display().to_string())))?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(HubError::from(err).context(format!("stat symbolic link {:?}", link.display().to_string())));
        }
    }

    debug!(link = %link.display(), original = %original.display(), "linking tablespace");
    symlink(original, link).map_err(|err| {
        HubError::from(err).context(format!(
            "create symbolic link {:?} to directory {:?}",
            link.display().to_string(),
            original.display().to_string()
        ))
    })
}

// ── Directories and files ──────────────────────────────────────────

fn rename_directories(ctx: &AgentContext, dirs: &[RenameDirectories]) -> HubResult<()> {
    let errors = dirs.iter().filter_map(|dir| {
        archive_source(ctx.fs.as_ref(), &dir.source, &dir.target, dir.rename_target)
            .err()
            .map(HubError::from)
    });
    ErrorList::fold(errors)
}

fn restore_pg_controls(ctx: &AgentContext, datadirs: &[PathBuf], streams: &dyn OutStreams) -> HubResult<()> {
    let errors = datadirs.iter().filter_map(|datadir| {
        restore_pg_control(ctx.fs.as_ref(), datadir, streams)
            .err()
            .map(HubError::from)
    });
    ErrorList::fold(errors)
}

fn update_configuration(files: &[ConfUpdate]) -> HubResult<()> {
    let errors = files.iter().filter_map(|file| {
        update_configuration_file(&file.path, &file.pattern, &file.replacement)
            .map_err(|err| err.context(format!("update {}", file.path.display())))
            .err()
    });
    ErrorList::fold(errors)
}

/// Moves a log directory to `new_dir`. Already moved is fine.
pub(crate) fn archive_log_directory(fs: &dyn FileSystem, log_dir: &Path, new_dir: &Path) -> HubResult<()> {
    match fs.rename(log_dir, new_dir) {
        Ok(()) => {
            info!(from = %log_dir.display(), to = %new_dir.display(), "archived log directory");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(dir = %log_dir.display(), "log directory already archived");
            Ok(())
        }
        Err(err) => Err(HubError::from(err).context(format!(
            "archive log directory {} to {}",
            log_dir.display(),
            new_dir.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use gplift_cluster::TablespaceInfo;
    use gplift_core::{FakeLauncher, FakeResponse, OsFs};
    use semver::Version;

    use super::*;

    fn context(launcher: Arc<FakeLauncher>, root: &Path) -> AgentContext {
        AgentContext {
            launcher,
            fs: Arc::new(OsFs),
            state_dir: root.join(".gplift"),
            log_dir: root.join("gpAdminLogs").join("gplift"),
            hostname: "sdw1".into(),
        }
    }

    fn data_dir(path: &Path) {
        fs::create_dir_all(path).unwrap();
        for file in POSTGRES_FILES {
            fs::write(path.join(file), "").unwrap();
        }
    }

    fn primaries(root: &Path, check_only: bool) -> UpgradePrimaries {
        UpgradePrimaries {
            check_only,
            link_mode: true,
            source_bin_dir: "/usr/local/gpdb6/bin".into(),
            target_bin_dir: "/usr/local/gpdb7/bin".into(),
            target_version: Version::new(7, 1, 0),
            coordinator_backup_dir: Some(root.join(".gplift/upgraded-coordinator.bak")),
            tablespaces_mapping_file: Some(root.join(".gplift/tablespaces/tablespaces.txt")),
            segments: vec![AgentSegment {
                content: 0,
                dbid: 2,
                source_datadir: root.join("primary/seg0"),
                target_datadir: root.join("primary/seg.AAAAAAAAAAA.0"),
                source_port: 25432,
                target_port: 6002,
                tablespaces: BTreeMap::from([
                    (
                        1663,
                        TablespaceInfo {
                            location: "/data/pg_default".into(),
                            user_defined: false,
                        },
                    ),
                    (
                        16386,
                        TablespaceInfo {
                            location: root.join("ts"),
                            user_defined: true,
                        },
                    ),
                ]),
            }],
        }
    }

    #[tokio::test]
    async fn check_runs_only_pg_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let ctx = context(launcher.clone(), dir.path());

        handle(&ctx, AgentRequest::UpgradePrimaries(primaries(dir.path(), true)))
            .await
            .unwrap();

        let lines = launcher.command_lines();
        assert_eq!(lines.len(), 1, "{lines:?}");
        assert!(lines[0].contains("--mode segment"), "{}", lines[0]);
        assert!(lines[0].contains("--check"), "{}", lines[0]);
        assert!(!lines[0].contains("--old-tablespaces-file"), "{}", lines[0]);
    }

    #[tokio::test]
    async fn upgrade_restores_backup_and_user_tablespaces_first() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("primary/seg.AAAAAAAAAAA.0/pg_tblspc")).unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let ctx = context(launcher.clone(), root);

        handle(&ctx, AgentRequest::UpgradePrimaries(primaries(root, false)))
            .await
            .unwrap();

        let calls = launcher.calls();
        let programs: Vec<_> = calls.iter().map(|c| c.program_name().to_string()).collect();
        assert_eq!(programs, ["rsync", "rsync", "pg_upgrade"]);

        let backup = &calls[0].args;
        assert!(backup.contains(&"gpperfmon".to_string()), "{backup:?}");
        assert!(backup[backup.len() - 2].ends_with("upgraded-coordinator.bak/"));

        let tablespace = &calls[1].args;
        assert!(tablespace[tablespace.len() - 2].ends_with(".gplift/tablespaces/16386/1/"));
        assert_eq!(tablespace[tablespace.len() - 1], root.join("ts/2").to_string_lossy());

        let link = root.join("primary/seg.AAAAAAAAAAA.0/pg_tblspc/16386");
        assert_eq!(fs::read_link(link).unwrap(), root.join("ts/2"));
        assert!(calls[2].args.contains(&"--old-tablespaces-file".to_string()));
    }

    #[tokio::test]
    async fn failed_segment_names_host_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        launcher.push("pg_upgrade", FakeResponse::exit(1));
        let ctx = context(launcher, dir.path());

        let err = handle(&ctx, AgentRequest::UpgradePrimaries(primaries(dir.path(), true)))
            .await
            .unwrap_err();
        assert!(
            err.to_string().starts_with("check primary on host sdw1 with content 0: "),
            "{err}"
        );
    }

    #[tokio::test]
    async fn rename_archives_and_promotes() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("seg0");
        let target = dir.path().join("seg.AAAAAAAAAAA.0");
        data_dir(&source);
        data_dir(&target);
        fs::write(target.join("upgraded"), "").unwrap();
        let ctx = context(Arc::new(FakeLauncher::new()), dir.path());

        let request = AgentRequest::RenameDirectories {
            dirs: vec![RenameDirectories {
                source: source.clone(),
                target: target.clone(),
                rename_target: true,
            }],
        };
        handle(&ctx, request.clone()).await.unwrap();
        handle(&ctx, request).await.unwrap();

        assert!(source.join("upgraded").exists());
        assert!(dir.path().join("seg.AAAAAAAAAAA.0.old/PG_VERSION").exists());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn state_directory_requires_its_files() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(Arc::new(FakeLauncher::new()), dir.path());
        fs::create_dir_all(&ctx.state_dir).unwrap();
        fs::write(ctx.state_dir.join("config.json"), "{}").unwrap();

        assert!(handle(&ctx, AgentRequest::DeleteStateDirectory).await.is_err());
        assert!(ctx.state_dir.exists());

        fs::write(ctx.state_dir.join("status.json"), "{}").unwrap();
        let output = handle(&ctx, AgentRequest::DeleteStateDirectory).await.unwrap();
        assert!(output.contains("Deleting directory"), "{output}");
        assert!(!ctx.state_dir.exists());
    }

    #[tokio::test]
    async fn log_directory_archive_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(Arc::new(FakeLauncher::new()), dir.path());
        fs::create_dir_all(&ctx.log_dir).unwrap();
        let new_dir = dir.path().join("gpAdminLogs/gplift-AAAAAAAAAAA-2021-03-04T05:06");

        let request = AgentRequest::ArchiveLogDirectory { new_dir: new_dir.clone() };
        handle(&ctx, request.clone()).await.unwrap();
        handle(&ctx, request).await.unwrap();
        assert!(new_dir.is_dir());
        assert!(!ctx.log_dir.exists());
    }

    #[tokio::test]
    async fn configuration_updates_rewrite_ports() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("postgresql.conf");
        fs::write(&conf, "port=6002 # temporary\nmax_connections=100\n").unwrap();
        let ctx = context(Arc::new(FakeLauncher::new()), dir.path());

        let request = AgentRequest::UpdateConfiguration {
            files: vec![ConfUpdate {
                path: conf.clone(),
                pattern: crate::commands::port_pattern(6002),
                replacement: crate::commands::port_replacement(25432),
            }],
        };
        handle(&ctx, request).await.unwrap();
        assert_eq!(
            fs::read_to_string(&conf).unwrap(),
            "port=25432 # temporary\nmax_connections=100\n"
        );
    }
}
