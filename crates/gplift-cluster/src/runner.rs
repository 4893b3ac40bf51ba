//! Runs cluster management utilities (`gpstart`, `gpstop`, `gpinitsystem`,
//! ...) from an installation.
//!
//! Utilities are launched as
//! `bash -c "source <gphome>/greenplum_path.sh && <gphome>/bin/<utility> <args>"`
//! with the environment replaced by exactly `MASTER_DATA_DIRECTORY`,
//! `PGPORT` and any caller-supplied variables.

use std::path::PathBuf;

use gplift_core::{Command, CoreResult, Launcher, SharedStreams, bin_path, shell_quote};

use crate::cluster::Cluster;

pub struct ClusterRunner<'a> {
    launcher: &'a dyn Launcher,
    gphome: PathBuf,
    coordinator_datadir: PathBuf,
    coordinator_port: u16,
    streams: SharedStreams,
}

impl<'a> ClusterRunner<'a> {
    pub fn new(
        launcher: &'a dyn Launcher,
        gphome: impl Into<PathBuf>,
        coordinator_datadir: impl Into<PathBuf>,
        coordinator_port: u16,
        streams: SharedStreams,
    ) -> Self {
        Self {
            launcher,
            gphome: gphome.into(),
            coordinator_datadir: coordinator_datadir.into(),
            coordinator_port,
            streams,
        }
    }

    pub fn for_cluster(launcher: &'a dyn Launcher, cluster: &Cluster, streams: SharedStreams) -> Self {
        Self::new(
            launcher,
            cluster.gphome.clone(),
            cluster.coordinator_datadir(),
            cluster.coordinator_port(),
            streams,
        )
    }

    /// Builds the wrapped invocation without running it.
    pub fn command(&self, utility: &str, args: &[&str], env: &[(&str, &str)]) -> Command {
        let mut words = vec![shell_quote(&bin_path(&self.gphome, utility).to_string_lossy())];
        words.extend(args.iter().map(|a| shell_quote(a)));

        let script = format!(
            "source {}/greenplum_path.sh && {}",
            shell_quote(&self.gphome.to_string_lossy()),
            words.join(" ")
        );

        let mut cmd = Command::new("bash")
            .arg("-c")
            .arg(script)
            .env_clear()
            .env(
                "MASTER_DATA_DIRECTORY",
                self.coordinator_datadir.to_string_lossy(),
            )
            .env("PGPORT", self.coordinator_port.to_string());
        for (key, value) in env {
            cmd = cmd.env(*key, *value);
        }
        cmd
    }

    pub async fn run(&self, utility: &str, args: &[&str]) -> CoreResult<()> {
        self.run_with_env(utility, args, &[]).await
    }

    pub async fn run_with_env(
        &self,
        utility: &str,
        args: &[&str],
        env: &[(&str, &str)],
    ) -> CoreResult<()> {
        let cmd = self.command(utility, args, env);
        self.launcher.run_checked(&cmd, self.streams.clone()).await
    }

    pub fn streams(&self) -> SharedStreams {
        self.streams.clone()
    }
}
