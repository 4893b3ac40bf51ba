//! Checking that every host runs the same version as the hub.
//!
//! One probe task per host; results are gathered before anything is
//! compared so that every unreachable host is reported at once.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use gplift_cluster::local_version;
use gplift_core::{Command, ErrorList, Launcher, bin_path};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::error::{HubError, HubResult};

/// Where versions come from: the hub itself and each agent host.
#[async_trait]
pub trait VersionSource: Send + Sync {
    /// Names what is being compared, e.g. `gplift` or `source cluster`.
    fn description(&self) -> String;

    async fn local(&self) -> HubResult<String>;

    async fn remote(&self, host: &str) -> HubResult<String>;
}

/// Versions of the gplift binary itself.
pub struct ToolVersions {
    pub launcher: Arc<dyn Launcher>,
    pub tool_path: PathBuf,
}

#[async_trait]
impl VersionSource for ToolVersions {
    fn description(&self) -> String {
        "gplift".to_string()
    }

    async fn local(&self) -> HubResult<String> {
        Ok(gplift_upgrade::version::oneline())
    }

    async fn remote(&self, host: &str) -> HubResult<String> {
        Ok(gplift_upgrade::version::remote_version(self.launcher.as_ref(), host, &self.tool_path).await?)
    }
}

/// Versions of a database installation present on every host.
pub struct DatabaseVersions {
    pub launcher: Arc<dyn Launcher>,
    pub gphome: PathBuf,
    /// `source cluster` or `target cluster`.
    pub label: String,
}

#[async_trait]
impl VersionSource for DatabaseVersions {
    fn description(&self) -> String {
        self.label.clone()
    }

    async fn local(&self) -> HubResult<String> {
        Ok(local_version(self.launcher.as_ref(), &self.gphome).await?.to_string())
    }

    async fn remote(&self, host: &str) -> HubResult<String> {
        let probe = format!("{} --gp-version", bin_path(&self.gphome, "postgres").display());
        let cmd = Command::new("ssh").args(["-q".to_string(), host.to_string(), probe]);
        let output = self.launcher.output_checked(&cmd).await?;
        let version = gplift_cluster::parse_gp_version(&output.combined())?;
        Ok(version.to_string())
    }
}

/// Compares the version reported on every host in `hosts` with the hub's.
pub async fn ensure_versions_match(hosts: &[String], source: Arc<dyn VersionSource>) -> HubResult<()> {
    let description = source.description();
    let hub = source
        .local()
        .await
        .map_err(|err| HubError::HubVersion(Box::new(err)))?;

    let mut tasks = JoinSet::new();
    for host in hosts {
        let host = host.clone();
        let source = source.clone();
        tasks.spawn(async move {
            let version = source.remote(&host).await;
            (host, version)
        });
    }

    let mut reported = Vec::with_capacity(hosts.len());
    let mut errors = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let (host, version) = joined?;
        match version {
            Ok(version) => {
                debug!(%host, %version, "agent version");
                reported.push((host, version));
            }
            Err(err) => errors.push(HubError::Agent {
                host,
                message: err.to_string(),
            }),
        }
    }
    ErrorList::fold(errors)?;

    let mut mismatched: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (host, version) in reported {
        if version != hub {
            mismatched.entry(version).or_default().push(host);
        }
    }
    if mismatched.is_empty() {
        info!(%description, version = %hub, hosts = hosts.len(), "versions match");
        return Ok(());
    }

    let listing: String = mismatched
        .into_iter()
        .map(|(version, mut hosts)| {
            hosts.sort();
            format!("{version:?}: {}\n", hosts.join(", "))
        })
        .collect();
    Err(HubError::VersionMismatch {
        description,
        hub,
        mismatched: listing,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct Scripted {
        hub: String,
        agents: HashMap<String, Result<String, String>>,
    }

    #[async_trait]
    impl VersionSource for Scripted {
        fn description(&self) -> String {
            "gplift".into()
        }

        async fn local(&self) -> HubResult<String> {
            Ok(self.hub.clone())
        }

        async fn remote(&self, host: &str) -> HubResult<String> {
            match self.agents.get(host) {
                Some(Ok(v)) => Ok(v.clone()),
                Some(Err(e)) => Err(HubError::Io(std::io::Error::other(e.clone()))),
                None => Ok(self.hub.clone()),
            }
        }
    }

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|h| h.to_string()).collect()
    }

    #[tokio::test]
    async fn matching_versions_pass() {
        let source = Arc::new(Scripted {
            hub: "1.0.0 dev".into(),
            agents: HashMap::new(),
        });
        ensure_versions_match(&hosts(&["sdw1", "sdw2"]), source).await.unwrap();
    }

    #[tokio::test]
    async fn mismatches_are_grouped_by_version_with_sorted_hosts() {
        let source = Arc::new(Scripted {
            hub: "1.0.0 dev".into(),
            agents: HashMap::from([
                ("sdw3".to_string(), Ok("0.9.0 dev".to_string())),
                ("sdw1".to_string(), Ok("0.9.0 dev".to_string())),
                ("sdw2".to_string(), Ok("0.8.0 dev".to_string())),
            ]),
        });

        let err = ensure_versions_match(&hosts(&["sdw3", "sdw1", "sdw2", "sdw4"]), source)
            .await
            .unwrap_err();
        let HubError::VersionMismatch { mismatched, hub, .. } = &err else {
            panic!("expected a mismatch, got {err:?}");
        };
        assert_eq!(hub, "1.0.0 dev");
        assert_eq!(mismatched, "\"0.8.0 dev\": sdw2\n\"0.9.0 dev\": sdw1, sdw3\n");
        assert!(err.to_string().starts_with("Version mismatch between gplift hub and agent hosts."));
    }

    #[tokio::test]
    async fn agent_errors_are_aggregated() {
        let source = Arc::new(Scripted {
            hub: "1.0.0 dev".into(),
            agents: HashMap::from([
                ("sdw1".to_string(), Err("connection refused".to_string())),
                ("sdw2".to_string(), Err("no route to host".to_string())),
            ]),
        });

        let err = ensure_versions_match(&hosts(&["sdw1", "sdw2"]), source)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Multiple(_)), "{err:?}");
        let text = err.to_string();
        assert!(text.starts_with("2 errors occurred:"), "{text}");
        assert!(text.contains("agent on host sdw1: connection refused"), "{text}");
    }
}
