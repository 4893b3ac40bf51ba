//! Reaching agents on segment hosts.
//!
//! ```text
//!   hub ── AgentClient::call(host, request) ──▶ ssh -q <host> 'gplift agent <cmd>'
//!                                                 stdin:  request as JSON
//!                                                 stdout: handler output
//! ```
//!
//! Requests for several hosts run in parallel through [`fan_out`]; every
//! host's failure is reported together.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use gplift_cluster::TablespaceInfo;
use gplift_core::{Command, ErrorList, Launcher, OutStreams};
use semver::Version;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{HubError, HubResult};
use crate::handlers::{AgentContext, handle};

// ── Requests ───────────────────────────────────────────────────────

/// One primary to upgrade on an agent host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSegment {
    pub content: i32,
    pub dbid: i32,
    pub source_datadir: PathBuf,
    pub target_datadir: PathBuf,
    pub source_port: u16,
    pub target_port: u16,
    /// The source's tablespaces for this segment's dbid, by oid.
    #[serde(default)]
    pub tablespaces: BTreeMap<u32, TablespaceInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradePrimaries {
    pub check_only: bool,
    pub link_mode: bool,
    pub source_bin_dir: PathBuf,
    pub target_bin_dir: PathBuf,
    pub target_version: Version,
    /// Upgraded coordinator copied to this host; absent for checks.
    pub coordinator_backup_dir: Option<PathBuf>,
    pub tablespaces_mapping_file: Option<PathBuf>,
    pub segments: Vec<AgentSegment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameDirectories {
    pub source: PathBuf,
    pub target: PathBuf,
    pub rename_target: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfUpdate {
    pub path: PathBuf,
    pub pattern: String,
    pub replacement: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum AgentRequest {
    UpgradePrimaries(UpgradePrimaries),
    RenameDirectories { dirs: Vec<RenameDirectories> },
    DeleteDataDirectories { datadirs: Vec<PathBuf> },
    DeleteTablespaces { dirs: Vec<PathBuf> },
    RestorePgControl { datadirs: Vec<PathBuf> },
    UpdateConfiguration { files: Vec<ConfUpdate> },
    DeleteStateDirectory,
    ArchiveLogDirectory { new_dir: PathBuf },
}

/// Every agent subcommand name.
pub const AGENT_COMMANDS: [&str; 8] = [
    "upgrade-primaries",
    "rename-directories",
    "delete-data-directories",
    "delete-tablespaces",
    "restore-pg-control",
    "update-configuration",
    "delete-state-directory",
    "archive-log-directory",
];

impl AgentRequest {
    /// The `gplift agent` subcommand that serves this request.
    pub fn command(&self) -> &'static str {
        match self {
            AgentRequest::UpgradePrimaries(_) => AGENT_COMMANDS[0],
            AgentRequest::RenameDirectories { .. } => AGENT_COMMANDS[1],
            AgentRequest::DeleteDataDirectories { .. } => AGENT_COMMANDS[2],
            AgentRequest::DeleteTablespaces { .. } => AGENT_COMMANDS[3],
            AgentRequest::RestorePgControl { .. } => AGENT_COMMANDS[4],
            AgentRequest::UpdateConfiguration { .. } => AGENT_COMMANDS[5],
            AgentRequest::DeleteStateDirectory => AGENT_COMMANDS[6],
            AgentRequest::ArchiveLogDirectory { .. } => AGENT_COMMANDS[7],
        }
    }

    /// Parses a request received by `gplift agent <command>`, checking that
    /// it is meant for that command.
    pub fn parse_for(command: &str, body: &[u8]) -> HubResult<Self> {
        let request: AgentRequest = serde_json::from_slice(body)?;
        if request.command() != command {
            return Err(HubError::AgentCommand {
                expected: command.to_string(),
                got: request.command().to_string(),
            });
        }
        Ok(request)
    }
}

// ── Clients ────────────────────────────────────────────────────────

#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Runs `request` on `host`, returning the agent's output.
    async fn call(&self, host: &str, request: &AgentRequest) -> HubResult<String>;
}

/// Runs `gplift agent` on each host over ssh.
pub struct SshAgentClient {
    pub launcher: Arc<dyn Launcher>,
    pub tool_path: PathBuf,
}

impl SshAgentClient {
    pub fn command(&self, host: &str, request: &AgentRequest) -> HubResult<Command> {
        let body = serde_json::to_vec(request)?;
        Ok(Command::new("ssh")
            .args([
                "-q".to_string(),
                host.to_string(),
                format!(
                    "bash -c \"{} agent {}\"",
                    self.tool_path.display(),
                    request.command()
                ),
            ])
            .stdin(body))
    }
}

#[async_trait]
impl AgentClient for SshAgentClient {
    async fn call(&self, host: &str, request: &AgentRequest) -> HubResult<String> {
        let cmd = self.command(host, request)?;
        info!(host, command = request.command(), "calling agent");
        let output = self.launcher.output_checked(&cmd).await?;
        Ok(output.stdout_string())
    }
}

/// Serves requests in this process, as if every host were local.
pub struct LocalAgentClient {
    pub context: AgentContext,
}

#[async_trait]
impl AgentClient for LocalAgentClient {
    async fn call(&self, host: &str, request: &AgentRequest) -> HubResult<String> {
        let context = AgentContext {
            hostname: host.to_string(),
            ..self.context.clone()
        };
        handle(&context, request.clone()).await
    }
}

// ── Fan-out ────────────────────────────────────────────────────────

/// Sends each host its request in parallel.
///
/// Agent output is written to `streams` in host order once every call has
/// returned. Failures are wrapped with their host and reported together.
pub async fn fan_out(
    client: Arc<dyn AgentClient>,
    requests: BTreeMap<String, AgentRequest>,
    streams: &dyn OutStreams,
) -> HubResult<()> {
    let mut tasks = JoinSet::new();
    for (host, request) in requests {
        let client = client.clone();
        tasks.spawn(async move {
            let result = client.call(&host, &request).await;
            (host, request.command(), result)
        });
    }

    let mut outputs = BTreeMap::new();
    let mut errors = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let (host, command, result) = joined?;
        match result {
            Ok(output) => {
                debug!(%host, command, "agent finished");
                outputs.insert(host, output);
            }
            Err(err) => {
                warn!(%host, command, "agent failed: {err}");
                errors.push(HubError::Agent {
                    host,
                    message: err.to_string(),
                });
            }
        }
    }

    let mut out = streams.stdout();
    for output in outputs.values() {
        out.write_all(output.as_bytes())?;
    }
    ErrorList::fold(errors)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use gplift_core::{BufferedStreams, FakeLauncher, FakeResponse};

    use super::*;

    #[test]
    fn requests_are_tagged_with_their_command() {
        let request = AgentRequest::ArchiveLogDirectory {
            new_dir: "/home/gpadmin/gpAdminLogs/gplift-AAAAAAAAAAA-2021-03-04T05:06".into(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["command"], "archive-log-directory");

        let body = serde_json::to_vec(&AgentRequest::DeleteStateDirectory).unwrap();
        assert_eq!(
            AgentRequest::parse_for("delete-state-directory", &body).unwrap(),
            AgentRequest::DeleteStateDirectory
        );
        assert!(matches!(
            AgentRequest::parse_for("restore-pg-control", &body),
            Err(HubError::AgentCommand { .. })
        ));
    }

    #[test]
    fn every_request_names_a_known_command() {
        let requests = [
            AgentRequest::RenameDirectories { dirs: vec![] },
            AgentRequest::DeleteDataDirectories { datadirs: vec![] },
            AgentRequest::DeleteTablespaces { dirs: vec![] },
            AgentRequest::RestorePgControl { datadirs: vec![] },
            AgentRequest::UpdateConfiguration { files: vec![] },
        ];
        for request in requests {
            let body = serde_json::to_vec(&request).unwrap();
            assert_eq!(AgentRequest::parse_for(request.command(), &body).unwrap(), request);
        }
    }

    #[tokio::test]
    async fn ssh_client_sends_json_on_stdin() {
        let launcher = Arc::new(FakeLauncher::new());
        launcher.push("ssh", FakeResponse::success().with_stdout("done\n"));
        let client = SshAgentClient {
            launcher: launcher.clone(),
            tool_path: "/usr/local/bin/gplift".into(),
        };

        let request = AgentRequest::RestorePgControl {
            datadirs: vec!["/data/primary/seg0".into()],
        };
        assert_eq!(client.call("sdw1", &request).await.unwrap(), "done\n");

        let call = &launcher.calls()[0];
        assert_eq!(
            call.args,
            vec!["-q", "sdw1", "bash -c \"/usr/local/bin/gplift agent restore-pg-control\""]
        );
        let sent: AgentRequest = serde_json::from_slice(call.stdin.as_deref().unwrap()).unwrap();
        assert_eq!(sent, request);
    }

    struct Recording {
        seen: Mutex<Vec<String>>,
        failing: &'static str,
    }

    #[async_trait]
    impl AgentClient for Recording {
        async fn call(&self, host: &str, _request: &AgentRequest) -> HubResult<String> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(host.to_string());
            }
            if host == self.failing {
                return Err(HubError::UnknownCatalogVersion);
            }
            Ok(format!("{host} ok\n"))
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_every_host_and_names_failures() {
        let client = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            failing: "sdw2",
        });
        let requests: BTreeMap<_, _> = ["sdw3", "sdw1", "sdw2"]
            .into_iter()
            .map(|h| (h.to_string(), AgentRequest::DeleteStateDirectory))
            .collect();
        let streams = BufferedStreams::new();

        let err = fan_out(client.clone(), requests, &streams).await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "agent on host sdw2: pg_controldata output is missing catalog version"
        );
        assert_eq!(streams.stdout_string(), "sdw1 ok\nsdw3 ok\n");
        assert_eq!(client.seen.lock().unwrap().len(), 3);
    }
}
