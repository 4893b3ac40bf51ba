//! The hub pipelines, run in this process with progress printed as it
//! arrives.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use gplift_cluster::ClusterError;
use gplift_core::{Message, MessageSender, NextActionError, StreamKind, SubstepStatus, SystemLauncher, paths};
use gplift_hub::{Config, Hub, HubError, parse_ports};
use gplift_step::StepError;
use tokio::sync::mpsc;
use tracing::info;

pub struct InitializeArgs {
    pub source_gphome: PathBuf,
    pub target_gphome: PathBuf,
    pub source_port: u16,
    pub temp_port_range: Option<String>,
    pub link_mode: bool,
    pub use_hba_hostnames: bool,
    pub tool_path: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub enum Pipeline {
    Initialize,
    Execute,
    Finalize,
    Revert,
}

impl Pipeline {
    fn name(self) -> &'static str {
        match self {
            Pipeline::Initialize => "Initialize",
            Pipeline::Execute => "Execute",
            Pipeline::Finalize => "Finalize",
            Pipeline::Revert => "Revert",
        }
    }

    fn next_action(self) -> &'static str {
        match self {
            Pipeline::Initialize => "To proceed with the upgrade, run \"gplift execute\".\nTo return the cluster to its original state, run \"gplift revert\".",
            Pipeline::Execute => "To complete the upgrade, run \"gplift finalize\".\nTo return the cluster to its original state, run \"gplift revert\".",
            Pipeline::Finalize => "The upgraded cluster is running on the source's ports and data directories.",
            Pipeline::Revert => "The source cluster is running again. To restart the upgrade, run \"gplift initialize\".",
        }
    }
}

/// Starts a new upgrade, or resumes the one recorded in the state directory.
pub async fn initialize(args: InitializeArgs, verbose: bool) -> anyhow::Result<()> {
    let state_dir = paths::state_dir()?;
    let config = match Config::load(&state_dir) {
        Ok(config) => {
            info!(id = %config.upgrade_id, "resuming upgrade with the saved configuration");
            config
        }
        Err(HubError::Io(err)) if err.kind() == io::ErrorKind::NotFound => new_config(&state_dir, args)?,
        Err(err) => return Err(err.into()),
    };
    execute(hub(config, state_dir)?, Pipeline::Initialize, verbose).await
}

fn new_config(state_dir: &Path, args: InitializeArgs) -> anyhow::Result<Config> {
    let mut config = Config::new(
        state_dir,
        args.source_gphome,
        args.target_gphome,
        args.source_port,
        args.tool_path,
    );
    config.link_mode = args.link_mode;
    config.use_hba_hostnames = args.use_hba_hostnames;
    if let Some(range) = args.temp_port_range.as_deref() {
        config.ports = parse_ports(range)?;
    }
    info!(id = %config.upgrade_id, link_mode = config.link_mode, "starting a new upgrade");
    Ok(config)
}

/// Runs a pipeline against the configuration `initialize` saved.
pub async fn run(pipeline: Pipeline, verbose: bool) -> anyhow::Result<()> {
    let state_dir = paths::state_dir()?;
    let config = Config::load(&state_dir).with_context(|| {
        format!(
            "reading configuration from {}; run \"gplift initialize\" first",
            state_dir.display()
        )
    })?;
    execute(hub(config, state_dir)?, pipeline, verbose).await
}

fn hub(config: Config, state_dir: PathBuf) -> anyhow::Result<Hub> {
    Ok(Hub::new(config, state_dir, paths::log_dir()?, Arc::new(SystemLauncher)))
}

async fn execute(mut hub: Hub, pipeline: Pipeline, verbose: bool) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_messages(rx, verbose));
    let sender: Arc<dyn MessageSender> = Arc::new(tx);

    let result = match pipeline {
        Pipeline::Initialize => hub.initialize(sender).await,
        Pipeline::Execute => hub.execute(sender).await,
        Pipeline::Finalize => hub.finalize(sender).await,
        Pipeline::Revert => hub.revert(sender).await,
    };
    // Every sender is gone once the pipeline returns.
    printer.await?;

    if let Err(err) = result {
        if let Some(next) = next_action(&err) {
            eprintln!("{}", next.help());
        }
        return Err(err.into());
    }

    println!("\n{} completed successfully.\n", pipeline.name());
    println!("NEXT ACTIONS\n------------\n{}", pipeline.next_action());
    Ok(())
}

async fn print_messages(mut rx: mpsc::UnboundedReceiver<Message>, verbose: bool) {
    while let Some(message) = rx.recv().await {
        match message {
            Message::Status(status) => println!("{}", status_line(&status)),
            Message::Chunk(chunk) if verbose => {
                let _ = match chunk.stream {
                    StreamKind::Stdout => io::stdout().write_all(&chunk.bytes),
                    StreamKind::Stderr => io::stderr().write_all(&chunk.bytes),
                };
            }
            Message::Chunk(_) => {}
        }
    }
}

fn status_line(status: &SubstepStatus) -> String {
    format!("{}... [{}]", status.substep.title(), status.status)
}

/// The recommended next command carried by a pipeline failure, if any.
fn next_action(err: &HubError) -> Option<&NextActionError> {
    match err {
        HubError::NextAction(next) | HubError::Cluster(ClusterError::NextAction(next)) => Some(next),
        HubError::Step(StepError::Substep { error, .. } | StepError::Internal(error)) => {
            error.chain().find_map(|cause| {
                if let Some(next) = cause.downcast_ref::<NextActionError>() {
                    return Some(next);
                }
                if let Some(ClusterError::NextAction(next)) = cause.downcast_ref::<ClusterError>() {
                    return Some(next);
                }
                cause.downcast_ref::<HubError>().and_then(next_action)
            })
        }
        _ => None,
    }
}
