//! `gplift agent <command>`: the segment-host side of a hub request.
//!
//! The hub runs this over ssh with the JSON request on stdin. Whatever the
//! handler printed comes back on stdout; failures exit non-zero.

use std::sync::Arc;

use anyhow::Context;
use gplift_core::{Command, Launcher, OsFs, SystemLauncher, paths};
use gplift_hub::{AgentContext, AgentRequest, handle};
use tokio::io::AsyncReadExt;
use tracing::info;

pub async fn agent(command: &str) -> anyhow::Result<()> {
    let mut body = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut body)
        .await
        .context("reading agent request")?;
    let request = AgentRequest::parse_for(command, &body)?;

    let launcher: Arc<dyn Launcher> = Arc::new(SystemLauncher);
    let hostname = hostname(launcher.as_ref()).await?;
    info!(host = %hostname, command, "handling agent request");

    let context = AgentContext {
        launcher,
        fs: Arc::new(OsFs),
        state_dir: paths::state_dir()?,
        log_dir: paths::log_dir()?,
        hostname,
    };
    let output = handle(&context, request).await?;
    print!("{output}");
    Ok(())
}

async fn hostname(launcher: &dyn Launcher) -> anyhow::Result<String> {
    let output = launcher.output_checked(&Command::new("hostname")).await?;
    Ok(output.stdout_string().trim().to_string())
}
