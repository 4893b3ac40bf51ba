//! The gplift tool's own version, locally and on remote hosts.

use std::path::Path;

use gplift_core::{Command, Launcher};
use tracing::debug;

use crate::error::{UpgradeError, UpgradeResult};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// `git describe` of the build, when the build recorded one.
pub fn commit() -> &'static str {
    option_env!("GPLIFT_GIT_DESCRIBE").unwrap_or("dev")
}

/// `<version> <commit>`, the form compared across hosts.
pub fn oneline() -> String {
    format!("{VERSION} {}", commit())
}

/// Multi-line form printed by `gplift version`.
pub fn multiline() -> String {
    format!("Version: {VERSION}\nCommit: {}\n", commit())
}

/// `ssh -q <host> 'bash -c "<path> version --format oneline"'`.
pub fn remote_version_command(host: &str, tool_path: &Path) -> Command {
    Command::new("ssh").args([
        "-q".to_string(),
        host.to_string(),
        format!("bash -c \"{} version --format oneline\"", tool_path.display()),
    ])
}

/// The oneline version reported by the gplift binary at `tool_path` on
/// `host`.
pub async fn remote_version(launcher: &dyn Launcher, host: &str, tool_path: &Path) -> UpgradeResult<String> {
    let output = launcher
        .output_checked(&remote_version_command(host, tool_path))
        .await?;
    let version = output.stdout_string().trim().to_string();
    if version.is_empty() || version.lines().count() != 1 {
        return Err(UpgradeError::VersionOutput {
            host: host.to_string(),
            output: output.combined(),
        });
    }
    debug!(host, %version, "probed remote gplift version");
    Ok(version)
}
