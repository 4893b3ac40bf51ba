//! Well-known locations on hub and agent hosts.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};

/// Overrides the state directory.
pub const STATE_DIR_ENV: &str = "GPLIFT_HOME";

pub const STATUS_FILE: &str = "status.json";
pub const CONFIG_FILE: &str = "config.json";

/// `$GPLIFT_HOME`, or `$HOME/.gplift` when unset.
pub fn state_dir() -> CoreResult<PathBuf> {
    if let Some(dir) = env::var_os(STATE_DIR_ENV).filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    Ok(home_dir()?.join(".gplift"))
}

/// `$HOME/gpAdminLogs/gplift`.
pub fn log_dir() -> CoreResult<PathBuf> {
    Ok(home_dir()?.join("gpAdminLogs").join("gplift"))
}

pub fn status_file(state_dir: &Path) -> PathBuf {
    state_dir.join(STATUS_FILE)
}

pub fn config_file(state_dir: &Path) -> PathBuf {
    state_dir.join(CONFIG_FILE)
}

fn home_dir() -> CoreResult<PathBuf> {
    env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
        .ok_or(CoreError::HomeNotSet)
}
