use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use gplift_hub::AGENT_COMMANDS;

mod commands;

#[derive(Parser)]
#[command(
    name = "gplift",
    about = "gplift: in-place major version upgrades for Greenplum clusters",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Record the source cluster, create the target beside it, and run
    /// pg_upgrade --check.
    Initialize {
        /// Installation directory of the source cluster's Greenplum.
        #[arg(long, env = "GPLIFT_SOURCE_GPHOME")]
        source_gphome: PathBuf,
        /// Installation directory of the target Greenplum.
        #[arg(long, env = "GPLIFT_TARGET_GPHOME")]
        target_gphome: PathBuf,
        /// Port of the running source coordinator.
        #[arg(long, env = "PGPORT", default_value = "5432")]
        source_master_port: u16,
        /// Ports for the temporary target cluster, e.g. "50432-50440,50450".
        #[arg(long)]
        temp_port_range: Option<String>,
        /// Upgrade with hard links instead of copying data files.
        #[arg(long, value_enum, default_value_t = UpgradeMode::Copy)]
        mode: UpgradeMode,
        /// Write hostnames instead of addresses into pg_hba.conf.
        #[arg(long)]
        use_hba_hostnames: bool,
        /// Path of the gplift binary on segment hosts.
        #[arg(long, env = "GPLIFT_TOOL_PATH", default_value = "gplift")]
        tool_path: PathBuf,
        /// Print utility output as well as progress.
        #[arg(short, long)]
        verbose: bool,
    },
    /// Stop the source and upgrade it into the target cluster.
    Execute {
        #[arg(short, long)]
        verbose: bool,
    },
    /// Move the upgraded cluster into the source's directories and ports.
    Finalize {
        #[arg(short, long)]
        verbose: bool,
    },
    /// Discard the target cluster and restart the source.
    Revert {
        #[arg(short, long)]
        verbose: bool,
    },
    /// Run one segment-host request, read as JSON from stdin.
    #[command(hide = true)]
    Agent {
        #[arg(value_parser = clap::builder::PossibleValuesParser::new(AGENT_COMMANDS))]
        command: String,
    },
    /// Print the gplift version
    Version {
        #[arg(long, value_enum, default_value_t = VersionFormat::Multiline)]
        format: VersionFormat,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum UpgradeMode {
    Copy,
    Link,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum VersionFormat {
    Multiline,
    Oneline,
}

/// Logs go to stderr; agent replies travel on stdout.
fn init_logging(format: LogFormat) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("gplift=info".parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    match cli.command {
        Commands::Initialize {
            source_gphome,
            target_gphome,
            source_master_port,
            temp_port_range,
            mode,
            use_hba_hostnames,
            tool_path,
            verbose,
        } => {
            let args = commands::hub::InitializeArgs {
                source_gphome,
                target_gphome,
                source_port: source_master_port,
                temp_port_range,
                link_mode: mode == UpgradeMode::Link,
                use_hba_hostnames,
                tool_path,
            };
            commands::hub::initialize(args, verbose).await
        }
        Commands::Execute { verbose } => {
            commands::hub::run(commands::hub::Pipeline::Execute, verbose).await
        }
        Commands::Finalize { verbose } => {
            commands::hub::run(commands::hub::Pipeline::Finalize, verbose).await
        }
        Commands::Revert { verbose } => {
            commands::hub::run(commands::hub::Pipeline::Revert, verbose).await
        }
        Commands::Agent { command } => commands::agent::agent(&command).await,
        Commands::Version { format } => {
            commands::version::version(format);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn help_names_the_tool() {
        let about = Cli::command().get_about().map(|a| a.to_string());
        assert_eq!(
            about.as_deref(),
            Some("gplift: in-place major version upgrades for Greenplum clusters")
        );
    }

    #[test]
    fn initialize_takes_link_mode_and_port_range() {
        let cli = Cli::try_parse_from([
            "gplift",
            "initialize",
            "--source-gphome",
            "/usr/local/gpdb6",
            "--target-gphome",
            "/usr/local/gpdb7",
            "--source-master-port",
            "15432",
            "--temp-port-range",
            "50432-50440",
            "--mode",
            "link",
        ])
        .unwrap();
        let Commands::Initialize {
            source_master_port,
            temp_port_range,
            mode,
            ..
        } = cli.command
        else {
            panic!("expected initialize");
        };
        assert_eq!(source_master_port, 15432);
        assert_eq!(temp_port_range.as_deref(), Some("50432-50440"));
        assert!(mode == UpgradeMode::Link);
    }

    #[test]
    fn agent_rejects_unknown_commands() {
        assert!(Cli::try_parse_from(["gplift", "agent", "rename-directories"]).is_ok());
        assert!(Cli::try_parse_from(["gplift", "agent", "format-disk"]).is_err());
    }

    #[test]
    fn version_formats() {
        let cli = Cli::try_parse_from(["gplift", "version", "--format", "oneline"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Version {
                format: VersionFormat::Oneline
            }
        ));
    }
}
