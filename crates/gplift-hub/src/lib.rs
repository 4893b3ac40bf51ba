//! gplift-hub: the upgrade pipelines and the agents they drive.
//!
//! ```text
//!   gplift initialize / execute / finalize / revert
//!        │
//!        ▼
//!   ┌──────────┐  Step::run(substep)  ┌──────────────────────────────┐
//!   │   Hub    │ ───────────────────▶ │ gplift-step (status, logs)   │
//!   │ (Config) │                      └──────────────────────────────┘
//!   └────┬─────┘
//!        │ coordinator work            segment work
//!        ├─▶ Launcher (gpinitsystem,   ├─▶ fan_out ─▶ AgentClient
//!        │   pg_upgrade, rsync, ...)   │       ssh -q <host> gplift agent <cmd>
//!        └─▶ Connector ─▶ Catalog      │       └─▶ handlers::handle (on the host)
//! ```
//!
//! [`Config`] is the hub's only persistent state besides the status file:
//! initialize writes it, every later step reads it.

pub mod agents;
pub mod commands;
pub mod config;
pub mod error;
mod execute;
mod finalize;
pub mod handlers;
pub mod hub;
mod initialize;
pub mod plan;
mod revert;
pub mod versions;

pub use agents::{AGENT_COMMANDS, AgentClient, AgentRequest, LocalAgentClient, SshAgentClient, fan_out};
pub use config::Config;
pub use error::{HubError, HubResult};
pub use handlers::{AgentContext, handle};
pub use hub::{Connector, DEFAULT_READINESS_TIMEOUT, FakeConnector, Hub, PgConnector};
pub use plan::{InitializePlan, parse_ports};
pub use versions::{DatabaseVersions, ToolVersions, VersionSource, ensure_versions_match};
