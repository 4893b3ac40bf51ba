//! gplift-cluster: what gplift knows about a running cluster.
//!
//! A [`Cluster`] is loaded once per invocation from the catalog and is
//! immutable afterwards. Everything that talks to the live system goes
//! through a narrow seam:
//!
//! ```text
//!            ┌──────────────┐  query / execute  ┌──────────────────────┐
//!            │   Cluster    │ ────────────────▶ │ Catalog              │
//!            │ (segments,   │                   │ (PgCatalog / Fake)   │
//!            │  tablespaces)│                   └──────────────────────┘
//!            └──────┬───────┘
//!                   │ ClusterRunner (bash + greenplum_path.sh)
//!                   ▼
//!            ┌──────────────┐
//!            │  Launcher    │──▶ gpstart / gpstop / pgrep / postgres
//!            └──────────────┘
//! ```

pub mod activity;
pub mod catalog;
pub mod cluster;
pub mod connection;
pub mod control;
pub mod error;
pub mod readiness;
pub mod runner;
pub mod segment;
pub mod tablespace;
pub mod version;

pub use activity::check_active_connections;
pub use catalog::{Catalog, FakeCatalog, PgCatalog, Row};
pub use cluster::{Cluster, Destination};
pub use connection::{ConnectionConfig, DEFAULT_DATABASE};
pub use error::{ClusterError, ClusterResult};
pub use readiness::wait_for_segments;
pub use runner::ClusterRunner;
pub use segment::{COORDINATOR_CONTENT, COORDINATOR_DBID, Role, Segment};
pub use tablespace::{
    TABLESPACES_MAPPING_FILE, TablespaceInfo, TablespaceTuple, Tablespaces, tablespaces_from_db,
};
pub use version::{VersionGate, local_version, parse_gp_version};
