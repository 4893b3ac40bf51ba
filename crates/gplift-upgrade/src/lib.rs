//! gplift-upgrade: the per-segment work of an upgrade.
//!
//! ```text
//!   initialize / execute            finalize                 revert
//!   ────────────────────            ────────                 ──────
//!   run::run (pg_upgrade)   ──▶  archive_source        delete_directories
//!                                  seg0      → seg.ID.0.old delete_tablespace_directories
//!                                  seg.ID.0  → seg0         restore_pg_control
//! ```
//!
//! Directory operations go through [`gplift_core::FileSystem`] and may be
//! re-run after any partial failure.

pub mod directories;
pub mod error;
pub mod pg_control;
pub mod run;
pub mod tablespace_dirs;
pub mod version;

pub use directories::{
    OLD_SUFFIX, POSTGRES_FILES, STATE_DIRECTORY_FILES, archive_directory_name, archive_path, archive_source,
    delete_directories, rename_data_directory, temp_data_dir, verify_data_directory,
};
pub use error::{UpgradeError, UpgradeResult};
pub use pg_control::restore_pg_control;
pub use run::{Mode, SegmentPair, UpgradeOptions, UpgradeSegment, pg_upgrade_args, segment_working_directory};
pub use tablespace_dirs::{delete_tablespace_directories, tablespace_path, verify_tablespace_directories};
