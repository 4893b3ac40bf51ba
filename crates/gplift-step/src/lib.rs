//! gplift-step: resumable, sequenced execution of substeps.
//!
//! ```text
//!   Step::run(substep, body)
//!        │
//!        ├── SubstepStore::read ── RUNNING?  ──▶ fail, needs cleanup
//!        │                      └─ COMPLETE? ──▶ report, do not re-run
//!        ├── write RUNNING ─▶ body(streams) ─▶ write COMPLETE / FAILED
//!        │
//!        └── Multiplexer ──▶ <state_dir>/<step>.log
//!                        └─▶ MessageSender (client, dropped on first error)
//! ```

pub mod error;
pub mod step;
pub mod store;
pub mod stream;

pub use error::{StepError, StepResult};
pub use step::{SkipSubstep, Step, has_run, step_log_path};
pub use store::{FileStore, MemoryStore, StatusTable, StepStatuses, SubstepStore, bootstrap_status_file};
pub use stream::{LocalWriter, Multiplexer};
