//! gplift-core: shared vocabulary for the gplift upgrade orchestrator.
//!
//! Everything the hub, the agents and the step engine agree on lives here:
//!
//! ```text
//! ┌────────────┐   Message::Status / Message::Chunk   ┌──────────────┐
//! │ step engine│ ───────────────────────────────────▶ │ client sink  │
//! └─────┬──────┘                                      └──────────────┘
//!       │ OutStreams (stdout / stderr)
//!       ▼
//! ┌────────────┐  Command   ┌─────────────────┐
//! │ substep    │ ─────────▶ │ Launcher        │──▶ child process
//! │ body       │            │ (system / fake) │
//! └────────────┘            └─────────────────┘
//! ```
//!
//! Child processes and the filesystem are reached through the [`Launcher`]
//! and [`FileSystem`] capabilities so that tests can substitute fakes.

pub mod error;
pub mod exec;
pub mod fs;
pub mod id;
pub mod message;
pub mod paths;
pub mod streams;
pub mod types;

pub use error::{CoreError, CoreResult, ErrorList, NextActionError};
pub use exec::{
    Command, Env, FakeLauncher, FakeResponse, Launcher, Output, ProcessExit, SystemLauncher, bin_path,
    shell_quote,
};
pub use fs::{FakeFs, FileSystem, FsOp, OsFs, atomically_write};
pub use id::UpgradeId;
pub use message::{Chunk, Message, MessageSender, NullSender, SendError, StreamKind, SubstepStatus};
pub use streams::{BufferedStreams, DevNullStreams, OutStreams, SharedBuf, SharedStreams, StdStreams};
pub use types::{Status, StepName, Substep};
