//! Child process launching.
//!
//! Every external utility (cluster management scripts, `pg_upgrade`,
//! `rsync`, `ssh`, `pgrep`) is described as a [`Command`] and handed to a
//! [`Launcher`]. Production code uses [`SystemLauncher`]; tests use
//! [`FakeLauncher`], which records every command and replays scripted
//! results.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::streams::SharedStreams;

// ── Command ────────────────────────────────────────────────────────

/// How the child's environment is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Env {
    /// Inherit the parent's environment, plus the listed overrides.
    Inherit(Vec<(String, String)>),
    /// Start from an empty environment containing only the listed variables.
    Replace(Vec<(String, String)>),
}

/// A fully described child process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Env,
    pub current_dir: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
}

impl Command {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Env::Inherit(Vec::new()),
            current_dir: None,
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Drops the inherited environment; later `env` calls add to an empty set.
    pub fn env_clear(mut self) -> Self {
        let vars = match self.env {
            Env::Inherit(vars) | Env::Replace(vars) => vars,
        };
        self.env = Env::Replace(vars);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        match &mut self.env {
            Env::Inherit(vars) | Env::Replace(vars) => vars.push((key.into(), value.into())),
        }
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Looks up a variable set explicitly on this command.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        let vars = match &self.env {
            Env::Inherit(vars) | Env::Replace(vars) => vars,
        };
        vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn program_name(&self) -> &str {
        self.program
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

// ── Results ────────────────────────────────────────────────────────

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    code: Option<i32>,
}

impl ProcessExit {
    pub const SUCCESS: ProcessExit = ProcessExit { code: Some(0) };

    pub fn from_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    /// A child killed by a signal has no exit code.
    pub fn signaled() -> Self {
        Self { code: None }
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit status {code}"),
            None => f.write_str("terminated by signal"),
        }
    }
}

/// Captured output of a completed child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub exit: ProcessExit,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Output {
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn combined(&self) -> String {
        let mut combined = String::from_utf8_lossy(&self.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&self.stderr));
        combined
    }
}

// ── Launcher ───────────────────────────────────────────────────────

/// Capability to run child processes.
///
/// `run` and `output` return the child's exit verbatim; only failure to
/// start the child is an error. The `*_checked` variants additionally turn a
/// non-zero exit into [`CoreError::Exit`].
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Runs to completion, streaming output into `streams` as it arrives.
    async fn run(&self, command: &Command, streams: SharedStreams) -> CoreResult<ProcessExit>;

    /// Runs to completion, capturing output.
    async fn output(&self, command: &Command) -> CoreResult<Output>;

    async fn run_checked(&self, command: &Command, streams: SharedStreams) -> CoreResult<()> {
        let exit = self.run(command, streams).await?;
        if exit.success() {
            Ok(())
        } else {
            Err(CoreError::Exit {
                command: command.to_string(),
                exit,
                output: String::new(),
            })
        }
    }

    async fn output_checked(&self, command: &Command) -> CoreResult<Output> {
        let output = self.output(command).await?;
        if output.exit.success() {
            Ok(output)
        } else {
            Err(CoreError::Exit {
                command: command.to_string(),
                exit: output.exit,
                output: output.combined(),
            })
        }
    }
}

/// Launches real child processes through tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl SystemLauncher {
    fn prepare(command: &Command) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args);
        match &command.env {
            Env::Inherit(vars) => {
                cmd.envs(vars.iter().map(|(k, v)| (k, v)));
            }
            Env::Replace(vars) => {
                cmd.env_clear();
                cmd.envs(vars.iter().map(|(k, v)| (k, v)));
            }
        }
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(if command.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(false);
        cmd
    }

    fn spawn(command: &Command) -> CoreResult<tokio::process::Child> {
        info!(command = %command, "starting");
        Self::prepare(command).spawn().map_err(|source| CoreError::Spawn {
            command: command.to_string(),
            source,
        })
    }
}

#[async_trait]
impl Launcher for SystemLauncher {
    async fn run(&self, command: &Command, streams: SharedStreams) -> CoreResult<ProcessExit> {
        let mut child = Self::spawn(command)?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (fed, out, err) = tokio::join!(
            feed_stdin(command.stdin.as_deref(), stdin),
            pump(stdout, streams.stdout()),
            pump(stderr, streams.stderr())
        );
        fed?;
        out?;
        err?;

        let status = child.wait().await?;
        debug!(command = %command, %status, "finished");
        Ok(status.into())
    }

    async fn output(&self, command: &Command) -> CoreResult<Output> {
        let mut child = Self::spawn(command)?;
        let stdin = child.stdin.take();
        let (fed, output) = tokio::join!(
            feed_stdin(command.stdin.as_deref(), stdin),
            child.wait_with_output()
        );
        let output = output?;
        fed?;
        debug!(command = %command, status = %output.status, "finished");
        Ok(Output {
            exit: output.status.into(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Writes the command's input and closes the pipe. Runs alongside the output
/// readers, as a child may fill its output pipes before reading stdin.
async fn feed_stdin(input: Option<&[u8]>, stdin: Option<ChildStdin>) -> io::Result<()> {
    let (Some(input), Some(mut stdin)) = (input, stdin) else {
        return Ok(());
    };
    stdin.write_all(input).await?;
    stdin.shutdown().await
}

async fn pump<R>(reader: Option<R>, mut writer: Box<dyn Write + Send>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };

    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return writer.flush();
        }
        writer.write_all(&buf[..n])?;
    }
}

// ── Fake ───────────────────────────────────────────────────────────

/// Scripted result for one [`FakeLauncher`] invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeResponse {
    pub exit: ProcessExit,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub spawn_error: Option<io::ErrorKind>,
}

impl FakeResponse {
    pub fn success() -> Self {
        Self {
            exit: ProcessExit::SUCCESS,
            stdout: Vec::new(),
            stderr: Vec::new(),
            spawn_error: None,
        }
    }

    pub fn exit(code: i32) -> Self {
        Self {
            exit: ProcessExit::from_code(code),
            ..Self::success()
        }
    }

    pub fn spawn_failure(kind: io::ErrorKind) -> Self {
        Self {
            spawn_error: Some(kind),
            ..Self::success()
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<Vec<u8>>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<Vec<u8>>) -> Self {
        self.stderr = stderr.into();
        self
    }
}

type Handler = Box<dyn Fn(&Command) -> Option<FakeResponse> + Send + Sync>;

/// A [`Launcher`] that never spawns anything.
///
/// Responses are chosen in order: a queued response whose program name
/// matches, then the handler, then plain success.
#[derive(Default)]
pub struct FakeLauncher {
    calls: Mutex<Vec<Command>>,
    queued: Mutex<VecDeque<(String, FakeResponse)>>,
    handler: Option<Handler>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&Command) -> Option<FakeResponse> + Send + Sync + 'static,
    {
        Self {
            handler: Some(Box::new(handler)),
            ..Self::default()
        }
    }

    /// Queues a one-shot response for the next call to `program`
    /// (matched against the file name of the command's program).
    pub fn push(&self, program: &str, response: FakeResponse) {
        if let Ok(mut queued) = self.queued.lock() {
            queued.push_back((program.to_string(), response));
        }
    }

    /// Every command launched so far, in order.
    pub fn calls(&self) -> Vec<Command> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Rendered command lines, in order.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(ToString::to_string).collect()
    }

    fn respond(&self, command: &Command) -> CoreResult<FakeResponse> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(command.clone());
        }

        let queued = self.queued.lock().ok().and_then(|mut queued| {
            let pos = queued
                .iter()
                .position(|(program, _)| program == command.program_name())?;
            queued.remove(pos).map(|(_, r)| r)
        });

        let response = queued
            .or_else(|| self.handler.as_ref().and_then(|h| h(command)))
            .unwrap_or_else(FakeResponse::success);

        if let Some(kind) = response.spawn_error {
            return Err(CoreError::Spawn {
                command: command.to_string(),
                source: io::Error::from(kind),
            });
        }
        Ok(response)
    }
}

impl fmt::Debug for FakeLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeLauncher")
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn run(&self, command: &Command, streams: SharedStreams) -> CoreResult<ProcessExit> {
        let response = self.respond(command)?;
        streams.stdout().write_all(&response.stdout)?;
        streams.stderr().write_all(&response.stderr)?;
        Ok(response.exit)
    }

    async fn output(&self, command: &Command) -> CoreResult<Output> {
        let response = self.respond(command)?;
        Ok(Output {
            exit: response.exit,
            stdout: response.stdout,
            stderr: response.stderr,
        })
    }
}

/// Quotes one word for `bash -c`. Words made only of safe characters are
/// left bare; anything else is single-quoted.
pub fn shell_quote(word: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c);
    if !word.is_empty() && word.chars().all(safe) {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Joins a path and a program name; utilities live under `<home>/bin`.
pub fn bin_path(home: &Path, utility: &str) -> PathBuf {
    home.join("bin").join(utility)
}
