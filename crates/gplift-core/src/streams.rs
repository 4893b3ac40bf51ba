//! Output stream pairs handed to substep bodies and child processes.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// A pair of writers for a child's stdout and stderr.
///
/// Each call hands out an owned writer so that it can be moved into a task
/// pumping a child process; implementations share state internally.
pub trait OutStreams: Send + Sync {
    fn stdout(&self) -> Box<dyn Write + Send>;
    fn stderr(&self) -> Box<dyn Write + Send>;
}

pub type SharedStreams = Arc<dyn OutStreams>;

// ── In-memory buffers ──────────────────────────────────────────────

/// Captures both streams in memory.
#[derive(Debug, Clone, Default)]
pub struct BufferedStreams {
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
}

impl BufferedStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout_bytes(&self) -> Vec<u8> {
        lock_bytes(&self.stdout)
    }

    pub fn stderr_bytes(&self) -> Vec<u8> {
        lock_bytes(&self.stderr)
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout_bytes()).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr_bytes()).into_owned()
    }
}

fn lock_bytes(buf: &Mutex<Vec<u8>>) -> Vec<u8> {
    match buf.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

impl OutStreams for BufferedStreams {
    fn stdout(&self) -> Box<dyn Write + Send> {
        Box::new(SharedBuf(self.stdout.clone()))
    }

    fn stderr(&self) -> Box<dyn Write + Send> {
        Box::new(SharedBuf(self.stderr.clone()))
    }
}

/// A cloneable writer appending to a shared byte buffer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .0
            .lock()
            .map_err(|_| io::Error::other("buffer lock poisoned"))?;
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ── Discard ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct DevNullStreams;

impl OutStreams for DevNullStreams {
    fn stdout(&self) -> Box<dyn Write + Send> {
        Box::new(io::sink())
    }

    fn stderr(&self) -> Box<dyn Write + Send> {
        Box::new(io::sink())
    }
}

// ── Process stdio ──────────────────────────────────────────────────

/// Forwards to this process's own stdout and stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdStreams;

impl OutStreams for StdStreams {
    fn stdout(&self) -> Box<dyn Write + Send> {
        Box::new(io::stdout())
    }

    fn stderr(&self) -> Box<dyn Write + Send> {
        Box::new(io::stderr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_streams_keep_streams_apart() {
        let streams = BufferedStreams::new();
        streams.stdout().write_all(b"out").unwrap();
        streams.stderr().write_all(b"err").unwrap();
        streams.stdout().write_all(b"put").unwrap();

        assert_eq!(streams.stdout_string(), "output");
        assert_eq!(streams.stderr_string(), "err");
    }

    #[test]
    fn clones_share_buffers() {
        let streams = BufferedStreams::new();
        let shared: SharedStreams = Arc::new(streams.clone());
        shared.stdout().write_all(b"hi").unwrap();
        assert_eq!(streams.stdout_string(), "hi");
    }
}
