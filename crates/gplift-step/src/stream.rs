//! The output multiplexer.
//!
//! Every byte written to a step's stdout or stderr goes to the step log and,
//! while the client is listening, to the client as a [`Chunk`]. Writes are
//! serialized by one lock so that concurrent producers never interleave
//! within a single `write` call, and the log sees exactly the byte sequence
//! the client sees up to the moment the client is dropped.

use std::fs::File;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use gplift_core::{Chunk, Message, MessageSender, OutStreams, StreamKind};
use tracing::warn;

/// The local half of the multiplexer.
pub enum LocalWriter {
    File(File),
    Other(Box<dyn Write + Send>),
    /// After [`Multiplexer::close`]; writes fail.
    Closed,
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LocalWriter::File(f) => f.write(buf),
            LocalWriter::Other(w) => w.write(buf),
            LocalWriter::Closed => Err(io::Error::new(io::ErrorKind::BrokenPipe, "step log is closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LocalWriter::File(f) => f.flush(),
            LocalWriter::Other(w) => w.flush(),
            LocalWriter::Closed => Ok(()),
        }
    }
}

struct Inner {
    local: LocalWriter,
    sender: Option<Arc<dyn MessageSender>>,
}

impl Inner {
    fn write(&mut self, stream: StreamKind, buf: &[u8]) -> io::Result<usize> {
        let n = self.local.write(buf)?;

        if let Some(sender) = &self.sender {
            let chunk = Message::Chunk(Chunk {
                stream,
                bytes: buf[..n].to_vec(),
            });
            if let Err(err) = sender.send(chunk) {
                warn!("halting client stream: {err}");
                self.sender = None;
            }
        }
        Ok(n)
    }
}

/// Shared stdout/stderr pair over one local writer and an optional client.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Mutex<Inner>>,
}

impl Multiplexer {
    pub fn new(local: LocalWriter, sender: Option<Arc<dyn MessageSender>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { local, sender })),
        }
    }

    /// Multiplexer writing its local half to `file`.
    pub fn to_file(file: File, sender: Option<Arc<dyn MessageSender>>) -> Self {
        Self::new(LocalWriter::File(file), sender)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Whether chunks are still being forwarded to the client.
    pub fn is_streaming(&self) -> bool {
        self.lock().sender.is_some()
    }

    /// Flushes and releases the local writer, syncing it first when it is a
    /// file. Every clone sees the close; later writes fail.
    pub fn close(&self) -> io::Result<()> {
        let mut inner = self.lock();
        let local = std::mem::replace(&mut inner.local, LocalWriter::Closed);
        match local {
            LocalWriter::File(mut f) => {
                f.flush()?;
                f.sync_all()
            }
            LocalWriter::Other(mut w) => w.flush(),
            LocalWriter::Closed => Ok(()),
        }
    }
}

/// One side of a [`Multiplexer`].
pub struct MuxWriter {
    mux: Multiplexer,
    stream: StreamKind,
}

impl Write for MuxWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.mux.lock().write(self.stream, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.mux.lock().local.flush()
    }
}

impl OutStreams for Multiplexer {
    fn stdout(&self) -> Box<dyn Write + Send> {
        Box::new(MuxWriter {
            mux: self.clone(),
            stream: StreamKind::Stdout,
        })
    }

    fn stderr(&self) -> Box<dyn Write + Send> {
        Box::new(MuxWriter {
            mux: self.clone(),
            stream: StreamKind::Stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use gplift_core::{SendError, SharedBuf};
    use tokio::sync::mpsc;

    use super::*;

    /// Fails every send, counting attempts.
    #[derive(Default)]
    struct BrokenSender {
        attempts: AtomicUsize,
    }

    impl MessageSender for BrokenSender {
        fn send(&self, _message: Message) -> Result<(), SendError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(SendError("client went away".into()))
        }
    }

    fn buffer() -> (Arc<Mutex<Vec<u8>>>, LocalWriter) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        (buf.clone(), LocalWriter::Other(Box::new(SharedBuf(buf))))
    }

    #[test]
    fn failed_send_drops_client_and_keeps_local_output() {
        let logs = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let logs = logs.clone();
                move || SharedBuf(logs.clone())
            })
            .with_ansi(false)
            .finish();

        let (local, writer) = buffer();
        let sender = Arc::new(BrokenSender::default());
        let mux = Multiplexer::new(writer, Some(sender.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let mut stdout = mux.stdout();
            let mut stderr = mux.stderr();
            for i in 0..20u8 {
                let w = if i % 2 == 0 { &mut stdout } else { &mut stderr };
                w.write_all(&[b'a' + i]).unwrap();
            }
        });

        assert_eq!(local.lock().unwrap().len(), 20);
        assert_eq!(sender.attempts.load(Ordering::SeqCst), 1);
        assert!(!mux.is_streaming());

        let logged = String::from_utf8(logs.lock().unwrap().clone()).unwrap();
        assert!(logged.contains("halting client stream"), "{logged}");
        assert_eq!(logged.matches("halting client stream").count(), 1);
    }

    #[test]
    fn chunks_mirror_local_bytes_with_stream_tags() {
        let (local, writer) = buffer();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mux = Multiplexer::new(writer, Some(Arc::new(tx)));

        mux.stdout().write_all(b"out").unwrap();
        mux.stderr().write_all(b"err").unwrap();

        assert_eq!(local.lock().unwrap().as_slice(), b"outerr");
        assert_eq!(
            rx.try_recv().unwrap(),
            Message::Chunk(Chunk {
                stream: StreamKind::Stdout,
                bytes: b"out".to_vec()
            })
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Message::Chunk(Chunk {
                stream: StreamKind::Stderr,
                bytes: b"err".to_vec()
            })
        );
    }

    #[test]
    fn concurrent_writes_do_not_interleave() {
        let (local, writer) = buffer();
        let mux = Multiplexer::new(writer, None);

        let handles: Vec<_> = (0..8u8)
            .map(|t| {
                let mux = mux.clone();
                std::thread::spawn(move || {
                    let mut out = mux.stdout();
                    for _ in 0..50 {
                        out.write_all(&[b'0' + t; 16]).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let bytes = local.lock().unwrap().clone();
        assert_eq!(bytes.len(), 8 * 50 * 16);
        for record in bytes.chunks(16) {
            assert!(record.iter().all(|b| *b == record[0]));
        }
    }

    #[test]
    fn close_syncs_and_releases_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("initialize.log");
        let file = File::create(&path).unwrap();
        let mux = Multiplexer::to_file(file, None);
        let mut stdout = mux.stdout();
        stdout.write_all(b"hello\n").unwrap();
        mux.close().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\n");

        let err = stdout.write_all(b"late\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(matches!(mux.lock().local, LocalWriter::Closed));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\n");

        mux.close().unwrap();
        let (_, writer) = buffer();
        Multiplexer::new(writer, None).close().unwrap();
    }
}
