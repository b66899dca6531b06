//! Bounded in-memory pipe between a producer thread and a consumer thread.
//!
//! Writers block while the buffer is full and readers block while it is
//! empty. Dropping the writer is end-of-stream for the reader; dropping the
//! reader makes further writes fail with `BrokenPipe`. A [`PipeCloser`]
//! lets a third party abort both ends, or fail the reader with a specific
//! error so the consumer can tell a producer failure from a clean end.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;

struct PipeState {
    buf: VecDeque<u8>,
    capacity: usize,
    writer_closed: bool,
    reader_closed: bool,
    aborted: bool,
    failure: Option<(io::ErrorKind, String)>,
}

struct Shared {
    state: Mutex<PipeState>,
    readable: Condvar,
    writable: Condvar,
}

impl Shared {
    fn update(&self, f: impl FnOnce(&mut PipeState)) {
        let mut state = self.state.lock();
        f(&mut state);
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

/// Creates a pipe holding at most `capacity` bytes in flight.
#[must_use]
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(PipeState {
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity: capacity.max(1),
            writer_closed: false,
            reader_closed: false,
            aborted: false,
            failure: None,
        }),
        readable: Condvar::new(),
        writable: Condvar::new(),
    });
    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader { shared },
    )
}

/// Write end of a pipe.
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Returns a handle that can abort or fail the pipe.
    #[must_use]
    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            shared: self.shared.clone(),
        }
    }

    /// Closes the write end; the reader sees end-of-stream once drained.
    pub fn close(self) {
        drop(self);
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock();
        loop {
            if state.aborted || state.reader_closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader is gone"));
            }
            let space = state.capacity.saturating_sub(state.buf.len());
            if space > 0 {
                let n = space.min(data.len());
                state.buf.extend(&data[..n]);
                self.shared.readable.notify_all();
                return Ok(n);
            }
            self.shared.writable.wait(&mut state);
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.shared.update(|s| s.writer_closed = true);
    }
}

/// Read end of a pipe.
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Returns a handle that can abort or fail the pipe.
    #[must_use]
    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            shared: self.shared.clone(),
        }
    }
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock();
        loop {
            if let Some((kind, message)) = &state.failure {
                return Err(io::Error::new(*kind, message.clone()));
            }
            if state.aborted {
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "pipe aborted"));
            }
            if !state.buf.is_empty() {
                let n = out.len().min(state.buf.len());
                for (slot, byte) in out.iter_mut().zip(state.buf.drain(..n)) {
                    *slot = byte;
                }
                self.shared.writable.notify_all();
                return Ok(n);
            }
            if state.writer_closed {
                return Ok(0);
            }
            self.shared.readable.wait(&mut state);
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.shared.update(|s| s.reader_closed = true);
    }
}

/// Aborts or fails a pipe from outside either end.
#[derive(Clone)]
pub struct PipeCloser {
    shared: Arc<Shared>,
}

impl PipeCloser {
    /// Aborts both ends: writes fail with `BrokenPipe`, reads with
    /// `ConnectionAborted`. Buffered bytes are discarded.
    pub fn abort(&self) {
        self.shared.update(|s| {
            s.aborted = true;
            s.buf.clear();
        });
    }

    /// Makes the reader fail with the given error once it reaches it.
    pub fn fail(&self, kind: io::ErrorKind, message: impl Into<String>) {
        let message = message.into();
        self.shared.update(|s| {
            s.failure = Some((kind, message));
            s.writer_closed = true;
        });
    }

    /// Returns true once the pipe was aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.shared.state.lock().aborted
    }
}

/// Forwards writes and remembers whether one failed, so a consumer that
/// went away can be told apart from a failing producer.
pub(crate) struct TrackedWriter<W: Write> {
    inner: W,
    failed: bool,
}

impl<W: Write> TrackedWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner,
            failed: false,
        }
    }

    pub(crate) fn failed(&self) -> bool {
        self.failed
    }
}

impl<W: Write> Write for TrackedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.write(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
