//! The decoupling writer.
//!
//! Producers call [`NonBlockWriter::write`] from any thread. Each call copies
//! the data into an owned buffer and pushes it on a bounded channel. A single
//! worker thread drains the channel into the wrapped sink, so the sink is
//! only ever touched by one thread and buffers reach it in FIFO order.
//!
//! Sink failures never reach the producer that enqueued the failing buffer.
//! They are recorded and surface through [`NonBlockWriter::last_result`] and
//! [`NonBlockWriter::close`].

use std::cell::Cell;
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, error, warn};

use crate::{CancelToken, Error, Result};

/// Queue capacity used when the caller asks for a capacity of zero.
pub const DEFAULT_CAPACITY: usize = i16::MAX as usize;

const DEFAULT_THREAD_NAME: &str = "nonblock-writer";

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

type ErrorPolicy = Box<dyn FnMut(&io::Error) -> bool + Send>;

thread_local! {
    /// Address of the `Shared` whose worker runs on this thread, or 0.
    static WORKER_OF: Cell<usize> = const { Cell::new(0) };
}

/// Lifecycle of a [`NonBlockWriter`]. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Accepting writes.
    Open,
    /// `close` has started; the worker is draining.
    Closing,
    /// The worker has exited.
    Closed,
}

/// Result of the most recent sink write attempted by the worker.
#[derive(Debug, Clone, Default)]
pub struct WriteOutcome {
    /// Bytes the sink reported as written.
    pub written: usize,
    /// Error from the sink or the cancellation gate, if any.
    pub error: Option<Error>,
}

/// State written by the worker and read by producers.
struct Shared {
    state: AtomicU8,
    writing: AtomicBool,
    last: Mutex<WriteOutcome>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(OPEN),
            writing: AtomicBool::new(false),
            last: Mutex::new(WriteOutcome::default()),
        }
    }

    fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            OPEN => State::Open,
            CLOSING => State::Closing,
            _ => State::Closed,
        }
    }

    fn advance(&self, to: u8) {
        self.state.fetch_max(to, Ordering::AcqRel);
    }

    fn last(&self) -> WriteOutcome {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn last_error(&self) -> Option<Error> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .error
            .clone()
    }

    fn record(&self, outcome: WriteOutcome) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = outcome;
    }

    fn record_error(&self, err: Error) {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).error = Some(err);
    }
}

/// Marks the writer closed when the worker exits, including by panic.
struct ExitGuard(Arc<Shared>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.writing.store(false, Ordering::Release);
        self.0.advance(CLOSED);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Drained,
    Cancelled,
    Policy,
}

struct Worker {
    sink: Box<dyn Write + Send>,
    queue: Receiver<Vec<u8>>,
    shared: Arc<Shared>,
    on_error: Option<ErrorPolicy>,
    cancel: Option<CancelToken>,
}

impl Worker {
    fn run(mut self) {
        let _exit = ExitGuard(Arc::clone(&self.shared));
        WORKER_OF.with(|owner| owner.set(Arc::as_ptr(&self.shared) as usize));
        debug!(capacity = ?self.queue.capacity(), "writer worker started");

        let (stop, delivered) = self.drain();
        if stop == Stop::Drained {
            self.flush();
        }
        // Anything still queued is dropped along with the receiver.
        debug!(?stop, delivered, dropped = self.queue.len(), "writer worker stopped");
    }

    fn drain(&mut self) -> (Stop, usize) {
        let mut delivered = 0;
        for buf in self.queue.iter() {
            if let Some(err) = self.cancel.as_ref().and_then(CancelToken::error) {
                warn!(error = %err, "writer cancelled, discarding {} bytes", buf.len());
                self.shared.record_error(err);
                return (Stop::Cancelled, delivered);
            }

            self.shared.writing.store(true, Ordering::Release);
            let result = self.sink.write(&buf);
            self.shared.writing.store(false, Ordering::Release);

            match result {
                Ok(written) => {
                    delivered += 1;
                    self.shared.record(WriteOutcome {
                        written,
                        error: None,
                    });
                }
                Err(err) => {
                    warn!(error = %err, "sink write failed");
                    let err = Arc::new(err);
                    self.shared.record(WriteOutcome {
                        written: 0,
                        error: Some(Error::Sink(Arc::clone(&err))),
                    });
                    let stop = self.on_error.as_mut().is_some_and(|policy| policy(err.as_ref()));
                    if stop {
                        return (Stop::Policy, delivered);
                    }
                }
            }
        }
        (Stop::Drained, delivered)
    }

    fn flush(&mut self) {
        self.shared.writing.store(true, Ordering::Release);
        let result = self.sink.flush();
        self.shared.writing.store(false, Ordering::Release);

        if let Err(err) = result {
            warn!(error = %err, "sink flush failed");
            if self.shared.last_error().is_none() {
                self.shared.record_error(err.into());
            }
        }
    }
}

/// Configures and spawns a [`NonBlockWriter`].
pub struct Builder {
    sink: Box<dyn Write + Send>,
    capacity: usize,
    on_error: Option<ErrorPolicy>,
    cancel: Option<CancelToken>,
    thread_name: Option<String>,
}

impl Builder {
    fn new(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink,
            capacity: DEFAULT_CAPACITY,
            on_error: None,
            cancel: None,
            thread_name: None,
        }
    }

    /// Queue bound. Zero selects [`DEFAULT_CAPACITY`].
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = if capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            capacity
        };
        self
    }

    /// Called with every sink error. Returning `true` stops the worker;
    /// buffers still queued are discarded.
    ///
    /// Without a policy the worker keeps draining past errors.
    pub fn on_error<F>(mut self, policy: F) -> Self
    where
        F: FnMut(&io::Error) -> bool + Send + 'static,
    {
        self.on_error = Some(Box::new(policy));
        self
    }

    /// Checked by the worker before each write. Once tripped, the worker
    /// records the token's error and stops without writing the buffer it
    /// just dequeued.
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Name of the worker thread.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = Some(name.into());
        self
    }

    /// Allocates the queue and starts the worker.
    pub fn spawn(self) -> io::Result<NonBlockWriter> {
        let (tx, rx) = bounded(self.capacity);
        let shared = Arc::new(Shared::new());

        let worker = Worker {
            sink: self.sink,
            queue: rx,
            shared: Arc::clone(&shared),
            on_error: self.on_error,
            cancel: self.cancel,
        };
        let handle = thread::Builder::new()
            .name(
                self.thread_name
                    .unwrap_or_else(|| DEFAULT_THREAD_NAME.to_string()),
            )
            .spawn(move || worker.run())?;

        Ok(NonBlockWriter {
            sender: RwLock::new(Some(tx)),
            shared,
            worker: Mutex::new(Some(handle)),
            closed: OnceLock::new(),
            capacity: self.capacity,
        })
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("capacity", &self.capacity)
            .field("on_error", &self.on_error.is_some())
            .field("cancel", &self.cancel)
            .field("thread_name", &self.thread_name)
            .finish_non_exhaustive()
    }
}

/// An [`io::Write`] that hands every write to a background worker.
///
/// `write` only blocks while the queue is full. Call [`close`] to wait for
/// the queue to drain and collect the final sink error; dropping the writer
/// closes it as well.
///
/// The writer is `Sync`: share it between producers by reference or in an
/// [`Arc`]. `&NonBlockWriter` implements [`io::Write`], so an
/// `Arc<NonBlockWriter>` can back a `tracing_subscriber` fmt layer directly.
/// Events emitted on the worker thread itself (its own warnings, or logging
/// from the sink or the error policy) are rejected with [`Error::FromWorker`]
/// instead of being queued, so the worker never waits on its own queue.
///
/// [`io::Write::flush`] returns immediately and does not wait for queued
/// buffers to reach the sink. Use [`close`] for that.
///
/// # Examples
///
/// ```
/// use nonblock_writer::NonBlockWriter;
///
/// let writer = NonBlockWriter::new(Vec::new(), 16).unwrap();
/// writer.write(b"hello ").unwrap();
/// writer.write(b"world").unwrap();
/// writer.close().unwrap();
/// assert!(writer.write(b"late").unwrap_err().is_closed());
/// ```
///
/// [`close`]: NonBlockWriter::close
pub struct NonBlockWriter {
    sender: RwLock<Option<Sender<Vec<u8>>>>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: OnceLock<Option<Error>>,
    capacity: usize,
}

impl NonBlockWriter {
    /// Wraps `sink` with a queue of `capacity` buffers, no error policy and
    /// no cancellation. A capacity of zero selects [`DEFAULT_CAPACITY`].
    pub fn new<W>(sink: W, capacity: usize) -> io::Result<Self>
    where
        W: Write + Send + 'static,
    {
        Self::builder(sink).capacity(capacity).spawn()
    }

    /// Starts configuring a writer around `sink`.
    pub fn builder<W>(sink: W) -> Builder
    where
        W: Write + Send + 'static,
    {
        Builder::new(Box::new(sink))
    }

    /// Queues a private copy of `data` for the worker.
    ///
    /// Returns `data.len()` once the copy is queued, whatever the sink later
    /// does with it. Empty input is accepted without touching the queue.
    /// Blocks while the queue is full.
    ///
    /// # Errors
    ///
    /// [`Error::Closed`], or [`Error::ClosedAfter`] carrying the last
    /// recorded error, once shutdown has begun or the worker has stopped.
    /// [`Error::FromWorker`] when called on this writer's worker thread.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if self.shared.state() != State::Open {
            return Err(self.closed_error());
        }
        if data.is_empty() {
            return Ok(0);
        }
        // The worker would block on its own queue, or feed itself forever.
        if self.on_worker_thread() {
            return Err(Error::FromWorker);
        }

        let sender = match self
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(tx) => tx.clone(),
            None => return Err(self.closed_error()),
        };
        // Callers may reuse `data` as scratch space, so the queue owns a copy.
        sender
            .send(data.to_vec())
            .map_err(|_| self.closed_error())?;
        Ok(data.len())
    }

    /// Stops accepting writes, waits for the worker to drain the queue and
    /// exit, and returns the last recorded error.
    ///
    /// Only the first call runs the shutdown. Concurrent callers wait for
    /// it; every call returns the same error value.
    pub fn close(&self) -> Result<()> {
        match self.closed.get_or_init(|| self.shutdown()) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn shutdown(&self) -> Option<Error> {
        self.shared.advance(CLOSING);
        drop(
            self.sender
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let joined = handle.map_or(Ok(()), JoinHandle::join);
        self.shared.advance(CLOSED);

        if joined.is_err() {
            error!("writer worker panicked");
            return Some(Error::WorkerPanicked);
        }
        self.shared.last_error()
    }

    fn on_worker_thread(&self) -> bool {
        WORKER_OF.with(Cell::get) == Arc::as_ptr(&self.shared) as usize
    }

    fn closed_error(&self) -> Error {
        Error::closed(self.shared.last_error())
    }

    /// The outcome of the worker's most recent sink write.
    pub fn last_result(&self) -> WriteOutcome {
        self.shared.last()
    }

    /// Whether the worker is currently inside a call on the sink.
    pub fn is_writing(&self) -> bool {
        self.shared.writing.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// Whether writes are being rejected.
    pub fn is_closed(&self) -> bool {
        self.state() != State::Open
    }

    /// The queue bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffers waiting for the worker.
    pub fn queued(&self) -> usize {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, Sender::len)
    }
}

impl Write for NonBlockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        NonBlockWriter::write(self, buf).map_err(io::Error::from)
    }

    /// Does not wait for delivery; see [`NonBlockWriter::close`].
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &NonBlockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        NonBlockWriter::write(*self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for NonBlockWriter {
    fn drop(&mut self) {
        if self.closed.get().is_some() {
            return;
        }
        if let Err(err) = self.close() {
            warn!(error = %err, "NonBlockWriter closed on drop with error");
        }
    }
}

impl fmt::Debug for NonBlockWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonBlockWriter")
            .field("state", &self.state())
            .field("capacity", &self.capacity)
            .field("queued", &self.queued())
            .field("writing", &self.is_writing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Weak};

    /// Sink that forwards every buffer to a channel.
    struct ChannelSink(mpsc::Sender<Vec<u8>>);

    impl Write for ChannelSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let _ = self.0.send(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_zero_capacity_selects_default() {
        let writer = NonBlockWriter::new(io::sink(), 0).unwrap();
        assert_eq!(writer.capacity(), DEFAULT_CAPACITY);
        assert_eq!(writer.capacity(), 32767);
        writer.close().unwrap();
    }

    #[test]
    fn test_state_moves_to_closed() {
        let writer = NonBlockWriter::new(io::sink(), 4).unwrap();
        assert_eq!(writer.state(), State::Open);
        assert!(!writer.is_closed());
        writer.close().unwrap();
        assert_eq!(writer.state(), State::Closed);
        assert!(writer.is_closed());
        assert_eq!(writer.queued(), 0);
    }

    #[test]
    fn test_initial_last_result() {
        let writer = NonBlockWriter::new(io::sink(), 1).unwrap();
        let last = writer.last_result();
        assert_eq!(last.written, 0);
        assert!(last.error.is_none());
        assert!(!writer.is_writing());
    }

    #[test]
    fn test_drop_drains_queue() {
        let (tx, rx) = mpsc::channel();
        {
            let writer = NonBlockWriter::new(ChannelSink(tx), 8).unwrap();
            writer.write(b"one").unwrap();
            writer.write(b"two").unwrap();
        }
        let got: Vec<Vec<u8>> = rx.iter().collect();
        assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_io_write_maps_closed_to_broken_pipe() {
        let mut writer = NonBlockWriter::new(io::sink(), 1).unwrap();
        writer.close().unwrap();
        let err = Write::write(&mut writer, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(Write::flush(&mut writer).is_ok());
    }

    #[test]
    fn test_thread_name() {
        let (tx, rx) = mpsc::channel();
        struct NameSink(mpsc::Sender<Option<String>>);
        impl Write for NameSink {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                let _ = self.0.send(thread::current().name().map(str::to_string));
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let writer = NonBlockWriter::builder(NameSink(tx))
            .thread_name("log-drain")
            .spawn()
            .unwrap();
        writer.write(b"x").unwrap();
        writer.close().unwrap();
        assert_eq!(rx.recv().unwrap().as_deref(), Some("log-drain"));
    }

    /// Sink that writes every buffer back into the writer that owns it.
    struct EchoSink {
        owner: Arc<OnceLock<Weak<NonBlockWriter>>>,
        results: mpsc::Sender<Result<usize>>,
    }

    impl Write for EchoSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(writer) = self.owner.get().and_then(Weak::upgrade) {
                let _ = self.results.send(writer.write(buf));
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_from_own_worker_is_rejected() {
        let owner = Arc::new(OnceLock::new());
        let (tx, rx) = mpsc::channel();
        let sink = EchoSink {
            owner: Arc::clone(&owner),
            results: tx,
        };
        let writer = Arc::new(NonBlockWriter::new(sink, 1).unwrap());
        owner.set(Arc::downgrade(&writer)).unwrap();

        writer.write(b"ping").unwrap();
        writer.close().unwrap();

        let echoed: Vec<Result<usize>> = rx.iter().collect();
        assert_eq!(echoed.len(), 1);
        assert!(matches!(echoed[0], Err(Error::FromWorker)));
    }

    #[test]
    fn test_chained_writers() {
        let (tx, rx) = mpsc::channel();
        let inner = NonBlockWriter::new(ChannelSink(tx), 2).unwrap();
        let outer = NonBlockWriter::new(inner, 2).unwrap();

        outer.write(b"one").unwrap();
        outer.write(b"two").unwrap();
        outer.close().unwrap();

        // Dropping the outer worker's sink closed the inner writer.
        let got: Vec<Vec<u8>> = rx.iter().collect();
        assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec()]);
    }
}
