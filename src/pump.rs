//! Output pump
//!
//! A dedicated thread waits on the console output endpoint, a stop pipe and,
//! for sessions with an id, the control listener and its connected clients. Output is read alternately
//! into two buffers and forwarded to an [`OutputSink`]. The pump ends on stop
//! request, end of stream, read error or a consumer that went away, and
//! signals the session's exit pipe on the way out.

use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use crate::control::ControlChannel;
use crate::pty::{poll_timeout, OutputEndpoint, SharedConsole, WakePipe};

/// Two read buffers used in strict alternation
pub struct DoubleBuffer {
    buffers: [Box<[u8]>; 2],
    active: usize,
}

/// Bytes just read into one of the two buffers
#[derive(Debug)]
pub struct Filled<'a> {
    /// Which buffer holds the bytes
    pub index: usize,
    pub bytes: &'a [u8],
}

impl DoubleBuffer {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            buffers: [
                vec![0u8; size].into_boxed_slice(),
                vec![0u8; size].into_boxed_slice(),
            ],
            active: 0,
        }
    }

    /// Buffer the next read goes into
    pub fn active(&self) -> usize {
        self.active
    }

    /// Read into the active buffer and make the other one active
    ///
    /// The returned slice borrows `self`, so the next read cannot start until
    /// these bytes have been forwarded.
    pub fn fill<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Filled<'_>> {
        let index = self.active;
        let n = loop {
            match reader.read(&mut self.buffers[index]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        self.active ^= 1;
        Ok(Filled {
            index,
            bytes: &self.buffers[index][..n],
        })
    }
}

/// Where the pump delivers child output
pub trait OutputSink: Send {
    /// Deliver one chunk; an error stops the pump
    fn forward(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Called once after the last chunk
    fn finish(&mut self) {}
}

/// Forwards output to a writer, e.g. the proxy's stdout
pub struct WriterSink<W> {
    writer: W,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send> OutputSink for WriterSink<W> {
    fn forward(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()
    }
}

/// Callback run after new output lands in a [`PendingOutput`]
pub type Notifier = Arc<dyn Fn() + Send + Sync>;

struct PendingState {
    data: Vec<u8>,
    /// No more output will arrive
    eof: bool,
    /// The consumer is gone; producers give up
    closed: bool,
}

/// Bounded region of output waiting for an in-process consumer
///
/// When full, the pump blocks until the consumer drains it, which in turn
/// stalls the child at the OS pipe.
pub struct PendingOutput {
    state: Mutex<PendingState>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
}

impl PendingOutput {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PendingState {
                data: Vec::new(),
                eof: false,
                closed: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append all of `bytes`, waiting for room; false if closed first
    pub fn push(&self, mut bytes: &[u8]) -> bool {
        let mut state = self.lock();
        while !bytes.is_empty() {
            if state.closed {
                return false;
            }
            let room = self.capacity.saturating_sub(state.data.len());
            if room == 0 {
                state = self
                    .writable
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            }
            let n = room.min(bytes.len());
            state.data.extend_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            self.readable.notify_all();
        }
        true
    }

    /// Drain everything buffered so far
    pub fn take(&self) -> Vec<u8> {
        let mut state = self.lock();
        let data = std::mem::take(&mut state.data);
        self.writable.notify_all();
        data
    }

    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the producer finished and everything was taken
    pub fn is_drained(&self) -> bool {
        let state = self.lock();
        state.eof && state.data.is_empty()
    }

    /// Wait until data is available, the stream ended, or `timeout` passes
    ///
    /// Returns true if data is available.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.data.is_empty() && !state.eof && !state.closed {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = self
                .readable
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        !state.data.is_empty()
    }

    /// Mark end of stream
    pub fn finish(&self) {
        self.lock().eof = true;
        self.readable.notify_all();
    }

    /// Release a producer blocked on a full region and refuse further output
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.eof = true;
        self.writable.notify_all();
        self.readable.notify_all();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Delivers output into a [`PendingOutput`] for `read_output_nonblocking`
pub struct PendingSink {
    pending: Arc<PendingOutput>,
    notifier: Option<Notifier>,
}

impl PendingSink {
    pub fn new(pending: Arc<PendingOutput>, notifier: Option<Notifier>) -> Self {
        Self { pending, notifier }
    }
}

impl OutputSink for PendingSink {
    fn forward(&mut self, bytes: &[u8]) -> io::Result<()> {
        if !self.pending.push(bytes) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        if let Some(notify) = &self.notifier {
            notify();
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.pending.finish();
        if let Some(notify) = &self.notifier {
            notify();
        }
    }
}

/// Why the pump loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// Stop was requested
    Stopped,
    /// The output endpoint reached end of stream or failed: the child is gone
    Closed,
    /// The sink refused output
    ConsumerGone,
    /// Waiting on the descriptors failed
    Failed,
}

/// Everything the pump thread owns
pub struct PumpContext {
    pub output: Box<dyn OutputEndpoint>,
    pub sink: Box<dyn OutputSink>,
    pub console: Arc<SharedConsole>,
    pub control: Option<ControlChannel>,
    pub stop: Arc<WakePipe>,
    pub exited: Arc<WakePipe>,
    pub buffer_size: usize,
}

struct Ready {
    output: bool,
    control: bool,
    stop: bool,
}

fn is_ready(fd: &PollFd<'_>) -> bool {
    fd.revents()
        .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
}

impl PumpContext {
    fn run(mut self) -> PumpExit {
        let mut buffers = DoubleBuffer::new(self.buffer_size);

        let exit = loop {
            let ready = match self.wait() {
                Ok(ready) => ready,
                Err(e) => {
                    tracing::error!("pump poll failed: {}", e);
                    break PumpExit::Failed;
                },
            };

            if ready.stop {
                break PumpExit::Stopped;
            }

            if let Some(control) = self.control.as_mut() {
                // Waiting clients are revisited so they can time out
                if ready.control || control.has_clients() {
                    control.service(&self.console);
                }
            }

            if ready.output {
                match buffers.fill(&mut *self.output) {
                    Ok(filled) if filled.bytes.is_empty() => break PumpExit::Closed,
                    Ok(filled) => {
                        tracing::trace!(buffer = filled.index, bytes = filled.bytes.len(), "output");
                        if let Err(e) = self.sink.forward(filled.bytes) {
                            tracing::debug!("output consumer gone: {}", e);
                            break PumpExit::ConsumerGone;
                        }
                    },
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {},
                    Err(e) => {
                        // EIO from a pty master whose slave side is closed
                        tracing::debug!("output endpoint closed: {}", e);
                        break PumpExit::Closed;
                    },
                }
            }
        };

        self.sink.finish();
        self.exited.signal();
        tracing::debug!(?exit, "pump exited");
        exit
    }

    fn wait(&self) -> nix::Result<Ready> {
        loop {
            let mut fds = vec![
                PollFd::new(self.stop.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.output.as_fd(), PollFlags::POLLIN),
            ];
            let mut deadline = None;
            if let Some(control) = &self.control {
                fds.extend(control.fds().map(|fd| PollFd::new(fd, PollFlags::POLLIN)));
                deadline = control.deadline();
            }

            match poll(&mut fds, poll_timeout(deadline, Instant::now())) {
                Ok(_) => {},
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }

            return Ok(Ready {
                stop: is_ready(&fds[0]),
                output: is_ready(&fds[1]),
                control: fds[2..].iter().any(is_ready),
            });
        }
    }
}

/// Handle to the running pump thread
pub struct Pump {
    thread: Option<JoinHandle<()>>,
    done: mpsc::Receiver<PumpExit>,
    finished: Arc<AtomicBool>,
    stop: Arc<WakePipe>,
    exit: Option<PumpExit>,
}

impl Pump {
    /// Spawn the pump thread
    pub fn start(context: PumpContext) -> io::Result<Pump> {
        let (tx, done) = mpsc::channel();
        let finished = Arc::new(AtomicBool::new(false));
        let stop = context.stop.clone();

        let thread = {
            let finished = finished.clone();
            thread::Builder::new()
                .name("ptyproxy-pump".to_string())
                .spawn(move || {
                    let exit = context.run();
                    finished.store(true, Ordering::Release);
                    let _ = tx.send(exit);
                })?
        };

        Ok(Pump {
            thread: Some(thread),
            done,
            finished,
            stop,
            exit: None,
        })
    }

    /// True once the pump loop has returned
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Ask the pump to exit and wait up to `timeout` for it
    ///
    /// On timeout the thread is detached and `None` is returned. Calling this
    /// again after the pump stopped returns the recorded exit.
    pub fn stop(&mut self, timeout: Duration) -> Option<PumpExit> {
        let Some(thread) = self.thread.take() else {
            return self.exit;
        };

        self.stop.signal();
        match self.done.recv_timeout(timeout) {
            Ok(exit) => {
                if thread.join().is_err() {
                    tracing::warn!("pump thread panicked after reporting exit");
                }
                self.exit = Some(exit);
            },
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(?timeout, "pump did not stop in time; detaching");
            },
            Err(RecvTimeoutError::Disconnected) => {
                let _ = thread.join();
                tracing::warn!("pump thread ended without reporting");
            },
        }
        self.exit
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop(Duration::ZERO);
        }
    }
}
