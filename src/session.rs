//! Pseudo-console session and its lifecycle
//!
//! A session is built in fixed steps (wake pipes, console, endpoints, child,
//! pump). Each acquired resource is held by a local until the handle is
//! assembled, so a failing step drops exactly what was acquired before it,
//! newest first. A live session is torn down once, either explicitly with
//! [`SessionHandle::kill`] or [`SessionHandle::close`], or when dropped.
//! Teardown always reaps the child: closing the console hangs it up, and one
//! that outlives the join timeout is waited for on a reaper thread.

use std::io::{self, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::arena::Arena;
use crate::coalescer::WriteCoalescer;
use crate::config::ProxyConfig;
use crate::control::ControlChannel;
use crate::error::{SessionError, SetupError};
use crate::pty::{
    ChildProcess, ConsoleBackend, Endpoints, ResizeOutcome, SharedConsole, UnixBackend, WakePipe,
    WindowSize,
};
use crate::pump::{Notifier, OutputSink, PendingOutput, PendingSink, Pump, PumpContext};
use crate::spawn::SpawnPlan;

/// Pause between exit status checks
const REAP_INTERVAL: Duration = Duration::from_millis(2);

/// How long `is_alive` waits for an exit status after the output ended
const EXIT_GRACE: Duration = Duration::from_millis(100);

/// Session lifecycle states, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Uninitialized,
    PipesCreated,
    ConsoleCreated,
    EndpointsOpened,
    ChildSpawned,
    Running,
    Terminating,
    Closed,
}

/// Parameters for a new session
pub struct SessionOptions {
    pub cols: u32,
    pub rows: u32,
    /// Command line run through the configured shell
    pub command: String,
    /// Session id; enables the control socket
    pub id: Option<String>,
    sink: Option<Box<dyn OutputSink>>,
    notifier: Option<Notifier>,
}

impl SessionOptions {
    pub fn new(cols: u32, rows: u32, command: impl Into<String>) -> Self {
        Self {
            cols,
            rows,
            command: command.into(),
            id: None,
            sink: None,
            notifier: None,
        }
    }

    /// Listen for resize messages under `id`
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Deliver output to `sink` instead of buffering it for
    /// [`SessionHandle::read_output_nonblocking`]
    pub fn with_sink(mut self, sink: impl OutputSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Call `notifier` from the pump thread whenever buffered output grows
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }
}

/// Kills a spawned child if setup fails after the spawn step
struct ChildGuard(Option<Box<dyn ChildProcess>>);

impl ChildGuard {
    fn disarm(mut self) -> Option<Box<dyn ChildProcess>> {
        self.0.take()
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.0.take() {
            tracing::debug!(pid = child.pid(), "killing child of failed session");
            if let Err(e) = child.kill() {
                tracing::warn!("failed to kill child: {}", e);
            }
        }
    }
}

fn advance(state: &mut SessionState, next: SessionState, id: Option<&str>) {
    tracing::debug!(id, from = ?*state, to = ?next, "session state");
    *state = next;
}

fn failed(state: SessionState, err: SetupError) -> SetupError {
    tracing::warn!(?state, code = err.exit_code(), "session setup failed: {}", err);
    err
}

/// An owned, running pseudo-console session
pub struct SessionHandle {
    id: Option<String>,
    state: SessionState,
    console: Arc<SharedConsole>,
    input: Option<WriteCoalescer<Box<dyn Write + Send>>>,
    child: Option<Box<dyn ChildProcess>>,
    pump: Pump,
    pending: Option<Arc<PendingOutput>>,
    exited: Arc<WakePipe>,
    exit_code: Option<i32>,
    join_timeout: Duration,
    arena: Option<Arena>,
}

impl SessionHandle {
    /// Start `command` on a `cols` x `rows` pty with default settings
    pub fn create(cols: u32, rows: u32, command: &str) -> Result<Self, SetupError> {
        let backend = UnixBackend::shared().map_err(SetupError::BackendUnavailable)?;
        Self::create_with(
            backend,
            &ProxyConfig::default(),
            SessionOptions::new(cols, rows, command),
        )
    }

    /// Build a session on `backend`
    ///
    /// On error every resource acquired so far has been released in reverse
    /// order and the error names the step that failed.
    pub fn create_with<B: ConsoleBackend>(
        backend: &B,
        config: &ProxyConfig,
        options: SessionOptions,
    ) -> Result<Self, SetupError> {
        let SessionOptions {
            cols,
            rows,
            command,
            id,
            sink,
            notifier,
        } = options;
        let mut state = SessionState::Uninitialized;

        let size = WindowSize::checked(cols, rows)
            .ok_or_else(|| failed(state, SetupError::InvalidSize { cols, rows }))?;

        // Declared first so it is released last
        let arena = Arena::with_limits(config.arena.initial_block_size, config.arena.max_block_size)
            .map_err(|e| failed(state, SetupError::Arena(e)))?;

        let control = match id.as_deref() {
            Some(id) => Some(
                ControlChannel::bind(&config.runtime_dir(), id).map_err(|e| failed(state, e))?,
            ),
            None => None,
        };

        let stop = backend
            .create_wake_pipe()
            .map_err(|e| failed(state, SetupError::Pipe(e)))?;
        let exited = backend
            .create_wake_pipe()
            .map_err(|e| failed(state, SetupError::Pipe(e)))?;
        advance(&mut state, SessionState::PipesCreated, id.as_deref());

        let console = backend
            .create_console(size)
            .map_err(|e| failed(state, SetupError::Console(e)))?;
        advance(&mut state, SessionState::ConsoleCreated, id.as_deref());

        let Endpoints { input, output } = backend
            .open_endpoints(&console)
            .map_err(|e| failed(state, SetupError::Endpoints(e)))?;
        advance(&mut state, SessionState::EndpointsOpened, id.as_deref());

        let plan = SpawnPlan::build(&arena, &config.shell, &command, &config.term)
            .map_err(|e| failed(state, SetupError::Attributes(e)))?;
        let child = backend
            .spawn(&console, &plan)
            .map_err(|e| failed(state, SetupError::Spawn(e)))?;
        let child: Box<dyn ChildProcess> = Box::new(child);
        let child = ChildGuard(Some(child));
        advance(&mut state, SessionState::ChildSpawned, id.as_deref());

        let console = Arc::new(SharedConsole::new(Box::new(console), size));
        let (sink, pending) = match sink {
            Some(sink) => (sink, None),
            None => {
                let pending = Arc::new(PendingOutput::new(config.pump.pending_capacity));
                let sink: Box<dyn OutputSink> =
                    Box::new(PendingSink::new(pending.clone(), notifier));
                (sink, Some(pending))
            },
        };
        let exited = Arc::new(exited);

        let context = PumpContext {
            output: Box::new(output),
            sink,
            console: console.clone(),
            control,
            stop: Arc::new(stop),
            exited: exited.clone(),
            buffer_size: config.pump.buffer_size,
        };
        let pump = match Pump::start(context) {
            Ok(pump) => pump,
            Err(e) => {
                // The output endpoint went down with the context
                drop(child);
                drop(input);
                console.release();
                return Err(failed(state, SetupError::PumpStart(e)));
            },
        };

        let child = child.disarm();
        advance(&mut state, SessionState::Running, id.as_deref());
        tracing::info!(
            id = id.as_deref(),
            cols = size.cols,
            rows = size.rows,
            command = %command,
            "session running"
        );

        let input: Box<dyn Write + Send> = Box::new(input);
        Ok(Self {
            id,
            state,
            console,
            input: Some(WriteCoalescer::new(input, &config.coalescer)),
            child,
            pump,
            pending,
            exited,
            exit_code: None,
            join_timeout: config.pump.join_timeout(),
            arena: Some(arena),
        })
    }

    /// Current lifecycle state
    ///
    /// A running session whose output stream has ended reports `Terminating`.
    pub fn state(&self) -> SessionState {
        match self.state {
            SessionState::Running if self.pump.is_finished() => SessionState::Terminating,
            state => state,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Last size applied to the console
    pub fn size(&self) -> WindowSize {
        self.console.size()
    }

    /// Size the OS reports for the console
    pub fn query_os_size(&self) -> Result<WindowSize, SessionError> {
        self.console.query_os_size()
    }

    /// Resize the console; a request for the current size does nothing
    pub fn resize(&mut self, cols: u32, rows: u32) -> Result<ResizeOutcome, SessionError> {
        let size =
            WindowSize::checked(cols, rows).ok_or(SessionError::InvalidSize { cols, rows })?;
        if self.state() != SessionState::Running {
            return Err(SessionError::NotRunning);
        }

        let outcome = self.console.resize(size)?;
        if outcome == ResizeOutcome::Resized {
            tracing::info!(id = self.id(), cols, rows, "session resized");
        }
        Ok(outcome)
    }

    /// Write `bytes` to the child right away
    ///
    /// Bytes queued with [`queue_input`](Self::queue_input) go out first.
    /// Returns `Ok(0)` once the session is no longer running, and
    /// `InputClosed` if the child's input went away mid-write.
    pub fn write_input(&mut self, bytes: &[u8]) -> Result<usize, SessionError> {
        if self.state() != SessionState::Running {
            return Ok(0);
        }
        let Some(input) = self.input.as_mut() else {
            return Ok(0);
        };

        drain(input)?;
        let sink = input.sink_mut();
        sink.write_all(bytes).map_err(input_error)?;
        sink.flush().map_err(input_error)?;
        Ok(bytes.len())
    }

    /// Buffer `bytes` in the write coalescer
    pub fn queue_input(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        if self.state() != SessionState::Running {
            return Err(SessionError::NotRunning);
        }
        let input = self.input.as_mut().ok_or(SessionError::InputClosed)?;
        input.write(bytes).map_err(input_error)
    }

    /// Write out everything the coalescer holds
    pub fn flush_input(&mut self) -> Result<usize, SessionError> {
        match self.input.as_mut() {
            Some(input) => drain(input),
            None => Ok(0),
        }
    }

    /// Flush queued input if its timer expired at `now`
    pub fn poll_input_timer(&mut self, now: Instant) -> Result<usize, SessionError> {
        match self.input.as_mut() {
            Some(input) => input.poll_timer(now).map_err(input_error),
            None => Ok(0),
        }
    }

    /// When queued input must be flushed, if any is queued
    pub fn input_deadline(&self) -> Option<Instant> {
        self.input.as_ref().and_then(WriteCoalescer::deadline)
    }

    /// Take all output buffered since the last call; empty if none
    ///
    /// Always empty for sessions created with a custom sink.
    pub fn read_output_nonblocking(&self) -> Vec<u8> {
        self.pending
            .as_ref()
            .map(|pending| pending.take())
            .unwrap_or_default()
    }

    /// Block until output is buffered, the stream ends, or `timeout` passes
    pub fn wait_for_output(&self, timeout: Duration) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|pending| pending.wait_for_data(timeout))
    }

    /// True while the child runs and its output stream is open
    ///
    /// Once this returns false because the child exited, [`exit_code`]
    /// is already set.
    ///
    /// [`exit_code`]: Self::exit_code
    pub fn is_alive(&mut self) -> bool {
        if self.state != SessionState::Running {
            return false;
        }
        let finished = self.pump.is_finished();
        let Some(child) = self.child.as_mut() else {
            return !finished;
        };

        // The output stream can end a moment before the exit is reapable
        let status = if finished {
            wait_exit(child.as_mut(), EXIT_GRACE)
        } else {
            child.try_wait()
        };
        match status {
            Ok(Some(code)) => {
                self.exit_code = Some(code);
                false
            },
            Ok(None) => !finished,
            Err(e) => {
                tracing::debug!("child status unavailable: {}", e);
                false
            },
        }
    }

    /// Exit status of the child once it has been reaped
    ///
    /// Death by signal is reported as `128 + signal`.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|child| child.pid())
    }

    /// Descriptor that becomes readable when the output stream ends
    pub fn exit_fd(&self) -> BorrowedFd<'_> {
        self.exited.as_fd()
    }

    /// Force-terminate the child and release everything
    ///
    /// Safe to call repeatedly.
    pub fn kill(&mut self) -> Result<(), SessionError> {
        self.teardown(true);
        Ok(())
    }

    /// Release everything without killing the child
    ///
    /// The child sees a hangup. Its exit status is recorded if it exits
    /// within the join timeout; otherwise it is reaped in the background.
    pub fn close(&mut self) {
        self.teardown(false);
    }

    fn teardown(&mut self, kill_child: bool) {
        if matches!(self.state, SessionState::Terminating | SessionState::Closed) {
            return;
        }
        let id = self.id.clone();
        advance(&mut self.state, SessionState::Terminating, id.as_deref());

        if let Some(pending) = &self.pending {
            pending.close();
        }
        if let Some(exit) = self.pump.stop(self.join_timeout) {
            tracing::debug!(?exit, "pump joined");
        }

        if self.console.release() {
            tracing::debug!("console released");
        }
        self.input = None;

        if let Some(mut child) = self.child.take() {
            if kill_child {
                if let Err(e) = child.kill() {
                    tracing::warn!(pid = child.pid(), "failed to kill child: {}", e);
                }
            }
            match wait_exit(child.as_mut(), self.join_timeout) {
                Ok(Some(code)) => {
                    tracing::debug!(pid = child.pid(), code, "child reaped");
                    self.exit_code = Some(code);
                },
                Ok(None) => reap_in_background(child),
                Err(e) => tracing::debug!("child status unavailable: {}", e),
            }
        }

        if let Some(arena) = self.arena.take() {
            arena.destroy();
        }
        advance(&mut self.state, SessionState::Closed, id.as_deref());
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.teardown(false);
    }
}

/// Poll for the child's exit status until `timeout` passes
fn wait_exit(child: &mut dyn ChildProcess, timeout: Duration) -> io::Result<Option<i32>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(code) = child.try_wait()? {
            return Ok(Some(code));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(REAP_INTERVAL.min(deadline - now));
    }
}

/// Hand a child that ignored the hangup to a thread that waits for it
fn reap_in_background(mut child: Box<dyn ChildProcess>) {
    let pid = child.pid();
    tracing::debug!(pid, "child still running; reaping in background");
    let spawned = thread::Builder::new()
        .name("ptyproxy-reaper".to_string())
        .spawn(move || match child.wait() {
            Ok(code) => tracing::debug!(pid, code, "child reaped"),
            Err(e) => tracing::debug!(pid, "child status unavailable: {}", e),
        });
    if let Err(e) = spawned {
        tracing::warn!(pid, "failed to start reaper thread: {}", e);
    }
}

/// Flush the coalescer until empty
fn drain(input: &mut WriteCoalescer<Box<dyn Write + Send>>) -> Result<usize, SessionError> {
    let mut total = 0;
    while input.pending() > 0 {
        match input.flush().map_err(input_error)? {
            0 => return Err(SessionError::Io(io::Error::from(io::ErrorKind::WouldBlock))),
            n => total += n,
        }
    }
    Ok(total)
}

/// Map write errors that mean the child's side is gone
fn input_error(e: io::Error) -> SessionError {
    if e.kind() == io::ErrorKind::BrokenPipe || e.raw_os_error() == Some(libc::EIO) {
        SessionError::InputClosed
    } else {
        SessionError::Io(e)
    }
}
