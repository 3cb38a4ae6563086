//! Pseudo-console capability
//!
//! The session never touches the OS pty API directly. It is handed a
//! [`ConsoleBackend`] that knows how to create the console, open its byte
//! endpoints and spawn a child attached to it, so tests can substitute a fake.

#[cfg(test)]
pub(crate) mod fake;
#[cfg(unix)]
mod unix;

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::poll::PollTimeout;

#[cfg(unix)]
pub use unix::{UnixBackend, UnixChild, UnixConsole};

use crate::error::SessionError;
use crate::spawn::SpawnPlan;

/// Window size for the pseudo-console
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl WindowSize {
    /// Create a new window size with just rows and columns
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    /// Validate caller-supplied dimensions
    ///
    /// Both must be in `1..=65535`.
    pub fn checked(cols: u32, rows: u32) -> Option<Self> {
        let c = u16::try_from(cols).ok().filter(|&c| c > 0)?;
        let r = u16::try_from(rows).ok().filter(|&r| r > 0)?;
        Some(Self::new(c, r))
    }

    /// True when the character grid is the same (pixel sizes are ignored)
    pub fn same_grid(&self, other: &WindowSize) -> bool {
        self.cols == other.cols && self.rows == other.rows
    }

    pub(crate) fn to_winsize(self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pixel_width,
            ws_ypixel: self.pixel_height,
        }
    }
}

impl From<libc::winsize> for WindowSize {
    fn from(ws: libc::winsize) -> Self {
        Self {
            rows: ws.ws_row,
            cols: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// Readable end of a session: bytes the child wrote to its terminal
///
/// Needs a descriptor so the pump can wait on it.
pub trait OutputEndpoint: Read + AsFd + Send {}

impl<T: Read + AsFd + Send> OutputEndpoint for T {}

/// The two byte streams of a pseudo-console
pub struct Endpoints<I, O> {
    /// Consumer to child
    pub input: I,
    /// Child to consumer
    pub output: O,
}

/// A live pseudo-console
pub trait PseudoConsole: Send + Sync {
    /// Apply a new size
    fn resize(&self, size: WindowSize) -> io::Result<()>;

    /// Read the size the OS currently reports
    fn size(&self) -> io::Result<WindowSize>;
}

/// A child process attached to a pseudo-console
pub trait ChildProcess: Send {
    fn pid(&self) -> u32;

    /// Reap without blocking; `Some(code)` once the child has exited
    fn try_wait(&mut self) -> io::Result<Option<i32>>;

    /// Block until the child exits and return its status
    fn wait(&mut self) -> io::Result<i32>;

    /// Force-terminate and reap
    fn kill(&mut self) -> io::Result<()>;
}

/// Factory for the OS resources a session is built from
pub trait ConsoleBackend: Send + Sync {
    type Console: PseudoConsole + 'static;
    type Input: Write + Send + 'static;
    type Output: OutputEndpoint + 'static;
    type Child: ChildProcess + 'static;

    /// Create one of the session's wake-up pipes
    fn create_wake_pipe(&self) -> io::Result<WakePipe> {
        WakePipe::new()
    }

    fn create_console(&self, size: WindowSize) -> io::Result<Self::Console>;

    fn open_endpoints(
        &self,
        console: &Self::Console,
    ) -> io::Result<Endpoints<Self::Input, Self::Output>>;

    /// Start the child described by `plan` with the console as its terminal
    fn spawn(&self, console: &Self::Console, plan: &SpawnPlan<'_>) -> io::Result<Self::Child>;
}

/// Self-pipe used to interrupt a `poll` from another thread
///
/// Both ends are non-blocking and close-on-exec. A signalled pipe stays
/// readable until drained.
pub struct WakePipe {
    reader: File,
    writer: File,
    #[cfg(test)]
    on_release: Option<Box<dyn Fn() + Send + Sync>>,
}

impl WakePipe {
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = nix::unistd::pipe()?;
        for fd in [&reader, &writer] {
            set_cloexec(fd)?;
            set_nonblocking(fd)?;
        }
        Ok(Self {
            reader: File::from(reader),
            writer: File::from(writer),
            #[cfg(test)]
            on_release: None,
        })
    }

    /// Run `hook` when the pipe is dropped
    #[cfg(test)]
    pub(crate) fn on_release(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    /// Make the read end readable
    pub fn signal(&self) {
        match (&self.writer).write(&[1]) {
            // A full pipe is already signalled
            Ok(_) => {},
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {},
            Err(e) => tracing::warn!("failed to signal wake pipe: {}", e),
        }
    }

    /// Consume pending wake-ups
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    /// Non-blocking check for a pending wake-up
    pub fn is_signalled(&self) -> bool {
        let mut fds = [nix::poll::PollFd::new(
            self.reader.as_fd(),
            nix::poll::PollFlags::POLLIN,
        )];
        matches!(nix::poll::poll(&mut fds, nix::poll::PollTimeout::ZERO), Ok(n) if n > 0)
    }
}

impl std::fmt::Debug for WakePipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakePipe")
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
impl Drop for WakePipe {
    fn drop(&mut self) {
        if let Some(hook) = &self.on_release {
            hook();
        }
    }
}

impl AsFd for WakePipe {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }
}

/// Milliseconds until `deadline`, rounded up; no deadline waits forever
pub(crate) fn poll_timeout(deadline: Option<Instant>, now: Instant) -> PollTimeout {
    match deadline {
        None => PollTimeout::NONE,
        Some(deadline) => {
            let micros = deadline.saturating_duration_since(now).as_micros();
            let millis = micros.div_ceil(1000);
            PollTimeout::from(u16::try_from(millis).unwrap_or(u16::MAX))
        },
    }
}

pub(crate) fn set_cloexec(fd: &impl AsRawFd) -> io::Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

pub(crate) fn set_nonblocking(fd: &impl AsRawFd) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Duplicate a descriptor with close-on-exec set
pub(crate) fn dup_cloexec(fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    fd.try_clone_to_owned()
}

/// Result of a resize request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeOutcome {
    /// The OS resize call was issued
    Resized,
    /// Requested size equals the current size; nothing was done
    Unchanged,
}

struct ConsoleSlot {
    console: Option<Box<dyn PseudoConsole>>,
    size: WindowSize,
}

/// The pseudo-console shared between the session owner and the pump thread
///
/// Resizes from the control channel and from the owner are serialized by the
/// lock, and a released console can no longer be resized.
pub struct SharedConsole {
    slot: Mutex<ConsoleSlot>,
}

impl SharedConsole {
    pub fn new(console: Box<dyn PseudoConsole>, size: WindowSize) -> Self {
        Self {
            slot: Mutex::new(ConsoleSlot {
                console: Some(console),
                size,
            }),
        }
    }

    /// Resize unless the grid already has the requested size
    pub fn resize(&self, size: WindowSize) -> Result<ResizeOutcome, SessionError> {
        if size.cols == 0 || size.rows == 0 {
            return Err(SessionError::InvalidSize {
                cols: size.cols.into(),
                rows: size.rows.into(),
            });
        }

        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.console.is_none() {
            return Err(SessionError::NotRunning);
        }
        if slot.size.same_grid(&size) {
            return Ok(ResizeOutcome::Unchanged);
        }
        if let Some(console) = slot.console.as_ref() {
            console.resize(size).map_err(SessionError::Resize)?;
        }
        slot.size = size;
        Ok(ResizeOutcome::Resized)
    }

    /// Last size applied through this handle
    pub fn size(&self) -> WindowSize {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).size
    }

    /// Size reported by the OS
    pub fn query_os_size(&self) -> Result<WindowSize, SessionError> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.console.as_ref() {
            Some(console) => Ok(console.size()?),
            None => Err(SessionError::NotRunning),
        }
    }

    /// Close the console; returns false if it was already closed
    pub fn release(&self) -> bool {
        let console = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .console
            .take();
        // Dropped outside the lock
        console.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .console
            .is_none()
    }
}
