//! In-memory console backend for tests
//!
//! Endpoints are real OS pipes so the pump can `poll` them. Every acquisition
//! and release is appended to a shared [`Ledger`], and any setup step can be
//! made to fail. Dropping the console hangs up the child, which then reports
//! `128 + SIGHUP` unless it was built to ignore hangups.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use super::{
    set_cloexec, ChildProcess, ConsoleBackend, Endpoints, PseudoConsole, WakePipe, WindowSize,
};
use crate::spawn::SpawnPlan;

/// Ordered record of resource events
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    events: Mutex<Vec<String>>,
    resize_calls: AtomicUsize,
    spawned: Mutex<Vec<Vec<String>>>,
}

impl Ledger {
    pub fn record(&self, event: impl Into<String>) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    pub fn resize_calls(&self) -> usize {
        self.resize_calls.load(Ordering::SeqCst)
    }

    /// argv of every spawned child
    pub fn spawned(&self) -> Vec<Vec<String>> {
        self.spawned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Setup step to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailStep {
    Pipe,
    Console,
    Endpoints,
    Spawn,
}

type Shared<T> = Arc<Mutex<T>>;

/// Test-side ends of the child's terminal
pub(crate) struct Peer {
    /// Bytes the session wrote as child input
    pub stdin: File,
    stdout: Shared<Option<File>>,
    status: Shared<Option<i32>>,
}

impl Peer {
    /// Emit bytes as if the child printed them
    pub fn print(&self, bytes: &[u8]) {
        if let Some(out) = self
            .stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            out.write_all(bytes).unwrap();
        }
    }

    /// Exit the fake child: closes its output and records the status
    pub fn exit(&self, code: i32) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = Some(code);
        self.stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Close the child's output without exiting
    pub fn close_output(&self) {
        self.stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Read exactly `len` bytes of child input
    pub fn read_input(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.stdin.read_exact(&mut buf).unwrap();
        buf
    }
}

/// Backend whose consoles are recorded instead of created
pub(crate) struct FakeBackend {
    ledger: Arc<Ledger>,
    fail_at: Option<FailStep>,
    pipes: AtomicUsize,
    peer: Mutex<Option<(Shared<Option<File>>, Shared<Option<i32>>)>>,
    stdin: Mutex<Option<File>>,
    hangup: Arc<AtomicBool>,
    ignore_hangup: bool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            ledger: Arc::new(Ledger::default()),
            fail_at: None,
            pipes: AtomicUsize::new(0),
            peer: Mutex::new(None),
            stdin: Mutex::new(None),
            hangup: Arc::new(AtomicBool::new(false)),
            ignore_hangup: false,
        }
    }

    /// Children keep running after their console is closed
    pub fn ignoring_hangup() -> Self {
        Self {
            ignore_hangup: true,
            ..Self::new()
        }
    }

    pub fn failing_at(step: FailStep) -> Self {
        Self {
            fail_at: Some(step),
            ..Self::new()
        }
    }

    pub fn ledger(&self) -> Arc<Ledger> {
        self.ledger.clone()
    }

    /// Take the child-side ends after a successful create
    pub fn peer(&self) -> Peer {
        let (stdout, status) = self
            .peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap();
        let stdin = self
            .stdin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap();
        Peer {
            stdin,
            stdout,
            status,
        }
    }

    fn fail(&self, step: FailStep) -> io::Result<()> {
        if self.fail_at == Some(step) {
            return Err(io::Error::other(format!("injected {:?} failure", step)));
        }
        Ok(())
    }
}

impl ConsoleBackend for FakeBackend {
    type Console = FakeConsole;
    type Input = FakeInput;
    type Output = FakeOutput;
    type Child = FakeChild;

    fn create_wake_pipe(&self) -> io::Result<WakePipe> {
        // Fail on the second pipe so the first has to be unwound
        if self.pipes.fetch_add(1, Ordering::SeqCst) == 1 {
            self.fail(FailStep::Pipe)?;
        }
        let pipe = WakePipe::new()?;
        self.ledger.record("acquire pipe");
        let ledger = self.ledger.clone();
        Ok(pipe.on_release(move || ledger.record("release pipe")))
    }

    fn create_console(&self, size: WindowSize) -> io::Result<FakeConsole> {
        self.fail(FailStep::Console)?;
        let mut console = FakeConsole::new(self.ledger.clone(), size);
        if !self.ignore_hangup {
            console.hangup = Some(self.hangup.clone());
        }
        Ok(console)
    }

    fn open_endpoints(
        &self,
        _console: &FakeConsole,
    ) -> io::Result<Endpoints<FakeInput, FakeOutput>> {
        self.fail(FailStep::Endpoints)?;

        let (stdin_reader, stdin_writer) = cloexec_pipe()?;
        self.ledger.record("acquire input");
        let input = FakeInput {
            file: File::from(stdin_writer),
            ledger: self.ledger.clone(),
        };

        let (stdout_reader, stdout_writer) = cloexec_pipe()?;
        self.ledger.record("acquire output");
        let output = FakeOutput {
            file: File::from(stdout_reader),
            ledger: self.ledger.clone(),
        };

        *self.stdin.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(File::from(stdin_reader));
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner) = Some((
            Arc::new(Mutex::new(Some(File::from(stdout_writer)))),
            Arc::new(Mutex::new(None)),
        ));

        Ok(Endpoints { input, output })
    }

    fn spawn(&self, _console: &FakeConsole, plan: &SpawnPlan<'_>) -> io::Result<FakeChild> {
        self.fail(FailStep::Spawn)?;

        let argv = plan
            .args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        self.ledger
            .spawned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(argv);
        self.ledger.record("spawn child");

        let (stdout, status) = self
            .peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(out, status)| (out.clone(), status.clone()))
            .ok_or_else(|| io::Error::other("endpoints not opened"))?;

        Ok(FakeChild {
            ledger: self.ledger.clone(),
            stdout,
            status,
            hangup: self.hangup.clone(),
        })
    }
}

/// Keeps pipe ends out of children forked by other tests
fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (reader, writer) = nix::unistd::pipe()?;
    set_cloexec(&reader)?;
    set_cloexec(&writer)?;
    Ok((reader, writer))
}

pub(crate) struct FakeConsole {
    ledger: Arc<Ledger>,
    size: Mutex<WindowSize>,
    /// Raised on drop
    hangup: Option<Arc<AtomicBool>>,
}

impl FakeConsole {
    pub fn new(ledger: Arc<Ledger>, size: WindowSize) -> Self {
        ledger.record("acquire console");
        Self {
            ledger,
            size: Mutex::new(size),
            hangup: None,
        }
    }
}

impl PseudoConsole for FakeConsole {
    fn resize(&self, size: WindowSize) -> io::Result<()> {
        self.ledger.resize_calls.fetch_add(1, Ordering::SeqCst);
        *self.size.lock().unwrap_or_else(PoisonError::into_inner) = size;
        Ok(())
    }

    fn size(&self) -> io::Result<WindowSize> {
        Ok(*self.size.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Drop for FakeConsole {
    fn drop(&mut self) {
        self.ledger.record("release console");
        if let Some(hangup) = &self.hangup {
            hangup.store(true, Ordering::SeqCst);
        }
    }
}

pub(crate) struct FakeInput {
    file: File,
    ledger: Arc<Ledger>,
}

impl Write for FakeInput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Drop for FakeInput {
    fn drop(&mut self) {
        self.ledger.record("release input");
    }
}

pub(crate) struct FakeOutput {
    file: File,
    ledger: Arc<Ledger>,
}

impl Read for FakeOutput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl AsFd for FakeOutput {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Drop for FakeOutput {
    fn drop(&mut self) {
        self.ledger.record("release output");
    }
}

pub(crate) struct FakeChild {
    ledger: Arc<Ledger>,
    stdout: Shared<Option<File>>,
    status: Shared<Option<i32>>,
    hangup: Arc<AtomicBool>,
}

impl ChildProcess for FakeChild {
    fn pid(&self) -> u32 {
        4242
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if status.is_none() && self.hangup.load(Ordering::SeqCst) {
            *status = Some(128 + libc::SIGHUP);
        }
        Ok(*status)
    }

    fn wait(&mut self) -> io::Result<i32> {
        loop {
            if let Some(code) = self.try_wait()? {
                return Ok(code);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if status.is_none() {
            self.ledger.record("kill child");
            *status = Some(128 + libc::SIGKILL);
            self.stdout
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }
        Ok(())
    }
}

impl Drop for FakeChild {
    fn drop(&mut self) {
        self.ledger.record("release child");
    }
}
