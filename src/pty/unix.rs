//! Unix pseudo-console backend
//!
//! The console is a `posix_openpt` master/slave pair. The slave stays open in
//! the parent only until the child has been forked; after that the child owns
//! the last slave descriptor, so the master reads EIO once the child exits.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, unlockpt, PtyMaster};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use super::{
    dup_cloexec, set_cloexec, ChildProcess, ConsoleBackend, Endpoints, PseudoConsole, WindowSize,
};
use crate::spawn::SpawnPlan;

/// Pseudo-console capability backed by the system's pty multiplexer
#[derive(Debug)]
pub struct UnixBackend {
    _checked: (),
}

static BACKEND: OnceLock<Result<UnixBackend, String>> = OnceLock::new();

impl UnixBackend {
    /// The process-wide backend, checked on first use
    ///
    /// Fails if no pseudo-terminal can be opened at all.
    pub fn shared() -> io::Result<&'static UnixBackend> {
        let backend = BACKEND.get_or_init(|| {
            let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)
                .map_err(|e| format!("posix_openpt: {}", e))?;
            drop(master);
            tracing::debug!("pty backend available");
            Ok(UnixBackend { _checked: () })
        });
        backend
            .as_ref()
            .map_err(|msg| io::Error::new(io::ErrorKind::Unsupported, msg.clone()))
    }
}

/// A pty master plus the not yet handed-off slave
pub struct UnixConsole {
    master: PtyMaster,
    slave: Mutex<Option<OwnedFd>>,
    slave_path: PathBuf,
}

impl UnixConsole {
    fn open(size: WindowSize) -> io::Result<Self> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)?;
        grantpt(&master)?;
        unlockpt(&master)?;
        set_cloexec(&master)?;

        let slave_path = PathBuf::from(slave_name(&master)?);
        let slave = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_CLOEXEC)
            .open(&slave_path)?;

        set_window_size(master.as_raw_fd(), size)?;

        tracing::debug!(
            slave = %slave_path.display(),
            cols = size.cols,
            rows = size.rows,
            "pty opened"
        );

        Ok(Self {
            master,
            slave: Mutex::new(Some(OwnedFd::from(slave))),
            slave_path,
        })
    }

    /// Path of the slave device, e.g. `/dev/pts/3`
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    fn master_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the master descriptor is owned by self and outlives the borrow
        unsafe { BorrowedFd::borrow_raw(self.master.as_raw_fd()) }
    }
}

#[cfg(target_os = "linux")]
fn slave_name(master: &PtyMaster) -> io::Result<String> {
    Ok(nix::pty::ptsname_r(master)?)
}

#[cfg(not(target_os = "linux"))]
fn slave_name(master: &PtyMaster) -> io::Result<String> {
    // SAFETY: ptsname uses a static buffer; the name is copied out before
    // any other pty is created on this path
    Ok(unsafe { nix::pty::ptsname(master) }?)
}

impl PseudoConsole for UnixConsole {
    fn resize(&self, size: WindowSize) -> io::Result<()> {
        set_window_size(self.master.as_raw_fd(), size)
    }

    fn size(&self) -> io::Result<WindowSize> {
        get_window_size(self.master.as_raw_fd())
    }
}

impl ConsoleBackend for UnixBackend {
    type Console = UnixConsole;
    type Input = File;
    type Output = File;
    type Child = UnixChild;

    fn create_console(&self, size: WindowSize) -> io::Result<UnixConsole> {
        UnixConsole::open(size)
    }

    fn open_endpoints(&self, console: &UnixConsole) -> io::Result<Endpoints<File, File>> {
        let input = File::from(dup_cloexec(console.master_fd())?);
        let output = File::from(dup_cloexec(console.master_fd())?);
        Ok(Endpoints { input, output })
    }

    fn spawn(&self, console: &UnixConsole, plan: &SpawnPlan<'_>) -> io::Result<UnixChild> {
        let slave = console
            .slave
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| io::Error::other("pty slave already handed to a child"))?;

        // SAFETY: the child branch only calls async-signal-safe functions and
        // every buffer it reads was prepared before the fork
        match unsafe { fork() }? {
            ForkResult::Child => unsafe { exec_child(slave.as_raw_fd(), plan) },
            ForkResult::Parent { child } => {
                drop(slave);
                tracing::info!(pid = child.as_raw(), "child spawned");
                Ok(UnixChild {
                    pid: child,
                    state: ChildState::Running,
                })
            },
        }
    }
}

/// Runs in the forked child. Never returns.
///
/// # Safety
///
/// Must only be called in the child of a `fork`.
unsafe fn exec_child(slave: RawFd, plan: &SpawnPlan<'_>) -> ! {
    libc::setsid();
    libc::ioctl(slave, libc::TIOCSCTTY as _, 0);

    libc::dup2(slave, libc::STDIN_FILENO);
    libc::dup2(slave, libc::STDOUT_FILENO);
    libc::dup2(slave, libc::STDERR_FILENO);
    if slave > libc::STDERR_FILENO {
        libc::close(slave);
    }

    libc::signal(libc::SIGPIPE, libc::SIG_DFL);

    libc::execve(plan.program().as_ptr(), plan.argv_ptr(), plan.envp_ptr());
    libc::_exit(127)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildState {
    Running,
    Exited(i32),
    /// Reaped by someone else
    Lost,
}

/// A forked child process
#[derive(Debug)]
pub struct UnixChild {
    pid: Pid,
    state: ChildState,
}

impl UnixChild {
    fn record(&mut self, status: WaitStatus) -> Option<i32> {
        let code = match status {
            WaitStatus::Exited(_, code) => code,
            WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
            _ => return None,
        };
        tracing::debug!(pid = self.pid.as_raw(), code, "child reaped");
        self.state = ChildState::Exited(code);
        Some(code)
    }
}

impl ChildProcess for UnixChild {
    fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        match self.state {
            ChildState::Exited(code) => return Ok(Some(code)),
            ChildState::Lost => return Err(io::Error::from(Errno::ECHILD)),
            ChildState::Running => {},
        }

        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => Ok(self.record(status)),
            Err(Errno::ECHILD) => {
                self.state = ChildState::Lost;
                Err(io::Error::from(Errno::ECHILD))
            },
            Err(e) => Err(e.into()),
        }
    }

    fn wait(&mut self) -> io::Result<i32> {
        match self.state {
            ChildState::Exited(code) => return Ok(code),
            ChildState::Lost => return Err(io::Error::from(Errno::ECHILD)),
            ChildState::Running => {},
        }

        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    if let Some(code) = self.record(status) {
                        return Ok(code);
                    }
                },
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    self.state = ChildState::Lost;
                    return Err(io::Error::from(Errno::ECHILD));
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        if self.state != ChildState::Running {
            return Ok(());
        }

        match signal::kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {},
            Err(e) => return Err(e.into()),
        }

        match self.wait() {
            Ok(_) => Ok(()),
            Err(_) if self.state == ChildState::Lost => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for UnixChild {
    fn drop(&mut self) {
        // Try to reap the child process
        if self.state == ChildState::Running {
            let _ = waitpid(self.pid, Some(WaitPidFlag::WNOHANG));
        }
    }
}

/// Set the window size on a pty descriptor
fn set_window_size(fd: RawFd, size: WindowSize) -> io::Result<()> {
    let winsize = size.to_winsize();

    // SAFETY: TIOCSWINSZ reads a winsize struct that lives for the call
    let result = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ as _, &winsize) };

    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Get the window size from a pty descriptor
fn get_window_size(fd: RawFd) -> io::Result<WindowSize> {
    let mut winsize = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // SAFETY: TIOCGWINSZ writes into the winsize struct we own
    let result = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ as _, &mut winsize) };

    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(WindowSize::from(winsize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use std::io::Read;
    use std::time::{Duration, Instant};

    fn spawn(command: &str) -> (UnixConsole, Endpoints<File, File>, UnixChild) {
        let backend = UnixBackend::shared().unwrap();
        let console = backend.create_console(WindowSize::new(80, 24)).unwrap();
        let endpoints = backend.open_endpoints(&console).unwrap();
        let arena = Arena::new(4096).unwrap();
        let plan = SpawnPlan::build(&arena, "/bin/sh", command, "xterm-256color").unwrap();
        let child = backend.spawn(&console, &plan).unwrap();
        (console, endpoints, child)
    }

    fn read_until_eof(output: &mut File) -> Vec<u8> {
        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match output.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // EIO once the slave side is gone
                Err(_) => break,
            }
        }
        collected
    }

    #[test]
    fn test_console_size_roundtrip() {
        let backend = UnixBackend::shared().unwrap();
        let console = backend.create_console(WindowSize::new(80, 24)).unwrap();
        assert_eq!(console.size().unwrap(), WindowSize::new(80, 24));

        console.resize(WindowSize::new(120, 40)).unwrap();
        let size = console.size().unwrap();
        assert_eq!(size.cols, 120);
        assert_eq!(size.rows, 40);
        assert!(console.slave_path().starts_with("/dev"));
    }

    #[test]
    fn test_spawn_echo() {
        let (_console, mut endpoints, mut child) = spawn("echo hello");

        let output = read_until_eof(&mut endpoints.output);
        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("hello"), "unexpected output: {:?}", text);

        let deadline = Instant::now() + Duration::from_secs(5);
        let code = loop {
            if let Some(code) = child.try_wait().unwrap() {
                break code;
            }
            assert!(Instant::now() < deadline, "child did not exit");
            std::thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(code, 0);
    }

    #[test]
    fn test_child_sees_term_and_size() {
        let (_console, mut endpoints, _child) = spawn("echo $TERM; stty size");
        let output = read_until_eof(&mut endpoints.output);
        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("xterm-256color"), "unexpected output: {:?}", text);
        assert!(text.contains("24 80"), "unexpected output: {:?}", text);
    }

    #[test]
    fn test_kill_reaps_child() {
        let (_console, _endpoints, mut child) = spawn("sleep 30");
        assert_eq!(child.try_wait().unwrap(), None);

        child.kill().unwrap();
        assert_eq!(child.try_wait().unwrap(), Some(128 + libc::SIGKILL));
        // Second kill is a no-op
        child.kill().unwrap();
    }

    #[test]
    fn test_wait_blocks_until_exit() {
        let (_console, _endpoints, mut child) = spawn("sleep 0.1; exit 3");
        assert_eq!(child.wait().unwrap(), 3);
        assert_eq!(child.try_wait().unwrap(), Some(3));
        assert_eq!(child.wait().unwrap(), 3);
    }

    #[test]
    fn test_slave_handed_off_once() {
        let (console, _endpoints, mut child) = spawn("true");
        let arena = Arena::new(4096).unwrap();
        let plan = SpawnPlan::build(&arena, "/bin/sh", "true", "dumb").unwrap();
        let backend = UnixBackend::shared().unwrap();
        assert!(backend.spawn(&console, &plan).is_err());
        let _ = child.kill();
    }
}
