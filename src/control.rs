//! Resize control channel
//!
//! Each standalone session listens on a Unix socket named after its id. A
//! client connects, writes `"<width> <height>"` and closes; no reply is sent.
//! The listener and every connected client are owned by the pump thread and
//! polled alongside the output endpoint. Nothing here blocks, so a client that
//! connects and goes quiet never holds up output.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{ClientError, SetupError};
use crate::pty::{ResizeOutcome, SharedConsole, WindowSize};

/// Longest message read from one connection
pub const MAX_MESSAGE_LEN: usize = 64;

/// How long a connected client may take to deliver its message
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(1);

const SOCKET_PREFIX: &str = "ptyproxy-ctrl-";

/// Parse `"<width> <height>"`
///
/// Both numbers must be in `1..=65535`; surrounding whitespace and trailing
/// NULs are ignored. Anything else yields `None`.
pub fn parse_message(bytes: &[u8]) -> Option<WindowSize> {
    let text = std::str::from_utf8(bytes).ok()?;
    let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');

    let mut fields = text.split_ascii_whitespace();
    let width: u32 = fields.next()?.parse().ok()?;
    let height: u32 = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    WindowSize::checked(width, height)
}

/// Check that `id` can be embedded in a socket file name
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && !id.starts_with('.')
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// Socket path for session `id`, or `None` if the id is unusable
pub fn socket_path(runtime_dir: &Path, id: &str) -> Option<PathBuf> {
    is_valid_id(id).then(|| runtime_dir.join(format!("{}{}.sock", SOCKET_PREFIX, id)))
}

/// A connection whose message has not fully arrived
#[derive(Debug)]
struct Client {
    stream: UnixStream,
    buf: Vec<u8>,
    since: Instant,
}

enum ClientRead {
    /// More bytes may follow
    Pending,
    /// EOF or [`MAX_MESSAGE_LEN`] bytes
    Complete,
    Failed(io::Error),
}

impl Client {
    /// Read whatever the socket holds without blocking
    fn read_available(&mut self) -> ClientRead {
        let mut chunk = [0u8; MAX_MESSAGE_LEN];
        while self.buf.len() < MAX_MESSAGE_LEN {
            let room = MAX_MESSAGE_LEN - self.buf.len();
            match self.stream.read(&mut chunk[..room]) {
                Ok(0) => return ClientRead::Complete,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ClientRead::Pending,
                Err(e) => return ClientRead::Failed(e),
            }
        }
        ClientRead::Complete
    }
}

/// Listening side of a session's control socket
///
/// The socket file is removed when the channel is dropped.
#[derive(Debug)]
pub struct ControlChannel {
    listener: UnixListener,
    path: PathBuf,
    clients: Vec<Client>,
}

impl ControlChannel {
    /// Claim the control socket for `id`
    ///
    /// Fails with `DuplicateId` if another live session answers on it. A
    /// leftover socket file nobody listens on is replaced.
    pub fn bind(runtime_dir: &Path, id: &str) -> Result<Self, SetupError> {
        let path = socket_path(runtime_dir, id)
            .ok_or_else(|| SetupError::InvalidArgs(format!("invalid session id {:?}", id)))?;

        if path.exists() {
            if UnixStream::connect(&path).is_ok() {
                return Err(SetupError::DuplicateId(id.to_string()));
            }
            tracing::debug!(path = %path.display(), "removing stale control socket");
            std::fs::remove_file(&path).map_err(SetupError::ControlChannel)?;
        }

        let listener = UnixListener::bind(&path).map_err(SetupError::ControlChannel)?;
        listener
            .set_nonblocking(true)
            .map_err(SetupError::ControlChannel)?;

        tracing::info!(path = %path.display(), "control channel listening");
        Ok(Self {
            listener,
            path,
            clients: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Connections still waiting to deliver a message
    pub fn pending_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn has_clients(&self) -> bool {
        !self.clients.is_empty()
    }

    /// Descriptors to poll for readability: the listener, then each client
    pub fn fds(&self) -> impl Iterator<Item = BorrowedFd<'_>> {
        std::iter::once(self.listener.as_fd())
            .chain(self.clients.iter().map(|client| client.stream.as_fd()))
    }

    /// When the oldest waiting client times out
    pub fn deadline(&self) -> Option<Instant> {
        self.clients
            .iter()
            .map(|client| client.since + CLIENT_TIMEOUT)
            .min()
    }

    /// Accept new connections and apply every message that is complete
    ///
    /// Never blocks. Returns the number of resizes applied. Malformed
    /// messages, failed resizes and clients silent past [`CLIENT_TIMEOUT`]
    /// are logged and dropped.
    pub fn service(&mut self, console: &SharedConsole) -> usize {
        self.accept_all();

        let now = Instant::now();
        let mut applied = 0;
        let mut i = 0;
        while i < self.clients.len() {
            match self.clients[i].read_available() {
                ClientRead::Complete => {
                    let client = self.clients.remove(i);
                    if apply(&client.buf, console) {
                        applied += 1;
                    }
                },
                ClientRead::Pending if now >= self.clients[i].since + CLIENT_TIMEOUT => {
                    let client = self.clients.remove(i);
                    tracing::debug!(
                        received = client.buf.len(),
                        "dropping control client that went quiet"
                    );
                },
                ClientRead::Pending => i += 1,
                ClientRead::Failed(e) => {
                    self.clients.remove(i);
                    tracing::debug!("control read failed: {}", e);
                },
            }
        }
        applied
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        tracing::debug!("control client setup failed: {}", e);
                        continue;
                    }
                    self.clients.push(Client {
                        stream,
                        buf: Vec::with_capacity(MAX_MESSAGE_LEN),
                        since: Instant::now(),
                    });
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!("control accept failed: {}", e);
                    break;
                },
            }
        }
    }
}

/// Apply one complete message; true if the console changed size
fn apply(message: &[u8], console: &SharedConsole) -> bool {
    let Some(size) = parse_message(message) else {
        tracing::debug!(
            message = %String::from_utf8_lossy(message),
            "ignoring malformed control message"
        );
        return false;
    };

    match console.resize(size) {
        Ok(ResizeOutcome::Resized) => {
            tracing::info!(cols = size.cols, rows = size.rows, "console resized");
            true
        },
        Ok(ResizeOutcome::Unchanged) => {
            tracing::debug!(
                cols = size.cols,
                rows = size.rows,
                "resize to current size ignored"
            );
            false
        },
        Err(e) => {
            tracing::warn!("resize failed: {}", e);
            false
        },
    }
}

impl AsFd for ControlChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.path.display(),
                    "failed to remove control socket: {}",
                    e
                );
            }
        }
    }
}

/// Ask the session `id` to resize to `cols` x `rows`
pub fn send_resize(runtime_dir: &Path, id: &str, cols: u32, rows: u32) -> Result<(), ClientError> {
    if WindowSize::checked(cols, rows).is_none() {
        return Err(ClientError::InvalidSize { cols, rows });
    }
    let path =
        socket_path(runtime_dir, id).ok_or_else(|| ClientError::InvalidId(id.to_string()))?;

    let mut stream = UnixStream::connect(&path).map_err(|source| ClientError::UnknownSession {
        id: id.to_string(),
        source,
    })?;
    stream.write_all(format!("{} {}", cols, rows).as_bytes())?;
    stream.shutdown(std::net::Shutdown::Write)?;

    tracing::debug!(id, cols, rows, "resize sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::fake::{FakeConsole, Ledger};
    use std::sync::Arc;

    fn console(ledger: &Arc<Ledger>) -> SharedConsole {
        SharedConsole::new(
            Box::new(FakeConsole::new(ledger.clone(), WindowSize::new(80, 24))),
            WindowSize::new(80, 24),
        )
    }

    /// Wait for the listener to have a connection queued, then serve it
    fn serve_one(channel: &mut ControlChannel, console: &SharedConsole) -> usize {
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
        let mut fds = [PollFd::new(channel.as_fd(), PollFlags::POLLIN)];
        poll(&mut fds, PollTimeout::from(2000u16)).unwrap();
        channel.service(console)
    }

    #[test]
    fn test_parse_message() {
        assert_eq!(parse_message(b"120 40"), Some(WindowSize::new(120, 40)));
        assert_eq!(parse_message(b"  120   40\n"), Some(WindowSize::new(120, 40)));
        assert_eq!(parse_message(b"120 40\0\0"), Some(WindowSize::new(120, 40)));
        assert_eq!(parse_message(b"65535 1"), Some(WindowSize::new(65535, 1)));
    }

    #[test]
    fn test_parse_message_rejects_malformed() {
        for bad in [
            &b""[..],
            b"120",
            b"120 40 7",
            b"0 40",
            b"120 0",
            b"-1 40",
            b"abc def",
            b"65536 40",
            b"12.5 40",
            b"\xff\xfe",
        ] {
            assert_eq!(parse_message(bad), None, "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_socket_path() {
        let dir = Path::new("/run/user/1000");
        assert_eq!(
            socket_path(dir, "build-1"),
            Some(PathBuf::from("/run/user/1000/ptyproxy-ctrl-build-1.sock"))
        );
        assert_eq!(socket_path(dir, ""), None);
        assert_eq!(socket_path(dir, "../etc"), None);
        assert_eq!(socket_path(dir, "a/b"), None);
    }

    #[test]
    fn test_resize_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(Ledger::default());
        let console = console(&ledger);
        let mut channel = ControlChannel::bind(dir.path(), "s1").unwrap();

        send_resize(dir.path(), "s1", 100, 30).unwrap();
        assert_eq!(serve_one(&mut channel, &console), 1);
        assert_eq!(console.size(), WindowSize::new(100, 30));
        assert_eq!(ledger.resize_calls(), 1);

        // Same size again: accepted but no OS call
        send_resize(dir.path(), "s1", 100, 30).unwrap();
        assert_eq!(serve_one(&mut channel, &console), 0);
        assert_eq!(ledger.resize_calls(), 1);
    }

    #[test]
    fn test_malformed_message_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(Ledger::default());
        let console = console(&ledger);
        let mut channel = ControlChannel::bind(dir.path(), "s2").unwrap();

        let mut stream = UnixStream::connect(channel.path()).unwrap();
        stream.write_all(b"wide tall").unwrap();
        drop(stream);
        assert_eq!(serve_one(&mut channel, &console), 0);
        assert_eq!(console.size(), WindowSize::new(80, 24));

        // The channel keeps accepting
        send_resize(dir.path(), "s2", 90, 20).unwrap();
        assert_eq!(serve_one(&mut channel, &console), 1);
    }

    #[test]
    fn test_duplicate_id() {
        let dir = tempfile::tempdir().unwrap();
        let _first = ControlChannel::bind(dir.path(), "dup").unwrap();
        let second = ControlChannel::bind(dir.path(), "dup");
        assert!(matches!(second, Err(SetupError::DuplicateId(id)) if id == "dup"));
    }

    #[test]
    fn test_stale_socket_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(dir.path(), "stale").unwrap();
        // Bound then dropped without cleanup leaves a dead socket file
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let channel = ControlChannel::bind(dir.path(), "stale").unwrap();
        assert_eq!(channel.path(), path);
        drop(channel);
        assert!(!path.exists());
    }

    #[test]
    fn test_send_resize_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            send_resize(dir.path(), "nobody", 80, 24),
            Err(ClientError::UnknownSession { .. })
        ));
        assert!(matches!(
            send_resize(dir.path(), "s", 0, 24),
            Err(ClientError::InvalidSize { cols: 0, rows: 24 })
        ));
        assert!(matches!(
            send_resize(dir.path(), "a/b", 80, 24),
            Err(ClientError::InvalidId(_))
        ));
    }

    #[test]
    fn test_idle_client_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(Ledger::default());
        let console = console(&ledger);
        let mut channel = ControlChannel::bind(dir.path(), "idle").unwrap();

        let mut idle = UnixStream::connect(channel.path()).unwrap();
        assert_eq!(serve_one(&mut channel, &console), 0);
        assert_eq!(channel.pending_clients(), 1);
        assert!(channel.deadline().is_some());
        assert_eq!(channel.fds().count(), 2);

        // A second client is served while the first stays open
        send_resize(dir.path(), "idle", 100, 30).unwrap();
        assert_eq!(serve_one(&mut channel, &console), 1);
        assert_eq!(channel.pending_clients(), 1);

        // The message arrives in pieces
        idle.write_all(b"120 ").unwrap();
        assert_eq!(channel.service(&console), 0);
        idle.write_all(b"40").unwrap();
        drop(idle);
        assert_eq!(channel.service(&console), 1);
        assert_eq!(console.size(), WindowSize::new(120, 40));
        assert!(!channel.has_clients());
        assert_eq!(channel.deadline(), None);
    }

    #[test]
    fn test_full_message_completes_without_eof() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(Ledger::default());
        let console = console(&ledger);
        let mut channel = ControlChannel::bind(dir.path(), "long").unwrap();

        let mut stream = UnixStream::connect(channel.path()).unwrap();
        let mut message = b"90 20".to_vec();
        message.resize(MAX_MESSAGE_LEN, 0);
        stream.write_all(&message).unwrap();

        assert_eq!(serve_one(&mut channel, &console), 1);
        assert!(!channel.has_clients());
        assert_eq!(console.size(), WindowSize::new(90, 20));
        drop(stream);
    }

    #[test]
    fn test_quiet_client_expires() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(Ledger::default());
        let console = console(&ledger);
        let mut channel = ControlChannel::bind(dir.path(), "quiet").unwrap();

        let _stream = UnixStream::connect(channel.path()).unwrap();
        serve_one(&mut channel, &console);
        assert_eq!(channel.pending_clients(), 1);

        std::thread::sleep(CLIENT_TIMEOUT + Duration::from_millis(50));
        assert_eq!(channel.service(&console), 0);
        assert_eq!(channel.pending_clients(), 0);
        assert_eq!(ledger.resize_calls(), 0);
    }
}
