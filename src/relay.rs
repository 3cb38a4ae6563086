//! Standalone relay loop
//!
//! Moves consumer input into a session until the child exits. The loop
//! sleeps in `poll` on the input descriptor and the session's exit pipe,
//! waking early only when queued input is due to be flushed.

use std::io::{self, Read};
use std::os::fd::AsFd;
use std::time::Instant;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use crate::error::SessionError;
use crate::pty::poll_timeout;
use crate::session::SessionHandle;

/// Bytes read from the consumer per wakeup
const INPUT_CHUNK: usize = 4096;

/// Why the relay returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The child's output stream ended
    ChildExited,
    /// The child stopped accepting input
    InputClosed,
}

/// Relay `input` into `session` until the child goes away
///
/// End of input flushes what is queued and keeps waiting for the child.
pub fn run<R: Read + AsFd>(
    session: &mut SessionHandle,
    input: &mut R,
) -> Result<RelayExit, SessionError> {
    let mut buf = [0u8; INPUT_CHUNK];
    let mut input_open = true;

    loop {
        let timeout = poll_timeout(session.input_deadline(), Instant::now());
        let (input_ready, exited) = {
            let mut fds = vec![PollFd::new(session.exit_fd(), PollFlags::POLLIN)];
            if input_open {
                fds.push(PollFd::new(input.as_fd(), PollFlags::POLLIN));
            }
            match poll(&mut fds, timeout) {
                Ok(_) => {},
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e).into()),
            }
            (fds.get(1).is_some_and(is_ready), is_ready(&fds[0]))
        };

        if input_ready {
            match input.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!("relay input closed");
                    input_open = false;
                    if let Some(exit) = closed(session.flush_input())? {
                        return Ok(exit);
                    }
                },
                Ok(n) => {
                    if let Some(exit) = closed(session.queue_input(&buf[..n]).map(|()| n))? {
                        return Ok(exit);
                    }
                },
                Err(e) if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) => {},
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(exit) = closed(session.poll_input_timer(Instant::now()))? {
            return Ok(exit);
        }

        if exited {
            // Best effort: the child may already be gone
            let _ = session.flush_input();
            tracing::debug!("relay saw child exit");
            return Ok(RelayExit::ChildExited);
        }
    }
}

/// Turn "the child stopped reading" into a relay exit
fn closed(result: Result<usize, SessionError>) -> Result<Option<RelayExit>, SessionError> {
    match result {
        Ok(_) => Ok(None),
        Err(SessionError::InputClosed | SessionError::NotRunning) => {
            Ok(Some(RelayExit::InputClosed))
        },
        Err(e) => Err(e),
    }
}

fn is_ready(fd: &PollFd<'_>) -> bool {
    fd.revents()
        .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
}
